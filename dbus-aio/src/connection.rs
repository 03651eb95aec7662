//! The connection façade: connect, authenticate, start the
//! multiplexer, say Hello, and talk to the bus.

use crate::address;
use crate::authentication;
use crate::error::Error;
use crate::matchrule::MatchRule;
use crate::message::Message;
use crate::multiplexer::{Counters, Multiplexer, Statistics};
use crate::transport::Transport;
use crate::types::{Array, Value};
use dbus_aio_strings::{
    BusName, InterfaceName, MemberName, ObjectPath, StringLike, UniqueName, UniqueNameBuf,
    WellKnownName,
};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn bus_name() -> &'static BusName {
    BusName::new_unchecked("org.freedesktop.DBus")
}

fn bus_object() -> &'static ObjectPath {
    ObjectPath::new_unchecked("/org/freedesktop/DBus")
}

fn bus_interface() -> &'static InterfaceName {
    InterfaceName::new_unchecked("org.freedesktop.DBus")
}

fn properties_interface() -> &'static InterfaceName {
    InterfaceName::new_unchecked("org.freedesktop.DBus.Properties")
}

/// Flags for [`Connection::request_name`].
pub mod request_name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 1;
    pub const REPLACE_EXISTING: u32 = 2;
    pub const DO_NOT_QUEUE: u32 = 4;
}

/// Outcome of a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

/// Outcome of a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

/// A client connection to a message bus (or a direct peer).
///
/// One connection is driven by exactly one spawned read task; share
/// it behind an `Arc` to issue concurrent calls, which are correlated
/// by serial.
pub struct Connection {
    mux: Arc<Multiplexer>,
    serial: AtomicU32,
    unique_name: Mutex<Option<UniqueNameBuf>>,
    server_guid: String,
    unix_fd_negotiated: bool,
}

impl Connection {
    /// Connects to the session bus.
    pub async fn session() -> Result<Connection, Error> {
        Connection::address(&address::read_session_address()?).await
    }

    /// Connects to the system bus.
    pub async fn system() -> Result<Connection, Error> {
        Connection::address(&address::read_system_address()?).await
    }

    /// Connects to the bus at an explicit address.
    pub async fn address(addr: &str) -> Result<Connection, Error> {
        Connection::with_transport(Transport::connect(addr)?).await
    }

    /// Runs the full protocol over an already-connected stream, e g
    /// one half of a socketpair.
    pub async fn with_stream(stream: std::os::unix::net::UnixStream) -> Result<Connection, Error> {
        Connection::with_transport(Transport::from_std(stream)?).await
    }

    async fn with_transport(transport: Transport) -> Result<Connection, Error> {
        let counters = Counters::default();
        let (server_guid, unix_fd_negotiated) =
            authentication::authenticate(&transport, &counters).await?;
        let mux = Multiplexer::start(transport, counters);
        let conn = Connection {
            mux,
            serial: AtomicU32::new(1),
            unique_name: Mutex::new(None),
            server_guid,
            unix_fd_negotiated,
        };
        match conn.hello().await {
            Ok(name) => {
                *conn.unique_name.lock().unwrap() = Some(name);
                Ok(conn)
            }
            Err(e) => {
                conn.disconnect();
                Err(e)
            }
        }
    }

    /// Serial 0 is reserved by the protocol; the counter skips it on
    /// wrap-around.
    fn next_serial(&self) -> NonZeroU32 {
        loop {
            if let Some(s) = NonZeroU32::new(self.serial.fetch_add(1, Ordering::Relaxed)) {
                return s;
            }
        }
    }

    /// Stops the read loop and fires every pending handler exactly
    /// once with an empty outcome. The serial counter restarts at 1.
    pub fn disconnect(&self) {
        self.serial.store(1, Ordering::SeqCst);
        *self.unique_name.lock().unwrap() = None;
        self.mux.stop();
    }

    pub fn connected(&self) -> bool {
        self.mux.connected()
    }

    /// The bus-assigned unique name, e g ":1.54".
    pub fn unique_name(&self) -> Option<UniqueNameBuf> {
        self.unique_name.lock().unwrap().clone()
    }

    /// The server guid recorded during authentication.
    pub fn server_guid(&self) -> &str {
        &self.server_guid
    }

    /// Whether the server agreed to carry unix fds.
    pub fn unix_fd_negotiated(&self) -> bool {
        self.unix_fd_negotiated
    }

    pub fn stats(&self) -> Statistics {
        self.mux.stats()
    }

    /// Sends a method call. Resolves with `Some(reply)`, with the
    /// remote error, or with `None` right after the write when
    /// `NO_REPLY_EXPECTED` is set.
    pub async fn send_method_call(&self, msg: Message) -> Result<Option<Message>, Error> {
        self.mux.send_method_call(self.next_serial(), msg).await
    }

    pub async fn send_method_return(&self, msg: Message) -> Result<(), Error> {
        self.mux.send_method_return(self.next_serial(), msg).await
    }

    pub async fn send_signal(&self, msg: Message) -> Result<(), Error> {
        self.mux.send_signal(self.next_serial(), msg).await
    }

    pub async fn send_error(&self, msg: Message) -> Result<(), Error> {
        self.mux.send_error(self.next_serial(), msg).await
    }

    /// Registers a one-shot handler for an inbound method call and
    /// returns the future that resolves when it arrives. Keys are
    /// "interface.member", a bare interface, or "" to catch all.
    /// Registration happens here, before the future is polled.
    pub fn receive_method_call(
        &self,
        name: &str,
    ) -> Result<impl Future<Output = Result<Message, Error>>, Error> {
        let rx = self.mux.register_method_call(name)?;
        Ok(async move { rx.await.map_err(|_| Error::Disconnected) })
    }

    /// As [`Connection::receive_method_call`], for signals.
    pub fn receive_signal(
        &self,
        name: &str,
    ) -> Result<impl Future<Output = Result<Message, Error>>, Error> {
        let rx = self.mux.register_signal(name)?;
        Ok(async move { rx.await.map_err(|_| Error::Disconnected) })
    }

    /// Removes a registered signal handler without firing it.
    pub fn cancel_receive_signal(&self, name: &str) -> bool {
        self.mux.cancel_signal(name)
    }

    /// Registers the sink that observes unmatched error messages and
    /// connection failures.
    pub fn receive_error(&self) -> Result<impl Future<Output = Error>, Error> {
        let rx = self.mux.register_error_sink()?;
        Ok(async move { rx.await.unwrap_or(Error::Disconnected) })
    }

    //
    // Methods for the standard message bus interfaces
    //

    async fn call_bus(&self, member: &str, args: Vec<Value>) -> Result<Message, Error> {
        let mut msg =
            Message::method_call(bus_name(), bus_object(), bus_interface(), MemberName::new(member)?);
        for a in args {
            msg.append(a);
        }
        self.send_method_call(msg)
            .await?
            .ok_or_else(|| Error::Protocol("bus call completed without a reply".into()))
    }

    async fn hello(&self) -> Result<UniqueNameBuf, Error> {
        let reply = self.call_bus("Hello", vec![]).await?;
        Ok(UniqueName::new_owned(arg0_str(&reply)?)?)
    }

    /// Asks the bus for a well-known name; see `request_name_flags`.
    pub async fn request_name(
        &self,
        name: &WellKnownName,
        flags: u32,
    ) -> Result<RequestNameReply, Error> {
        let reply =
            self.call_bus("RequestName", vec![name.as_ref().into(), Value::Uint32(flags)]).await?;
        match arg0_u32(&reply)? {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            other => Err(Error::Protocol(format!("unknown RequestName reply {}", other))),
        }
    }

    pub async fn release_name(&self, name: &WellKnownName) -> Result<ReleaseNameReply, Error> {
        let reply = self.call_bus("ReleaseName", vec![name.as_ref().into()]).await?;
        match arg0_u32(&reply)? {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            other => Err(Error::Protocol(format!("unknown ReleaseName reply {}", other))),
        }
    }

    pub async fn list_queued_owners(&self, name: &WellKnownName) -> Result<Vec<String>, Error> {
        let reply = self.call_bus("ListQueuedOwners", vec![name.as_ref().into()]).await?;
        arg0_string_array(&reply)
    }

    pub async fn list_names(&self) -> Result<Vec<String>, Error> {
        let reply = self.call_bus("ListNames", vec![]).await?;
        arg0_string_array(&reply)
    }

    pub async fn list_activatable_names(&self) -> Result<Vec<String>, Error> {
        let reply = self.call_bus("ListActivatableNames", vec![]).await?;
        arg0_string_array(&reply)
    }

    pub async fn name_has_owner(&self, name: &WellKnownName) -> Result<bool, Error> {
        let reply = self.call_bus("NameHasOwner", vec![name.as_ref().into()]).await?;
        Ok(reply.arg(0).ok_or_else(missing_arg)?.as_boolean()?)
    }

    pub async fn get_name_owner(&self, name: &WellKnownName) -> Result<UniqueNameBuf, Error> {
        let reply = self.call_bus("GetNameOwner", vec![name.as_ref().into()]).await?;
        Ok(UniqueName::new_owned(arg0_str(&reply)?)?)
    }

    pub async fn get_connection_unix_user(&self, name: &BusName) -> Result<u32, Error> {
        let reply = self.call_bus("GetConnectionUnixUser", vec![name.as_ref().into()]).await?;
        arg0_u32(&reply)
    }

    pub async fn get_connection_unix_process_id(&self, name: &BusName) -> Result<u32, Error> {
        let reply = self.call_bus("GetConnectionUnixProcessID", vec![name.as_ref().into()]).await?;
        arg0_u32(&reply)
    }

    /// Subscribes this connection to the broadcasts selected by the
    /// rule.
    pub async fn add_match(&self, rule: &MatchRule) -> Result<(), Error> {
        self.call_bus("AddMatch", vec![rule.match_str().into()]).await?;
        Ok(())
    }

    pub async fn remove_match(&self, rule: &MatchRule) -> Result<(), Error> {
        self.call_bus("RemoveMatch", vec![rule.match_str().into()]).await?;
        Ok(())
    }

    pub async fn get_id(&self) -> Result<String, Error> {
        let reply = self.call_bus("GetId", vec![]).await?;
        arg0_str(&reply)
    }

    /// Turns the connection into a monitor observing the messages
    /// selected by `rules` (every message when empty).
    pub async fn become_monitor(&self, rules: &[MatchRule]) -> Result<(), Error> {
        let mut array = Array::new("s")?;
        for rule in rules {
            array.push(rule.match_str().into())?;
        }
        self.call_bus("BecomeMonitor", vec![array.into(), Value::Uint32(0)]).await?;
        Ok(())
    }

    //
    // org.freedesktop.DBus.Properties helpers
    //

    /// `Get`: the property value, unwrapped from its variant.
    pub async fn get_property(
        &self,
        destination: &BusName,
        path: &ObjectPath,
        interface: &InterfaceName,
        property: &MemberName,
    ) -> Result<Value, Error> {
        let mut msg = Message::method_call(
            destination,
            path,
            properties_interface(),
            MemberName::new_unchecked("Get"),
        );
        msg.append(interface.as_ref());
        msg.append(property.as_ref());
        let reply = self
            .send_method_call(msg)
            .await?
            .ok_or_else(|| Error::Protocol("Get completed without a reply".into()))?;
        let mut args = reply.into_args();
        if args.is_empty() {
            return Err(missing_arg());
        }
        Ok(match args.remove(0) {
            Value::Variant(inner) => *inner,
            other => other,
        })
    }

    /// `GetAll`: every property of the interface. The reply body must
    /// be `a{sv}`.
    pub async fn get_all_properties(
        &self,
        destination: &BusName,
        path: &ObjectPath,
        interface: &InterfaceName,
    ) -> Result<HashMap<String, Value>, Error> {
        let mut msg = Message::method_call(
            destination,
            path,
            properties_interface(),
            MemberName::new_unchecked("GetAll"),
        );
        msg.append(interface.as_ref());
        let reply = self
            .send_method_call(msg)
            .await?
            .ok_or_else(|| Error::Protocol("GetAll completed without a reply".into()))?;
        if &**reply.signature() != "a{sv}" {
            return Err(Error::Protocol(format!(
                "GetAll reply has signature {:?}, expected a{{sv}}",
                &**reply.signature()
            )));
        }
        let mut properties = HashMap::new();
        for arg in reply.into_args() {
            if let Value::Array(entries) = arg {
                for entry in entries.into_elements() {
                    if let Value::DictEntry(entry) = entry {
                        let (key, value) = entry.into_parts();
                        let key = key.as_str()?.to_string();
                        let value = match value {
                            Value::Variant(inner) => *inner,
                            other => other,
                        };
                        properties.insert(key, value);
                    }
                }
            }
        }
        Ok(properties)
    }

    /// `Set`: writes one property.
    pub async fn set_property(
        &self,
        destination: &BusName,
        path: &ObjectPath,
        interface: &InterfaceName,
        property: &MemberName,
        value: Value,
    ) -> Result<(), Error> {
        let mut msg = Message::method_call(
            destination,
            path,
            properties_interface(),
            MemberName::new_unchecked("Set"),
        );
        msg.append(interface.as_ref());
        msg.append(property.as_ref());
        msg.append(Value::Variant(Box::new(value)));
        self.send_method_call(msg)
            .await?
            .ok_or_else(|| Error::Protocol("Set completed without a reply".into()))?;
        Ok(())
    }
}

fn missing_arg() -> Error {
    Error::Protocol("reply is missing a parameter".into())
}

fn arg0_str(reply: &Message) -> Result<String, Error> {
    Ok(reply.arg(0).ok_or_else(missing_arg)?.as_str()?.to_string())
}

fn arg0_u32(reply: &Message) -> Result<u32, Error> {
    Ok(reply.arg(0).ok_or_else(missing_arg)?.as_u32()?)
}

fn arg0_string_array(reply: &Message) -> Result<Vec<String>, Error> {
    let array = reply.arg(0).ok_or_else(missing_arg)?.as_array()?;
    let mut names = Vec::with_capacity(array.len());
    for v in array.iter() {
        names.push(v.as_str()?.to_string());
    }
    Ok(names)
}
