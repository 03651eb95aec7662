//! The message multiplexer: owns the transport after authentication,
//! frames inbound messages with a peek-then-read loop, correlates
//! replies with outgoing calls by serial, and routes inbound calls and
//! signals to name-keyed one-shot handlers.

use crate::error::Error;
use crate::message::{self, Message, MessageType, FIXED_HEADER_SIZE};
use crate::transport::Transport;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// A snapshot of a connection's traffic counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub count_send_methodcalls: usize,
    pub count_send_methodreturns: usize,
    pub count_send_signals: usize,
    pub count_send_errors: usize,
    pub count_recv_methodcalls: usize,
    pub count_recv_methodreturns: usize,
    pub count_recv_signals: usize,
    pub count_recv_errors: usize,
    pub count_send_auth_commands: usize,
    pub count_recv_auth_commands: usize,
    pub bytes_send: usize,
    pub bytes_recv: usize,
    pub bytes_send_auth: usize,
    pub bytes_recv_auth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    send_methodcalls: AtomicUsize,
    send_methodreturns: AtomicUsize,
    send_signals: AtomicUsize,
    send_errors: AtomicUsize,
    recv_methodcalls: AtomicUsize,
    recv_methodreturns: AtomicUsize,
    recv_signals: AtomicUsize,
    recv_errors: AtomicUsize,
    send_auth_commands: AtomicUsize,
    recv_auth_commands: AtomicUsize,
    bytes_send: AtomicUsize,
    bytes_recv: AtomicUsize,
    bytes_send_auth: AtomicUsize,
    bytes_recv_auth: AtomicUsize,
}

impl Counters {
    pub(crate) fn auth_sent(&self, bytes: usize) {
        self.send_auth_commands.fetch_add(1, Ordering::Relaxed);
        self.bytes_send_auth.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn auth_received(&self, bytes: usize) {
        self.recv_auth_commands.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv_auth.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Statistics {
        Statistics {
            count_send_methodcalls: self.send_methodcalls.load(Ordering::Relaxed),
            count_send_methodreturns: self.send_methodreturns.load(Ordering::Relaxed),
            count_send_signals: self.send_signals.load(Ordering::Relaxed),
            count_send_errors: self.send_errors.load(Ordering::Relaxed),
            count_recv_methodcalls: self.recv_methodcalls.load(Ordering::Relaxed),
            count_recv_methodreturns: self.recv_methodreturns.load(Ordering::Relaxed),
            count_recv_signals: self.recv_signals.load(Ordering::Relaxed),
            count_recv_errors: self.recv_errors.load(Ordering::Relaxed),
            count_send_auth_commands: self.send_auth_commands.load(Ordering::Relaxed),
            count_recv_auth_commands: self.recv_auth_commands.load(Ordering::Relaxed),
            bytes_send: self.bytes_send.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_send_auth: self.bytes_send_auth.load(Ordering::Relaxed),
            bytes_recv_auth: self.bytes_recv_auth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Tables {
    method_return: HashMap<u32, oneshot::Sender<Result<Message, Error>>>,
    method_call: HashMap<String, oneshot::Sender<Message>>,
    signal: HashMap<String, oneshot::Sender<Message>>,
    error_sink: Option<oneshot::Sender<Error>>,
    closed: bool,
}

pub(crate) struct Multiplexer {
    transport: Transport,
    tables: Mutex<Tables>,
    write_lock: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl Multiplexer {
    /// Takes over the authenticated transport and spawns the read
    /// loop on the current runtime.
    pub fn start(transport: Transport, counters: Counters) -> Arc<Multiplexer> {
        let mux = Arc::new(Multiplexer {
            transport,
            tables: Mutex::new(Tables::default()),
            write_lock: tokio::sync::Mutex::new(()),
            counters,
        });
        tokio::spawn(mux.clone().read_loop());
        mux
    }

    pub fn stop(&self) {
        self.transport.disconnect();
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    pub fn stats(&self) -> Statistics {
        self.counters.snapshot()
    }

    async fn read_loop(self: Arc<Self>) {
        let mut scratch = vec![0u8; FIXED_HEADER_SIZE];
        loop {
            // Peek: learn the next frame's size from its first 16
            // bytes without consuming, so the fd-carrying read below
            // covers exactly one message.
            scratch.resize(FIXED_HEADER_SIZE, 0);
            let total = match self.transport.peek(&mut scratch).await {
                Ok(0) => return self.shutdown(None),
                Ok(n) if n < FIXED_HEADER_SIZE => {
                    return self
                        .shutdown(Some(Error::Protocol("short read peeking header".into())))
                }
                Ok(_) => match message::total_message_size(&scratch) {
                    Ok(total) => total,
                    Err(e) => return self.shutdown(Some(e)),
                },
                Err(e) => return self.shutdown(Some(e)),
            };

            // Receive: consume the whole frame plus its ancillary fds.
            scratch.resize(total, 0);
            let mut fds = Vec::new();
            match self.transport.read_exact(&mut scratch, &mut fds).await {
                Ok(0) => return self.shutdown(None),
                Ok(_) => {}
                Err(e) => return self.shutdown(Some(e)),
            }
            self.counters.bytes_recv.fetch_add(total, Ordering::Relaxed);

            match Message::parse(&scratch, fds) {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => tracing::warn!("ignoring message of unknown type"),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable inbound message");
                    return self.shutdown(Some(e));
                }
            }
            scratch.clear();
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.msg_type() {
            MessageType::MethodCall => {
                self.counters.recv_methodcalls.fetch_add(1, Ordering::Relaxed);
                self.invoke_method_call(msg);
            }
            MessageType::MethodReturn => {
                self.counters.recv_methodreturns.fetch_add(1, Ordering::Relaxed);
                self.invoke_method_return(msg);
            }
            MessageType::Signal => {
                self.counters.recv_signals.fetch_add(1, Ordering::Relaxed);
                self.invoke_signal(msg);
            }
            MessageType::Error => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                self.invoke_error(msg);
            }
        }
    }

    fn invoke_method_return(&self, msg: Message) {
        let serial = match msg.reply_serial() {
            Some(s) => s.get(),
            None => {
                tracing::warn!("method return without reply serial");
                return;
            }
        };
        let handler = self.tables.lock().unwrap().method_return.remove(&serial);
        match handler {
            // Removed before invocation; a oneshot cannot fire twice.
            Some(tx) => {
                let _ = tx.send(Ok(msg));
            }
            None => tracing::warn!(reply_serial = serial, "unexpected reply, dropping"),
        }
    }

    fn invoke_error(&self, msg: Message) {
        let reply_serial = msg.reply_serial();
        let error = Error::Remote {
            name: msg.error_name().map(|n| n.to_string()).unwrap_or_default(),
            message: msg.error_text().unwrap_or("").to_string(),
        };
        let mut tables = self.tables.lock().unwrap();
        if let Some(serial) = reply_serial {
            if let Some(tx) = tables.method_return.remove(&serial.get()) {
                drop(tables);
                let _ = tx.send(Err(error));
                return;
            }
        }
        let sink = tables.error_sink.take();
        drop(tables);
        match sink {
            Some(tx) => {
                let _ = tx.send(error);
            }
            None => tracing::warn!(error = %error, "unhandled error message"),
        }
    }

    fn invoke_method_call(&self, msg: Message) {
        let full_name = msg.full_name();
        let mut tables = self.tables.lock().unwrap();
        // Exact interface.member first, then any member of the
        // interface, then the catch-all.
        let handler = if let Some(tx) = tables.method_call.remove(&full_name) {
            Some(tx)
        } else {
            let interface = &full_name[..full_name.rfind('.').unwrap_or(0)];
            if let Some(tx) = tables.method_call.remove(interface) {
                Some(tx)
            } else {
                tables.method_call.remove("")
            }
        };
        drop(tables);
        match handler {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => tracing::debug!(name = %full_name, "unhandled method call"),
        }
    }

    fn invoke_signal(&self, msg: Message) {
        let full_name = msg.full_name();
        let mut tables = self.tables.lock().unwrap();
        let handler = if let Some(tx) = tables.signal.remove(&full_name) {
            Some(tx)
        } else {
            tables.signal.remove("")
        };
        drop(tables);
        match handler {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => tracing::debug!(name = %full_name, "unhandled signal"),
        }
    }

    /// Stops the connection and fires every pending handler exactly
    /// once. A socket error goes to the error sink; everything else
    /// resolves with `Disconnected`.
    fn shutdown(&self, error: Option<Error>) {
        self.transport.disconnect();
        let mut tables = self.tables.lock().unwrap();
        tables.closed = true;
        let replies = std::mem::take(&mut tables.method_return);
        let calls = std::mem::take(&mut tables.method_call);
        let signals = std::mem::take(&mut tables.signal);
        let sink = tables.error_sink.take();
        drop(tables);

        if let Some(e) = error {
            match sink {
                Some(tx) => {
                    let _ = tx.send(e);
                }
                None => tracing::warn!(error = %e, "connection failed"),
            }
        }
        for (_, tx) in replies {
            let _ = tx.send(Err(Error::Disconnected));
        }
        // Dropping the senders resolves call/signal registrations
        // with Disconnected on the receiving side.
        drop(calls);
        drop(signals);
    }

    async fn write_packet(&self, packet: crate::types::MessageOStream) -> Result<(), Error> {
        // The lock queue is fair, so submission order is wire order.
        let _guard = self.write_lock.lock().await;
        self.transport.write_all(&packet.data, packet.fds).await
    }

    /// Sends a method call. When a reply is expected the handler is
    /// registered before the write goes out, keyed by the serial;
    /// resolves with the reply, the remote error, or `Disconnected`.
    pub async fn send_method_call(
        &self,
        serial: NonZeroU32,
        msg: Message,
    ) -> Result<Option<Message>, Error> {
        let expect_reply = msg.is_reply_expected();
        let packet = msg.marshall(serial)?;
        self.counters.send_methodcalls.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_send.fetch_add(packet.data.len(), Ordering::Relaxed);

        if !expect_reply {
            self.write_packet(packet).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.closed {
                return Err(Error::Disconnected);
            }
            tables.method_return.insert(serial.get(), tx);
        }
        if let Err(e) = self.write_packet(packet).await {
            // Release the reply handler with the write error.
            self.tables.lock().unwrap().method_return.remove(&serial.get());
            return Err(e);
        }
        match rx.await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => Err(Error::Disconnected),
        }
    }

    pub async fn send_method_return(&self, serial: NonZeroU32, msg: Message) -> Result<(), Error> {
        let packet = msg.marshall(serial)?;
        self.counters.send_methodreturns.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_send.fetch_add(packet.data.len(), Ordering::Relaxed);
        self.write_packet(packet).await
    }

    pub async fn send_signal(&self, serial: NonZeroU32, msg: Message) -> Result<(), Error> {
        let packet = msg.marshall(serial)?;
        self.counters.send_signals.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_send.fetch_add(packet.data.len(), Ordering::Relaxed);
        self.write_packet(packet).await
    }

    pub async fn send_error(&self, serial: NonZeroU32, msg: Message) -> Result<(), Error> {
        let packet = msg.marshall(serial)?;
        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_send.fetch_add(packet.data.len(), Ordering::Relaxed);
        self.write_packet(packet).await
    }

    fn register<V>(
        map: impl FnOnce(&mut Tables) -> &mut HashMap<String, oneshot::Sender<V>>,
        tables: &Mutex<Tables>,
        name: &str,
    ) -> Result<oneshot::Receiver<V>, Error> {
        let mut t = tables.lock().unwrap();
        if t.closed {
            return Err(Error::Disconnected);
        }
        let map = map(&mut t);
        if map.contains_key(name) {
            return Err(Error::HandlerExists(name.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        map.insert(name.to_string(), tx);
        Ok(rx)
    }

    /// Registers a one-shot handler for an inbound method call, keyed
    /// by "interface.member", "interface" or "" (catch-all).
    pub fn register_method_call(&self, name: &str) -> Result<oneshot::Receiver<Message>, Error> {
        Multiplexer::register(|t| &mut t.method_call, &self.tables, name)
    }

    /// Registers a one-shot signal handler; same keying as calls,
    /// minus the interface-only fallback.
    pub fn register_signal(&self, name: &str) -> Result<oneshot::Receiver<Message>, Error> {
        Multiplexer::register(|t| &mut t.signal, &self.tables, name)
    }

    /// Removes a registered signal handler without firing it.
    pub fn cancel_signal(&self, name: &str) -> bool {
        self.tables.lock().unwrap().signal.remove(name).is_some()
    }

    /// Registers the single sink for unmatched error messages and
    /// connection failures.
    pub fn register_error_sink(&self) -> Result<oneshot::Receiver<Error>, Error> {
        let mut t = self.tables.lock().unwrap();
        if t.closed {
            return Err(Error::Disconnected);
        }
        if t.error_sink.is_some() {
            return Err(Error::HandlerExists("error sink".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        t.error_sink = Some(tx);
        Ok(rx)
    }
}
