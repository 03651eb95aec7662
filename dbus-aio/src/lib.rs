#![deny(unsafe_code)]

//! A native Rust client for the D-Bus IPC protocol over a local
//! stream socket, driven by [Tokio](http://tokio.rs).
//!
//! The crate implements the whole client side of the wire protocol:
//! the bit-exact type codec, message framing, the `EXTERNAL`
//! authentication handshake with unix-fd negotiation, and an
//! asynchronous multiplexer that correlates replies by serial and
//! routes inbound calls and signals to registered handlers. Open file
//! descriptors travel inline with messages via `SCM_RIGHTS`.
//!
//! The usual entry point is [`Connection`]:
//!
//! ```no_run
//! use dbus_aio::strings::StringLike;
//!
//! # async fn run() -> Result<(), dbus_aio::Error> {
//! let conn = dbus_aio::Connection::session().await?;
//! let msg = dbus_aio::Message::method_call(
//!     dbus_aio::strings::BusName::new("org.freedesktop.DBus")?,
//!     dbus_aio::strings::ObjectPath::new("/org/freedesktop/DBus")?,
//!     dbus_aio::strings::InterfaceName::new("org.freedesktop.DBus")?,
//!     dbus_aio::strings::MemberName::new("GetId")?,
//! );
//! let _reply = conn.send_method_call(msg).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;

pub mod authentication;

pub mod matchrule;

pub mod message;

pub mod transport;

pub mod types;

mod connection;

mod error;

mod multiplexer;

pub mod strings {
    //! Re-export of the dbus_aio_strings crate
    pub use dbus_aio_strings::*;
}

#[allow(unsafe_code)]
mod sys;

pub use crate::connection::{request_name_flags, Connection, ReleaseNameReply, RequestNameReply};
pub use crate::error::Error;
pub use crate::matchrule::MatchRule;
pub use crate::message::{Message, MessageType};
pub use crate::multiplexer::Statistics;
pub use crate::transport::Transport;
pub use crate::types::{Array, DictEntry, Struct, UnixFd, Value};
