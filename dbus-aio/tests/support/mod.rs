//! A scripted bus speaking the server side of the protocol over one
//! half of a socketpair, built from the crate's own codec.

use dbus_aio::message::{self, Message};
use dbus_aio::strings::{BusName, StringLike};
use dbus_aio::Transport;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

pub const CLIENT_NAME: &str = ":1.42";
pub const GUID: &str = "77cd8ef7b71dd4023094848c631da242";

pub fn client_name() -> &'static BusName {
    BusName::new_unchecked(CLIENT_NAME)
}

pub struct MockBus {
    transport: Transport,
    serial: AtomicU32,
}

impl MockBus {
    pub fn new(stream: std::os::unix::net::UnixStream) -> MockBus {
        MockBus {
            transport: Transport::from_std(stream).unwrap(),
            serial: AtomicU32::new(1),
        }
    }

    fn next_serial(&self) -> NonZeroU32 {
        NonZeroU32::new(self.serial.fetch_add(1, Ordering::Relaxed)).unwrap()
    }

    /// Speaks the server half of the EXTERNAL handshake.
    pub async fn serve_auth(&self) {
        let mut nul = [0u8; 1];
        assert_ne!(
            self.transport.read_exact(&mut nul, &mut Vec::new()).await.unwrap(),
            0,
            "client closed before the credentials byte"
        );
        assert_eq!(nul[0], 0);
        loop {
            let line = self.transport.auth_exchange(&[], true).await.unwrap();
            let line = String::from_utf8(line).unwrap();
            if line.starts_with("AUTH EXTERNAL") {
                let ok = format!("OK {}\r\n", GUID);
                self.transport.write_all(ok.as_bytes(), vec![]).await.unwrap();
            } else if line.starts_with("NEGOTIATE_UNIX_FD") {
                self.transport.write_all(b"AGREE_UNIX_FD\r\n", vec![]).await.unwrap();
            } else if line.starts_with("BEGIN") {
                return;
            } else {
                self.transport.write_all(b"REJECTED EXTERNAL\r\n", vec![]).await.unwrap();
            }
        }
    }

    /// Frames and decodes the next inbound message; None once the
    /// client hung up.
    pub async fn next_message(&self) -> Option<Message> {
        let mut header = [0u8; 16];
        loop {
            match self.transport.peek(&mut header).await.unwrap() {
                0 => return None,
                n if n >= 16 => break,
                _ => tokio::task::yield_now().await,
            }
        }
        let total = message::total_message_size(&header).unwrap();
        let mut buf = vec![0u8; total];
        let mut fds = Vec::new();
        if self.transport.read_exact(&mut buf, &mut fds).await.unwrap() == 0 {
            return None;
        }
        Message::parse(&buf, fds).unwrap()
    }

    pub async fn send(&self, msg: Message) {
        let packet = msg.marshall(self.next_serial()).unwrap();
        self.transport.write_all(&packet.data, packet.fds).await.unwrap();
    }

    /// Answers the Hello that every fresh connection sends.
    pub async fn serve_hello(&self) {
        let call = self.next_message().await.expect("expected Hello");
        assert_eq!(call.member().map(|m| &**m), Some("Hello"));
        let reply = call
            .method_return()
            .unwrap()
            .with_destination(client_name())
            .with_arg(CLIENT_NAME);
        self.send(reply).await;
    }

    /// Serves `count` echo calls: replies with all string parameters
    /// joined by spaces.
    pub async fn serve_echo(&self, count: usize) {
        for _ in 0..count {
            let call = self.next_message().await.expect("expected echo call");
            let joined = call
                .args()
                .iter()
                .map(|v| v.as_str().unwrap())
                .collect::<Vec<_>>()
                .join(" ");
            let reply = call
                .method_return()
                .unwrap()
                .with_destination(client_name())
                .with_arg(joined);
            self.send(reply).await;
        }
    }
}
