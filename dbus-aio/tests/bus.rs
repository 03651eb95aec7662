//! End-to-end scenarios against a scripted bus on a socketpair.

mod support;

use dbus_aio::strings::{BusName, InterfaceName, MemberName, ObjectPath, StringLike, WellKnownName};
use dbus_aio::{Connection, Error, Message, RequestNameReply, UnixFd};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use support::MockBus;

fn test_call(member: &str) -> Message {
    Message::method_call(
        BusName::new("biz.brightsign").unwrap(),
        ObjectPath::new("/").unwrap(),
        InterfaceName::new("biz.brightsign.test").unwrap(),
        MemberName::new(member).unwrap(),
    )
}

#[tokio::test]
async fn echo_round_trip() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    let served = tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        let call = bus.next_message().await.unwrap();
        assert_eq!(call.full_name(), "biz.brightsign.test.concat");
        assert_eq!(call.path().map(|p| &**p), Some("/"));
        assert_eq!(call.destination().map(|d| &**d), Some("biz.brightsign"));
        let joined = call
            .args()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect::<Vec<_>>()
            .join(" ");
        let reply = call
            .method_return()
            .unwrap()
            .with_destination(support::client_name())
            .with_arg(joined);
        bus.send(reply).await;
    });

    let conn = Connection::with_stream(client).await.unwrap();
    assert_eq!(conn.unique_name().unwrap().to_string(), support::CLIENT_NAME);
    assert_eq!(conn.server_guid(), support::GUID);
    assert!(conn.unix_fd_negotiated());

    let mut msg = test_call("concat");
    msg.append("one");
    msg.append("two");
    let reply = conn.send_method_call(msg).await.unwrap().unwrap();
    assert_eq!(reply.arg(0).unwrap().as_str().unwrap(), "one two");

    let stats = conn.stats();
    assert_eq!(stats.count_send_methodcalls, 2); // Hello + concat
    assert_eq!(stats.count_recv_methodreturns, 2);
    assert!(stats.bytes_send > 0 && stats.bytes_recv > 0);

    served.await.unwrap();
}

#[tokio::test]
async fn error_reply_reaches_the_caller() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        let call = bus.next_message().await.unwrap();
        assert_eq!(call.args().len(), 1);
        let err = call
            .error(
                dbus_aio::strings::ErrorName::new("biz.brightsign.Error.InvalidParameters").unwrap(),
                "This needs 2 params.",
            )
            .unwrap()
            .with_destination(support::client_name());
        bus.send(err).await;
    });

    let conn = Connection::with_stream(client).await.unwrap();
    let mut msg = test_call("concat");
    msg.append("only-one");
    let err = conn.send_method_call(msg).await.unwrap_err();
    assert_eq!(err.name(), Some("biz.brightsign.Error.InvalidParameters"));
    assert_eq!(err.message(), Some("This needs 2 params."));
}

#[tokio::test]
async fn fd_passing_both_directions() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    let served = tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        // Client-to-server: the attached descriptor resolves to the
        // file the client opened.
        let call = bus.next_message().await.unwrap();
        let fd = call.arg(0).unwrap().as_unix_fd().unwrap();
        let target = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())).unwrap();
        assert_eq!(target, std::path::PathBuf::from("/etc/passwd"));
        // Server-to-client: reply to OpenFile with a descriptor.
        let reply = call
            .method_return()
            .unwrap()
            .with_destination(support::client_name())
            .with_arg(UnixFd::from(std::fs::File::open("/etc/passwd").unwrap()));
        bus.send(reply).await;
    });

    let conn = Connection::with_stream(client).await.unwrap();
    let file = std::fs::File::open("/etc/passwd").unwrap();
    let mut msg = test_call("OpenFile");
    msg.append(UnixFd::from(file.try_clone().unwrap()));
    let reply = conn.send_method_call(msg).await.unwrap().unwrap();

    let fd = reply.arg(0).unwrap().as_unix_fd().unwrap();
    let target = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())).unwrap();
    assert_eq!(target, std::path::PathBuf::from("/etc/passwd"));

    // The original descriptor was duplicated for the send, not stolen.
    use std::io::Read;
    let mut first = [0u8; 1];
    (&file).read_exact(&mut first).unwrap();

    served.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pummel_ten_clients_hundred_calls() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    let served = tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        bus.serve_echo(1000).await;
    });

    let conn = Arc::new(Connection::with_stream(client).await.unwrap());
    let mut tasks = vec![];
    for t in 0..10 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..100 {
                let payload = format!("{}-{}", t, i);
                let mut msg = test_call("concat");
                msg.append(payload.as_str());
                let reply = conn.send_method_call(msg).await.unwrap().unwrap();
                assert_eq!(reply.arg(0).unwrap().as_str().unwrap(), payload);
            }
        }));
    }

    let all = async {
        for task in tasks {
            task.await.unwrap();
        }
        served.await.unwrap();
    };
    tokio::time::timeout(Duration::from_secs(45), all).await.expect("pummel timed out");

    let stats = conn.stats();
    assert_eq!(stats.count_send_methodcalls, 1001);
    assert_eq!(stats.count_recv_methodreturns, 1001);
}

#[tokio::test]
async fn name_acquired_signal_fires_once() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        let call = bus.next_message().await.unwrap();
        assert_eq!(call.member().map(|m| &**m), Some("RequestName"));
        assert_eq!(call.arg(0).unwrap().as_str().unwrap(), "test.steev");
        let signal = Message::signal(
            ObjectPath::new("/org/freedesktop/DBus").unwrap(),
            InterfaceName::new("org.freedesktop.DBus").unwrap(),
            MemberName::new("NameAcquired").unwrap(),
        )
        .with_destination(support::client_name())
        .with_arg("test.steev");
        bus.send(signal).await;
        let reply = call
            .method_return()
            .unwrap()
            .with_destination(support::client_name())
            .with_arg(1u32);
        bus.send(reply).await;
    });

    let conn = Connection::with_stream(client).await.unwrap();
    let acquired = conn.receive_signal("org.freedesktop.DBus.NameAcquired").unwrap();
    let reply = conn
        .request_name(WellKnownName::new("test.steev").unwrap(), 0)
        .await
        .unwrap();
    assert_eq!(reply, RequestNameReply::PrimaryOwner);

    let signal = acquired.await.unwrap();
    assert_eq!(signal.arg(0).unwrap().as_str().unwrap(), "test.steev");
}

#[tokio::test]
async fn disconnect_drains_in_flight_calls() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        // Swallow everything without replying.
        while bus.next_message().await.is_some() {}
    });

    let conn = Arc::new(Connection::with_stream(client).await.unwrap());
    let mut tasks = vec![];
    for _ in 0..20 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let mut msg = test_call("sink");
            msg.append("payload");
            conn.send_method_call(msg).await
        }));
    }
    // Let every call get registered and written before pulling the plug.
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.disconnect();
    assert!(!conn.connected());

    let mut drained = 0;
    for task in tasks {
        match task.await.unwrap() {
            Err(Error::Disconnected) => drained += 1,
            other => panic!("expected Disconnected, got {:?}", other.map(|_| "reply")),
        }
    }
    assert_eq!(drained, 20);
}

#[tokio::test]
async fn method_call_dispatch_falls_back_by_name() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        // The client signals readiness before the calls flow its way.
        let go = bus.next_message().await.unwrap();
        assert!(!go.is_reply_expected());
        for member in ["Exact", "Other", "Stray"] {
            let iface = if member == "Stray" { "x.unrelated" } else { "a.b.c" };
            let call = Message::method_call(
                support::client_name(),
                ObjectPath::new("/").unwrap(),
                InterfaceName::new(iface).unwrap(),
                MemberName::new(member).unwrap(),
            );
            bus.send(call).await;
        }
    });

    let conn = Connection::with_stream(client).await.unwrap();
    // Lookup tries exact "iface.member", then "iface", then "".
    let exact = conn.receive_method_call("a.b.c.Exact").unwrap();
    let iface = conn.receive_method_call("a.b.c").unwrap();
    let catch_all = conn.receive_method_call("").unwrap();
    let go = test_call("Go").with_flags(dbus_aio::message::flags::NO_REPLY_EXPECTED);
    assert!(conn.send_method_call(go).await.unwrap().is_none());

    assert_eq!(exact.await.unwrap().member().map(|m| &**m), Some("Exact"));
    assert_eq!(iface.await.unwrap().member().map(|m| &**m), Some("Other"));
    assert_eq!(catch_all.await.unwrap().member().map(|m| &**m), Some("Stray"));
}

#[tokio::test]
async fn signal_handlers_are_one_shot_and_cancellable() {
    let (client, server) = UnixStream::pair().unwrap();
    let bus = MockBus::new(server);
    tokio::spawn(async move {
        bus.serve_auth().await;
        bus.serve_hello().await;
        while bus.next_message().await.is_some() {}
    });

    let conn = Connection::with_stream(client).await.unwrap();

    // A second registration under the same key is refused.
    let pending = conn.receive_signal("a.b.Sig").unwrap();
    assert!(matches!(conn.receive_signal("a.b.Sig"), Err(Error::HandlerExists(_))));

    // Cancelling removes the handler without firing it...
    assert!(conn.cancel_receive_signal("a.b.Sig"));
    assert!(!conn.cancel_receive_signal("a.b.Sig"));
    // ...which resolves the registration with Disconnected.
    assert!(matches!(pending.await, Err(Error::Disconnected)));

    conn.disconnect();
}
