use dbus_aio::{Connection, MatchRule};

// This program implements a reduced equivalent of the "dbus-monitor" tool
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), dbus_aio::Error> {
    // First open up a connection to the session bus.
    let conn = Connection::session().await?;

    // Second, become a monitor. With no rules every message on the bus
    // is delivered to us.
    conn.become_monitor(&[MatchRule::new()]).await?;

    // Loop and print out all messages received as they come.
    // Some can be quite large, e.g. if they contain embedded images..
    loop {
        let msg = conn.receive_signal("")?.await?;
        println!("{:?}", msg);
    }
}
