use dbus_aio::strings::{ErrorName, StringLike, WellKnownName};
use dbus_aio::{request_name_flags, Connection, RequestNameReply};

// A tiny service: owns a well-known name and echoes the parameters of
// Echo calls back at the caller.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), dbus_aio::Error> {
    let conn = Connection::session().await?;

    let name = WellKnownName::new("com.example.dbusaio.Demo")?;
    let reply = conn.request_name(name, request_name_flags::DO_NOT_QUEUE).await?;
    if reply != RequestNameReply::PrimaryOwner {
        eprintln!("name is taken: {:?}", reply);
        return Ok(());
    }

    loop {
        let call = conn.receive_method_call("com.example.dbusaio.Demo.Echo")?.await?;
        if !call.is_reply_expected() {
            continue;
        }
        if call.args().is_empty() {
            let err = call.error(
                ErrorName::new("com.example.dbusaio.Error.InvalidParameters")?,
                "Echo needs at least one parameter.",
            )?;
            conn.send_error(err).await?;
        } else {
            let mut reply = call.method_return()?;
            for arg in call.into_args() {
                reply.append(arg);
            }
            conn.send_method_return(reply).await?;
        }
    }
}
