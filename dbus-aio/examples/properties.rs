use dbus_aio::strings::{BusName, InterfaceName, ObjectPath, StringLike};

// Queries every property of the bus driver itself.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), dbus_aio::Error> {
    let conn = dbus_aio::Connection::session().await?;

    let props = conn
        .get_all_properties(
            BusName::new("org.freedesktop.DBus")?,
            ObjectPath::new("/org/freedesktop/DBus")?,
            InterfaceName::new("org.freedesktop.DBus")?,
        )
        .await?;

    for (name, value) in props {
        println!("{}: {:?}", name, value);
    }

    Ok(())
}
