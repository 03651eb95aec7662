#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), dbus_aio::Error> {
    // First open up a connection to the session bus.
    let conn = dbus_aio::Connection::session().await?;
    println!("connected as {}", conn.unique_name().unwrap());

    // The ListNames method call takes zero input parameters and one
    // output parameter which is an array of strings.
    let names = conn.list_names().await?;

    // Let's print all the names to stdout.
    for name in names {
        println!("{}", name);
    }

    Ok(())
}
