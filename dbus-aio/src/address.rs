//! Discovery and parsing of bus addresses.

use crate::error::Error;

fn env_key(key: &str) -> Option<String> {
    for (akey, value) in std::env::vars_os() {
        if akey == key {
            if let Ok(v) = value.into_string() {
                return Some(v);
            }
        }
    }
    None
}

/// The session bus address from `DBUS_SESSION_BUS_ADDRESS`.
pub fn read_session_address() -> Result<String, Error> {
    env_key("DBUS_SESSION_BUS_ADDRESS")
        .ok_or_else(|| Error::InvalidAddress("DBUS_SESSION_BUS_ADDRESS is not set".into()))
    // TODO: according to the D-Bus spec, there are more ways to find the address, such
    // as asking the X window system.
}

/// The system bus address from `DBUS_SYSTEM_BUS_ADDRESS`, falling
/// back to the well-known socket path.
pub fn read_system_address() -> Result<String, Error> {
    Ok(env_key("DBUS_SYSTEM_BUS_ADDRESS")
        .unwrap_or_else(|| "unix:path=/var/run/dbus/system_bus_socket".into()))
}

fn make_sockaddr_un(start: usize, s: &str) -> Result<(libc::sockaddr_un, libc::socklen_t), Error> {
    let bytes = s.as_bytes();
    let mut addr = libc::sockaddr_un {
        sun_family: libc::AF_UNIX as libc::sa_family_t,
        sun_path: [0; 108],
    };
    if start + bytes.len() + 1 >= addr.sun_path.len() {
        return Err(Error::InvalidAddress(format!("address too long: {}", s)));
    }
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i + start] = b as libc::c_char;
    }
    let base = std::mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
    // Abstract addresses are length-delimited (the name starts after a
    // nul at sun_path[0]); filesystem paths carry a trailing nul.
    let len = base + start + bytes.len() + if start == 0 { 1 } else { 0 };
    Ok((addr, len as libc::socklen_t))
}

/// Parses a `unix:path=` / `unix:abstract=` address into a socket
/// address ready for connect.
pub fn to_sockaddr(s: &str) -> Result<(libc::sockaddr_un, libc::socklen_t), Error> {
    if let Some(rest) = s.strip_prefix("unix:") {
        for pair in rest.split(',') {
            let mut kv = pair.splitn(2, '=');
            if let (Some(key), Some(value)) = (kv.next(), kv.next()) {
                if key == "path" {
                    return make_sockaddr_un(0, value);
                }
                if key == "abstract" {
                    return make_sockaddr_un(1, value);
                }
            }
        }
    }
    Err(Error::InvalidAddress(format!("unsupported address type: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_addresses() {
        let (addr, len) = to_sockaddr("unix:path=/tmp/test_bus").unwrap();
        assert_eq!(addr.sun_path[0] as u8, b'/');
        let base = std::mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
        assert_eq!(len as usize, base + "/tmp/test_bus".len() + 1);
    }

    #[test]
    fn abstract_addresses() {
        let (addr, len) = to_sockaddr("unix:abstract=test_bus,guid=0").unwrap();
        assert_eq!(addr.sun_path[0], 0);
        assert_eq!(addr.sun_path[1] as u8, b't');
        let base = std::mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
        assert_eq!(len as usize, base + 1 + "test_bus".len());
    }

    #[test]
    fn unsupported_addresses() {
        assert!(to_sockaddr("tcp:host=localhost,port=1234").is_err());
        assert!(to_sockaddr("unix:guid=0").is_err());
    }

    #[test]
    fn system_default() {
        // The fallback applies only when the variable is absent; this
        // must at least parse.
        let addr = read_system_address().unwrap();
        assert!(addr.starts_with("unix:"));
    }
}
