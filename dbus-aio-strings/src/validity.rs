//! Byte-level validators for the D-Bus string categories.
//!
//! Every function returns `Err(reason)` with a short static phrase
//! describing the first rule the input breaks.

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum NameKind {
    Bus,
    Unique,
    WellKnown,
    Error,
    Interface,
    Namespace,
    Member,
}

impl NameKind {
    fn allows_hyphen(self) -> bool {
        matches!(self, NameKind::Bus | NameKind::Unique | NameKind::WellKnown)
    }

    fn allows_period(self) -> bool {
        !matches!(self, NameKind::Member)
    }

    fn needs_period(self) -> bool {
        !matches!(self, NameKind::Member | NameKind::Namespace)
    }
}

pub(crate) const MAX_NAME_LEN: usize = 255;

/// Shared walk for all seven name categories.
///
/// Elements are `[A-Za-z0-9_]` (plus `-` for bus name flavours), must
/// not be empty, and must not start with a digit except inside a
/// unique connection name.
pub(crate) fn validate_name(s: &str, kind: NameKind) -> Result<(), &'static str> {
    let s = s.as_bytes();
    if s.is_empty() {
        return Err("is empty");
    }
    if s.len() > MAX_NAME_LEN {
        return Err("exceeds 255 characters");
    }

    let is_unique = s[0] == b':';
    if is_unique {
        if !matches!(kind, NameKind::Bus | NameKind::Unique) {
            return match kind {
                NameKind::WellKnown => Err("is not a well-known name"),
                NameKind::Error => Err("is not a error name"),
                NameKind::Interface => Err("is not a interface name"),
                NameKind::Namespace => Err("is not a namespace name"),
                _ => Err("is not a member name"),
            };
        }
    } else if kind == NameKind::Unique {
        return Err("is not a unique connection name");
    }

    let mut have_period = false;
    let mut seen_any = false;
    let mut prev = b'.';
    for &c in &s[if is_unique { 1 } else { 0 }..] {
        seen_any = true;
        if kind.allows_period() && c == b'.' {
            if prev == b'.' {
                return Err("has empty element");
            }
            have_period = true;
        }
        if !is_unique && prev == b'.' && c.is_ascii_digit() {
            return Err(if kind.allows_period() {
                "element starts with digit"
            } else {
                "starts with digit"
            });
        }
        match c {
            b'-' if kind.allows_hyphen() => {}
            b'.' if kind.allows_period() => {}
            b'_' | b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => {}
            _ => return Err("has invalid character"),
        }
        prev = c;
    }

    if kind.needs_period() && !have_period {
        return Err("doesn't have two elements");
    }
    if seen_any && prev == b'.' {
        return Err("has empty element");
    }
    Ok(())
}

/// Validates a bus name, either well-known or unique.
pub fn is_valid_bus_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Bus)
}

/// Validates a bus-assigned unique connection name.
pub fn is_valid_unique_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Unique)
}

/// Validates a human-chosen well-known bus name.
pub fn is_valid_well_known_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::WellKnown)
}

/// Validates an interface name.
pub fn is_valid_interface_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Interface)
}

/// Validates an error name (same syntax as interfaces).
pub fn is_valid_error_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Error)
}

/// Validates a name prefix as used by arg0namespace rules.
pub fn is_valid_namespace_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Namespace)
}

/// Validates a member (method or signal) name.
pub fn is_valid_member_name(s: &str) -> Result<(), &'static str> {
    validate_name(s, NameKind::Member)
}

/// Any D-Bus string: UTF-8 is already guaranteed by `&str`, so only
/// interior nuls and the message ceiling remain to check.
pub fn is_valid_string(s: &str) -> Result<(), &'static str> {
    if s.len() >= 134217728 {
        Err("exceeds the maximum message size")
    } else if s.bytes().any(|b| b == 0) {
        Err("has interior nul")
    } else {
        Ok(())
    }
}

/// Validates an object path.
pub fn is_valid_object_path(s: &str) -> Result<(), &'static str> {
    let b = s.as_bytes();
    if b.is_empty() {
        return Err("is empty");
    }
    if b.len() > MAX_NAME_LEN {
        return Err("exceeds 255 characters");
    }
    if b[0] != b'/' {
        return Err("doesn't start with slash");
    }
    if b.len() > 1 {
        if b[b.len() - 1] == b'/' {
            return Err("ends with slash");
        }
        let mut prev = b' ';
        for &c in b {
            if c == b'/' && prev == b'/' {
                return Err("has // sequence");
            }
            match c {
                b'/' | b'_' | b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => prev = c,
                _ => return Err("has invalid character"),
            }
        }
    }
    Ok(())
}

const BASIC_TYPES: &[u8] = b"ybnqiuxtdhsog";

pub(crate) const MAX_ARRAY_DEPTH: u8 = 32;
pub(crate) const MAX_STRUCT_DEPTH: u8 = 32;

fn sig_multi(s: &[u8], arrs: u8, structs: u8) -> Result<usize, &'static str> {
    let mut pos = 0;
    while pos < s.len() {
        if s.get(pos) == Some(&b')') {
            return Ok(pos);
        }
        pos += sig_single(&s[pos..], arrs, structs)?;
    }
    Ok(pos)
}

fn sig_single(s: &[u8], arrs: u8, structs: u8) -> Result<usize, &'static str> {
    let c = s.first().ok_or("ends unexpectedly")?;
    if BASIC_TYPES.contains(c) {
        return Ok(1);
    }
    Ok(1 + match c {
        b'v' => 0,
        b'a' => {
            if arrs >= MAX_ARRAY_DEPTH {
                return Err("has arrays nested more than 32 times");
            }
            if s.get(1) == Some(&b'{') {
                let key = s.get(2).ok_or("has incomplete dict entry")?;
                if !BASIC_TYPES.contains(key) {
                    return Err("has non-basic dict entry key");
                }
                let pos = 3 + sig_single(&s[3..], arrs + 1, structs)?;
                match s.get(pos) {
                    Some(&b'}') => pos,
                    Some(_) => return Err("has dict entry with more than one value"),
                    None => return Err("has incomplete dict entry"),
                }
            } else {
                sig_single(&s[1..], arrs + 1, structs)?
            }
        }
        b'(' => {
            if structs >= MAX_STRUCT_DEPTH {
                return Err("has structs nested more than 32 times");
            }
            let pos = 1 + sig_multi(&s[1..], arrs, structs + 1)?;
            if pos == 1 {
                return Err("has empty struct");
            }
            if s.get(pos) != Some(&b')') {
                return Err("has unbalanced parenthesis");
            }
            pos
        }
        b'{' => return Err("has dict entry outside of an array"),
        _ => return Err("has unknown type code"),
    })
}

/// Length in bytes of the first single complete type of an already
/// validated signature.
pub(crate) fn single_type_len(s: &[u8]) -> Option<usize> {
    sig_single(s, 0, 0).ok()
}

/// Validates a signature holding exactly one complete type.
pub fn is_valid_signature_single(s: &str) -> Result<(), &'static str> {
    let s = s.as_bytes();
    if s.len() > MAX_NAME_LEN {
        return Err("exceeds 255 characters");
    }
    let pos = sig_single(s, 0, 0)?;
    if pos == s.len() {
        Ok(())
    } else {
        Err("is more than one complete type")
    }
}

/// Validates a signature of zero or more complete types.
pub fn is_valid_signature_multi(s: &str) -> Result<(), &'static str> {
    let s = s.as_bytes();
    if s.len() > MAX_NAME_LEN {
        return Err("exceeds 255 characters");
    }
    let pos = sig_multi(s, 0, 0)?;
    if pos == s.len() {
        Ok(())
    } else {
        Err("has unbalanced parenthesis")
    }
}

#[test]
fn string() {
    assert!(is_valid_string("").is_ok());
    assert!(is_valid_string("Hell\0").is_err());
    assert!(is_valid_string("\u{ffff}").is_ok());
}

#[test]
fn member() {
    assert!(is_valid_member_name("").is_err());
    assert!(is_valid_member_name("He11o").is_ok());
    assert!(is_valid_member_name("He11o!").is_err());
    assert!(is_valid_member_name("1Hello").is_err());
    assert!(is_valid_member_name(":1.54").is_err());
    assert_eq!(is_valid_member_name("7"), Err("starts with digit"));
    assert_eq!(is_valid_member_name("."), Err("has invalid character"));
}

#[test]
fn interface() {
    assert!(is_valid_interface_name("").is_err());
    assert!(is_valid_interface_name("He11o").is_err());
    assert!(is_valid_interface_name("Hello.").is_err());
    assert!(is_valid_interface_name("Hello!.World").is_err());
    assert!(is_valid_interface_name("ZZZ.1Hello").is_err());
    assert!(is_valid_interface_name("Hello.W0rld").is_ok());
    assert!(is_valid_interface_name(":1.54").is_err());
    assert_eq!(is_valid_interface_name("a..b"), Err("has empty element"));
    assert_eq!(is_valid_interface_name("ab.7"), Err("element starts with digit"));
    assert_eq!(is_valid_interface_name("-._"), Err("has invalid character"));
}

#[test]
fn bus() {
    assert!(is_valid_bus_name("").is_err());
    assert!(is_valid_bus_name("He11o").is_err());
    assert!(is_valid_bus_name("Hello.").is_err());
    assert!(is_valid_bus_name("Hello!.World").is_err());
    assert!(is_valid_bus_name("ZZZ.1Hello").is_err());
    assert!(is_valid_bus_name("Hello.W0rld").is_ok());
    assert!(is_valid_bus_name(":1.54").is_ok());
    assert!(is_valid_bus_name("1.54").is_err());
    assert!(is_valid_bus_name("-._").is_ok());
    assert_eq!(is_valid_bus_name("."), Err("has empty element"));
    assert_eq!(is_valid_bus_name("1.a"), Err("element starts with digit"));
}

#[test]
fn unique_and_well_known() {
    assert!(is_valid_unique_name(":1.234").is_ok());
    assert!(is_valid_unique_name(":ab.7").is_ok());
    assert!(is_valid_unique_name(":_.-").is_ok());
    assert_eq!(is_valid_unique_name("-._"), Err("is not a unique connection name"));
    assert_eq!(is_valid_unique_name(":"), Err("doesn't have two elements"));
    assert_eq!(is_valid_unique_name(":.b"), Err("has empty element"));

    assert!(is_valid_well_known_name("-._").is_ok());
    assert!(is_valid_well_known_name("a.b.c.d").is_ok());
    assert_eq!(is_valid_well_known_name(":1.234"), Err("is not a well-known name"));
}

#[test]
fn namespace() {
    assert!(is_valid_namespace_name("_").is_ok());
    assert!(is_valid_namespace_name("ValidName").is_ok());
    assert!(is_valid_namespace_name("a.b.c.d").is_ok());
    assert_eq!(is_valid_namespace_name(":"), Err("is not a namespace name"));
    assert_eq!(is_valid_namespace_name("-._"), Err("has invalid character"));
}

#[test]
fn object_path() {
    assert!(is_valid_object_path("").is_err());
    assert!(is_valid_object_path("/").is_ok());
    assert!(is_valid_object_path("/1234").is_ok());
    assert!(is_valid_object_path("/a/c/df1").is_ok());
    assert!(is_valid_object_path("/asdf/_123").is_ok());
    assert_eq!(is_valid_object_path("foo/"), Err("doesn't start with slash"));
    assert_eq!(is_valid_object_path("/foo/"), Err("ends with slash"));
    assert_eq!(is_valid_object_path("/ab//c/d"), Err("has // sequence"));
    assert_eq!(is_valid_object_path("/12.43/fasd"), Err("has invalid character"));
    assert_eq!(is_valid_object_path("/a!"), Err("has invalid character"));
}

#[test]
fn signature() {
    assert!(is_valid_signature_single("").is_err());
    assert!(is_valid_signature_single("i").is_ok());
    assert!(is_valid_signature_single("ii").is_err());
    assert!(is_valid_signature_single("vi").is_err());
    assert!(is_valid_signature_single("g").is_ok());
    assert!(is_valid_signature_single("{ss}").is_err());
    assert!(is_valid_signature_single("ad").is_ok());
    assert!(is_valid_signature_single("a{ss}").is_ok());
    assert!(is_valid_signature_single("a{vs}").is_err());
    assert!(is_valid_signature_single("a{ss}i").is_err());
    assert!(is_valid_signature_single("a{oa{sv}}").is_ok());
    assert!(is_valid_signature_single("v").is_ok());
    assert!(is_valid_signature_single("()").is_err());
    assert!(is_valid_signature_single("(s)").is_ok());
    assert!(is_valid_signature_single("(sa{sv}(i))").is_ok());
    assert!(is_valid_signature_single("(sa{sv}(i)").is_err());
    assert!(is_valid_signature_single("(dbus)").is_ok());

    assert!(is_valid_signature_multi("dbus").is_ok());
    assert!(is_valid_signature_multi("").is_ok());
    assert!(is_valid_signature_multi("dbus)").is_err());
}

#[test]
fn signature_nesting_caps() {
    let deep_array = "a".repeat(32) + "i";
    assert!(is_valid_signature_single(&deep_array).is_ok());
    let too_deep = "a".repeat(33) + "i";
    assert_eq!(
        is_valid_signature_single(&too_deep),
        Err("has arrays nested more than 32 times")
    );

    let deep_struct = "(".repeat(32) + "i" + &")".repeat(32);
    assert!(is_valid_signature_single(&deep_struct).is_ok());
    let too_deep = "(".repeat(33) + "i" + &")".repeat(33);
    assert_eq!(
        is_valid_signature_single(&too_deep),
        Err("has structs nested more than 32 times")
    );

    let dict_multi_value = "a{sii}";
    assert_eq!(
        is_valid_signature_single(dict_multi_value),
        Err("has dict entry with more than one value")
    );
}
