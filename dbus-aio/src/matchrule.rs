//! Composition of broker match-rule strings.
//!
//! <https://dbus.freedesktop.org/doc/dbus-specification.html#message-bus-routing-match-rules>

use crate::error::Error;
use crate::message::MessageType;
use dbus_aio_strings::{BusName, InterfaceName, MemberName, NamespaceName, ObjectPath, UniqueName};
use std::collections::BTreeMap;

/// Highest argument index an `argN` / `argNpath` key accepts.
pub const MAX_ARG_INDEX: u8 = 63;

/// A "match rule" filter the bus uses to decide which broadcast
/// signals (or, for monitors, which messages) to deliver.
///
/// An empty rule serialises to the empty string and matches
/// everything.
#[derive(Clone, Debug, Default)]
pub struct MatchRule {
    msg_type: Option<&'static str>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    arg0_namespace: Option<String>,
    args: BTreeMap<u8, String>,
    arg_paths: BTreeMap<u8, String>,
}

fn msg_type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::MethodCall => "method_call",
        MessageType::MethodReturn => "method_return",
        MessageType::Error => "error",
        MessageType::Signal => "signal",
    }
}

fn escape_apostrophes(value: &str) -> String {
    value.replace('\'', "'\\''")
}

impl MatchRule {
    /// A rule which matches every message.
    pub fn new() -> Self {
        Default::default()
    }

    /// Match on message type.
    pub fn msg_type(mut self, t: MessageType) -> Self {
        self.msg_type = Some(msg_type_str(t));
        self
    }

    /// Match on the sending connection.
    pub fn sender(mut self, name: &BusName) -> Self {
        self.sender = Some(name.to_string());
        self
    }

    /// Match on the interface header field.
    pub fn interface(mut self, name: &InterfaceName) -> Self {
        self.interface = Some(name.to_string());
        self
    }

    /// Match on the member header field.
    pub fn member(mut self, name: &MemberName) -> Self {
        self.member = Some(name.to_string());
        self
    }

    /// Match on the exact object path. Mutually exclusive with
    /// [`MatchRule::path_namespace`].
    pub fn path(mut self, path: &ObjectPath) -> Result<Self, Error> {
        if self.path_namespace.is_some() {
            return Err(Error::InvalidMatchRule("path and path_namespace are not allowed together"));
        }
        self.path = Some(path.to_string());
        Ok(self)
    }

    /// Match on the path and everything below it. Mutually exclusive
    /// with [`MatchRule::path`].
    pub fn path_namespace(mut self, path: &ObjectPath) -> Result<Self, Error> {
        if self.path.is_some() {
            return Err(Error::InvalidMatchRule("path and path_namespace are not allowed together"));
        }
        self.path_namespace = Some(path.to_string());
        Ok(self)
    }

    /// Match on the destination; only unique names make sense here.
    pub fn destination(mut self, name: &UniqueName) -> Self {
        self.destination = Some(name.to_string());
        self
    }

    /// Match messages whose first argument lies within a namespace.
    pub fn arg0_namespace(mut self, name: &NamespaceName) -> Self {
        self.arg0_namespace = Some(name.to_string());
        self
    }

    /// Match on a string argument by index (0..=63).
    pub fn arg(mut self, index: u8, value: &str) -> Result<Self, Error> {
        if index > MAX_ARG_INDEX {
            return Err(Error::InvalidMatchRule("arg index exceeds 63"));
        }
        self.args.insert(index, escape_apostrophes(value));
        Ok(self)
    }

    /// Match on a path-valued argument by index (0..=63).
    pub fn arg_path(mut self, index: u8, value: &str) -> Result<Self, Error> {
        if index > MAX_ARG_INDEX {
            return Err(Error::InvalidMatchRule("arg path index exceeds 63"));
        }
        self.arg_paths.insert(index, escape_apostrophes(value));
        Ok(self)
    }

    /// The comma-separated key=value string to hand to `AddMatch`.
    pub fn match_str(&self) -> String {
        let mut parts: Vec<String> = vec![];
        if let Some(x) = self.msg_type {
            parts.push(format!("type='{}'", x));
        }
        if let Some(ref x) = self.sender {
            parts.push(format!("sender='{}'", x));
        }
        if let Some(ref x) = self.interface {
            parts.push(format!("interface='{}'", x));
        }
        if let Some(ref x) = self.member {
            parts.push(format!("member='{}'", x));
        }
        if let Some(ref x) = self.path {
            parts.push(format!("path='{}'", x));
        }
        if let Some(ref x) = self.path_namespace {
            parts.push(format!("path_namespace='{}'", x));
        }
        if let Some(ref x) = self.destination {
            parts.push(format!("destination='{}'", x));
        }
        if let Some(ref x) = self.arg0_namespace {
            parts.push(format!("arg0namespace='{}'", x));
        }
        for (idx, v) in &self.args {
            parts.push(format!("arg{}='{}'", idx, v));
        }
        for (idx, v) in &self.arg_paths {
            parts.push(format!("arg{}path='{}'", idx, v));
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus_aio_strings::StringLike;

    fn iface(s: &str) -> &InterfaceName { InterfaceName::new(s).unwrap() }
    fn opath(s: &str) -> &ObjectPath { ObjectPath::new(s).unwrap() }

    #[test]
    fn wildcard() {
        assert_eq!(MatchRule::new().match_str(), "");
    }

    #[test]
    fn types() {
        assert_eq!(MatchRule::new().msg_type(MessageType::MethodCall).match_str(), "type='method_call'");
        assert_eq!(MatchRule::new().msg_type(MessageType::MethodReturn).match_str(), "type='method_return'");
        assert_eq!(MatchRule::new().msg_type(MessageType::Error).match_str(), "type='error'");
        assert_eq!(MatchRule::new().msg_type(MessageType::Signal).match_str(), "type='signal'");
    }

    #[test]
    fn names() {
        assert_eq!(
            MatchRule::new().sender(BusName::new(":1.234").unwrap()).match_str(),
            "sender=':1.234'"
        );
        assert_eq!(
            MatchRule::new().sender(BusName::new("well-known.name").unwrap()).match_str(),
            "sender='well-known.name'"
        );
        assert_eq!(
            MatchRule::new().interface(iface("inter_face.Name")).match_str(),
            "interface='inter_face.Name'"
        );
        assert_eq!(
            MatchRule::new().member(MemberName::new("MemberName_").unwrap()).match_str(),
            "member='MemberName_'"
        );
        assert_eq!(
            MatchRule::new().destination(UniqueName::new(":1.234").unwrap()).match_str(),
            "destination=':1.234'"
        );
        assert_eq!(
            MatchRule::new().arg0_namespace(NamespaceName::new("Name.Space").unwrap()).match_str(),
            "arg0namespace='Name.Space'"
        );
    }

    #[test]
    fn paths_are_mutually_exclusive() {
        assert_eq!(
            MatchRule::new().path(opath("/Org/Foo")).unwrap().match_str(),
            "path='/Org/Foo'"
        );
        assert_eq!(
            MatchRule::new().path_namespace(opath("/Org/Foo")).unwrap().match_str(),
            "path_namespace='/Org/Foo'"
        );
        assert!(MatchRule::new().path(opath("/Org/Foo")).unwrap().path_namespace(opath("/Org/Bar")).is_err());
        assert!(MatchRule::new().path_namespace(opath("/Org/Foo")).unwrap().path(opath("/Org/Bar")).is_err());
    }

    #[test]
    fn args() {
        assert_eq!(
            MatchRule::new().arg(0, "foo").unwrap().arg(42, "bar").unwrap().match_str(),
            "arg0='foo',arg42='bar'"
        );
        assert_eq!(MatchRule::new().arg(0, "'").unwrap().match_str(), "arg0=''\\'''");
        assert_eq!(MatchRule::new().arg(63, "\\").unwrap().match_str(), "arg63='\\'");
        assert!(MatchRule::new().arg(64, "/Org/Foo").is_err());
    }

    #[test]
    fn arg_paths() {
        assert_eq!(
            MatchRule::new().arg_path(63, "/foo/bar/").unwrap().match_str(),
            "arg63path='/foo/bar/'"
        );
        assert_eq!(MatchRule::new().arg_path(0, "'").unwrap().match_str(), "arg0path=''\\'''");
        assert!(MatchRule::new().arg_path(64, "/Org/Foo").is_err());
    }

    #[test]
    fn combined_order() {
        let rule = MatchRule::new()
            .msg_type(MessageType::Signal)
            .interface(iface("org.freedesktop.DBus"))
            .member(MemberName::new("NameAcquired").unwrap());
        assert_eq!(
            rule.match_str(),
            "type='signal',interface='org.freedesktop.DBus',member='NameAcquired'"
        );
    }
}
