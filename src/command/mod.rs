//! Command model.
//!
//! A [`Command`] is an id plus its wire arguments, carrying the
//! [`CommandSpec`] that says where its keys are and how its reply is
//! post-processed. Commands are usually built through a [`CommandTable`].

pub mod keys;
pub mod normalize;
pub mod prefix;
pub mod response;
pub mod table;
pub mod value;

pub use keys::KeyLayout;
pub use prefix::KeyPrefix;
pub use table::{CommandFlags, CommandSpec, CommandTable};
pub use value::Value;

use crate::protocol::Reply;
use bytes::Bytes;
use std::cell::Cell;

/// A structured argument, flattened by the command's normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// A single byte string
    Bytes(Bytes),
    /// A list spliced in place
    List(Vec<Bytes>),
    /// Ordered pairs spliced as `key value ...`
    Map(Vec<(Bytes, Bytes)>),
}

impl Argument {
    /// Build a list argument from anything convertible to bytes.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Build a map argument from ordered pairs.
    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub(crate) fn flatten_into(self, out: &mut Vec<Bytes>) {
        match self {
            Self::Bytes(b) => out.push(b),
            Self::List(items) => out.extend(items),
            Self::Map(pairs) => {
                for (k, v) in pairs {
                    out.push(k);
                    out.push(v);
                }
            }
        }
    }
}

impl From<Bytes> for Argument {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Self {
        Self::Bytes(Bytes::from(s))
    }
}

impl From<&[u8]> for Argument {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Argument {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

macro_rules! impl_from_number {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Argument {
                fn from(n: $t) -> Self {
                    Self::Bytes(Bytes::from(n.to_string()))
                }
            }
        )*
    };
}

impl_from_number!(i32, i64, u32, u64, usize, f64);

impl From<Vec<&str>> for Argument {
    fn from(items: Vec<&str>) -> Self {
        Self::list(items.into_iter().map(|s| Bytes::copy_from_slice(s.as_bytes())))
    }
}

impl From<Vec<String>> for Argument {
    fn from(items: Vec<String>) -> Self {
        Self::list(items)
    }
}

impl From<Vec<Bytes>> for Argument {
    fn from(items: Vec<Bytes>) -> Self {
        Self::List(items)
    }
}

/// A command ready to be written to a connection.
#[derive(Debug, Clone)]
pub struct Command {
    id: String,
    arguments: Vec<Bytes>,
    spec: CommandSpec,
    slot: Cell<Option<u32>>,
}

impl Command {
    /// Build a command, normalizing structured arguments through `spec`.
    pub fn new(id: &str, spec: CommandSpec, arguments: Vec<Argument>) -> Self {
        let arguments = (spec.normalize)(arguments);
        Self::from_raw(id, spec, arguments)
    }

    /// A command unknown to any table: no keys, replies passed through.
    pub fn raw(id: &str, arguments: Vec<Bytes>) -> Self {
        Self::from_raw(id, CommandSpec::generic(), arguments)
    }

    /// Build a command from arguments already in wire form.
    pub fn from_raw(id: &str, spec: CommandSpec, arguments: Vec<Bytes>) -> Self {
        Self {
            id: id.to_ascii_uppercase(),
            arguments,
            spec,
            slot: Cell::new(None),
        }
    }

    /// Upper-case command id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wire arguments, id excluded.
    #[inline]
    pub fn arguments(&self) -> &[Bytes] {
        &self.arguments
    }

    /// Argument at `index`.
    #[inline]
    pub fn argument(&self, index: usize) -> Option<&Bytes> {
        self.arguments.get(index)
    }

    /// The spec this command was built with.
    #[inline]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Routing flags.
    #[inline]
    pub fn flags(&self) -> CommandFlags {
        self.spec.flags
    }

    /// Replace the arguments (normalized) and forget any cached slot.
    pub fn set_arguments(&mut self, arguments: Vec<Argument>) {
        self.set_raw_arguments((self.spec.normalize)(arguments));
    }

    /// Replace the wire arguments and forget any cached slot.
    pub fn set_raw_arguments(&mut self, arguments: Vec<Bytes>) {
        self.arguments = arguments;
        self.slot.set(None);
    }

    /// Cached routing slot, if one was computed.
    #[inline]
    pub fn slot(&self) -> Option<u32> {
        self.slot.get()
    }

    /// Cache the routing slot.
    #[inline]
    pub fn set_slot(&self, slot: u32) {
        self.slot.set(Some(slot));
    }

    /// Keys used for routing, in argument order.
    pub fn keys(&self) -> Vec<&Bytes> {
        self.spec
            .keys
            .key_indices(&self.arguments)
            .into_iter()
            .map(|i| &self.arguments[i])
            .collect()
    }

    /// Prepend `prefix` to every key argument.
    pub fn prefix_keys(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        self.spec.keys.apply_prefix(&mut self.arguments, prefix);
        self.slot.set(None);
    }

    /// Post-process a raw reply for this command.
    pub fn parse_response(&self, reply: Reply) -> Value {
        (self.spec.response)(&self.arguments, reply)
    }

    /// Returns true if the id matches, ignoring case.
    #[inline]
    pub fn is(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_normalizes_and_uppercases() {
        let table = CommandTable::new();
        let cmd = table.create("mset", vec![Argument::map([("a", "1"), ("b", "2")])]).unwrap();
        assert_eq!(cmd.id(), "MSET");
        assert_eq!(cmd.arguments().len(), 4);
        let keys: Vec<&[u8]> = cmd.keys().into_iter().map(|k| k.as_ref()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref()]);
    }

    #[test]
    fn test_set_arguments_invalidates_slot() {
        let table = CommandTable::new();
        let mut cmd = table.create("GET", vec!["foo".into()]).unwrap();
        cmd.set_slot(12182);
        assert_eq!(cmd.slot(), Some(12182));
        cmd.set_arguments(vec!["bar".into()]);
        assert_eq!(cmd.slot(), None);
    }

    #[test]
    fn test_prefix_keys() {
        let table = CommandTable::new();
        let mut cmd = table.create("SET", vec!["k".into(), "v".into()]).unwrap();
        cmd.prefix_keys(b"ns:");
        assert_eq!(cmd.arguments()[0].as_ref(), b"ns:k");
        assert_eq!(cmd.arguments()[1].as_ref(), b"v");
    }

    #[test]
    fn test_parse_response_uses_spec() {
        let table = CommandTable::new();
        let cmd = table.create("EXPIRE", vec!["k".into(), 10i64.into()]).unwrap();
        assert_eq!(cmd.parse_response(Reply::Integer(1)), Value::Bool(true));
    }

    #[test]
    fn test_number_arguments() {
        assert_eq!(Argument::from(42i64), Argument::Bytes(Bytes::from_static(b"42")));
        assert_eq!(Argument::from(1.5f64), Argument::Bytes(Bytes::from_static(b"1.5")));
    }
}
