//! Argument normalizers.
//!
//! A normalizer turns the structured arguments a caller passed into the
//! flat byte-string list that goes on the wire.

use super::Argument;
use bytes::Bytes;

/// Signature shared by every normalizer.
pub type Normalizer = fn(Vec<Argument>) -> Vec<Bytes>;

/// Flatten lists in place and maps as `key value` pairs.
pub fn flatten(arguments: Vec<Argument>) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(arguments.len());
    for argument in arguments {
        argument.flatten_into(&mut out);
    }
    out
}

/// `ZADD key [options] {member: score}`: map entries go out as `score member`.
pub fn zset_add(arguments: Vec<Argument>) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(arguments.len() * 2);
    for argument in arguments {
        match argument {
            Argument::Map(pairs) => {
                for (member, score) in pairs {
                    out.push(score);
                    out.push(member);
                }
            }
            other => other.flatten_into(&mut out),
        }
    }
    out
}

/// `EVAL script [keys] [args]`: a list in second position becomes
/// `numkeys key...`.
pub fn script(arguments: Vec<Argument>) -> Vec<Bytes> {
    counted_list_at(arguments, 1)
}

/// `ZUNIONSTORE dest [keys] [options]`: a list in second position becomes
/// `numkeys key...`.
pub fn zset_store(arguments: Vec<Argument>) -> Vec<Bytes> {
    counted_list_at(arguments, 1)
}

fn counted_list_at(arguments: Vec<Argument>, position: usize) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(arguments.len() + 1);
    for (i, argument) in arguments.into_iter().enumerate() {
        match argument {
            Argument::List(items) if i == position => {
                out.push(Bytes::from(items.len().to_string()));
                out.extend(items);
            }
            other => other.flatten_into(&mut out),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(out: &[Bytes]) -> Vec<&str> {
        out.iter().map(|b| std::str::from_utf8(b).unwrap()).collect()
    }

    #[test]
    fn test_flatten() {
        let out = flatten(vec![
            Argument::from("key"),
            Argument::from(vec!["a", "b"]),
            Argument::map([("f", "v")]),
        ]);
        assert_eq!(strs(&out), ["key", "a", "b", "f", "v"]);
    }

    #[test]
    fn test_zset_add_swaps_member_and_score() {
        let out = zset_add(vec![
            Argument::from("z"),
            Argument::from("NX"),
            Argument::map([("alice", "1.5"), ("bob", "2")]),
        ]);
        assert_eq!(strs(&out), ["z", "NX", "1.5", "alice", "2", "bob"]);
    }

    #[test]
    fn test_script_counts_keys() {
        let out = script(vec![
            Argument::from("return 1"),
            Argument::from(vec!["k1", "k2"]),
            Argument::from(vec!["a1"]),
        ]);
        assert_eq!(strs(&out), ["return 1", "2", "k1", "k2", "a1"]);
    }

    #[test]
    fn test_script_with_explicit_numkeys() {
        let out = script(vec![
            Argument::from("return 1"),
            Argument::from(1i64),
            Argument::from("k1"),
        ]);
        assert_eq!(strs(&out), ["return 1", "1", "k1"]);
    }

    #[test]
    fn test_zset_store() {
        let out = zset_store(vec![
            Argument::from("dest"),
            Argument::from(vec!["z1", "z2"]),
            Argument::from("AGGREGATE"),
            Argument::from("MAX"),
        ]);
        assert_eq!(strs(&out), ["dest", "2", "z1", "z2", "AGGREGATE", "MAX"]);
    }
}
