//! Response post-processors.
//!
//! Each parser receives the command's wire arguments (some replies depend
//! on options such as `WITHSCORES`) and the raw reply. Error replies are
//! never reshaped.

use super::Value;
use crate::protocol::Reply;
use bytes::Bytes;

/// Signature shared by every response parser.
pub type ResponseParser = fn(&[Bytes], Reply) -> Value;

/// Pass the reply through unchanged.
pub fn identity(_arguments: &[Bytes], reply: Reply) -> Value {
    Value::from(reply)
}

/// Integer replies become booleans.
pub fn boolean(_arguments: &[Bytes], reply: Reply) -> Value {
    match reply {
        Reply::Integer(n) => Value::Bool(n != 0),
        other => Value::from(other),
    }
}

/// `EXISTS` with a single key answers a boolean, otherwise a count.
pub fn exists(arguments: &[Bytes], reply: Reply) -> Value {
    if arguments.len() == 1 {
        boolean(arguments, reply)
    } else {
        identity(arguments, reply)
    }
}

/// A flat `[k1, v1, k2, v2, ...]` array folded into pairs.
pub fn pairs(_arguments: &[Bytes], reply: Reply) -> Value {
    match reply {
        Reply::Array(items) => fold_pairs(items),
        other => Value::from(other),
    }
}

/// Fold into pairs only when `WITHSCORES` was requested.
pub fn with_scores(arguments: &[Bytes], reply: Reply) -> Value {
    let requested = arguments
        .iter()
        .any(|a| a.eq_ignore_ascii_case(b"WITHSCORES"));
    if requested {
        pairs(arguments, reply)
    } else {
        identity(arguments, reply)
    }
}

/// `[cursor, [items]]` with a numeric cursor.
pub fn scan(_arguments: &[Bytes], reply: Reply) -> Value {
    scan_with(reply, |items| {
        Value::Array(items.into_iter().map(Value::from).collect())
    })
}

/// `[cursor, [k1, v1, ...]]` with the items folded into pairs.
pub fn scan_pairs(_arguments: &[Bytes], reply: Reply) -> Value {
    scan_with(reply, fold_pairs)
}

fn scan_with(reply: Reply, items: fn(Vec<Reply>) -> Value) -> Value {
    match reply {
        Reply::Array(mut parts) if parts.len() == 2 => {
            let page = parts.pop().unwrap_or(Reply::Nil);
            let cursor = parts.pop().unwrap_or(Reply::Nil);
            let cursor = match cursor.as_integer() {
                Some(n) => Value::Int(n),
                None => Value::from(cursor),
            };
            let page = match page {
                Reply::Array(list) => items(list),
                other => Value::from(other),
            };
            Value::Array(vec![cursor, page])
        }
        other => Value::from(other),
    }
}

/// `INFO` text parsed into `field => value` pairs.
///
/// Section headers (`# Server`) and blank lines are skipped.
pub fn info(_arguments: &[Bytes], reply: Reply) -> Value {
    let Reply::Bulk(text) = reply else {
        return Value::from(reply);
    };
    let Ok(text) = std::str::from_utf8(&text) else {
        return Value::Data(text);
    };
    let fields = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| {
            (
                Value::Data(Bytes::copy_from_slice(k.as_bytes())),
                Value::Data(Bytes::copy_from_slice(v.as_bytes())),
            )
        })
        .collect();
    Value::Map(fields)
}

fn fold_pairs(items: Vec<Reply>) -> Value {
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((Value::from(k), Value::from(v)));
    }
    Value::Map(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<Bytes> {
        raw.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_boolean() {
        assert_eq!(boolean(&[], Reply::Integer(1)), Value::Bool(true));
        assert_eq!(boolean(&[], Reply::Integer(0)), Value::Bool(false));
        assert!(boolean(&[], Reply::error("ERR x")).is_error());
    }

    #[test]
    fn test_exists() {
        assert_eq!(exists(&args(&["a"]), Reply::Integer(1)), Value::Bool(true));
        assert_eq!(exists(&args(&["a", "b"]), Reply::Integer(2)), Value::Int(2));
    }

    #[test]
    fn test_pairs() {
        let reply = Reply::Array(vec![Reply::from("f1"), Reply::from("v1"), Reply::from("f2"), Reply::from("v2")]);
        let value = pairs(&[], reply);
        assert_eq!(value.get(b"f2").and_then(Value::as_str), Some("v2"));
        assert_eq!(pairs(&[], Reply::Array(vec![])), Value::Map(vec![]));
    }

    #[test]
    fn test_with_scores() {
        let reply = Reply::Array(vec![Reply::from("a"), Reply::from("1")]);
        assert!(matches!(with_scores(&args(&["z", "0", "-1"]), reply.clone()), Value::Array(_)));
        assert!(matches!(
            with_scores(&args(&["z", "0", "-1", "withscores"]), reply),
            Value::Map(_)
        ));
    }

    #[test]
    fn test_scan() {
        let reply = Reply::Array(vec![
            Reply::from("17"),
            Reply::Array(vec![Reply::from("k1"), Reply::from("k2")]),
        ]);
        let value = scan(&[], reply);
        let parts = value.as_array().unwrap();
        assert_eq!(parts[0], Value::Int(17));
        assert_eq!(parts[1].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_info() {
        let text = "# Server\r\nredis_version:7.2.0\r\n\r\n# Replication\r\nrole:master\r\n";
        let value = info(&[], Reply::bulk(text.as_bytes().to_vec()));
        assert_eq!(value.get(b"role").and_then(Value::as_str), Some("master"));
        assert_eq!(value.get(b"redis_version").and_then(Value::as_str), Some("7.2.0"));
    }
}
