//! Property-based tests using proptest.
//!
//! Wire codec invariants and routing invariants that must hold for any
//! input, not just the hand-picked cases in the unit tests.

use bytes::{Bytes, BytesMut};
use cairn::cluster::{key_slot, Distributor, HashRing};
use cairn::protocol::{encode_command, encoded_len, parse_reply, ReplyParser};
use cairn::{Reply, RingAlgorithm};
use proptest::prelude::*;

/// Arbitrary binary-safe arguments, CR and LF included
fn arb_argument() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..256),
        prop::collection::vec(prop::sample::select(vec![b'\r', b'\n', b'$', b'*', b'a']), 0..32),
    ]
}

/// Command ids as they appear on the wire
fn arb_id() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z]{1,16}").unwrap()
}

/// Keys that may or may not carry a hash tag
fn arb_key() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9:{}_-]{1,40}").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Decoding an encoded request yields the same arguments byte for byte
    #[test]
    fn prop_request_roundtrip(id in arb_id(), args in prop::collection::vec(arb_argument(), 0..8)) {
        let arguments: Vec<Bytes> = args.iter().cloned().map(Bytes::from).collect();
        let mut buf = BytesMut::new();
        encode_command(&mut buf, &id, &arguments);
        prop_assert_eq!(buf.len(), encoded_len(&id, &arguments));

        let Reply::Array(items) = parse_reply(&buf).unwrap() else {
            return Err(TestCaseError::fail("request did not decode to an array"));
        };
        prop_assert_eq!(items.len(), arguments.len() + 1);
        prop_assert_eq!(&items[0], &Reply::bulk(id.clone()));
        for (item, argument) in items[1..].iter().zip(&arguments) {
            prop_assert_eq!(item, &Reply::Bulk(argument.clone()));
        }
    }

    /// Feeding a reply one byte at a time gives the same result as all at once
    #[test]
    fn prop_incremental_parse(args in prop::collection::vec(arb_argument(), 1..6)) {
        let arguments: Vec<Bytes> = args.into_iter().map(Bytes::from).collect();
        let mut buf = BytesMut::new();
        encode_command(&mut buf, "ECHO", &arguments);
        let whole = parse_reply(&buf).unwrap();

        let mut parser = ReplyParser::new();
        let mut parsed = None;
        for (i, byte) in buf.iter().enumerate() {
            parser.extend(&[*byte]);
            match parser.parse().unwrap() {
                Some(reply) => {
                    prop_assert_eq!(i, buf.len() - 1);
                    parsed = Some(reply);
                }
                None => prop_assert!(i < buf.len() - 1),
            }
        }
        prop_assert_eq!(parsed, Some(whole));
        prop_assert!(parser.is_empty());
    }

    /// The parser never panics, whatever the server sends
    #[test]
    fn prop_parser_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut parser = ReplyParser::new();
        parser.extend(&data);
        let _ = parser.parse();
        let _ = parser.parse_header();
    }

    /// Integer replies decode to the same value
    #[test]
    fn prop_integer_reply(n in any::<i64>()) {
        let wire = format!(":{n}\r\n");
        prop_assert_eq!(parse_reply(wire.as_bytes()).unwrap(), Reply::Integer(n));
    }

    /// Bulk replies keep their payload, empty payloads included
    #[test]
    fn prop_bulk_reply(data in arb_argument()) {
        let mut wire = format!("${}\r\n", data.len()).into_bytes();
        wire.extend_from_slice(&data);
        wire.extend_from_slice(b"\r\n");
        prop_assert_eq!(parse_reply(&wire).unwrap(), Reply::Bulk(Bytes::from(data)));
    }

    /// Keys sharing a hash tag share a slot
    #[test]
    fn prop_hash_tag_colocation(tag in "[a-z0-9]{1,10}", a in "[a-z0-9:]{0,10}", b in "[a-z0-9:]{0,10}") {
        let first = format!("{a}{{{tag}}}x");
        let second = format!("{b}{{{tag}}}y");
        prop_assert_eq!(key_slot(first.as_bytes()), key_slot(second.as_bytes()));
        prop_assert!(key_slot(first.as_bytes()) < 16384);
    }

    /// Adding then removing a node restores every key's owner
    #[test]
    fn prop_ring_add_remove_stable(
        keys in prop::collection::vec(arb_key(), 1..50),
        ketama in any::<bool>(),
        weight in 1u32..400,
    ) {
        let algorithm = if ketama { RingAlgorithm::Ketama } else { RingAlgorithm::Crc32 };
        let mut ring = HashRing::new(algorithm);
        ring.add("10.0.0.1:6379", None);
        ring.add("10.0.0.2:6379", Some(200));
        let before: Vec<_> = keys.iter().map(|k| ring.get(k.as_bytes())).collect();

        ring.add("10.0.0.3:6379", Some(weight));
        prop_assert!(ring.get(b"probe").is_some());
        ring.remove("10.0.0.3:6379");

        let after: Vec<_> = keys.iter().map(|k| ring.get(k.as_bytes())).collect();
        prop_assert_eq!(before, after);
    }
}

#[test]
fn test_bulk_edge_cases() {
    assert_eq!(parse_reply(b"$0\r\n\r\n").unwrap(), Reply::bulk(""));
    assert_eq!(parse_reply(b"$-1\r\n").unwrap(), Reply::Nil);
    assert_eq!(parse_reply(b"*-1\r\n").unwrap(), Reply::Nil);
    assert_eq!(parse_reply(b"*0\r\n").unwrap(), Reply::Array(Vec::new()));
}
