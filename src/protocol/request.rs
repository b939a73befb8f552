//! Request serialization.
//!
//! `*<1 + argc>\r\n` followed by the command id and every argument as a
//! bulk string. Arguments are written verbatim after their length, so no
//! escaping is ever needed.

use super::{CRLF, markers};
use bytes::{BufMut, Bytes, BytesMut};

/// Serialize a command id and its arguments into `buf`.
pub fn encode_command(buf: &mut BytesMut, id: &str, arguments: &[Bytes]) {
    buf.reserve(encoded_len(id, arguments));
    put_header(buf, markers::ARRAY, arguments.len() + 1);
    put_bulk(buf, id.as_bytes());
    for argument in arguments {
        put_bulk(buf, argument);
    }
}

/// Exact number of bytes [`encode_command`] writes.
pub fn encoded_len(id: &str, arguments: &[Bytes]) -> usize {
    let header = 1 + digits(arguments.len() + 1) + 2;
    let bulk = |len: usize| 1 + digits(len) + 2 + len + 2;
    header + bulk(id.len()) + arguments.iter().map(|a| bulk(a.len())).sum::<usize>()
}

#[inline]
fn put_header(buf: &mut BytesMut, marker: u8, len: usize) {
    buf.put_u8(marker);
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(CRLF);
}

#[inline]
fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    put_header(buf, markers::BULK_STRING, data.len());
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(id: &str, args: &[&[u8]]) -> Vec<u8> {
        let args: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        let mut buf = BytesMut::new();
        encode_command(&mut buf, id, &args);
        assert_eq!(buf.len(), encoded_len(id, &args));
        buf.to_vec()
    }

    #[test]
    fn test_encode_set() {
        assert_eq!(
            encode("SET", &[b"key", b"value"]),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n"
        );
    }

    #[test]
    fn test_encode_no_arguments() {
        assert_eq!(encode("PING", &[]), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_encode_binary_argument() {
        assert_eq!(
            encode("SET", &[b"k", b"\r\n\0"]),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\n\r\n\0\r\n"
        );
    }

    #[test]
    fn test_encoded_len_multi_digit() {
        let value = vec![b'x'; 1234];
        encode("SET", &[b"key", &value]);
        assert_eq!(digits(0), 1);
        assert_eq!(digits(10), 2);
        assert_eq!(digits(1234), 4);
    }
}
