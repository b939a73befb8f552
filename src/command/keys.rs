//! Which argument positions of a command hold keys.
//!
//! The same layout drives both cluster routing and key prefixing. `SORT`
//! is the one command where they differ: its `BY`/`GET` patterns are
//! prefixed but never routed on.

use bytes::{Bytes, BytesMut};

/// Key positions of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyLayout {
    /// The command takes no keys
    #[default]
    None,
    /// Only the first argument is a key
    First,
    /// Every argument is a key
    All,
    /// Keys and values alternate, starting with a key
    Interleaved,
    /// Every argument but the first (e.g. `BITOP op dest key...`)
    SkipFirst,
    /// Every argument but the last (e.g. `BLPOP key... timeout`)
    SkipLast,
    /// `script numkeys key... arg...`
    Script,
    /// `destination numkeys key... [options]`
    ZsetStore,
    /// `key [BY pattern] [GET pattern...] [STORE destination]`
    Sort,
}

impl KeyLayout {
    /// Positions of the keys used for routing.
    pub fn key_indices(self, args: &[Bytes]) -> Vec<usize> {
        let len = args.len();
        match self {
            Self::None => Vec::new(),
            Self::First => (0..len.min(1)).collect(),
            Self::All => (0..len).collect(),
            Self::Interleaved => (0..len).step_by(2).collect(),
            Self::SkipFirst => (1..len).collect(),
            Self::SkipLast => (0..len.saturating_sub(1)).collect(),
            Self::Script => counted_range(args, 1, 2).collect(),
            Self::ZsetStore => {
                if len == 0 {
                    return Vec::new();
                }
                std::iter::once(0).chain(counted_range(args, 1, 2)).collect()
            }
            Self::Sort => {
                let mut indices: Vec<usize> = (0..len.min(1)).collect();
                indices.extend(option_values(args, "STORE"));
                indices
            }
        }
    }

    /// Positions rewritten when a key prefix is applied.
    pub fn prefix_indices(self, args: &[Bytes]) -> Vec<usize> {
        match self {
            Self::Sort => {
                if args.is_empty() {
                    return Vec::new();
                }
                let mut indices = vec![0];
                indices.extend(
                    option_values(args, "BY").filter(|&i| !args[i].eq_ignore_ascii_case(b"NOSORT")),
                );
                indices.extend(option_values(args, "GET").filter(|&i| args[i].as_ref() != b"#"));
                indices.extend(option_values(args, "STORE"));
                indices.sort_unstable();
                indices
            }
            other => other.key_indices(args),
        }
    }

    /// Prepend `prefix` to every key argument.
    pub fn apply_prefix(self, args: &mut [Bytes], prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        for index in self.prefix_indices(args) {
            let mut prefixed = BytesMut::with_capacity(prefix.len() + args[index].len());
            prefixed.extend_from_slice(prefix);
            prefixed.extend_from_slice(&args[index]);
            args[index] = prefixed.freeze();
        }
    }
}

/// Indices `start..start + n` where `n` is the integer at `count_at`,
/// clamped to the arguments actually present.
fn counted_range(args: &[Bytes], count_at: usize, start: usize) -> std::ops::Range<usize> {
    let count = args
        .get(count_at)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    let end = start.saturating_add(count).min(args.len());
    start.min(end)..end
}

/// Indices of the values following every occurrence of `option`.
fn option_values<'a>(args: &'a [Bytes], option: &'a str) -> impl Iterator<Item = usize> + 'a {
    (1..args.len().saturating_sub(1))
        .filter(move |&i| args[i].eq_ignore_ascii_case(option.as_bytes()))
        .map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<Bytes> {
        raw.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_simple_layouts() {
        let a = args(&["k1", "v1", "k2", "v2"]);
        assert_eq!(KeyLayout::None.key_indices(&a), Vec::<usize>::new());
        assert_eq!(KeyLayout::First.key_indices(&a), vec![0]);
        assert_eq!(KeyLayout::All.key_indices(&a), vec![0, 1, 2, 3]);
        assert_eq!(KeyLayout::Interleaved.key_indices(&a), vec![0, 2]);
        assert_eq!(KeyLayout::SkipFirst.key_indices(&a), vec![1, 2, 3]);
        assert_eq!(KeyLayout::SkipLast.key_indices(&a), vec![0, 1, 2]);
        assert_eq!(KeyLayout::First.key_indices(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_script_layout() {
        let a = args(&["return 1", "2", "a", "b", "argv1"]);
        assert_eq!(KeyLayout::Script.key_indices(&a), vec![2, 3]);

        let a = args(&["return 1", "0", "argv1"]);
        assert!(KeyLayout::Script.key_indices(&a).is_empty());

        // numkeys larger than what was sent is clamped
        let a = args(&["return 1", "5", "a"]);
        assert_eq!(KeyLayout::Script.key_indices(&a), vec![2]);
    }

    #[test]
    fn test_zset_store_layout() {
        let a = args(&["dest", "2", "z1", "z2", "WEIGHTS", "1", "2"]);
        assert_eq!(KeyLayout::ZsetStore.key_indices(&a), vec![0, 2, 3]);
    }

    #[test]
    fn test_sort_layout() {
        let a = args(&["list", "BY", "w_*", "GET", "#", "GET", "o_*", "STORE", "out"]);
        assert_eq!(KeyLayout::Sort.key_indices(&a), vec![0, 8]);
        assert_eq!(KeyLayout::Sort.prefix_indices(&a), vec![0, 2, 6, 8]);
    }

    #[test]
    fn test_apply_prefix() {
        let mut a = args(&["k1", "v1", "k2", "v2"]);
        KeyLayout::Interleaved.apply_prefix(&mut a, b"app:");
        assert_eq!(a, args(&["app:k1", "v1", "app:k2", "v2"]));

        let mut a = args(&["list", "BY", "nosort", "GET", "#"]);
        KeyLayout::Sort.apply_prefix(&mut a, b"p:");
        assert_eq!(a, args(&["p:list", "BY", "nosort", "GET", "#"]));
    }
}
