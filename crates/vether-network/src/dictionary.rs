//! Deterministic key=value dictionary, the network config wire form.
//!
//! One entry per line, `key=value\n`, keys sorted. Values are escaped so
//! arbitrary bytes survive: `\\`, `\n` (newline), `\r`, `\0`, and `\e` for
//! `=`. Determinism matters because the controller signature covers the
//! serialized bytes.

use std::collections::BTreeMap;

/// An ordered string-keyed dictionary with binary-safe values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn set_bytes(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set_bytes(key, value.as_bytes().to_vec());
    }

    /// Integers are stored as lowercase hex (no leading zeros trimmed off
    /// zero itself).
    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_str(key, &format!("{value:x}"));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_str(key, if value { "1" } else { "0" });
    }

    #[must_use]
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        u64::from_str_radix(self.get_str(key)?, 16).ok()
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_str(key)? {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            escape_into(&mut out, key.as_bytes());
            out.push(b'=');
            escape_into(&mut out, value);
            out.push(b'\n');
        }
        out
    }

    /// Parse serialized dictionary bytes. Unparseable lines are skipped;
    /// the signature check on the enclosing object is what detects real
    /// corruption.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        let mut dict = Self::new();
        for line in split_unescaped(bytes, b'\n') {
            if line.is_empty() {
                continue;
            }
            let mut parts = split_unescaped(line, b'=');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(key) = String::from_utf8(unescape(key)) else {
                continue;
            };
            dict.entries.insert(key, unescape(value));
        }
        dict
    }
}

fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0 => out.extend_from_slice(b"\\0"),
            b'=' => out.extend_from_slice(b"\\e"),
            other => out.push(other),
        }
    }
}

fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'0') => out.push(0),
            Some(b'e') => out.push(b'='),
            // Unknown escape or trailing backslash: drop it.
            _ => {}
        }
    }
    out
}

/// Split on `sep`, ignoring separators preceded by an odd run of backslashes.
fn split_unescaped(bytes: &[u8], sep: u8) -> impl Iterator<Item = &[u8]> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == sep {
            pieces.push(&bytes[start..i]);
            start = i + 1;
        }
    }
    if start <= bytes.len() {
        pieces.push(&bytes[start..]);
    }
    pieces.into_iter()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn any_value_roundtrips(
            key in "[a-z][a-z0-9]{0,12}",
            value in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut dict = Dictionary::new();
            dict.set_bytes(&key, value.clone());
            let parsed = Dictionary::parse(&dict.serialize());
            prop_assert_eq!(parsed.get_bytes(&key), Some(value.as_slice()));
        }

        #[test]
        fn parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Dictionary::parse(&bytes);
        }
    }
}
