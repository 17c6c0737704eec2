//! Key to filename mapping.

use std::fmt::{self, Write};

/// Maps arbitrary keys to filesystem-safe file stems.
///
/// Implementations must be deterministic; distinct keys used in one store
/// must not map to the same stem.
pub trait KeySanitizer: Send + Sync + fmt::Debug {
    fn sanitize(&self, key: &str) -> String;

    /// Recover the key a stem was produced from, if the mapping is
    /// reversible. Used when adopting value files the log does not know.
    fn restore(&self, _stem: &str) -> Option<String> {
        None
    }
}

/// Percent-encodes path separators, characters reserved on common
/// filesystems, control characters, `%` itself and a leading `_`.
///
/// The mapping is reversible, so distinct keys never share a file. Stems
/// never start with `_`, which keeps keys clear of store bookkeeping files.
/// The empty key maps to `%` and the `.`/`..` keys are fully escaped.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSanitizer;

const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '%'];

fn escape(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    for byte in c.encode_utf8(&mut buf).bytes() {
        let _ = write!(out, "%{byte:02X}");
    }
}

impl KeySanitizer for DefaultSanitizer {
    fn sanitize(&self, key: &str) -> String {
        match key {
            "" => return "%".to_string(),
            "." => return "%2E".to_string(),
            ".." => return "%2E%2E".to_string(),
            _ => {}
        }

        let mut out = String::with_capacity(key.len());
        for (i, c) in key.chars().enumerate() {
            if RESERVED.contains(&c) || c.is_control() || (i == 0 && c == '_') {
                escape(&mut out, c);
            } else {
                out.push(c);
            }
        }
        out
    }

    fn restore(&self, stem: &str) -> Option<String> {
        if stem == "%" {
            return Some(String::new());
        }

        let mut bytes = Vec::with_capacity(stem.len());
        let mut rest = stem.as_bytes();
        while let Some((&b, tail)) = rest.split_first() {
            if b == b'%' {
                let digits = std::str::from_utf8(tail.get(..2)?).ok()?;
                bytes.push(u8::from_str_radix(digits, 16).ok()?);
                rest = &tail[2..];
            } else {
                bytes.push(b);
                rest = tail;
            }
        }
        String::from_utf8(bytes).ok()
    }
}
