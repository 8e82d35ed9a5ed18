//! The ad-hoc textual "record" format used in many packet bodies:
//! fields are `key=value` joined by `\n`, records are joined by byte `0xc8`.
//!
//! `0xc8` is not a valid standalone byte in a UTF-8 `char` sequence boundary
//! sense when pushed via `char::from(0xc8)` — that encodes as the two bytes
//! `0xc3 0x88` in UTF-8, not the single separator byte the wire format
//! requires. `RecordBuf` therefore builds raw bytes, not a `String`.

use bytes::{BufMut, BytesMut};

pub const VALUE_SEP: char = '=';
pub const FIELD_SEP: char = '\n';
pub const RECORD_SEP: u8 = 0xc8;

/// Growable record-format builder, mirroring `append_value`/`append_field`/
/// `append_record`/`prepend_record` from the original string-realloc API.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordBuf(BytesMut);

impl RecordBuf {
    pub fn new() -> Self {
        Self(BytesMut::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Appends `v` followed by the field separator. No-op if `v` is empty.
    pub fn append_value(&mut self, v: &str) -> &mut Self {
        if !v.is_empty() {
            self.0.extend_from_slice(v.as_bytes());
            self.0.put_u8(FIELD_SEP as u8);
        }
        self
    }

    /// Appends `k=v` followed by the field separator. No-op if either is empty.
    pub fn append_field(&mut self, k: &str, v: &str) -> &mut Self {
        if !k.is_empty() && !v.is_empty() {
            self.0.extend_from_slice(k.as_bytes());
            self.0.put_u8(VALUE_SEP as u8);
            self.0.extend_from_slice(v.as_bytes());
            self.0.put_u8(FIELD_SEP as u8);
        }
        self
    }

    /// Appends `r` followed by the record separator. No-op if `r` is empty.
    pub fn append_record(&mut self, r: &[u8]) -> &mut Self {
        if !r.is_empty() {
            self.0.extend_from_slice(r);
            self.0.put_u8(RECORD_SEP);
        }
        self
    }

    /// Prepends `s` followed by the record separator ahead of the current content.
    pub fn prepend_record(&mut self, s: &[u8]) -> &mut Self {
        if !s.is_empty() {
            let mut out = BytesMut::with_capacity(s.len() + 1 + self.0.len());
            out.extend_from_slice(s);
            out.put_u8(RECORD_SEP);
            out.extend_from_slice(&self.0);
            self.0 = out;
        }
        self
    }
}

/// Invokes `cb` with (1-based index, field) for each `\n`-separated field.
pub fn each_field<'a>(s: &'a str, mut cb: impl FnMut(usize, &'a str)) {
    if s.is_empty() {
        return;
    }
    for (i, f) in s.split(FIELD_SEP).enumerate() {
        cb(i + 1, f);
    }
}

/// Invokes `cb` with (key, value) for each `\n`-separated `key=value` field.
/// A field with no `=` yields `(field, None)`.
pub fn each_field_kv<'a>(s: &'a str, mut cb: impl FnMut(&'a str, Option<&'a str>)) {
    if s.is_empty() {
        return;
    }
    for f in s.split(FIELD_SEP) {
        match f.split_once(VALUE_SEP) {
            Some((k, v)) => cb(k, Some(v)),
            None => cb(f, None),
        }
    }
}

/// Invokes `cb` with each `0xc8`-separated record. Stops early if `cb` returns
/// false. Operates on raw bytes -- a multi-record body is not valid UTF-8 in
/// general (`0xc8` is a UTF-8 lead byte with no guaranteed continuation), so
/// this can't be done through `str::split`.
pub fn each_record<'a>(s: &'a [u8], mut cb: impl FnMut(&'a [u8]) -> bool) {
    if s.is_empty() {
        return;
    }
    for r in s.split(|&b| b == RECORD_SEP) {
        if !cb(r) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_value_skips_empty() {
        let mut r = RecordBuf::new();
        r.append_value("").append_value("x");
        assert_eq!(r.as_bytes(), b"x\n");
    }

    #[test]
    fn append_field_round_trip() {
        let mut r = RecordBuf::new();
        r.append_field("uid", "42").append_field("nickname", "alice");
        assert_eq!(r.as_bytes(), b"uid=42\nnickname=alice\n");

        let text = std::str::from_utf8(r.as_bytes()).unwrap().trim_end_matches(FIELD_SEP);
        let mut seen = vec![];
        each_field_kv(text, |k, v| {
            seen.push((k.to_string(), v.map(str::to_string)));
        });
        assert_eq!(
            seen,
            vec![
                ("uid".to_string(), Some("42".to_string())),
                ("nickname".to_string(), Some("alice".to_string())),
            ]
        );
    }

    #[test]
    fn append_record_and_prepend() {
        let mut r = RecordBuf::new();
        r.append_record(b"one").append_record(b"two");
        r.prepend_record(b"zero");
        let bytes = r.into_inner();
        let trimmed = bytes.strip_suffix(&[RECORD_SEP]).unwrap_or(&bytes);
        let recs: Vec<&[u8]> = trimmed.split(|&b| b == RECORD_SEP).collect();
        assert_eq!(recs, vec![b"zero".as_slice(), b"one".as_slice(), b"two".as_slice()]);
    }

    #[test]
    fn append_record_pushes_a_single_separator_byte() {
        let mut r = RecordBuf::new();
        r.append_record(b"a").append_record(b"b");
        let bytes = r.into_inner();
        assert_eq!(bytes, vec![b'a', RECORD_SEP, b'b', RECORD_SEP]);
    }

    #[test]
    fn each_record_short_circuit() {
        let s = [b"a".as_slice(), &[RECORD_SEP], b"b", &[RECORD_SEP], b"c"].concat();
        let mut seen = vec![];
        each_record(&s, |r| {
            seen.push(r.to_vec());
            r != b"b"
        });
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
