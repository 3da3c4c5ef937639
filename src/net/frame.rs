//! KLV text frame codec.
//!
//! A frame is UTF-8 text: one `KEY: value` field per line, terminated by a
//! blank line (`\n\n`). Values may contain spaces but never newlines; binary
//! payloads travel base64-encoded inside a value. The codec moves fields in
//! and out without interpreting their semantics — typed validation happens
//! one layer up in [`super::message`].

use thiserror::Error;

/// Why a datagram failed to decode into a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("frame lacks the blank-line terminator")]
    NoTerminator,
    #[error("line without a key separator: {0:?}")]
    UnparsableLine(String),
    #[error("frame has no TYPE field")]
    MissingType,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {0} failed to parse")]
    BadField(&'static str),
}

/// An ordered key/value view of one datagram.
///
/// Insertion order is preserved so encoded frames read the way they were
/// built (TYPE first). Lookup is linear; frames carry at most a couple
/// dozen fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fields: Vec<(String, String)>,
}

impl Frame {
    /// Start a frame of the given TYPE.
    pub fn new(msg_type: &str) -> Self {
        Self { fields: vec![("TYPE".to_string(), msg_type.to_string())] }
    }

    /// Append a field. Keys are not deduplicated; the first occurrence wins
    /// on lookup, matching how the decoder reads duplicated keys.
    pub fn push(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get("TYPE")
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decode a datagram. The frame body is everything before the first
    /// blank line; trailing bytes after the terminator are ignored. Parsers
    /// accept any whitespace after the `:` and tolerate `\r\n` endings.
    pub fn parse(raw: &[u8]) -> Result<Frame, FrameError> {
        let text = std::str::from_utf8(raw).map_err(|_| FrameError::NotUtf8)?;
        let body = match text.find("\n\n").or_else(|| text.find("\r\n\r\n")) {
            Some(end) => &text[..end],
            None => return Err(FrameError::NoTerminator),
        };

        let mut fields = Vec::new();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::UnparsableLine(line.to_string()))?;
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }

        let frame = Frame { fields };
        if frame.msg_type().is_none() {
            return Err(FrameError::MissingType);
        }
        Ok(frame)
    }

    /// Encode: `KEY: value` lines in insertion order, blank-line terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_fields_and_type() {
        let mut frame = Frame::new("DM");
        frame
            .push("FROM", "alice@192.168.1.7:50999")
            .push("TO", "bob@192.168.1.9:51000")
            .push("CONTENT", "hello over the LAN")
            .push("MESSAGE_ID", "abcd1234");

        let decoded = Frame::parse(&frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.msg_type(), Some("DM"));
        assert_eq!(decoded.get("CONTENT"), Some("hello over the LAN"));
    }

    #[test]
    fn test_parse_tolerates_loose_whitespace() {
        let raw = b"TYPE:   PING\r\nUSER_ID:alice@10.0.0.2:50999\r\n\r\n";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.msg_type(), Some("PING"));
        assert_eq!(frame.get("USER_ID"), Some("alice@10.0.0.2:50999"));
    }

    #[test]
    fn test_parse_requires_terminator() {
        assert_eq!(
            Frame::parse(b"TYPE: PING\nUSER_ID: a@10.0.0.2\n"),
            Err(FrameError::NoTerminator)
        );
    }

    #[test]
    fn test_parse_requires_type() {
        assert_eq!(
            Frame::parse(b"USER_ID: a@10.0.0.2\n\n"),
            Err(FrameError::MissingType)
        );
    }

    #[test]
    fn test_parse_rejects_keyless_line() {
        let err = Frame::parse(b"TYPE: PING\njunk line\n\n").unwrap_err();
        assert!(matches!(err, FrameError::UnparsableLine(_)));
    }

    #[test]
    fn test_value_keeps_interior_spaces() {
        let raw = b"TYPE: POST\nUSER_ID: a@10.0.0.2:50999\nCONTENT: two  spaced words\n\n";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.get("CONTENT"), Some("two  spaced words"));
    }

    #[test]
    fn test_bytes_after_terminator_ignored() {
        let raw = b"TYPE: PING\nUSER_ID: a@10.0.0.2\n\nGARBAGE: yes\n\n";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.get("GARBAGE"), None);
    }
}
