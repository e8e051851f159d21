use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;

lazy_static! {
    // bearer headers, cookie pairs, and JSON token fields
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(Bearer\s+[^\s",;]+|(access_token|refresh_token)=[^\s",;]+|"(access_token|refresh_token)"\s*:\s*"[^"]*")"#
    ).expect("Invalid redaction regex");
}

/// Scrubs credentials from formatted log lines before they reach the sink.
pub fn redact(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_and_cookie_tokens() {
        let line = "GET /x Authorization: Bearer eyJhbGci.abc cookie: access_token=aaa; refresh_token=bbb";
        let out = redact(line);
        assert!(!out.contains("eyJhbGci"));
        assert!(!out.contains("aaa"));
        assert!(!out.contains("bbb"));
        assert!(out.contains("GET /x"));
    }

    #[test]
    fn redacts_json_token_fields() {
        let out = redact(r#"{"access_token":"x1","refresh_token": "y2","ok":true}"#);
        assert_eq!(out, r#"{[REDACTED],[REDACTED],"ok":true}"#);
    }

    #[test]
    fn writer_passes_through_clean_text() {
        let mut sink = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut sink);
            writer.write_all(b"plain line\n").unwrap();
        }
        assert_eq!(sink, b"plain line\n");
    }
}
