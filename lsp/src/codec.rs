//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! Outbound frames carry a trailing `\r\n` that is counted in `N`. Inbound
//! bodies are sliced to exactly `N` bytes whatever they contain, so frames
//! with or without the trailer decode the same way.
//!
//! [`FrameDecoder`] is incremental: bytes are appended as the pipe yields
//! them, and only complete frames are decoded.

use serde::Serialize;

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A header block longer than this without a terminator is garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

pub(crate) const FRAME_TRAILER: &[u8] = b"\r\n";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value `{0}`")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    TooLarge(usize),
    #[error("header block exceeds {MAX_HEADER_BYTES} bytes without terminator")]
    HeaderTooLong,
    #[error("header is not valid UTF-8")]
    NonUtf8Header,
    #[error("parsing JSON-RPC frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Header for a body of `body_len` bytes; the declared length includes the
/// trailing `\r\n` written after the body.
#[must_use]
pub fn frame_header(body_len: usize) -> String {
    format!("Content-Length: {}\r\n\r\n", body_len + FRAME_TRAILER.len())
}

/// Frame an already-serialized JSON body.
#[must_use]
pub fn encode_body(body: &[u8]) -> Vec<u8> {
    let header = frame_header(body.len());
    let mut out = Vec::with_capacity(header.len() + body.len() + FRAME_TRAILER.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(FRAME_TRAILER);
    out
}

/// Serialize and frame a JSON-RPC message.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    Ok(encode_body(&body))
}

enum Head {
    Incomplete,
    Frame { header_len: usize, body_len: usize },
}

/// Accumulates raw stdout bytes and splits them into JSON-RPC frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// The undecoded bytes themselves.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard everything buffered, returning it.
    pub fn clear(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Body bytes still missing for the frame at the head of the buffer.
    ///
    /// `None` when no header has been seen yet, when the head frame is
    /// complete, or when the header is malformed (decoding reports that).
    #[must_use]
    pub fn missing_body_bytes(&self) -> Option<usize> {
        let start = skip_separators(&self.buf, 0);
        match parse_head(&self.buf[start..]) {
            Ok(Head::Frame {
                header_len,
                body_len,
            }) => {
                let available = self.buf.len() - start - header_len;
                (available < body_len).then(|| body_len - available)
            }
            Ok(Head::Incomplete) | Err(_) => None,
        }
    }

    /// Decode every complete frame in the buffer, oldest first.
    ///
    /// A trailing incomplete frame stays buffered for the next call. On error
    /// the buffer is left untouched and nothing is returned, so the caller
    /// decides what to discard.
    pub fn decode_all(&mut self) -> Result<Vec<serde_json::Value>, FrameError> {
        let mut frames = Vec::new();
        let mut pos = 0;

        loop {
            pos = skip_separators(&self.buf, pos);
            if pos == self.buf.len() {
                break;
            }

            let (header_len, body_len) = match parse_head(&self.buf[pos..])? {
                Head::Incomplete => break,
                Head::Frame {
                    header_len,
                    body_len,
                } => (header_len, body_len),
            };

            let body_start = pos + header_len;
            let body_end = body_start + body_len;
            if body_end > self.buf.len() {
                break;
            }

            frames.push(serde_json::from_slice(&self.buf[body_start..body_end])?);
            pos = body_end;
        }

        self.buf.drain(..pos);
        Ok(frames)
    }
}

/// Skip CR/LF bytes left between frames by peers that do not count them.
fn skip_separators(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && matches!(buf[pos], b'\r' | b'\n') {
        pos += 1;
    }
    pos
}

fn parse_head(buf: &[u8]) -> Result<Head, FrameError> {
    let Some(end) = buf
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
    else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(FrameError::HeaderTooLong);
        }
        return Ok(Head::Incomplete);
    };

    let header = std::str::from_utf8(&buf[..end]).map_err(|_| FrameError::NonUtf8Header)?;
    let mut content_length = None;

    for line in header.split("\r\n") {
        // Header names are case-insensitive.
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            let len: usize = value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        }
        // Ignore other headers (e.g. Content-Type)
    }

    let body_len = content_length.ok_or(FrameError::MissingContentLength)?;
    if body_len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(body_len));
    }

    Ok(Head::Frame {
        header_len: end + HEADER_TERMINATOR.len(),
        body_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[test]
    fn test_roundtrip() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "textDocument/hover",
            "params": { "textDocument": { "uri": "file:///test.rs" } }
        });

        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&msg).unwrap());
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames, vec![msg]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_encoded_length_counts_trailer() {
        let msg = serde_json::json!({"k": "é"});
        let body = serde_json::to_string(&msg).unwrap();
        let output = String::from_utf8(encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(
            output,
            format!("Content-Length: {}\r\n\r\n{body}\r\n", body.len() + 2)
        );
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut buf = encode_frame(&serde_json::json!({"jsonrpc": "2.0", "id": 1})).unwrap();
        buf.extend(exact_frame(r#"{"jsonrpc":"2.0","id":2}"#));
        buf.extend(encode_frame(&serde_json::json!({"jsonrpc": "2.0", "id": 3})).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);
        let ids: Vec<_> = decoder
            .decode_all()
            .unwrap()
            .iter()
            .map(|f| f["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_body_prefix_waits_for_rest() {
        let frame = exact_frame(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#);
        let split = frame.len() - 37;

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..split]);
        assert!(decoder.decode_all().unwrap().is_empty());
        assert_eq!(decoder.missing_body_bytes(), Some(37));

        decoder.extend(&frame[split..]);
        assert_eq!(decoder.missing_body_bytes(), None);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], 7);
    }

    #[test]
    fn test_partial_header_is_incomplete() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Len");
        assert!(decoder.decode_all().unwrap().is_empty());
        assert_eq!(decoder.missing_body_bytes(), None);
        assert_eq!(decoder.buffered(), 11);
    }

    #[test]
    fn test_complete_frame_then_partial_keeps_remainder() {
        let mut buf = exact_frame(r#"{"id":1}"#);
        buf.extend_from_slice(b"Content-Length: 40\r\n\r\n{\"id\"");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.missing_body_bytes(), Some(35));
    }

    #[test]
    fn test_embedded_delimiter_in_body() {
        let body = r#"{"text":"Content-Length: 2\r\n\r\n{}"}"#;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&exact_frame(body));
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "Content-Length: 2\r\n\r\n{}");
    }

    #[test]
    fn test_missing_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Type: application/json\r\n\r\n{}");
        assert!(matches!(
            decoder.decode_all(),
            Err(FrameError::MissingContentLength)
        ));
        // Nothing is dropped on error; the caller decides.
        assert!(!decoder.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1).as_bytes());
        assert!(matches!(decoder.decode_all(), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_runaway_header_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&vec![b'x'; MAX_HEADER_BYTES + 1]);
        assert!(matches!(
            decoder.decode_all(),
            Err(FrameError::HeaderTooLong)
        ));
    }

    #[test]
    fn test_case_insensitive_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let mut decoder = FrameDecoder::new();
        decoder.extend(format!("content-length: {}\r\n\r\n{body}", body.len()).as_bytes());
        assert_eq!(decoder.decode_all().unwrap()[0]["id"], 1);
    }

    #[test]
    fn test_ignores_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len(),
        );
        let mut decoder = FrameDecoder::new();
        decoder.extend(frame.as_bytes());
        assert_eq!(decoder.decode_all().unwrap()[0]["id"], 1);
    }

    #[test]
    fn test_invalid_content_length_value() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: not_a_number\r\n\r\n");
        assert!(matches!(
            decoder.decode_all(),
            Err(FrameError::InvalidContentLength(v)) if v == "not_a_number"
        ));
    }

    #[test]
    fn test_invalid_json_body() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&exact_frame("not valid json!!!"));
        assert!(matches!(decoder.decode_all(), Err(FrameError::Json(_))));
    }

    #[test]
    fn test_bad_frame_after_good_one_delivers_nothing() {
        let mut buf = exact_frame(r#"{"id":1}"#);
        buf.extend(exact_frame("{broken"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);
        assert!(decoder.decode_all().is_err());
        assert_eq!(decoder.clear(), buf);
    }

    #[test]
    fn test_multibyte_utf8_content_length_counts_bytes() {
        // "é" is 2 bytes in UTF-8, so {"k":"é"} is 10 bytes.
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&exact_frame(body));
        assert_eq!(decoder.decode_all().unwrap()[0]["k"], "é");
    }
}
