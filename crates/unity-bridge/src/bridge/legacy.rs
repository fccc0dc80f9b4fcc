//! Unframed JSON exchange for peers that never advertise framing.
//!
//! Deprecated, best-effort only. There is no length prefix, so a response is
//! considered complete as soon as the accumulated bytes parse as JSON. A
//! response whose `"content"` string carries backslash-escaped quotes the
//! peer failed to encode properly gets one retry with those quotes
//! unescaped. New peers negotiate framing and never reach this path.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::bytes::{Bytes, BytesMut};

use crate::error::TransportError;

/// Prefix of the canned keepalive answer; matched before any parsing.
pub const PONG_PREFIX: &str = r#"{"status":"success","result":{"message":"pong""#;

const READ_CHUNK: usize = 8192;

fn unescape_content(text: &str) -> Option<String> {
    const KEY: &str = "\"content\":";
    let start = text.find(KEY)? + KEY.len();
    let end = text.rfind('"')?;
    if end <= start {
        return None;
    }
    let content = text[start..end].replace("\\\"", "\"");
    Some(format!("{}{}{}", &text[..start], content, &text[end..]))
}

/// Parse a legacy response document, falling back to the escaped-quote
/// fix-up when the raw text does not parse.
pub fn parse_document(data: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(data).ok()?;
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let fixed = unescape_content(text)?;
    serde_json::from_str(&fixed).ok()
}

fn is_complete(data: &[u8]) -> bool {
    if let Ok(text) = std::str::from_utf8(data)
        && text.trim_start().starts_with(PONG_PREFIX)
    {
        return true;
    }
    parse_document(data).is_some()
}

/// Read until the accumulated bytes form a complete document or the peer
/// closes. `buf` may already hold bytes left over from the handshake.
pub async fn read_response<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<Bytes, TransportError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() && is_complete(buf) {
            return Ok(buf.split().freeze());
        }

        buf.reserve(READ_CHUNK);
        let n = tokio::time::timeout(timeout, stream.read_buf(buf))
            .await
            .map_err(|_| TransportError::Timeout { op: "legacy read" })??;

        if n == 0 {
            if buf.is_empty() {
                return Err(TransportError::Closed);
            }
            tracing::debug!(
                bytes = buf.len(),
                "Peer closed before a complete legacy response"
            );
            return Ok(buf.split().freeze());
        }
    }
}
