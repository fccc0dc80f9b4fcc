//! Connect-time negotiation of the wire mode.
//!
//! A peer greets every new connection with a one-line plaintext banner.
//! Framed peers include [`FRAMING_MARKER`]; anything else is a legacy peer.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::BytesMut;

use crate::error::TransportError;

pub const FRAMING_MARKER: &str = "FRAMING=1";
pub const STRICT_ADVISORY: &[u8] = b"Unity MCP requires FRAMING=1\n";
/// Banner reads stop here even without a newline.
pub const BANNER_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    Framed,
    Legacy,
}

#[derive(Debug)]
pub struct Handshake {
    pub mode: WireMode,
    pub banner: String,
    /// Bytes received after the banner line; they belong to the first
    /// message and must be replayed into the reader.
    pub leftover: BytesMut,
}

/// Read the peer banner: up to [`BANNER_CAP`] bytes, stopping at the first
/// newline. A silent peer yields an empty banner once `timeout` elapses.
pub async fn read_banner<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<(String, BytesMut), TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(BANNER_CAP);
    let deadline = tokio::time::Instant::now() + timeout;

    while buf.len() < BANNER_CAP && !buf.contains(&b'\n') {
        let mut chunk = [0u8; BANNER_CAP];
        let want = BANNER_CAP - buf.len();
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Err(_) => break,
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Err(TransportError::Closed);
                }
                break;
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    let line_end = buf
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(buf.len());
    let line = buf.split_to(line_end);
    let banner = String::from_utf8_lossy(&line).trim().to_string();
    Ok((banner, buf))
}

/// Run the handshake on a freshly connected stream.
pub async fn negotiate<S>(
    stream: &mut S,
    timeout: Duration,
    strict_framing: bool,
) -> Result<Handshake, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (banner, leftover) = read_banner(stream, timeout).await?;

    if banner.contains(FRAMING_MARKER) {
        tracing::debug!(banner = %banner, "Peer negotiated framing");
        return Ok(Handshake {
            mode: WireMode::Framed,
            banner,
            leftover,
        });
    }

    if strict_framing {
        // Best effort: the peer may already be gone.
        let _ = stream.write_all(STRICT_ADVISORY).await;
        tracing::warn!(banner = %banner, "Peer did not negotiate framing; strict framing enabled");
        return Err(TransportError::HandshakeRejected { banner });
    }

    tracing::info!(banner = %banner, "Peer did not negotiate framing; using legacy protocol");
    Ok(Handshake {
        mode: WireMode::Legacy,
        banner,
        leftover,
    })
}
