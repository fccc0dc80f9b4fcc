//! One open socket in its negotiated wire mode.

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Framed, FramedParts};

use crate::bridge::codec::{Frame, FrameCodec};
use crate::bridge::handshake::{self, WireMode};
use crate::bridge::legacy;
use crate::config::ConnectionConfig;
use crate::error::TransportError;

pub(crate) enum Transport {
    Framed(Framed<TcpStream, FrameCodec>),
    Legacy { stream: TcpStream, buf: BytesMut },
}

impl Transport {
    /// Connect to `127.0.0.1:<port>` and run the handshake.
    pub(crate) async fn open(port: u16, config: &ConnectionConfig) -> Result<Self, TransportError> {
        let mut stream = timeout(
            config.connect_timeout,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map_err(|_| TransportError::Timeout { op: "connect" })?
        .map_err(|source| TransportError::Connect { port, source })?;
        stream.set_nodelay(true)?;

        let hs =
            handshake::negotiate(&mut stream, config.handshake_timeout, config.strict_framing)
                .await?;

        Ok(match hs.mode {
            WireMode::Framed => {
                let mut parts = FramedParts::new(stream, FrameCodec::new());
                parts.read_buf = hs.leftover;
                Self::Framed(Framed::from_parts(parts))
            }
            WireMode::Legacy => Self::Legacy {
                stream,
                buf: hs.leftover,
            },
        })
    }

    pub(crate) fn mode(&self) -> WireMode {
        match self {
            Self::Framed(_) => WireMode::Framed,
            Self::Legacy { .. } => WireMode::Legacy,
        }
    }

    /// Send one request and read exactly one response.
    ///
    /// In framed mode heartbeat frames are skipped. Once more than
    /// `max_heartbeat_frames` arrive, or `heartbeat_deadline` passes after
    /// the first one, the read gives up and returns an empty payload.
    pub(crate) async fn round_trip(
        &mut self,
        payload: Bytes,
        config: &ConnectionConfig,
    ) -> Result<Bytes, TransportError> {
        match self {
            Self::Framed(framed) => {
                timeout(config.read_timeout, framed.send(payload))
                    .await
                    .map_err(|_| TransportError::Timeout { op: "write" })??;
                read_framed(framed, config).await
            }
            Self::Legacy { stream, buf } => {
                timeout(config.read_timeout, stream.write_all(&payload))
                    .await
                    .map_err(|_| TransportError::Timeout { op: "write" })??;
                legacy::read_response(stream, buf, config.read_timeout).await
            }
        }
    }

    pub(crate) async fn shutdown(self) {
        let result = match self {
            Self::Framed(framed) => framed.into_inner().shutdown().await,
            Self::Legacy { mut stream, .. } => stream.shutdown().await,
        };
        if let Err(e) = result {
            tracing::trace!(error = %e, "Socket shutdown failed");
        }
    }
}

async fn read_framed(
    framed: &mut Framed<TcpStream, FrameCodec>,
    config: &ConnectionConfig,
) -> Result<Bytes, TransportError> {
    let mut heartbeats = 0u32;
    let mut deadline: Option<Instant> = None;

    loop {
        let wait = match deadline {
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .min(config.read_timeout),
            None => config.read_timeout,
        };

        let next = match timeout(wait, framed.next()).await {
            Ok(next) => next,
            Err(_) if deadline.is_some() => {
                tracing::warn!(heartbeats, "Heartbeat deadline passed without a response");
                return Ok(Bytes::new());
            }
            Err(_) => return Err(TransportError::Timeout { op: "read" }),
        };

        match next {
            None => return Err(TransportError::Closed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Frame::Payload(payload))) => return Ok(payload),
            Some(Ok(Frame::Heartbeat)) => {
                heartbeats += 1;
                let d = *deadline.get_or_insert_with(|| Instant::now() + config.heartbeat_deadline);
                if heartbeats > config.max_heartbeat_frames || Instant::now() >= d {
                    tracing::warn!(heartbeats, "Too many heartbeat frames without a response");
                    return Ok(Bytes::new());
                }
            }
        }
    }
}
