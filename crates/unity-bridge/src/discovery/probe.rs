//! Protocol-level liveness check.
//!
//! A port is alive only when something on it completes the handshake and
//! answers a ping with a pong. An open socket alone is not enough.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, FramedParts};

use crate::bridge::codec::{Frame, FrameCodec};
use crate::bridge::handshake::{self, WireMode};
use crate::bridge::legacy;
use crate::bridge::protocol::PING_PAYLOAD;

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Never errors: any failure reads as "not alive".
    async fn is_alive(&self, port: u16) -> bool;
}

/// Probes `127.0.0.1:<port>` over TCP.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn ping(&self, port: u16) -> Option<()> {
        let step = self.timeout;
        let mut stream = tokio::time::timeout(step, TcpStream::connect(("127.0.0.1", port)))
            .await
            .ok()?
            .ok()?;
        let _ = stream.set_nodelay(true);

        let hs = handshake::negotiate(&mut stream, step, false).await.ok()?;
        let reply = match hs.mode {
            WireMode::Framed => {
                let mut parts = FramedParts::new(stream, FrameCodec::new());
                parts.read_buf = hs.leftover;
                let mut framed = Framed::from_parts(parts);

                tokio::time::timeout(step, framed.send(Bytes::from_static(PING_PAYLOAD)))
                    .await
                    .ok()?
                    .ok()?;
                // One deadline for the whole read; heartbeats do not extend it.
                let read = async {
                    loop {
                        match framed.next().await? {
                            Ok(Frame::Heartbeat) => continue,
                            Ok(Frame::Payload(payload)) => return Some(payload),
                            Err(_) => return None,
                        }
                    }
                };
                tokio::time::timeout(step, read).await.ok()??
            }
            WireMode::Legacy => {
                tokio::time::timeout(step, stream.write_all(PING_PAYLOAD))
                    .await
                    .ok()?
                    .ok()?;
                let mut buf = hs.leftover;
                tokio::time::timeout(step, legacy::read_response(&mut stream, &mut buf, step))
                    .await
                    .ok()?
                    .ok()?
            }
        };

        let text = String::from_utf8_lossy(&reply);
        text.to_ascii_lowercase().contains("pong").then_some(())
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn is_alive(&self, port: u16) -> bool {
        let alive = self.ping(port).await.is_some();
        tracing::trace!(port, alive, "Probed port");
        alive
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Answers from a fixed set of live ports and records every call.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub(crate) alive: HashSet<u16>,
        pub(crate) calls: Mutex<Vec<u16>>,
    }

    impl FakeProbe {
        pub(crate) fn with_alive(ports: &[u16]) -> Self {
            Self {
                alive: ports.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<u16> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LivenessProbe for FakeProbe {
        async fn is_alive(&self, port: u16) -> bool {
            self.calls.lock().unwrap().push(port);
            self.alive.contains(&port)
        }
    }

    #[tokio::test]
    async fn framed_peer_answering_pong_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n").await.unwrap();
            let mut header = [0u8; 8];
            sock.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; u64::from_be_bytes(header) as usize];
            sock.read_exact(&mut body).await.unwrap();
            assert_eq!(body, b"ping");

            let reply = br#"{"status":"success","result":{"message":"pong"}}"#;
            sock.write_all(&0u64.to_be_bytes()).await.unwrap();
            sock.write_all(&(reply.len() as u64).to_be_bytes()).await.unwrap();
            sock.write_all(reply).await.unwrap();
        });

        assert!(TcpProbe::new(Duration::from_millis(500)).is_alive(port).await);
    }

    #[tokio::test]
    async fn legacy_peer_answering_pong_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME UNITY-MCP 1\n").await.unwrap();
            let mut ping = [0u8; 4];
            sock.read_exact(&mut ping).await.unwrap();
            sock.write_all(br#"{"status":"success","result":{"message":"pong"}}"#)
                .await
                .unwrap();
        });

        assert!(TcpProbe::new(Duration::from_millis(500)).is_alive(port).await);
    }

    #[tokio::test]
    async fn open_socket_that_never_answers_is_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });

        assert!(!TcpProbe::new(Duration::from_millis(100)).is_alive(port).await);
    }

    #[tokio::test]
    async fn endless_heartbeats_are_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n").await.unwrap();
            let mut header = [0u8; 8];
            sock.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; u64::from_be_bytes(header) as usize];
            sock.read_exact(&mut body).await.unwrap();
            loop {
                if sock.write_all(&0u64.to_be_bytes()).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let probe = TcpProbe::new(Duration::from_millis(100));
        let alive = tokio::time::timeout(Duration::from_secs(2), probe.is_alive(port))
            .await
            .expect("probe must give up on a heartbeat-only peer");
        assert!(!alive);
    }

    #[tokio::test]
    async fn closed_port_is_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!TcpProbe::new(Duration::from_millis(100)).is_alive(port).await);
    }
}
