//! A pooled connection to one Unity editor.
//!
//! Two locks guard a connection. `lifecycle` serializes connect and
//! disconnect so two callers never race to open sockets. `io` owns the
//! socket itself and is held for exactly one request/response exchange.
//!
//! This is the one place two locks are held together: connect and
//! disconnect take `lifecycle`, then `io` briefly to install or clear the
//! socket. An exchange takes `io` alone and never reaches for `lifecycle`,
//! so the order cannot invert.
//!
//! Connection states:
//!
//! ```text
//! Disconnected -> Connecting -> Negotiated(framed | legacy) -> Ready
//!       ^                                                        |
//!       +------------------------- any error --------------------+
//! ```

pub mod retry;
mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;

pub use retry::{Backoff, FailureClass};
use transport::Transport;

use crate::bridge::handshake::WireMode;
use crate::bridge::protocol::{PeerRequest, PeerResponse};
use crate::config::ConnectionConfig;
use crate::discovery::{Discovery, InstanceInfo};
use crate::error::{CommandError, TransportError};

pub struct Connection {
    instance_id: Option<String>,
    project_hash: Option<String>,
    port: AtomicU16,
    config: ConnectionConfig,
    discovery: Arc<Discovery>,
    lifecycle: Mutex<()>,
    io: Mutex<Option<Transport>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("instance_id", &self.instance_id)
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(port: u16, config: ConnectionConfig, discovery: Arc<Discovery>) -> Self {
        Self {
            instance_id: None,
            project_hash: None,
            port: AtomicU16::new(port),
            config,
            discovery,
            lifecycle: Mutex::new(()),
            io: Mutex::new(None),
        }
    }

    /// Connection bound to a discovered instance. Reload checks and port
    /// rediscovery use that instance's own status file.
    pub fn for_instance(
        instance: &InstanceInfo,
        config: ConnectionConfig,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            instance_id: Some(instance.id.clone()),
            project_hash: Some(instance.hash.clone()),
            ..Self::new(instance.port, config, discovery)
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Record a new port. An open socket is left alone; the new port takes
    /// effect on the next connect.
    pub fn set_port(&self, port: u16) {
        let old = self.port.swap(port, Ordering::AcqRel);
        if old != port {
            tracing::info!(instance = ?self.instance_id, old, new = port, "Instance port changed");
        }
    }

    /// Negotiated wire mode, or `None` while disconnected.
    pub async fn mode(&self) -> Option<WireMode> {
        self.io.lock().await.as_ref().map(Transport::mode)
    }

    pub async fn is_connected(&self) -> bool {
        self.io.lock().await.is_some()
    }

    /// Open the socket if it is not already open.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.io.lock().await.is_some() {
            return Ok(());
        }

        let port = self.port();
        let transport = Transport::open(port, &self.config).await?;
        tracing::debug!(
            port,
            instance = ?self.instance_id,
            mode = ?transport.mode(),
            "Connected to Unity"
        );
        *self.io.lock().await = Some(transport);
        Ok(())
    }

    /// Close the socket. The next call reconnects.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let transport = self.io.lock().await.take();
        if let Some(transport) = transport {
            transport.shutdown().await;
            tracing::debug!(instance = ?self.instance_id, "Disconnected from Unity");
        }
    }

    /// One send/receive under the IO lock. Any transport failure, including
    /// a reply that does not decode, drops the socket.
    async fn exchange(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        self.connect().await?;

        let payload = request
            .to_payload()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut io = self.io.lock().await;
        let Some(transport) = io.as_mut() else {
            return Err(TransportError::Closed);
        };

        let reply = match transport.round_trip(Bytes::from(payload), &self.config).await {
            Ok(reply) => reply,
            Err(e) => {
                *io = None;
                return Err(e);
            }
        };
        if reply.is_empty() {
            // A late reply would otherwise answer the next request.
            *io = None;
        }
        let response = PeerResponse::decode(&reply);
        if response.is_err() {
            // Unread bytes of a broken reply would corrupt the next exchange.
            *io = None;
        }
        response
    }

    /// Port the instance should be reached on now, per the registry.
    async fn rediscover(&self) {
        let port = match self.project_hash.as_deref() {
            Some(hash) => match self.discovery.read_status(Some(hash)).await {
                Some(status) => status.unity_port,
                None => return,
            },
            None => self.discovery.discover_port().await,
        };
        self.set_port(port);
    }

    async fn peer_reloading(&self) -> bool {
        self.discovery
            .read_status(self.project_hash.as_deref())
            .await
            .is_some_and(|s| s.is_reloading())
    }

    /// Send `request`, retrying transport failures with backoff.
    ///
    /// Commands are short-circuited with [`CommandError::Reloading`] when the
    /// peer's status file says it is reloading. Error responses from the peer
    /// are returned as-is and never retried here.
    pub async fn send(&self, request: &PeerRequest) -> Result<Value, CommandError> {
        if !request.is_ping() && self.peer_reloading().await {
            tracing::debug!(command = request.name(), "Peer is reloading; skipping send");
            return Err(CommandError::reloading(
                "Unity is reloading; please retry",
                Some(self.config.reload_retry_interval),
            ));
        }

        let backoff = Backoff::new(self.config.backoff_base);
        let mut attempt = 0;
        loop {
            let err = match self.exchange(request).await {
                Ok(response) => return response.into_result(request),
                Err(e) => e,
            };

            self.rediscover().await;
            if attempt >= self.config.max_retries {
                tracing::warn!(
                    command = request.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "Giving up on Unity command"
                );
                return Err(err.into());
            }

            let class = FailureClass::classify(&err, self.peer_reloading().await);
            let delay = backoff.delay(attempt, class);
            tracing::debug!(
                command = request.name(),
                attempt,
                ?class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying Unity command"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Send one command and return its `result`.
    pub async fn send_command(
        &self,
        command_type: &str,
        params: Value,
    ) -> Result<Value, CommandError> {
        self.send(&PeerRequest::command(command_type, params)).await
    }

    /// [`send_command`](Self::send_command), polling through domain reloads
    /// until the peer answers or the reload retry budget runs out.
    pub async fn send_command_with_retry(
        &self,
        command_type: &str,
        params: Value,
    ) -> Result<Value, CommandError> {
        let request = PeerRequest::command(command_type, params);
        let mut attempt = 0;
        loop {
            match self.send(&request).await {
                Err(CommandError::Reloading { retry_after, .. })
                    if attempt < self.config.reload_max_retries =>
                {
                    let wait = retry_after.unwrap_or(self.config.reload_retry_interval);
                    tracing::debug!(
                        command = command_type,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Unity is reloading; waiting"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Keepalive exchange; succeeds only on a pong.
    pub async fn ping(&self) -> Result<(), CommandError> {
        self.send(&PeerRequest::Ping).await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::bridge::codec::{FrameError, MAX_FRAME_LEN};
    use crate::discovery::Registry;
    use crate::discovery::probe::tests::FakeProbe;
    use crate::discovery::registry::tests::write_with_mtime;

    pub(crate) fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(2),
            heartbeat_deadline: Duration::from_millis(300),
            max_heartbeat_frames: 16,
            strict_framing: false,
            max_retries: 0,
            backoff_base: Duration::from_millis(10),
            reload_max_retries: 40,
            reload_retry_interval: Duration::from_millis(10),
        }
    }

    pub(crate) fn empty_discovery(dir: &std::path::Path) -> Arc<Discovery> {
        Arc::new(Discovery::new(
            Registry::new(dir),
            Arc::new(FakeProbe::default()),
        ))
    }

    pub(crate) async fn read_frame(sock: &mut TcpStream) -> Option<Vec<u8>> {
        let mut header = [0u8; 8];
        sock.read_exact(&mut header).await.ok()?;
        let mut body = vec![0u8; u64::from_be_bytes(header) as usize];
        sock.read_exact(&mut body).await.ok()?;
        Some(body)
    }

    pub(crate) async fn write_frame(sock: &mut TcpStream, body: &[u8]) {
        sock.write_all(&(body.len() as u64).to_be_bytes()).await.unwrap();
        sock.write_all(body).await.unwrap();
    }

    fn foo_on(port: u16) -> InstanceInfo {
        InstanceInfo {
            id: "Foo@abc".to_string(),
            name: "Foo".to_string(),
            path: "/w/Foo/Assets".to_string(),
            hash: "abc".to_string(),
            port,
            status: crate::discovery::InstanceStatus::Running,
            last_heartbeat: None,
            unity_version: None,
            enabled_tools: None,
        }
    }

    /// Framed peer that answers every command with `respond(n, request)`,
    /// where `n` counts commands across all connections.
    pub(crate) async fn spawn_framed_peer<F>(respond: F) -> (u16, Arc<AtomicUsize>)
    where
        F: Fn(usize, Value) -> Value + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let count = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);
        let counter = count.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let respond = respond.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    sock.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n").await.unwrap();
                    while let Some(body) = read_frame(&mut sock).await {
                        let reply = if body == b"ping" {
                            json!({"status": "success", "result": {"message": "pong"}})
                        } else {
                            let request: Value = serde_json::from_slice(&body).unwrap();
                            let n = counter.fetch_add(1, Ordering::SeqCst);
                            (*respond)(n, request)
                        };
                        write_frame(&mut sock, &serde_json::to_vec(&reply).unwrap()).await;
                    }
                });
            }
        });
        (port, count)
    }

    #[tokio::test]
    async fn framed_command_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _) = spawn_framed_peer(|_, req| {
            json!({"status": "success", "result": {"echo": req["params"]["name"]}})
        })
        .await;
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let result = conn
            .send_command("manage_scene", json!({"name": "Main"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "Main"}));
        assert_eq!(conn.mode().await, Some(WireMode::Framed));
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn peer_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (port, count) = spawn_framed_peer(|_, _| {
            json!({"status": "error", "error": "GameObject not found"})
        })
        .await;
        let config = ConnectionConfig {
            max_retries: 3,
            ..test_config()
        };
        let conn = Connection::new(port, config, empty_discovery(dir.path()));

        let err = conn.send_command("find", json!({})).await.unwrap_err();
        assert!(matches!(err, CommandError::Peer { ref message } if message == "GameObject not found"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reload_responses_are_polled_until_success() {
        const RELOADS: usize = 3;
        let dir = tempfile::tempdir().unwrap();
        let (port, count) = spawn_framed_peer(|n, _| {
            if n < RELOADS {
                json!({"status": "error", "error": "reloading", "state": "reloading", "retry_after_ms": 20})
            } else {
                json!({"status": "success", "result": {"ok": true}})
            }
        })
        .await;
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let started = tokio::time::Instant::now();
        let result = conn
            .send_command_with_retry("refresh", json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(count.load(Ordering::SeqCst), RELOADS + 1);
        assert!(started.elapsed() >= Duration::from_millis(20 * RELOADS as u64));
    }

    #[tokio::test]
    async fn reload_poll_gives_up_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (port, count) = spawn_framed_peer(|_, _| {
            json!({"status": "error", "error": "Unity domain reload in progress", "retry_after_ms": 1})
        })
        .await;
        let config = ConnectionConfig {
            reload_max_retries: 2,
            ..test_config()
        };
        let conn = Connection::new(port, config, empty_discovery(dir.path()));

        let err = conn
            .send_command_with_retry("refresh", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_reloading());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reloading_status_file_short_circuits_without_io() {
        let dir = tempfile::tempdir().unwrap();
        write_with_mtime(
            dir.path(),
            "unity-mcp-status-abc.json",
            r#"{"project_path":"/w/Foo/Assets","unity_port":1,"reloading":true}"#,
            0,
        );
        let conn = Connection::new(1, test_config(), empty_discovery(dir.path()));

        let err = conn.send_command("refresh", json!({})).await.unwrap_err();
        assert!(err.is_reloading());
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn heartbeat_flood_degrades_to_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut sock).await.unwrap();
            for _ in 0..64 {
                if sock.write_all(&0u64.to_be_bytes()).await.is_err() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let result = conn.send_command("refresh", json!({})).await.unwrap();
        assert_eq!(result, json!({}));
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn stalled_heartbeats_hit_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut sock).await.unwrap();
            sock.write_all(&0u64.to_be_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let started = tokio::time::Instant::now();
        let result = conn.send_command("refresh", json!({})).await.unwrap();
        assert_eq!(result, json!({}));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut sock).await.unwrap();
            sock.write_all(&(MAX_FRAME_LEN as u64 + 1).to_be_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let err = conn.send_command("refresh", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Transport(TransportError::Frame(FrameError::TooLarge { .. }))
        ));
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn dropped_socket_is_retried_on_a_fresh_connection() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        write_with_mtime(
            dir.path(),
            "unity-mcp-status-abc.json",
            &format!(r#"{{"project_path":"/w/Foo/Assets","unity_port":{port}}}"#),
            0,
        );
        tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            first.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut first).await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            second.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut second).await.unwrap();
            write_frame(&mut second, br#"{"status":"success","result":{"attempt":2}}"#).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let config = ConnectionConfig {
            max_retries: 2,
            ..test_config()
        };
        let conn = Connection::for_instance(&foo_on(port), config, empty_discovery(dir.path()));

        let result = conn.send_command("refresh", json!({})).await.unwrap();
        assert_eq!(result, json!({"attempt": 2}));
        assert_eq!(conn.port(), port);
    }

    #[tokio::test]
    async fn malformed_reply_is_retried_on_a_fresh_connection() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        write_with_mtime(
            dir.path(),
            "unity-mcp-status-abc.json",
            &format!(r#"{{"project_path":"/w/Foo/Assets","unity_port":{port}}}"#),
            0,
        );
        let accepts = Arc::new(AtomicUsize::new(0));
        let accepted = accepts.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let n = accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    sock.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
                    while read_frame(&mut sock).await.is_some() {
                        let reply: &[u8] = if n == 0 {
                            br#"{"status":"succ"#
                        } else {
                            br#"{"status":"success","result":{"ok":true}}"#
                        };
                        write_frame(&mut sock, reply).await;
                    }
                });
            }
        });
        let config = ConnectionConfig {
            max_retries: 3,
            ..test_config()
        };
        let conn = Connection::for_instance(&foo_on(port), config, empty_discovery(dir.path()));

        let result = conn.send_command("refresh", json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn malformed_reply_drops_the_socket_once_retries_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME FRAMING=1\n").await.unwrap();
            read_frame(&mut sock).await.unwrap();
            write_frame(&mut sock, b"not json").await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let err = conn.send_command("refresh", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Transport(TransportError::Protocol(_))
        ));
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn legacy_peer_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME UNITY-MCP 1\n").await.unwrap();

            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(request["type"], "get_state");
            sock.write_all(br#"{"status":"success","result":{"playing":false}}"#)
                .await
                .unwrap();

            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            sock.write_all(br#"{"status":"success","result":{"message":"pong"}}"#)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let conn = Connection::new(port, test_config(), empty_discovery(dir.path()));

        let result = conn.send_command("get_state", json!({})).await.unwrap();
        assert_eq!(result, json!({"playing": false}));
        assert_eq!(conn.mode().await, Some(WireMode::Legacy));
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn strict_framing_rejects_legacy_peer() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"WELCOME UNITY-MCP 1\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let config = ConnectionConfig {
            strict_framing: true,
            ..test_config()
        };
        let conn = Connection::new(port, config, empty_discovery(dir.path()));

        let err = conn.send_command("refresh", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Transport(TransportError::HandshakeRejected { .. })
        ));
    }
}
