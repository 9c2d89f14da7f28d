//! Command dispatch plus the socket endpoints that feed it.
//!
//! Transport is line-delimited: one request per line in, one reply per line
//! out. Endpoints are `ipc://<path>` (Unix stream socket) or
//! `tcp://<host>:<port>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::broadcast;

use super::protocol::{ErrorCode, Reply, Request, parse_request};

const PUBLISH_QUEUE: usize = 64;
/// Longest accepted request line, newline excluded.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub type Handler = Box<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Handlers run one at a time, whichever connection the request came from.
pub struct CommandServer {
    handlers: HashMap<String, Handler>,
    dispatch: Mutex<()>,
}

impl CommandServer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            dispatch: Mutex::new(()),
        }
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    /// Dispatches one payload. Always produces a reply.
    pub fn handle_message(&self, payload: &str) -> String {
        let reply = match parse_request(payload) {
            Ok(request) => match self.handlers.get(request.cmd.as_str()) {
                Some(handler) => {
                    let _serial = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
                    handler(&request)
                }
                None => Reply::error(
                    ErrorCode::UnknownCmd,
                    format!("unknown command: {}", request.cmd),
                ),
            },
            Err(reply) => reply,
        };
        reply.to_json()
    }
}

/// Best-effort notifications for subscribers of the publish endpoint.
#[derive(Clone)]
pub struct Publisher {
    sender: Arc<Mutex<Option<broadcast::Sender<String>>>>,
}

impl Publisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PUBLISH_QUEUE);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    pub fn disabled() -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Never blocks. Returns false when nobody received the message.
    pub fn publish(&self, event: &str, data: Value) -> bool {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return false;
        };
        let message = Reply::ok(json!({ "event": event, "data": data })).to_json();
        match sender.send(message) {
            Ok(_) => true,
            Err(_) => {
                log::debug!("Publish of '{}' had no subscribers", event);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Ipc(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(format!("missing socket path in {}", s));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            // zeromq-style wildcard host
            let addr = addr.replacen('*', "0.0.0.0", 1);
            if addr.is_empty() {
                return Err(format!("missing address in {}", s));
            }
            Ok(Endpoint::Tcp(addr))
        } else {
            Err(format!("unsupported endpoint: {}", s))
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound endpoint. Dropping it removes an `ipc://` socket file.
pub struct Listener {
    kind: ListenerKind,
    endpoint: Endpoint,
}

pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let kind = match endpoint {
            Endpoint::Ipc(path) => {
                if path.exists() {
                    log::debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
                ListenerKind::Unix(
                    UnixListener::bind(path)
                        .with_context(|| format!("Failed to bind {}", endpoint))?,
                )
            }
            Endpoint::Tcp(addr) => ListenerKind::Tcp(
                TcpListener::bind(addr.as_str())
                    .await
                    .with_context(|| format!("Failed to bind {}", endpoint))?,
            ),
        };
        log::info!("Listening on {}", endpoint);
        Ok(Self {
            kind,
            endpoint: endpoint.clone(),
        })
    }

    pub async fn accept(&self) -> Result<Connection> {
        Ok(match &self.kind {
            ListenerKind::Unix(l) => Connection::Unix(l.accept().await?.0),
            ListenerKind::Tcp(l) => Connection::Tcp(l.accept().await?.0),
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Endpoint::Ipc(path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("Socket cleanup {}: {}", path.display(), e);
            }
        }
    }
}

/// Accepts clients forever, answering each request line with a reply line.
pub async fn run_command_endpoint(listener: Listener, server: Arc<CommandServer>) -> Result<()> {
    loop {
        let connection = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            let result = match connection {
                Connection::Unix(s) => serve_commands(s, server).await,
                Connection::Tcp(s) => serve_commands(s, server).await,
            };
            if let Err(e) = result {
                log::debug!("Control client dropped: {}", e);
            }
        });
    }
}

async fn serve_commands<S>(stream: S, server: Arc<CommandServer>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(());
        }

        let mut reply = if buf.last() != Some(&b'\n') && buf.len() > MAX_REQUEST_BYTES {
            discard_line(&mut reader).await?;
            Reply::error(
                ErrorCode::InvalidJson,
                format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
            )
            .to_json()
        } else {
            match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                // handlers may block (device enumeration), keep them off the workers
                Ok(line) => {
                    let line = line.trim_end().to_string();
                    let server = server.clone();
                    tokio::task::spawn_blocking(move || server.handle_message(&line))
                        .await
                        .context("command handler panicked")?
                }
                Err(_) => Reply::error(ErrorCode::InvalidJson, "request is not valid UTF-8").to_json(),
            }
        };
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }
}

/// Skips the rest of an oversized request up to its newline.
async fn discard_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        let n = (&mut *reader)
            .take(MAX_REQUEST_BYTES as u64)
            .read_until(b'\n', &mut chunk)
            .await?;
        if n == 0 || chunk.last() == Some(&b'\n') {
            return Ok(());
        }
    }
}

/// Streams every published message to each subscriber.
pub async fn run_publish_endpoint(listener: Listener, publisher: Publisher) -> Result<()> {
    loop {
        let connection = listener.accept().await?;
        let Some(receiver) = publisher.subscribe() else {
            bail!("publisher is disabled");
        };
        tokio::spawn(async move {
            let result = match connection {
                Connection::Unix(s) => forward_published(s, receiver).await,
                Connection::Tcp(s) => forward_published(s, receiver).await,
            };
            if let Err(e) = result {
                log::debug!("Subscriber dropped: {}", e);
            }
        });
    }
}

async fn forward_published<S>(mut stream: S, mut receiver: broadcast::Receiver<String>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    loop {
        match receiver.recv().await {
            Ok(mut message) => {
                message.push('\n');
                stream.write_all(message.as_bytes()).await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Subscriber lagged, {} notifications skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ping_server() -> CommandServer {
        let mut server = CommandServer::new();
        server.register("PING", |_| Reply::ok(json!({"pong": true})));
        server
    }

    fn parse(reply: &str) -> Value {
        serde_json::from_str(reply).unwrap()
    }

    #[test]
    fn unknown_command_is_answered() {
        let server = ping_server();
        let reply = parse(&server.handle_message(r#"{"cmd":"FLY"}"#));
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error_code"], "UNKNOWN_CMD");

        let reply = parse(&server.handle_message("{oops"));
        assert_eq!(reply["error_code"], "INVALID_JSON");

        let reply = parse(&server.handle_message("PING"));
        assert_eq!(reply["data"]["pong"], true);
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "ipc:///tmp/x.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            "tcp://*:5555".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("0.0.0.0:5555".into())
        );
        assert!("udp://1.2.3.4:5".parse::<Endpoint>().is_err());
        assert!("ipc://".parse::<Endpoint>().is_err());
    }

    #[test]
    fn publish_reaches_subscribers() {
        let publisher = Publisher::new();
        assert!(!publisher.publish("phase_changed", json!({"phase_type": "linear"})));

        let mut receiver = publisher.subscribe().unwrap();
        assert!(publisher.publish("phase_changed", json!({"phase_type": "linear"})));
        let message = parse(&receiver.try_recv().unwrap());
        assert_eq!(message["status"], "ok");
        assert_eq!(message["data"]["event"], "phase_changed");

        let disabled = Publisher::disabled();
        assert!(disabled.subscribe().is_none());
        assert!(!disabled.publish("x", Value::Null));
    }

    #[tokio::test]
    async fn ipc_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();

        let endpoint = Endpoint::Ipc(path.clone());
        let listener = Listener::bind(&endpoint).await.unwrap();
        let task = tokio::spawn(run_command_endpoint(listener, Arc::new(ping_server())));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"cmd\":\"PING\"}\n{\"cmd\":\"NOPE\"}\n").await.unwrap();
        let first = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(parse(&first)["data"]["pong"], true);
        let second = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(parse(&second)["error_code"], "UNKNOWN_CMD");

        task.abort();
        let _ = task.await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_lines_keep_the_connection_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        let listener = Listener::bind(&Endpoint::Ipc(path.clone())).await.unwrap();
        let task = tokio::spawn(run_command_endpoint(listener, Arc::new(ping_server())));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"\xff\xfe\n").await.unwrap();
        let mut oversized = vec![b'a'; MAX_REQUEST_BYTES + 10];
        oversized.push(b'\n');
        writer.write_all(&oversized).await.unwrap();
        writer.write_all(b"{\"cmd\":\"PING\"}\n").await.unwrap();

        for expected in ["INVALID_JSON", "INVALID_JSON"] {
            let line = timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(parse(&line)["error_code"], expected);
        }
        let pong = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(parse(&pong)["data"]["pong"], true);

        task.abort();
        let _ = task.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handlers_never_run_concurrently() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut server = CommandServer::new();
        let (a, p) = (active.clone(), peak.clone());
        server.register("SLOW", move |_| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            a.fetch_sub(1, Ordering::SeqCst);
            Reply::ok(Value::Null)
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = Listener::bind(&Endpoint::Ipc(path.clone())).await.unwrap();
        let task = tokio::spawn(run_command_endpoint(listener, Arc::new(server)));

        let mut clients = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            clients.push(tokio::spawn(async move {
                let stream = UnixStream::connect(&path).await.unwrap();
                let (reader, mut writer) = tokio::io::split(stream);
                let mut lines = BufReader::new(reader).lines();
                writer.write_all(b"SLOW\nSLOW\n").await.unwrap();
                for _ in 0..2 {
                    let line = timeout(Duration::from_secs(5), lines.next_line())
                        .await
                        .unwrap()
                        .unwrap()
                        .unwrap();
                    assert_eq!(parse(&line)["status"], "ok");
                }
            }));
        }
        for client in clients {
            client.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        task.abort();
        let _ = task.await;
    }
}
