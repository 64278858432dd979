//! Length-prefixed message channels over byte streams.
//!
//! A [`StreamChannel`] wraps any reader/writer pair: a TCP connection, a Unix
//! domain socket, or the stdio of a child process. A [`StreamChannelHost`]
//! accepts TCP or Unix connections and announces one channel per peer.

use crate::channel::{
    ChannelHandler, ChannelHostHandler, ChannelHostProxy, ChannelProxy, HandlerSlot,
    HostHandlerSlot, WireError,
};
use crate::message::{decode_length, decode_message, encode_message, Message, MAX_MESSAGE_SIZE};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write a framed message (4-byte length + JSON) to a stream.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON) from a stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

/// A message channel over a byte stream.
pub struct StreamChannel {
    label: String,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: Mutex<Option<BoxedReader>>,
    slot: Arc<HandlerSlot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl StreamChannel {
    /// Wrap a reader/writer pair. Must be called within a Tokio runtime.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let slot = Arc::new(HandlerSlot::default());
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(Self::write_loop(
            writer,
            writer_rx,
            Arc::clone(&slot),
            Arc::clone(&closed),
            label.clone(),
        ));
        Arc::new(Self {
            label,
            writer_tx: Mutex::new(Some(writer_tx)),
            reader: Mutex::new(Some(Box::new(reader))),
            slot,
            tasks: Mutex::new(vec![writer_task]),
            closed,
            disposed: AtomicBool::new(false),
        })
    }

    /// Connect to a TCP endpoint.
    pub async fn connect_tcp(addr: &str) -> TetherResult<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        debug!(addr, "Connected TCP channel");
        Ok(Self::new(format!("tcp:{addr}"), reader, writer))
    }

    /// Connect to a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: &Path) -> TetherResult<Arc<Self>> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        debug!(path = %path.display(), "Connected Unix channel");
        Ok(Self::new(format!("unix:{}", path.display()), reader, writer))
    }

    /// Use the stdio of a child spawned with piped stdin and stdout.
    pub fn from_child(child: &mut tokio::process::Child) -> TetherResult<Arc<Self>> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::InvalidArgument("child stdout is not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TetherError::InvalidArgument("child stdin is not piped".into()))?;
        let label = format!("child:{}", child.id().unwrap_or_default());
        Ok(Self::new(label, stdout, stdin))
    }

    /// Use this process's own stdin and stdout (the child side of
    /// [`StreamChannel::from_child`]).
    pub fn from_stdio() -> Arc<Self> {
        Self::new("stdio", tokio::io::stdin(), tokio::io::stdout())
    }

    /// Transport label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    async fn write_loop<W>(
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        slot: Arc<HandlerSlot>,
        closed: Arc<AtomicBool>,
        label: String,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        while let Some(bytes) = rx.recv().await {
            let result = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = result {
                warn!(channel = %label, error = %e, "Stream write failed");
                closed.store(true, Ordering::SeqCst);
                slot.emit_error(&WireError::Io(e));
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn read_loop(
        mut reader: BoxedReader,
        slot: Arc<HandlerSlot>,
        closed: Arc<AtomicBool>,
        label: String,
    ) {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => slot.emit_data(message),
                Err(WireError::ConnectionClosed) => {
                    debug!(channel = %label, "Stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(channel = %label, error = %e, "Stream read failed");
                    slot.emit_error(&e);
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        slot.emit_close();
    }

    fn start(&self) {
        let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&self.slot),
            Arc::clone(&self.closed),
            self.label.clone(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }
}

#[async_trait]
impl ChannelProxy for StreamChannel {
    fn send_data(&self, message: &Message) -> bool {
        if self.disposed.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let bytes = match encode_message(message) {
            Ok(bytes) if bytes.len() - 4 <= MAX_MESSAGE_SIZE as usize => bytes,
            Ok(bytes) => {
                warn!(channel = %self.label, size = bytes.len(), "Refusing oversized message");
                return false;
            }
            Err(e) => {
                warn!(channel = %self.label, error = %e, "Failed to encode message");
                return false;
            }
        };
        match self.writer_tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    fn set_handler(&self, handler: Option<Arc<dyn ChannelHandler>>) -> TetherResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            if handler.is_some() {
                return Err(TetherError::Disposed(format!("Channel ({})", self.label)));
            }
            return Ok(());
        }
        let start = handler.is_some();
        self.slot.set(handler);
        if start {
            self.start();
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot.set(None);
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        // Dropping the sender lets the writer flush what is queued, then shut down.
        self.writer_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        // The first task is the writer; leave it to finish on its own.
        for task in tasks.into_iter().skip(1) {
            task.abort();
        }
        debug!(channel = %self.label, "Stream channel disposed");
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Accepts stream connections and announces one [`StreamChannel`] per peer.
pub struct StreamChannelHost {
    info: ConnectionInfo,
    local_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
    listener: Mutex<Option<Listener>>,
    slot: Arc<HostHandlerSlot>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl StreamChannelHost {
    fn with_listener(
        info: ConnectionInfo,
        listener: Listener,
        local_addr: Option<SocketAddr>,
        socket_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            local_addr,
            socket_path,
            listener: Mutex::new(Some(listener)),
            slot: Arc::new(HostHandlerSlot::default()),
            accept_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Listen on a TCP address such as `127.0.0.1:0`.
    pub async fn bind_tcp(addr: &str) -> TetherResult<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Tether: listening on tcp {}", local_addr);
        let info = ConnectionInfo::new(
            "tether-wire",
            "tcp.connect",
            vec![serde_json::Value::String(local_addr.to_string())],
        );
        Ok(Self::with_listener(
            info,
            Listener::Tcp(listener),
            Some(local_addr),
            None,
        ))
    }

    /// Listen on a Unix domain socket. A stale socket file at `path` is replaced.
    #[cfg(unix)]
    pub fn bind_unix(path: &Path) -> TetherResult<Arc<Self>> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("Tether: listening on unix {}", path.display());
        let info = ConnectionInfo::new(
            "tether-wire",
            "ipc.connect",
            vec![serde_json::Value::String(path.display().to_string())],
        );
        Ok(Self::with_listener(
            info,
            Listener::Unix(listener),
            None,
            Some(path.to_path_buf()),
        ))
    }

    /// Bound TCP address, for TCP hosts.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn start(&self) {
        let Some(listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let slot = Arc::clone(&self.slot);
        let task = tokio::spawn(async move {
            slot.emit_listening();
            Self::accept_loop(listener, slot).await;
        });
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Accept loop, run on a spawned task.
    async fn accept_loop(listener: Listener, slot: Arc<HostHandlerSlot>) {
        loop {
            let accepted = match &listener {
                Listener::Tcp(l) => l.accept().await.map(|(stream, addr)| {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    StreamChannel::new(format!("tcp:{addr}"), reader, writer)
                }),
                #[cfg(unix)]
                Listener::Unix(l) => l.accept().await.map(|(stream, _)| {
                    let (reader, writer) = stream.into_split();
                    StreamChannel::new("unix:peer", reader, writer)
                }),
            };
            match accepted {
                Ok(channel) => {
                    debug!("Tether: accepted connection {}", channel.label());
                    slot.emit_connection(channel);
                }
                Err(e) => {
                    error!("Tether: accept error: {}", e);
                    slot.emit_error(&WireError::Io(e));
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChannelHostProxy for StreamChannelHost {
    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    fn set_handler(&self, handler: Option<Arc<dyn ChannelHostHandler>>) -> TetherResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            if handler.is_some() {
                return Err(TetherError::Disposed("Channel host".to_string()));
            }
            return Ok(());
        }
        let start = handler.is_some();
        self.slot.set(handler);
        if start {
            self.start();
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handler) = self.slot.get() {
            handler.on_close();
        }
        self.slot.set(None);
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
        info!("Tether: host stopped listening");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Forward {
        tx: mpsc::UnboundedSender<Message>,
    }

    impl ChannelHandler for Forward {
        fn on_data(&self, message: Message) {
            let _ = self.tx.send(message);
        }
    }

    struct Accept {
        tx: mpsc::UnboundedSender<Arc<dyn ChannelProxy>>,
    }

    impl ChannelHostHandler for Accept {
        fn on_connection(&self, channel: Arc<dyn ChannelProxy>) {
            let _ = self.tx.send(channel);
        }
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::request("d-1", "/dup", json!({"k": [1, 2]}));
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, msg);

        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_host_roundtrip() {
        let host = StreamChannelHost::bind_tcp("127.0.0.1:0").await.unwrap();
        let (tx, mut accepted) = mpsc::unbounded_channel();
        host.set_handler(Some(Arc::new(Accept { tx }))).unwrap();

        let addr = host.local_addr().unwrap().to_string();
        assert_eq!(host.connection_info().first_param_str(), Some(addr.as_str()));
        let client = StreamChannel::connect_tcp(&addr).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap();

        let (tx, mut received) = mpsc::unbounded_channel();
        server.set_handler(Some(Arc::new(Forward { tx }))).unwrap();
        assert!(client.send_data(&Message::request("t-1", "/tcp", json!("over tcp"))));

        let got = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, json!("over tcp"));

        client.dispose().await;
        host.dispose().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_host_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.sock");
        let host = StreamChannelHost::bind_unix(&path).unwrap();
        let (tx, mut accepted) = mpsc::unbounded_channel();
        host.set_handler(Some(Arc::new(Accept { tx }))).unwrap();

        let client = StreamChannel::connect_unix(&path).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap();

        let (tx, mut received) = mpsc::unbounded_channel();
        client.set_handler(Some(Arc::new(Forward { tx }))).unwrap();
        assert!(server.send_data(&Message::response("u-1", true, json!(7))));

        let got = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.succeeded, Some(true));

        host.dispose().await;
        assert!(!path.exists());
    }
}
