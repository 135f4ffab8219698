// mock_controller: A mock fleet controller for testing the display agent.
//
// Accepts WebSocket connections on ws://127.0.0.1:<port>, records the
// handshake headers of every connection, decodes inbound agent frames and
// lets the test push command frames to whichever connection is current.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ds_protocol::{AgentMessage, Command};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// One frame received from an agent.
#[derive(Debug, Clone)]
pub struct Received {
    /// Zero-based index of the connection the frame arrived on.
    pub connection: usize,
    pub message: AgentMessage,
}

enum Control {
    Send(String),
    /// Tear the TCP stream down without a close handshake.
    Drop,
}

#[derive(Default)]
struct Shared {
    /// Handshake headers per accepted connection, in accept order.
    headers: Mutex<Vec<Vec<(String, String)>>>,
    current: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    /// Frames that were not valid agent messages.
    rejected: Mutex<Vec<String>>,
    /// When set, newly accepted connections never read, so pings go
    /// unanswered.
    silent: AtomicBool,
}

/// A mock controller for integration testing.
///
/// Binds to port 0 and exposes the bound address. Only the most recently
/// accepted connection receives pushed commands, matching a controller that
/// tracks one live link per device.
pub struct MockController {
    addr: SocketAddr,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Received>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockController {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        let (tx, inbound) = mpsc::unbounded_channel();

        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, task_shared, tx).await;
        });

        Ok(Self {
            addr,
            shared,
            inbound,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL agents should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of WebSocket handshakes completed so far.
    pub fn connection_count(&self) -> usize {
        self.shared.headers.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Wait until at least `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connection_count() >= n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Value of a handshake header sent on connection `index`.
    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        let headers = self.shared.headers.lock().ok()?;
        headers.get(index)?.iter().find_map(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    /// Raw text frames that did not decode as agent messages.
    pub fn rejected_frames(&self) -> Vec<String> {
        self.shared
            .rejected
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Stop answering pings on connections accepted from now on.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    pub fn send_command(&self, command: &Command) -> Result<(), String> {
        self.send_text(command.to_frame())
    }

    /// Push an arbitrary text frame to the current connection.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), String> {
        self.control(Control::Send(text.into()))
    }

    /// Abruptly drop the current connection.
    pub fn drop_connection(&self) {
        let _ = self.control(Control::Drop);
        if let Ok(mut current) = self.shared.current.lock() {
            *current = None;
        }
    }

    /// Next frame from any connection, or `None` on timeout.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Received> {
        tokio::time::timeout(timeout, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip frames until one satisfies `pred`, or the overall timeout elapses.
    pub async fn recv_matching<F>(&mut self, timeout: Duration, mut pred: F) -> Option<Received>
    where
        F: FnMut(&AgentMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let received = self.recv(remaining).await?;
            if pred(&received.message) {
                return Some(received);
            }
        }
    }

    /// Drain everything that arrives within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Received> {
        let deadline = tokio::time::Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return out;
            }
            match self.recv(remaining).await {
                Some(r) => out.push(r),
                None => return out,
            }
        }
    }

    // -- internal --

    fn control(&self, control: Control) -> Result<(), String> {
        let current = self
            .shared
            .current
            .lock()
            .map_err(|_| "controller state poisoned".to_owned())?;
        match current.as_ref() {
            Some(tx) => tx.send(control).map_err(|_| "connection closed".to_owned()),
            None => Err("no live connection".to_owned()),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<Shared>,
        inbound: mpsc::UnboundedSender<Received>,
    ) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let shared = shared.clone();
            let inbound = inbound.clone();
            tokio::spawn(async move {
                // Client drops are expected in tests; swallow errors.
                let _ = Self::handle_connection(stream, shared, inbound).await;
            });
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shared: Arc<Shared>,
        inbound: mpsc::UnboundedSender<Received>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let captured: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let capture = captured.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Ok(mut out) = capture.lock() {
                for (name, value) in req.headers() {
                    out.push((
                        name.as_str().to_owned(),
                        value.to_str().unwrap_or_default().to_owned(),
                    ));
                }
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let connection = {
            let mut headers = shared.headers.lock().map_err(|_| "poisoned")?;
            let mut current = shared.current.lock().map_err(|_| "poisoned")?;
            headers.push(captured.lock().map(|h| h.clone()).unwrap_or_default());
            *current = Some(control_tx);
            headers.len() - 1
        };

        let (mut write, mut read) = ws_stream.split();

        if shared.silent.load(Ordering::SeqCst) {
            // Hold the socket open without polling it.
            while let Some(control) = control_rx.recv().await {
                match control {
                    Control::Send(text) => write.send(Message::Text(text.into())).await?,
                    Control::Drop => return Ok(()),
                }
            }
            return Ok(());
        }

        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Send(text)) => write.send(Message::Text(text.into())).await?,
                    Some(Control::Drop) | None => return Ok(()),
                },
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };
                    match msg {
                        Message::Text(text) => {
                            match serde_json::from_str::<AgentMessage>(&text) {
                                Ok(message) => {
                                    let _ = inbound.send(Received { connection, message });
                                }
                                Err(_) => {
                                    if let Ok(mut r) = shared.rejected.lock() {
                                        r.push(text.to_string());
                                    }
                                }
                            }
                        }
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}
