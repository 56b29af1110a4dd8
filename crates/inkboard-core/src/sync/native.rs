//! WebSocket channel for native platforms.
//!
//! The socket lives on a background thread. Commands go in and events come
//! out over `std::sync::mpsc`, so the owning thread never blocks on the network.

use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tungstenite::{Message, connect};
use url::Url;

use super::{ChannelError, ChannelEvent, ClientMessage, ConnectionState, Entry, ServerMessage, SyncChannel};

/// Read timeout of the socket thread; bounds how long a queued send waits.
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Characters of an outgoing frame shown in debug logs.
const LOG_PREVIEW_CHARS: usize = 100;

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// [`SyncChannel`] over a relay WebSocket.
pub struct NativeWebSocket {
    url: Url,
    state: ConnectionState,
    events: Vec<ChannelEvent>,
    /// Channel to send commands to the WebSocket thread.
    cmd_tx: Option<Sender<WsCommand>>,
    /// Channel to receive events from the WebSocket thread.
    event_rx: Option<Receiver<ChannelEvent>>,
    _thread: Option<JoinHandle<()>>,
}

impl NativeWebSocket {
    /// Create a disconnected client for the relay at `url`. Only plain `ws://`
    /// is supported: the client is built without TLS.
    pub fn new(url: &str) -> Result<Self, ChannelError> {
        let url = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" => {}
            "wss" => {
                return Err(ChannelError::InvalidUrl(
                    "wss:// needs TLS support, which this client is built without".to_string(),
                ));
            }
            other => return Err(ChannelError::InvalidUrl(format!("unsupported scheme {other}"))),
        }
        Ok(Self {
            url,
            state: ConnectionState::Disconnected,
            events: Vec::new(),
            cmd_tx: None,
            event_rx: None,
            _thread: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn queue(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
        let tx = self.cmd_tx.as_ref().ok_or(ChannelError::NotConnected)?;
        let json = serde_json::to_string(msg)?;
        tx.send(WsCommand::Send(json))
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

impl SyncChannel for NativeWebSocket {
    fn connect(&mut self, room: &str, author: &str, entry: Entry) -> Result<(), ChannelError> {
        if self.cmd_tx.is_some() {
            return Err(ChannelError::AlreadyConnected);
        }

        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<ChannelEvent>();
        let url = self.url.to_string();

        let handle = thread::spawn(move || run_socket(&url, &cmd_rx, &event_tx));

        self.state = ConnectionState::Connecting;
        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);

        // Queued ahead of any publish, so the relay sees the join first.
        self.queue(&entry.hello(room, author))
    }

    fn disconnect(&mut self) {
        if self.cmd_tx.is_some() {
            let _ = self.queue(&ClientMessage::Leave);
        }
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.event_rx = None;
        self._thread = None;
        self.state = ConnectionState::Disconnected;
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        self.queue(message)
    }

    fn poll(&mut self) -> Vec<ChannelEvent> {
        if let Some(ref rx) = self.event_rx {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    ChannelEvent::Connected => self.state = ConnectionState::Connected,
                    ChannelEvent::Disconnected => self.state = ConnectionState::Disconnected,
                    ChannelEvent::Error { .. } if self.state != ConnectionState::Connected => {
                        self.state = ConnectionState::Error;
                    }
                    _ => {}
                }
                self.events.push(event);
            }
        }
        std::mem::take(&mut self.events)
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Drop for NativeWebSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// At most `max_chars` characters of `msg`, cut on a character boundary.
fn preview(msg: &str, max_chars: usize) -> &str {
    msg.char_indices().nth(max_chars).map_or(msg, |(i, _)| &msg[..i])
}

/// Socket thread body.
fn run_socket(url: &str, cmd_rx: &Receiver<WsCommand>, event_tx: &Sender<ChannelEvent>) {
    log::info!("WebSocket thread: connecting to {}", url);

    let (mut socket, response) = match connect(url) {
        Ok(connected) => connected,
        Err(e) => {
            log::error!("WebSocket connection failed: {}", e);
            let _ = event_tx.send(ChannelEvent::Error {
                message: format!("connection failed: {e}"),
            });
            return;
        }
    };
    log::info!("WebSocket connected, status: {}", response.status());
    let _ = event_tx.send(ChannelEvent::Connected);

    match socket.get_mut() {
        tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(READ_TIMEOUT));
            let _ = tcp.set_write_timeout(Some(WRITE_TIMEOUT));
        }
        #[allow(unreachable_patterns)]
        _ => log::debug!("Non-plain stream, relying on default timeouts"),
    }

    loop {
        // Flush every queued command before blocking on a read.
        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    log::debug!("WebSocket sending: {}", preview(&msg, LOG_PREVIEW_CHARS));
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("WebSocket send error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Disconnected);
                        return;
                    }
                }
                Ok(WsCommand::Close) | Err(TryRecvError::Disconnected) => {
                    log::info!("WebSocket close requested");
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    let _ = event_tx.send(ChannelEvent::Disconnected);
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(txt)) => match serde_json::from_str::<ServerMessage>(&txt) {
                Ok(msg) => {
                    let _ = event_tx.send(msg.into());
                }
                Err(e) => log::warn!("Dropping malformed relay message ({}): {}", e, txt),
            },
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("WebSocket received close frame");
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::error!("WebSocket read error: {}", e);
                break;
            }
        }
    }

    log::info!("WebSocket thread exiting");
    let _ = event_tx.send(ChannelEvent::Disconnected);
}
