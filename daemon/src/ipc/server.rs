//! Unix domain socket server for IPC
//!
//! Provides request-response communication, push notifications of events
//! and engine commands to subscribed clients, and the report path the
//! front end uses to feed the engine bridge.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine as _;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::assistant::Assistant;
use crate::bridge::{Bridge, EngineCommand};
use crate::events::{Event, EventStream};

use super::protocol::{read_frame, write_frame, DaemonStatus, Notification, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// What every client handler needs
struct Shared {
    assistant: Assistant,
    bridge: Bridge,
    /// One unbounded queue per subscribed client
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    start_time: Instant,
}

impl Shared {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    /// Queue `event` for every client still connected
    fn publish(&self, event: Event) {
        self.subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Notification sources of a subscribed client
struct Subscription {
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
}

impl Subscription {
    async fn next(&mut self) -> Option<Notification> {
        tokio::select! {
            Some(event) = self.events.recv() => Some(Notification::Event(event)),
            Some(command) = self.commands.recv() => Some(Notification::Engine(command)),
            else => None,
        }
    }
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, assistant: Assistant, bridge: Bridge) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Owner-only access
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            shared: Arc::new(Shared {
                assistant,
                bridge,
                subscribers: Mutex::new(Vec::new()),
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Relay assistant events to subscribed clients until the stream ends
    pub async fn publish(&self, mut stream: EventStream) {
        while let Some(event) = stream.recv().await {
            self.shared.publish(event);
        }
        debug!("event stream closed");
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (request_tx, mut request_rx) = mpsc::channel(32);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));
        let mut subscription: Option<Subscription> = None;

        let result = loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("client disconnected");
                        break Ok(());
                    };
                    let sent = match request {
                        Ok(Request::Subscribe) => {
                            if subscription.is_none() {
                                subscription = Some(Subscription {
                                    events: shared.subscribe_events(),
                                    commands: shared.bridge.commands(),
                                });
                                debug!("client subscribed to notifications");
                            }
                            Self::confirm_subscription(&mut writer, &shared.bridge).await
                        }
                        Ok(request) => {
                            debug!(?request, "received request");
                            write_frame(&mut writer, &Self::process_request(request, &shared)).await
                        }
                        Err(e) => write_frame(&mut writer, &Response::error("invalid_request", e)).await,
                    };
                    if let Err(e) = sent {
                        break Err(e);
                    }
                }
                notification = Self::next_notification(&mut subscription) => {
                    match notification {
                        Some(notification) => {
                            if let Err(e) = write_frame(&mut writer, &notification).await {
                                break Err(e);
                            }
                        }
                        None => subscription = None,
                    }
                }
            }
        };

        reader_task.abort();
        result
    }

    /// Acknowledge a subscription and bring the front end up to date
    async fn confirm_subscription(writer: &mut OwnedWriteHalf, bridge: &Bridge) -> Result<()> {
        write_frame(writer, &Response::Subscribed).await?;
        for command in bridge.resume_commands() {
            write_frame(writer, &Notification::Engine(command)).await?;
        }
        Ok(())
    }

    async fn next_notification(subscription: &mut Option<Subscription>) -> Option<Notification> {
        match subscription {
            Some(subscription) => subscription.next().await,
            None => std::future::pending().await,
        }
    }

    /// Parse frames off the socket until it closes
    async fn read_requests(
        mut reader: OwnedReadHalf,
        requests: mpsc::Sender<Result<Request, String>>,
    ) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    warn!(?e, "unreadable message, disconnecting");
                    return;
                }
            };
            let request = serde_json::from_slice(&frame).map_err(|e| e.to_string());
            if requests.send(request).await.is_err() {
                return;
            }
        }
    }

    /// Process a request and return a response
    fn process_request(request: Request, shared: &Shared) -> Response {
        let bridged = |result: Result<(), crate::bridge::BridgeError>| match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::error("rejected", e.to_string()),
        };

        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => Response::Status(DaemonStatus::new(
                shared.assistant.current_state(),
                shared.start_time.elapsed().as_secs(),
            )),

            Request::ToggleMute => {
                shared.assistant.toggle_mute();
                Response::Ok
            }

            Request::Speak { text } => {
                let assistant = shared.assistant.clone();
                tokio::spawn(async move {
                    if let Err(e) = assistant.speak(text).await {
                        warn!(error = %e, "speak request failed");
                    }
                });
                Response::Accepted
            }

            Request::StopRecording => {
                shared.assistant.stop_recording();
                Response::Ok
            }

            // handled by the connection loop
            Request::Subscribe => Response::Subscribed,

            Request::Recognition { event } => bridged(shared.bridge.recognition(event)),

            Request::AudioChunk { session, data } => {
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => bridged(shared.bridge.audio_chunk(session, bytes)),
                    Err(e) => Response::error("invalid_request", e.to_string()),
                }
            }

            Request::CaptureStopped { session, mime_type } => {
                bridged(shared.bridge.capture_stopped(session, mime_type))
            }

            Request::SpeechFinished { utterance, error } => {
                bridged(shared.bridge.speech_finished(utterance, error))
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}
