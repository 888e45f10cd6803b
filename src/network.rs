//! Network handler: owns one transport connection.
//!
//! The handler is a dedicated task sitting between the session event loop and
//! the raw transport. It enforces the connect timeout, suppresses disconnect
//! events after an intentional close, and delays unintentional disconnect
//! notifications by one second to let the socket settle before the session
//! starts reconnecting.
//!
//! The transport itself is pluggable through [`Connector`]: production code
//! uses [`WsConnector`] (WebSocket text frames), tests use an in-memory
//! duplex built from channels.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_TIMEOUT_SECS;

/// How long a connection attempt may take before it is restarted.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(DEFAULT_TIMEOUT_SECS);

/// Delay between an unintentional socket drop and the disconnect
/// notification, so the socket can settle before a reconnect begins.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Events surfaced by an established transport connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound UTF-8 text frame.
    Message(String),
    /// The peer (or the OS) closed the connection.
    Closed(Option<String>),
}

/// A live transport connection: a sink of outbound text frames and a stream
/// of inbound events. Dropping `outgoing` closes the connection.
pub struct TransportHandle {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Dials a transport connection. Implementations must resolve the future
/// with a working [`TransportHandle`] or an error.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportHandle>>;
}

/// Default connector: a WebSocket exchanging UTF-8 text frames.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportHandle>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = connect_async(&url)
                .await
                .map_err(|e| Error::Other(format!("failed to connect to {}: {}", url, e)))?;
            let (mut write, mut read) = ws.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = out_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                                    log::debug!("websocket send failed: {}", e);
                                    let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                                    break;
                                }
                            }
                            // Owner dropped the handle: intentional close.
                            None => {
                                let _ = write.close().await;
                                break;
                            }
                        },
                        message = read.next() => match message {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = in_tx.send(TransportEvent::Message(text.to_string()));
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                let _ = in_tx.send(TransportEvent::Closed(None));
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                                break;
                            }
                        },
                    }
                }
            });

            Ok(TransportHandle { outgoing: out_tx, incoming: in_rx })
        })
    }
}

/// Commands from the session loop.
#[derive(Debug)]
pub enum NetworkCommand {
    GoOnline,
    GoOffline,
    /// Tear the connection down and report `error` as the disconnect cause.
    Restart { error: Option<Error> },
    Write { frame: String, event_id: String },
    Destroy,
}

/// Events delivered to the session loop.
#[derive(Debug)]
pub enum NetworkEvent {
    SocketConnected,
    SocketDisconnected { error: Option<Error> },
    MessageReceived(String),
}

/// Cloneable handle to the network task.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
    pub fn go_online(&self) {
        let _ = self.tx.send(NetworkCommand::GoOnline);
    }

    pub fn go_offline(&self) {
        let _ = self.tx.send(NetworkCommand::GoOffline);
    }

    pub fn restart(&self, error: Option<Error>) {
        let _ = self.tx.send(NetworkCommand::Restart { error });
    }

    pub fn write(&self, frame: String, event_id: String) {
        let _ = self.tx.send(NetworkCommand::Write { frame, event_id });
    }

    pub fn destroy(&self) {
        let _ = self.tx.send(NetworkCommand::Destroy);
    }
}

enum LinkState {
    Idle,
    Connecting {
        attempt: BoxFuture<'static, Result<TransportHandle>>,
        deadline: Instant,
    },
    Connected(TransportHandle),
}

/// Spawns the network task for `url`; events flow to `events`.
pub fn spawn(
    url: String,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> NetworkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(url, connector, rx, events));
    NetworkHandle { tx }
}

async fn run(
    url: String,
    connector: Arc<dyn Connector>,
    mut commands: mpsc::UnboundedReceiver<NetworkCommand>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) {
    let mut state = LinkState::Idle;

    loop {
        state = match state {
            LinkState::Idle => {
                let Some(command) = commands.recv().await else { return };
                match command {
                    NetworkCommand::GoOnline => {
                        log::debug!("connecting to {}", url);
                        LinkState::Connecting {
                            attempt: connector.connect(&url),
                            deadline: Instant::now() + CONNECT_TIMEOUT,
                        }
                    }
                    NetworkCommand::Restart { error } => {
                        let _ = events.send(NetworkEvent::SocketDisconnected { error });
                        LinkState::Idle
                    }
                    NetworkCommand::Write { event_id, .. } => {
                        log::warn!("dropping frame {} written while offline", event_id);
                        LinkState::Idle
                    }
                    NetworkCommand::GoOffline => LinkState::Idle,
                    NetworkCommand::Destroy => return,
                }
            }

            LinkState::Connecting { mut attempt, deadline } => {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(NetworkCommand::GoOffline) => LinkState::Idle,
                        Some(NetworkCommand::Destroy) | None => return,
                        Some(NetworkCommand::Restart { error }) => {
                            let _ = events.send(NetworkEvent::SocketDisconnected { error });
                            LinkState::Idle
                        }
                        Some(NetworkCommand::GoOnline) => {
                            LinkState::Connecting { attempt, deadline }
                        }
                        Some(NetworkCommand::Write { event_id, .. }) => {
                            log::warn!("dropping frame {} written while connecting", event_id);
                            LinkState::Connecting { attempt, deadline }
                        }
                    },
                    result = &mut attempt => match result {
                        Ok(handle) => {
                            log::info!("transport connected");
                            let _ = events.send(NetworkEvent::SocketConnected);
                            LinkState::Connected(handle)
                        }
                        Err(e) => {
                            log::warn!("connection attempt failed: {}", e);
                            sleep(SETTLE_DELAY).await;
                            let _ = events.send(NetworkEvent::SocketDisconnected { error: None });
                            LinkState::Idle
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        log::warn!("connection attempt timed out");
                        let _ = events.send(NetworkEvent::SocketDisconnected {
                            error: Some(Error::Timeout),
                        });
                        LinkState::Idle
                    }
                }
            }

            LinkState::Connected(mut handle) => {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(NetworkCommand::Write { frame, event_id }) => {
                            log::debug!("sending frame for event {}", event_id);
                            if handle.outgoing.send(frame).is_err() {
                                sleep(SETTLE_DELAY).await;
                                let _ = events.send(NetworkEvent::SocketDisconnected { error: None });
                                LinkState::Idle
                            } else {
                                LinkState::Connected(handle)
                            }
                        }
                        Some(NetworkCommand::GoOffline) => {
                            log::debug!("going offline");
                            LinkState::Idle
                        }
                        Some(NetworkCommand::Restart { error }) => {
                            let _ = events.send(NetworkEvent::SocketDisconnected { error });
                            LinkState::Idle
                        }
                        Some(NetworkCommand::GoOnline) => LinkState::Connected(handle),
                        Some(NetworkCommand::Destroy) | None => return,
                    },
                    event = handle.incoming.recv() => match event {
                        Some(TransportEvent::Message(text)) => {
                            let _ = events.send(NetworkEvent::MessageReceived(text));
                            LinkState::Connected(handle)
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            if let Some(reason) = &reason {
                                log::warn!("transport closed: {}", reason);
                            } else {
                                log::info!("transport closed by peer");
                            }
                            sleep(SETTLE_DELAY).await;
                            let _ = events.send(NetworkEvent::SocketDisconnected { error: None });
                            LinkState::Idle
                        }
                        None => {
                            sleep(SETTLE_DELAY).await;
                            let _ = events.send(NetworkEvent::SocketDisconnected { error: None });
                            LinkState::Idle
                        }
                    },
                }
            }
        };
    }
}
