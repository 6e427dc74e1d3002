//! Websocket feed client.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(close/error)──► Disconnected
//!                                     │
//!                                cancellation
//!                                     ▼
//!                                 Draining ──► Closed
//! ```
//!
//! Reads are bounded by a short deadline so the loop keeps observing
//! cancellation even on an idle connection. Records are offered to a
//! bounded channel without waiting: when the channel is full the newest
//! record is dropped and counted, and the session ends so that nothing
//! after it is delivered. The next connection resumes from the last
//! delivered record once the channel has room again. With reconnect
//! disabled the source stops there, and the dropped record is replayed
//! after restart because no delivered record is newer than it.

use crate::clock::Clock;
use crate::config::StreamConfig;
use crate::cursor::{Counter, CursorTracker};
use crate::error::{IngestError, Result};
use crate::event::{Provenance, RawRecord};
use crate::source::SourceItem;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// Why a connected session ended
enum SessionEnd {
    /// Server closed or the socket failed; reconnect if allowed
    Lost,
    Cancelled,
    /// Receiver dropped; nobody is listening anymore
    ChannelClosed,
    /// A record was dropped on a full channel
    Overflow,
}

pub struct StreamSource {
    base_url: String,
    collection: String,
    read_timeout: Duration,
    reconnect_backoff: Duration,
    reconnect: bool,
    /// Replay position for the next connection
    resume_time_us: i64,
    connection_seq: u64,
    state: StreamState,
    tracker: Arc<CursorTracker>,
    clock: Arc<dyn Clock>,
}

impl StreamSource {
    pub fn new(
        config: &StreamConfig,
        collection: &str,
        start_time_us: i64,
        tracker: Arc<CursorTracker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| IngestError::FatalConfig("stream url is required".to_string()))?;
        Ok(StreamSource {
            base_url,
            collection: collection.to_string(),
            read_timeout: config.read_timeout,
            reconnect_backoff: config.reconnect_backoff,
            reconnect: config.reconnect,
            resume_time_us: start_time_us,
            connection_seq: 0,
            state: StreamState::Disconnected,
            tracker,
            clock,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// URL for the next connection, carrying the collection filter and
    /// the replay cursor
    pub fn connect_url(&self) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}wantedCollections={}",
            self.base_url, separator, self.collection
        );
        if self.resume_time_us > 0 {
            url.push_str(&format!("&cursor={}", self.resume_time_us));
        }
        url
    }

    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "stream state");
        self.state = next;
    }

    /// Run until cancelled, or until the connection is lost with
    /// reconnect disabled. `tx` is dropped on return, closing the channel.
    pub async fn run(mut self, tx: mpsc::Sender<SourceItem>, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let url = self.connect_url();
            self.transition(StreamState::Connecting);
            info!(url = %url, "connecting to feed");

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
                _ = cancel.cancelled() => break,
            };

            let end = match connected {
                Ok((socket, _response)) => {
                    self.connection_seq += 1;
                    self.transition(StreamState::Connected);
                    info!(url = %url, connection = self.connection_seq, "feed connected");
                    self.read_session(socket, &tx, &cancel).await
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "feed connection failed");
                    SessionEnd::Lost
                }
            };

            match end {
                SessionEnd::Cancelled | SessionEnd::ChannelClosed => break,
                SessionEnd::Overflow => {
                    self.transition(StreamState::Disconnected);
                    if !self.reconnect {
                        info!("record dropped, reconnect disabled");
                        break;
                    }
                    info!(resume_time_us = self.resume_time_us, "record dropped, resyncing once the channel has room");
                    tokio::select! {
                        permit = tx.reserve() => {
                            if permit.is_err() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                SessionEnd::Lost => {
                    self.transition(StreamState::Disconnected);
                    if !self.reconnect {
                        info!("feed lost, reconnect disabled");
                        break;
                    }
                    info!(backoff = ?self.reconnect_backoff, resume_time_us = self.resume_time_us, "reconnecting after backoff");
                    tokio::select! {
                        () = tokio::time::sleep(self.reconnect_backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        self.transition(StreamState::Draining);
        drop(tx);
        self.transition(StreamState::Closed);
        info!(connections = self.connection_seq, "feed source closed");
        Ok(())
    }

    async fn read_session(
        &mut self,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
        tx: &mpsc::Sender<SourceItem>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.read_timeout, read.next()) => next,
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
            };

            let message = match next {
                // Idle; loop around to observe cancellation.
                Err(_elapsed) => continue,
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "feed read error");
                    return SessionEnd::Lost;
                }
                Ok(None) => {
                    info!("feed stream ended");
                    return SessionEnd::Lost;
                }
            };

            let payload = match message {
                Message::Text(text) => serde_json::from_str::<Value>(&text),
                Message::Binary(data) => serde_json::from_slice::<Value>(&data),
                Message::Ping(data) => {
                    let _ = write.send(Message::Pong(data)).await;
                    continue;
                }
                Message::Close(frame) => {
                    info!(frame = ?frame, "server closed feed");
                    return SessionEnd::Lost;
                }
                _ => continue,
            };

            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(error = %e, "undecodable feed message");
                    self.tracker.count(Counter::Rejected, 1);
                    continue;
                }
            };

            let time_us = payload.get("time_us").and_then(Value::as_i64);
            let record = RawRecord {
                payload,
                provenance: Provenance::Stream {
                    connection: self.connection_seq,
                },
                arrival_time_us: self.clock.now_us(),
            };
            match tx.try_send(SourceItem::Record(record)) {
                Ok(()) => {
                    if let Some(time_us) = time_us {
                        self.resume_time_us = self.resume_time_us.max(time_us);
                    }
                }
                Err(TrySendError::Full(_)) => {
                    self.tracker.count(Counter::Dropped, 1);
                    if let Some(time_us) = time_us {
                        self.resume_time_us = if self.resume_time_us > 0 {
                            self.resume_time_us.min(time_us)
                        } else {
                            time_us
                        };
                    }
                    warn!(time_us = ?time_us, "record channel full, dropped newest");
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Overflow;
                }
                Err(TrySendError::Closed(_)) => return SessionEnd::ChannelClosed,
            }
        }
    }
}
