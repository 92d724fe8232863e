//! WebSocket transfers over one persistent connection per stream.
//!
//! The client drives the cadence with JSON text frames:
//!
//! * latency: `{"action":"ping","index":n}` answered by
//!   `{"action":"pong","index":n}`
//! * download: `{"action":"prepare","size":n}` once, then
//!   `{"action":"download"}` answered by a binary frame
//! * upload: a binary frame answered by an empty acknowledgement

use crate::transport::{ChannelEvent, Transfer, TransferChannel, TransferError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
enum Frame {
    Ping { index: u64 },
    Pong { index: u64 },
    Prepare { size: u64 },
    Download,
}

pub struct DuplexChannel {
    url: Url,
    socket: Option<Socket>,
    prepared: bool,
    pings: HashMap<u64, Instant>,
    /// Size of the upload awaiting its acknowledgement
    pending_upload: Option<u64>,
    queued: VecDeque<ChannelEvent>,
}

impl DuplexChannel {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            socket: None,
            prepared: false,
            pings: HashMap::new(),
            pending_upload: None,
            queued: VecDeque::new(),
        }
    }

    fn socket(&mut self) -> Result<&mut Socket, TransferError> {
        self.socket.as_mut().ok_or(TransferError::Closed)
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransferError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        self.socket()?.send(Message::Text(text)).await?;
        Ok(())
    }

    fn on_text(
        &mut self,
        text: &str,
    ) -> Result<Option<ChannelEvent>, TransferError> {
        if text.is_empty() {
            return Ok(self.on_ack());
        }

        match serde_json::from_str::<Frame>(text) {
            Ok(Frame::Pong { index }) => match self.pings.remove(&index) {
                Some(sent_at) => Ok(Some(ChannelEvent::Pong {
                    index,
                    rtt: sent_at.elapsed(),
                })),
                None => {
                    debug!("Ignoring pong for unknown ping {}", index);
                    Ok(None)
                }
            },
            Ok(other) => Err(TransferError::Protocol(format!(
                "unexpected frame from server: {:?}",
                other
            ))),
            Err(e) => Err(TransferError::Protocol(format!(
                "malformed frame from server: {}",
                e
            ))),
        }
    }

    fn on_binary(&mut self, data: &[u8]) -> Option<ChannelEvent> {
        if self.pending_upload.is_some() {
            return self.on_ack();
        }

        self.queued.push_back(ChannelEvent::Complete);
        Some(ChannelEvent::Progress { bytes: data.len() as u64 })
    }

    fn on_ack(&mut self) -> Option<ChannelEvent> {
        let size = self.pending_upload.take()?;

        self.queued.push_back(ChannelEvent::Complete);
        Some(ChannelEvent::Progress { bytes: size })
    }
}

#[async_trait]
impl TransferChannel for DuplexChannel {
    async fn open(&mut self) -> Result<(), TransferError> {
        debug!("Connecting to {}", self.url);
        let (socket, _response) = connect_async(self.url.as_str()).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, transfer: Transfer) -> Result<(), TransferError> {
        match transfer {
            Transfer::Ping { index } => {
                self.pings.insert(index, Instant::now());
                self.send_frame(&Frame::Ping { index }).await
            }
            Transfer::Download { size } => {
                if !self.prepared {
                    self.send_frame(&Frame::Prepare { size }).await?;
                    self.prepared = true;
                }
                self.send_frame(&Frame::Download).await
            }
            Transfer::Upload { payload } => {
                self.pending_upload = Some(payload.len() as u64);
                self.socket()?.send(Message::Binary(payload.to_vec())).await?;
                Ok(())
            }
        }
    }

    async fn next_event(&mut self) -> Result<ChannelEvent, TransferError> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(event);
        }

        loop {
            let message = match self.socket()?.next().await {
                Some(message) => message?,
                None => return Err(TransferError::Closed),
            };

            let event = match message {
                Message::Text(text) => self.on_text(&text)?,
                Message::Binary(data) => self.on_binary(&data),
                Message::Close(_) => return Err(TransferError::Closed),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
            };

            if let Some(event) = event {
                return Ok(event);
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!("Error closing {}: {}", self.url, e);
            }
        }
        self.pings.clear();
        self.queued.clear();
        self.pending_upload = None;
    }
}
