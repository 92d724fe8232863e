//! HTTP transfers: one request per unit of work.

use crate::api::{transfer_url, UA};
use crate::transport::{
    ChannelEvent, Transfer, TransferChannel, TransferError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::debug;
use reqwest::header::USER_AGENT;
use reqwest::{Body, Client as ReqwestClient};
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Upload bodies are handed to the connection in slices of this size so
/// that progress is reported while the body is being sent.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

type EventSender = UnboundedSender<Result<ChannelEvent, TransferError>>;

/// A stream that issues one HTTP request per transfer.
///
/// Each request runs in its own task which reports progress back over a
/// channel; closing the stream aborts the task and drops the connection.
pub struct RequestChannel {
    http: ReqwestClient,
    base: Url,
    path: String,
    events: Option<UnboundedReceiver<Result<ChannelEvent, TransferError>>>,
    task: Option<JoinHandle<()>>,
}

impl RequestChannel {
    pub fn new(http: ReqwestClient, base: Url, path: &str) -> Self {
        Self {
            http,
            base,
            path: path.to_string(),
            events: None,
            task: None,
        }
    }

    fn abort_in_flight(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events = None;
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.abort_in_flight();
    }
}

#[async_trait]
impl TransferChannel for RequestChannel {
    async fn open(&mut self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn send(&mut self, transfer: Transfer) -> Result<(), TransferError> {
        self.abort_in_flight();

        let params = match &transfer {
            Transfer::Download { size } => vec![("size", size.to_string())],
            _ => Vec::new(),
        };
        let url = transfer_url(&self.base, &self.path, &params)?;
        let (tx, rx) = unbounded_channel();
        let http = self.http.clone();

        let task = tokio::spawn(async move {
            let result = match transfer {
                Transfer::Ping { index } => ping(&http, url, index, &tx).await,
                Transfer::Download { .. } => download(&http, url, &tx).await,
                Transfer::Upload { payload } => {
                    upload(&http, url, payload, &tx).await
                }
            };
            if let Err(e) = result {
                let _ = tx.send(Err(e));
            }
        });

        self.events = Some(rx);
        self.task = Some(task);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ChannelEvent, TransferError> {
        let events = self.events.as_mut().ok_or(TransferError::Closed)?;

        match events.recv().await {
            Some(event) => event,
            None => Err(TransferError::Closed),
        }
    }

    async fn close(&mut self) {
        self.abort_in_flight();
    }
}

/// Time from sending the request to receiving the response headers.
async fn ping(
    http: &ReqwestClient,
    url: Url,
    index: u64,
    tx: &EventSender,
) -> Result<(), TransferError> {
    let sent_at = Instant::now();
    let response = http
        .get(url)
        .header(USER_AGENT, UA)
        .send()
        .await?
        .error_for_status()?;
    let rtt = sent_at.elapsed();

    response.bytes().await?;
    let _ = tx.send(Ok(ChannelEvent::Pong { index, rtt }));
    Ok(())
}

async fn download(
    http: &ReqwestClient,
    url: Url,
    tx: &EventSender,
) -> Result<(), TransferError> {
    debug!("GET {}", url);
    let response = http
        .get(url)
        .header(USER_AGENT, UA)
        .send()
        .await?
        .error_for_status()?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let progress = ChannelEvent::Progress { bytes: chunk.len() as u64 };
        if tx.send(Ok(progress)).is_err() {
            return Ok(());
        }
    }

    let _ = tx.send(Ok(ChannelEvent::Complete));
    Ok(())
}

async fn upload(
    http: &ReqwestClient,
    url: Url,
    payload: Bytes,
    tx: &EventSender,
) -> Result<(), TransferError> {
    debug!("POST {} ({} bytes)", url, payload.len());
    let len = payload.len();
    let progress = tx.clone();
    let chunks = (0..len)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(move |start| {
            payload.slice(start..(start + UPLOAD_CHUNK_SIZE).min(len))
        });
    let body = futures::stream::iter(chunks).map(move |chunk| {
        let bytes = chunk.len() as u64;
        let _ = progress.send(Ok(ChannelEvent::Progress { bytes }));
        Ok::<_, std::io::Error>(chunk)
    });

    http.post(url)
        .header(USER_AGENT, UA)
        .body(Body::wrap_stream(body))
        .send()
        .await?
        .error_for_status()?;

    let _ = tx.send(Ok(ChannelEvent::Complete));
    Ok(())
}
