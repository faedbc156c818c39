//! One side of a multiplexed RPC connection: a single writer task fed by a
//! channel, and a pending-request map that matches inbound response frames
//! to waiting callers by request id.
//!
//! Both peers of a connection run an endpoint. The client waits here for
//! RPC responses; the daemon waits here for the completion of bulk
//! sub-transfers it initiated against the client's buffers.

use crate::RpcError;
use bytes::{Bytes, BytesMut};
use chunk_codec::{MessageFrame, MessageHeader};
use codec_common::MessageHeaderTrait;
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub struct Endpoint {
    tx: mpsc::UnboundedSender<MessageFrame>,
    pending: Mutex<HashMap<u32, oneshot::Sender<MessageFrame>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Endpoint {
    /// Create an endpoint and the frame stream its writer task consumes.
    pub fn channel() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MessageFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = std::sync::Arc::new(Self {
            tx,
            pending: Mutex::new(HashMap::with_capacity(64)),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });
        (endpoint, rx)
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Seal a frame (size and both checksums) and hand it to the writer.
    pub fn enqueue(&self, mut header: MessageHeader, body: Bytes) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        header.set_size((MessageHeader::SIZE + body.len()) as u32);
        header.set_body_checksum(&body);
        header.set_checksum();
        self.tx
            .send(MessageFrame::new(header, body))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Send a request frame and wait for the matching response. The request
    /// id is assigned here; `header.id` is overwritten.
    pub async fn request(
        &self,
        mut header: MessageHeader,
        body: Bytes,
        timeout: Duration,
    ) -> Result<MessageFrame, RpcError> {
        let id = self.next_request_id();
        header.set_id(id);

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(id, response_tx);
        }

        if let Err(e) = self.enqueue(header, body) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Route a response frame to its waiting caller.
    pub fn deliver(&self, frame: MessageFrame) {
        let request_id = frame.header.id;
        let slot = self.pending.lock().unwrap().remove(&request_id);
        match slot {
            // The receiver may have timed out between removal and delivery.
            Some(response_tx) => {
                let _ = response_tx.send(frame);
            }
            None => warn!(%request_id, "received response for unknown request id"),
        }
    }

    /// Mark the connection dead and wake every waiter with
    /// `ConnectionClosed` (their one-shot senders are dropped).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().unwrap().clear();
    }
}

/// Drains sealed frames onto the socket until the endpoint is dropped or
/// the peer goes away.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<MessageFrame>,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        let mut header_bytes = BytesMut::with_capacity(MessageHeader::SIZE);
        frame.header.encode(&mut header_bytes);
        writer.write_all(&header_bytes).await?;
        if !frame.body.is_empty() {
            writer.write_all(&frame.body).await?;
        }
    }
    writer.shutdown().await
}
