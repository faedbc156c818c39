//! TCP RPC client for one daemon: a background receive task routes
//! response frames to waiting callers and serves daemon-initiated bulk
//! transfers against the shared [`BulkRegistry`].

use crate::bulk::{BulkRegistry, serve_bulk};
use crate::endpoint::{Endpoint, run_writer};
use crate::RpcError;
use bytes::Bytes;
use chunk_codec::{Command, MessageCodec, MessageFrame, MessageHeader};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, warn};

/// One live connection. Cheap to clone; all clones share the endpoint.
#[derive(Clone)]
pub struct RpcConnection {
    endpoint: Arc<Endpoint>,
}

impl RpcConnection {
    pub async fn connect(addr: &str, registry: Arc<BulkRegistry>) -> Result<Self, RpcError> {
        debug!(%addr, "connecting to daemon");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (endpoint, writer_rx) = Endpoint::channel();

        // the writer owns only the channel receiver: it drains queued
        // frames after the last endpoint reference drops, and its own
        // death fails subsequent enqueues
        tokio::spawn(async move {
            if let Err(e) = run_writer(write_half, writer_rx).await {
                debug!(error = %e, "connection writer failed");
            }
        });

        let receive_endpoint = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_loop(read_half, &receive_endpoint, &registry).await {
                warn!(error = %e, "receive task failed");
            }
            receive_endpoint.close();
        });

        Ok(Self { endpoint })
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    pub async fn send_request(
        &self,
        header: MessageHeader,
        body: Bytes,
        timeout: Duration,
    ) -> Result<MessageFrame, RpcError> {
        self.endpoint.request(header, body, timeout).await
    }
}

/// Reads frames until the peer goes away. Responses complete pending
/// requests; bulk sub-requests are served inline from the registry.
async fn receive_loop(
    read_half: OwnedReadHalf,
    endpoint: &Endpoint,
    registry: &BulkRegistry,
) -> Result<(), RpcError> {
    let mut frames = FramedRead::new(read_half, MessageCodec::default());
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        match frame.header.command {
            Command::BulkPull | Command::BulkPush => serve_bulk(registry, endpoint, frame),
            _ => endpoint.deliver(frame),
        }
    }
    debug!("connection closed by peer");
    Ok(())
}

/// Lazily connecting, auto-reconnecting client for a single daemon
/// address. Reconnects on the next request after a connection dies;
/// whether to retry the request itself is the planner's decision.
pub struct RpcClient {
    address: String,
    registry: Arc<BulkRegistry>,
    inner: tokio::sync::Mutex<Option<RpcConnection>>,
}

impl RpcClient {
    pub fn new_from_address(address: String, registry: Arc<BulkRegistry>) -> Self {
        Self {
            address,
            registry,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn ensure_connected(&self) -> Result<RpcConnection, RpcError> {
        let mut inner = self.inner.lock().await;
        if let Some(connection) = inner.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        match RpcConnection::connect(&self.address, self.registry.clone()).await {
            Ok(connection) => {
                debug!(address = %self.address, "connected to daemon");
                *inner = Some(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                error!(address = %self.address, error = %e, "failed to connect to daemon");
                Err(e)
            }
        }
    }

    pub async fn send_request(
        &self,
        header: MessageHeader,
        body: Bytes,
        timeout: Duration,
    ) -> Result<MessageFrame, RpcError> {
        let connection = self.ensure_connected().await?;
        connection.send_request(header, body, timeout).await
    }
}
