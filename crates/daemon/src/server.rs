//! Daemon TCP server: accept loop and per-connection frame dispatch.
//!
//! Each connection runs one reader and one writer task. Inbound request
//! frames are dispatched to handlers on their own tasks, so a connection
//! can carry many RPCs in flight; inbound `BulkPull`/`BulkPush` frames
//! are responses to sub-transfers this daemon initiated and complete the
//! connection endpoint's pending requests.

use crate::config::Config;
use crate::handler;
use crate::stats::ChunkStats;
use crate::storage::ChunkStorage;
use crate::task::IoPool;
use bytes::Bytes;
use chunk_codec::{Command, MessageCodec};
use client_common::Endpoint;
use client_common::endpoint::run_writer;
use data_types::SimpleHashDistributor;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Everything a handler needs, passed by value into every RPC. There is
/// no process-wide singleton; tests host several daemons in one process.
pub struct DaemonContext {
    pub storage: Arc<ChunkStorage>,
    pub io_pool: IoPool,
    pub distributor: SimpleHashDistributor,
    pub host_id: u32,
    pub bulk_timeout: Duration,
    pub stats: Option<Arc<ChunkStats>>,
}

impl DaemonContext {
    pub fn chunk_size(&self) -> u64 {
        self.storage.chunk_size()
    }

    pub fn host_count(&self) -> u32 {
        self.distributor.host_count()
    }
}

pub struct Daemon {
    listener: TcpListener,
    ctx: Arc<DaemonContext>,
}

impl Daemon {
    /// Validate the configuration, open the storage engine, and bind the
    /// listener. Any failure here must keep the daemon from starting.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let storage = ChunkStorage::open(Path::new(&config.root_path), config.chunk_size)
            .map_err(|e| io::Error::from_raw_os_error(e.errno()))?;

        let ctx = Arc::new(DaemonContext {
            storage: Arc::new(storage),
            io_pool: IoPool::new(config.io_workers),
            distributor: SimpleHashDistributor::new(config.host_count),
            host_id: config.host_id,
            bulk_timeout: config.bulk_timeout(),
            stats: config
                .enable_chunkstats
                .then(|| Arc::new(ChunkStats::new())),
        });

        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, root = %config.root_path,
            host_id = config.host_id, host_count = config.host_count,
            chunk_size = config.chunk_size, "daemon listening");
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        self.ctx.clone()
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted client connection");
            let ctx = self.ctx.clone();
            tokio::spawn(handle_connection(ctx, stream, peer));
        }
    }
}

async fn handle_connection(ctx: Arc<DaemonContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set nodelay");
    }
    let (read_half, write_half) = stream.into_split();

    let (endpoint, writer_rx) = Endpoint::channel();
    // the writer owns only the channel receiver; it drains any queued
    // responses after the connection's last endpoint reference drops
    tokio::spawn(async move {
        if let Err(e) = run_writer(write_half, writer_rx).await {
            debug!(error = %e, "connection writer failed");
        }
    });

    let mut frames = FramedRead::new(read_half, MessageCodec::default());
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "closing connection on malformed frame");
                break;
            }
        };
        match frame.header.command {
            // completions of bulk sub-transfers this daemon initiated
            Command::BulkPull | Command::BulkPush => endpoint.deliver(frame),
            Command::Handshake => {
                let response = handler::handshake(&ctx, &frame.header);
                let _ = endpoint.enqueue(response, Bytes::new());
            }
            Command::WriteChunks
            | Command::ReadChunks
            | Command::TruncChunks
            | Command::ChunkStat => {
                let ctx = ctx.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    let (header, body) = handler::dispatch(&ctx, &endpoint, frame).await;
                    if endpoint.enqueue(header, body).is_err() {
                        debug!("connection closed before response could be sent");
                    }
                });
            }
            Command::Invalid => {
                warn!(%peer, "dropping frame with invalid command");
                let mut response = chunk_codec::MessageHeader::default();
                response.id = frame.header.id;
                response.errno = libc::EINVAL;
                let _ = endpoint.enqueue(response, Bytes::new());
            }
        }
    }
    endpoint.close();
    debug!(%peer, "client connection closed");
}
