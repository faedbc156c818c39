//! Client side of the scratchfs data path.
//!
//! [`ChunkClient`] turns byte-range operations on logical paths into
//! per-daemon RPCs: the planner groups the chunk interval by owner, the
//! caller's buffer is exposed as one bulk window shared by every target,
//! and the sub-requests are dispatched in parallel with bounded retries.
//! Results fold into the first non-zero errno and the byte sum across
//! targets.

pub mod planner;

use bytes::Bytes;
use chunk_codec::{Command, MessageFrame, MessageHeader, compress_bitset, message};
use client_common::{BulkRegistry, RpcClient};
use data_types::{ChunkStat, SimpleHashDistributor};
use futures::future::join_all;
use planner::{RequestPlan, TargetPlan};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon addresses; the index in this list is the daemon's host id.
    pub hosts: Vec<String>,
    /// Must match the daemons' configured chunk size.
    pub chunk_size: u64,
    pub rpc_timeout_ms: u64,
    /// Total attempts per RPC, transport failures only.
    pub rpc_tries: u32,
}

impl ClientConfig {
    pub fn new(hosts: Vec<String>, chunk_size: u64) -> Self {
        Self {
            hosts,
            chunk_size,
            rpc_timeout_ms: 150,
            rpc_tries: 3,
        }
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// A failed data operation: the first non-zero errno across targets, plus
/// the bytes that still completed on other targets. Callers mapping to a
/// POSIX return path surface the errno and drop the partial count.
#[derive(Debug, Error)]
#[error("data operation failed (errno {errno}), {partial} bytes completed")]
pub struct DataOpError {
    pub errno: i32,
    pub partial: u64,
}

pub struct ChunkClient {
    clients: Vec<Arc<RpcClient>>,
    registry: Arc<BulkRegistry>,
    distributor: SimpleHashDistributor,
    config: ClientConfig,
}

impl ChunkClient {
    pub fn new(config: ClientConfig) -> Self {
        assert!(!config.hosts.is_empty(), "client needs at least one daemon");
        assert!(config.chunk_size > 0, "chunk size must be non-zero");
        let registry = BulkRegistry::new();
        let clients = config
            .hosts
            .iter()
            .map(|addr| Arc::new(RpcClient::new_from_address(addr.clone(), registry.clone())))
            .collect();
        let distributor = SimpleHashDistributor::new(config.hosts.len() as u32);
        Self {
            clients,
            registry,
            distributor,
            config,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    /// Send a request with bounded retries on transport failures. A
    /// received response is returned as-is even when it reports an errno;
    /// exhausted transport failures collapse to an errno-compatible code.
    async fn send_with_retry(
        &self,
        client: &RpcClient,
        header: MessageHeader,
        body: Bytes,
    ) -> Result<MessageFrame, i32> {
        let mut attempt = 0u32;
        loop {
            let mut header = header;
            header.retry_count = attempt.min(u8::MAX as u32) as u8;
            match client
                .send_request(header, body.clone(), self.config.rpc_timeout())
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.retryable() && attempt + 1 < self.config.rpc_tries => {
                    warn!(address = client.address(), attempt, error = %e,
                        "rpc failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(address = client.address(), attempt, error = %e, "rpc failed");
                    return Err(e.errno());
                }
            }
        }
    }

    fn data_header(
        &self,
        command: Command,
        path: &str,
        plan: &RequestPlan,
        target: &TargetPlan,
        bulk_id: u64,
    ) -> MessageHeader {
        let mut header = MessageHeader::default();
        header.command = command;
        header.offset = plan.offset;
        header.chunk_start = plan.chunk_start;
        header.chunk_end = plan.chunk_end;
        header.chunk_n = target.chunk_ids.len() as u32;
        header.total_chunk_size = target.total_chunk_size;
        header.bulk_id = bulk_id;
        header.path_len = path.len() as u32;
        header.host_id = target.host;
        header.host_count = self.distributor.host_count();
        header
    }

    /// Dispatch one RPC per target in parallel and fold the results.
    async fn scatter(
        &self,
        command: Command,
        path: &str,
        plan: &RequestPlan,
        bulk_id: u64,
    ) -> (i32, u64) {
        let requests = plan.targets.iter().map(|target| {
            let client = self.clients[target.host as usize].clone();
            let header = self.data_header(command, path, plan, target, bulk_id);
            let body = message::encode_data_request_body(path, &compress_bitset(&target.bitset));
            async move {
                match self.send_with_retry(&client, header, body).await {
                    Ok(response) => (response.header.errno, response.header.io_size),
                    Err(errno) => (errno, 0),
                }
            }
        });

        let mut first_errno = 0;
        let mut io_size = 0u64;
        for (errno, bytes) in join_all(requests).await {
            if first_errno == 0 && errno != 0 {
                first_errno = errno;
            }
            io_size += bytes;
        }
        (first_errno, io_size)
    }

    /// Verify cluster geometry against every daemon. A mismatched chunk
    /// size or host table would silently scatter data to wrong owners, so
    /// mounts perform this once up front.
    pub async fn handshake(&self) -> Result<(), DataOpError> {
        for (host, client) in self.clients.iter().enumerate() {
            let mut header = MessageHeader::default();
            header.command = Command::Handshake;
            header.host_id = host as u32;
            header.host_count = self.distributor.host_count();
            header.total_chunk_size = self.config.chunk_size;

            let errno = match self.send_with_retry(client, header, Bytes::new()).await {
                Ok(response) => response.header.errno,
                Err(errno) => errno,
            };
            if errno != 0 {
                return Err(DataOpError { errno, partial: 0 });
            }
        }
        Ok(())
    }

    /// Write `data` at byte `offset` of `path`. Returns the bytes written
    /// across all targets.
    pub async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<u64, DataOpError> {
        if data.is_empty() {
            return Ok(0);
        }
        let size = data.len() as u64;
        let plan = planner::plan_range(path, offset, size, self.config.chunk_size, &self.distributor);
        debug!(%path, offset, size, targets = plan.targets.len(), "forwarding write");

        // one bulk window over the whole user buffer, shared by all targets
        let handle = self.registry.expose_source(data);
        let (errno, io_size) = self
            .scatter(Command::WriteChunks, path, &plan, handle.id())
            .await;
        drop(handle);

        if errno != 0 {
            return Err(DataOpError {
                errno,
                partial: io_size,
            });
        }
        Ok(io_size)
    }

    /// Read `size` bytes at byte `offset` of `path`. Returns the
    /// contiguous prefix of the range the daemons delivered: short when
    /// the range extends past the last byte of chunk data, and cut at the
    /// first gap when an interior chunk holds less data than the range
    /// asked of it. The sink's push extents decide the result length; the
    /// aggregate `io_size` is a transfer count, not a position, and bytes
    /// delivered past a gap are dropped rather than returned with filler
    /// standing in for the hole.
    pub async fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, DataOpError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let plan = planner::plan_range(path, offset, size, self.config.chunk_size, &self.distributor);
        debug!(%path, offset, size, targets = plan.targets.len(), "forwarding read");

        let (handle, buffer) = self.registry.expose_sink(size as usize);
        let (errno, io_size) = self
            .scatter(Command::ReadChunks, path, &plan, handle.id())
            .await;
        drop(handle);

        if errno != 0 {
            return Err(DataOpError {
                errno,
                partial: io_size,
            });
        }
        let data = buffer.lock().unwrap().take_delivered();
        if (data.len() as u64) < io_size {
            debug!(%path, io_size, delivered = data.len(),
                "dropping bytes delivered past a gap in the range");
        }
        Ok(data)
    }

    /// Truncate `path` to `length` bytes. Every daemon trims the chunks at
    /// and above the new end; the owner of the boundary chunk cuts it to
    /// the remainder; truncation to zero removes the file's chunk space
    /// everywhere.
    pub async fn truncate(&self, path: &str, length: u64) -> Result<(), DataOpError> {
        debug!(%path, length, "forwarding truncate");
        let requests = self.clients.iter().enumerate().map(|(host, client)| {
            let mut header = MessageHeader::default();
            header.command = Command::TruncChunks;
            header.offset = length;
            header.path_len = path.len() as u32;
            header.host_id = host as u32;
            header.host_count = self.distributor.host_count();
            let body = message::encode_data_request_body(path, &[]);
            async move {
                match self.send_with_retry(client, header, body).await {
                    Ok(response) => response.header.errno,
                    Err(errno) => errno,
                }
            }
        });

        for errno in join_all(requests).await {
            if errno != 0 {
                return Err(DataOpError { errno, partial: 0 });
            }
        }
        Ok(())
    }

    /// Capacity report of every daemon, in chunk units.
    pub async fn chunk_stat(&self) -> Result<Vec<ChunkStat>, DataOpError> {
        let requests = self.clients.iter().enumerate().map(|(host, client)| {
            let mut header = MessageHeader::default();
            header.command = Command::ChunkStat;
            header.host_id = host as u32;
            header.host_count = self.distributor.host_count();
            async move { self.send_with_retry(client, header, Bytes::new()).await }
        });

        let mut stats = Vec::with_capacity(self.clients.len());
        for result in join_all(requests).await {
            match result {
                Ok(response) if response.header.errno == 0 => {
                    match message::decode_chunk_stat(&response.body) {
                        Some(stat) => stats.push(stat),
                        None => {
                            return Err(DataOpError {
                                errno: libc::EINVAL,
                                partial: 0,
                            });
                        }
                    }
                }
                Ok(response) => {
                    return Err(DataOpError {
                        errno: response.header.errno,
                        partial: 0,
                    });
                }
                Err(errno) => return Err(DataOpError { errno, partial: 0 }),
            }
        }
        Ok(stats)
    }
}
