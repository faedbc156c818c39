//! RPC handlers for the data operations.
//!
//! A write pulls each selected chunk from the client's bulk window and
//! immediately spawns a tasklet writing it to local storage, so the disk
//! I/O of one chunk overlaps the transfer of the next. A read spawns all
//! read tasklets up front and pushes each chunk back as its tasklet
//! completes, while later reads are still on the pool.
//!
//! Handlers never panic across the RPC boundary; every failure is folded
//! into the errno of the response header. A failed tasklet never aborts
//! its siblings: the error is sticky and the remaining work drains.

use crate::ops::ChunkOp;
use crate::plan::{self, ChunkTransfer};
use crate::server::DaemonContext;
use crate::task::{self, TaskResult};
use bytes::Bytes;
use chunk_codec::{Command, MessageFrame, MessageHeader, decompress_bitset, message};
use client_common::{BulkProxy, Endpoint};
use std::sync::Arc;
use tracing::{debug, trace, warn};

fn response_header(request: &MessageHeader) -> MessageHeader {
    let mut header = MessageHeader::default();
    header.command = request.command;
    header.id = request.id;
    header
}

pub async fn dispatch(
    ctx: &DaemonContext,
    endpoint: &Arc<Endpoint>,
    frame: MessageFrame,
) -> (MessageHeader, Bytes) {
    match frame.header.command {
        Command::WriteChunks => (write(ctx, endpoint, &frame).await, Bytes::new()),
        Command::ReadChunks => (read(ctx, endpoint, &frame).await, Bytes::new()),
        Command::TruncChunks => (truncate(ctx, &frame).await, Bytes::new()),
        Command::ChunkStat => chunk_stat(ctx, &frame).await,
        _ => {
            let mut out = response_header(&frame.header);
            out.errno = libc::EINVAL;
            (out, Bytes::new())
        }
    }
}

/// Validate cluster geometry once per connection so a misconfigured
/// client fails fast instead of corrupting placement.
pub fn handshake(ctx: &DaemonContext, request: &MessageHeader) -> MessageHeader {
    let mut out = response_header(request);
    if request.host_id != ctx.host_id
        || request.host_count != ctx.host_count()
        || request.total_chunk_size != ctx.chunk_size()
    {
        warn!(
            client_host_id = request.host_id,
            client_host_count = request.host_count,
            client_chunk_size = request.total_chunk_size,
            host_id = ctx.host_id,
            host_count = ctx.host_count(),
            chunk_size = ctx.chunk_size(),
            "rejecting handshake with mismatched cluster geometry"
        );
        out.errno = libc::EINVAL;
    }
    out
}

/// Decode and validate a data request: path, ownership bitset, and the
/// per-chunk transfer geometry. Malformed input is `EINVAL` before any
/// transfer or disk I/O starts.
fn decode_data_request<'a>(
    ctx: &DaemonContext,
    frame: &'a MessageFrame,
) -> Result<(&'a str, Vec<ChunkTransfer>), i32> {
    let header = &frame.header;
    let chunk_size = ctx.chunk_size();

    let (path, bitset_bytes) =
        message::split_data_request_body(&frame.body, header.path_len as usize)
            .ok_or(libc::EINVAL)?;
    if path.is_empty() || !path.starts_with('/') {
        return Err(libc::EINVAL);
    }
    if header.offset >= chunk_size || header.chunk_end < header.chunk_start {
        return Err(libc::EINVAL);
    }
    if header.host_id != ctx.host_id || header.host_count != ctx.host_count() {
        warn!(host_id = header.host_id, host_count = header.host_count,
            "request addressed to wrong daemon");
        return Err(libc::EINVAL);
    }

    let bits = decompress_bitset(bitset_bytes).map_err(|e| {
        warn!(%path, error = %e, "malformed ownership bitset");
        libc::EINVAL
    })?;
    if bits.len() as u64 != header.chunk_end - header.chunk_start + 1 {
        return Err(libc::EINVAL);
    }
    let selected = bits.iter().filter(|owned| **owned).count();
    if selected == 0 || selected != header.chunk_n as usize {
        return Err(libc::EINVAL);
    }

    let transfers = plan::plan_transfers(
        &bits,
        header.chunk_start,
        header.offset,
        header.total_chunk_size,
        header.chunk_n,
        chunk_size,
    )
    .ok_or(libc::EINVAL)?;
    Ok((path, transfers))
}

async fn write(ctx: &DaemonContext, endpoint: &Arc<Endpoint>, frame: &MessageFrame) -> MessageHeader {
    let mut out = response_header(&frame.header);
    let (path, transfers) = match decode_data_request(ctx, frame) {
        Ok(decoded) => decoded,
        Err(errno) => {
            out.errno = errno;
            return out;
        }
    };
    debug!(%path, chunk_start = frame.header.chunk_start, chunk_end = frame.header.chunk_end,
        chunk_n = frame.header.chunk_n, total_chunk_size = frame.header.total_chunk_size,
        offset = frame.header.offset, "serving write");

    let proxy = BulkProxy::new(endpoint.clone(), frame.header.bulk_id, ctx.bulk_timeout);
    let mut tasks = Vec::with_capacity(transfers.len());
    let mut bulk_failed = false;

    for transfer in &transfers {
        trace!(chunk_id = transfer.chunk_id, origin_offset = transfer.origin_offset,
            local_offset = transfer.local_offset, transfer_size = transfer.transfer_size,
            "bulk pull");
        let data = match proxy
            .pull(transfer.origin_offset, transfer.transfer_size)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(%path, chunk_id = transfer.chunk_id, error = %e,
                    "failed to pull chunk data from client");
                out.errno = libc::EBUSY;
                bulk_failed = true;
                break;
            }
        };
        if let Some(stats) = &ctx.stats {
            stats.add_write(transfer.transfer_size);
        }

        let storage = ctx.storage.clone();
        let op = ChunkOp::Write {
            path: path.to_string(),
            chunk_id: transfer.chunk_id,
            data,
            offset: transfer.in_chunk_offset,
        };
        tasks.push(ctx.io_pool.spawn(move || op.execute(&storage).0));
    }

    // tasklets already on the pool run to completion even on failure
    let (errno, io_size) = task::join_all(tasks).await;
    out.io_size = io_size;
    if !bulk_failed {
        out.errno = errno;
    }
    if out.errno == 0 && io_size != frame.header.total_chunk_size {
        warn!(%path, total_chunk_size = frame.header.total_chunk_size, io_size,
            "total chunk size and io size mismatch");
    }
    out
}

async fn read(ctx: &DaemonContext, endpoint: &Arc<Endpoint>, frame: &MessageFrame) -> MessageHeader {
    let mut out = response_header(&frame.header);
    let (path, transfers) = match decode_data_request(ctx, frame) {
        Ok(decoded) => decoded,
        Err(errno) => {
            out.errno = errno;
            return out;
        }
    };
    debug!(%path, chunk_start = frame.header.chunk_start, chunk_end = frame.header.chunk_end,
        chunk_n = frame.header.chunk_n, total_chunk_size = frame.header.total_chunk_size,
        offset = frame.header.offset, "serving read");

    let proxy = BulkProxy::new(endpoint.clone(), frame.header.bulk_id, ctx.bulk_timeout);

    // all read tasklets go on the pool first; pushes happen per completion
    let mut pending = Vec::with_capacity(transfers.len());
    for transfer in &transfers {
        let storage = ctx.storage.clone();
        let op = ChunkOp::Read {
            path: path.to_string(),
            chunk_id: transfer.chunk_id,
            size: transfer.transfer_size,
            offset: transfer.in_chunk_offset,
        };
        pending.push((*transfer, ctx.io_pool.spawn(move || op.execute(&storage))));
    }

    let mut first_errno = 0;
    let mut io_size = 0u64;
    for (transfer, eventual) in pending {
        let completed: Option<(TaskResult, Option<Vec<u8>>)> = eventual.wait().await;
        match completed {
            Some((result, data)) => {
                if result.errno != 0 {
                    warn!(%path, chunk_id = transfer.chunk_id, errno = result.errno,
                        "chunk read failed");
                    if first_errno == 0 {
                        first_errno = result.errno;
                    }
                    continue;
                }
                let data = data.unwrap_or_default();
                let read = data.len() as u64;
                if read == 0 {
                    continue;
                }
                trace!(chunk_id = transfer.chunk_id, origin_offset = transfer.origin_offset,
                    size = read, "bulk push");
                match proxy.push(transfer.origin_offset, Bytes::from(data)).await {
                    Ok(()) => {
                        io_size += read;
                        if let Some(stats) = &ctx.stats {
                            stats.add_read(read);
                        }
                    }
                    Err(e) => {
                        warn!(%path, chunk_id = transfer.chunk_id, error = %e,
                            "failed to push chunk data to client");
                        if first_errno == 0 {
                            first_errno = libc::EBUSY;
                        }
                    }
                }
            }
            None => {
                if first_errno == 0 {
                    first_errno = libc::EIO;
                }
            }
        }
    }

    out.errno = first_errno;
    out.io_size = io_size;
    out
}

async fn truncate(ctx: &DaemonContext, frame: &MessageFrame) -> MessageHeader {
    let mut out = response_header(&frame.header);
    let length = frame.header.offset;
    let path = match message::split_data_request_body(&frame.body, frame.header.path_len as usize)
    {
        Some((path, rest)) if rest.is_empty() && path.starts_with('/') => path.to_string(),
        _ => {
            out.errno = libc::EINVAL;
            return out;
        }
    };
    debug!(%path, length, "serving truncate");

    let chunk_size = ctx.chunk_size();
    let op = if length == 0 {
        ChunkOp::Truncate {
            path,
            trim_start: 0,
            boundary: None,
        }
    } else {
        let boundary_chunk = length / chunk_size;
        let remainder = length % chunk_size;
        let owns_boundary =
            ctx.distributor.locate_data(&path, boundary_chunk) == ctx.host_id;
        ChunkOp::Truncate {
            path,
            trim_start: length.div_ceil(chunk_size),
            boundary: (remainder != 0 && owns_boundary).then_some((boundary_chunk, remainder)),
        }
    };
    if let Some(stats) = &ctx.stats {
        stats.add_truncate();
    }

    let storage = ctx.storage.clone();
    out.errno = match ctx.io_pool.spawn(move || op.execute(&storage).0).wait().await {
        Some(result) => result.errno,
        None => libc::EIO,
    };
    out
}

async fn chunk_stat(ctx: &DaemonContext, frame: &MessageFrame) -> (MessageHeader, Bytes) {
    let mut out = response_header(&frame.header);
    let storage = ctx.storage.clone();
    match ctx.io_pool.spawn(move || storage.chunk_stat()).wait().await {
        Some(Ok(stat)) => {
            debug!(chunk_total = stat.chunk_total, chunk_free = stat.chunk_free,
                "serving chunk stat");
            (out, message::encode_chunk_stat(&stat))
        }
        Some(Err(e)) => {
            out.errno = e.errno();
            (out, Bytes::new())
        }
        None => {
            out.errno = libc::EIO;
            (out, Bytes::new())
        }
    }
}
