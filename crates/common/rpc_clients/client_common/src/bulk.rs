//! Bulk data movement between a client buffer and a daemon buffer.
//!
//! The client exposes a buffer window through the [`BulkRegistry`] and
//! sends the resulting handle id with its RPC. The daemon moves data with
//! one-sided sub-requests on the same connection: `BulkPull` asks the
//! client for a window slice, `BulkPush` delivers one. Every transfer
//! either completes fully or fails; fragmentation never surfaces. Retry
//! policy lives with the request planner, not here.

use crate::endpoint::Endpoint;
use crate::RpcError;
use bytes::Bytes;
use chunk_codec::{Command, MessageFrame, MessageHeader};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{trace, warn};

enum BulkWindow {
    /// Read-only exposure of caller data (the write path).
    Source(Bytes),
    /// Write-only destination the daemon pushes into (the read path).
    Sink(Arc<Mutex<SinkBuffer>>),
}

/// Destination of daemon pushes: the backing buffer plus the extents that
/// actually received data, so the caller can tell delivered bytes from
/// untouched filler. A chunk may hold less data than a transfer asked of
/// it, leaving a hole in the middle of the window while later pushes
/// still land at their own offsets.
pub struct SinkBuffer {
    data: Vec<u8>,
    extents: Vec<(u64, u64)>,
}

impl SinkBuffer {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            extents: Vec::new(),
        }
    }

    fn write(&mut self, offset: u64, src: &[u8]) -> Result<(), i32> {
        let end = offset.checked_add(src.len() as u64).ok_or(libc::EINVAL)?;
        if end > self.data.len() as u64 {
            return Err(libc::EINVAL);
        }
        self.data[offset as usize..end as usize].copy_from_slice(src);
        self.extents.push((offset, src.len() as u64));
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes from position 0 covered by push extents without a gap.
    pub fn contiguous_prefix(&self) -> u64 {
        let mut extents = self.extents.clone();
        extents.sort_unstable();
        let mut end = 0u64;
        for (offset, len) in extents {
            if offset > end {
                break;
            }
            end = end.max(offset + len);
        }
        end
    }

    /// Take the delivered prefix out of the buffer. Bytes pushed past a
    /// gap are dropped; filler never masquerades as data.
    pub fn take_delivered(&mut self) -> Vec<u8> {
        let prefix = self.contiguous_prefix() as usize;
        let mut data = std::mem::take(&mut self.data);
        self.extents.clear();
        data.truncate(prefix);
        data
    }
}

/// Client-side table of exposed buffer windows, shared with the connection
/// receive loops that serve daemon-initiated transfers.
pub struct BulkRegistry {
    windows: DashMap<u64, BulkWindow>,
    next_id: AtomicU64,
}

/// Scoped owner of a window exposure; the registration is torn down when
/// the handle drops, which bounds every exposure to its RPC.
pub struct BulkHandle {
    id: u64,
    registry: Arc<BulkRegistry>,
}

impl BulkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for BulkHandle {
    fn drop(&mut self) {
        self.registry.windows.remove(&self.id);
    }
}

impl BulkRegistry {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            windows: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn insert(self: &Arc<Self>, window: BulkWindow) -> BulkHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.windows.insert(id, window);
        BulkHandle {
            id,
            registry: self.clone(),
        }
    }

    /// Expose caller data for daemon pulls.
    pub fn expose_source(self: &Arc<Self>, data: Bytes) -> BulkHandle {
        self.insert(BulkWindow::Source(data))
    }

    /// Expose a zeroed destination of `len` bytes for daemon pushes.
    pub fn expose_sink(self: &Arc<Self>, len: usize) -> (BulkHandle, Arc<Mutex<SinkBuffer>>) {
        let buffer = Arc::new(Mutex::new(SinkBuffer::new(len)));
        let handle = self.insert(BulkWindow::Sink(buffer.clone()));
        (handle, buffer)
    }

    fn read_window(&self, id: u64, offset: u64, len: u64) -> Result<Bytes, i32> {
        let window = self.windows.get(&id).ok_or(libc::EINVAL)?;
        match window.value() {
            BulkWindow::Source(data) => {
                let end = offset.checked_add(len).ok_or(libc::EINVAL)?;
                if end > data.len() as u64 {
                    return Err(libc::EINVAL);
                }
                Ok(data.slice(offset as usize..end as usize))
            }
            BulkWindow::Sink(_) => Err(libc::EINVAL),
        }
    }

    fn write_window(&self, id: u64, offset: u64, data: &[u8]) -> Result<(), i32> {
        let window = self.windows.get(&id).ok_or(libc::EINVAL)?;
        match window.value() {
            BulkWindow::Sink(buffer) => buffer.lock().unwrap().write(offset, data),
            BulkWindow::Source(_) => Err(libc::EINVAL),
        }
    }
}

/// Serve one daemon-initiated transfer against the registry. Runs on the
/// connection receive loop; both cases are plain memory copies.
pub fn serve_bulk(registry: &BulkRegistry, endpoint: &Endpoint, frame: MessageFrame) {
    let mut response = MessageHeader::default();
    response.command = frame.header.command;
    response.id = frame.header.id;
    response.bulk_id = frame.header.bulk_id;

    let body = match frame.header.command {
        Command::BulkPull => {
            match registry.read_window(frame.header.bulk_id, frame.header.offset, frame.header.io_size)
            {
                Ok(data) => {
                    trace!(bulk_id = frame.header.bulk_id, offset = frame.header.offset,
                        size = data.len(), "serving bulk pull");
                    response.io_size = data.len() as u64;
                    data
                }
                Err(errno) => {
                    warn!(bulk_id = frame.header.bulk_id, errno, "rejecting bulk pull");
                    response.errno = errno;
                    Bytes::new()
                }
            }
        }
        Command::BulkPush => {
            match registry.write_window(frame.header.bulk_id, frame.header.offset, &frame.body) {
                Ok(()) => {
                    trace!(bulk_id = frame.header.bulk_id, offset = frame.header.offset,
                        size = frame.body.len(), "accepted bulk push");
                    response.io_size = frame.body.len() as u64;
                }
                Err(errno) => {
                    warn!(bulk_id = frame.header.bulk_id, errno, "rejecting bulk push");
                    response.errno = errno;
                }
            }
            Bytes::new()
        }
        _ => return,
    };

    // A send failure means the connection died; the daemon sees the broken
    // transfer on its side.
    let _ = endpoint.enqueue(response, body);
}

/// Daemon-side face of one client buffer exposure: issues pull/push
/// sub-requests over the connection's endpoint and awaits completion.
pub struct BulkProxy {
    endpoint: Arc<Endpoint>,
    bulk_id: u64,
    timeout: Duration,
}

impl BulkProxy {
    pub fn new(endpoint: Arc<Endpoint>, bulk_id: u64, timeout: Duration) -> Self {
        Self {
            endpoint,
            bulk_id,
            timeout,
        }
    }

    /// Fetch `size` bytes at `origin_offset` of the remote window.
    pub async fn pull(&self, origin_offset: u64, size: u64) -> Result<Bytes, RpcError> {
        let mut header = MessageHeader::default();
        header.command = Command::BulkPull;
        header.bulk_id = self.bulk_id;
        header.offset = origin_offset;
        header.io_size = size;

        let response = self.endpoint.request(header, Bytes::new(), self.timeout).await?;
        if response.header.errno != 0 {
            return Err(RpcError::Rejected(response.header.errno));
        }
        if response.body.len() as u64 != size {
            return Err(RpcError::Protocol("bulk pull returned a short window"));
        }
        Ok(response.body)
    }

    /// Place `data` at `origin_offset` of the remote window.
    pub async fn push(&self, origin_offset: u64, data: Bytes) -> Result<(), RpcError> {
        let mut header = MessageHeader::default();
        header.command = Command::BulkPush;
        header.bulk_id = self.bulk_id;
        header.offset = origin_offset;

        let response = self.endpoint.request(header, data, self.timeout).await?;
        if response.header.errno != 0 {
            return Err(RpcError::Rejected(response.header.errno));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_window_bounds() {
        let registry = BulkRegistry::new();
        let handle = registry.expose_source(Bytes::from_static(b"0123456789"));

        assert_eq!(
            registry.read_window(handle.id(), 2, 3).unwrap(),
            Bytes::from_static(b"234")
        );
        assert_eq!(registry.read_window(handle.id(), 8, 3), Err(libc::EINVAL));
        assert_eq!(registry.read_window(handle.id() + 1, 0, 1), Err(libc::EINVAL));
    }

    #[test]
    fn test_sink_window_writes() {
        let registry = BulkRegistry::new();
        let (handle, buffer) = registry.expose_sink(8);

        registry.write_window(handle.id(), 3, b"abc").unwrap();
        assert_eq!(buffer.lock().unwrap().data(), b"\0\0\0abc\0\0");
        assert_eq!(registry.write_window(handle.id(), 7, b"xy"), Err(libc::EINVAL));
    }

    #[test]
    fn test_sink_tracks_delivered_extents() {
        let registry = BulkRegistry::new();
        let (handle, buffer) = registry.expose_sink(10);

        registry.write_window(handle.id(), 0, b"ab").unwrap();
        registry.write_window(handle.id(), 2, b"cde").unwrap();
        assert_eq!(buffer.lock().unwrap().contiguous_prefix(), 5);
        assert_eq!(buffer.lock().unwrap().take_delivered(), b"abcde");
    }

    #[test]
    fn test_sink_prefix_stops_at_gap() {
        let registry = BulkRegistry::new();
        let (handle, buffer) = registry.expose_sink(10);

        // a short transfer leaves a hole; data landing past it must not
        // be reported as delivered
        registry.write_window(handle.id(), 0, b"ab").unwrap();
        registry.write_window(handle.id(), 6, b"wxyz").unwrap();
        assert_eq!(buffer.lock().unwrap().contiguous_prefix(), 2);
        assert_eq!(buffer.lock().unwrap().take_delivered(), b"ab");
    }

    #[test]
    fn test_sink_prefix_merges_overlaps() {
        let registry = BulkRegistry::new();
        let (handle, buffer) = registry.expose_sink(8);

        registry.write_window(handle.id(), 2, b"cdef").unwrap();
        registry.write_window(handle.id(), 0, b"abcd").unwrap();
        assert_eq!(buffer.lock().unwrap().contiguous_prefix(), 6);
    }

    #[test]
    fn test_window_direction_enforced() {
        let registry = BulkRegistry::new();
        let source = registry.expose_source(Bytes::from_static(b"abc"));
        let (sink, _buffer) = registry.expose_sink(3);

        assert_eq!(registry.write_window(source.id(), 0, b"x"), Err(libc::EINVAL));
        assert_eq!(registry.read_window(sink.id(), 0, 1), Err(libc::EINVAL));
    }

    #[test]
    fn test_handle_drop_frees_window() {
        let registry = BulkRegistry::new();
        let id = {
            let handle = registry.expose_source(Bytes::from_static(b"abc"));
            handle.id()
        };
        assert_eq!(registry.read_window(id, 0, 1), Err(libc::EINVAL));
    }
}
