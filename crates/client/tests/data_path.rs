//! End-to-end data-path tests: a cluster of in-process daemons on
//! loopback, exercised through the client API.

use bytes::Bytes;
use data_types::SimpleHashDistributor;
use scratchfs_client::{ChunkClient, ClientConfig};
use scratchfs_daemon::stats::DataOp;
use scratchfs_daemon::{Config, Daemon, DaemonContext};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_test::traced_test;

const CHUNK_SIZE: u64 = 1024;
const HOST_COUNT: u32 = 3;

struct Cluster {
    client: Arc<ChunkClient>,
    addrs: Vec<String>,
    roots: Vec<TempDir>,
    contexts: Vec<Arc<DaemonContext>>,
    distributor: SimpleHashDistributor,
}

impl Cluster {
    async fn spawn() -> Self {
        Self::spawn_with_chunk_size(CHUNK_SIZE).await
    }

    async fn spawn_with_chunk_size(chunk_size: u64) -> Self {
        let mut addrs = Vec::new();
        let mut roots = Vec::new();
        let mut contexts = Vec::new();
        for host_id in 0..HOST_COUNT {
            let root = tempfile::tempdir().unwrap();
            let config = Config {
                listen_addr: "127.0.0.1:0".to_string(),
                root_path: root.path().to_str().unwrap().to_string(),
                host_id,
                host_count: HOST_COUNT,
                chunk_size,
                io_workers: 4,
                bulk_timeout_ms: 5_000,
                enable_chunkstats: true,
            };
            let daemon = Daemon::bind(&config).await.unwrap();
            addrs.push(daemon.local_addr().unwrap().to_string());
            contexts.push(daemon.context());
            tokio::spawn(daemon.run());
            roots.push(root);
        }

        let mut client_config = ClientConfig::new(addrs.clone(), chunk_size);
        client_config.rpc_timeout_ms = 5_000;
        let client = Arc::new(ChunkClient::new(client_config));
        client.handshake().await.unwrap();

        Cluster {
            client,
            addrs,
            roots,
            contexts,
            distributor: SimpleHashDistributor::new(HOST_COUNT),
        }
    }

    /// On-disk path of one chunk file on the daemon owning it.
    fn chunk_file(&self, path: &str, chunk_id: u64) -> std::path::PathBuf {
        let owner = self.distributor.locate_data(path, chunk_id) as usize;
        self.roots[owner]
            .path()
            .join(path.trim_start_matches('/').replace('/', ":"))
            .join(chunk_id.to_string())
    }

    /// The chunk file must not exist on any daemon.
    fn assert_chunk_absent(&self, path: &str, chunk_id: u64) {
        let dir_name = path.trim_start_matches('/').replace('/', ":");
        for root in &self.roots {
            let file = root.path().join(&dir_name).join(chunk_id.to_string());
            assert!(!file.exists(), "stale chunk file {}", file.display());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_single_chunk_small_write() {
    let cluster = Cluster::spawn().await;

    let wrote = cluster
        .client
        .write("/a", 10, Bytes::from_static(b"HELLO"))
        .await
        .unwrap();
    assert_eq!(wrote, 5);

    let chunk = std::fs::read(cluster.chunk_file("/a", 0)).unwrap();
    assert_eq!(chunk.len(), 15);
    assert_eq!(&chunk[..10], &[0u8; 10]);
    assert_eq!(&chunk[10..], b"HELLO");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_identity() {
    let cluster = Cluster::spawn().await;

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let wrote = cluster
        .client
        .write("/r", 1000, Bytes::from(data.clone()))
        .await
        .unwrap();
    assert_eq!(wrote, 3000);

    let read = cluster.client.read("/r", 1000, 3000).await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_chunk_write_layout() {
    let cluster = Cluster::spawn().await;

    let wrote = cluster
        .client
        .write("/b", 1000, Bytes::from(vec![b'X'; 2048]))
        .await
        .unwrap();
    assert_eq!(wrote, 2048);

    // chunk 0 holds bytes [1000, 1024), chunk 1 is full, chunk 2 holds
    // the remaining 1000 bytes
    assert_eq!(
        std::fs::metadata(cluster.chunk_file("/b", 0)).unwrap().len(),
        1024
    );
    assert_eq!(
        std::fs::metadata(cluster.chunk_file("/b", 1)).unwrap().len(),
        1024
    );
    assert_eq!(
        std::fs::metadata(cluster.chunk_file("/b", 2)).unwrap().len(),
        1000
    );

    let read = cluster.client.read("/b", 1000, 2048).await.unwrap();
    assert_eq!(read, vec![b'X'; 2048]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_missing_chunk_fails_with_enoent() {
    let cluster = Cluster::spawn().await;

    cluster
        .client
        .write("/c", 0, Bytes::from(vec![7u8; 1500]))
        .await
        .unwrap();

    // the range extends into chunks that were never written; missing
    // chunk files fail the read
    let err = cluster.client.read("/c", 1200, 2048).await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_read_within_last_chunk() {
    let cluster = Cluster::spawn().await;

    cluster
        .client
        .write("/s", 0, Bytes::from(vec![9u8; 1500]))
        .await
        .unwrap();

    // both chunks exist; chunk 1 only has 476 bytes, so the read is short
    let read = cluster.client.read("/s", 0, 2048).await.unwrap();
    assert_eq!(read.len(), 1500);
    assert_eq!(read, vec![9u8; 1500]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_stops_at_interior_gap() {
    let cluster = Cluster::spawn().await;

    // two non-contiguous writes: chunk 0 is a genuine 10-byte file while
    // chunks 1 and 2 hold real data at higher offsets
    cluster
        .client
        .write("/x", 0, Bytes::from(vec![4u8; 10]))
        .await
        .unwrap();
    cluster
        .client
        .write("/x", 2000, Bytes::from(vec![6u8; 1024]))
        .await
        .unwrap();

    // the spanning read short-reads on chunk 0; the result must stop at
    // that gap instead of padding it with filler and discarding the tail
    let read = cluster.client.read("/x", 0, 3024).await.unwrap();
    assert_eq!(read, vec![4u8; 10]);

    // the data past the gap is intact when addressed directly
    let read = cluster.client.read("/x", 2000, 1024).await.unwrap();
    assert_eq!(read, vec![6u8; 1024]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncate_shrink_and_idempotence() {
    let cluster = Cluster::spawn().await;

    cluster
        .client
        .write("/d", 0, Bytes::from(vec![3u8; 5000]))
        .await
        .unwrap();

    cluster.client.truncate("/d", 1500).await.unwrap();
    assert_eq!(
        std::fs::metadata(cluster.chunk_file("/d", 1)).unwrap().len(),
        476
    );
    for chunk_id in 2..5 {
        cluster.assert_chunk_absent("/d", chunk_id);
    }

    // truncating to the same length again changes nothing
    cluster.client.truncate("/d", 1500).await.unwrap();
    assert_eq!(
        std::fs::metadata(cluster.chunk_file("/d", 1)).unwrap().len(),
        476
    );

    let read = cluster.client.read("/d", 0, 1500).await.unwrap();
    assert_eq!(read, vec![3u8; 1500]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncate_to_zero_removes_chunk_space() {
    let cluster = Cluster::spawn().await;

    cluster
        .client
        .write("/z", 0, Bytes::from(vec![1u8; 3000]))
        .await
        .unwrap();
    cluster.client.truncate("/z", 0).await.unwrap();

    for root in &cluster.roots {
        assert!(!root.path().join("z").exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disjoint_writes() {
    let cluster = Cluster::spawn().await;

    let first = {
        let client = cluster.client.clone();
        tokio::spawn(async move {
            client
                .write("/e", 0, Bytes::from(vec![b'A'; 2000]))
                .await
                .unwrap()
        })
    };
    let second = {
        let client = cluster.client.clone();
        tokio::spawn(async move {
            client
                .write("/e", 2000, Bytes::from(vec![b'B'; 2000]))
                .await
                .unwrap()
        })
    };
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), 2000);
    assert_eq!(second.unwrap(), 2000);

    // the merge of both writes, byte for byte
    let read = cluster.client.read("/e", 0, 4000).await.unwrap();
    assert_eq!(&read[..2000], &vec![b'A'; 2000][..]);
    assert_eq!(&read[2000..], &vec![b'B'; 2000][..]);

    // no chunk file anywhere may exceed the chunk size
    for chunk_id in 0..4 {
        let len = std::fs::metadata(cluster.chunk_file("/e", chunk_id))
            .unwrap()
            .len();
        assert!(len <= CHUNK_SIZE);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunk_stat_reports_every_daemon() {
    let cluster = Cluster::spawn().await;

    let stats = cluster.client.chunk_stat().await.unwrap();
    assert_eq!(stats.len(), HOST_COUNT as usize);
    for stat in stats {
        assert_eq!(stat.chunk_size, CHUNK_SIZE);
        assert!(stat.chunk_total > 0);
        assert!(stat.chunk_free <= stat.chunk_total);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handshake_rejects_mismatched_chunk_size() {
    let cluster = Cluster::spawn().await;

    // a client planned for a different chunk size must be turned away
    // before it scatters data to wrong owners
    let mut config = ClientConfig::new(cluster.addrs.clone(), 2 * CHUNK_SIZE);
    config.rpc_timeout_ms = 5_000;
    let mismatched = ChunkClient::new(config);
    let err = mismatched.handshake().await.unwrap_err();
    assert_eq!(err.errno, libc::EINVAL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_operations_are_noops() {
    let cluster = Cluster::spawn().await;

    assert_eq!(cluster.client.write("/n", 0, Bytes::new()).await.unwrap(), 0);
    assert!(cluster.client.read("/n", 0, 0).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunk_size_independence() {
    // the same user operations produce the same user-visible bytes no
    // matter how the configuration chunks them
    let small = Cluster::spawn_with_chunk_size(512).await;
    let large = Cluster::spawn_with_chunk_size(2048).await;

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 179) as u8).collect();
    for cluster in [&small, &large] {
        cluster
            .client
            .write("/f", 300, Bytes::from(data.clone()))
            .await
            .unwrap();
        cluster
            .client
            .write("/f", 1000, Bytes::from(vec![0xeeu8; 100]))
            .await
            .unwrap();
        cluster.client.truncate("/f", 4000).await.unwrap();
    }

    let from_small = small.client.read("/f", 300, 3700).await.unwrap();
    let from_large = large.client.read("/f", 300, 3700).await.unwrap();
    assert_eq!(from_small, from_large);
    assert_eq!(&from_small[700..800], &[0xeeu8; 100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunkstats_account_for_traffic() {
    let cluster = Cluster::spawn().await;

    cluster
        .client
        .write("/t", 0, Bytes::from(vec![5u8; 2500]))
        .await
        .unwrap();
    let read = cluster.client.read("/t", 0, 2500).await.unwrap();
    assert_eq!(read.len(), 2500);

    let stats = cluster.contexts.iter().filter_map(|ctx| ctx.stats.as_ref());
    let mut bytes_written = 0;
    let mut bytes_read = 0;
    let mut write_ops = 0;
    for stat in stats {
        bytes_written += stat.bytes_written();
        bytes_read += stat.bytes_read();
        write_ops += stat.op_count(DataOp::WriteChunk);
    }
    assert_eq!(bytes_written, 2500);
    assert_eq!(bytes_read, 2500);
    // 2500 bytes at offset 0 touch chunks 0..=2, one tasklet each
    assert_eq!(write_ops, 3);
}
