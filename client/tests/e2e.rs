//! End-to-end exercises of the full pipeline: in-process servers on
//! localhost, one per cloud, driven by the real client pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::TcpListener;

use cirrus_client::config::{ClientConfig, ClusterConfig};
use cirrus_client::{download, upload};
use cirrus_server::{daemon, DedupEngine};

struct Cluster {
    roots: Vec<TempDir>,
    config: ClusterConfig,
    engines: Vec<Arc<DedupEngine>>,
}

async fn start_cluster(n: usize) -> Cluster {
    let mut lines = String::new();
    let mut roots = Vec::new();
    let mut engines = Vec::new();
    for _ in 0..n {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(DedupEngine::open(root.path()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        lines.push_str(&format!("127.0.0.1:{}\n", port));
        tokio::spawn(daemon::serve(listener, engine.clone()));
        roots.push(root);
        engines.push(engine);
    }
    Cluster {
        roots,
        config: ClusterConfig::parse(&lines).unwrap(),
        engines,
    }
}

impl Cluster {
    /// Total bytes of sealed share containers across all clouds.
    fn container_bytes(&self) -> u64 {
        self.roots
            .iter()
            .map(|root| {
                std::fs::read_dir(root.path().join("ShareContainers"))
                    .unwrap()
                    .map(|e| e.unwrap().metadata().unwrap().len())
                    .sum::<u64>()
            })
            .sum()
    }

    fn flush_all(&self) {
        for engine in &self.engines {
            engine.flush_all().unwrap();
        }
    }
}

fn write_test_file(dir: &Path, len: usize, seed: u64) -> PathBuf {
    let mut state = seed | 1;
    let data: Vec<u8> = (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect();
    let path = dir.join("input.bin");
    std::fs::write(&path, data).unwrap();
    path
}

async fn download_to(
    cluster: &Cluster,
    config: &ClientConfig,
    user: u32,
    remote: &Path,
    dir: &Path,
    name: &str,
) -> Vec<u8> {
    let out = dir.join(name);
    download::download_file(config, &cluster.config, user, remote, 0, &out)
        .await
        .unwrap();
    std::fs::read(&out).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_then_download_roundtrip() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 512 * 1024, 0xc1);
    let config = ClientConfig::default();

    let stats = upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    assert!(stats.offered > 0);
    assert_eq!(stats.sent, stats.offered, "first upload is all fresh data");

    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert_eq!(restored, std::fs::read(&path).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn re_upload_transmits_nothing() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 256 * 1024, 0xc2);
    let config = ClientConfig::default();

    upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    let stats = upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    assert!(stats.offered > 0);
    assert_eq!(stats.sent, 0, "identical re-upload is fully deduplicated");

    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert_eq!(restored, std::fs::read(&path).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_user_upload_stores_nothing_new() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 256 * 1024, 0xc3);
    let config = ClientConfig::default();

    upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    cluster.flush_all();
    let stored_before = cluster.container_bytes();
    assert!(stored_before > 0);

    // The duplicate bitmap is intra-user only, so user 2 transmits the
    // bodies; convergent shares mean the servers store none of them.
    let stats = upload::upload_file(&config, &cluster.config, 2, &path)
        .await
        .unwrap();
    assert_eq!(stats.sent, stats.offered);
    cluster.flush_all();
    assert_eq!(cluster.container_bytes(), stored_before);

    // Both users can restore their file independently.
    let restored1 = download_to(&cluster, &config, 1, &path, dir.path(), "r1").await;
    let restored2 = download_to(&cluster, &config, 2, &path, dir.path(), "r2").await;
    let original = std::fs::read(&path).unwrap();
    assert_eq!(restored1, original);
    assert_eq!(restored2, original);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_round_upload_restores_identically() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 256 * 1024, 0xc4);

    // A tiny round buffer forces many META/STAT/DATA rounds per file.
    let mut config = ClientConfig::default();
    config.upload_buffer_size = 8 * 1024;

    upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert_eq!(restored, std::fs::read(&path).unwrap());

    // The same bytes uploaded in one round by another user dedup fully
    // against the multi-round copy.
    let single = ClientConfig::default();
    cluster.flush_all();
    let stored_before = cluster.container_bytes();
    upload::upload_file(&single, &cluster.config, 2, &path)
        .await
        .unwrap();
    cluster.flush_all();
    assert_eq!(cluster.container_bytes(), stored_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_roundtrip() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.bin");
    std::fs::write(&path, b"").unwrap();
    let config = ClientConfig::default();

    let stats = upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    assert_eq!(stats.offered, 0);

    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert!(restored.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_size_chunking_roundtrip() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 100 * 1024, 0xc6);
    let mut config = ClientConfig::default();
    config.chunking = cirrus_client::config::Chunking::Fixed;

    upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert_eq!(restored, std::fs::read(&path).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn low_security_suite_roundtrip() {
    let cluster = start_cluster(4).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_file(dir.path(), 64 * 1024, 0xc5);
    let mut config = ClientConfig::default();
    config.suite = cirrus_dispersal::crypto::CryptoSuite::Low;

    upload::upload_file(&config, &cluster.config, 1, &path)
        .await
        .unwrap();
    let restored = download_to(&cluster, &config, 1, &path, dir.path(), "restored").await;
    assert_eq!(restored, std::fs::read(&path).unwrap());
}
