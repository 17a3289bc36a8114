//! The encode pipeline: chunker → encoder workers → ordering collector →
//! per-cloud uploaders.
//!
//! Chunks are dispatched to the encoder workers round-robin and their
//! outputs drained in the same order, so every uploader sees shares in
//! strict secret-ID order. Each uploader accumulates a round of share
//! bodies, announces their metadata, and transmits only the bodies the
//! server does not already hold.
//!
//! The file's path never travels in clear: the collector disperses it with
//! the same codec, and cloud `i` learns only the `i`-th name share.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use cirrus_dispersal::chunker::Chunker;
use cirrus_dispersal::codec::Codec;
use cirrus_dispersal::crypto::{sha256_fingerprint, CryptoPrimitive};
use cirrus_wire::frame::{self, Tag};
use cirrus_wire::metadata::{FileShareHeader, ShareMeta};

use crate::config::{Chunking, ClientConfig, ClusterConfig};
use crate::ClientError;

/// What the chunker hands to an encoder worker.
enum SecretItem {
    Header { path: Vec<u8>, file_size: i64 },
    Secret { id: i32, bytes: Vec<u8>, end: bool },
}

/// What an encoder worker hands to the collector.
enum ShareItem {
    Header {
        path: Vec<u8>,
        file_size: i64,
    },
    Shares {
        id: i32,
        secret_size: i32,
        shares: Vec<Vec<u8>>,
        end: bool,
    },
}

/// What the collector hands to one cloud's uploader.
enum CloudItem {
    Header {
        name_share: Vec<u8>,
        file_size: i64,
    },
    Share {
        secret_id: i32,
        secret_size: i32,
        body: Vec<u8>,
        end: bool,
    },
}

/// Transfer accounting of one upload, summed over all clouds.
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadStats {
    /// Share bytes produced by the codec.
    pub offered: u64,
    /// Share bytes actually transmitted after deduplication.
    pub sent: u64,
}

/// Upload `path` as `user_id` into the cluster.
#[instrument(skip_all, fields(path = %path.display(), user_id = user_id))]
pub async fn upload_file(
    config: &ClientConfig,
    cluster: &ClusterConfig,
    user_id: u32,
    path: &Path,
) -> Result<UploadStats, ClientError> {
    let file_size = tokio::fs::metadata(path).await?.len() as i64;

    // Encoder workers with their input and output queues.
    let workers = config.encoder_workers;
    let mut secret_txs = Vec::with_capacity(workers);
    let mut share_rxs = Vec::with_capacity(workers);
    let mut encoder_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (secret_tx, secret_rx) = mpsc::channel(config.queue_depth);
        let (share_tx, share_rx) = mpsc::channel(config.queue_depth);
        let codec = Codec::new(
            config.variant,
            config.n,
            config.m,
            config.r,
            CryptoPrimitive::new(config.suite),
        )?;
        encoder_handles.push(tokio::spawn(encoder_worker(secret_rx, share_tx, codec)));
        secret_txs.push(secret_tx);
        share_rxs.push(share_rx);
    }

    // One uploader per cloud, unless we only benchmark the codec path.
    let mut cloud_txs = Vec::new();
    let mut uploader_handles = Vec::new();
    if !config.encode_only {
        for (cloud, endpoint) in cluster.take(config.n)?.iter().enumerate() {
            let stream = TcpStream::connect(endpoint).await?;
            let (cloud_tx, cloud_rx) = mpsc::channel(config.queue_depth);
            uploader_handles.push(tokio::spawn(uploader(
                cloud,
                stream,
                cloud_rx,
                user_id,
                config.upload_buffer_size,
            )));
            cloud_txs.push(cloud_tx);
        }
    }

    let name_codec = Codec::new(
        config.variant,
        config.n,
        config.m,
        config.r,
        CryptoPrimitive::new(config.suite),
    )?;
    let collector_handle = tokio::spawn(collector(share_rxs, cloud_txs, name_codec));

    // This task is the chunker.
    let result = dispatch_chunks(config, path, file_size, &secret_txs).await;
    drop(secret_txs);

    for handle in encoder_handles {
        handle.await??;
    }
    collector_handle.await??;

    let mut stats = UploadStats::default();
    for handle in uploader_handles {
        let s = handle.await??;
        stats.offered += s.offered;
        stats.sent += s.sent;
    }
    result?;

    info!(
        file_size,
        offered = stats.offered,
        sent = stats.sent,
        "upload complete"
    );
    Ok(stats)
}

/// Read the file segment by segment, chunk each segment, and feed the
/// encoder queues round-robin. The file header consumes the first
/// round-robin slot so the collector sees it first.
async fn dispatch_chunks(
    config: &ClientConfig,
    path: &Path,
    file_size: i64,
    secret_txs: &[mpsc::Sender<SecretItem>],
) -> Result<(), ClientError> {
    let chunker = match config.chunking {
        Chunking::Rabin => Chunker::rabin(
            config.avg_chunk_size,
            config.min_chunk_size,
            config.max_chunk_size,
            config.sliding_win_size,
        )?,
        Chunking::Fixed => Chunker::fixed(config.avg_chunk_size)?,
    };

    let mut rr = 0usize;
    let send = |rr: &mut usize, item: SecretItem| {
        let tx = secret_txs[*rr % secret_txs.len()].clone();
        *rr += 1;
        async move {
            tx.send(item)
                .await
                .map_err(|_| ClientError::Pipeline("encoder worker is gone".into()))
        }
    };

    send(
        &mut rr,
        SecretItem::Header {
            path: path.as_os_str().as_encoded_bytes().to_vec(),
            file_size,
        },
    )
    .await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; config.read_buffer_size];
    let mut total = 0u64;
    let mut id = 0i32;
    loop {
        let read = read_full(&mut file, &mut buf).await?;
        if read == 0 {
            break;
        }
        let ends = chunker.chunk_ends(&buf[..read]);
        let mut prev: usize = 0;
        for (i, &end) in ends.iter().enumerate() {
            let bytes = buf[prev..=end].to_vec();
            prev = end + 1;
            let last = total + read as u64 == file_size as u64 && i + 1 == ends.len();
            send(
                &mut rr,
                SecretItem::Secret {
                    id,
                    bytes,
                    end: last,
                },
            )
            .await?;
            id += 1;
        }
        total += read as u64;
    }
    debug!(chunks = id, "chunking finished");
    Ok(())
}

async fn encoder_worker(
    mut rx: mpsc::Receiver<SecretItem>,
    tx: mpsc::Sender<ShareItem>,
    mut codec: Codec,
) -> Result<(), ClientError> {
    while let Some(item) = rx.recv().await {
        let out = match item {
            SecretItem::Header { path, file_size } => ShareItem::Header { path, file_size },
            SecretItem::Secret { id, bytes, end } => {
                let shares = codec.encode(&bytes)?;
                ShareItem::Shares {
                    id,
                    secret_size: bytes.len() as i32,
                    shares,
                    end,
                }
            }
        };
        if tx.send(out).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Drain the encoder outputs in dispatch order, restoring total secret-ID
/// order, and fan each chunk's shares out to the uploaders.
async fn collector(
    mut share_rxs: Vec<mpsc::Receiver<ShareItem>>,
    cloud_txs: Vec<mpsc::Sender<CloudItem>>,
    mut name_codec: Codec,
) -> Result<(), ClientError> {
    let workers = share_rxs.len();
    let mut rr = 0usize;
    loop {
        let Some(item) = share_rxs[rr % workers].recv().await else {
            // The next expected item's queue is closed: dispatch is over
            // and everything before it has been drained.
            break;
        };
        rr += 1;

        match item {
            ShareItem::Header { path, file_size } => {
                let name_shares = name_codec.encode(&path)?;
                for (i, tx) in cloud_txs.iter().enumerate() {
                    tx.send(CloudItem::Header {
                        name_share: name_shares[i].clone(),
                        file_size,
                    })
                    .await
                    .map_err(|_| ClientError::Pipeline("uploader is gone".into()))?;
                }
            }
            ShareItem::Shares {
                id,
                secret_size,
                shares,
                end,
            } => {
                for (i, tx) in cloud_txs.iter().enumerate() {
                    tx.send(CloudItem::Share {
                        secret_id: id,
                        secret_size,
                        body: shares[i].clone(),
                        end,
                    })
                    .await
                    .map_err(|_| ClientError::Pipeline("uploader is gone".into()))?;
                }
            }
        }
    }
    Ok(())
}

/// One cloud's uploader: buffer share bodies and run an upload round when
/// the buffer would overflow or the file ends.
async fn uploader<S>(
    cloud: usize,
    mut stream: S,
    mut rx: mpsc::Receiver<CloudItem>,
    user_id: u32,
    buffer_cap: usize,
) -> Result<UploadStats, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_handshake(&mut stream, user_id).await?;

    let mut header: Option<FileShareHeader> = None;
    let mut name = Vec::new();
    let mut entries: Vec<ShareMeta> = Vec::new();
    let mut container: Vec<u8> = Vec::with_capacity(buffer_cap);
    let mut stats = UploadStats::default();
    let mut rounds = 0u32;

    while let Some(item) = rx.recv().await {
        match item {
            CloudItem::Header {
                name_share,
                file_size,
            } => {
                header = Some(FileShareHeader {
                    file_size,
                    past_secrets: 0,
                    past_bytes: 0,
                    coming_secrets: 0,
                    coming_bytes: 0,
                });
                name = name_share;
            }
            CloudItem::Share {
                secret_id,
                secret_size,
                body,
                end,
            } => {
                let head = header
                    .as_mut()
                    .ok_or_else(|| ClientError::Protocol("share before file header".into()))?;

                if container.len() + body.len() > buffer_cap {
                    run_round(&mut stream, head, &name, &mut entries, &mut container, &mut stats)
                        .await?;
                    rounds += 1;
                }

                entries.push(ShareMeta {
                    fp: sha256_fingerprint(&body),
                    secret_id,
                    secret_size,
                    share_size: body.len() as i32,
                });
                container.extend_from_slice(&body);
                head.coming_secrets += 1;
                head.coming_bytes += secret_size as i64;

                if end {
                    run_round(&mut stream, head, &name, &mut entries, &mut container, &mut stats)
                        .await?;
                    rounds += 1;
                }
            }
        }
    }

    // A file with no chunks (empty input) never sets the end flag; it still
    // needs one round to register with the server.
    if let Some(head) = header.as_mut() {
        if head.coming_secrets > 0 || rounds == 0 {
            run_round(&mut stream, head, &name, &mut entries, &mut container, &mut stats).await?;
        }
    }

    // Half-close and wait for the server's EOF: the server drains its frame
    // loop sequentially, so EOF here means the last round is fully ingested.
    stream.shutdown().await?;
    let mut sink = [0u8; 1];
    let _ = stream.read(&mut sink).await;

    debug!(cloud, offered = stats.offered, sent = stats.sent, "uploader finished");
    Ok(stats)
}

/// One META → STAT → DATA exchange: announce the round's metadata, learn
/// which shares are duplicates, and transmit only the fresh bodies in their
/// original order. Afterwards the round's counters fold into the past
/// counters and the buffers reset.
async fn run_round<S>(
    stream: &mut S,
    header: &mut FileShareHeader,
    name: &[u8],
    entries: &mut Vec<ShareMeta>,
    container: &mut Vec<u8>,
    stats: &mut UploadStats,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut meta = Vec::with_capacity(
        cirrus_wire::metadata::FILE_SHARE_HEADER_SIZE
            + name.len()
            + entries.len() * cirrus_wire::metadata::SHARE_META_SIZE,
    );
    header.encode_with_name(name, &mut meta);
    for entry in entries.iter() {
        entry.encode(&mut meta);
    }
    frame::write_frame(stream, Tag::Meta, &meta).await?;

    let duplicates = frame::read_stat(stream).await?;
    if duplicates.len() != entries.len() {
        return Err(ClientError::Protocol(format!(
            "server answered {} duplicate flags for {} shares",
            duplicates.len(),
            entries.len()
        )));
    }

    let mut compacted = Vec::with_capacity(container.len());
    let mut offset = 0usize;
    for (entry, &dup) in entries.iter().zip(&duplicates) {
        let size = entry.share_size as usize;
        if !dup {
            compacted.extend_from_slice(&container[offset..offset + size]);
        }
        offset += size;
    }
    frame::write_frame(stream, Tag::Data, &compacted).await?;

    stats.offered += container.len() as u64;
    stats.sent += compacted.len() as u64;

    header.past_secrets += header.coming_secrets;
    header.past_bytes += header.coming_bytes;
    header.coming_secrets = 0;
    header.coming_bytes = 0;
    entries.clear();
    container.clear();
    Ok(())
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_wire::metadata::parse_metadata;

    /// Drive one uploader over an in-memory duplex against a scripted
    /// server answering "share 1 is a duplicate".
    #[tokio::test]
    async fn round_announces_all_and_transmits_only_fresh_shares() {
        let (client_end, mut server_end) = tokio::io::duplex(1 << 20);
        let (tx, rx) = mpsc::channel(16);
        let uploader_handle = tokio::spawn(uploader(0, client_end, rx, 9, 1 << 20));

        tx.send(CloudItem::Header {
            name_share: b"name".to_vec(),
            file_size: 300,
        })
        .await
        .unwrap();
        let bodies: [&[u8]; 3] = [b"first-share", b"second-share", b"third-share"];
        for (i, body) in bodies.iter().enumerate() {
            tx.send(CloudItem::Share {
                secret_id: i as i32,
                secret_size: 100,
                body: body.to_vec(),
                end: i == 2,
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(frame::read_handshake(&mut server_end).await.unwrap(), 9);

        let (tag, meta) = frame::read_frame(&mut server_end, 1 << 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, Tag::Meta);
        let groups = parse_metadata(&meta).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, b"name");
        assert_eq!(groups[0].header.coming_secrets, 3);
        assert_eq!(groups[0].header.coming_bytes, 300);
        let ids: Vec<i32> = groups[0].entries.iter().map(|e| e.secret_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(groups[0].entries[1].fp, sha256_fingerprint(b"second-share"));

        frame::write_stat(&mut server_end, &[false, true, false])
            .await
            .unwrap();

        let (tag, data) = frame::read_frame(&mut server_end, 1 << 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, Tag::Data);
        assert_eq!(data, b"first-sharethird-share".to_vec());

        // EOF back to the uploader so it can finish.
        drop(server_end);
        let stats = uploader_handle.await.unwrap().unwrap();
        assert_eq!(stats.offered, 34);
        assert_eq!(stats.sent, 22);
    }

    /// A header with no shares at all (an empty file) still produces one
    /// registration round.
    #[tokio::test]
    async fn header_only_upload_runs_one_round() {
        let (client_end, mut server_end) = tokio::io::duplex(1 << 16);
        let (tx, rx) = mpsc::channel(4);
        let uploader_handle = tokio::spawn(uploader(0, client_end, rx, 1, 1 << 16));

        tx.send(CloudItem::Header {
            name_share: b"empty".to_vec(),
            file_size: 0,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(frame::read_handshake(&mut server_end).await.unwrap(), 1);
        let (tag, meta) = frame::read_frame(&mut server_end, 1 << 16)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, Tag::Meta);
        let groups = parse_metadata(&meta).unwrap();
        assert_eq!(groups[0].header.coming_secrets, 0);
        assert!(groups[0].entries.is_empty());

        frame::write_stat(&mut server_end, &[]).await.unwrap();
        let (tag, data) = frame::read_frame(&mut server_end, 1 << 16)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, Tag::Data);
        assert!(data.is_empty());

        drop(server_end);
        let stats = uploader_handle.await.unwrap().unwrap();
        assert_eq!(stats.offered, 0);
    }
}
