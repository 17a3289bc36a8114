//! The decode pipeline: per-cloud downloaders → share assembler → decoder
//! workers → ordered writer.
//!
//! The client contacts `k` clouds, sends each its name share of the wanted
//! path, and receives that cloud's share stream. Per secret, the assembler
//! pairs the `i`-th share from cloud `i` into a k-share group and hands it
//! to a decoder; the writer drains decoder outputs in dispatch order and
//! appends the plaintext chunks to the output file through a write-back
//! buffer. The first failed decode aborts the restore.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use cirrus_dispersal::codec::Codec;
use cirrus_dispersal::crypto::CryptoPrimitive;
use cirrus_dispersal::CodecError;
use cirrus_wire::frame;
use cirrus_wire::metadata::{
    self, ShareFileHead, ShareRecord, SHARE_FILE_HEAD_SIZE, SHARE_RECORD_SIZE,
};

use crate::config::{ClientConfig, ClusterConfig};
use crate::ClientError;

/// Largest restore frame the client accepts.
const MAX_RESTORE_FRAME: usize = 8 << 20;

enum DownloadItem {
    Head(ShareFileHead),
    Share(ShareRecord, Vec<u8>),
}

struct DecodeJob {
    shares: Vec<Vec<u8>>,
    secret_size: i32,
}

/// Download `remote_path` (version `0` newest, `-v` older) as `user_id`
/// from the first `k` clouds and write the plaintext to `output`.
#[instrument(skip_all, fields(remote_path = %remote_path.display(), user_id = user_id))]
pub async fn download_file(
    config: &ClientConfig,
    cluster: &ClusterConfig,
    user_id: u32,
    remote_path: &Path,
    version: i32,
    output: &Path,
) -> Result<(), ClientError> {
    let k = config.k();

    // The same convergent encoding as on upload reproduces the name share
    // each cloud knows the file by.
    let mut name_codec = Codec::new(
        config.variant,
        config.n,
        config.m,
        config.r,
        CryptoPrimitive::new(config.suite),
    )?;
    let name_shares = name_codec.encode(remote_path.as_os_str().as_encoded_bytes())?;

    // One downloader per selected cloud.
    let mut item_rxs = Vec::with_capacity(k);
    let mut downloader_handles = Vec::with_capacity(k);
    for (cloud, endpoint) in cluster.take(k)?.iter().enumerate() {
        let mut stream = TcpStream::connect(endpoint).await?;
        frame::write_handshake(&mut stream, user_id).await?;
        frame::write_frame(
            &mut stream,
            cirrus_wire::Tag::Download,
            &metadata::encode_download(version, &name_shares[cloud]),
        )
        .await?;

        let (tx, rx) = mpsc::channel(config.queue_depth);
        downloader_handles.push(tokio::spawn(downloader(cloud, stream, tx)));
        item_rxs.push(rx);
    }

    // Every cloud announces the same share count.
    let mut share_count = None;
    for (cloud, rx) in item_rxs.iter_mut().enumerate() {
        match rx.recv().await {
            Some(DownloadItem::Head(head)) => match share_count {
                None => share_count = Some(head.share_count),
                Some(count) if count == head.share_count => {}
                Some(count) => {
                    return Err(ClientError::Protocol(format!(
                        "cloud {} announces {} shares, cloud 0 announced {}",
                        cloud, head.share_count, count
                    )))
                }
            },
            _ => {
                return Err(ClientError::Protocol(format!(
                    "cloud {} did not start with a share-file head",
                    cloud
                )))
            }
        }
    }
    let share_count = share_count
        .ok_or_else(|| ClientError::Protocol("no clouds selected for download".into()))?;
    debug!(share_count, "download stream established");

    // Decoder workers.
    let workers = config.decoder_workers;
    let mut job_txs = Vec::with_capacity(workers);
    let mut plain_rxs: Vec<mpsc::Receiver<Result<Vec<u8>, CodecError>>> = Vec::with_capacity(workers);
    let mut decoder_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (job_tx, job_rx) = mpsc::channel::<DecodeJob>(config.queue_depth);
        let (plain_tx, plain_rx) = mpsc::channel(config.queue_depth);
        let codec = Codec::new(
            config.variant,
            config.n,
            config.m,
            config.r,
            CryptoPrimitive::new(config.suite),
        )?;
        decoder_handles.push(tokio::spawn(decoder_worker(job_rx, plain_tx, codec, k)));
        job_txs.push(job_tx);
    }

    // Assemble per-secret share groups and dispatch them round-robin.
    let assembler_handle = tokio::spawn(assembler(item_rxs, job_txs, share_count, k));

    // This task is the writer.
    let mut file = tokio::fs::File::create(output).await?;
    let mut buffer: Vec<u8> = Vec::with_capacity(config.write_buffer_size);
    for idx in 0..share_count {
        let plain = plain_rxs[idx as usize % workers]
            .recv()
            .await
            .ok_or_else(|| ClientError::Pipeline("decoder is gone".into()))??;
        if buffer.len() + plain.len() > config.write_buffer_size {
            file.write_all(&buffer).await?;
            buffer.clear();
        }
        buffer.extend_from_slice(&plain);
    }
    if !buffer.is_empty() {
        file.write_all(&buffer).await?;
    }
    file.flush().await?;

    assembler_handle.await??;
    for handle in decoder_handles {
        handle.await??;
    }
    for handle in downloader_handles {
        handle.await??;
    }

    info!(share_count, output = %output.display(), "download complete");
    Ok(())
}

/// Parse one cloud's restore stream: the head, then records interleaved
/// with their share bodies, possibly spanning frame boundaries.
async fn downloader<S>(
    cloud: usize,
    mut stream: S,
    tx: mpsc::Sender<DownloadItem>,
) -> Result<(), ClientError>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    let mut frame = frame::read_restore_frame(&mut stream, MAX_RESTORE_FRAME).await?;
    if frame.len() < SHARE_FILE_HEAD_SIZE {
        return Err(ClientError::Protocol("restore stream without head".into()));
    }
    let head = ShareFileHead::decode(&frame)?;
    let total = head.share_count;
    tx.send(DownloadItem::Head(head))
        .await
        .map_err(|_| ClientError::Pipeline("download consumer is gone".into()))?;

    let mut pos = SHARE_FILE_HEAD_SIZE;
    let mut received = 0i32;
    while received < total {
        if pos == frame.len() {
            frame = frame::read_restore_frame(&mut stream, MAX_RESTORE_FRAME).await?;
            pos = 0;
        }
        let record = ShareRecord::decode(&frame[pos..])?;
        pos += SHARE_RECORD_SIZE;
        let share_size = usize::try_from(record.share_size)
            .map_err(|_| ClientError::Protocol("negative share size in stream".into()))?;
        let body = frame
            .get(pos..pos + share_size)
            .ok_or_else(|| ClientError::Protocol("share body split across frames".into()))?
            .to_vec();
        pos += share_size;

        tx.send(DownloadItem::Share(record, body))
            .await
            .map_err(|_| ClientError::Pipeline("download consumer is gone".into()))?;
        received += 1;
    }
    debug!(cloud, shares = received, "downloader finished");
    Ok(())
}

/// Pull one share per cloud for every secret and dispatch the assembled
/// group to the decoders, round-robin.
async fn assembler(
    mut item_rxs: Vec<mpsc::Receiver<DownloadItem>>,
    job_txs: Vec<mpsc::Sender<DecodeJob>>,
    share_count: i32,
    k: usize,
) -> Result<(), ClientError> {
    for idx in 0..share_count {
        let mut shares = Vec::with_capacity(k);
        let mut secret_size = 0;
        for rx in item_rxs.iter_mut() {
            match rx.recv().await {
                Some(DownloadItem::Share(record, body)) => {
                    secret_size = record.secret_size;
                    shares.push(body);
                }
                _ => {
                    return Err(ClientError::Protocol(
                        "restore stream ended before all shares arrived".into(),
                    ))
                }
            }
        }
        job_txs[idx as usize % job_txs.len()]
            .send(DecodeJob {
                shares,
                secret_size,
            })
            .await
            .map_err(|_| ClientError::Pipeline("decoder is gone".into()))?;
    }
    Ok(())
}

async fn decoder_worker(
    mut rx: mpsc::Receiver<DecodeJob>,
    tx: mpsc::Sender<Result<Vec<u8>, CodecError>>,
    mut codec: Codec,
    k: usize,
) -> Result<(), ClientError> {
    // Shares arrive in cloud order; cloud i serves share ID i.
    let ids: Vec<usize> = (0..k).collect();
    while let Some(job) = rx.recv().await {
        let result = codec.decode(&job.shares, &ids, job.secret_size as usize);
        if tx.send(result).await.is_err() {
            break;
        }
    }
    Ok(())
}
