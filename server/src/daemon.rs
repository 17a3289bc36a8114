//! The TCP daemon: accepts client connections and runs one frame loop per
//! connection, dispatching into the dedup and restore engines. Engine work
//! is blocking (redb, disk) and runs under `spawn_blocking`.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use cirrus_wire::{frame, metadata, Tag};

use crate::{DedupEngine, Error};

/// Upper bound for a single received frame: a full container round plus
/// metadata slack.
pub const MAX_FRAME_SIZE: usize = 8 << 20;

/// Accept loop. Runs until the listener fails; per-connection errors only
/// close that connection.
pub async fn serve(listener: TcpListener, engine: Arc<DedupEngine>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "accepted connection");
        let engine = engine.clone();
        tokio::spawn(async move {
            match handle_connection(stream, engine).await {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(e) => warn!(%peer, err = %e, "connection closed with error"),
            }
        });
    }
}

#[instrument(skip_all)]
async fn handle_connection(mut stream: TcpStream, engine: Arc<DedupEngine>) -> Result<(), Error> {
    let user_id = frame::read_handshake(&mut stream).await?;
    debug!(user_id, "client handshake");

    // Metadata and bitmap of the answered META frame, consumed by the
    // round's DATA frame. Rounds never interleave on one connection.
    let mut pending: Option<(Arc<Vec<u8>>, Arc<Vec<bool>>)> = None;

    loop {
        let Some((tag, payload)) = frame::read_frame(&mut stream, MAX_FRAME_SIZE).await? else {
            return Ok(());
        };
        match tag {
            Tag::Meta => {
                let meta = Arc::new(payload);
                let reply = {
                    let engine = engine.clone();
                    let meta = meta.clone();
                    tokio::task::spawn_blocking(move || engine.first_stage(user_id, &meta))
                        .await
                        .map_err(|e| Error::StorageError(e.to_string()))??
                };
                frame::write_stat(&mut stream, &reply.duplicates).await?;
                pending = Some((meta, Arc::new(reply.duplicates)));
            }

            Tag::Data => {
                let (meta, duplicates) = pending.take().ok_or_else(|| {
                    Error::InvalidRequest("DATA frame without a preceding META frame".into())
                })?;
                let engine = engine.clone();
                tokio::task::spawn_blocking(move || {
                    engine.second_stage(user_id, &meta, &duplicates, &payload)
                })
                .await
                .map_err(|e| Error::StorageError(e.to_string()))??;
            }

            Tag::Download => {
                let (version, name) = metadata::parse_download(&payload)?;
                let name = name.to_vec();
                let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
                let worker = {
                    let engine = engine.clone();
                    tokio::task::spawn_blocking(move || {
                        engine.restore_share_file(user_id, version, &name, &tx)
                    })
                };
                while let Some(batch) = rx.recv().await {
                    frame::write_restore_frame(&mut stream, &batch).await?;
                }
                worker
                    .await
                    .map_err(|e| Error::StorageError(e.to_string()))??;
            }

            other => {
                return Err(Error::InvalidRequest(format!(
                    "unexpected {:?} frame from a client",
                    other
                )))
            }
        }
    }
}
