//! Tagged frames exchanged between client and server.
//!
//! Every message after the handshake is `{ i32 tag, i32 len, bytes[len] }`
//! in little endian, with two exceptions kept for wire compatibility: the
//! duplicate-status reply carries its element count instead of a byte
//! length, and the restore stream frames use network byte order.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::primitive;

/// Frame tags. The values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Tag {
    /// Client → server: metadata of an upload round.
    Meta = -1,
    /// Client → server: the non-duplicate share bodies of the round.
    Data = -2,
    /// Server → client: duplicate bitmap answering a `Meta` frame.
    Stat = -3,
    /// Server → client: one batch of a restored share file.
    Restore = -5,
    /// Client → server: restore request carrying one name share.
    Download = -7,
}

impl TryFrom<i32> for Tag {
    type Error = FrameError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Tag::Meta),
            -2 => Ok(Tag::Data),
            -3 => Ok(Tag::Stat),
            -5 => Ok(Tag::Restore),
            -7 => Ok(Tag::Download),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame tag {0}")]
    UnknownTag(i32),

    #[error("expected a {expected:?} frame, got {got:?}")]
    UnexpectedTag { expected: Tag, got: Tag },

    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    Oversized { len: i64, max: usize },

    #[error("negative frame length {0}")]
    NegativeLength(i64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Send the connection handshake: the user ID, network byte order.
pub async fn write_handshake<W: AsyncWrite + Unpin>(w: &mut W, user_id: u32) -> std::io::Result<()> {
    primitive::write_u32_be(w, user_id).await?;
    w.flush().await
}

/// Receive the connection handshake.
pub async fn read_handshake<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<u32> {
    primitive::read_u32_be(r).await
}

/// Write a little-endian `{ tag, len, payload }` frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: Tag,
    payload: &[u8],
) -> std::io::Result<()> {
    primitive::write_i32_le(w, tag as i32).await?;
    primitive::write_i32_le(w, payload.len() as i32).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read a little-endian frame, rejecting payloads above `max_len`. Returns
/// `None` on a clean EOF at the frame boundary (the peer closed the
/// connection).
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_len: usize,
) -> Result<Option<(Tag, Vec<u8>)>, FrameError> {
    let tag = match primitive::read_i32_le(r).await {
        Ok(v) => Tag::try_from(v)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = primitive::read_i32_le(r).await? as i64;
    if len < 0 {
        return Err(FrameError::NegativeLength(len));
    }
    if len as usize > max_len {
        return Err(FrameError::Oversized { len, max: max_len });
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some((tag, payload)))
}

/// Write the duplicate-status reply: `{ STAT, i32 count, u8[count] }`,
/// one byte per share of the answered round, 1 meaning "duplicate, skip".
pub async fn write_stat<W: AsyncWrite + Unpin>(
    w: &mut W,
    duplicates: &[bool],
) -> std::io::Result<()> {
    primitive::write_i32_le(w, Tag::Stat as i32).await?;
    primitive::write_i32_le(w, duplicates.len() as i32).await?;
    let bytes: Vec<u8> = duplicates.iter().map(|&d| d as u8).collect();
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Read the duplicate-status reply.
pub async fn read_stat<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<bool>, FrameError> {
    let tag = Tag::try_from(primitive::read_i32_le(r).await?)?;
    if tag != Tag::Stat {
        return Err(FrameError::UnexpectedTag {
            expected: Tag::Stat,
            got: tag,
        });
    }
    let num = primitive::read_i32_le(r).await? as i64;
    if num < 0 {
        return Err(FrameError::NegativeLength(num));
    }
    let mut bytes = vec![0u8; num as usize];
    r.read_exact(&mut bytes).await?;
    Ok(bytes.into_iter().map(|b| b != 0).collect())
}

/// Write one restore-stream frame: `{ u32 tag, u32 len, payload }` in
/// network byte order.
pub async fn write_restore_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    primitive::write_u32_be(w, Tag::Restore as i32 as u32).await?;
    primitive::write_u32_be(w, payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read one restore-stream frame.
pub async fn read_restore_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, FrameError> {
    let tag = primitive::read_u32_be(r).await? as i32;
    let tag = Tag::try_from(tag)?;
    if tag != Tag::Restore {
        return Err(FrameError::UnexpectedTag {
            expected: Tag::Restore,
            got: tag,
        });
    }
    let len = primitive::read_u32_be(r).await? as usize;
    if len > max_len {
        return Err(FrameError::Oversized {
            len: len as i64,
            max: max_len,
        });
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}
