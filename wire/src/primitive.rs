//! Integer primitives of the wire format.
//!
//! Framed messages use little-endian integers; the connection handshake and
//! the restore stream use network byte order.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read an i32 from the AsyncRead (little endian).
pub async fn read_i32_le<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<i32> {
    r.read_i32_le().await
}

/// Write an i32 to the AsyncWrite (little endian).
pub async fn write_i32_le<W: AsyncWrite + Unpin>(w: &mut W, v: i32) -> std::io::Result<()> {
    w.write_i32_le(v).await
}

/// Read an i64 from the AsyncRead (little endian).
pub async fn read_i64_le<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<i64> {
    r.read_i64_le().await
}

/// Write an i64 to the AsyncWrite (little endian).
pub async fn write_i64_le<W: AsyncWrite + Unpin>(w: &mut W, v: i64) -> std::io::Result<()> {
    w.write_i64_le(v).await
}

/// Read a u32 from the AsyncRead (network byte order).
pub async fn read_u32_be<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<u32> {
    r.read_u32().await
}

/// Write a u32 to the AsyncWrite (network byte order).
pub async fn write_u32_be<W: AsyncWrite + Unpin>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_u32(v).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_i32_le() {
        let mut mock = Builder::new().read(&(-7i32).to_le_bytes()).build();
        assert_eq!(-7, read_i32_le(&mut mock).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_i32_le() {
        let mut mock = Builder::new().write(&(-7i32).to_le_bytes()).build();
        write_i32_le(&mut mock, -7).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_i64_le() {
        let mut mock = Builder::new().read(&1234567890123i64.to_le_bytes()).build();
        assert_eq!(1234567890123, read_i64_le(&mut mock).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_i64_le() {
        let mut mock = Builder::new().write(&1234567890123i64.to_le_bytes()).build();
        write_i64_le(&mut mock, 1234567890123).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_u32_be() {
        let mut mock = Builder::new().read(&42u32.to_be_bytes()).build();
        assert_eq!(42, read_u32_be(&mut mock).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_u32_be() {
        let mut mock = Builder::new().write(&42u32.to_be_bytes()).build();
        write_u32_be(&mut mock, 42).await.unwrap();
    }
}
