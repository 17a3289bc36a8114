//! Serialized records carried inside the frames: the per-round upload
//! metadata (file headers and share entries) and the restore-stream records.
//! All integers little endian; layouts are byte-exact and shared by both
//! ends of the connection.

use thiserror::Error;

use cirrus_dispersal::{Fingerprint, FINGERPRINT_LEN};

/// Serialized size of a [FileShareHeader] including the name-length field.
pub const FILE_SHARE_HEADER_SIZE: usize = 36;
/// Serialized size of a [ShareMeta].
pub const SHARE_META_SIZE: usize = FINGERPRINT_LEN + 12;
/// Serialized size of a [ShareFileHead].
pub const SHARE_FILE_HEAD_SIZE: usize = 12;
/// Serialized size of a [ShareRecord].
pub const SHARE_RECORD_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata buffer truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid count {0} in metadata")]
    InvalidCount(i64),
}

/// The header preceding a file's share entries in a `META` payload.
///
/// The past/coming split lets one file span several upload rounds: the
/// coming counters describe this round, the past counters everything already
/// uploaded in earlier rounds of the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileShareHeader {
    pub file_size: i64,
    pub past_secrets: i32,
    pub past_bytes: i64,
    pub coming_secrets: i32,
    pub coming_bytes: i64,
}

impl FileShareHeader {
    /// Append `header ‖ name` to `out`.
    pub fn encode_with_name(&self, name: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&(name.len() as i32).to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.past_secrets.to_le_bytes());
        out.extend_from_slice(&self.past_bytes.to_le_bytes());
        out.extend_from_slice(&self.coming_secrets.to_le_bytes());
        out.extend_from_slice(&self.coming_bytes.to_le_bytes());
        out.extend_from_slice(name);
    }
}

/// One share's metadata entry within a `META` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareMeta {
    pub fp: Fingerprint,
    pub secret_id: i32,
    pub secret_size: i32,
    pub share_size: i32,
}

impl ShareMeta {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.fp.as_slice());
        out.extend_from_slice(&self.secret_id.to_le_bytes());
        out.extend_from_slice(&self.secret_size.to_le_bytes());
        out.extend_from_slice(&self.share_size.to_le_bytes());
    }
}

/// A parsed `[header ‖ name ‖ entries…]` group of a `META` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub header: FileShareHeader,
    /// The dispersal-encoded name share identifying the file on this cloud.
    pub name: Vec<u8>,
    pub entries: Vec<ShareMeta>,
}

/// Parse a complete `META` payload into its file groups.
pub fn parse_metadata(buf: &[u8]) -> Result<Vec<FileGroup>, MetadataError> {
    let mut groups = Vec::new();
    let mut cur = Cursor { buf, pos: 0 };
    while !cur.done() {
        let name_len = cur.read_i32()?;
        let header = FileShareHeader {
            file_size: cur.read_i64()?,
            past_secrets: cur.read_i32()?,
            past_bytes: cur.read_i64()?,
            coming_secrets: cur.read_i32()?,
            coming_bytes: cur.read_i64()?,
        };
        if name_len < 0 {
            return Err(MetadataError::InvalidCount(name_len as i64));
        }
        if header.coming_secrets < 0 {
            return Err(MetadataError::InvalidCount(header.coming_secrets as i64));
        }
        let name = cur.read_bytes(name_len as usize)?.to_vec();
        let mut entries = Vec::with_capacity(header.coming_secrets as usize);
        for _ in 0..header.coming_secrets {
            entries.push(ShareMeta {
                fp: Fingerprint::try_from(cur.read_bytes(FINGERPRINT_LEN)?)
                    .expect("fingerprint length is fixed"),
                secret_id: cur.read_i32()?,
                secret_size: cur.read_i32()?,
                share_size: cur.read_i32()?,
            });
        }
        groups.push(FileGroup {
            header,
            name,
            entries,
        });
    }
    Ok(groups)
}

/// Head of a restored share stream, sent once per restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareFileHead {
    pub file_size: i64,
    pub share_count: i32,
}

impl ShareFileHead {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.share_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MetadataError> {
        let mut cur = Cursor { buf, pos: 0 };
        Ok(ShareFileHead {
            file_size: cur.read_i64()?,
            share_count: cur.read_i32()?,
        })
    }
}

/// Entry preceding each share body in a restored share stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareRecord {
    pub secret_id: i32,
    pub secret_size: i32,
    pub share_size: i32,
}

impl ShareRecord {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secret_id.to_le_bytes());
        out.extend_from_slice(&self.secret_size.to_le_bytes());
        out.extend_from_slice(&self.share_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MetadataError> {
        let mut cur = Cursor { buf, pos: 0 };
        Ok(ShareRecord {
            secret_id: cur.read_i32()?,
            secret_size: cur.read_i32()?,
            share_size: cur.read_i32()?,
        })
    }
}

/// Encode a `DOWNLOAD` payload: requested version (0 newest, negative for
/// older) followed by the name share.
pub fn encode_download(version: i32, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(name);
    out
}

/// Split a `DOWNLOAD` payload into version and name share.
pub fn parse_download(buf: &[u8]) -> Result<(i32, &[u8]), MetadataError> {
    if buf.len() < 4 {
        return Err(MetadataError::Truncated(buf.len()));
    }
    let version = i32::from_le_bytes(buf[..4].try_into().expect("checked length"));
    Ok((version, &buf[4..]))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], MetadataError> {
        if self.pos + n > self.buf.len() {
            return Err(MetadataError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32, MetadataError> {
        Ok(i32::from_le_bytes(
            self.read_bytes(4)?.try_into().expect("checked length"),
        ))
    }

    fn read_i64(&mut self) -> Result<i64, MetadataError> {
        Ok(i64::from_le_bytes(
            self.read_bytes(8)?.try_into().expect("checked length"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn meta_entry(id: i32) -> ShareMeta {
        ShareMeta {
            fp: Fingerprint::from([id as u8; 32]),
            secret_id: id,
            secret_size: 100 + id,
            share_size: 64,
        }
    }

    #[test]
    fn header_layout_is_byte_exact() {
        let header = FileShareHeader {
            file_size: 0x0102030405060708,
            past_secrets: 1,
            past_bytes: 2,
            coming_secrets: 3,
            coming_bytes: 4,
        };
        let mut out = Vec::new();
        header.encode_with_name(b"ab", &mut out);
        assert_eq!(
            out,
            hex!(
                "02000000"          // name length
                "0807060504030201"  // file size
                "01000000"          // past secrets
                "0200000000000000"  // past bytes
                "03000000"          // coming secrets
                "0400000000000000"  // coming bytes
                "6162"              // name
            )
        );
        assert_eq!(out.len(), FILE_SHARE_HEADER_SIZE + 2);
    }

    #[test]
    fn share_meta_size() {
        let mut out = Vec::new();
        meta_entry(5).encode(&mut out);
        assert_eq!(out.len(), SHARE_META_SIZE);
    }

    #[test]
    fn metadata_roundtrip_multiple_groups() {
        let mut buf = Vec::new();
        let h1 = FileShareHeader {
            file_size: 1000,
            past_secrets: 0,
            past_bytes: 0,
            coming_secrets: 2,
            coming_bytes: 300,
        };
        h1.encode_with_name(b"/some/name-share", &mut buf);
        meta_entry(0).encode(&mut buf);
        meta_entry(1).encode(&mut buf);

        let h2 = FileShareHeader {
            file_size: 50,
            past_secrets: 4,
            past_bytes: 600,
            coming_secrets: 1,
            coming_bytes: 50,
        };
        h2.encode_with_name(b"x", &mut buf);
        meta_entry(2).encode(&mut buf);

        let groups = parse_metadata(&buf).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].header, h1);
        assert_eq!(groups[0].name, b"/some/name-share");
        assert_eq!(groups[0].entries, vec![meta_entry(0), meta_entry(1)]);
        assert_eq!(groups[1].header, h2);
        assert_eq!(groups[1].entries, vec![meta_entry(2)]);
    }

    #[test]
    fn truncated_metadata_is_rejected() {
        let mut buf = Vec::new();
        let h = FileShareHeader {
            file_size: 10,
            past_secrets: 0,
            past_bytes: 0,
            coming_secrets: 3,
            coming_bytes: 30,
        };
        h.encode_with_name(b"n", &mut buf);
        meta_entry(0).encode(&mut buf);
        // two entries missing
        assert!(matches!(
            parse_metadata(&buf),
            Err(MetadataError::Truncated(_))
        ));
    }

    #[test]
    fn share_record_roundtrip() {
        let rec = ShareRecord {
            secret_id: 7,
            secret_size: 4096,
            share_size: 1400,
        };
        let mut out = Vec::new();
        rec.encode(&mut out);
        assert_eq!(out.len(), SHARE_RECORD_SIZE);
        assert_eq!(ShareRecord::decode(&out).unwrap(), rec);
    }

    #[test]
    fn share_file_head_roundtrip() {
        let head = ShareFileHead {
            file_size: 2 << 20,
            share_count: 256,
        };
        let mut out = Vec::new();
        head.encode(&mut out);
        assert_eq!(out.len(), SHARE_FILE_HEAD_SIZE);
        assert_eq!(ShareFileHead::decode(&out).unwrap(), head);
    }

    #[test]
    fn download_payload_roundtrip() {
        let payload = encode_download(-2, b"name-share-bytes");
        let (version, name) = parse_download(&payload).unwrap();
        assert_eq!(version, -2);
        assert_eq!(name, b"name-share-bytes");
    }
}
