//! Client configuration: dispersal and chunking parameters, pipeline
//! widths, and the cluster config file naming one server per cloud.

use std::path::Path;

use cirrus_dispersal::codec::Variant;
use cirrus_dispersal::crypto::CryptoSuite;

use crate::ClientError;

/// How the upload path cuts files into secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Content-defined boundaries from the rolling hash.
    Rabin,
    /// Fixed cuts every `avg_chunk_size` bytes.
    Fixed,
}

/// Tunables of the client pipelines. The defaults mirror a four-cloud
/// deployment tolerating one lost cloud.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total number of clouds (shares per chunk).
    pub n: usize,
    /// Tolerated lost clouds.
    pub m: usize,
    /// Confidentiality degree: shares from which nothing can be derived.
    pub r: usize,
    pub variant: Variant,
    pub suite: CryptoSuite,

    pub chunking: Chunking,
    /// Content-defined chunking bounds; `avg` must be a power of two.
    pub avg_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub sliding_win_size: usize,

    /// Bytes read and chunked per segment.
    pub read_buffer_size: usize,
    /// Per-cloud share accumulation before an upload round.
    pub upload_buffer_size: usize,
    /// Write-back buffer of the restore path.
    pub write_buffer_size: usize,

    pub encoder_workers: usize,
    pub decoder_workers: usize,
    /// Depth of each pipeline channel.
    pub queue_depth: usize,

    /// Encode chunks but never open a connection; for benchmarking the
    /// codec path.
    pub encode_only: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            n: 4,
            m: 1,
            r: 2,
            variant: Variant::CaontRs,
            suite: CryptoSuite::High,
            chunking: Chunking::Rabin,
            avg_chunk_size: 8 * 1024,
            min_chunk_size: 2 * 1024,
            max_chunk_size: 16 * 1024,
            sliding_win_size: 48,
            read_buffer_size: 4 << 20,
            upload_buffer_size: 4 << 20,
            write_buffer_size: 4 << 20,
            encoder_workers: 2,
            decoder_workers: 2,
            queue_depth: 1024,
            encode_only: false,
        }
    }
}

impl ClientConfig {
    /// Shares needed to reconstruct a chunk.
    pub fn k(&self) -> usize {
        self.n - self.m
    }
}

/// The cluster config file: one `<host>:<port>` per line, in cloud order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    endpoints: Vec<String>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ClientError> {
        let mut endpoints = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (host, port) = line.rsplit_once(':').ok_or_else(|| {
                ClientError::Config(format!("line {}: expected <host>:<port>", lineno + 1))
            })?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(ClientError::Config(format!(
                    "line {}: invalid endpoint '{}'",
                    lineno + 1,
                    line
                )));
            }
            endpoints.push(line.to_string());
        }
        if endpoints.is_empty() {
            return Err(ClientError::Config("no endpoints configured".into()));
        }
        Ok(ClusterConfig { endpoints })
    }

    /// The first `count` cloud endpoints, in file order.
    pub fn take(&self, count: usize) -> Result<&[String], ClientError> {
        if self.endpoints.len() < count {
            return Err(ClientError::Config(format!(
                "cluster config names {} clouds but {} are needed",
                self.endpoints.len(),
                count
            )));
        }
        Ok(&self.endpoints[..count])
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_endpoint_per_line() {
        let config = ClusterConfig::parse("127.0.0.1:9001\n127.0.0.1:9002\n").unwrap();
        assert_eq!(config.endpoints(), &["127.0.0.1:9001", "127.0.0.1:9002"]);
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let config = ClusterConfig::parse("# clouds\n\n10.0.0.1:9001\n").unwrap();
        assert_eq!(config.endpoints().len(), 1);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ClusterConfig::parse("no-port-here\n").is_err());
        assert!(ClusterConfig::parse("host:notaport\n").is_err());
        assert!(ClusterConfig::parse("").is_err());
    }

    #[test]
    fn take_checks_the_cloud_count() {
        let config = ClusterConfig::parse("a:1\nb:2\nc:3\n").unwrap();
        assert_eq!(config.take(2).unwrap().len(), 2);
        assert!(config.take(4).is_err());
    }

    #[test]
    fn defaults_match_a_four_cloud_deployment() {
        let config = ClientConfig::default();
        assert_eq!((config.n, config.m, config.r), (4, 1, 2));
        assert_eq!(config.k(), 3);
        assert!(config.avg_chunk_size.is_power_of_two());
        assert!(config.min_chunk_size < config.avg_chunk_size);
        assert!(config.avg_chunk_size < config.max_chunk_size);
    }
}
