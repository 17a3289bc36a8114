//! The cirrus client: chunks a file, disperses every chunk into `n` shares,
//! and uploads the `i`-th share of each chunk to the `i`-th cloud of the
//! cluster; the download path mirrors it, reassembling chunks from any `k`
//! clouds.

pub mod config;
pub mod download;
pub mod upload;

mod errors;

pub use errors::ClientError;
