//! Observes how many queries the authoritative server has answered.
//!
//! The counter is owned by the outside world, all we ever do is take snapshots. A probe brackets
//! its query with two snapshots, and any difference means the resolver went to the authoritative
//! server instead of answering from its cache.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::CounterError;

/// A monotonic count of queries received by the authoritative server.
#[async_trait::async_trait]
pub trait QueryCounter: Send + Sync {
	/// The current count.
	async fn snapshot(&self) -> Result<u64, CounterError>;
}

/// The difference between two snapshots.
pub fn delta(before: u64, after: u64) -> Result<u64, CounterError> {
	after.checked_sub(before).ok_or(CounterError::NotMonotonic { before, after })
}

/// Counts the lines of a query log which record a query.
///
/// BIND logs each query as `client @0x... 172.28.0.3#41234 (name): query: name IN A +E(0)D`.
pub fn count_queries(log: &[u8]) -> u64 {
	const MARKER: &[u8] = b"query:";
	log.split(|b| *b == b'\n')
		.filter(|line| line.windows(MARKER.len()).any(|w| w == MARKER))
		.count() as u64
}

/// A [`QueryCounter`] reading the authoritative server's query log.
///
/// A log which doesn't exist yet counts as no queries.
#[derive(Debug, Clone)]
pub struct QueryLogCounter {
	path: PathBuf,
}

impl QueryLogCounter {
	/// Creates a counter over the log at `path`.
	pub fn new<P: Into<PathBuf>>(path: P) -> Self {
		QueryLogCounter { path: path.into() }
	}

	/// The log being read.
	pub fn path(&self) -> &Path { &self.path }
}

#[async_trait::async_trait]
impl QueryCounter for QueryLogCounter {
	async fn snapshot(&self) -> Result<u64, CounterError> {
		match tokio::fs::read(&self.path).await {
			Ok(log) => Ok(count_queries(&log)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
			Err(e) => Err(e.into()),
		}
	}
}
