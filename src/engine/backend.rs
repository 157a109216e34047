use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{filter::FilterError, handles::FsRef, stats::TransferStats};
use crate::models::ConflictPolicy;

#[derive(Debug, Error)]
pub enum BackendError {
	#[error("transfer cancelled")]
	Cancelled,

	#[error("handle {0:?} has no local root")]
	UnsupportedHandle(String),

	#[error(transparent)]
	Filter(#[from] FilterError),

	#[error("source path does not exist: {0}")]
	SourceMissing(PathBuf),

	#[error("I/O error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{failed} file(s) failed to sync")]
	FilesFailed { failed: u64 },

	#[error("worker failed: {0}")]
	Worker(String),
}

impl BackendError {
	pub fn is_cancelled(&self) -> bool {
		matches!(self, BackendError::Cancelled)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
	pub filters: Vec<String>,
	pub no_delete: bool,
	pub transfers: usize,
	pub conflict_policy: ConflictPolicy,
}

/// The engine that actually moves bytes.
///
/// Implementations record every file operation in `stats` and observe
/// `cancel` between units of work, returning [`BackendError::Cancelled`]
/// once it fires.
#[async_trait]
pub trait SyncBackend: Send + Sync {
	/// Make `dst` match `src`, deleting extra files unless `no_delete`.
	async fn run_one_way(
		&self,
		cancel: &CancellationToken,
		src: FsRef,
		dst: FsRef,
		opts: &SyncOptions,
		stats: Arc<TransferStats>,
	) -> Result<(), BackendError>;

	/// Reconcile `a` and `b` in both directions.
	async fn run_bidirectional(
		&self,
		cancel: &CancellationToken,
		a: FsRef,
		b: FsRef,
		opts: &SyncOptions,
		stats: Arc<TransferStats>,
	) -> Result<(), BackendError>;
}
