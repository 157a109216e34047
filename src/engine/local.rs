//! Filesystem-to-filesystem sync engine for handles with a local root.

use std::{
	collections::{BTreeMap, BTreeSet},
	fs,
	io::{self, Read, Write},
	path::{Path, PathBuf},
	sync::Arc,
	time::SystemTime,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{
	backend::{BackendError, SyncBackend, SyncOptions},
	filter::FilterRules,
	handles::FsRef,
	stats::{Operation, TransferStats},
};
use crate::models::ConflictPolicy;

const CHUNK_SIZE: usize = 256 * 1024; // 256KB
const PROGRESS_INTERVAL: usize = 4; // report every 4 chunks (~1MB)
pub(super) const PARTIAL_SUFFIX: &str = ".kip-partial";

#[derive(Debug, Error)]
enum CopyError {
	#[error("source file not found: {0}")]
	SourceNotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("disk full: {0}")]
	DiskFull(String),

	#[error("I/O error: {0}")]
	IoError(String),

	#[error("hash mismatch: source={source_hash}, dest={dest_hash}")]
	HashMismatch {
		source_hash: String,
		dest_hash: String,
	},

	#[error("cancelled")]
	Cancelled,
}

#[derive(Debug, Clone)]
struct FileEntry {
	/// Relative path as found on disk. Tree keys are lossy and only fit for display and filtering.
	path: PathBuf,
	size: u64,
	modified: SystemTime,
}

/// One side's tree plus what the walk could not see.
#[derive(Debug, Default)]
struct Walk {
	tree: Tree,
	skipped: u64,
	/// Unreadable directories or entries. Files below them are missing from `tree`.
	errors: u64,
}

type Tree = BTreeMap<String, FileEntry>;

/// One file to copy from one root to the other.
#[derive(Debug, Clone)]
struct CopyTask {
	rel: String,
	size: u64,
	modified: SystemTime,
	from: PathBuf,
	to: PathBuf,
	src_label: String,
	dst_label: String,
}

/// Both ends of a copy direction.
#[derive(Debug, Clone)]
struct Side {
	root: PathBuf,
	label: String,
}

impl Side {
	fn of(fs: &FsRef) -> Result<Self, BackendError> {
		let root = fs
			.local_root()
			.ok_or_else(|| BackendError::UnsupportedHandle(format!("{}:{}", fs.name(), fs.root())))?;
		Ok(Self { root: root.to_path_buf(), label: fs.root().to_string() })
	}

	fn task(&self, to: &Side, rel: &str, entry: &FileEntry) -> CopyTask {
		CopyTask {
			rel: rel.to_string(),
			size: entry.size,
			modified: entry.modified,
			from: self.root.join(&entry.path),
			to: to.root.join(&entry.path),
			src_label: self.label.clone(),
			dst_label: to.label.clone(),
		}
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

impl LocalBackend {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl SyncBackend for LocalBackend {
	async fn run_one_way(
		&self,
		cancel: &CancellationToken,
		src: FsRef,
		dst: FsRef,
		opts: &SyncOptions,
		stats: Arc<TransferStats>,
	) -> Result<(), BackendError> {
		let src = Side::of(&src)?;
		let dst = Side::of(&dst)?;
		let filters = FilterRules::parse(&opts.filters)?;

		if !tokio::fs::metadata(&src.root).await.map(|m| m.is_dir()).unwrap_or(false) {
			return Err(BackendError::SourceMissing(src.root.clone()));
		}

		let (src_tree, dst_tree, unreadable) = walk_both(&src.root, &dst.root, &filters, &stats).await?;
		info!(
			src = %src.label,
			dst = %dst.label,
			src_files = src_tree.len(),
			dst_files = dst_tree.len(),
			"planning one-way sync"
		);

		let (copies, mut failed) = {
			let (src, dst, cancel, stats) = (src.clone(), dst.clone(), cancel.clone(), stats.clone());
			let (src_tree, dst_tree) = (src_tree.clone(), dst_tree.clone());
			tokio::task::spawn_blocking(move || plan_one_way(&src, &dst, &src_tree, &dst_tree, &cancel, &stats))
				.await
				.map_err(|e| BackendError::Worker(format!("task join error: {e}")))??
		};

		failed += copy_all(cancel, copies, opts.transfers, &stats).await?;
		failed += unreadable;

		// A file missing from an incomplete source listing may still exist.
		if !opts.no_delete && unreadable > 0 {
			warn!(src = %src.label, unreadable, "skipping deletions, source could not be fully listed");
		} else if !opts.no_delete {
			for rel in dst_tree.keys().filter(|rel| !src_tree.contains_key(*rel)) {
				if cancel.is_cancelled() {
					return Err(BackendError::Cancelled);
				}
				let id = stats.begin(rel, dst_tree[rel].size, Operation::Deleting, &src.label, &dst.label);
				match tokio::fs::remove_file(dst.root.join(&dst_tree[rel].path)).await {
					Ok(()) => stats.finish(id, Ok(())),
					Err(e) => {
						warn!(path = %rel, "delete failed: {e}");
						stats.finish(id, Err(e.to_string()));
						failed += 1;
					}
				}
			}
		}

		if failed > 0 {
			return Err(BackendError::FilesFailed { failed });
		}
		Ok(())
	}

	async fn run_bidirectional(
		&self,
		cancel: &CancellationToken,
		a: FsRef,
		b: FsRef,
		opts: &SyncOptions,
		stats: Arc<TransferStats>,
	) -> Result<(), BackendError> {
		let a = Side::of(&a)?;
		let b = Side::of(&b)?;
		let filters = FilterRules::parse(&opts.filters)?;

		if !tokio::fs::metadata(&a.root).await.map(|m| m.is_dir()).unwrap_or(false) {
			return Err(BackendError::SourceMissing(a.root.clone()));
		}

		let (a_tree, b_tree, unreadable) = walk_both(&a.root, &b.root, &filters, &stats).await?;
		info!(a = %a.label, b = %b.label, a_files = a_tree.len(), b_files = b_tree.len(), "planning two-way sync");

		let policy = opts.conflict_policy;
		let (copies, mut failed) = {
			let (cancel, stats) = (cancel.clone(), stats.clone());
			tokio::task::spawn_blocking(move || plan_two_way(&a, &b, &a_tree, &b_tree, policy, &cancel, &stats))
				.await
				.map_err(|e| BackendError::Worker(format!("task join error: {e}")))??
		};

		failed += copy_all(cancel, copies, opts.transfers, &stats).await?;
		failed += unreadable;

		if failed > 0 {
			return Err(BackendError::FilesFailed { failed });
		}
		Ok(())
	}
}

/// Walk both roots. The count is how many entries either walk could not read;
/// each affected side is recorded as a failed listing.
async fn walk_both(
	first: &Path,
	second: &Path,
	filters: &FilterRules,
	stats: &Arc<TransferStats>,
) -> Result<(Tree, Tree, u64), BackendError> {
	let (first, second, filters, stats) = (first.to_path_buf(), second.to_path_buf(), filters.clone(), stats.clone());
	tokio::task::spawn_blocking(move || {
		let mut trees = Vec::with_capacity(2);
		let mut unreadable = 0u64;
		for root in [&first, &second] {
			let label = root.to_string_lossy();
			let id = stats.begin("", 0, Operation::Listing, &label, &label);
			match walk_tree(root, &filters) {
				Ok(walk) => {
					if walk.skipped > 0 {
						debug!(root = %label, skipped = walk.skipped, "skipped symlinks");
					}
					if walk.errors > 0 {
						stats.finish(id, Err(format!("{label}: {} entries could not be read", walk.errors)));
						unreadable += walk.errors;
					} else {
						stats.finish(id, Ok(()));
					}
					trees.push(walk.tree);
				}
				Err(e) => {
					stats.finish(id, Err(e.to_string()));
					return Err(e);
				}
			}
		}
		let second = trees.pop().unwrap_or_default();
		let first = trees.pop().unwrap_or_default();
		Ok((first, second, unreadable))
	})
	.await
	.map_err(|e| BackendError::Worker(format!("task join error: {e}")))?
}

/// Collect every regular file below `root` that passes `filters`, keyed by
/// slash-separated relative path. A missing root is an empty tree.
fn walk_tree(root: &Path, filters: &FilterRules) -> Result<Walk, BackendError> {
	let mut walk = Walk::default();

	if !root.exists() {
		return Ok(walk);
	}
	if !root.is_dir() {
		return Err(BackendError::Io {
			path: root.to_path_buf(),
			source: io::Error::new(io::ErrorKind::Other, "not a directory"),
		});
	}

	for result in WalkDir::new(root).follow_links(false) {
		let entry = match result {
			Ok(e) => e,
			Err(e) => {
				warn!(root = %root.display(), "unreadable entry: {e}");
				walk.errors += 1;
				continue;
			}
		};

		if entry.file_type().is_dir() {
			continue;
		}
		if entry.file_type().is_symlink() {
			walk.skipped += 1;
			continue;
		}
		if entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
			continue;
		}

		let Ok(rel_path) = entry.path().strip_prefix(root).map(Path::to_path_buf) else {
			walk.errors += 1;
			continue;
		};
		let relative = rel_path
			.components()
			.map(|c| c.as_os_str().to_string_lossy())
			.collect::<Vec<_>>()
			.join("/");
		if !filters.includes(&relative) {
			continue;
		}

		let metadata = match entry.metadata() {
			Ok(m) => m,
			Err(e) => {
				warn!(path = %relative, "unreadable metadata: {e}");
				walk.errors += 1;
				continue;
			}
		};

		walk.tree.insert(
			relative,
			FileEntry {
				path: rel_path,
				size: metadata.len(),
				modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
			},
		);
	}

	Ok(walk)
}

fn plan_one_way(
	src: &Side,
	dst: &Side,
	src_tree: &Tree,
	dst_tree: &Tree,
	cancel: &CancellationToken,
	stats: &TransferStats,
) -> Result<(Vec<CopyTask>, u64), BackendError> {
	let mut copies = Vec::new();
	let mut failed = 0u64;

	for (rel, entry) in src_tree {
		if cancel.is_cancelled() {
			return Err(BackendError::Cancelled);
		}
		let needs_copy = match dst_tree.get(rel) {
			None => true,
			Some(existing) => match differs(src, dst, rel, entry, existing, stats) {
				Ok(differs) => differs,
				Err(_) => {
					failed += 1;
					continue;
				}
			},
		};
		if needs_copy {
			copies.push(src.task(dst, rel, entry));
		}
	}

	Ok((copies, failed))
}

fn plan_two_way(
	a: &Side,
	b: &Side,
	a_tree: &Tree,
	b_tree: &Tree,
	policy: ConflictPolicy,
	cancel: &CancellationToken,
	stats: &TransferStats,
) -> Result<(Vec<CopyTask>, u64), BackendError> {
	let mut copies = Vec::new();
	let mut failed = 0u64;
	let paths: BTreeSet<&String> = a_tree.keys().chain(b_tree.keys()).collect();

	for rel in paths {
		if cancel.is_cancelled() {
			return Err(BackendError::Cancelled);
		}
		match (a_tree.get(rel), b_tree.get(rel)) {
			(Some(entry), None) => copies.push(a.task(b, rel, entry)),
			(None, Some(entry)) => copies.push(b.task(a, rel, entry)),
			(Some(a_entry), Some(b_entry)) => match differs(a, b, rel, a_entry, b_entry, stats) {
				Ok(false) => {}
				Ok(true) => {
					if a_wins(policy, a_entry, b_entry) {
						copies.push(a.task(b, rel, a_entry));
					} else {
						copies.push(b.task(a, rel, b_entry));
					}
				}
				Err(_) => failed += 1,
			},
			(None, None) => {}
		}
	}

	Ok((copies, failed))
}

/// Ties go to the first path.
fn a_wins(policy: ConflictPolicy, a: &FileEntry, b: &FileEntry) -> bool {
	match policy {
		ConflictPolicy::Newer => a.modified >= b.modified,
		ConflictPolicy::Older => a.modified <= b.modified,
		ConflictPolicy::Larger => a.size >= b.size,
		ConflictPolicy::Smaller => a.size <= b.size,
		ConflictPolicy::Path1 => true,
		ConflictPolicy::Path2 => false,
	}
}

/// Size first, then modification time, then content hash.
fn differs(
	left: &Side,
	right: &Side,
	rel: &str,
	l: &FileEntry,
	r: &FileEntry,
	stats: &TransferStats,
) -> Result<bool, CopyError> {
	if l.size != r.size {
		return Ok(true);
	}
	if l.modified == r.modified {
		return Ok(false);
	}

	let id = stats.begin(rel, l.size, Operation::Checking, &left.label, &right.label);
	let result = hash_file(&left.root.join(&l.path))
		.and_then(|lh| hash_file(&right.root.join(&r.path)).map(|rh| lh != rh));
	match &result {
		Ok(_) => stats.finish(id, Ok(())),
		Err(e) => stats.finish(id, Err(e.to_string())),
	}
	result
}

/// Run copies with at most `transfers` in flight. Returns how many failed.
async fn copy_all(
	cancel: &CancellationToken,
	copies: Vec<CopyTask>,
	transfers: usize,
	stats: &Arc<TransferStats>,
) -> Result<u64, BackendError> {
	let semaphore = Arc::new(Semaphore::new(transfers.max(1)));
	let mut handles = Vec::with_capacity(copies.len());

	for task in copies {
		let permit = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			permit = semaphore.clone().acquire_owned() => {
				permit.map_err(|e| BackendError::Worker(e.to_string()))?
			}
		};
		let stats = stats.clone();
		let cancel = cancel.clone();

		handles.push(tokio::task::spawn_blocking(move || {
			let result = copy_file(&task, &stats, &cancel);
			drop(permit);
			(task.rel, result)
		}));
	}

	let mut failed = 0u64;
	for handle in handles {
		match handle.await {
			Ok((_, Ok(()))) | Ok((_, Err(CopyError::Cancelled))) => {}
			Ok((rel, Err(e))) => {
				warn!(path = %rel, "copy failed: {e}");
				failed += 1;
			}
			Err(e) => {
				warn!("copy worker panicked: {e}");
				stats.record_error();
				failed += 1;
			}
		}
	}

	if cancel.is_cancelled() {
		return Err(BackendError::Cancelled);
	}
	Ok(failed)
}

fn copy_file(task: &CopyTask, stats: &TransferStats, cancel: &CancellationToken) -> Result<(), CopyError> {
	let id = stats.begin(&task.rel, task.size, Operation::Transferring, &task.src_label, &task.dst_label);
	let result = copy_and_hash(&task.from, &task.to, task.modified, cancel, |bytes| stats.progress(id, bytes));
	match &result {
		Ok(bytes) => {
			debug!(path = %task.rel, bytes, "copied");
			stats.finish(id, Ok(()));
		}
		Err(e) => stats.finish(id, Err(e.to_string())),
	}
	result.map(|_| ())
}

/// Single pass: read → hash → write to a partial file, verify, rename into place.
fn copy_and_hash(
	source_path: &Path,
	dest_path: &Path,
	modified: SystemTime,
	cancel: &CancellationToken,
	mut on_progress: impl FnMut(u64),
) -> Result<u64, CopyError> {
	if let Some(parent) = dest_path.parent() {
		fs::create_dir_all(parent).map_err(|e| map_io_error(e, parent))?;
	}
	let partial = partial_path(dest_path);

	let result = (|| {
		let mut source = fs::File::open(source_path).map_err(|e| map_io_error(e, source_path))?;
		let mut dest = fs::File::create(&partial).map_err(|e| map_io_error(e, &partial))?;

		let mut hasher = blake3::Hasher::new();
		let mut buf = vec![0u8; CHUNK_SIZE];
		let mut bytes_copied: u64 = 0;
		let mut chunks_since_progress = 0usize;

		loop {
			if cancel.is_cancelled() {
				return Err(CopyError::Cancelled);
			}
			let n = source.read(&mut buf).map_err(|e| map_io_error(e, source_path))?;
			if n == 0 {
				break;
			}

			hasher.update(&buf[..n]);
			dest.write_all(&buf[..n]).map_err(|e| map_io_error(e, &partial))?;

			bytes_copied += n as u64;
			chunks_since_progress += 1;

			if chunks_since_progress >= PROGRESS_INTERVAL {
				chunks_since_progress = 0;
				on_progress(bytes_copied);
			}
		}

		dest.flush().map_err(|e| map_io_error(e, &partial))?;
		dest.set_modified(modified).map_err(|e| map_io_error(e, &partial))?;
		drop(dest);

		let source_hash = hasher.finalize().to_hex().to_string();
		let dest_hash = hash_file(&partial)?;
		if source_hash != dest_hash {
			return Err(CopyError::HashMismatch { source_hash, dest_hash });
		}

		fs::rename(&partial, dest_path).map_err(|e| map_io_error(e, dest_path))?;
		on_progress(bytes_copied);
		Ok(bytes_copied)
	})();

	if result.is_err() {
		let _ = fs::remove_file(&partial);
	}
	result
}

fn partial_path(dest_path: &Path) -> PathBuf {
	let name = dest_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
	dest_path.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

/// Hash a file using blake3 in 256KB chunks.
fn hash_file(path: &Path) -> Result<String, CopyError> {
	let mut file = fs::File::open(path).map_err(|e| map_io_error(e, path))?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];

	loop {
		let n = file.read(&mut buf).map_err(|e| map_io_error(e, path))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}

	Ok(hasher.finalize().to_hex().to_string())
}

fn map_io_error(err: io::Error, path: &Path) -> CopyError {
	let path = path.display().to_string();
	match err.kind() {
		io::ErrorKind::NotFound => CopyError::SourceNotFound(path),
		io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(path),
		io::ErrorKind::StorageFull => CopyError::DiskFull(path),
		_ => CopyError::IoError(format!("{path}: {err}")),
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::engine::handles::LocalFs;

	fn opts(no_delete: bool) -> SyncOptions {
		SyncOptions {
			filters: Vec::new(),
			no_delete,
			transfers: 2,
			conflict_policy: ConflictPolicy::Newer,
		}
	}

	fn handle(path: &Path) -> FsRef {
		Arc::new(LocalFs::new(path.to_str().unwrap()))
	}

	fn set_mtime(path: &Path, time: SystemTime) {
		fs::File::options().write(true).open(path).unwrap().set_modified(time).unwrap();
	}

	#[tokio::test]
	async fn one_way_copies_new_files() {
		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(src.join("nested")).unwrap();
		fs::write(src.join("hello.txt"), "hello world").unwrap();
		fs::write(src.join("nested/a.bin"), vec![7u8; CHUNK_SIZE * 2 + 5]).unwrap();

		let stats = Arc::new(TransferStats::new());
		LocalBackend::new()
			.run_one_way(&CancellationToken::new(), handle(&src), handle(&dst), &opts(false), stats.clone())
			.await
			.unwrap();

		assert_eq!(fs::read_to_string(dst.join("hello.txt")).unwrap(), "hello world");
		assert_eq!(fs::read(dst.join("nested/a.bin")).unwrap().len(), CHUNK_SIZE * 2 + 5);

		let counters = stats.counters();
		assert_eq!(counters.transfers, 2);
		assert_eq!(counters.bytes, 11 + (CHUNK_SIZE * 2 + 5) as u64);
		assert_eq!(counters.errors, 0);
	}

	#[tokio::test]
	async fn second_run_skips_unchanged_files() {
		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(&src).unwrap();
		fs::write(src.join("same.txt"), "unchanged").unwrap();

		let backend = LocalBackend::new();
		let cancel = CancellationToken::new();
		backend
			.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), Arc::new(TransferStats::new()))
			.await
			.unwrap();

		let stats = Arc::new(TransferStats::new());
		backend.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), stats.clone()).await.unwrap();
		assert_eq!(stats.counters().transfers, 0);
	}

	#[tokio::test]
	async fn deletes_extra_files_unless_no_delete() {
		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(&src).unwrap();
		fs::create_dir_all(&dst).unwrap();
		fs::write(dst.join("stale.txt"), "old").unwrap();

		let backend = LocalBackend::new();
		let cancel = CancellationToken::new();

		let stats = Arc::new(TransferStats::new());
		backend.run_one_way(&cancel, handle(&src), handle(&dst), &opts(true), stats.clone()).await.unwrap();
		assert!(dst.join("stale.txt").exists());
		assert_eq!(stats.counters().deletes, 0);

		let stats = Arc::new(TransferStats::new());
		backend.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), stats.clone()).await.unwrap();
		assert!(!dst.join("stale.txt").exists());
		assert_eq!(stats.counters().deletes, 1);
	}

	#[tokio::test]
	async fn filters_limit_copies_and_deletes() {
		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(&src).unwrap();
		fs::create_dir_all(&dst).unwrap();
		fs::write(src.join("keep.txt"), "k").unwrap();
		fs::write(src.join("skip.tmp"), "s").unwrap();
		fs::write(dst.join("other.tmp"), "o").unwrap();

		let mut options = opts(false);
		options.filters = vec!["- *.tmp".into()];
		LocalBackend::new()
			.run_one_way(&CancellationToken::new(), handle(&src), handle(&dst), &options, Arc::new(TransferStats::new()))
			.await
			.unwrap();

		assert!(dst.join("keep.txt").exists());
		assert!(!dst.join("skip.tmp").exists());
		// excluded on the destination too, so it is left alone
		assert!(dst.join("other.tmp").exists());
	}

	#[tokio::test]
	async fn missing_source_is_an_error() {
		let tmp = tempfile::tempdir().unwrap();
		let err = LocalBackend::new()
			.run_one_way(
				&CancellationToken::new(),
				handle(&tmp.path().join("nope")),
				handle(&tmp.path().join("dst")),
				&opts(false),
				Arc::new(TransferStats::new()),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, BackendError::SourceMissing(_)));
	}

	#[tokio::test]
	async fn cancelled_token_stops_the_run() {
		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(&src).unwrap();
		fs::write(src.join("a.txt"), "a").unwrap();

		let cancel = CancellationToken::new();
		cancel.cancel();
		let err = LocalBackend::new()
			.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), Arc::new(TransferStats::new()))
			.await
			.unwrap_err();
		assert!(err.is_cancelled());
		assert!(!dst.join("a.txt").exists());
	}

	#[tokio::test]
	async fn two_way_merges_and_resolves_conflicts() {
		let tmp = tempfile::tempdir().unwrap();
		let (a, b) = (tmp.path().join("a"), tmp.path().join("b"));
		fs::create_dir_all(&a).unwrap();
		fs::create_dir_all(&b).unwrap();
		fs::write(a.join("only_a.txt"), "a").unwrap();
		fs::write(b.join("only_b.txt"), "b").unwrap();
		fs::write(a.join("both.txt"), "old!").unwrap();
		fs::write(b.join("both.txt"), "new!").unwrap();

		let now = SystemTime::now();
		set_mtime(&a.join("both.txt"), now - Duration::from_secs(3600));
		set_mtime(&b.join("both.txt"), now);

		let stats = Arc::new(TransferStats::new());
		LocalBackend::new()
			.run_bidirectional(&CancellationToken::new(), handle(&a), handle(&b), &opts(false), stats.clone())
			.await
			.unwrap();

		assert!(b.join("only_a.txt").exists());
		assert!(a.join("only_b.txt").exists());
		assert_eq!(fs::read_to_string(a.join("both.txt")).unwrap(), "new!");
		assert_eq!(stats.counters().transfers, 3);
	}

	#[test]
	fn conflict_policies() {
		let now = SystemTime::now();
		let older = FileEntry { path: "f".into(), size: 10, modified: now - Duration::from_secs(60) };
		let newer = FileEntry { path: "f".into(), size: 5, modified: now };

		assert!(!a_wins(ConflictPolicy::Newer, &older, &newer));
		assert!(a_wins(ConflictPolicy::Older, &older, &newer));
		assert!(a_wins(ConflictPolicy::Larger, &older, &newer));
		assert!(!a_wins(ConflictPolicy::Smaller, &older, &newer));
		assert!(a_wins(ConflictPolicy::Path1, &older, &newer));
		assert!(!a_wins(ConflictPolicy::Path2, &older, &newer));
	}

	#[test]
	fn hash_multichunk_file() {
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("big.bin");
		let data = vec![42u8; CHUNK_SIZE * 3 + 1000];
		fs::write(&f, &data).unwrap();

		let hash = hash_file(&f).unwrap();
		let expected = blake3::hash(&data).to_hex().to_string();
		assert_eq!(hash, expected);
	}

	#[test]
	fn hash_file_not_found() {
		let err = hash_file(Path::new("/tmp/kip_definitely_not_real.txt")).unwrap_err();
		assert!(matches!(err, CopyError::SourceNotFound(_)));
	}

	#[test]
	fn walk_skips_symlinks_and_partials() {
		let tmp = tempfile::tempdir().unwrap();
		fs::create_dir_all(tmp.path().join("subdir/deep")).unwrap();
		fs::write(tmp.path().join("root.txt"), "hello").unwrap();
		fs::write(tmp.path().join("subdir/deep/bottom.txt"), "abcdefghij").unwrap();
		fs::write(tmp.path().join(".x.txt.kip-partial"), "junk").unwrap();
		std::os::unix::fs::symlink(tmp.path().join("root.txt"), tmp.path().join("link.txt")).unwrap();

		let walk = walk_tree(tmp.path(), &FilterRules::default()).unwrap();

		assert_eq!(walk.skipped, 1);
		assert_eq!(walk.errors, 0);
		let paths: Vec<&str> = walk.tree.keys().map(String::as_str).collect();
		assert_eq!(paths, vec!["root.txt", "subdir/deep/bottom.txt"]);
		assert_eq!(walk.tree["subdir/deep/bottom.txt"].size, 10);
	}

	#[tokio::test]
	async fn unreadable_source_dir_blocks_deletions() {
		use std::os::unix::fs::PermissionsExt;

		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(src.join("sub")).unwrap();
		fs::write(src.join("sub/a.txt"), "precious").unwrap();
		fs::write(src.join("top.txt"), "top").unwrap();

		let backend = LocalBackend::new();
		let cancel = CancellationToken::new();
		backend
			.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), Arc::new(TransferStats::new()))
			.await
			.unwrap();
		fs::write(dst.join("stale.txt"), "stale").unwrap();

		fs::set_permissions(src.join("sub"), fs::Permissions::from_mode(0o000)).unwrap();
		if fs::read_dir(src.join("sub")).is_ok() {
			// permissions are not enforced for this user (root)
			fs::set_permissions(src.join("sub"), fs::Permissions::from_mode(0o755)).unwrap();
			return;
		}

		let stats = Arc::new(TransferStats::new());
		let result = backend
			.run_one_way(&cancel, handle(&src), handle(&dst), &opts(false), stats.clone())
			.await;
		fs::set_permissions(src.join("sub"), fs::Permissions::from_mode(0o755)).unwrap();

		assert!(matches!(result, Err(BackendError::FilesFailed { .. })));
		assert_eq!(fs::read_to_string(dst.join("sub/a.txt")).unwrap(), "precious");
		assert!(dst.join("stale.txt").exists());
		assert_eq!(stats.counters().deletes, 0);
		assert!(stats.counters().errors >= 1);
		assert!(stats.snapshots().iter().any(|s| s.operation == Operation::Listing && s.error.is_some()));
	}

	#[tokio::test]
	async fn non_utf8_names_are_copied() {
		use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

		let tmp = tempfile::tempdir().unwrap();
		let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
		fs::create_dir_all(&src).unwrap();
		let name = OsStr::from_bytes(b"caf\xe9.txt");
		fs::write(src.join(name), "latin-1").unwrap();

		let stats = Arc::new(TransferStats::new());
		LocalBackend::new()
			.run_one_way(&CancellationToken::new(), handle(&src), handle(&dst), &opts(false), stats.clone())
			.await
			.unwrap();

		assert_eq!(fs::read_to_string(dst.join(name)).unwrap(), "latin-1");
		assert_eq!(stats.counters().transfers, 1);

		// unchanged on the second run, and not deleted as an extra
		LocalBackend::new()
			.run_one_way(&CancellationToken::new(), handle(&src), handle(&dst), &opts(false), stats.clone())
			.await
			.unwrap();
		assert!(dst.join(name).exists());
		assert_eq!(stats.counters().deletes, 0);
	}
}
