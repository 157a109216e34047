use std::{
	collections::HashMap,
	fmt,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::RemoteConfig;

#[derive(Debug, Error)]
pub enum HandleError {
	#[error("unknown remote: {0}")]
	UnknownRemote(String),

	#[error("remote {remote} unavailable: {reason}")]
	Unavailable { remote: String, reason: String },

	#[error("handle construction aborted: {0}")]
	Aborted(String),

	/// Returned by cache probes that must not construct on a miss.
	#[error("handle not loaded")]
	NotLoaded,
}

/// An opened filesystem. Cheap to share; may hold network sessions.
pub trait Fs: Send + Sync + fmt::Debug {
	/// Remote name, empty for the local filesystem.
	fn name(&self) -> &str;

	/// Root path the handle was opened at, as requested.
	fn root(&self) -> &str;

	/// Where the handle's root lives on this machine, if anywhere.
	fn local_root(&self) -> Option<&Path>;
}

pub type FsRef = Arc<dyn Fs>;

#[derive(Debug)]
pub struct LocalFs {
	root: String,
	path: PathBuf,
}

impl LocalFs {
	pub fn new(root: &str) -> Self {
		Self { root: root.to_string(), path: PathBuf::from(root) }
	}
}

impl Fs for LocalFs {
	fn name(&self) -> &str {
		""
	}

	fn root(&self) -> &str {
		&self.root
	}

	fn local_root(&self) -> Option<&Path> {
		Some(&self.path)
	}
}

/// A configured remote reached through its mount point.
#[derive(Debug)]
pub struct MountedFs {
	remote: String,
	root: String,
	path: PathBuf,
}

impl Fs for MountedFs {
	fn name(&self) -> &str {
		&self.remote
	}

	fn root(&self) -> &str {
		&self.root
	}

	fn local_root(&self) -> Option<&Path> {
		Some(&self.path)
	}
}

/// Builds handles for named remotes.
#[async_trait]
pub trait HandleFactory: Send + Sync {
	async fn open(&self, remote: &str, root: &str) -> Result<FsRef, HandleError>;
}

/// Remotes declared in the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredRemotes {
	remotes: HashMap<String, RemoteConfig>,
}

impl ConfiguredRemotes {
	pub fn new(remotes: HashMap<String, RemoteConfig>) -> Self {
		Self { remotes }
	}
}

#[async_trait]
impl HandleFactory for ConfiguredRemotes {
	async fn open(&self, remote: &str, root: &str) -> Result<FsRef, HandleError> {
		let config = self
			.remotes
			.get(remote)
			.ok_or_else(|| HandleError::UnknownRemote(remote.to_string()))?;

		let meta = tokio::fs::metadata(&config.path).await.map_err(|e| HandleError::Unavailable {
			remote: remote.to_string(),
			reason: format!("{}: {e}", config.path.display()),
		})?;
		if !meta.is_dir() {
			return Err(HandleError::Unavailable {
				remote: remote.to_string(),
				reason: format!("{} is not a directory", config.path.display()),
			});
		}

		Ok(Arc::new(MountedFs {
			remote: remote.to_string(),
			root: root.to_string(),
			path: config.path.join(root.trim_start_matches('/')),
		}))
	}
}

type CacheKey = (String, String);

/// Reuses remote handles across runs. Local paths are never cached.
pub struct HandleCache {
	factory: Arc<dyn HandleFactory>,
	entries: Mutex<HashMap<CacheKey, Arc<OnceCell<FsRef>>>>,
	constructions: AtomicU64,
}

impl HandleCache {
	pub fn new(factory: Arc<dyn HandleFactory>) -> Self {
		Self {
			factory,
			entries: Mutex::new(HashMap::new()),
			constructions: AtomicU64::new(0),
		}
	}

	/// Cached handle for `remote` rooted at `path`, opening it on a miss.
	/// Concurrent misses for the same key share one construction.
	pub async fn get_handle(&self, remote: &str, path: &str) -> Result<FsRef, HandleError> {
		if remote.is_empty() {
			return Ok(Arc::new(LocalFs::new(path)));
		}

		let key = (remote.to_string(), path.to_string());
		let cell = self.lookup(&key, true)?;

		let result = cell
			.get_or_try_init(|| async {
				// Spawned so the handle outlives whichever caller happened to miss first.
				let factory = self.factory.clone();
				let (remote, root) = key.clone();
				let handle = tokio::spawn(async move { factory.open(&remote, &root).await })
					.await
					.map_err(|e| HandleError::Aborted(e.to_string()))??;
				self.constructions.fetch_add(1, Ordering::Relaxed);
				info!(remote = %key.0, root = %key.1, "opened remote handle");
				Ok::<_, HandleError>(handle)
			})
			.await
			.cloned();

		let mut entries = self.lock();
		let still_cached = entries.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell));
		match &result {
			Err(_) if still_cached && !cell.initialized() => {
				entries.remove(&key);
			}
			Ok(_) if !still_cached => {
				debug!(remote = %key.0, root = %key.1, "cache cleared while opening, handle not kept");
			}
			_ => {}
		}
		drop(entries);

		result
	}

	/// Evict every handle opened for `remote`. Returns how many were dropped.
	///
	/// Constructions still in flight finish and are handed to their waiters,
	/// but the result is not cached; the next lookup opens a fresh handle.
	pub fn clear_cache(&self, remote: &str) -> usize {
		let mut entries = self.lock();
		let before = entries.len();
		entries.retain(|(r, _), _| r != remote);
		let evicted = before - entries.len();
		debug!(remote, evicted, "cleared handle cache");
		evicted
	}

	/// Whether a handle for `remote` at `path` is cached. Never opens one.
	pub fn is_loaded(&self, remote: &str, path: &str) -> bool {
		if remote.is_empty() {
			return false;
		}
		let key = (remote.to_string(), path.to_string());
		match self.lookup(&key, false) {
			Ok(cell) => cell.initialized(),
			Err(_) => false,
		}
	}

	pub fn len(&self) -> usize {
		self.lock().values().filter(|c| c.initialized()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// How many handles the factory has built over the cache's lifetime.
	pub fn constructions(&self) -> u64 {
		self.constructions.load(Ordering::Relaxed)
	}

	fn lookup(&self, key: &CacheKey, create: bool) -> Result<Arc<OnceCell<FsRef>>, HandleError> {
		let mut entries = self.lock();
		if let Some(cell) = entries.get(key) {
			return Ok(cell.clone());
		}
		if !create {
			return Err(HandleError::NotLoaded);
		}
		let cell = Arc::new(OnceCell::new());
		entries.insert(key.clone(), cell.clone());
		Ok(cell)
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<OnceCell<FsRef>>>> {
		self.entries.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
