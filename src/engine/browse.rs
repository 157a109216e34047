//! Listing a directory of a task's source or destination.

use std::path::PathBuf;

use thiserror::Error;

use super::{
	filter::{FilterError, FilterRules},
	handles::{HandleCache, HandleError},
	local::PARTIAL_SUFFIX,
	paths::{calculate_filter_prefix, calculate_list_path, extract_entry_name},
};

#[derive(Debug, Error)]
pub enum BrowseError {
	#[error(transparent)]
	Handle(#[from] HandleError),

	#[error(transparent)]
	Filter(#[from] FilterError),

	#[error("remote {0:?} cannot be listed from this machine")]
	NotLocal(String),

	#[error("failed to list {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	pub name: String,
	/// `current_path` joined with `name`.
	pub path: String,
	pub is_dir: bool,
	pub size: u64,
}

/// List `current_path` on `remote`, applying rules written against `base_path`.
///
/// Browsing anywhere under `base_path` reuses the handle cached for the
/// task's root. Directories are always listed; filters apply to files.
pub async fn list_entries(
	cache: &HandleCache,
	remote: &str,
	base_path: &str,
	current_path: &str,
	filters: &[String],
) -> Result<Vec<Entry>, BrowseError> {
	let (root, relative) = calculate_list_path(base_path, current_path);
	let rules = FilterRules::parse(filters)?.with_prefix(&calculate_filter_prefix(base_path, current_path));

	let handle = cache.get_handle(remote, &root).await?;
	let dir = match handle.local_root() {
		Some(path) if relative.is_empty() => path.to_path_buf(),
		Some(path) => path.join(&relative),
		None => return Err(BrowseError::NotLocal(remote.to_string())),
	};

	let io_err = |source| BrowseError::Io { path: dir.clone(), source };
	let mut read = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
	let parent = current_path.trim_end_matches('/');
	let mut entries = Vec::new();

	while let Some(item) = read.next_entry().await.map_err(io_err)? {
		let file_name = item.file_name().to_string_lossy().into_owned();
		if file_name.ends_with(PARTIAL_SUFFIX) {
			continue;
		}
		let file_type = item.file_type().await.map_err(io_err)?;
		if file_type.is_symlink() {
			continue;
		}
		let is_dir = file_type.is_dir();
		if !is_dir && !rules.includes(&file_name) {
			continue;
		}

		let size = if is_dir { 0 } else { item.metadata().await.map_err(io_err)?.len() };
		let path = if parent.is_empty() { file_name } else { format!("{parent}/{file_name}") };
		entries.push(Entry {
			name: extract_entry_name(&path).to_string(),
			path,
			is_dir,
			size,
		});
	}

	entries.sort_by(|a, b| a.name.cmp(&b.name));
	Ok(entries)
}

#[cfg(test)]
mod tests {
	use std::{collections::HashMap, fs, sync::Arc};

	use super::*;
	use crate::{config::RemoteConfig, engine::handles::ConfiguredRemotes};

	fn cache(mount: &std::path::Path) -> HandleCache {
		let remotes = HashMap::from([("nas".to_string(), RemoteConfig { path: mount.to_path_buf() })]);
		HandleCache::new(Arc::new(ConfiguredRemotes::new(remotes)))
	}

	#[tokio::test]
	async fn lists_sorted_and_sized() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("photos");
		fs::create_dir_all(root.join("2024")).unwrap();
		fs::write(root.join("b.jpg"), "bb").unwrap();
		fs::write(root.join("a.jpg"), "a").unwrap();
		fs::write(root.join(".c.jpg.kip-partial"), "half").unwrap();

		let cache = cache(tmp.path());
		let entries = list_entries(&cache, "nas", "photos", "photos", &[]).await.unwrap();

		let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["2024", "a.jpg", "b.jpg"]);
		assert!(entries[0].is_dir);
		assert_eq!(entries[2].size, 2);
		assert_eq!(entries[2].path, "photos/b.jpg");
	}

	#[tokio::test]
	async fn subdirectories_reuse_the_root_handle() {
		let tmp = tempfile::tempdir().unwrap();
		fs::create_dir_all(tmp.path().join("photos/2024/summer")).unwrap();
		fs::write(tmp.path().join("photos/2024/summer/beach.jpg"), "sand").unwrap();

		let cache = cache(tmp.path());
		list_entries(&cache, "nas", "photos", "photos", &[]).await.unwrap();
		let entries = list_entries(&cache, "nas", "photos", "photos/2024/summer/", &[]).await.unwrap();

		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].name, "beach.jpg");
		assert_eq!(entries[0].path, "photos/2024/summer/beach.jpg");
		assert_eq!(cache.constructions(), 1);
		assert!(cache.is_loaded("nas", "photos"));
		assert!(!cache.is_loaded("nas", "photos/2024/summer/"));
	}

	#[tokio::test]
	async fn rules_apply_relative_to_the_base() {
		let tmp = tempfile::tempdir().unwrap();
		fs::create_dir_all(tmp.path().join("docs/raw")).unwrap();
		fs::write(tmp.path().join("docs/raw/keep.txt"), "k").unwrap();
		fs::write(tmp.path().join("docs/raw/skip.txt"), "s").unwrap();

		let cache = cache(tmp.path());
		let rules = vec!["- raw/skip.txt".to_string()];
		let entries = list_entries(&cache, "nas", "docs", "docs/raw", &rules).await.unwrap();

		let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["keep.txt"]);
	}

	#[tokio::test]
	async fn local_paths_are_listed_without_caching() {
		let tmp = tempfile::tempdir().unwrap();
		fs::write(tmp.path().join("note.md"), "hi").unwrap();
		let dir = tmp.path().to_str().unwrap();

		let cache = cache(tmp.path());
		let entries = list_entries(&cache, "", "", dir, &[]).await.unwrap();

		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].name, "note.md");
		assert!(cache.is_empty());
	}

	#[tokio::test]
	async fn unknown_remote_fails() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = cache(tmp.path());
		let err = list_entries(&cache, "nope", "", "x", &[]).await.unwrap_err();
		assert!(matches!(err, BrowseError::Handle(HandleError::UnknownRemote(_))));
	}
}
