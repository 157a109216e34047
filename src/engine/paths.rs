//! Relating a task's root path to a path being browsed or filtered.
//!
//! All matching is separator-aligned: `a/b` is an ancestor of `a/b/c`
//! but not of `a/bc`.

const SEP: char = '/';

/// Split `current_path` into the root a handle should be opened at and the
/// path to list relative to that root.
///
/// When `current_path` lives under `base_path` the task's root handle can be
/// reused, so the root stays at `base_path`. Otherwise the listing gets its
/// own root.
pub fn calculate_list_path(base_path: &str, current_path: &str) -> (String, String) {
	if base_path.is_empty() {
		return (current_path.to_string(), String::new());
	}

	match relation(base_path, current_path) {
		Relation::Same => (base_path.to_string(), String::new()),
		Relation::Descendant(rel) => (base_path.to_string(), rel.to_string()),
		Relation::Unrelated => (current_path.to_string(), String::new()),
	}
}

/// Prefix to prepend to listing-relative paths so filter rules written
/// against `base_path` still apply while listing at `current_path`.
pub fn calculate_filter_prefix(base_path: &str, current_path: &str) -> String {
	if base_path.is_empty() {
		return String::new();
	}

	match relation(base_path, current_path) {
		Relation::Descendant(rel) => format!("{rel}{SEP}"),
		Relation::Same | Relation::Unrelated => String::new(),
	}
}

/// Final segment of `path`. Empty for an empty path or one ending in a separator.
pub fn extract_entry_name(path: &str) -> &str {
	if path.is_empty() || path.ends_with(SEP) {
		return "";
	}
	path.rsplit(SEP).next().unwrap_or(path)
}

enum Relation<'a> {
	Same,
	Descendant(&'a str),
	Unrelated,
}

fn relation<'a>(base_path: &str, current_path: &'a str) -> Relation<'a> {
	let base = base_path.trim_end_matches(SEP);
	let current = current_path.trim_end_matches(SEP);

	if base == current {
		return Relation::Same;
	}

	match current.strip_prefix(base) {
		Some(rest) if rest.starts_with(SEP) => {
			let rel = rest.trim_start_matches(SEP);
			if rel.is_empty() {
				Relation::Same
			} else {
				Relation::Descendant(rel)
			}
		}
		_ => Relation::Unrelated,
	}
}
