use globset::{GlobBuilder, GlobMatcher};
use thiserror::Error;

use super::paths::extract_entry_name;

#[derive(Debug, Error)]
pub enum FilterError {
	#[error("filter rule must start with '+ ' or '- ': {0:?}")]
	MissingSign(String),

	#[error("invalid filter pattern {pattern:?}: {source}")]
	InvalidPattern {
		pattern: String,
		#[source]
		source: globset::Error,
	},
}

#[derive(Debug, Clone)]
struct Rule {
	include: bool,
	/// Patterns without a separator match the file name at any depth.
	name_only: bool,
	matcher: GlobMatcher,
}

/// Compiled include/exclude rules. First matching rule wins; paths that
/// match nothing are included.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
	rules: Vec<Rule>,
	prefix: String,
}

impl FilterRules {
	pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, FilterError> {
		let mut compiled = Vec::with_capacity(rules.len());

		for raw in rules {
			let line = raw.as_ref().trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			let (include, pattern) = if let Some(rest) = line.strip_prefix("+ ") {
				(true, rest.trim())
			} else if let Some(rest) = line.strip_prefix("- ") {
				(false, rest.trim())
			} else {
				return Err(FilterError::MissingSign(line.to_string()));
			};

			let anchored = pattern.trim_start_matches('/');
			let name_only = !pattern.contains('/');
			let matcher = GlobBuilder::new(anchored)
				.literal_separator(true)
				.build()
				.map_err(|source| FilterError::InvalidPattern {
					pattern: pattern.to_string(),
					source,
				})?
				.compile_matcher();

			compiled.push(Rule { include, name_only, matcher });
		}

		Ok(Self { rules: compiled, prefix: String::new() })
	}

	/// Same rules, evaluated as if every path were below `prefix`.
	pub fn with_prefix(&self, prefix: &str) -> Self {
		Self {
			rules: self.rules.clone(),
			prefix: prefix.to_string(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	/// Whether a slash-separated path relative to the sync root is included.
	pub fn includes(&self, path: &str) -> bool {
		if self.rules.is_empty() {
			return true;
		}

		let full = if self.prefix.is_empty() {
			path.trim_start_matches('/').to_string()
		} else {
			format!("{}{}", self.prefix, path.trim_start_matches('/'))
		};
		let name = extract_entry_name(&full);

		for rule in &self.rules {
			let target = if rule.name_only { name } else { full.as_str() };
			if rule.matcher.is_match(target) {
				return rule.include;
			}
		}
		true
	}
}
