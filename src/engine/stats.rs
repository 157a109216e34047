//! Transfer accounting shared between a backend run and its translator.
//!
//! The backend records every file operation here as it happens. The
//! translator drains completed records on each tick, so the record list
//! only ever holds in-flight work plus whatever finished since the last tick.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// What a backend was doing with a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
	Transferring,
	Deleting,
	Moving,
	Checking,
	Hashing,
	Listing,
	Other(String),
}

impl Operation {
	pub fn as_str(&self) -> &str {
		match self {
			Operation::Transferring => "transferring",
			Operation::Deleting => "deleting",
			Operation::Moving => "moving",
			Operation::Checking => "checking",
			Operation::Hashing => "hashing",
			Operation::Listing => "listing",
			Operation::Other(kind) => kind,
		}
	}

	/// Bookkeeping passes that produce no log lines.
	pub fn is_inspection(&self) -> bool {
		matches!(self, Operation::Checking | Operation::Hashing | Operation::Listing)
	}
}

impl From<&str> for Operation {
	fn from(kind: &str) -> Self {
		match kind {
			"transferring" => Operation::Transferring,
			"deleting" => Operation::Deleting,
			"moving" => Operation::Moving,
			"checking" => Operation::Checking,
			"hashing" => Operation::Hashing,
			"listing" => Operation::Listing,
			other => Operation::Other(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
	pub id: u64,
	/// Path relative to the roots.
	pub name: String,
	pub size: u64,
	pub bytes: u64,
	pub operation: Operation,
	pub src_root: String,
	pub dst_root: String,
	pub error: Option<String>,
	pub completed: bool,
	pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsCounters {
	/// Bytes of successfully completed transfers.
	pub bytes: u64,
	pub transfers: u64,
	pub deletes: u64,
	pub errors: u64,
	pub checks: u64,
	/// Everything queued for transfer so far, finished or not.
	pub total_transfers: u64,
	pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
	next_id: u64,
	records: Vec<TransferSnapshot>,
	counters: StatsCounters,
}

#[derive(Debug, Default)]
pub struct TransferStats {
	inner: Mutex<Inner>,
}

impl TransferStats {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start tracking an operation. Returns the record id.
	pub fn begin(
		&self,
		name: &str,
		size: u64,
		operation: Operation,
		src_root: &str,
		dst_root: &str,
	) -> u64 {
		let mut inner = self.lock();
		inner.next_id += 1;
		let id = inner.next_id;
		if operation == Operation::Transferring {
			inner.counters.total_transfers += 1;
			inner.counters.total_bytes += size;
		}
		inner.records.push(TransferSnapshot {
			id,
			name: name.to_string(),
			size,
			bytes: 0,
			operation,
			src_root: src_root.to_string(),
			dst_root: dst_root.to_string(),
			error: None,
			completed: false,
			started_at: Utc::now(),
		});
		id
	}

	pub fn progress(&self, id: u64, bytes: u64) {
		let mut inner = self.lock();
		if let Some(record) = inner.records.iter_mut().find(|r| r.id == id) {
			record.bytes = bytes;
		}
	}

	/// Mark an operation finished and fold it into the counters.
	pub fn finish(&self, id: u64, result: Result<(), String>) {
		let mut inner = self.lock();
		let Some(record) = inner.records.iter_mut().find(|r| r.id == id) else {
			return;
		};
		if record.completed {
			return;
		}
		record.completed = true;

		let operation = record.operation.clone();
		let size = record.size;
		match result {
			Ok(()) => {
				if operation == Operation::Transferring {
					record.bytes = size;
				}
				let counters = &mut inner.counters;
				match operation {
					Operation::Transferring => {
						counters.transfers += 1;
						counters.bytes += size;
					}
					Operation::Moving => counters.transfers += 1,
					Operation::Deleting => counters.deletes += 1,
					Operation::Checking | Operation::Hashing => counters.checks += 1,
					Operation::Listing | Operation::Other(_) => {}
				}
			}
			Err(message) => {
				record.error = Some(message);
				inner.counters.errors += 1;
			}
		}
	}

	/// Count an error that isn't tied to a tracked file.
	pub fn record_error(&self) {
		self.lock().counters.errors += 1;
	}

	pub fn snapshots(&self) -> Vec<TransferSnapshot> {
		self.lock().records.clone()
	}

	pub fn counters(&self) -> StatsCounters {
		self.lock().counters
	}

	/// Drop records that have been consumed.
	pub fn remove(&self, ids: &[u64]) {
		if ids.is_empty() {
			return;
		}
		self.lock().records.retain(|r| !ids.contains(&r.id));
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
