//! Turns raw transfer accounting into job logs and live progress.

use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
	time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
	bus::ProgressBus,
	stats::{Operation, StatsCounters, TransferSnapshot, TransferStats},
};
use crate::{
	models::{
		JobStatus, LogAction, LogEntry, LogLevel, ProgressEvent, TransferItem, TransferProgressEvent,
	},
	store::JobStore,
};

/// Latest progress per active job, for callers that poll instead of subscribing.
#[derive(Debug, Default)]
pub struct ProgressBoard {
	jobs: RwLock<HashMap<String, ProgressEvent>>,
}

impl ProgressBoard {
	pub fn get(&self, job_id: &str) -> Option<ProgressEvent> {
		self.jobs.read().unwrap_or_else(PoisonError::into_inner).get(job_id).cloned()
	}

	pub fn set(&self, event: ProgressEvent) {
		self.jobs
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(event.job_id.clone(), event);
	}

	pub fn remove(&self, job_id: &str) {
		self.jobs.write().unwrap_or_else(PoisonError::into_inner).remove(job_id);
	}
}

/// Where translated output goes. Shared by every job in the process.
#[derive(Clone)]
pub struct ProgressSinks {
	pub store: Arc<dyn JobStore>,
	pub job_bus: Arc<ProgressBus<ProgressEvent>>,
	pub transfer_bus: Arc<ProgressBus<TransferProgressEvent>>,
	pub board: Arc<ProgressBoard>,
}

/// The job a translator works for.
#[derive(Debug, Clone)]
pub struct JobScope {
	pub job_id: String,
	pub task_id: i64,
	pub connection_id: i64,
	/// Transfers out of this root are uploads, anything else a download.
	pub source_path: String,
	pub start_time: DateTime<Utc>,
}

impl JobScope {
	pub fn progress(
		&self,
		status: JobStatus,
		counters: StatsCounters,
		end_time: Option<DateTime<Utc>>,
	) -> ProgressEvent {
		ProgressEvent {
			job_id: self.job_id.clone(),
			task_id: self.task_id,
			connection_id: self.connection_id,
			status,
			files_transferred: counters.transfers,
			bytes_transferred: counters.bytes,
			files_total: counters.total_transfers,
			bytes_total: counters.total_bytes,
			files_deleted: counters.deletes,
			error_count: counters.errors,
			start_time: self.start_time,
			end_time,
		}
	}

	fn transfers(&self, transfers: Vec<TransferItem>) -> TransferProgressEvent {
		TransferProgressEvent {
			job_id: self.job_id.clone(),
			task_id: self.task_id,
			connection_id: self.connection_id,
			transfers,
		}
	}
}

/// Output of one pass over the stats records.
#[derive(Debug, Default, PartialEq)]
pub struct Translation {
	pub logs: Vec<LogEntry>,
	pub items: Vec<TransferItem>,
	/// Completed record ids, safe to drop from the stats.
	pub processed: Vec<u64>,
}

pub fn translate(snapshots: &[TransferSnapshot], source_path: &str) -> Translation {
	let mut out = Translation::default();

	for snap in snapshots {
		if !snap.completed {
			if !snap.operation.is_inspection() {
				out.items.push(TransferItem {
					name: snap.name.clone(),
					size: snap.size,
					bytes_so_far: snap.bytes,
				});
			}
			continue;
		}

		out.processed.push(snap.id);

		if let Some(error) = &snap.error {
			out.logs.push(
				LogEntry::new(LogLevel::Error, LogAction::Error, &snap.name, snap.size).with_message(error),
			);
			continue;
		}

		match &snap.operation {
			Operation::Deleting => {
				out.logs.push(LogEntry::new(LogLevel::Info, LogAction::Delete, &snap.name, snap.size));
			}
			Operation::Moving => {
				out.logs.push(LogEntry::new(LogLevel::Info, LogAction::Move, &snap.name, snap.size));
			}
			Operation::Checking | Operation::Hashing | Operation::Listing => {}
			Operation::Transferring => {
				let action = if same_root(&snap.src_root, source_path) {
					LogAction::Upload
				} else {
					LogAction::Download
				};
				out.logs.push(LogEntry::new(LogLevel::Info, action, &snap.name, snap.size));
				out.items.push(TransferItem {
					name: snap.name.clone(),
					size: snap.size,
					bytes_so_far: snap.size,
				});
			}
			Operation::Other(kind) => {
				out.logs.push(
					LogEntry::new(LogLevel::Warning, LogAction::Unknown, &snap.name, snap.size)
						.with_message(format!("unrecognized operation: {kind}")),
				);
			}
		}
	}

	out
}

fn same_root(a: &str, b: &str) -> bool {
	a.trim_end_matches('/') == b.trim_end_matches('/')
}

pub struct StatsTranslator {
	scope: JobScope,
	stats: Arc<TransferStats>,
	sinks: ProgressSinks,
	interval: Duration,
	flush_timeout: Duration,
	last_progress: Option<ProgressEvent>,
	last_items: Vec<TransferItem>,
}

impl StatsTranslator {
	pub fn new(
		scope: JobScope,
		stats: Arc<TransferStats>,
		sinks: ProgressSinks,
		interval: Duration,
		flush_timeout: Duration,
	) -> Self {
		Self {
			scope,
			stats,
			sinks,
			interval,
			flush_timeout,
			last_progress: None,
			last_items: Vec::new(),
		}
	}

	/// Poll until `token` fires, then flush once more and exit.
	pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(self.run(token))
	}

	async fn run(mut self, token: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = token.cancelled() => break,
				_ = ticker.tick() => self.flush().await,
			}
		}

		self.flush().await;
		debug!(job_id = %self.scope.job_id, "stats translator finished");
	}

	pub async fn flush(&mut self) {
		let snapshots = self.stats.snapshots();
		let translation = translate(&snapshots, &self.scope.source_path);
		self.stats.remove(&translation.processed);

		if !translation.logs.is_empty() {
			// Not tied to the job's token: logs must land even while it is cancelling.
			let write = self.sinks.store.append_logs_batch(&self.scope.job_id, &translation.logs);
			match tokio::time::timeout(self.flush_timeout, write).await {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					warn!(job_id = %self.scope.job_id, count = translation.logs.len(), "failed to persist job logs: {e}");
				}
				Err(_) => {
					warn!(job_id = %self.scope.job_id, count = translation.logs.len(), "timed out persisting job logs");
				}
			}
		}

		let event = self.scope.progress(JobStatus::Running, self.stats.counters(), None);
		if self.last_progress.as_ref() != Some(&event) {
			self.sinks.board.set(event.clone());
			self.sinks.job_bus.publish(event.clone());
			self.last_progress = Some(event);
		}

		if translation.items != self.last_items {
			self.sinks.transfer_bus.publish(self.scope.transfers(translation.items.clone()));
			self.last_items = translation.items;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{db, engine::bus::EventFilter, store::SurrealJobStore};

	fn snap(id: u64, name: &str, op: Operation, src_root: &str) -> TransferSnapshot {
		TransferSnapshot {
			id,
			name: name.to_string(),
			size: 10,
			bytes: 4,
			operation: op,
			src_root: src_root.to_string(),
			dst_root: "/elsewhere".to_string(),
			error: None,
			completed: true,
			started_at: Utc::now(),
		}
	}

	#[test]
	fn classifies_completed_records() {
		let mut errored = snap(6, "bad.txt", Operation::Transferring, "/src");
		errored.error = Some("permission denied".into());
		let mut active = snap(7, "big.iso", Operation::Transferring, "/src");
		active.completed = false;

		let snapshots = vec![
			snap(1, "up.txt", Operation::Transferring, "/src/"),
			snap(2, "down.txt", Operation::Transferring, "/remote"),
			snap(3, "gone.txt", Operation::Deleting, "/src"),
			snap(4, "moved.txt", Operation::Moving, "/src"),
			snap(5, "checked.txt", Operation::Checking, "/src"),
			errored,
			active,
			snap(8, "odd.txt", Operation::Other("renaming".into()), "/src"),
		];

		let t = translate(&snapshots, "/src");

		let logs: Vec<(LogLevel, LogAction, &str)> =
			t.logs.iter().map(|l| (l.level, l.action, l.path.as_str())).collect();
		assert_eq!(
			logs,
			vec![
				(LogLevel::Info, LogAction::Upload, "up.txt"),
				(LogLevel::Info, LogAction::Download, "down.txt"),
				(LogLevel::Info, LogAction::Delete, "gone.txt"),
				(LogLevel::Info, LogAction::Move, "moved.txt"),
				(LogLevel::Error, LogAction::Error, "bad.txt"),
				(LogLevel::Warning, LogAction::Unknown, "odd.txt"),
			]
		);
		assert_eq!(t.logs[4].message.as_deref(), Some("permission denied"));
		assert_eq!(t.processed, vec![1, 2, 3, 4, 5, 6, 8]);
		assert_eq!(
			t.items,
			vec![
				TransferItem { name: "up.txt".into(), size: 10, bytes_so_far: 10 },
				TransferItem { name: "down.txt".into(), size: 10, bytes_so_far: 10 },
				TransferItem { name: "big.iso".into(), size: 10, bytes_so_far: 4 },
			]
		);
	}

	#[test]
	fn active_inspections_are_not_shown() {
		let mut listing = snap(1, "", Operation::Listing, "/src");
		listing.completed = false;
		let t = translate(&[listing], "/src");
		assert!(t.items.is_empty());
		assert!(t.processed.is_empty());
	}

	async fn sinks() -> ProgressSinks {
		let db = db::init_memory().await.unwrap();
		ProgressSinks {
			store: Arc::new(SurrealJobStore::new(db)),
			job_bus: Arc::new(ProgressBus::default()),
			transfer_bus: Arc::new(ProgressBus::default()),
			board: Arc::new(ProgressBoard::default()),
		}
	}

	#[tokio::test]
	async fn flush_persists_logs_and_dedups_progress() {
		let sinks = sinks().await;
		let job = sinks
			.store
			.create_job(crate::models::NewJob { task_id: 1, connection_id: 2, trigger: Default::default() })
			.await
			.unwrap();
		let scope = JobScope {
			job_id: job.id.clone(),
			task_id: 1,
			connection_id: 2,
			source_path: "/src".into(),
			start_time: job.start_time,
		};
		let sub = sinks.job_bus.subscribe(Some(EventFilter::job(job.id.clone())));
		let transfers = sinks.transfer_bus.subscribe(None);

		let stats = Arc::new(TransferStats::new());
		let mut translator =
			StatsTranslator::new(scope, stats.clone(), sinks.clone(), Duration::from_secs(1), Duration::from_secs(5));

		let id = stats.begin("a.txt", 11, Operation::Transferring, "/src", "/dst");
		stats.finish(id, Ok(()));

		translator.flush().await;
		translator.flush().await;

		let logs = sinks.store.list_logs(&job.id).await.unwrap();
		assert_eq!(logs.len(), 1);
		assert_eq!(logs[0].action, LogAction::Upload);
		assert_eq!(logs[0].size, 11);
		assert!(stats.snapshots().is_empty());

		// second flush saw identical counters, so only one event went out
		assert_eq!(sub.events.len(), 1);
		let event = sub.events.try_recv().unwrap();
		assert_eq!(event.files_transferred, 1);
		assert_eq!(event.bytes_transferred, 11);
		assert_eq!(sinks.board.get(&job.id).unwrap(), event);

		// one event with the completed item, then one clearing it
		assert_eq!(transfers.events.len(), 2);
		assert_eq!(transfers.events.try_recv().unwrap().transfers.len(), 1);
		assert!(transfers.events.try_recv().unwrap().transfers.is_empty());
	}

	#[tokio::test]
	async fn worker_flushes_once_more_after_cancel() {
		let sinks = sinks().await;
		let scope = JobScope {
			job_id: "job-x".into(),
			task_id: 1,
			connection_id: 1,
			source_path: "/src".into(),
			start_time: Utc::now(),
		};
		let stats = Arc::new(TransferStats::new());
		let token = CancellationToken::new();
		let worker = StatsTranslator::new(scope, stats.clone(), sinks.clone(), Duration::from_secs(3600), Duration::from_secs(5))
			.spawn(token.clone());

		// let the immediate first tick pass
		tokio::time::sleep(Duration::from_millis(50)).await;
		let id = stats.begin("late.txt", 3, Operation::Deleting, "/src", "/dst");
		stats.finish(id, Ok(()));

		token.cancel();
		worker.await.unwrap();

		assert!(stats.snapshots().is_empty());
		assert_eq!(sinks.board.get("job-x").unwrap().files_deleted, 1);
	}
}
