//! Drives one sync run from job creation to its terminal status.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{SubsecRound, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
	backend::{BackendError, SyncBackend, SyncOptions},
	bus::ProgressBus,
	handles::{FsRef, HandleCache, HandleError},
	stats::{StatsCounters, TransferStats},
	translator::{JobScope, ProgressBoard, ProgressSinks, StatsTranslator},
};
use crate::{
	config::Config,
	models::{
		Direction, Job, JobStats, JobStatus, LogAction, LogEntry, LogLevel, NewJob, ProgressEvent,
		TaskDescriptor, TransferProgressEvent, Trigger,
	},
	store::{JobStore, StoreError},
};

/// Transfer concurrency when neither the task nor the process sets one.
pub const DEFAULT_TRANSFERS: usize = 4;

const CANCELLED_MESSAGE: &str = "job cancelled";

#[derive(Debug, Error)]
pub enum RunError {
	#[error("failed to create job: {0}")]
	Store(#[source] StoreError),

	#[error("job cancelled")]
	Cancelled { job_id: Option<String> },

	#[error("job {job_id} setup failed: {source}")]
	Setup {
		job_id: String,
		#[source]
		source: HandleError,
	},

	#[error("job {job_id} failed: {source}")]
	Transfer {
		job_id: String,
		#[source]
		source: BackendError,
	},
}

impl RunError {
	/// The job this error was recorded against, if one was created.
	pub fn job_id(&self) -> Option<&str> {
		match self {
			RunError::Store(_) => None,
			RunError::Cancelled { job_id } => job_id.as_deref(),
			RunError::Setup { job_id, .. } | RunError::Transfer { job_id, .. } => Some(job_id),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
	/// Process-wide transfer concurrency, used when a task has none.
	pub default_transfers: Option<usize>,
	pub auto_delete_empty_jobs: bool,
	pub stats_interval: Duration,
	/// Upper bound on each store write made outside the caller's token.
	pub flush_timeout: Duration,
}

impl Default for OrchestratorSettings {
	fn default() -> Self {
		Self::from_config(&Config::default())
	}
}

impl OrchestratorSettings {
	pub fn from_config(config: &Config) -> Self {
		Self {
			default_transfers: config.default_transfers,
			auto_delete_empty_jobs: config.auto_delete_empty_jobs,
			stats_interval: config.stats_interval(),
			flush_timeout: config.log_flush_timeout(),
		}
	}
}

/// Task value, then process default, then [`DEFAULT_TRANSFERS`]. Zero counts as unset.
pub fn resolve_transfers(task: Option<usize>, process: Option<usize>) -> usize {
	task.filter(|n| *n > 0)
		.or(process.filter(|n| *n > 0))
		.unwrap_or(DEFAULT_TRANSFERS)
}

enum Outcome {
	Success,
	Cancelled,
	Setup(HandleError),
	Transfer(BackendError),
}

pub struct JobOrchestrator {
	store: Arc<dyn JobStore>,
	backend: Arc<dyn SyncBackend>,
	handles: Arc<HandleCache>,
	sinks: ProgressSinks,
	settings: OrchestratorSettings,
}

impl JobOrchestrator {
	pub fn new(
		store: Arc<dyn JobStore>,
		backend: Arc<dyn SyncBackend>,
		handles: Arc<HandleCache>,
		job_bus: Arc<ProgressBus<ProgressEvent>>,
		transfer_bus: Arc<ProgressBus<TransferProgressEvent>>,
		settings: OrchestratorSettings,
	) -> Self {
		let sinks = ProgressSinks {
			store: store.clone(),
			job_bus,
			transfer_bus,
			board: Arc::new(ProgressBoard::default()),
		};
		Self { store, backend, handles, sinks, settings }
	}

	pub fn job_bus(&self) -> &Arc<ProgressBus<ProgressEvent>> {
		&self.sinks.job_bus
	}

	pub fn transfer_bus(&self) -> &Arc<ProgressBus<TransferProgressEvent>> {
		&self.sinks.transfer_bus
	}

	pub fn handles(&self) -> &Arc<HandleCache> {
		&self.handles
	}

	/// Latest progress of a job that is still running.
	pub fn get_job_progress(&self, job_id: &str) -> Option<ProgressEvent> {
		self.sinks.board.get(job_id)
	}

	/// Run `task` once. Returns the finished job on success.
	///
	/// Cancelling `cancel` stops the transfer and records the job as
	/// cancelled. If it is already cancelled no job is created at all.
	pub async fn run_task(
		&self,
		cancel: &CancellationToken,
		task: &TaskDescriptor,
		trigger: Trigger,
	) -> Result<Job, RunError> {
		if cancel.is_cancelled() {
			return Err(RunError::Cancelled { job_id: None });
		}
		// Not raced with `cancel`, or a create landing after the token fires
		// leaves a pending job that is never finalized. The transfer step sees a later cancel.
		let new_job = NewJob { task_id: task.id, connection_id: task.connection_id, trigger };
		let mut job = self.store.create_job(new_job).await.map_err(RunError::Store)?;
		info!(job_id = %job.id, task_id = task.id, remote = %task.connection_name, %trigger, "job started");

		self.persist(
			&job.id,
			"mark running",
			self.store.update_job_status(&job.id, JobStatus::Running, None, Utc::now()),
		)
		.await;
		job.status = JobStatus::Running;

		let scope = JobScope {
			job_id: job.id.clone(),
			task_id: task.id,
			connection_id: task.connection_id,
			source_path: task.source_path.clone(),
			start_time: job.start_time,
		};

		// Not `cancel.child_token()`: the worker must keep draining what a
		// cancelled backend records until the backend returns.
		let stats_scope = CancellationToken::new();
		let stats = Arc::new(TransferStats::new());
		let worker = StatsTranslator::new(
			scope.clone(),
			stats.clone(),
			self.sinks.clone(),
			self.settings.stats_interval,
			self.settings.flush_timeout,
		)
		.spawn(stats_scope.clone());

		let outcome = self.transfer(cancel, task, stats.clone()).await;

		stats_scope.cancel();
		if let Err(e) = worker.await {
			warn!(job_id = %job.id, "stats translator exited abnormally: {e}");
		}

		let outcome = match outcome {
			_ if cancel.is_cancelled() => Outcome::Cancelled,
			Err(StepError::Setup(e)) => Outcome::Setup(e),
			Err(StepError::Transfer(e)) if e.is_cancelled() => Outcome::Cancelled,
			Err(StepError::Transfer(e)) => Outcome::Transfer(e),
			Ok(()) => Outcome::Success,
		};

		self.finalize(&mut job, task, &scope, stats.counters(), outcome).await
	}

	async fn transfer(
		&self,
		cancel: &CancellationToken,
		task: &TaskDescriptor,
		stats: Arc<TransferStats>,
	) -> Result<(), StepError> {
		let (local, remote) = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(StepError::Transfer(BackendError::Cancelled)),
			handles = self.open_handles(task) => handles.map_err(StepError::Setup)?,
		};

		let opts = SyncOptions {
			filters: task.filters.clone(),
			no_delete: task.options.no_delete,
			transfers: resolve_transfers(task.options.transfers, self.settings.default_transfers),
			conflict_policy: task.options.conflict_policy,
		};

		let result = match task.direction {
			Direction::Upload => self.backend.run_one_way(cancel, local, remote, &opts, stats).await,
			Direction::Download => self.backend.run_one_way(cancel, remote, local, &opts, stats).await,
			Direction::Bidirectional => {
				self.backend.run_bidirectional(cancel, local, remote, &opts, stats).await
			}
		};
		result.map_err(StepError::Transfer)
	}

	async fn open_handles(&self, task: &TaskDescriptor) -> Result<(FsRef, FsRef), HandleError> {
		let local = self.handles.get_handle("", &task.source_path).await?;
		let remote = self.handles.get_handle(&task.connection_name, &task.remote_path).await?;
		Ok((local, remote))
	}

	async fn finalize(
		&self,
		job: &mut Job,
		task: &TaskDescriptor,
		scope: &JobScope,
		counters: StatsCounters,
		outcome: Outcome,
	) -> Result<Job, RunError> {
		let job_id = job.id.clone();
		let stats = JobStats {
			files_transferred: counters.transfers,
			bytes_transferred: counters.bytes,
			files_deleted: counters.deletes,
			error_count: counters.errors,
		};

		let (status, message) = match &outcome {
			Outcome::Success => (JobStatus::Success, None),
			Outcome::Cancelled => (JobStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string())),
			Outcome::Setup(e) => (JobStatus::Failed, Some(e.to_string())),
			Outcome::Transfer(e) => (JobStatus::Failed, Some(e.to_string())),
		};

		// Setup failures never reached the backend, so there is nothing to count.
		if !matches!(outcome, Outcome::Setup(_)) {
			self.persist(&job_id, "save stats", self.store.update_job_stats(&job_id, stats)).await;
			job.apply_stats(stats);
		}

		if let (JobStatus::Failed, Some(message)) = (status, &message) {
			let entry =
				LogEntry::new(LogLevel::Error, LogAction::Error, &task.source_path, 0).with_message(message);
			self.persist(&job_id, "append error log", self.store.append_logs_batch(&job_id, &[entry])).await;
		}

		// One timestamp for the stored row, the returned job and the final event.
		// Truncated to the precision the store keeps.
		let end_time = Utc::now().trunc_subsecs(6);
		self.persist(
			&job_id,
			"save final status",
			self.store.update_job_status(&job_id, status, message.as_deref(), end_time),
		)
		.await;

		job.status = status;
		job.end_time = Some(end_time);
		job.error_message = message;

		let final_counters = match outcome {
			Outcome::Setup(_) => StatsCounters::default(),
			_ => counters,
		};
		self.sinks.job_bus.publish(scope.progress(status, final_counters, Some(end_time)));
		self.sinks.board.remove(&job_id);

		match outcome {
			Outcome::Success => {
				info!(
					job_id = %job_id,
					files = stats.files_transferred,
					bytes = stats.bytes_transferred,
					deleted = stats.files_deleted,
					"job succeeded"
				);
				if self.settings.auto_delete_empty_jobs && job.stats().is_empty() {
					self.persist(&job_id, "delete empty job", self.store.delete_job(&job_id)).await;
					info!(job_id = %job_id, "deleted empty job");
				}
				Ok(job.clone())
			}
			Outcome::Cancelled => {
				info!(job_id = %job_id, "job cancelled");
				Err(RunError::Cancelled { job_id: Some(job_id) })
			}
			Outcome::Setup(source) => {
				error!(job_id = %job_id, "job setup failed: {source}");
				Err(RunError::Setup { job_id, source })
			}
			Outcome::Transfer(source) => {
				error!(job_id = %job_id, "job failed: {source}");
				Err(RunError::Transfer { job_id, source })
			}
		}
	}

	/// Store writes made here are never raced with the caller's token.
	/// Failures are logged so they cannot hide the sync outcome.
	async fn persist<F>(&self, job_id: &str, what: &str, write: F)
	where
		F: Future<Output = Result<(), StoreError>>,
	{
		match tokio::time::timeout(self.settings.flush_timeout, write).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => error!(job_id, "failed to {what}: {e}"),
			Err(_) => error!(job_id, "timed out trying to {what}"),
		}
	}
}

enum StepError {
	Setup(HandleError),
	Transfer(BackendError),
}
