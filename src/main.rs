use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kip_sync::{
	config::Config,
	db,
	engine::{
		list_entries, ConfiguredRemotes, EventFilter, HandleCache, JobOrchestrator, LocalBackend,
		OrchestratorSettings, ProgressBus,
	},
	models::{TaskDescriptor, Trigger},
	JobStore, SurrealJobStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kip-sync", version, about = "Run and inspect sync jobs")]
struct Cli {
	/// Config file (TOML). Defaults to the platform config dir.
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	/// Also log to stderr.
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run a task described in a TOML file once.
	Run {
		task: PathBuf,
		#[arg(long, default_value = "manual")]
		trigger: Trigger,
	},
	/// List a directory, relative to a task root.
	Ls {
		/// Remote name, or "" for the local filesystem.
		remote: String,
		base: String,
		current: String,
		/// Filter rule such as "- *.tmp". Repeatable.
		#[arg(short, long = "filter")]
		filters: Vec<String>,
	},
	/// Show a job and its log.
	Job {
		id: String,
		#[arg(long)]
		json: bool,
	},
	/// List the jobs recorded for a task.
	Jobs { task_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
	let config = Config::load(&config_path)?;
	let data_dir = config.resolve_data_dir()?;
	std::fs::create_dir_all(&data_dir)
		.with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

	let file_appender = tracing_appender::rolling::never(&data_dir, "kip-sync.log");
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer().with_writer(file_appender).with_ansi(false))
		.with(cli.verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
		.init();

	info!(config = %config_path.display(), data_dir = %data_dir.display(), "starting");

	match cli.command {
		Command::Run { task, trigger } => run(&config, &data_dir, &task, trigger).await,
		Command::Ls { remote, base, current, filters } => {
			let cache = HandleCache::new(Arc::new(ConfiguredRemotes::new(config.remotes.clone())));
			for entry in list_entries(&cache, &remote, &base, &current, &filters).await? {
				if entry.is_dir {
					println!("{:>12}  {}/", "-", entry.name);
				} else {
					println!("{:>12}  {}", entry.size, entry.name);
				}
			}
			Ok(())
		}
		Command::Job { id, json } => show_job(&data_dir, &id, json).await,
		Command::Jobs { task_id } => {
			let store = SurrealJobStore::new(db::init(&data_dir).await?);
			for job in store.list_jobs(task_id).await? {
				println!(
					"{}  {:<9}  {}  {} files  {} bytes",
					job.id,
					job.status.as_str(),
					job.start_time.format("%Y-%m-%d %H:%M:%S"),
					job.files_transferred,
					job.bytes_transferred
				);
			}
			Ok(())
		}
	}
}

async fn run(config: &Config, data_dir: &Path, task_path: &Path, trigger: Trigger) -> Result<()> {
	let raw = std::fs::read_to_string(task_path)
		.with_context(|| format!("failed to read task {}", task_path.display()))?;
	let task: TaskDescriptor =
		toml::from_str(&raw).with_context(|| format!("failed to parse task {}", task_path.display()))?;

	let store = Arc::new(SurrealJobStore::new(db::init(data_dir).await?));
	let handles = Arc::new(HandleCache::new(Arc::new(ConfiguredRemotes::new(config.remotes.clone()))));
	let orchestrator = JobOrchestrator::new(
		store,
		Arc::new(LocalBackend::new()),
		handles,
		Arc::new(ProgressBus::new(config.bus_buffer)),
		Arc::new(ProgressBus::new(config.bus_buffer)),
		OrchestratorSettings::from_config(config),
	);

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("interrupted, cancelling job");
				cancel.cancel();
			}
		}
	});

	let sub = orchestrator.job_bus().subscribe(Some(EventFilter::task(task.id)));
	let printer = tokio::spawn({
		let events = sub.events.clone();
		async move {
			while let Ok(event) = events.recv().await {
				println!(
					"[{}] {}/{} files, {}/{} bytes, {} deleted, {} errors",
					event.status,
					event.files_transferred,
					event.files_total,
					event.bytes_transferred,
					event.bytes_total,
					event.files_deleted,
					event.error_count
				);
			}
		}
	});

	let result = orchestrator.run_task(&cancel, &task, trigger).await;

	orchestrator.job_bus().unsubscribe(sub.id);
	drop(sub);
	printer.await.ok();

	match result {
		Ok(job) => {
			println!("job {} finished: {}", job.id, job.status);
			Ok(())
		}
		Err(e) => bail!(e),
	}
}

async fn show_job(data_dir: &Path, id: &str, json: bool) -> Result<()> {
	let store = SurrealJobStore::new(db::init(data_dir).await?);
	let Some(job) = store.get_job(id).await? else {
		bail!("job not found: {id}");
	};
	let logs = store.list_logs(id).await?;

	if json {
		let out = serde_json::json!({ "job": job, "logs": logs });
		println!("{}", serde_json::to_string_pretty(&out)?);
		return Ok(());
	}

	println!("job        {}", job.id);
	println!("task       {}", job.task_id);
	println!("trigger    {}", job.trigger);
	println!("status     {}", job.status);
	println!("started    {}", job.start_time);
	if let Some(end) = job.end_time {
		println!("ended      {end}");
	}
	println!(
		"counters   {} files, {} bytes, {} deleted, {} errors",
		job.files_transferred, job.bytes_transferred, job.files_deleted, job.error_count
	);
	if let Some(message) = &job.error_message {
		println!("error      {message}");
	}

	for entry in logs {
		match &entry.message {
			Some(message) => println!(
				"{} {:<7} {:<8} {} ({message})",
				entry.timestamp,
				entry.level.as_str(),
				entry.action.as_str(),
				entry.path
			),
			None => println!(
				"{} {:<7} {:<8} {} {}",
				entry.timestamp,
				entry.level.as_str(),
				entry.action.as_str(),
				entry.path,
				entry.size
			),
		}
	}
	Ok(())
}
