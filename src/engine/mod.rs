pub mod backend;
pub mod browse;
pub mod bus;
pub mod filter;
pub mod handles;
pub mod local;
pub mod orchestrator;
pub mod paths;
pub mod stats;
pub mod translator;

pub use backend::{BackendError, SyncBackend, SyncOptions};
pub use browse::{list_entries, BrowseError, Entry};
pub use bus::{EventFilter, ProgressBus, Subscription};
pub use handles::{ConfiguredRemotes, Fs, FsRef, HandleCache, HandleError, HandleFactory, LocalFs};
pub use local::LocalBackend;
pub use orchestrator::{JobOrchestrator, OrchestratorSettings, RunError};
pub use paths::{calculate_filter_prefix, calculate_list_path, extract_entry_name};
pub use stats::TransferStats;
