pub mod job;
pub mod log;
pub mod progress;
pub mod task;

pub use job::{Job, JobStats, JobStatus, NewJob};
pub use log::{LogAction, LogEntry, LogLevel};
pub use progress::{ProgressEvent, TransferItem, TransferProgressEvent};
pub use task::{ConflictPolicy, Direction, TaskDescriptor, TaskOptions, Trigger};
