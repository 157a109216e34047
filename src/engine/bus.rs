//! Filtered fan-out of progress events.
//!
//! Each subscriber owns a small bounded queue. Publishing never waits: when
//! a queue is full its oldest event is evicted, since only the latest
//! progress state is worth showing.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, PoisonError, RwLock,
	},
};

use tracing::trace;

use crate::models::{ProgressEvent, TransferProgressEvent};

pub const DEFAULT_BUFFER: usize = 16;

/// Anything the bus can route by task, connection and job.
pub trait BusEvent: Clone + Send + 'static {
	fn task_id(&self) -> i64;
	fn connection_id(&self) -> i64;
	fn job_id(&self) -> &str;
}

impl BusEvent for ProgressEvent {
	fn task_id(&self) -> i64 {
		self.task_id
	}

	fn connection_id(&self) -> i64 {
		self.connection_id
	}

	fn job_id(&self) -> &str {
		&self.job_id
	}
}

impl BusEvent for TransferProgressEvent {
	fn task_id(&self) -> i64 {
		self.task_id
	}

	fn connection_id(&self) -> i64 {
		self.connection_id
	}

	fn job_id(&self) -> &str {
		&self.job_id
	}
}

/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
	pub task_id: Option<i64>,
	pub connection_id: Option<i64>,
	pub job_id: Option<String>,
}

impl EventFilter {
	pub fn task(task_id: i64) -> Self {
		Self { task_id: Some(task_id), ..Default::default() }
	}

	pub fn job(job_id: impl Into<String>) -> Self {
		Self { job_id: Some(job_id.into()), ..Default::default() }
	}

	pub fn matches<E: BusEvent>(&self, event: &E) -> bool {
		self.task_id.is_none_or(|id| id == event.task_id())
			&& self.connection_id.is_none_or(|id| id == event.connection_id())
			&& self.job_id.as_deref().is_none_or(|id| id == event.job_id())
	}
}

pub struct Subscription<E> {
	pub id: u64,
	/// Closed once the subscription is removed from the bus.
	pub events: async_channel::Receiver<E>,
}

struct Subscriber<E> {
	filter: Option<EventFilter>,
	sender: async_channel::Sender<E>,
}

pub struct ProgressBus<E> {
	subscribers: RwLock<HashMap<u64, Arc<Subscriber<E>>>>,
	next_id: AtomicU64,
	buffer: usize,
}

impl<E: BusEvent> ProgressBus<E> {
	pub fn new(buffer: usize) -> Self {
		Self {
			subscribers: RwLock::new(HashMap::new()),
			next_id: AtomicU64::new(1),
			buffer: buffer.max(1),
		}
	}

	pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription<E> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (sender, events) = async_channel::bounded(self.buffer);
		self.subscribers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(id, Arc::new(Subscriber { filter, sender }));
		Subscription { id, events }
	}

	/// Remove a subscriber and close its channel. Unknown ids are ignored.
	pub fn unsubscribe(&self, id: u64) {
		let removed = self
			.subscribers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&id);
		if let Some(sub) = removed {
			sub.sender.close();
		}
	}

	pub fn publish(&self, event: E) {
		let snapshot: Vec<(u64, Arc<Subscriber<E>>)> = self
			.subscribers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.map(|(id, sub)| (*id, sub.clone()))
			.collect();

		let mut gone = Vec::new();
		for (id, sub) in snapshot {
			if !sub.filter.as_ref().is_none_or(|f| f.matches(&event)) {
				continue;
			}
			match sub.sender.force_send(event.clone()) {
				Ok(Some(_)) => trace!(subscriber = id, "subscriber lagging, dropped oldest event"),
				Ok(None) => {}
				Err(_) => gone.push(id),
			}
		}

		// Receivers that were dropped without unsubscribing.
		for id in gone {
			self.unsubscribe(id);
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
	}
}

impl<E: BusEvent> Default for ProgressBus<E> {
	fn default() -> Self {
		Self::new(DEFAULT_BUFFER)
	}
}
