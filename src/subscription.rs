//! The Subscription Manager: a reference-counted, capacity-bounded registry
//! multiplexing many logical listeners onto a bounded set of broker
//! subscriptions.
//!
//! Every public method here runs to completion synchronously; any event it
//! needs to raise (a success, a failure, a status change) is pushed onto an
//! internal queue rather than fired immediately, so the manager never calls
//! back into its owner mid-call. The owner drains that queue with
//! [`SubscriptionManager::drain_events`] after each call.

use crate::{
	adapter::{ConnectionState, ProtocolAdapter, SubscribeFailure},
	filter::FilterBuf,
};
use std::{
	collections::{BTreeSet, HashMap, VecDeque},
	sync::Arc,
	time::Duration,
};

pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
	RequestResponse,
	EventStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
	NotSubscribed,
	Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
	None,
	Subscribing,
	Unsubscribing,
}

struct Record {
	kind: SubscriptionKind,
	listeners: BTreeSet<OperationId>,
	status: Status,
	pending_action: PendingAction,
	poisoned: bool,
	/// Set when an unsubscribe for this record came back with an error.
	/// Transport failures on unsubscribe are not retried automatically
	/// (distilled spec §4.2 rule 124): `purge` leaves the record alone
	/// until something else moves it, rather than re-dispatching forever.
	unsubscribe_failed: bool,
}

impl Record {
	fn new(kind: SubscriptionKind) -> Self {
		Self {
			kind,
			listeners: BTreeSet::new(),
			status: Status::NotSubscribed,
			pending_action: PendingAction::None,
			poisoned: false,
			unsubscribe_failed: false,
		}
	}
}

/// The outcome of [`SubscriptionManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
	/// Every requested filter is already subscribed.
	Subscribed,
	/// At least one requested filter is subscribing; the caller should wait.
	Subscribing,
	/// Cannot be satisfied right now but may be once in-flight work settles.
	Blocked,
	/// Cannot be satisfied without a user action freeing capacity.
	NoCapacity,
	/// Poisoned filter, kind mismatch, or the manager is closed.
	Failure,
}

/// Events raised by the manager, drained by its owner once per call.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
	SubscribeSuccess { operation: OperationId },
	SubscribeFailure { operation: OperationId, message: String },
	StreamingSubscriptionEstablished { operation: OperationId },
	StreamingSubscriptionHalted { operation: OperationId, message: String },
	StreamingSubscriptionLost { operation: OperationId },
	SubscriptionEnded { operation: OperationId },
	SubscriptionOrphaned { filter: FilterBuf },
	UnsubscribeComplete { filter: FilterBuf },
}

pub struct SubscriptionManager {
	adapter: Arc<dyn ProtocolAdapter>,
	records: HashMap<FilterBuf, Record>,
	max_rr_subs: u32,
	max_stream_subs: u32,
	subscribe_timeout: Duration,
	connected: bool,
	closed: bool,
	events: VecDeque<ManagerEvent>,
}

impl SubscriptionManager {
	pub fn new(
		adapter: Arc<dyn ProtocolAdapter>,
		max_rr_subs: u32,
		max_stream_subs: u32,
		subscribe_timeout: Duration,
	) -> Self {
		let connected = adapter.connection_state() == ConnectionState::Connected;
		Self {
			adapter,
			records: HashMap::new(),
			max_rr_subs,
			max_stream_subs,
			subscribe_timeout,
			connected,
			closed: false,
			events: VecDeque::new(),
		}
	}

	pub fn drain_events(&mut self) -> impl Iterator<Item = ManagerEvent> + '_ {
		self.events.drain(..)
	}

	pub fn is_subscribed(&self, filter: &FilterBuf) -> bool {
		self.records.get(filter).map(|r| r.status == Status::Subscribed).unwrap_or(false)
	}

	fn count(&self, kind: SubscriptionKind) -> u32 {
		self.records.values().filter(|r| r.kind == kind).count() as u32
	}

	fn count_unsubscribing_streams(&self) -> u32 {
		self.records
			.values()
			.filter(|r| r.kind == SubscriptionKind::EventStream && r.pending_action == PendingAction::Unsubscribing)
			.count() as u32
	}

	/// See distilled spec §4.2 `acquire`.
	pub fn acquire(&mut self, operation: OperationId, kind: SubscriptionKind, filters: &[FilterBuf]) -> AcquireResult {
		if self.closed {
			return AcquireResult::Failure;
		}
		if filters.is_empty() {
			return AcquireResult::Failure;
		}

		for filter in filters {
			if let Some(record) = self.records.get(filter) {
				if record.poisoned || record.kind != kind {
					return AcquireResult::Failure;
				}
			}
		}

		for filter in filters {
			if let Some(record) = self.records.get(filter) {
				if record.pending_action == PendingAction::Unsubscribing {
					return AcquireResult::Blocked;
				}
			}
		}

		let new = filters.iter().filter(|f| !self.records.contains_key(*f)).count() as u32;

		match kind {
			SubscriptionKind::RequestResponse => {
				let current = self.count(SubscriptionKind::RequestResponse);
				if new > self.max_rr_subs.saturating_sub(current) {
					return AcquireResult::Blocked;
				}
			}
			SubscriptionKind::EventStream => {
				let current = self.count(SubscriptionKind::EventStream);
				if new + current > self.max_stream_subs {
					let unsubscribing = self.count_unsubscribing_streams();
					if new + current <= self.max_stream_subs + unsubscribing {
						return AcquireResult::Blocked;
					}
					return AcquireResult::NoCapacity;
				}
			}
		}

		for filter in filters {
			self.records.entry(filter.clone()).or_insert_with(|| Record::new(kind));
			self.records.get_mut(filter).expect("just inserted").listeners.insert(operation);
		}

		if filters.iter().all(|f| self.records[f].status == Status::Subscribed) {
			tracing::debug!(?filters, operation, "acquire: already subscribed");
			return AcquireResult::Subscribed;
		}

		let mut failed = false;
		for filter in filters {
			let already_subscribed = self.records[filter].status == Status::Subscribed;
			if !already_subscribed && !self.activate_and_handle(filter.clone()) {
				failed = true;
			}
		}

		if failed {
			tracing::warn!(operation, "acquire: activation failed");
			AcquireResult::Failure
		} else {
			tracing::debug!(?filters, operation, "acquire: subscribing");
			AcquireResult::Subscribing
		}
	}

	/// See distilled spec §4.2 `release`. Destruction is deferred to `purge`.
	pub fn release(&mut self, operation: OperationId, filters: &[FilterBuf]) {
		for filter in filters {
			let Some(record) = self.records.get_mut(filter) else { continue };
			record.listeners.remove(&operation);
			if record.listeners.is_empty() {
				self.events.push_back(ManagerEvent::SubscriptionOrphaned { filter: filter.clone() });
			}
		}
	}

	/// See distilled spec §4.2 `purge`.
	pub fn purge(&mut self) {
		let filters: Vec<FilterBuf> = self.records.keys().cloned().collect();
		for filter in filters {
			let Some(record) = self.records.get_mut(&filter) else { continue };
			if !record.listeners.is_empty() {
				continue;
			}
			match (record.status, record.pending_action) {
				(Status::NotSubscribed, PendingAction::None) => {
					tracing::debug!(%filter, "purge: destroying orphaned record");
					self.records.remove(&filter);
				}
				(Status::Subscribed, PendingAction::None) if self.connected && !record.unsubscribe_failed => {
					match self.adapter.unsubscribe(filter.clone(), self.subscribe_timeout) {
						Ok(()) => {
							record.pending_action = PendingAction::Unsubscribing;
						}
						Err(error) => {
							tracing::warn!(%filter, %error, "purge: failed to dispatch unsubscribe");
						}
					}
				}
				_ => {}
			}
		}
	}

	/// See distilled spec §4.2 `close`.
	pub fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		let filters: Vec<FilterBuf> = self.records.keys().cloned().collect();
		for filter in filters {
			let Some(record) = self.records.get_mut(&filter) else { continue };
			let should_unsubscribe = self.connected
				&& (record.status == Status::Subscribed || record.pending_action == PendingAction::Subscribing);
			if should_unsubscribe && record.pending_action != PendingAction::Unsubscribing {
				if let Err(error) = self.adapter.unsubscribe(filter.clone(), self.subscribe_timeout) {
					tracing::warn!(%filter, %error, "close: failed to dispatch unsubscribe");
					continue;
				}
				record.pending_action = PendingAction::Unsubscribing;
			}
		}
	}

	/// Idempotent. No-op when poisoned, disconnected, unreferenced, already
	/// subscribed, or mid some other pending action.
	fn activate(&mut self, filter: &FilterBuf) -> Result<(), crate::adapter::AdapterError> {
		let Some(record) = self.records.get_mut(filter) else { return Ok(()) };
		if record.poisoned
			|| !self.connected
			|| record.listeners.is_empty()
			|| record.status == Status::Subscribed
			|| record.pending_action != PendingAction::None
		{
			return Ok(());
		}
		self.adapter.subscribe(filter.clone(), self.subscribe_timeout)?;
		record.pending_action = PendingAction::Subscribing;
		Ok(())
	}

	/// Activates `filter`, translating a synchronous adapter failure into the
	/// per-kind event defined by distilled spec §4.2 rule 7. Returns `false`
	/// if activation failed.
	fn activate_and_handle(&mut self, filter: FilterBuf) -> bool {
		match self.activate(&filter) {
			Ok(()) => true,
			Err(error) => {
				let Some(record) = self.records.get_mut(&filter) else { return false };
				let kind = record.kind;
				let listeners: Vec<_> = record.listeners.iter().copied().collect();
				match kind {
					SubscriptionKind::RequestResponse => {
						for operation in listeners {
							self.events.push_back(ManagerEvent::SubscribeFailure { operation, message: error.to_string() });
						}
					}
					SubscriptionKind::EventStream => {
						record.poisoned = true;
						for operation in listeners {
							self.events.push_back(ManagerEvent::StreamingSubscriptionHalted { operation, message: error.to_string() });
						}
					}
				}
				false
			}
		}
	}

	fn activate_idle(&mut self) {
		let filters: Vec<FilterBuf> = self
			.records
			.iter()
			.filter(|(_, r)| !r.poisoned && r.status == Status::NotSubscribed && r.pending_action == PendingAction::None && !r.listeners.is_empty())
			.map(|(f, _)| f.clone())
			.collect();
		for filter in filters {
			self.activate_and_handle(filter);
		}
	}

	pub fn handle_subscribe_complete(&mut self, filter: FilterBuf, error: Option<SubscribeFailure>) {
		let (kind, listeners) = {
			let Some(record) = self.records.get_mut(&filter) else { return };
			record.pending_action = PendingAction::None;
			if error.is_none() {
				record.status = Status::Subscribed;
			}
			(record.kind, record.listeners.iter().copied().collect::<Vec<_>>())
		};

		match error {
			None => {
				tracing::debug!(%filter, ?kind, "subscribe complete");
				for operation in listeners {
					let event = match kind {
						SubscriptionKind::RequestResponse => ManagerEvent::SubscribeSuccess { operation },
						SubscriptionKind::EventStream => ManagerEvent::StreamingSubscriptionEstablished { operation },
					};
					self.events.push_back(event);
				}
			}
			Some(failure) => match kind {
				SubscriptionKind::RequestResponse => {
					tracing::warn!(%filter, message = %failure.message, "subscribe failed");
					for operation in listeners {
						self.events.push_back(ManagerEvent::SubscribeFailure { operation, message: failure.message.clone() });
					}
				}
				SubscriptionKind::EventStream => {
					if failure.retryable && !self.closed {
						tracing::debug!(%filter, "retryable subscribe failure, re-activating");
						self.activate_and_handle(filter);
					} else {
						tracing::warn!(%filter, message = %failure.message, "subscribe failed, poisoning filter");
						if let Some(record) = self.records.get_mut(&filter) {
							record.poisoned = true;
						}
						for operation in listeners {
							self.events.push_back(ManagerEvent::StreamingSubscriptionHalted { operation, message: failure.message.clone() });
						}
					}
				}
			},
		}
	}

	pub fn handle_unsubscribe_complete(&mut self, filter: FilterBuf, error: Option<String>) {
		let Some(record) = self.records.get_mut(&filter) else { return };
		record.pending_action = PendingAction::None;
		match error {
			None => {
				record.status = Status::NotSubscribed;
				tracing::debug!(%filter, "unsubscribe complete");
				self.events.push_back(ManagerEvent::UnsubscribeComplete { filter });
			}
			Some(message) => {
				// Broker still holds the subscription; the slot is not reclaimed,
				// and purge will not retry this on its own.
				record.unsubscribe_failed = true;
				tracing::warn!(%filter, %message, "unsubscribe failed, slot retained");
			}
		}
	}

	pub fn handle_connection_status(&mut self, connected: bool, joined_session: Option<bool>) {
		if !connected {
			self.connected = false;
			return;
		}

		if joined_session == Some(false) {
			let filters: Vec<FilterBuf> =
				self.records.iter().filter(|(_, r)| r.status == Status::Subscribed).map(|(f, _)| f.clone()).collect();
			for filter in filters {
				let Some(record) = self.records.get_mut(&filter) else { continue };
				record.status = Status::NotSubscribed;
				record.pending_action = PendingAction::None;
				record.unsubscribe_failed = false;
				let kind = record.kind;
				let listeners: Vec<_> = record.listeners.iter().copied().collect();
				tracing::debug!(%filter, ?kind, "session lost, invalidating subscription");
				for operation in listeners {
					let event = match kind {
						SubscriptionKind::RequestResponse => ManagerEvent::SubscriptionEnded { operation },
						SubscriptionKind::EventStream => ManagerEvent::StreamingSubscriptionLost { operation },
					};
					self.events.push_back(event);
				}
			}
		}

		self.connected = true;
		self.purge();
		self.activate_idle();
	}
}
