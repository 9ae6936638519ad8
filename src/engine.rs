//! The Operation Engine: owns every in-flight operation, the FIFO queue,
//! the correlation-token index, and the response-path table. Drives
//! operations through their state machine and performs request/response
//! matching.
//!
//! Nothing here blocks. Every method runs to completion and returns; the
//! owning task (see `client.rs`) re-enters `service` after each adapter
//! event, submission, or timer tick.

use crate::{
	adapter::{AdapterEvent, ProtocolAdapter},
	error::{OperationError, StreamError},
	events::{IncomingMessage, Response, SubscriptionStatus},
	filter::FilterBuf,
	options::RequestResponseOperationOptions,
	subscription::{AcquireResult, ManagerEvent, OperationId, SubscriptionKind, SubscriptionManager},
	topic::TopicBuf,
};
use bytes::Bytes;
use std::{
	collections::{BTreeSet, HashMap, VecDeque},
	sync::Arc,
};
use tokio::{
	sync::{mpsc, oneshot},
	time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
	RequestResponse,
	Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationState {
	/// Streaming only: constructed but not yet `open()`-ed.
	Created,
	Queued,
	PendingSubscription,
	PendingResponse,
	Subscribed,
}

enum OperationOptions {
	RequestResponse {
		options: RequestResponseOperationOptions,
		reply: oneshot::Sender<Result<Response, OperationError>>,
	},
	Streaming {
		filter: FilterBuf,
		messages: mpsc::Sender<IncomingMessage>,
		status: mpsc::Sender<SubscriptionStatus>,
	},
}

struct Operation {
	id: OperationId,
	kind: OperationKind,
	state: OperationState,
	options: OperationOptions,
	pending_subscription_count: u32,
	inserted_in_tables: bool,
}

struct ResponsePathEntry {
	reference_count: u32,
	correlation_token_path: Option<crate::correlation::CorrelationPath>,
}

pub struct OperationEngine {
	adapter: Arc<dyn ProtocolAdapter>,
	subscriptions: SubscriptionManager,
	operations: HashMap<OperationId, Operation>,
	streaming_by_filter: HashMap<FilterBuf, BTreeSet<OperationId>>,
	response_paths: HashMap<TopicBuf, ResponsePathEntry>,
	operations_by_token: HashMap<String, OperationId>,
	queue: VecDeque<OperationId>,
	timeouts: BTreeSet<(Instant, OperationId)>,
	deadlines: HashMap<OperationId, Instant>,
	next_id: u64,
	operation_timeout: std::time::Duration,
	closed: bool,
}

impl OperationEngine {
	pub fn new(adapter: Arc<dyn ProtocolAdapter>, subscriptions: SubscriptionManager, operation_timeout: std::time::Duration) -> Self {
		Self {
			adapter,
			subscriptions,
			operations: HashMap::new(),
			streaming_by_filter: HashMap::new(),
			response_paths: HashMap::new(),
			operations_by_token: HashMap::new(),
			queue: VecDeque::new(),
			timeouts: BTreeSet::new(),
			deadlines: HashMap::new(),
			next_id: 1,
			operation_timeout,
			closed: false,
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed
	}

	fn next_id(&mut self) -> OperationId {
		let id = self.next_id;
		self.next_id += 1;
		id
	}

	pub fn submit_request(
		&mut self,
		options: RequestResponseOperationOptions,
		reply: oneshot::Sender<Result<Response, OperationError>>,
	) -> OperationId {
		let id = self.next_id();
		let deadline = Instant::now() + self.operation_timeout;
		self.deadlines.insert(id, deadline);
		self.timeouts.insert((deadline, id));
		self.operations.insert(
			id,
			Operation {
				id,
				kind: OperationKind::RequestResponse,
				state: OperationState::Queued,
				options: OperationOptions::RequestResponse { options, reply },
				pending_subscription_count: 0,
				inserted_in_tables: false,
			},
		);
		self.queue.push_back(id);
		tracing::debug!(operation = id, "request-response operation queued");
		id
	}

	pub fn create_stream(&mut self, filter: FilterBuf, messages: mpsc::Sender<IncomingMessage>, status: mpsc::Sender<SubscriptionStatus>) -> OperationId {
		let id = self.next_id();
		self.operations.insert(
			id,
			Operation {
				id,
				kind: OperationKind::Streaming,
				state: OperationState::Created,
				options: OperationOptions::Streaming { filter, messages, status },
				pending_subscription_count: 0,
				inserted_in_tables: false,
			},
		);
		id
	}

	/// Idempotent while the stream is alive; fails once closed.
	pub fn open_stream(&mut self, id: OperationId) -> Result<(), StreamError> {
		let Some(op) = self.operations.get_mut(&id) else {
			return Err(StreamError::AlreadyClosed);
		};
		if op.state == OperationState::Created {
			op.state = OperationState::Queued;
			self.queue.push_back(id);
			tracing::debug!(operation = id, "streaming operation opened");
		}
		Ok(())
	}

	pub fn close_stream(&mut self, id: OperationId) {
		if self.operations.contains_key(&id) {
			self.terminate_stream(id, SubscriptionStatus::halted("stream closed"));
		}
	}

	pub fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		let ids: Vec<OperationId> = self.operations.keys().copied().collect();
		for id in ids {
			let Some(kind) = self.operations.get(&id).map(|op| op.kind) else { continue };
			match kind {
				OperationKind::RequestResponse => self.terminate_request_response(id, Err(OperationError::ClientClosed)),
				OperationKind::Streaming => {
					self.terminate_stream(id, SubscriptionStatus::halted(OperationError::AlreadyClosed.to_string()))
				}
			}
		}
		self.queue.clear();
		self.subscriptions.close();
		self.handle_manager_events();
	}

	pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
		match event {
			AdapterEvent::ConnectionStatus { connected, joined_session } => {
				self.subscriptions.handle_connection_status(connected, joined_session)
			}
			AdapterEvent::SubscribeComplete { filter, error } => self.subscriptions.handle_subscribe_complete(filter, error),
			AdapterEvent::UnsubscribeComplete { filter, error } => self.subscriptions.handle_unsubscribe_complete(filter, error),
			AdapterEvent::PublishComplete { operation, error } => self.handle_publish_complete(operation, error),
			AdapterEvent::IncomingPublish { topic, payload } => self.handle_incoming_publish(topic, payload),
		}
		self.handle_manager_events();
		self.service();
	}

	/// The next deadline to arm the timeout `Sleep` at, if any.
	pub fn check_timeouts(&mut self, now: Instant) -> Option<Instant> {
		loop {
			let Some(&(deadline, id)) = self.timeouts.iter().next() else { return None };
			if deadline > now {
				return Some(deadline);
			}
			self.timeouts.remove(&(deadline, id));
			self.deadlines.remove(&id);
			if self.operations.contains_key(&id) {
				tracing::debug!(operation = id, "operation timed out");
				self.terminate_request_response(id, Err(OperationError::Timeout));
			}
		}
	}

	/// Drains as much of the FIFO queue as is currently dequeueable.
	pub fn service(&mut self) {
		self.subscriptions.purge();
		self.handle_manager_events();
		loop {
			let Some(&id) = self.queue.front() else { break };
			if !self.operations.contains_key(&id) {
				self.queue.pop_front();
				continue;
			}
			if !self.can_dequeue(id) {
				break;
			}
			let filters = self.filters_for(id);
			let kind = self.subscription_kind(id);
			let result = self.subscriptions.acquire(id, kind, &filters);
			if matches!(result, AcquireResult::Blocked) {
				break;
			}
			self.queue.pop_front();
			self.dispatch(id, result);
			self.handle_manager_events();
		}
	}

	fn can_dequeue(&self, id: OperationId) -> bool {
		let Some(op) = self.operations.get(&id) else { return true };
		match &op.options {
			OperationOptions::RequestResponse { options, .. } => {
				let token = options.correlation_token.clone().unwrap_or_default();
				!self.operations_by_token.contains_key(&token)
			}
			OperationOptions::Streaming { .. } => true,
		}
	}

	fn filters_for(&self, id: OperationId) -> Vec<FilterBuf> {
		match self.operations.get(&id).map(|op| &op.options) {
			Some(OperationOptions::RequestResponse { options, .. }) => options.subscription_topic_filters.clone(),
			Some(OperationOptions::Streaming { filter, .. }) => vec![filter.clone()],
			None => Vec::new(),
		}
	}

	fn subscription_kind(&self, id: OperationId) -> SubscriptionKind {
		match self.operations.get(&id).map(|op| op.kind) {
			Some(OperationKind::RequestResponse) => SubscriptionKind::RequestResponse,
			_ => SubscriptionKind::EventStream,
		}
	}

	fn dispatch(&mut self, id: OperationId, result: AcquireResult) {
		match result {
			AcquireResult::Failure | AcquireResult::NoCapacity => self.complete_with_acquire_failure(id, result),
			AcquireResult::Subscribed => {
				self.insert_into_tables(id);
				let kind = self.operations.get(&id).map(|op| op.kind);
				match kind {
					Some(OperationKind::RequestResponse) => {
						if let Some(op) = self.operations.get_mut(&id) {
							op.state = OperationState::PendingResponse;
						}
						self.issue_publish(id);
					}
					Some(OperationKind::Streaming) => self.on_stream_established(id),
					None => {}
				}
			}
			AcquireResult::Subscribing => {
				self.insert_into_tables(id);
				let filters = self.filters_for(id);
				let pending = filters.iter().filter(|f| !self.subscriptions.is_subscribed(f)).count() as u32;
				if let Some(op) = self.operations.get_mut(&id) {
					op.state = OperationState::PendingSubscription;
					op.pending_subscription_count = pending;
				}
			}
			AcquireResult::Blocked => unreachable!("service loop does not dispatch on Blocked"),
		}
	}

	fn complete_with_acquire_failure(&mut self, id: OperationId, result: AcquireResult) {
		let Some(kind) = self.operations.get(&id).map(|op| op.kind) else { return };
		match kind {
			OperationKind::RequestResponse => self.terminate_request_response(id, Err(OperationError::Acquire(result))),
			OperationKind::Streaming => self.terminate_stream(id, SubscriptionStatus::halted(StreamError::Acquire(result).to_string())),
		}
	}

	fn insert_into_tables(&mut self, id: OperationId) {
		let already = self.operations.get(&id).map(|op| op.inserted_in_tables).unwrap_or(true);
		if already {
			return;
		}
		if let Some(op) = self.operations.get(&id) {
			match &op.options {
				OperationOptions::RequestResponse { options, .. } => {
					for path in &options.response_paths {
						let entry = self
							.response_paths
							.entry(path.topic.clone())
							.or_insert_with(|| ResponsePathEntry { reference_count: 0, correlation_token_path: path.correlation_token_path.clone() });
						entry.reference_count += 1;
					}
					let token = options.correlation_token.clone().unwrap_or_default();
					self.operations_by_token.insert(token, id);
				}
				OperationOptions::Streaming { filter, .. } => {
					self.streaming_by_filter.entry(filter.clone()).or_default().insert(id);
				}
			}
		}
		if let Some(op) = self.operations.get_mut(&id) {
			op.inserted_in_tables = true;
		}
	}

	fn issue_publish(&mut self, id: OperationId) {
		let Some(op) = self.operations.get(&id) else { return };
		let OperationOptions::RequestResponse { options, .. } = &op.options else { return };
		let topic = options.publish_topic.clone();
		let payload = options.payload.clone();
		if let Err(error) = self.adapter.publish(topic, payload, self.operation_timeout, id) {
			self.terminate_request_response(id, Err(OperationError::PublishFailure(error.to_string())));
		}
	}

	fn handle_publish_complete(&mut self, id: OperationId, error: Option<String>) {
		if let Some(message) = error {
			if self.operations.contains_key(&id) {
				self.terminate_request_response(id, Err(OperationError::PublishFailure(message)));
			}
		}
	}

	fn handle_incoming_publish(&mut self, topic: TopicBuf, payload: Bytes) {
		if let Some(entry) = self.response_paths.get(&topic) {
			let token = match &entry.correlation_token_path {
				None => Some(String::new()),
				Some(path) => path.extract(&payload),
			};
			match token {
				Some(token) => {
					if let Some(&id) = self.operations_by_token.get(&token) {
						self.terminate_request_response(id, Ok(Response { topic: topic.clone(), payload: payload.clone() }));
					}
				}
				None => tracing::warn!(%topic, "dropping incoming publish: correlation token missing or malformed"),
			}
		}

		for (filter, listeners) in &self.streaming_by_filter {
			if filter.matches_topic(&topic).is_none() {
				continue;
			}
			for &id in listeners {
				if let Some(op) = self.operations.get(&id) {
					if let OperationOptions::Streaming { messages, .. } = &op.options {
						if messages.try_send(IncomingMessage { topic: topic.clone(), payload: payload.clone() }).is_err() {
							tracing::warn!(operation = id, %topic, "dropping message: listener buffer full or closed");
						}
					}
				}
			}
		}
	}

	fn handle_manager_events(&mut self) {
		let events: Vec<ManagerEvent> = self.subscriptions.drain_events().collect();
		for event in events {
			match event {
				ManagerEvent::SubscribeSuccess { operation } => self.on_subscribe_success(operation),
				ManagerEvent::SubscribeFailure { operation, message } => {
					self.terminate_request_response(operation, Err(OperationError::SubscribeFailure(message)))
				}
				ManagerEvent::StreamingSubscriptionEstablished { operation } => self.on_stream_established(operation),
				ManagerEvent::StreamingSubscriptionHalted { operation, message } => {
					self.terminate_stream(operation, SubscriptionStatus::halted(message))
				}
				ManagerEvent::StreamingSubscriptionLost { operation } => self.send_stream_status(operation, SubscriptionStatus::lost()),
				ManagerEvent::SubscriptionEnded { operation } => {
					self.terminate_request_response(operation, Err(OperationError::SubscriptionEnded))
				}
				ManagerEvent::SubscriptionOrphaned { .. } | ManagerEvent::UnsubscribeComplete { .. } => {}
			}
		}
	}

	fn on_subscribe_success(&mut self, id: OperationId) {
		let Some(op) = self.operations.get_mut(&id) else { return };
		if op.state != OperationState::PendingSubscription {
			return;
		}
		op.pending_subscription_count = op.pending_subscription_count.saturating_sub(1);
		if op.pending_subscription_count == 0 {
			op.state = OperationState::PendingResponse;
			self.issue_publish(id);
		}
	}

	fn on_stream_established(&mut self, id: OperationId) {
		if let Some(op) = self.operations.get_mut(&id) {
			op.state = OperationState::Subscribed;
		}
		self.send_stream_status(id, SubscriptionStatus::established());
	}

	fn send_stream_status(&self, id: OperationId, status: SubscriptionStatus) {
		if let Some(op) = self.operations.get(&id) {
			if let OperationOptions::Streaming { status: status_tx, .. } = &op.options {
				let _ = status_tx.try_send(status);
			}
		}
	}

	fn terminate_request_response(&mut self, id: OperationId, result: Result<Response, OperationError>) {
		let Some(op) = self.operations.remove(&id) else { return };
		self.release_and_untable(&op);
		if let OperationOptions::RequestResponse { reply, .. } = op.options {
			let _ = reply.send(result);
		}
	}

	fn terminate_stream(&mut self, id: OperationId, status: SubscriptionStatus) {
		let Some(op) = self.operations.remove(&id) else { return };
		self.release_and_untable(&op);
		if let OperationOptions::Streaming { status: status_tx, .. } = &op.options {
			let _ = status_tx.try_send(status);
		}
	}

	fn release_and_untable(&mut self, op: &Operation) {
		if let Some(deadline) = self.deadlines.remove(&op.id) {
			self.timeouts.remove(&(deadline, op.id));
		}

		let filters = match &op.options {
			OperationOptions::RequestResponse { options, .. } => options.subscription_topic_filters.clone(),
			OperationOptions::Streaming { filter, .. } => vec![filter.clone()],
		};
		self.subscriptions.release(op.id, &filters);

		if !op.inserted_in_tables {
			return;
		}
		match &op.options {
			OperationOptions::RequestResponse { options, .. } => {
				for path in &options.response_paths {
					if let Some(entry) = self.response_paths.get_mut(&path.topic) {
						entry.reference_count = entry.reference_count.saturating_sub(1);
						if entry.reference_count == 0 {
							self.response_paths.remove(&path.topic);
						}
					}
				}
				let token = options.correlation_token.clone().unwrap_or_default();
				if self.operations_by_token.get(&token) == Some(&op.id) {
					self.operations_by_token.remove(&token);
				}
			}
			OperationOptions::Streaming { filter, .. } => {
				if let Some(listeners) = self.streaming_by_filter.get_mut(filter) {
					listeners.remove(&op.id);
					if listeners.is_empty() {
						self.streaming_by_filter.remove(filter);
					}
				}
			}
		}
	}
}
