//! An in-crate `ProtocolAdapter` test double. Records every call, and can be
//! scripted per filter to auto-acknowledge, fail (retryable or not), or stay
//! silent — the last of which is how the timeout tests are driven.
//!
//! Driven by hand, the same way a client task gets exercised with an
//! in-memory transport substitute rather than a real broker connection.

use crate::{
	adapter::{AdapterError, AdapterEvent, ConnectionState, ProtocolAdapter, SubscribeFailure},
	filter::FilterBuf,
	subscription::OperationId,
	topic::TopicBuf,
};
use bytes::Bytes;
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::sync::mpsc;

struct State {
	connection: ConnectionState,
	subscribe_calls: Vec<FilterBuf>,
	unsubscribe_calls: Vec<FilterBuf>,
	publish_calls: Vec<(TopicBuf, Bytes, OperationId)>,
	held_subscribes: HashSet<FilterBuf>,
	subscribe_failures: HashMap<FilterBuf, SubscribeFailure>,
	unsubscribe_failures: HashMap<FilterBuf, String>,
}

pub struct FakeAdapter {
	state: Mutex<State>,
	events: mpsc::Sender<AdapterEvent>,
}

impl FakeAdapter {
	pub fn new(events: mpsc::Sender<AdapterEvent>) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(State {
				connection: ConnectionState::Connected,
				subscribe_calls: Vec::new(),
				unsubscribe_calls: Vec::new(),
				publish_calls: Vec::new(),
				held_subscribes: HashSet::new(),
				subscribe_failures: HashMap::new(),
				unsubscribe_failures: HashMap::new(),
			}),
			events,
		})
	}

	/// Subsequent `subscribe` calls for `filter` record but never complete.
	pub fn hold_subscribe(&self, filter: FilterBuf) {
		self.state.lock().unwrap().held_subscribes.insert(filter);
	}

	/// The next `subscribe` call for `filter` completes with this failure.
	pub fn fail_next_subscribe(&self, filter: FilterBuf, failure: SubscribeFailure) {
		self.state.lock().unwrap().subscribe_failures.insert(filter, failure);
	}

	/// The next `unsubscribe` call for `filter` completes with this error.
	pub fn fail_next_unsubscribe(&self, filter: FilterBuf, error: impl Into<String>) {
		self.state.lock().unwrap().unsubscribe_failures.insert(filter, error.into());
	}

	pub fn subscribe_calls(&self) -> Vec<FilterBuf> {
		self.state.lock().unwrap().subscribe_calls.clone()
	}

	pub fn publish_calls(&self) -> Vec<(TopicBuf, Bytes, OperationId)> {
		self.state.lock().unwrap().publish_calls.clone()
	}

	pub async fn push_incoming(&self, topic: TopicBuf, payload: impl Into<Bytes>) {
		let _ = self.events.send(AdapterEvent::IncomingPublish { topic, payload: payload.into() }).await;
	}

	pub async fn push_connection_status(&self, connected: bool, joined_session: Option<bool>) {
		self.state.lock().unwrap().connection = if connected { ConnectionState::Connected } else { ConnectionState::Disconnected };
		let _ = self.events.send(AdapterEvent::ConnectionStatus { connected, joined_session }).await;
	}
}

impl ProtocolAdapter for FakeAdapter {
	fn subscribe(&self, filter: FilterBuf, _timeout: Duration) -> Result<(), AdapterError> {
		let mut state = self.state.lock().unwrap();
		state.subscribe_calls.push(filter.clone());

		if state.held_subscribes.contains(&filter) {
			return Ok(());
		}

		let error = state.subscribe_failures.remove(&filter);
		let _ = self.events.try_send(AdapterEvent::SubscribeComplete { filter, error });
		Ok(())
	}

	fn unsubscribe(&self, filter: FilterBuf, _timeout: Duration) -> Result<(), AdapterError> {
		let mut state = self.state.lock().unwrap();
		state.unsubscribe_calls.push(filter.clone());

		let error = state.unsubscribe_failures.remove(&filter);
		let _ = self.events.try_send(AdapterEvent::UnsubscribeComplete { filter, error });
		Ok(())
	}

	fn publish(&self, topic: TopicBuf, payload: Bytes, _timeout: Duration, operation: OperationId) -> Result<(), AdapterError> {
		self.state.lock().unwrap().publish_calls.push((topic, payload, operation));
		let _ = self.events.try_send(AdapterEvent::PublishComplete { operation, error: None });
		Ok(())
	}

	fn connection_state(&self) -> ConnectionState {
		self.state.lock().unwrap().connection
	}
}
