//! The Protocol Adapter: the uniform, non-blocking surface the core demands
//! of whatever carries MQTT traffic for it.
//!
//! Everything about *how* a concrete transport dials a broker, renegotiates
//! TLS, or reconnects is outside this crate's scope — the core only ever
//! talks to a `ProtocolAdapter`, and only ever hears back through
//! [`AdapterEvent`]s delivered on the channel the caller wires up.

use crate::{filter::FilterBuf, subscription::OperationId, topic::TopicBuf};
use bytes::Bytes;
use std::time::Duration;

/// Failure returned synchronously from an adapter call — the command could
/// not even be dispatched (e.g. the transport task has gone away). This is
/// distinct from a broker-reported failure, which arrives later as an error
/// field on the matching [`AdapterEvent`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
	#[error("adapter is disconnected")]
	Disconnected,
	#[error("adapter task is no longer running")]
	Closed,
	#[error("{0}")]
	Other(String),
}

/// The current connectivity of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connected,
	Disconnected,
}

/// A broker-reported failure to establish a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeFailure {
	pub message: String,
	/// `true` if re-subscribing later might succeed (transient/quota-like
	/// codes); `false` if the failure is terminal for this filter (e.g. a
	/// permission denial).
	pub retryable: bool,
}

/// Events the adapter reports back to the core. Delivered in order, per
/// topic filter, on a channel the core's driver task selects on.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
	/// `joined_session = Some(true)` means the broker continued a prior
	/// session; `Some(false)` means all prior subscriptions were lost;
	/// `None` is only meaningful while disconnected.
	ConnectionStatus {
		connected: bool,
		joined_session: Option<bool>,
	},
	SubscribeComplete {
		filter: FilterBuf,
		error: Option<SubscribeFailure>,
	},
	UnsubscribeComplete {
		filter: FilterBuf,
		error: Option<String>,
	},
	/// `operation` is the opaque handle passed to [`ProtocolAdapter::publish`],
	/// returned verbatim.
	PublishComplete {
		operation: OperationId,
		error: Option<String>,
	},
	IncomingPublish {
		topic: TopicBuf,
		payload: Bytes,
	},
}

/// The capability the core requires of any transport binding.
///
/// Every method is non-blocking and returns as soon as the request has been
/// dispatched; completion is reported asynchronously via [`AdapterEvent`].
pub trait ProtocolAdapter: Send + Sync + 'static {
	fn subscribe(&self, filter: FilterBuf, timeout: Duration) -> Result<(), AdapterError>;

	fn unsubscribe(&self, filter: FilterBuf, timeout: Duration) -> Result<(), AdapterError>;

	/// `operation` is an opaque handle the core uses to match the eventual
	/// [`AdapterEvent::PublishComplete`] back to the originating operation.
	fn publish(
		&self,
		topic: TopicBuf,
		payload: Bytes,
		timeout: Duration,
		operation: OperationId,
	) -> Result<(), AdapterError>;

	fn connection_state(&self) -> ConnectionState;
}
