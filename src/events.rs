//! Events observable from outside the engine: status updates delivered to
//! streaming listeners, and the terminal success value of a request.

use crate::topic::TopicBuf;
use bytes::Bytes;

/// The kind of change a [`SubscriptionStatus`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatusKind {
	/// The subscription backing this stream is now active.
	Established,
	/// The broker session was lost; the manager will attempt to
	/// re-establish automatically. The stream remains alive.
	Lost,
	/// The stream's subscription has been permanently halted — either the
	/// broker rejected it terminally, or the client was closed. No further
	/// events follow.
	Halted,
}

/// A status update delivered to a streaming operation's listener.
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
	pub kind: SubscriptionStatusKind,
	pub error: Option<String>,
}

impl SubscriptionStatus {
	pub fn established() -> Self {
		Self { kind: SubscriptionStatusKind::Established, error: None }
	}

	pub fn lost() -> Self {
		Self { kind: SubscriptionStatusKind::Lost, error: None }
	}

	pub fn halted(error: impl Into<String>) -> Self {
		Self { kind: SubscriptionStatusKind::Halted, error: Some(error.into()) }
	}
}

/// A message delivered to a streaming operation's listener.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
	pub topic: TopicBuf,
	pub payload: Bytes,
}

/// The success resolution of `submit_request`.
#[derive(Debug, Clone)]
pub struct Response {
	pub topic: TopicBuf,
	pub payload: Bytes,
}
