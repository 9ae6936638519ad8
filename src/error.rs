//! Crate-wide error taxonomy.
//!
//! Messages are written to contain the exact substrings callers (and this
//! crate's own tests) match on; see the error handling design in
//! `SPEC_FULL.md` §7.

use crate::subscription::AcquireResult;

pub use crate::adapter::AdapterError;

/// Validation failure for one of the three options structs.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
	#[error("Invalid client options: {0}")]
	InvalidClientOptions(String),
	#[error("Invalid request options: {0}")]
	InvalidRequestOptions(String),
	#[error("Invalid streaming options: {0}")]
	InvalidStreamingOptions(String),
}

/// Failure terminating a request-response operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
	/// Rejected before ever being enqueued, or failed because the client was
	/// already closed when the operation was submitted.
	#[error("the client has already been closed (already closed to new operations)")]
	AlreadyClosed,

	/// The client closed while this operation was still in flight.
	#[error("the client closed while this operation was still in flight")]
	ClientClosed,

	/// No response arrived within the configured operation timeout.
	#[error("operation timeout: no matching response received in time")]
	Timeout,

	/// The subscription manager could not acquire the operation's filters.
	#[error("failed to acquire subscription: {0:?}")]
	Acquire(AcquireResult),

	/// The broker reported a subscribe failure for one of the operation's
	/// filters.
	#[error("Subscribe failure: {0}")]
	SubscribeFailure(String),

	/// The session was lost while the operation was subscribed.
	#[error("Subscription Ended: the broker session was lost")]
	SubscriptionEnded,

	/// The broker reported a publish failure.
	#[error("Publish failure: {0}")]
	PublishFailure(String),
}

/// Failure reported to a streaming operation's status listener.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
	#[error("the client has already been closed (already closed to new operations)")]
	AlreadyClosed,

	#[error("failed to acquire subscription: {0:?}")]
	Acquire(AcquireResult),

	#[error("Subscribe failure: {0}")]
	SubscribeFailure(String),
}

/// Failure from `submit_request`, covering both input validation and the
/// operation's own lifecycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
	#[error(transparent)]
	Options(#[from] OptionsError),
	#[error(transparent)]
	Operation(#[from] OperationError),
}

/// Failure from `create_stream` or a stream handle's `open`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CreateStreamError {
	#[error(transparent)]
	Options(#[from] OptionsError),
	#[error(transparent)]
	Stream(#[from] StreamError),
}
