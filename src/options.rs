//! Validated configuration for the client and its operations.
//!
//! Every struct here is constructed freely, then checked once at a single
//! `validate` boundary; nothing downstream re-validates. This mirrors the
//! teacher's `client_options`/`client_configuration` split: configuration is
//! plain data, independent of any particular adapter.

use crate::{correlation::CorrelationPath, error::OptionsError, filter::FilterBuf, topic::TopicBuf};
use std::time::Duration;

/// Client-wide configuration, validated once at construction.
#[derive(Debug, Clone)]
pub struct RequestResponseClientOptions {
	pub max_rr_subscriptions: u32,
	pub max_streaming_subscriptions: u32,
	pub operation_timeout: Duration,
	/// Bound on how many undelivered messages a streaming subscription may
	/// buffer before the oldest is dropped. **[EXPANDED]** beyond the
	/// distilled spec's validation rules.
	pub default_response_queue_capacity: usize,
}

impl Default for RequestResponseClientOptions {
	fn default() -> Self {
		Self {
			max_rr_subscriptions: 8,
			max_streaming_subscriptions: 8,
			operation_timeout: Duration::from_secs(30),
			default_response_queue_capacity: 64,
		}
	}
}

impl RequestResponseClientOptions {
	pub fn validate(&self) -> Result<(), OptionsError> {
		if self.max_rr_subscriptions < 2 {
			return Err(OptionsError::InvalidClientOptions(
				"max_rr_subscriptions must be a positive integer >= 2".into(),
			));
		}
		if self.operation_timeout.is_zero() {
			return Err(OptionsError::InvalidClientOptions(
				"operation_timeout_seconds must be a positive integer".into(),
			));
		}
		if self.default_response_queue_capacity == 0 {
			return Err(OptionsError::InvalidClientOptions(
				"default_response_queue_capacity must be a positive integer".into(),
			));
		}
		Ok(())
	}
}

/// One way a response may arrive for a request-response operation.
#[derive(Debug, Clone)]
pub struct ResponsePathSpec {
	pub topic: TopicBuf,
	pub correlation_token_path: Option<CorrelationPath>,
}

/// Per-operation configuration for `submit_request`.
#[derive(Debug, Clone)]
pub struct RequestResponseOperationOptions {
	pub subscription_topic_filters: Vec<FilterBuf>,
	pub response_paths: Vec<ResponsePathSpec>,
	pub publish_topic: TopicBuf,
	pub payload: bytes::Bytes,
	pub correlation_token: Option<String>,
}

impl RequestResponseOperationOptions {
	pub fn validate(&self) -> Result<(), OptionsError> {
		if self.subscription_topic_filters.is_empty() {
			return Err(OptionsError::InvalidRequestOptions("subscription_topic_filters must not be empty".into()));
		}
		if self.response_paths.is_empty() {
			return Err(OptionsError::InvalidRequestOptions("response_paths must not be empty".into()));
		}
		if self.payload.is_empty() {
			return Err(OptionsError::InvalidRequestOptions("payload must not be empty".into()));
		}
		if let Some(token) = &self.correlation_token {
			if token.is_empty() {
				return Err(OptionsError::InvalidRequestOptions("correlation_token must not be empty".into()));
			}
		}
		Ok(())
	}
}

/// Per-operation configuration for `create_stream`.
#[derive(Debug, Clone)]
pub struct StreamingOperationOptions {
	pub subscription_topic_filter: FilterBuf,
}

impl StreamingOperationOptions {
	pub fn validate(&self) -> Result<(), OptionsError> {
		if self.subscription_topic_filter.as_str().is_empty() {
			return Err(OptionsError::InvalidStreamingOptions("subscription_topic_filter must not be empty".into()));
		}
		Ok(())
	}
}
