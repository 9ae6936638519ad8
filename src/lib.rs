//! # mqtt-request-response
//!
//! Request/response and streaming-subscription abstractions layered over an
//! MQTT 3.1.1/5 publish/subscribe transport. Applications submit logical
//! operations — "publish a request, await a correlated response" or "listen
//! to an event stream on a topic filter" — and this crate takes
//! responsibility for subscribing, correlating replies, respecting a
//! bounded subscription budget, recovering from session loss, and
//! reporting failures.
//!
//! The transport itself is not this crate's concern: callers provide a
//! [`ProtocolAdapter`] binding whatever MQTT client they already have.

mod adapter;
mod client;
mod correlation;
mod engine;
mod error;
mod events;
pub mod filter;
mod options;
mod subscription;
pub mod topic;

#[cfg(test)]
mod fake_adapter;

pub use self::{
	adapter::{AdapterError, AdapterEvent, ConnectionState, ProtocolAdapter, SubscribeFailure},
	client::{RequestResponseClient, StreamSubscription},
	correlation::CorrelationPath,
	error::{CreateStreamError, OperationError, OptionsError, StreamError, SubmitError},
	events::{IncomingMessage, Response, SubscriptionStatus, SubscriptionStatusKind},
	filter::{Filter, FilterBuf, InvalidFilter},
	options::{RequestResponseClientOptions, RequestResponseOperationOptions, ResponsePathSpec, StreamingOperationOptions},
	subscription::{AcquireResult, OperationId},
	topic::{InvalidTopic, Topic, TopicBuf},
};
