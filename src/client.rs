//! The Public Client Facade: validates inputs, owns the driver task, and
//! exposes `submit_request`/`create_stream` as the crate's only public
//! entry points.
//!
//! Construction is synchronous (validation only); the driver task is
//! spawned immediately after, and the constructor returns without waiting
//! on it.

use crate::{
	adapter::{AdapterEvent, ProtocolAdapter},
	engine::OperationEngine,
	error::{CreateStreamError, OperationError, StreamError, SubmitError},
	events::{IncomingMessage, Response, SubscriptionStatus},
	filter::FilterBuf,
	options::{RequestResponseClientOptions, RequestResponseOperationOptions, StreamingOperationOptions},
	subscription::{OperationId, SubscriptionManager},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

enum EngineCommand {
	SubmitRequest { options: RequestResponseOperationOptions, reply: oneshot::Sender<Result<Response, OperationError>> },
	CreateStream { filter: FilterBuf, messages: mpsc::Sender<IncomingMessage>, status: mpsc::Sender<SubscriptionStatus>, reply: oneshot::Sender<OperationId> },
	OpenStream { id: OperationId, reply: oneshot::Sender<Result<(), StreamError>> },
	CloseStream { id: OperationId },
	Close { done: oneshot::Sender<()> },
}

/// A handle to a client-managed request-response/streaming core.
///
/// Cloning is cheap: every clone shares the same driver task through the
/// command channel.
#[derive(Clone)]
pub struct RequestResponseClient {
	commands: mpsc::Sender<EngineCommand>,
	response_queue_capacity: usize,
}

impl RequestResponseClient {
	/// Validates `options`, spawns the driver task, and returns immediately.
	/// No I/O happens here.
	pub fn new(
		adapter: Arc<dyn ProtocolAdapter>,
		adapter_events: mpsc::Receiver<AdapterEvent>,
		options: RequestResponseClientOptions,
	) -> Result<Self, crate::error::OptionsError> {
		options.validate()?;

		let subscriptions =
			SubscriptionManager::new(adapter.clone(), options.max_rr_subscriptions, options.max_streaming_subscriptions, options.operation_timeout);
		let engine = OperationEngine::new(adapter, subscriptions, options.operation_timeout);
		let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

		tokio::spawn(run(engine, commands_rx, adapter_events));

		Ok(Self { commands: commands_tx, response_queue_capacity: options.default_response_queue_capacity })
	}

	/// Publishes a request and awaits its correlated response.
	///
	/// # Example
	///
	/// ```no_run
	/// # tokio_test::block_on(async {
	/// # use mqtt_request_response::{
	/// # 	CorrelationPath, RequestResponseClient, RequestResponseClientOptions, RequestResponseOperationOptions, ResponsePathSpec,
	/// # };
	/// # use std::sync::Arc;
	/// # use tokio::sync::mpsc;
	/// # let (_tx, adapter_events) = mpsc::channel(1);
	/// # let adapter: Arc<dyn mqtt_request_response::ProtocolAdapter> = unimplemented!();
	/// let client = RequestResponseClient::new(adapter, adapter_events, RequestResponseClientOptions::default())?;
	///
	/// let response = client
	/// 	.submit_request(RequestResponseOperationOptions {
	/// 		subscription_topic_filters: vec!["devices/1/reply".try_into()?],
	/// 		response_paths: vec![ResponsePathSpec {
	/// 			topic: "devices/1/reply".try_into()?,
	/// 			correlation_token_path: Some(CorrelationPath::parse("id")?),
	/// 		}],
	/// 		publish_topic: "devices/1/cmd".try_into()?,
	/// 		payload: b"{\"id\":1}"[..].into(),
	/// 		correlation_token: Some("1".into()),
	/// 	})
	/// 	.await?;
	///
	/// println!("{:?}", response.payload);
	/// # Ok::<(), Box<dyn std::error::Error>>(())
	/// # })
	/// ```
	#[tracing::instrument(skip(self, options), fields(publish_topic = %options.publish_topic))]
	pub async fn submit_request(&self, options: RequestResponseOperationOptions) -> Result<Response, SubmitError> {
		options.validate()?;

		let (reply_tx, reply_rx) = oneshot::channel();
		if self.commands.send(EngineCommand::SubmitRequest { options, reply: reply_tx }).await.is_err() {
			return Err(SubmitError::Operation(OperationError::AlreadyClosed));
		}

		match reply_rx.await {
			Ok(result) => result.map_err(SubmitError::Operation),
			Err(_) => Err(SubmitError::Operation(OperationError::ClientClosed)),
		}
	}

	/// Creates an inert streaming subscription handle; call `open` on it to
	/// begin receiving messages.
	pub async fn create_stream(&self, options: StreamingOperationOptions) -> Result<StreamSubscription, CreateStreamError> {
		options.validate()?;

		let (messages_tx, messages_rx) = mpsc::channel(self.response_queue_capacity);
		let (status_tx, status_rx) = mpsc::channel(self.response_queue_capacity);
		let (reply_tx, reply_rx) = oneshot::channel();

		self.commands
			.send(EngineCommand::CreateStream { filter: options.subscription_topic_filter, messages: messages_tx, status: status_tx, reply: reply_tx })
			.await
			.map_err(|_| CreateStreamError::Stream(StreamError::AlreadyClosed))?;

		let id = reply_rx.await.map_err(|_| CreateStreamError::Stream(StreamError::AlreadyClosed))?;

		Ok(StreamSubscription { id, commands: self.commands.clone(), messages: messages_rx, status: status_rx })
	}

	/// Closes the client: every in-flight operation is completed with a
	/// "client closed" error, and every streaming subscription is halted.
	pub async fn close(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		if self.commands.send(EngineCommand::Close { done: done_tx }).await.is_ok() {
			let _ = done_rx.await;
		}
	}
}

/// A handle to a single streaming subscription.
pub struct StreamSubscription {
	id: OperationId,
	commands: mpsc::Sender<EngineCommand>,
	messages: mpsc::Receiver<IncomingMessage>,
	status: mpsc::Receiver<SubscriptionStatus>,
}

impl StreamSubscription {
	/// Idempotent while the stream is alive; fails with a terminal error
	/// once the stream (or the client) has been closed.
	pub async fn open(&self) -> Result<(), StreamError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.commands.send(EngineCommand::OpenStream { id: self.id, reply: reply_tx }).await.map_err(|_| StreamError::AlreadyClosed)?;
		reply_rx.await.map_err(|_| StreamError::AlreadyClosed)?
	}

	pub async fn close(&self) {
		let _ = self.commands.send(EngineCommand::CloseStream { id: self.id }).await;
	}

	pub async fn recv_message(&mut self) -> Option<IncomingMessage> {
		self.messages.recv().await
	}

	pub async fn recv_status(&mut self) -> Option<SubscriptionStatus> {
		self.status.recv().await
	}
}

async fn run(mut engine: OperationEngine, mut commands: mpsc::Receiver<EngineCommand>, mut adapter_events: mpsc::Receiver<AdapterEvent>) {
	engine.service();

	let timeout_sleep = tokio::time::sleep(IDLE_WAKEUP);
	tokio::pin!(timeout_sleep);

	loop {
		tokio::select! {
			command = commands.recv() => {
				let Some(command) = command else { break };
				match command {
					EngineCommand::SubmitRequest { options, reply } => {
						engine.submit_request(options, reply);
					}
					EngineCommand::CreateStream { filter, messages, status, reply } => {
						let id = engine.create_stream(filter, messages, status);
						let _ = reply.send(id);
					}
					EngineCommand::OpenStream { id, reply } => {
						let _ = reply.send(engine.open_stream(id));
					}
					EngineCommand::CloseStream { id } => {
						engine.close_stream(id);
					}
					EngineCommand::Close { done } => {
						engine.close();
						let _ = done.send(());
						return;
					}
				}
			}
			event = adapter_events.recv() => {
				match event {
					Some(event) => engine.handle_adapter_event(event),
					None => {
						tracing::warn!("adapter event channel closed; treating as disconnect");
					}
				}
			}
			() = &mut timeout_sleep => {}
		}

		// Every branch above may have released a subscription listener or a
		// correlation-token slot that a still-queued operation was waiting
		// on, so the queue must be re-serviced on every iteration, not just
		// the ones that happened to arrive via a command or adapter event.
		match engine.check_timeouts(tokio::time::Instant::now()) {
			Some(deadline) => timeout_sleep.as_mut().reset(deadline),
			None => timeout_sleep.as_mut().reset(tokio::time::Instant::now() + IDLE_WAKEUP),
		}
		engine.service();
	}

	engine.close();
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		adapter::SubscribeFailure, correlation::CorrelationPath, events::SubscriptionStatusKind, fake_adapter::FakeAdapter,
		options::ResponsePathSpec, topic::TopicBuf,
	};
	use bytes::Bytes;

	fn client_options() -> RequestResponseClientOptions {
		RequestResponseClientOptions {
			max_rr_subscriptions: 4,
			max_streaming_subscriptions: 1,
			operation_timeout: Duration::from_secs(2),
			default_response_queue_capacity: 16,
		}
	}

	fn build(options: RequestResponseClientOptions) -> (RequestResponseClient, Arc<FakeAdapter>) {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();

		let (events_tx, events_rx) = mpsc::channel(64);
		let adapter = FakeAdapter::new(events_tx);
		let client = RequestResponseClient::new(adapter.clone(), events_rx, options).unwrap();
		(client, adapter)
	}

	#[tokio::test]
	async fn rr_success_single_filter() {
		let (client, adapter) = build(client_options());

		let request = RequestResponseOperationOptions {
			subscription_topic_filters: vec![FilterBuf::new("a/b/+").unwrap()],
			response_paths: vec![
				ResponsePathSpec {
					topic: TopicBuf::new("a/b/accepted").unwrap(),
					correlation_token_path: Some(CorrelationPath::parse("token").unwrap()),
				},
				ResponsePathSpec {
					topic: TopicBuf::new("a/b/rejected").unwrap(),
					correlation_token_path: Some(CorrelationPath::parse("token").unwrap()),
				},
			],
			publish_topic: TopicBuf::new("a/b/derp").unwrap(),
			payload: Bytes::from_static(br#"{"token":"abcd"}"#),
			correlation_token: Some("abcd".into()),
		};

		let handle = tokio::spawn({
			let client = client.clone();
			async move { client.submit_request(request).await }
		});

		tokio::time::sleep(Duration::from_millis(10)).await;
		adapter.push_incoming(TopicBuf::new("a/b/accepted").unwrap(), Bytes::from_static(br#"{"token":"abcd"}"#)).await;

		let response = handle.await.unwrap().unwrap();
		assert_eq!(response.topic.as_str(), "a/b/accepted");
	}

	#[tokio::test(start_paused = true)]
	async fn rr_timeout_when_subscribe_never_completes() {
		let (client, adapter) = build(client_options());
		adapter.hold_subscribe(FilterBuf::new("a/b").unwrap());

		let request = RequestResponseOperationOptions {
			subscription_topic_filters: vec![FilterBuf::new("a/b").unwrap()],
			response_paths: vec![ResponsePathSpec { topic: TopicBuf::new("a/c").unwrap(), correlation_token_path: None }],
			publish_topic: TopicBuf::new("a/b/derp").unwrap(),
			payload: Bytes::from_static(b"x"),
			correlation_token: None,
		};

		let handle = tokio::spawn({
			let client = client.clone();
			async move { client.submit_request(request).await }
		});

		tokio::time::advance(Duration::from_secs(3)).await;

		let error = handle.await.unwrap().unwrap_err();
		assert!(error.to_string().contains("timeout"));
	}

	#[tokio::test]
	async fn rr_subscribe_failure_never_publishes() {
		let (client, adapter) = build(client_options());
		let filter = FilterBuf::new("a/b").unwrap();
		adapter.fail_next_subscribe(filter.clone(), SubscribeFailure { message: "permission denied".into(), retryable: false });

		let request = RequestResponseOperationOptions {
			subscription_topic_filters: vec![filter],
			response_paths: vec![ResponsePathSpec { topic: TopicBuf::new("a/c").unwrap(), correlation_token_path: None }],
			publish_topic: TopicBuf::new("a/b/derp").unwrap(),
			payload: Bytes::from_static(b"x"),
			correlation_token: None,
		};

		let error = client.submit_request(request).await.unwrap_err();
		assert!(error.to_string().contains("Subscribe failure"));
		assert!(adapter.publish_calls().is_empty());
	}

	#[tokio::test]
	async fn streaming_budget_exhaustion_then_recovery() {
		let mut options = client_options();
		options.max_streaming_subscriptions = 1;
		let (client, _adapter) = build(options);

		let stream1 = client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("a/b").unwrap() }).await.unwrap();
		stream1.open().await.unwrap();

		let mut stream2 = client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("a/b").unwrap() }).await.unwrap();
		stream2.open().await.unwrap();
		assert!(matches!(stream2.recv_status().await.unwrap().kind, SubscriptionStatusKind::Established));

		let mut stream3 = client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("b/c").unwrap() }).await.unwrap();
		stream3.open().await.unwrap();
		let status = stream3.recv_status().await.unwrap();
		assert!(matches!(status.kind, SubscriptionStatusKind::Halted));
		assert!(status.error.unwrap().contains("NoCapacity"));

		stream1.close().await;
		stream2.close().await;

		// let purge reap both releases before the budget is re-checked
		tokio::time::sleep(Duration::from_millis(10)).await;

		let mut stream4 = client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("b/c").unwrap() }).await.unwrap();
		stream4.open().await.unwrap();
		assert!(matches!(stream4.recv_status().await.unwrap().kind, SubscriptionStatusKind::Established));
	}

	#[tokio::test]
	async fn streaming_unsubscribe_failure_retains_slot() {
		let mut options = client_options();
		options.max_streaming_subscriptions = 1;
		let (client, adapter) = build(options);

		let filter = FilterBuf::new("a/b").unwrap();
		let stream1 = client.create_stream(StreamingOperationOptions { subscription_topic_filter: filter.clone() }).await.unwrap();
		stream1.open().await.unwrap();

		adapter.fail_next_unsubscribe(filter, "still in use");
		stream1.close().await;

		// let purge dispatch the (failing) unsubscribe and the completion settle
		tokio::time::sleep(Duration::from_millis(10)).await;

		let mut stream2 =
			client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("b/c").unwrap() }).await.unwrap();
		stream2.open().await.unwrap();
		let status = stream2.recv_status().await.unwrap();
		assert!(matches!(status.kind, SubscriptionStatusKind::Halted));
		assert!(status.error.unwrap().contains("NoCapacity"));
	}

	#[tokio::test]
	async fn streaming_survives_session_loss() {
		let (client, adapter) = build(client_options());

		let mut stream = client.create_stream(StreamingOperationOptions { subscription_topic_filter: FilterBuf::new("a/b").unwrap() }).await.unwrap();
		stream.open().await.unwrap();
		assert!(matches!(stream.recv_status().await.unwrap().kind, SubscriptionStatusKind::Established));

		adapter.push_connection_status(false, None).await;
		adapter.push_connection_status(true, Some(false)).await;

		assert!(matches!(stream.recv_status().await.unwrap().kind, SubscriptionStatusKind::Lost));
		assert!(matches!(stream.recv_status().await.unwrap().kind, SubscriptionStatusKind::Established));

		adapter.push_incoming(TopicBuf::new("a/b").unwrap(), Bytes::from_static(b"hello")).await;
		let message = stream.recv_message().await.unwrap();
		assert_eq!(message.payload, Bytes::from_static(b"hello"));
	}

	fn shared_filter_request(token: Option<&str>) -> RequestResponseOperationOptions {
		RequestResponseOperationOptions {
			subscription_topic_filters: vec![FilterBuf::new("a/b/+").unwrap()],
			response_paths: vec![ResponsePathSpec {
				topic: TopicBuf::new("a/b/accepted").unwrap(),
				correlation_token_path: Some(CorrelationPath::parse("token").unwrap()),
			}],
			publish_topic: TopicBuf::new("a/b/derp").unwrap(),
			payload: Bytes::from_static(br#"{"placeholder":true}"#),
			correlation_token: token.map(str::to_owned),
		}
	}

	/// Two operations sharing the empty-token class must publish strictly in
	/// submission order: the second must not be dequeued (and so must not
	/// publish) until the first has terminated.
	#[tokio::test]
	async fn same_token_class_serializes_fifo() {
		let (client, adapter) = build(client_options());

		let handle_one = tokio::spawn({
			let client = client.clone();
			async move { client.submit_request(shared_filter_request(None)).await }
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		let handle_two = tokio::spawn({
			let client = client.clone();
			async move { client.submit_request(shared_filter_request(None)).await }
		});
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert_eq!(adapter.publish_calls().len(), 1, "second op in the same token class must stay queued");

		adapter.push_incoming(TopicBuf::new("a/b/accepted").unwrap(), Bytes::from_static(br#"{"token":""}"#)).await;
		handle_one.await.unwrap().unwrap();

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(adapter.publish_calls().len(), 2, "first op's termination must free the second to publish");

		adapter.push_incoming(TopicBuf::new("a/b/accepted").unwrap(), Bytes::from_static(br#"{"token":""}"#)).await;
		handle_two.await.unwrap().unwrap();
	}

	/// Operations with distinct correlation tokens interleave freely even
	/// while sharing a single subscription, and each resolves with its own
	/// response regardless of submission order.
	#[tokio::test]
	async fn distinct_tokens_interleave_on_shared_subscription() {
		let (client, adapter) = build(client_options());

		let mut handles = Vec::new();
		for i in 0..6u32 {
			let token = format!("tok-{i}");
			let client = client.clone();
			handles.push(tokio::spawn(async move { client.submit_request(shared_filter_request(Some(&token))).await }));
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(adapter.publish_calls().len(), 6);

		for i in 0..6u32 {
			let token = format!("tok-{i}");
			adapter
				.push_incoming(TopicBuf::new("a/b/accepted").unwrap(), Bytes::from(format!(r#"{{"token":"{token}"}}"#)))
				.await;
		}

		for handle in handles {
			let response = handle.await.unwrap().unwrap();
			assert_eq!(response.topic.as_str(), "a/b/accepted");
		}
	}
}
