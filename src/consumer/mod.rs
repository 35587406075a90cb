//! Pull-consumer flow controller.
//!
//! A pull consumer advances a server-side cursor by publishing explicit
//! pull requests and receiving deliveries on a private inbox. This module
//! keeps the client's outstanding message/byte budget under the configured
//! maximum, watches idle heartbeats, and, for ordered consumers, detects
//! delivery-sequence gaps and transparently recreates the consumer from
//! the last known-good stream position.

mod budget;
mod ordered;

pub use ordered::AckInfo;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    client::Client,
    error::{ConsumerError, Error, RequestError},
    headers::{
        PENDING_BYTES_HEADER, PENDING_MESSAGES_HEADER, STATUS_CONFLICT, STATUS_IDLE_HEARTBEAT,
        STATUS_NO_MESSAGES, STATUS_NO_RESPONDERS, STATUS_REQUEST_TIMEOUT,
    },
    message::Message,
    request::new_token,
    subscription::Subscriber,
};

use budget::PendingBudget;
use ordered::{CursorOutcome, OrderedCursor};

/// Recreate attempts before ordered recovery is declared failed.
const MAX_RECREATE_ATTEMPTS: u32 = 5;

/// When the consumer acknowledges deliveries.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// No acknowledgements; used by ordered consumers.
    None,
    /// Acknowledging a message acknowledges all before it.
    All,
    /// Every message is acknowledged individually.
    #[default]
    Explicit,
}

/// Where the consumer's cursor starts.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first message of the stream.
    #[default]
    All,
    /// From messages published after creation.
    New,
    /// From `opt_start_seq`.
    ByStartSequence,
}

/// Server-side consumer definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Consumer name; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Durable name; the consumer survives client restarts when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    /// Acknowledgement mode.
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// Cursor start position.
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    /// Start sequence for [`DeliverPolicy::ByStartSequence`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
}

/// Server-side consumer state returned by the stream API.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerInfo {
    /// Stream the consumer reads from.
    pub stream_name: String,
    /// Consumer name.
    pub name: String,
    /// Definition the server holds.
    pub config: ConsumerConfig,
    /// Messages available but not yet delivered.
    #[serde(default)]
    pub num_pending: u64,
}

/// Error envelope carried by stream API replies.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    success: bool,
}

/// Body of one pull request.
#[derive(Debug, Default, Serialize)]
struct PullRequest {
    batch: usize,
    #[serde(skip_serializing_if = "is_zero")]
    max_bytes: usize,
    /// Nanoseconds until the server expires the pull.
    #[serde(skip_serializing_if = "is_zero_u64")]
    expires: u64,
    /// Nanoseconds between server idle heartbeats.
    #[serde(skip_serializing_if = "is_zero_u64")]
    idle_heartbeat: u64,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

/// Tuning for pull traffic.
#[derive(Clone, Copy, Debug)]
pub struct PullOptions {
    /// Maximum messages outstanding across all open pulls.
    pub max_messages: usize,
    /// Maximum bytes outstanding; zero disables byte budgeting.
    pub max_bytes: usize,
    /// Server-side lifetime of each pull request.
    pub expires: Duration,
    /// Requested idle-heartbeat interval; zero disables heartbeats.
    pub idle_heartbeat: Duration,
    /// Consecutive quiet heartbeat windows tolerated before the budget is
    /// reset and the caller notified.
    pub heartbeat_misses: u32,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_bytes: 0,
            expires: Duration::from_secs(30),
            idle_heartbeat: Duration::from_secs(5),
            heartbeat_misses: 2,
        }
    }
}

/// Handle to one pull consumer.
#[derive(Debug)]
pub struct PullConsumer {
    client: Client,
    stream: String,
    name: String,
    inbox: String,
    sub: Subscriber,
    budget: PendingBudget,
    options: PullOptions,
    ordered: Option<OrderedCursor>,
}

impl PullConsumer {
    /// Create a consumer on `stream` and bind to it.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Api`] when the server rejects the
    /// definition, or a request error when the API call fails.
    pub async fn create(
        client: &Client,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        let info = create_consumer(client, stream, &config).await?;
        Self::bind_info(client, info, PullOptions::default()).await
    }

    /// Bind to an existing consumer without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Api`] when the consumer does not exist.
    pub async fn bind(client: &Client, stream: &str, name: &str) -> Result<Self, ConsumerError> {
        let subject = format!(
            "{}.CONSUMER.INFO.{stream}.{name}",
            client.config().api_prefix
        );
        let info: ConsumerInfo = api_request(client, subject, Bytes::new()).await?;
        Self::bind_info(client, info, PullOptions::default()).await
    }

    /// Create an ordered consumer: ack-free, gap-checked, transparently
    /// recreated on any delivery-sequence discontinuity.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub async fn create_ordered(client: &Client, stream: &str) -> Result<Self, ConsumerError> {
        let config = ConsumerConfig {
            name: Some(new_token()),
            ack_policy: AckPolicy::None,
            ..ConsumerConfig::default()
        };
        let info = create_consumer(client, stream, &config).await?;
        let mut consumer = Self::bind_info(client, info, PullOptions::default()).await?;
        consumer.ordered = Some(OrderedCursor::default());
        Ok(consumer)
    }

    async fn bind_info(
        client: &Client,
        info: ConsumerInfo,
        options: PullOptions,
    ) -> Result<Self, ConsumerError> {
        let inbox = client.new_inbox();
        let sub = client
            .subscribe_inner(inbox.clone(), None, None)
            .await
            .map_err(|_| ConsumerError::ConnectionClosed)?;
        Ok(Self {
            client: client.clone(),
            stream: info.stream_name,
            name: info.name,
            inbox,
            sub,
            budget: PendingBudget::new(options.max_messages, options.max_bytes),
            options,
            ordered: None,
        })
    }

    /// Replace the default pull tuning.
    #[must_use]
    pub fn with_options(mut self, options: PullOptions) -> Self {
        self.options = options;
        self.budget = PendingBudget::new(options.max_messages, options.max_bytes);
        self
    }

    /// Stream this consumer reads from.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Server-side consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch up to `batch` messages, ending once the batch is satisfied or
    /// the pull expires.
    pub fn fetch(&mut self, batch: usize) -> Messages<'_> {
        Messages {
            consumer: self,
            remaining: Some(batch),
            pulled: false,
            misses: 0,
        }
    }

    /// Continuously consume, topping the budget back up as it drains.
    pub fn consume(&mut self) -> Messages<'_> {
        Messages {
            consumer: self,
            remaining: None,
            pulled: false,
            misses: 0,
        }
    }

    /// Fetch a single message.
    ///
    /// Returns `Ok(None)` when the stream has no message available within
    /// the pull's lifetime.
    ///
    /// # Errors
    ///
    /// Terminal consumer conditions; see [`Messages::next`].
    pub async fn next(&mut self) -> Result<Option<Message>, ConsumerError> {
        self.fetch(1).next().await.transpose()
    }

    /// Delete the server-side consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Api`] when the server refuses the deletion.
    pub async fn delete(self) -> Result<(), ConsumerError> {
        delete_consumer(&self.client, &self.stream, &self.name).await?;
        Ok(())
    }

    /// Publish one pull request and account for it.
    async fn send_pull(&mut self, batch: usize, max_bytes: usize) -> Result<(), ConsumerError> {
        let subject = format!(
            "{}.CONSUMER.MSG.NEXT.{}.{}",
            self.client.config().api_prefix,
            self.stream,
            self.name
        );
        let request = PullRequest {
            batch,
            max_bytes,
            expires: nanos(self.options.expires),
            idle_heartbeat: nanos(self.options.idle_heartbeat),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| ConsumerError::BadResponse(e.to_string()))?;
        self.client
            .publish_message(subject, Some(self.inbox.clone()), None, body.into())
            .await
            .map_err(publish_failure)?;
        self.budget.add_request(batch, max_bytes);
        Ok(())
    }

    /// How long to wait for any traffic before counting a heartbeat miss.
    fn wait_window(&self) -> Duration {
        if self.options.idle_heartbeat.is_zero() {
            self.options.expires + Duration::from_secs(1)
        } else {
            self.options.idle_heartbeat.saturating_mul(2)
        }
    }

    /// Recreate the ordered consumer from the stream position after the
    /// last accepted message, rebinding the delivery inbox.
    async fn recover(&mut self) -> Result<(), ConsumerError> {
        let Some(cursor) = self.ordered else {
            return Ok(());
        };
        let restart = cursor.restart_seq();
        for attempt in 1..=MAX_RECREATE_ATTEMPTS {
            // The old consumer is stale or gone; removal is best-effort.
            if let Err(error) = delete_consumer(&self.client, &self.stream, &self.name).await {
                debug!(%error, "stale consumer deletion failed");
            }
            let inbox = self.client.new_inbox();
            self.sub.resubscribe(inbox.clone()).await;
            self.inbox = inbox;
            let config = ConsumerConfig {
                name: Some(new_token()),
                durable_name: None,
                ack_policy: AckPolicy::None,
                deliver_policy: DeliverPolicy::ByStartSequence,
                opt_start_seq: Some(restart),
            };
            match create_consumer(&self.client, &self.stream, &config).await {
                Ok(info) => {
                    self.name = info.name;
                    if let Some(cursor) = &mut self.ordered {
                        cursor.rebase();
                    }
                    self.budget.reset();
                    return Ok(());
                }
                Err(error) => {
                    warn!(attempt, %error, "ordered consumer recreate failed");
                    if attempt == MAX_RECREATE_ATTEMPTS {
                        return Err(ConsumerError::RecoveryFailed { attempts: attempt });
                    }
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }
        Err(ConsumerError::RecoveryFailed {
            attempts: MAX_RECREATE_ATTEMPTS,
        })
    }
}

/// What to do after a control (status-bearing) delivery.
enum Control {
    Continue,
    Finished,
    Fail(ConsumerError),
}

/// In-flight pull exchange yielding messages.
#[derive(Debug)]
pub struct Messages<'a> {
    consumer: &'a mut PullConsumer,
    /// Fetch bound; `None` in refilling consume mode.
    remaining: Option<usize>,
    /// Whether the current fetch already issued its pull.
    pulled: bool,
    /// Consecutive quiet heartbeat windows.
    misses: u32,
}

impl Messages<'_> {
    /// Wait for the next message.
    ///
    /// Returns `None` once a fetch is satisfied or its pull expires.
    /// Consume mode only ends with an error.
    ///
    /// # Errors
    ///
    /// [`ConsumerError::MissedHeartbeats`] is non-terminal: the budget has
    /// been reset and a fresh pull will be issued; the caller may keep
    /// iterating. Every other error is terminal for this consumer.
    pub async fn next(&mut self) -> Option<Result<Message, ConsumerError>> {
        loop {
            match self.remaining {
                Some(0) => return None,
                Some(remaining) => {
                    if !self.pulled {
                        let max_bytes = self.consumer.options.max_bytes;
                        if let Err(error) = self.consumer.send_pull(remaining, max_bytes).await {
                            return Some(Err(error));
                        }
                        self.pulled = true;
                    }
                }
                None => {
                    if self.consumer.budget.requests_outstanding() == 0
                        || self.consumer.budget.needs_refill()
                    {
                        let (batch, bytes) = self.consumer.budget.refill_amounts();
                        if batch > 0 {
                            if let Err(error) = self.consumer.send_pull(batch, bytes).await {
                                return Some(Err(error));
                            }
                        }
                    }
                }
            }

            let window = self.consumer.wait_window();
            let message = match tokio::time::timeout(window, self.consumer.sub.next()).await {
                Err(_quiet) => {
                    self.misses += 1;
                    if self.misses >= self.consumer.options.heartbeat_misses {
                        self.misses = 0;
                        self.consumer.budget.reset();
                        self.pulled = false;
                        return Some(Err(ConsumerError::MissedHeartbeats));
                    }
                    continue;
                }
                Ok(None) => return Some(Err(ConsumerError::ConnectionClosed)),
                Ok(Some(message)) => message,
            };
            self.misses = 0;

            if let Some(code) = message.status() {
                match self.handle_control(code, &message) {
                    Control::Continue => continue,
                    Control::Finished => return None,
                    Control::Fail(error) => return Some(Err(error)),
                }
            }

            self.consumer.budget.on_message(message.payload.len());
            if self.consumer.ordered.is_some() {
                match self.check_order(&message) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Err(error) = self.consumer.recover().await {
                            return Some(Err(error));
                        }
                        self.pulled = false;
                        continue;
                    }
                    Err(error) => return Some(Err(error)),
                }
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Some(Ok(message));
        }
    }

    /// Account for and classify a status-bearing delivery.
    fn handle_control(&mut self, code: u16, message: &Message) -> Control {
        let pending_messages = header_number(message, PENDING_MESSAGES_HEADER);
        let pending_bytes = header_number(message, PENDING_BYTES_HEADER);
        match code {
            STATUS_IDLE_HEARTBEAT => Control::Continue,
            STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT => {
                self.consumer
                    .budget
                    .on_discard(pending_messages, pending_bytes);
                if self.remaining.is_some() {
                    Control::Finished
                } else {
                    Control::Continue
                }
            }
            STATUS_CONFLICT => {
                self.consumer
                    .budget
                    .on_discard(pending_messages, pending_bytes);
                let description = message.description().unwrap_or("");
                if is_terminal_conflict(description) {
                    Control::Fail(ConsumerError::Terminal {
                        code,
                        description: description.to_owned(),
                    })
                } else if self.remaining.is_some() {
                    Control::Finished
                } else {
                    Control::Continue
                }
            }
            STATUS_NO_RESPONDERS => {
                Control::Fail(ConsumerError::Request(RequestError::NoResponders))
            }
            other => {
                debug!(code = other, "unhandled control status");
                Control::Continue
            }
        }
    }

    /// Check a delivery against the ordered cursor. `Ok(false)` means a
    /// gap was detected and recovery must run.
    fn check_order(&mut self, message: &Message) -> Result<bool, ConsumerError> {
        let Some(cursor) = &mut self.consumer.ordered else {
            return Ok(true);
        };
        let Some(reply) = &message.reply else {
            return Err(ConsumerError::BadAckMetadata(message.subject.clone()));
        };
        let ack = AckInfo::parse(reply)?;
        Ok(cursor.observe(&ack) == CursorOutcome::Accept)
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn header_number(message: &Message, key: &str) -> Option<usize> {
    message.header(key).and_then(|value| value.parse().ok())
}

fn publish_failure(error: Error) -> ConsumerError {
    match error {
        Error::Closed | Error::Draining => ConsumerError::ConnectionClosed,
        other => ConsumerError::Request(RequestError::Publish(Box::new(other))),
    }
}

/// 409 descriptions that make the consumer unusable; everything else in
/// the 409 class is transient and absorbed by the pull loop.
fn is_terminal_conflict(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    [
        "consumer deleted",
        "consumer is push based",
        "exceeded maxrequestbatch",
        "exceeded maxrequestmaxbytes",
        "exceeded maxrequestexpires",
        "message size exceeds maxbytes",
    ]
    .iter()
    .any(|terminal| description.contains(terminal))
}

async fn api_request<T: serde::de::DeserializeOwned>(
    client: &Client,
    subject: String,
    body: Bytes,
) -> Result<T, ConsumerError> {
    let reply = client.request_inner(subject, None, body, None).await?;
    let value: serde_json::Value = serde_json::from_slice(&reply.payload)
        .map_err(|e| ConsumerError::BadResponse(e.to_string()))?;
    if let Some(error) = value.get("error") {
        let error: ApiError = serde_json::from_value(error.clone())
            .map_err(|e| ConsumerError::BadResponse(e.to_string()))?;
        return Err(ConsumerError::Api {
            code: error.code,
            description: error.description,
        });
    }
    serde_json::from_value(value).map_err(|e| ConsumerError::BadResponse(e.to_string()))
}

async fn create_consumer(
    client: &Client,
    stream: &str,
    config: &ConsumerConfig,
) -> Result<ConsumerInfo, ConsumerError> {
    let prefix = &client.config().api_prefix;
    let subject = match config.durable_name.as_ref().or(config.name.as_ref()) {
        Some(name) => format!("{prefix}.CONSUMER.CREATE.{stream}.{name}"),
        None => format!("{prefix}.CONSUMER.CREATE.{stream}"),
    };
    let body = serde_json::to_vec(&CreateConsumerRequest {
        stream_name: stream,
        config,
    })
    .map_err(|e| ConsumerError::BadResponse(e.to_string()))?;
    api_request(client, subject, body.into()).await
}

async fn delete_consumer(
    client: &Client,
    stream: &str,
    name: &str,
) -> Result<bool, ConsumerError> {
    let subject = format!(
        "{}.CONSUMER.DELETE.{stream}.{name}",
        client.config().api_prefix
    );
    let response: DeleteResponse = api_request(client, subject, Bytes::new()).await?;
    Ok(response.success)
}
