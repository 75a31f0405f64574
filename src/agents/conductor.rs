//! Conductor: outbound message delivery.
//!
//! Drains the message table and pushes messages through the [`Notifier`]
//! with at-least-once semantics: a delivery is replayed on a quadratic,
//! randomized delay until it is confirmed or the replay budget runs out,
//! after which the message stays visible as delivered-but-unconfirmed for
//! operators to inspect.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, MessageUpdate};
use crate::entities::{Message, MessageDestination, MessageStatus};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::retry::RetryPolicy;
use crate::scheduler::AgentHandler;

pub struct Conductor {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    bulk_size: usize,
}

impl Conductor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        bulk_size: usize,
    ) -> Self {
        Self {
            catalog,
            notifier,
            retry,
            bulk_size,
        }
    }

    /// Acknowledge a delivery. Called from the outer surface when the
    /// consumer confirms receipt; stops further replays.
    pub fn confirm(&self, message_id: u64) -> Result<()> {
        self.catalog.update_message(
            message_id,
            MessageUpdate {
                status: Some(MessageStatus::ConfirmDelivered),
                ..Default::default()
            },
        )
    }

    /// A progress message is superseded when the entity it reports on has
    /// already moved to a different terminal state; delivering it would only
    /// confuse the consumer, since the terminal message follows.
    fn is_superseded(&self, message: &Message) -> Result<bool> {
        let Some(reported) = message.payload.get("status").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        if let Some(transform_id) = message.transform_id
            && transform_id != 0
        {
            match self.catalog.get_transform(transform_id) {
                Ok(transform) => {
                    return Ok(transform.status.is_terminal()
                        && transform.status.to_string() != reported);
                }
                // Archived rows cannot supersede anything.
                Err(Error::NotFound { .. }) => return Ok(false),
                Err(error) => return Err(error),
            }
        }
        Ok(false)
    }

    async fn deliver(&self, message: &Message) -> Result<()> {
        if self.is_superseded(message)? {
            debug!(msg_id = message.id, "message superseded, confirming without delivery");
            return self.confirm(message.id);
        }

        let retries = message.retries + 1;
        let delay = Duration::from_std(self.retry.message_delay(retries))
            .unwrap_or_else(|_| Duration::seconds(60));
        match self.notifier.deliver(message).await {
            Ok(()) => {
                info!(msg_id = message.id, retries, "message delivered");
                self.catalog.update_message(
                    message.id,
                    MessageUpdate {
                        status: Some(MessageStatus::Delivered),
                        retries: Some(retries),
                        next_retry_at: Some(Utc::now() + delay),
                    },
                )
            }
            Err(error) => {
                if self.retry.replay_exhausted(retries) {
                    warn!(
                        msg_id = message.id,
                        retries, %error,
                        "delivery failed; replay budget exhausted, message stays unconfirmed"
                    );
                } else {
                    warn!(msg_id = message.id, retries, %error, "delivery failed");
                }
                // Stays Fetched; the next tier picks it up when the delay
                // elapses, until the replay budget runs out.
                self.catalog.update_message(
                    message.id,
                    MessageUpdate {
                        retries: Some(retries),
                        next_retry_at: Some(Utc::now() + delay),
                        ..Default::default()
                    },
                )
            }
        }
    }
}

#[async_trait]
impl AgentHandler for Conductor {
    fn name(&self) -> &'static str {
        "conductor"
    }

    async fn run_cycle(&self) -> Result<usize> {
        let messages = self.catalog.fetch_messages(
            &[MessageDestination::Outside],
            self.bulk_size,
            self.retry.max_replay_times,
        )?;
        let handled = messages.len();
        for message in messages {
            self.deliver(&message).await?;
        }
        Ok(handled)
    }
}
