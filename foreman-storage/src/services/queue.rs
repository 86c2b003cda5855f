//! Durable message queue service
//!
//! Moves messages through their delivery lifecycle: persisted at send,
//! claimed exclusively at receive, and settled by an acknowledgement.
//! Broadcasts fan out into one stored copy per live recipient at send
//! time, so each copy is claimed and settled independently. Writes to the
//! store retry transient failures with backoff before giving up.

use crate::error::{Error, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::store::{ClaimRelease, CoordinationStore, MessageCounts};
use chrono::Utc;
use foreman_core::agent::AgentStatus;
use foreman_core::config::CoordinationConfig;
use foreman_core::message::{Message, MessageStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extra pending rows fetched per receive pass to absorb claim races and
/// lazily expired candidates
const RECEIVE_SCAN_SLACK: u32 = 32;

/// How a consumer settles a message it claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDisposition {
    /// Handled successfully
    Processed,
    /// Handling failed for good; the message is not retried
    Failed { error: String },
}

/// Queue facade over the durable message table
pub struct MessageQueue {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    events: EventBus,
}

impl MessageQueue {
    /// Create a new queue service
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: CoordinationConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Accept a message for delivery and return its queue id.
    ///
    /// A directed message is queued under its recipient's id whether or not
    /// that agent has registered yet; it sits in the queue until the
    /// recipient polls. A broadcast fans out into one copy per registered,
    /// non-offline agent other than the sender, and the returned id is the
    /// `broadcast_id` shared by the copies. A broadcast with no eligible
    /// recipients is dropped without error.
    pub async fn send(&self, message: Message) -> Result<Uuid> {
        message.validate()?;

        if let Some(to_agent) = message.to_agent.clone() {
            self.persist_with_retry(std::slice::from_ref(&message))
                .await?;
            debug!(
                "Queued {} message {} for {}",
                message.message_type(),
                message.id,
                to_agent
            );
            self.events.emit(CoordinationEvent::MessageSent {
                message_id: message.id,
                message_type: message.message_type(),
                to_agent: Some(to_agent),
            });
            return Ok(message.id);
        }

        let recipients: Vec<String> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|agent| agent.status != AgentStatus::Offline && agent.id != message.from_agent)
            .map(|agent| agent.id)
            .collect();
        if recipients.is_empty() {
            debug!(
                "Broadcast {} from {} had no eligible recipients",
                message.id, message.from_agent
            );
            return Ok(message.id);
        }

        let copies: Vec<Message> = recipients
            .iter()
            .map(|recipient| message.broadcast_copy(recipient))
            .collect();
        self.persist_with_retry(&copies).await?;
        info!(
            "Broadcast {} from {} fanned out to {} agents",
            message.id,
            message.from_agent,
            copies.len()
        );
        for copy in &copies {
            self.events.emit(CoordinationEvent::MessageSent {
                message_id: copy.id,
                message_type: copy.message_type(),
                to_agent: copy.to_agent.clone(),
            });
        }
        Ok(message.id)
    }

    /// Claim up to `limit` pending messages for `agent_id`, highest
    /// priority first and oldest first within a priority.
    ///
    /// Claims that outlived the visibility window are reaped before the
    /// scan so their messages can circulate again. Candidates found to be
    /// past their `expires_at` are settled as expired in passing instead of
    /// delivered.
    pub async fn receive(&self, agent_id: &str, limit: u32) -> Result<Vec<Message>> {
        if self.store.get_agent(agent_id).await?.is_none() {
            return Err(Error::not_found("agent", agent_id));
        }
        self.reap_timed_out().await?;

        let now = Utc::now();
        let candidates = self
            .store
            .list_pending_for(agent_id, limit.saturating_add(RECEIVE_SCAN_SLACK))
            .await?;
        let mut delivered = Vec::new();
        for mut message in candidates {
            if delivered.len() == limit as usize {
                break;
            }
            if message.is_expired(now) {
                if self.store.expire_message(message.id, now).await? {
                    debug!("Message {} expired before delivery", message.id);
                    self.events.emit(CoordinationEvent::MessageExpired {
                        message_id: message.id,
                    });
                }
                continue;
            }
            if self.store.claim_message(message.id, agent_id, now).await? {
                message.status = MessageStatus::Processing;
                message.claimed_by = Some(agent_id.to_string());
                message.claimed_at = Some(now);
                delivered.push(message);
            }
        }
        debug!("Delivered {} messages to {}", delivered.len(), agent_id);
        Ok(delivered)
    }

    /// Settle a claimed message.
    ///
    /// Returns false when `agent_id` no longer holds the claim, which
    /// happens when the visibility reaper released it first; the caller
    /// must treat its work as provisional in that case.
    pub async fn ack(
        &self,
        agent_id: &str,
        message_id: Uuid,
        disposition: AckDisposition,
    ) -> Result<bool> {
        let (outcome, error) = match &disposition {
            AckDisposition::Processed => (MessageStatus::Processed, None),
            AckDisposition::Failed { error } => (MessageStatus::Failed, Some(error.as_str())),
        };
        let settled = self
            .store
            .resolve_message(message_id, agent_id, outcome, error, Utc::now())
            .await?;
        if settled {
            debug!(
                "Message {} settled as {} by {}",
                message_id, outcome, agent_id
            );
            self.events
                .emit(CoordinationEvent::MessageResolved { message_id, outcome });
        } else {
            warn!(
                "Ack for message {} by {} matched no active claim",
                message_id, agent_id
            );
        }
        Ok(settled)
    }

    /// Release claims that outlived the visibility window, returning how
    /// many messages were requeued or failed.
    ///
    /// Each timed-out claim consumes one delivery attempt. The message
    /// returns to the pending queue while attempts remain; the attempt
    /// that brings `retry_count` up to `max_retries` settles it as failed
    /// instead.
    pub async fn reap_timed_out(&self) -> Result<u32> {
        let now = Utc::now();
        let cutoff = now - self.config.visibility_timeout();
        let mut reaped = 0;
        for message in self.store.list_claimed_before(cutoff).await? {
            let released = if message.retry_count + 1 < message.max_retries {
                let released = self
                    .store
                    .release_claim(
                        message.id,
                        message.retry_count,
                        ClaimRelease::Requeue,
                        Some("claim visibility timeout"),
                        now,
                    )
                    .await?;
                if released {
                    debug!(
                        "Requeued message {} after claim timeout (retry {})",
                        message.id,
                        message.retry_count + 1
                    );
                    self.events.emit(CoordinationEvent::MessageRequeued {
                        message_id: message.id,
                        retry_count: message.retry_count + 1,
                    });
                }
                released
            } else {
                let released = self
                    .store
                    .release_claim(
                        message.id,
                        message.retry_count,
                        ClaimRelease::Fail,
                        Some("retry budget exhausted"),
                        now,
                    )
                    .await?;
                if released {
                    warn!(
                        "Message {} failed after {} delivery attempts",
                        message.id,
                        message.retry_count + 1
                    );
                    self.events.emit(CoordinationEvent::MessageResolved {
                        message_id: message.id,
                        outcome: MessageStatus::Failed,
                    });
                }
                released
            };
            if released {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Settle pending messages whose `expires_at` has passed, returning how
    /// many were expired
    pub async fn sweep_expired(&self) -> Result<u32> {
        let now = Utc::now();
        let mut swept = 0;
        for message in self.store.list_expired_pending(now).await? {
            if self.store.expire_message(message.id, now).await? {
                swept += 1;
                self.events.emit(CoordinationEvent::MessageExpired {
                    message_id: message.id,
                });
            }
        }
        if swept > 0 {
            debug!("Expired {} undelivered messages", swept);
        }
        Ok(swept)
    }

    /// Delete settled messages older than the retention window, returning
    /// how many rows were removed
    pub async fn purge_resolved(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_seconds as i64);
        let purged = self.store.purge_messages(cutoff).await?;
        if purged > 0 {
            info!("Purged {} settled messages", purged);
        }
        Ok(purged)
    }

    /// Fetch a message by id
    pub async fn get(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.store.get_message(message_id).await
    }

    /// Message totals per delivery state
    pub async fn statistics(&self) -> Result<MessageCounts> {
        self.store.message_counts().await
    }

    /// Persist a batch, retrying transient store failures with backoff
    async fn persist_with_retry(&self, messages: &[Message]) -> Result<()> {
        let policy = &self.config.delivery_retry;
        let mut attempt = 1;
        loop {
            match self.store.create_messages(messages).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    warn!(
                        "Store write failed on attempt {}, retrying: {}",
                        attempt, e
                    );
                    attempt += 1;
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(Error::Unavailable(format!(
                        "store write failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    include!("queue_tests.rs");
}
