//! Outbound delivery seam for the conductor.
//!
//! Delivery targets are external (message brokers, webhooks); their failures
//! are opaque to us, so the trait surfaces them as `anyhow` errors and the
//! conductor answers every failure the same way: schedule a replay tier.

use async_trait::async_trait;
use tracing::info;

use crate::entities::Message;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message to the outside world. Must be safe to call more
    /// than once for the same message (delivery is at-least-once).
    async fn deliver(&self, message: &Message) -> anyhow::Result<()>;
}

/// Default notifier: writes deliveries to the structured log. Useful for the
/// demo and for deployments that scrape logs instead of running a broker.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        info!(
            msg_id = message.id,
            msg_type = %message.msg_type,
            request_id = message.request_id,
            transform_id = message.transform_id,
            processing_id = message.processing_id,
            payload = %message.payload,
            "delivering message"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Test notifier that fails the first `fail_first` deliveries and records
    /// every attempt.
    #[derive(Default)]
    pub struct FlakyNotifier {
        pub fail_first: u32,
        attempts: AtomicU32,
        pub delivered: Mutex<Vec<u64>>,
    }

    impl FlakyNotifier {
        pub fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Default::default()
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, message: &Message) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                anyhow::bail!("broker unavailable");
            }
            self.delivered
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.id);
            Ok(())
        }
    }
}
