//! Side effects run once the primary write has committed.
//!
//! Effects are best-effort: failures are logged and counted, never retried
//! and never reported to the caller.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::mail::{Email, Mailer};

/// A deferred side effect.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    SendEmail(Email),
}

/// Effects collected while handling one request.
#[derive(Debug, Default)]
#[must_use = "an outbox does nothing until dispatched"]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Run every effect on a background task.
    pub fn dispatch(self, mailer: Arc<dyn Mailer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            for effect in self.effects {
                match effect {
                    Effect::SendEmail(email) => {
                        if let Err(err) = mailer.send(&email).await {
                            metrics::counter!("notifications_failed_total")
                                .increment(1);
                            tracing::warn!(
                                error = %err,
                                to = %email.to,
                                "notification dropped"
                            );
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::testing::RecordingMailer;
    use crate::mail::welcome;

    #[tokio::test]
    async fn test_dispatch_sends_everything() {
        let mailer = Arc::new(RecordingMailer::default());
        let mut outbox = Outbox::default();
        outbox.push(Effect::SendEmail(welcome("a@x.com", "A", "Pro", "u", "P")));
        outbox.push(Effect::SendEmail(welcome("b@x.com", "B", "Pro", "u", "P")));

        outbox.dispatch(mailer.clone()).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].to, "b@x.com");
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let mut outbox = Outbox::default();
        outbox.push(Effect::SendEmail(welcome("a@x.com", "A", "Pro", "u", "P")));

        // The task itself completes without panicking.
        assert!(outbox.dispatch(Arc::new(RecordingMailer::failing())).await.is_ok());
    }
}
