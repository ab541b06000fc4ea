//! Inactivity survey: a periodic sweep that sends one satisfaction survey per idle period.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::credentials::CredentialResolver;
use crate::error::ConversationError;
use crate::messaging::MessageSender;
use crate::store::{ConversationStore, ConversationSummary};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub surveyed: usize,
    pub failed: usize,
}

pub struct InactivitySurvey {
    store: Arc<ConversationStore>,
    credentials: Arc<CredentialResolver>,
    sender: Arc<dyn MessageSender>,
    default_threshold_minutes: u64,
}

impl InactivitySurvey {
    pub fn new(
        store: Arc<ConversationStore>,
        credentials: Arc<CredentialResolver>,
        sender: Arc<dyn MessageSender>,
        default_threshold_minutes: u64,
    ) -> Self {
        Self {
            store,
            credentials,
            sender,
            default_threshold_minutes,
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        log::info!("survey: sweeping every {}s", interval.as_secs());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                if report.surveyed > 0 || report.failed > 0 {
                    log::info!(
                        "survey: sweep sent {} survey(s), {} failed",
                        report.surveyed,
                        report.failed
                    );
                }
            }
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(crate::routing::now()).await
    }

    /// One pass over every conversation at the given time (unix seconds).
    pub async fn sweep_at(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        for summary in self.store.snapshot().await {
            if summary.csat_sent {
                continue;
            }
            let threshold = self
                .credentials
                .survey_threshold(&summary.key.agent_id, self.default_threshold_minutes)
                .await;
            let idle = u64::try_from(summary.idle_minutes(now)).unwrap_or(0);
            if idle < threshold {
                continue;
            }
            match self.survey(&summary).await {
                Ok(()) => report.surveyed += 1,
                Err(e) => {
                    log::warn!("survey: {} failed: {}", summary.key, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn survey(&self, summary: &ConversationSummary) -> Result<(), ConversationError> {
        self.sender.create_survey(&summary.key.conversation_id).await?;
        // Activity that landed after the snapshot keeps the survey armed for its own idle period.
        let seen = summary.last_timestamp;
        self.store
            .update(&summary.key, |r| {
                if r.last_timestamp == seen {
                    r.csat_sent = true;
                }
                Ok(())
            })
            .await
    }
}
