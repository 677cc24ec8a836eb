//! Routes queue tasks to the engines that own them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};
use uuid::Uuid;

use crate::engine::CampaignEngine;
use crate::queue::{Task, TaskExecutor};

/// Seam for the follow-up sequence runner, which lives a crate above this
/// one. The dispatcher only needs these two entry points.
#[async_trait]
pub trait SequenceStepHandler: Send + Sync {
    async fn run_step(&self, contact_sequence_id: &Uuid, session: &str) -> anyhow::Result<()>;
}

/// The production `TaskExecutor`: campaign sends go to the campaign
/// engine, sequence steps to the registered handler.
pub struct Dispatcher {
    engine: Arc<CampaignEngine>,
    sequences: Option<Arc<dyn SequenceStepHandler>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<CampaignEngine>) -> Self {
        Self {
            engine,
            sequences: None,
        }
    }

    pub fn with_sequence_handler(mut self, handler: Arc<dyn SequenceStepHandler>) -> Self {
        self.sequences = Some(handler);
        self
    }
}

#[async_trait]
impl TaskExecutor for Dispatcher {
    async fn execute(&self, task: &Task) -> anyhow::Result<()> {
        match task {
            Task::CampaignSend {
                campaign_id,
                message_id,
                session,
            } => self
                .engine
                .execute_send(campaign_id, message_id, session)
                .await
                .map_err(anyhow::Error::from),
            Task::SequenceStep {
                contact_sequence_id,
                session,
            } => match &self.sequences {
                Some(handler) => handler.run_step(contact_sequence_id, session).await,
                None => {
                    warn!(contact_sequence_id = %contact_sequence_id, "No sequence handler registered");
                    Ok(())
                }
            },
        }
    }

    async fn on_exhausted(&self, task: &Task, error: &anyhow::Error) {
        match task {
            Task::CampaignSend {
                campaign_id,
                message_id,
                ..
            } => {
                // The one place a transiently-failing recipient is settled:
                // record the failure, count it, check campaign completion.
                self.engine
                    .settle_failure(campaign_id, message_id, &error.to_string());
            }
            Task::SequenceStep {
                contact_sequence_id,
                ..
            } => {
                // The failed message row was already recorded per attempt;
                // the sequence simply stays parked at the same step.
                error!(
                    contact_sequence_id = %contact_sequence_id,
                    error = %error,
                    "Sequence step abandoned after retry budget"
                );
            }
        }
    }
}
