//! Campaign state machine and dispatch scheduler.
//!
//! Lifecycle: draft -> scheduled -> running <-> paused -> completed, with
//! failed reachable administratively. `start` snapshots the audience and
//! fans one spaced send task out per recipient; task execution is
//! cooperative about pause and idempotent about completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outreach_audience::AudienceResolver;
use outreach_channel::{ChannelClient, ChannelError};
use outreach_core::clock::Clock;
use outreach_core::event_bus::{make_event, EventSink, EventType};
use outreach_core::store::Store;
use outreach_core::templates;
use outreach_core::types::*;
use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub message_template: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub segment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCampaignRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub segment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatistics {
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub pending: u64,
    pub delivery_rate: f64,
    pub read_rate: f64,
}

pub struct CampaignEngine {
    store: Arc<Store>,
    resolver: Arc<AudienceResolver>,
    client: Arc<ChannelClient>,
    tracker: Arc<crate::tracker::DeliveryTracker>,
    queue: crate::queue::TaskQueue,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    /// Scheduler-level spacing between recipients; the same delay the
    /// channel client enforces per send. Both layers are intentional.
    delay_increment: Duration,
}

impl CampaignEngine {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<AudienceResolver>,
        client: Arc<ChannelClient>,
        tracker: Arc<crate::tracker::DeliveryTracker>,
        queue: crate::queue::TaskQueue,
        clock: Arc<dyn Clock>,
        delay_increment: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            client,
            tracker,
            queue,
            clock,
            event_sink: outreach_core::event_bus::noop_sink(),
            delay_increment,
        }
    }

    /// Attach an event sink for emitting campaign events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────

    pub fn create(&self, req: CreateCampaignRequest) -> OutreachResult<Campaign> {
        if req.name.trim().is_empty() {
            return Err(OutreachError::Validation("campaign name is required".into()));
        }
        if req.message_template.trim().is_empty() {
            return Err(OutreachError::Validation(
                "message template is required".into(),
            ));
        }
        if let Some(segment_id) = &req.segment_id {
            if self.store.segments.get(segment_id).is_none() {
                return Err(OutreachError::Validation(format!(
                    "segment {segment_id} does not exist"
                )));
            }
        }

        let now = self.clock.now();
        let status = match req.scheduled_at {
            Some(at) if at > now => CampaignStatus::Scheduled,
            _ => CampaignStatus::Draft,
        };
        // Preview figure from the segment cache; the binding snapshot is
        // taken at start.
        let total_recipients = req
            .segment_id
            .and_then(|id| self.store.segments.get(&id))
            .map(|s| s.contact_count)
            .unwrap_or(0);

        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: req.name,
            message_template: req.message_template,
            media_url: req.media_url,
            segment_id: req.segment_id,
            status,
            scheduled_at: req.scheduled_at,
            started_at: None,
            completed_at: None,
            total_recipients,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        };
        info!(campaign_id = %campaign.id, name = %campaign.name, ?status, "Campaign created");
        self.store.campaigns.insert(campaign.clone());
        Ok(campaign)
    }

    /// Update a campaign that has not started dispatching yet.
    pub fn update(&self, id: &Uuid, req: UpdateCampaignRequest) -> OutreachResult<Campaign> {
        let campaign = self.get(id)?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(OutreachError::Transition(
                "Cannot update running or completed campaign".into(),
            ));
        }
        if let Some(segment_id) = &req.segment_id {
            if self.store.segments.get(segment_id).is_none() {
                return Err(OutreachError::Validation(format!(
                    "segment {segment_id} does not exist"
                )));
            }
        }

        let segment_changed = req.segment_id.is_some();
        self.store.campaigns.with_mut(id, |c| {
            if let Some(name) = req.name {
                c.name = name;
            }
            if let Some(template) = req.message_template {
                c.message_template = template;
            }
            if let Some(media_url) = req.media_url {
                c.media_url = Some(media_url);
            }
            if let Some(at) = req.scheduled_at {
                c.scheduled_at = Some(at);
                c.status = if at > self.clock.now() {
                    CampaignStatus::Scheduled
                } else {
                    CampaignStatus::Draft
                };
            }
            if let Some(segment_id) = req.segment_id {
                c.segment_id = Some(segment_id);
            }
        });
        if segment_changed {
            let campaign = self.get(id)?;
            let preview = campaign
                .segment_id
                .and_then(|sid| self.store.segments.get(&sid))
                .map(|s| s.contact_count)
                .unwrap_or(0);
            self.store
                .campaigns
                .with_mut(id, |c| c.total_recipients = preview);
        }
        self.get(id)
    }

    /// Delete a draft. Anything further along is history worth keeping.
    pub fn delete(&self, id: &Uuid) -> OutreachResult<()> {
        let campaign = self.get(id)?;
        if campaign.status != CampaignStatus::Draft {
            return Err(OutreachError::Transition(
                "Only draft campaigns can be deleted".into(),
            ));
        }
        self.store.campaigns.remove(id);
        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Start dispatching: snapshot the audience, pre-create one pending
    /// message per recipient, and enqueue spaced send tasks.
    pub fn start(&self, id: &Uuid, session: &str) -> OutreachResult<Campaign> {
        let campaign = self.get(id)?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(OutreachError::Transition(
                "Campaign cannot be started".into(),
            ));
        }

        let recipients = self.resolve_recipients(&campaign)?;
        let now = self.clock.now();
        let total = recipients.len() as u64;

        self.store.campaigns.with_mut(id, |c| {
            c.status = if total == 0 {
                // Nothing to send; an empty audience completes immediately.
                c.completed_at = Some(now);
                CampaignStatus::Completed
            } else {
                CampaignStatus::Running
            };
            c.started_at = Some(now);
            c.total_recipients = total;
        });

        info!(
            campaign_id = %id,
            total_recipients = total,
            session = session,
            "Campaign started"
        );
        metrics::counter!("dispatch.campaigns_started").increment(1);
        self.event_sink
            .emit(make_event(EventType::CampaignStarted, Some(*id), None, None));

        for (k, contact_id) in recipients.into_iter().enumerate() {
            let message = Message {
                id: Uuid::new_v4(),
                contact_id,
                campaign_id: Some(*id),
                direction: Direction::Outbound,
                content: String::new(),
                media_url: campaign.media_url.clone(),
                channel_message_id: None,
                status: MessageStatus::Pending,
                error_message: None,
                sent_at: None,
                delivered_at: None,
                read_at: None,
                created_at: now,
            };
            let message_id = message.id;
            self.store.messages.insert(message);
            self.enqueue_spaced(id, &message_id, session, k as u32);
        }

        self.get(id)
    }

    pub fn pause(&self, id: &Uuid) -> OutreachResult<Campaign> {
        let campaign = self.get(id)?;
        if campaign.status != CampaignStatus::Running {
            return Err(OutreachError::Transition(
                "Only running campaigns can be paused".into(),
            ));
        }
        self.store
            .campaigns
            .with_mut(id, |c| c.status = CampaignStatus::Paused);
        info!(campaign_id = %id, "Campaign paused");
        self.event_sink
            .emit(make_event(EventType::CampaignPaused, Some(*id), None, None));
        self.get(id)
    }

    /// Resume a paused campaign: re-enqueue tasks only for messages still
    /// pending, with the same spacing as start.
    pub fn resume(&self, id: &Uuid, session: &str) -> OutreachResult<Campaign> {
        let campaign = self.get(id)?;
        if campaign.status != CampaignStatus::Paused {
            return Err(OutreachError::Transition(
                "Only paused campaigns can be resumed".into(),
            ));
        }
        self.store
            .campaigns
            .with_mut(id, |c| c.status = CampaignStatus::Running);

        let pending = self.store.messages.pending_for_campaign(id);
        info!(campaign_id = %id, pending = pending.len(), "Campaign resumed");
        self.event_sink
            .emit(make_event(EventType::CampaignResumed, Some(*id), None, None));

        for (k, message) in pending.iter().enumerate() {
            self.enqueue_spaced(id, &message.id, session, k as u32);
        }
        self.get(id)
    }

    /// Administrative kill switch; no automatic error threshold flips a
    /// campaign here.
    pub fn mark_failed(&self, id: &Uuid) -> OutreachResult<Campaign> {
        let campaign = self.get(id)?;
        if campaign.status.is_terminal() {
            return Err(OutreachError::Transition(
                "Campaign already finished".into(),
            ));
        }
        self.store
            .campaigns
            .with_mut(id, |c| c.status = CampaignStatus::Failed);
        info!(campaign_id = %id, "Campaign administratively failed");
        self.event_sink
            .emit(make_event(EventType::CampaignFailed, Some(*id), None, None));
        self.get(id)
    }

    pub fn get(&self, id: &Uuid) -> OutreachResult<Campaign> {
        self.store
            .campaigns
            .get(id)
            .ok_or_else(|| OutreachError::NotFound(format!("Campaign {id}")))
    }

    pub fn list(&self) -> Vec<Campaign> {
        self.store.campaigns.list()
    }

    pub fn statistics(&self, id: &Uuid) -> OutreachResult<CampaignStatistics> {
        let c = self.get(id)?;
        let settled = c.sent_count + c.failed_count;
        Ok(CampaignStatistics {
            total: c.total_recipients,
            sent: c.sent_count,
            delivered: c.delivered_count,
            read: c.read_count,
            failed: c.failed_count,
            pending: c.total_recipients.saturating_sub(settled),
            delivery_rate: rate(c.delivered_count, c.sent_count),
            read_rate: rate(c.read_count, c.delivered_count),
        })
    }

    /// Scheduled campaigns whose run time has passed, for the poller.
    pub fn due_campaigns(&self) -> Vec<Campaign> {
        self.store.campaigns.due_scheduled(self.clock.now())
    }

    // ─── Task execution ────────────────────────────────────────────────

    /// Run one send task. Transient failures bubble up so the task queue
    /// retries the whole operation; everything else settles here.
    pub async fn execute_send(
        &self,
        campaign_id: &Uuid,
        message_id: &Uuid,
        session: &str,
    ) -> OutreachResult<()> {
        let campaign = self.get(campaign_id)?;
        // Pause/completion is cooperative: tasks already in the queue
        // execute, notice, and become no-ops.
        if campaign.status.halts_dispatch() {
            debug!(campaign_id = %campaign_id, status = ?campaign.status, "Skipping send, campaign halted");
            return Ok(());
        }

        let message = self
            .store
            .messages
            .get(message_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Message {message_id}")))?;
        if !matches!(
            message.status,
            MessageStatus::Pending | MessageStatus::Queued
        ) {
            return Ok(());
        }

        let contact = self
            .store
            .contacts
            .get(&message.contact_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Contact {}", message.contact_id)))?;

        let text = templates::render(&campaign.message_template, &contact);
        self.store
            .messages
            .with_mut(message_id, |m| m.content = text.clone());
        self.tracker.mark_queued(message_id);

        match self
            .client
            .send(session, &contact.phone, &text, campaign.media_url.as_deref())
            .await
        {
            Ok(external_id) => {
                self.tracker.mark_sent(message_id, &external_id);
                self.check_completion(campaign_id);
                Ok(())
            }
            Err(ChannelError::Rejected(reason)) => {
                // The provider will never accept this payload; settle now
                // instead of burning outer retries.
                self.settle_failure(campaign_id, message_id, &reason);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Terminal bookkeeping for a recipient whose task budget ran out (or
    /// whose send was permanently rejected). Counts once.
    pub fn settle_failure(&self, campaign_id: &Uuid, message_id: &Uuid, error: &str) {
        if self.tracker.mark_failed(message_id, error) {
            self.check_completion(campaign_id);
        }
    }

    fn check_completion(&self, campaign_id: &Uuid) {
        if self.store.campaigns.try_complete(campaign_id) {
            info!(campaign_id = %campaign_id, "Campaign completed");
            metrics::counter!("dispatch.campaigns_completed").increment(1);
            self.event_sink.emit(make_event(
                EventType::CampaignCompleted,
                Some(*campaign_id),
                None,
                None,
            ));
        }
    }

    fn enqueue_spaced(&self, campaign_id: &Uuid, message_id: &Uuid, session: &str, k: u32) {
        self.queue.enqueue_after(
            crate::queue::Task::CampaignSend {
                campaign_id: *campaign_id,
                message_id: *message_id,
                session: session.to_string(),
            },
            self.delay_increment * k,
        );
    }

    fn resolve_recipients(&self, campaign: &Campaign) -> OutreachResult<Vec<Uuid>> {
        let mut recipients: Vec<Uuid> = match campaign.segment_id {
            Some(segment_id) => {
                // Re-resolve the criteria so the snapshot reflects contacts
                // as they are at start, then read the refreshed cache.
                self.resolver.sync(&segment_id)?;
                self.store
                    .segments
                    .members_of(&segment_id)
                    .into_iter()
                    .collect()
            }
            None => self
                .store
                .contacts
                .list_active()
                .into_iter()
                .map(|c| c.id)
                .collect(),
        };
        recipients.sort();
        Ok(recipients)
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 10_000.0).round() / 100.0
    }
}
