//! Follow-up sequence runner — drips multi-step message sequences to
//! individual contacts over hours or days.
//!
//! Each step is one queue task. Success advances `current_step` and
//! schedules the next step from the delay of the step just completed;
//! failure leaves the step index untouched so the outer retry resumes at
//! the same step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_channel::ChannelClient;
use outreach_core::clock::Clock;
use outreach_core::event_bus::{make_event, EventSink, EventType};
use outreach_core::store::Store;
use outreach_core::templates;
use outreach_core::types::*;
use outreach_core::{OutreachError, OutreachResult};
use outreach_dispatch::{DeliveryTracker, SequenceStepHandler, Task, TaskQueue};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SequenceRunner {
    store: Arc<Store>,
    client: Arc<ChannelClient>,
    tracker: Arc<DeliveryTracker>,
    queue: TaskQueue,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl SequenceRunner {
    pub fn new(
        store: Arc<Store>,
        client: Arc<ChannelClient>,
        tracker: Arc<DeliveryTracker>,
        queue: TaskQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            tracker,
            queue,
            clock,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting sequence events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Enroll a contact into a sequence. One active enrollment per
    /// (contact, sequence); the first step is scheduled after its own
    /// delay.
    pub fn enroll(
        &self,
        contact_id: &Uuid,
        sequence_id: &Uuid,
        session: &str,
    ) -> OutreachResult<ContactSequence> {
        let sequence = self
            .store
            .sequences
            .get_sequence(sequence_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Sequence {sequence_id}")))?;
        self.store
            .contacts
            .get(contact_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Contact {contact_id}")))?;
        if self
            .store
            .sequences
            .find_active(contact_id, sequence_id)
            .is_some()
        {
            return Err(OutreachError::Validation(
                "contact already enrolled in this sequence".into(),
            ));
        }

        let now = self.clock.now();
        let first_delay_hours = sequence
            .steps
            .first()
            .map(|s| s.delay_hours)
            .unwrap_or(0);
        let cs = ContactSequence {
            id: Uuid::new_v4(),
            contact_id: *contact_id,
            sequence_id: *sequence_id,
            current_step: 0,
            status: SequenceStatus::Active,
            next_run_at: Some(now + chrono::Duration::hours(first_delay_hours)),
            created_at: now,
            updated_at: now,
        };
        self.store.sequences.insert_contact_sequence(cs.clone());
        info!(
            contact_sequence_id = %cs.id,
            contact_id = %contact_id,
            sequence_id = %sequence_id,
            first_delay_hours,
            "Contact enrolled in sequence"
        );
        self.schedule(&cs.id, session, hours(first_delay_hours));
        Ok(cs)
    }

    pub fn pause(&self, contact_sequence_id: &Uuid) -> OutreachResult<()> {
        self.transition(contact_sequence_id, SequenceStatus::Active, SequenceStatus::Paused)
    }

    /// Resume a paused enrollment, rescheduling from next_run_at (or
    /// immediately when overdue).
    pub fn resume(&self, contact_sequence_id: &Uuid, session: &str) -> OutreachResult<()> {
        self.transition(contact_sequence_id, SequenceStatus::Paused, SequenceStatus::Active)?;
        let cs = self.get(contact_sequence_id)?;
        let delay = cs
            .next_run_at
            .map(|at| (at - self.clock.now()).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.schedule(contact_sequence_id, session, Duration::from_secs(delay));
        Ok(())
    }

    pub fn cancel(&self, contact_sequence_id: &Uuid) -> OutreachResult<()> {
        let cs = self.get(contact_sequence_id)?;
        if matches!(cs.status, SequenceStatus::Completed | SequenceStatus::Cancelled) {
            return Err(OutreachError::Transition(
                "Sequence enrollment already finished".into(),
            ));
        }
        self.update_cs(contact_sequence_id, |cs| {
            cs.status = SequenceStatus::Cancelled;
            cs.next_run_at = None;
        });
        info!(contact_sequence_id = %contact_sequence_id, "Sequence enrollment cancelled");
        Ok(())
    }

    /// Execute the current step. Called by the worker pool; errors
    /// propagate so the queue retries the same step.
    pub async fn run_step(
        &self,
        contact_sequence_id: &Uuid,
        session: &str,
    ) -> OutreachResult<()> {
        let cs = self.get(contact_sequence_id)?;
        if cs.status != SequenceStatus::Active {
            debug!(
                contact_sequence_id = %contact_sequence_id,
                status = ?cs.status,
                "Skipping step, enrollment not active"
            );
            return Ok(());
        }

        let sequence = self
            .store
            .sequences
            .get_sequence(&cs.sequence_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Sequence {}", cs.sequence_id)))?;
        let contact = self
            .store
            .contacts
            .get(&cs.contact_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Contact {}", cs.contact_id)))?;

        let Some(step) = step_at(&sequence, cs.current_step) else {
            // Ran off the end of the sequence.
            self.complete(contact_sequence_id);
            return Ok(());
        };

        let now = self.clock.now();
        let text = templates::render(&step.message_template, &contact);
        let message = Message {
            id: Uuid::new_v4(),
            contact_id: contact.id,
            campaign_id: None,
            direction: Direction::Outbound,
            content: text.clone(),
            media_url: step.media_url.clone(),
            channel_message_id: None,
            status: MessageStatus::Queued,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: now,
        };
        let message_id = message.id;
        self.store.messages.insert(message);

        match self
            .client
            .send(session, &contact.phone, &text, step.media_url.as_deref())
            .await
        {
            Ok(external_id) => {
                self.tracker.mark_sent(&message_id, &external_id);
                metrics::counter!("sequence.steps_sent").increment(1);
                self.event_sink.emit(make_event(
                    EventType::SequenceStepSent,
                    None,
                    Some(contact.id),
                    Some(message_id),
                ));
                self.advance(contact_sequence_id, &sequence, cs.current_step, session);
                Ok(())
            }
            Err(err) => {
                // Record the attempt; the step index stays put so the outer
                // retry resumes here.
                self.tracker.mark_failed(&message_id, &err.to_string());
                Err(err.into())
            }
        }
    }

    // ─── Internals ─────────────────────────────────────────────────────

    fn advance(
        &self,
        contact_sequence_id: &Uuid,
        sequence: &FollowUpSequence,
        completed_step: u32,
        session: &str,
    ) {
        let next_step = step_at(sequence, completed_step + 1);
        let now = self.clock.now();
        match next_step {
            Some(next) => {
                let delay_hours = next.delay_hours;
                self.update_cs(contact_sequence_id, |cs| {
                    cs.current_step = completed_step + 1;
                    cs.next_run_at = Some(now + chrono::Duration::hours(delay_hours));
                    cs.updated_at = now;
                });
                debug!(
                    contact_sequence_id = %contact_sequence_id,
                    next_step = completed_step + 1,
                    delay_hours,
                    "Next sequence step scheduled"
                );
                self.schedule(contact_sequence_id, session, hours(delay_hours));
            }
            None => {
                self.update_cs(contact_sequence_id, |cs| {
                    cs.current_step = completed_step + 1;
                    cs.updated_at = now;
                });
                self.complete(contact_sequence_id);
            }
        }
    }

    fn complete(&self, contact_sequence_id: &Uuid) {
        self.update_cs(contact_sequence_id, |cs| {
            cs.status = SequenceStatus::Completed;
            cs.next_run_at = None;
        });
        info!(contact_sequence_id = %contact_sequence_id, "Sequence completed");
        metrics::counter!("sequence.completed").increment(1);
        self.event_sink.emit(make_event(
            EventType::SequenceCompleted,
            None,
            None,
            None,
        ));
    }

    fn schedule(&self, contact_sequence_id: &Uuid, session: &str, delay: Duration) {
        self.queue.enqueue_after(
            Task::SequenceStep {
                contact_sequence_id: *contact_sequence_id,
                session: session.to_string(),
            },
            delay,
        );
    }

    fn transition(
        &self,
        contact_sequence_id: &Uuid,
        from: SequenceStatus,
        to: SequenceStatus,
    ) -> OutreachResult<()> {
        let cs = self.get(contact_sequence_id)?;
        if cs.status != from {
            return Err(OutreachError::Transition(format!(
                "Sequence enrollment is {:?}, expected {:?}",
                cs.status, from
            )));
        }
        self.update_cs(contact_sequence_id, |cs| cs.status = to);
        Ok(())
    }

    fn get(&self, id: &Uuid) -> OutreachResult<ContactSequence> {
        self.store
            .sequences
            .get_contact_sequence(id)
            .ok_or_else(|| OutreachError::NotFound(format!("ContactSequence {id}")))
    }

    fn update_cs(&self, id: &Uuid, f: impl FnOnce(&mut ContactSequence)) {
        self.store.sequences.with_contact_sequence_mut(id, f);
    }
}

fn step_at(sequence: &FollowUpSequence, order: u32) -> Option<&SequenceStep> {
    sequence.steps.iter().find(|s| s.step_order == order)
}

fn hours(h: i64) -> Duration {
    Duration::from_secs(h.max(0) as u64 * 3600)
}

#[async_trait]
impl SequenceStepHandler for SequenceRunner {
    async fn run_step(&self, contact_sequence_id: &Uuid, session: &str) -> anyhow::Result<()> {
        SequenceRunner::run_step(self, contact_sequence_id, session)
            .await
            .map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use outreach_channel::{
        ChannelClientConfig, ChannelTransport, LoopbackTransport, SendGate, SendReceipt,
        TransportError,
    };
    use outreach_core::clock::manual_clock;

    struct FailingTransport;

    #[async_trait]
    impl ChannelTransport for FailingTransport {
        async fn send_text(
            &self,
            _session: &str,
            _chat_id: &str,
            _text: &str,
        ) -> Result<SendReceipt, TransportError> {
            Err(TransportError::Connection("provider down".to_string()))
        }

        async fn send_image(
            &self,
            _session: &str,
            _chat_id: &str,
            _media_url: &str,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, TransportError> {
            Err(TransportError::Connection("provider down".to_string()))
        }

        async fn check_exists(
            &self,
            _session: &str,
            _chat_id: &str,
        ) -> Result<bool, TransportError> {
            Ok(false)
        }
    }

    fn build_runner(transport: Arc<dyn ChannelTransport>) -> (Arc<Store>, SequenceRunner) {
        let clock = manual_clock(Utc::now());
        let store = Arc::new(Store::new(clock.clone()));
        let gate = Arc::new(SendGate::new(clock.clone(), 1000, 10_000));
        let client = Arc::new(ChannelClient::new(
            transport,
            gate,
            ChannelClientConfig::default(),
        ));
        let tracker = Arc::new(DeliveryTracker::new(store.clone(), clock.clone()));
        let (queue, _receiver) = TaskQueue::new();
        let runner = SequenceRunner::new(store.clone(), client, tracker, queue, clock);
        (store, runner)
    }

    fn seed_sequence(store: &Store, steps: u32) -> (Contact, FollowUpSequence) {
        let contact = store
            .contacts
            .get_or_create_by_phone("08123456789", "Budi", "import");
        let now = Utc::now();
        let sequence = FollowUpSequence {
            id: Uuid::new_v4(),
            name: "Follow up test drive".to_string(),
            description: None,
            steps: (0..steps)
                .map(|i| SequenceStep {
                    step_order: i,
                    delay_hours: if i == 0 { 0 } else { 24 },
                    message_template: format!("Step {i} untuk [Nama]"),
                    media_url: None,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        };
        store.sequences.insert_sequence(sequence.clone());
        (contact, sequence)
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_advance_and_complete() {
        let (store, runner) = build_runner(Arc::new(LoopbackTransport));
        let (contact, sequence) = seed_sequence(&store, 2);

        let cs = runner
            .enroll(&contact.id, &sequence.id, "default")
            .unwrap();

        SequenceRunner::run_step(&runner, &cs.id, "default")
            .await
            .unwrap();
        let after_first = store.sequences.get_contact_sequence(&cs.id).unwrap();
        assert_eq!(after_first.current_step, 1);
        assert_eq!(after_first.status, SequenceStatus::Active);
        assert!(after_first.next_run_at.is_some());

        SequenceRunner::run_step(&runner, &cs.id, "default")
            .await
            .unwrap();
        let done = store.sequences.get_contact_sequence(&cs.id).unwrap();
        assert_eq!(done.current_step, 2);
        assert_eq!(done.status, SequenceStatus::Completed);
        assert!(done.next_run_at.is_none());

        // Both step messages are recorded as sent.
        let messages = store.messages.list_by_contact(&contact.id);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_step_and_records_message() {
        let (store, runner) = build_runner(Arc::new(FailingTransport));
        let (contact, sequence) = seed_sequence(&store, 2);

        let cs = runner
            .enroll(&contact.id, &sequence.id, "default")
            .unwrap();

        let err = SequenceRunner::run_step(&runner, &cs.id, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, OutreachError::Transport(_)));

        let unchanged = store.sequences.get_contact_sequence(&cs.id).unwrap();
        assert_eq!(unchanged.current_step, 0);
        assert_eq!(unchanged.status, SequenceStatus::Active);

        let messages = store.messages.list_by_contact(&contact.id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert!(messages[0].error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_enrollment_is_noop() {
        let (store, runner) = build_runner(Arc::new(LoopbackTransport));
        let (contact, sequence) = seed_sequence(&store, 2);

        let cs = runner
            .enroll(&contact.id, &sequence.id, "default")
            .unwrap();
        runner.pause(&cs.id).unwrap();

        SequenceRunner::run_step(&runner, &cs.id, "default")
            .await
            .unwrap();
        assert!(store.messages.list_by_contact(&contact.id).is_empty());

        // A completed enrollment never sends again.
        runner.resume(&cs.id, "default").unwrap();
        SequenceRunner::run_step(&runner, &cs.id, "default").await.unwrap();
        SequenceRunner::run_step(&runner, &cs.id, "default").await.unwrap();
        let done = store.sequences.get_contact_sequence(&cs.id).unwrap();
        assert_eq!(done.status, SequenceStatus::Completed);

        let before = store.messages.list_by_contact(&contact.id).len();
        SequenceRunner::run_step(&runner, &cs.id, "default").await.unwrap();
        assert_eq!(store.messages.list_by_contact(&contact.id).len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_enroll_rejected() {
        let (store, runner) = build_runner(Arc::new(LoopbackTransport));
        let (contact, sequence) = seed_sequence(&store, 1);

        runner.enroll(&contact.id, &sequence.id, "default").unwrap();
        assert!(matches!(
            runner.enroll(&contact.id, &sequence.id, "default"),
            Err(OutreachError::Validation(_))
        ));
        assert_eq!(store.messages.list_by_contact(&contact.id).len(), 0);
    }
}
