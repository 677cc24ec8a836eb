//! Message delivery tracker — owns the per-message status machine and
//! applies provider acknowledgments idempotently.
//!
//! Acks arrive out of order and redelivered; the only ordering defense is
//! that every transition here is monotonic and guarded, so a late ack can
//! never regress a message and a reprocessed ack can never double-count.

use std::sync::Arc;

use outreach_core::clock::Clock;
use outreach_core::event_bus::{make_event, EventSink, EventType};
use outreach_core::store::Store;
use outreach_core::types::MessageStatus;
use tracing::{debug, info};
use uuid::Uuid;

/// Ack codes reported by the provider.
const ACK_SENT: i64 = 1;
const ACK_DELIVERED: i64 = 2;
const ACK_READ: i64 = 3;

pub struct DeliveryTracker {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

/// Which counter-relevant transition an ack produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
    None,
    Sent,
    Delivered,
    Read,
}

impl DeliveryTracker {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting delivery events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Move a pending message to queued. Returns false when the message is
    /// already past pending.
    pub fn mark_queued(&self, message_id: &Uuid) -> bool {
        let transitioned = self
            .store
            .messages
            .with_mut(message_id, |m| {
                if m.status == MessageStatus::Pending {
                    m.status = MessageStatus::Queued;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if transitioned {
            if let Some(m) = self.store.messages.get(message_id) {
                self.event_sink.emit(make_event(
                    EventType::MessageQueued,
                    m.campaign_id,
                    Some(m.contact_id),
                    Some(m.id),
                ));
            }
        }
        transitioned
    }

    /// Record a provider-accepted send: external id, sent_at, and the
    /// owning campaign's sent_count — once.
    pub fn mark_sent(&self, message_id: &Uuid, external_id: &str) -> bool {
        let now = self.clock.now();
        let campaign_id = self.store.messages.with_mut(message_id, |m| {
            if !matches!(m.status, MessageStatus::Pending | MessageStatus::Queued) {
                return None;
            }
            m.status = MessageStatus::Sent;
            m.channel_message_id = Some(external_id.to_string());
            if m.sent_at.is_none() {
                m.sent_at = Some(now);
            }
            Some((m.campaign_id, m.contact_id))
        });

        match campaign_id {
            Some(Some((campaign_id, contact_id))) => {
                if let Some(campaign_id) = &campaign_id {
                    self.store.campaigns.increment_sent(campaign_id);
                }
                metrics::counter!("dispatch.messages_sent").increment(1);
                self.event_sink.emit(make_event(
                    EventType::MessageSent,
                    campaign_id,
                    Some(contact_id),
                    Some(*message_id),
                ));
                true
            }
            _ => false,
        }
    }

    /// Record a terminal send failure. Ignored once the message reached
    /// delivered or read — a delivered message cannot fail. Increments the
    /// owning campaign's failed_count exactly once.
    pub fn mark_failed(&self, message_id: &Uuid, error: &str) -> bool {
        let outcome = self.store.messages.with_mut(message_id, |m| {
            if !matches!(
                m.status,
                MessageStatus::Pending | MessageStatus::Queued | MessageStatus::Sent
            ) {
                return None;
            }
            m.status = MessageStatus::Failed;
            m.error_message = Some(error.to_string());
            Some((m.campaign_id, m.contact_id))
        });

        match outcome {
            Some(Some((campaign_id, contact_id))) => {
                if let Some(campaign_id) = &campaign_id {
                    self.store.campaigns.increment_failed(campaign_id);
                }
                metrics::counter!("dispatch.messages_failed").increment(1);
                info!(message_id = %message_id, error = %error, "Message failed");
                self.event_sink.emit(make_event(
                    EventType::MessageFailed,
                    campaign_id,
                    Some(contact_id),
                    Some(*message_id),
                ));
                true
            }
            _ => false,
        }
    }

    /// Apply a provider acknowledgment, looked up by external message id.
    ///
    /// Unknown ids are ignored — acks for messages this system never sent.
    /// Unknown codes are ignored. Each guard only moves the status forward,
    /// so reapplying an ack (at-least-once webhook delivery) is a no-op and
    /// campaign delivered/read counters move at most once per message.
    pub fn apply_ack(&self, external_id: &str, ack: i64) {
        let Some(message) = self.store.messages.find_by_channel_id(external_id) else {
            debug!(external_id = %external_id, ack, "Ack for unknown message, ignoring");
            return;
        };

        let now = self.clock.now();
        let outcome = self
            .store
            .messages
            .with_mut(&message.id, |m| match ack {
                ACK_SENT => {
                    // Only before delivered; late ack=1 after a 2 must not
                    // regress the status.
                    if matches!(m.status, MessageStatus::Pending | MessageStatus::Queued) {
                        m.status = MessageStatus::Sent;
                        AckOutcome::Sent
                    } else {
                        AckOutcome::None
                    }
                }
                ACK_DELIVERED => {
                    if matches!(
                        m.status,
                        MessageStatus::Pending | MessageStatus::Queued | MessageStatus::Sent
                    ) {
                        m.status = MessageStatus::Delivered;
                        if m.delivered_at.is_none() {
                            m.delivered_at = Some(now);
                        }
                        AckOutcome::Delivered
                    } else {
                        AckOutcome::None
                    }
                }
                ACK_READ => {
                    if matches!(
                        m.status,
                        MessageStatus::Pending
                            | MessageStatus::Queued
                            | MessageStatus::Sent
                            | MessageStatus::Delivered
                    ) {
                        m.status = MessageStatus::Read;
                        if m.read_at.is_none() {
                            m.read_at = Some(now);
                        }
                        AckOutcome::Read
                    } else {
                        AckOutcome::None
                    }
                }
                _ => {
                    debug!(external_id = %external_id, ack, "Unknown ack code, ignoring");
                    AckOutcome::None
                }
            })
            .unwrap_or(AckOutcome::None);

        match outcome {
            AckOutcome::Delivered => {
                if let Some(campaign_id) = &message.campaign_id {
                    self.store.campaigns.increment_delivered(campaign_id);
                }
                self.event_sink.emit(make_event(
                    EventType::MessageDelivered,
                    message.campaign_id,
                    Some(message.contact_id),
                    Some(message.id),
                ));
            }
            AckOutcome::Read => {
                if let Some(campaign_id) = &message.campaign_id {
                    self.store.campaigns.increment_read(campaign_id);
                }
                self.event_sink.emit(make_event(
                    EventType::MessageRead,
                    message.campaign_id,
                    Some(message.contact_id),
                    Some(message.id),
                ));
            }
            AckOutcome::Sent | AckOutcome::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outreach_core::clock::manual_clock;
    use outreach_core::event_bus::capture_sink;
    use outreach_core::types::*;

    fn setup() -> (Arc<Store>, DeliveryTracker, Uuid, Uuid) {
        let clock = manual_clock(Utc::now());
        let store = Arc::new(Store::new(clock.clone()));
        let now = clock.now();

        let campaign_id = Uuid::new_v4();
        store.campaigns.insert(Campaign {
            id: campaign_id,
            name: "Promo".to_string(),
            message_template: "Halo [Nama]".to_string(),
            media_url: None,
            segment_id: None,
            status: CampaignStatus::Running,
            scheduled_at: None,
            started_at: Some(now),
            completed_at: None,
            total_recipients: 1,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        });

        let message_id = Uuid::new_v4();
        store.messages.insert(Message {
            id: message_id,
            contact_id: Uuid::new_v4(),
            campaign_id: Some(campaign_id),
            direction: Direction::Outbound,
            content: "Halo Budi".to_string(),
            media_url: None,
            channel_message_id: None,
            status: MessageStatus::Queued,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: now,
        });

        let tracker = DeliveryTracker::new(store.clone(), clock);
        (store, tracker, campaign_id, message_id)
    }

    #[test]
    fn test_ack_progression_sets_timestamps() {
        let (store, tracker, _, message_id) = setup();
        tracker.mark_sent(&message_id, "ext-1");

        tracker.apply_ack("ext-1", 2);
        tracker.apply_ack("ext-1", 3);

        let message = store.messages.get(&message_id).unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        assert!(message.delivered_at.is_some());
        assert!(message.read_at.is_some());
    }

    #[test]
    fn test_late_ack_never_regresses() {
        let (store, tracker, _, message_id) = setup();
        tracker.mark_sent(&message_id, "ext-1");

        tracker.apply_ack("ext-1", 3);
        tracker.apply_ack("ext-1", 1);
        tracker.apply_ack("ext-1", 2);

        let message = store.messages.get(&message_id).unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        // A late delivered ack after read must not write delivered_at.
        assert!(message.delivered_at.is_none());
    }

    #[test]
    fn test_redelivered_ack_counts_once() {
        let (store, tracker, campaign_id, message_id) = setup();
        tracker.mark_sent(&message_id, "ext-1");

        tracker.apply_ack("ext-1", 2);
        tracker.apply_ack("ext-1", 2);
        tracker.apply_ack("ext-1", 3);
        tracker.apply_ack("ext-1", 3);

        let campaign = store.campaigns.get(&campaign_id).unwrap();
        assert_eq!(campaign.delivered_count, 1);
        assert_eq!(campaign.read_count, 1);
    }

    #[test]
    fn test_unknown_external_id_and_code_ignored() {
        let (store, tracker, campaign_id, message_id) = setup();
        tracker.mark_sent(&message_id, "ext-1");

        tracker.apply_ack("never-sent", 2);
        tracker.apply_ack("ext-1", 9);

        let message = store.messages.get(&message_id).unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(store.campaigns.get(&campaign_id).unwrap().delivered_count, 0);
    }

    #[test]
    fn test_failed_is_unreachable_after_delivery() {
        let (store, tracker, campaign_id, message_id) = setup();
        tracker.mark_sent(&message_id, "ext-1");
        tracker.apply_ack("ext-1", 2);

        assert!(!tracker.mark_failed(&message_id, "late provider error"));
        let message = store.messages.get(&message_id).unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(store.campaigns.get(&campaign_id).unwrap().failed_count, 0);
    }

    #[test]
    fn test_mark_sent_and_failed_count_once() {
        let (store, tracker, campaign_id, message_id) = setup();

        assert!(tracker.mark_sent(&message_id, "ext-1"));
        assert!(!tracker.mark_sent(&message_id, "ext-2"));

        let campaign = store.campaigns.get(&campaign_id).unwrap();
        assert_eq!(campaign.sent_count, 1);
        // External id is recorded once.
        let message = store.messages.get(&message_id).unwrap();
        assert_eq!(message.channel_message_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn test_events_emitted_per_milestone() {
        let clock = manual_clock(Utc::now());
        let store = Arc::new(Store::new(clock.clone()));
        let sink = capture_sink();
        let now = clock.now();

        let message_id = Uuid::new_v4();
        store.messages.insert(Message {
            id: message_id,
            contact_id: Uuid::new_v4(),
            campaign_id: None,
            direction: Direction::Outbound,
            content: "hi".to_string(),
            media_url: None,
            channel_message_id: None,
            status: MessageStatus::Queued,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: now,
        });

        let tracker = DeliveryTracker::new(store, clock).with_event_sink(sink.clone());
        tracker.mark_sent(&message_id, "ext-9");
        tracker.apply_ack("ext-9", 2);
        tracker.apply_ack("ext-9", 2);
        tracker.apply_ack("ext-9", 3);

        assert_eq!(sink.count_type(EventType::MessageSent), 1);
        assert_eq!(sink.count_type(EventType::MessageDelivered), 1);
        assert_eq!(sink.count_type(EventType::MessageRead), 1);
    }
}
