//! In-memory entity stores backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! Each store exposes the repository surface the engines depend on
//! (find-by-id, upsert, atomic increment); campaign counters are mutated
//! under the map's entry lock, never read-modify-write across calls.

use crate::clock::Clock;
use crate::types::*;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

// ─── Contacts ──────────────────────────────────────────────────────────────

pub struct ContactStore {
    clock: Arc<dyn Clock>,
    contacts: DashMap<Uuid, Contact>,
    phone_index: DashMap<String, Uuid>,
}

impl ContactStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            contacts: DashMap::new(),
            phone_index: DashMap::new(),
        }
    }

    pub fn upsert(&self, contact: Contact) {
        self.phone_index.insert(contact.phone.clone(), contact.id);
        self.contacts.insert(contact.id, contact);
    }

    pub fn get(&self, id: &Uuid) -> Option<Contact> {
        self.contacts.get(id).map(|c| c.clone())
    }

    pub fn find_by_phone(&self, phone: &str) -> Option<Contact> {
        self.phone_index
            .get(phone)
            .and_then(|id| self.contacts.get(&id).map(|c| c.clone()))
    }

    /// Fetch by phone or create a fresh contact. New contacts start in
    /// lead status `new`.
    pub fn get_or_create_by_phone(&self, phone: &str, name: &str, source: &str) -> Contact {
        if let Some(existing) = self.find_by_phone(phone) {
            return existing;
        }
        let now = self.clock.now();
        let contact = Contact {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            name: name.to_string(),
            email: None,
            lead_status: LeadStatus::New,
            vehicle_interest: None,
            budget: None,
            source: Some(source.to_string()),
            metadata: serde_json::json!({}),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.upsert(contact.clone());
        info!(contact_id = %contact.id, phone = %phone, "Contact created");
        contact
    }

    /// All contacts that are not soft-deleted.
    pub fn list_active(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| c.deleted_at.is_none())
            .map(|c| c.clone())
            .collect()
    }

    pub fn soft_delete(&self, id: &Uuid) -> bool {
        let now = self.clock.now();
        self.contacts
            .get_mut(id)
            .map(|mut c| {
                c.deleted_at = Some(now);
                c.updated_at = now;
            })
            .is_some()
    }

    pub fn restore(&self, id: &Uuid) -> bool {
        let now = self.clock.now();
        self.contacts
            .get_mut(id)
            .map(|mut c| {
                c.deleted_at = None;
                c.updated_at = now;
            })
            .is_some()
    }

    /// Bump updated_at — the "last contact" timestamp criteria evaluate.
    pub fn touch(&self, id: &Uuid) {
        let now = self.clock.now();
        if let Some(mut c) = self.contacts.get_mut(id) {
            c.updated_at = now;
        }
    }
}

// ─── Segments ──────────────────────────────────────────────────────────────

pub struct SegmentStore {
    clock: Arc<dyn Clock>,
    segments: DashMap<Uuid, Segment>,
    members: DashMap<Uuid, HashSet<Uuid>>,
}

impl SegmentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            segments: DashMap::new(),
            members: DashMap::new(),
        }
    }

    pub fn insert(&self, segment: Segment) {
        self.segments.insert(segment.id, segment);
    }

    pub fn get(&self, id: &Uuid) -> Option<Segment> {
        self.segments.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<Segment> {
        self.segments.iter().map(|s| s.clone()).collect()
    }

    /// Swap the membership cache for a segment and update contact_count to
    /// match. The whole set is replaced under one entry lock so readers
    /// never observe a partial sync.
    pub fn replace_members(&self, id: &Uuid, member_ids: HashSet<Uuid>) -> Option<u64> {
        if !self.segments.contains_key(id) {
            return None;
        }
        let count = member_ids.len() as u64;
        self.members.insert(*id, member_ids);
        let now = self.clock.now();
        self.segments.get_mut(id).map(|mut s| {
            s.contact_count = count;
            s.updated_at = now;
            count
        })
    }

    pub fn members_of(&self, id: &Uuid) -> HashSet<Uuid> {
        self.members
            .get(id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

// ─── Campaigns ─────────────────────────────────────────────────────────────

pub struct CampaignStore {
    clock: Arc<dyn Clock>,
    campaigns: DashMap<Uuid, Campaign>,
}

impl CampaignStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            campaigns: DashMap::new(),
        }
    }

    pub fn insert(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> = self.campaigns.iter().map(|c| c.clone()).collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    pub fn update(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.campaigns.remove(id).is_some()
    }

    /// Apply a mutation under the entry lock. Returns None when the
    /// campaign does not exist.
    pub fn with_mut<T>(&self, id: &Uuid, f: impl FnOnce(&mut Campaign) -> T) -> Option<T> {
        self.campaigns.get_mut(id).map(|mut c| {
            let out = f(&mut c);
            c.updated_at = self.clock.now();
            out
        })
    }

    pub fn increment_sent(&self, id: &Uuid) {
        self.with_mut(id, |c| c.sent_count += 1);
    }

    pub fn increment_failed(&self, id: &Uuid) {
        self.with_mut(id, |c| c.failed_count += 1);
    }

    pub fn increment_delivered(&self, id: &Uuid) {
        self.with_mut(id, |c| c.delivered_count += 1);
    }

    pub fn increment_read(&self, id: &Uuid) {
        self.with_mut(id, |c| c.read_count += 1);
    }

    /// Flip a running campaign to completed once every recipient settled.
    /// Safe under concurrent settles: the check and transition happen under
    /// the entry lock and re-running after completion is a no-op.
    pub fn try_complete(&self, id: &Uuid) -> bool {
        let now = self.clock.now();
        self.with_mut(id, |c| {
            if c.status == CampaignStatus::Running
                && c.total_recipients > 0
                && c.sent_count + c.failed_count >= c.total_recipients
            {
                c.status = CampaignStatus::Completed;
                c.completed_at = Some(now);
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Scheduled campaigns whose run time has come.
    pub fn due_scheduled(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled
                    && c.scheduled_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|c| c.clone())
            .collect()
    }
}

// ─── Messages ──────────────────────────────────────────────────────────────

pub struct MessageStore {
    messages: DashMap<Uuid, Message>,
    channel_index: DashMap<String, Uuid>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            channel_index: DashMap::new(),
        }
    }

    pub fn insert(&self, message: Message) {
        if let Some(channel_id) = &message.channel_message_id {
            self.channel_index.insert(channel_id.clone(), message.id);
        }
        self.messages.insert(message.id, message);
    }

    pub fn get(&self, id: &Uuid) -> Option<Message> {
        self.messages.get(id).map(|m| m.clone())
    }

    pub fn find_by_channel_id(&self, channel_id: &str) -> Option<Message> {
        self.channel_index
            .get(channel_id)
            .and_then(|id| self.messages.get(&id).map(|m| m.clone()))
    }

    /// Apply a mutation under the entry lock, keeping the channel-id index
    /// in step.
    pub fn with_mut<T>(&self, id: &Uuid, f: impl FnOnce(&mut Message) -> T) -> Option<T> {
        self.messages.get_mut(id).map(|mut m| {
            let out = f(&mut m);
            if let Some(channel_id) = &m.channel_message_id {
                self.channel_index.insert(channel_id.clone(), m.id);
            }
            out
        })
    }

    pub fn list_by_campaign(&self, campaign_id: &Uuid) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.campaign_id.as_ref() == Some(campaign_id))
            .map(|m| m.clone())
            .collect()
    }

    /// Messages a paused campaign never attempted — the resume set.
    pub fn pending_for_campaign(&self, campaign_id: &Uuid) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| {
                m.campaign_id.as_ref() == Some(campaign_id)
                    && m.status == MessageStatus::Pending
            })
            .map(|m| m.clone())
            .collect()
    }

    pub fn list_by_contact(&self, contact_id: &Uuid) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.contact_id == *contact_id)
            .map(|m| m.clone())
            .collect()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Sequences ─────────────────────────────────────────────────────────────

pub struct SequenceStore {
    sequences: DashMap<Uuid, FollowUpSequence>,
    contact_sequences: DashMap<Uuid, ContactSequence>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self {
            sequences: DashMap::new(),
            contact_sequences: DashMap::new(),
        }
    }

    pub fn insert_sequence(&self, sequence: FollowUpSequence) {
        self.sequences.insert(sequence.id, sequence);
    }

    pub fn get_sequence(&self, id: &Uuid) -> Option<FollowUpSequence> {
        self.sequences.get(id).map(|s| s.clone())
    }

    pub fn insert_contact_sequence(&self, cs: ContactSequence) {
        self.contact_sequences.insert(cs.id, cs);
    }

    pub fn get_contact_sequence(&self, id: &Uuid) -> Option<ContactSequence> {
        self.contact_sequences.get(id).map(|cs| cs.clone())
    }

    pub fn with_contact_sequence_mut<T>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut ContactSequence) -> T,
    ) -> Option<T> {
        self.contact_sequences.get_mut(id).map(|mut cs| f(&mut cs))
    }

    /// The single active enrollment for a (contact, sequence) pair, if any.
    pub fn find_active(&self, contact_id: &Uuid, sequence_id: &Uuid) -> Option<ContactSequence> {
        self.contact_sequences
            .iter()
            .find(|cs| {
                cs.contact_id == *contact_id
                    && cs.sequence_id == *sequence_id
                    && cs.status == SequenceStatus::Active
            })
            .map(|cs| cs.clone())
    }
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Channel sessions ──────────────────────────────────────────────────────

pub struct SessionStore {
    clock: Arc<dyn Clock>,
    sessions: DashMap<String, ChannelSession>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, session_name: &str) -> Option<ChannelSession> {
        self.sessions.get(session_name).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<ChannelSession> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    /// Record a provider-reported status, creating the session row on
    /// first sight and stamping last_seen_at.
    pub fn upsert_status(&self, session_name: &str, status: SessionStatus) -> ChannelSession {
        let now = self.clock.now();
        let mut entry = self
            .sessions
            .entry(session_name.to_string())
            .or_insert_with(|| ChannelSession {
                id: Uuid::new_v4(),
                session_name: session_name.to_string(),
                status,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            });
        entry.status = status;
        entry.last_seen_at = Some(now);
        entry.updated_at = now;
        entry.clone()
    }
}

// ─── Aggregate ─────────────────────────────────────────────────────────────

/// All entity stores behind one handle, shared by every engine.
pub struct Store {
    pub contacts: ContactStore,
    pub segments: SegmentStore,
    pub campaigns: CampaignStore,
    pub messages: MessageStore,
    pub sequences: SequenceStore,
    pub sessions: SessionStore,
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            contacts: ContactStore::new(clock.clone()),
            segments: SegmentStore::new(clock.clone()),
            campaigns: CampaignStore::new(clock.clone()),
            messages: MessageStore::new(),
            sequences: SequenceStore::new(),
            sessions: SessionStore::new(clock),
        }
    }
}
