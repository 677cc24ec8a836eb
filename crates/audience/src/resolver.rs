//! Audience resolver — evaluates segment criteria against the contact
//! store and keeps segment membership caches in sync.

use std::collections::HashSet;
use std::sync::Arc;

use outreach_core::store::Store;
use outreach_core::types::Criterion;
use outreach_core::{OutreachError, OutreachResult};
use tracing::info;
use uuid::Uuid;

use crate::criteria::{parse_criterion, CriterionKind};

/// Pure criteria evaluation over the contact store; `resolve` and `count`
/// have no side effects and are safe to call for previews.
pub struct AudienceResolver {
    store: Arc<Store>,
}

impl AudienceResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Ids of all non-deleted contacts satisfying every criterion (AND).
    pub fn resolve(&self, criteria: &[Criterion]) -> HashSet<Uuid> {
        let kinds: Vec<CriterionKind> = criteria.iter().map(parse_criterion).collect();
        self.store
            .contacts
            .list_active()
            .into_iter()
            .filter(|contact| kinds.iter().all(|kind| kind.matches(contact)))
            .map(|contact| contact.id)
            .collect()
    }

    /// Preview how many contacts a criteria set reaches, without saving.
    pub fn count(&self, criteria: &[Criterion]) -> u64 {
        self.resolve(criteria).len() as u64
    }

    /// Recompute a segment's membership from its criteria, replace the
    /// cached set, and return the new size. Calling twice without data
    /// changes yields the same membership and count.
    pub fn sync(&self, segment_id: &Uuid) -> OutreachResult<u64> {
        let segment = self
            .store
            .segments
            .get(segment_id)
            .ok_or_else(|| OutreachError::NotFound(format!("Segment {segment_id}")))?;

        let members: HashSet<Uuid> = self.resolve(&segment.criteria);
        let count = self
            .store
            .segments
            .replace_members(segment_id, members)
            .ok_or_else(|| OutreachError::NotFound(format!("Segment {segment_id}")))?;

        info!(segment_id = %segment_id, contact_count = count, "Segment synced");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outreach_core::clock::manual_clock;
    use outreach_core::types::{Contact, LeadStatus, Segment};
    use serde_json::json;

    fn store() -> Arc<Store> {
        Arc::new(Store::new(manual_clock(Utc::now())))
    }

    fn add_contact(store: &Store, phone: &str, vehicle: &str, status: LeadStatus) -> Contact {
        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            name: "Test".to_string(),
            email: None,
            lead_status: status,
            vehicle_interest: Some(vehicle.to_string()),
            budget: None,
            source: None,
            metadata: json!({}),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.contacts.upsert(contact.clone());
        contact
    }

    fn vehicle_criteria(needle: &str) -> Vec<Criterion> {
        vec![Criterion {
            field: "vehicle_interest".to_string(),
            operator: None,
            value: json!(needle),
        }]
    }

    #[test]
    fn test_resolve_substring_and_semantics() {
        let store = store();
        let avanza = add_contact(&store, "1", "Toyota Avanza", LeadStatus::New);
        let _civic = add_contact(&store, "2", "Honda Civic", LeadStatus::New);
        let innova = add_contact(&store, "3", "Toyota Innova", LeadStatus::Qualified);

        let resolver = AudienceResolver::new(store);
        let matched = resolver.resolve(&vehicle_criteria("Toyota"));
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&avanza.id));
        assert!(matched.contains(&innova.id));

        // AND with a second criterion narrows further.
        let mut criteria = vehicle_criteria("Toyota");
        criteria.push(Criterion {
            field: "lead_status".to_string(),
            operator: None,
            value: json!("qualified"),
        });
        let matched = resolver.resolve(&criteria);
        assert_eq!(matched.len(), 1);
        assert!(matched.contains(&innova.id));
    }

    #[test]
    fn test_soft_deleted_contacts_never_resolve() {
        let store = store();
        let contact = add_contact(&store, "1", "Toyota Avanza", LeadStatus::New);
        store.contacts.soft_delete(&contact.id);

        let resolver = AudienceResolver::new(store);
        assert_eq!(resolver.count(&vehicle_criteria("Toyota")), 0);
    }

    #[test]
    fn test_sync_is_idempotent_and_counts_match() {
        let store = store();
        add_contact(&store, "1", "Toyota Avanza", LeadStatus::New);
        add_contact(&store, "2", "Honda Civic", LeadStatus::New);

        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4(),
            name: "Toyota buyers".to_string(),
            description: None,
            criteria: vehicle_criteria("Toyota"),
            contact_count: 0,
            created_at: now,
            updated_at: now,
        };
        store.segments.insert(segment.clone());

        let resolver = AudienceResolver::new(store.clone());
        let first = resolver.sync(&segment.id).unwrap();
        let second = resolver.sync(&segment.id).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);

        let synced = store.segments.get(&segment.id).unwrap();
        assert_eq!(synced.contact_count, 1);
        assert_eq!(
            store.segments.members_of(&segment.id).len() as u64,
            synced.contact_count
        );
    }

    #[test]
    fn test_sync_drops_members_no_longer_matching() {
        let store = store();
        let contact = add_contact(&store, "1", "Toyota Avanza", LeadStatus::New);

        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4(),
            name: "Toyota buyers".to_string(),
            description: None,
            criteria: vehicle_criteria("Toyota"),
            contact_count: 0,
            created_at: now,
            updated_at: now,
        };
        store.segments.insert(segment.clone());

        let resolver = AudienceResolver::new(store.clone());
        assert_eq!(resolver.sync(&segment.id).unwrap(), 1);

        // Interest changes; the old member must drop on resync.
        let mut changed = contact;
        changed.vehicle_interest = Some("Honda Brio".to_string());
        store.contacts.upsert(changed);

        assert_eq!(resolver.sync(&segment.id).unwrap(), 0);
        assert!(store.segments.members_of(&segment.id).is_empty());
    }

    #[test]
    fn test_sync_missing_segment_errors() {
        let resolver = AudienceResolver::new(store());
        assert!(matches!(
            resolver.sync(&Uuid::new_v4()),
            Err(OutreachError::NotFound(_))
        ));
    }
}
