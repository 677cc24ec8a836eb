use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A person the platform can message. Phone is the unique business key;
/// contacts are soft-deleted (recoverable), never removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub lead_status: LeadStatus,
    pub vehicle_interest: Option<String>,
    pub budget: Option<f64>,
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Proposal => "proposal",
            LeadStatus::Negotiation => "negotiation",
            LeadStatus::ClosedWon => "closed_won",
            LeadStatus::ClosedLost => "closed_lost",
        }
    }
}

/// A single segment rule. Operator defaults to "=" when omitted; value
/// typing depends on the field (string, number, timestamp, boolean).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    #[serde(default)]
    pub operator: Option<String>,
    pub value: serde_json::Value,
}

/// Saved audience definition. Criteria are the source of truth; the
/// membership set and contact_count are a cache recomputed by sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub criteria: Vec<Criterion>,
    pub contact_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub message_template: String,
    pub media_url: Option<String>,
    /// None targets the entire contact store.
    pub segment_id: Option<Uuid>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot taken when the audience is resolved at start, not live.
    pub total_recipients: u64,
    pub sent_count: u64,
    pub delivered_count: u64,
    pub read_count: u64,
    pub failed_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Paused, completed and failed campaigns must not dispatch; tasks
    /// check this cooperatively at execution time.
    pub fn halts_dispatch(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Paused | CampaignStatus::Completed | CampaignStatus::Failed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub direction: Direction,
    pub content: String,
    pub media_url: Option<String>,
    /// Provider-assigned id; the join key for acknowledgment events.
    pub channel_message_id: Option<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery lifecycle: pending -> queued -> sent -> delivered -> read.
/// Failed is reachable from queued or sent only — once delivered, later
/// failures cannot be represented and are ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSequence {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<SequenceStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub step_order: u32,
    pub delay_hours: i64,
    pub message_template: String,
    pub media_url: Option<String>,
}

/// One active instantiation of a sequence for one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSequence {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub sequence_id: Uuid,
    /// Never decreases; a retried step resumes at the same index.
    pub current_step: u32,
    pub status: SequenceStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

/// One authenticated connection to the channel provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSession {
    pub id: Uuid,
    pub session_name: String,
    pub status: SessionStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    AwaitingLink,
    Working,
    Failed,
    Stopped,
}

impl SessionStatus {
    /// Parse a provider status string, case-insensitively. Provider spells
    /// the link state "SCAN_QR_CODE"; both spellings are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starting" => Some(SessionStatus::Starting),
            "awaiting_link" | "scan_qr_code" => Some(SessionStatus::AwaitingLink),
            "working" => Some(SessionStatus::Working),
            "failed" => Some(SessionStatus::Failed),
            "stopped" => Some(SessionStatus::Stopped),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_status_order() {
        assert!(MessageStatus::Pending < MessageStatus::Queued);
        assert!(MessageStatus::Queued < MessageStatus::Sent);
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
    }

    #[test]
    fn test_session_status_parse_case_insensitive() {
        assert_eq!(SessionStatus::parse("WORKING"), Some(SessionStatus::Working));
        assert_eq!(
            SessionStatus::parse("SCAN_QR_CODE"),
            Some(SessionStatus::AwaitingLink)
        );
        assert_eq!(SessionStatus::parse("unplugged"), None);
    }

    #[test]
    fn test_campaign_status_halts_dispatch() {
        assert!(CampaignStatus::Paused.halts_dispatch());
        assert!(CampaignStatus::Completed.halts_dispatch());
        assert!(!CampaignStatus::Running.halts_dispatch());
        assert!(!CampaignStatus::Draft.halts_dispatch());
    }
}
