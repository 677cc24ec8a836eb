//! Typed criterion kinds and their comparison logic for segment criteria.

use chrono::{DateTime, Utc};
use outreach_core::types::{Contact, Criterion};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn parse(op: Option<&str>) -> Self {
        match op.unwrap_or("=") {
            "!=" | "<>" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Gte,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Lte,
            _ => CompareOp::Eq,
        }
    }

    fn matches_str(&self, actual: &str, expected: &str) -> bool {
        match self {
            CompareOp::Eq => actual == expected,
            CompareOp::Ne => actual != expected,
            // Lexicographic, matching the store collation these rules
            // historically ran against.
            CompareOp::Gt => actual > expected,
            CompareOp::Gte => actual >= expected,
            CompareOp::Lt => actual < expected,
            CompareOp::Lte => actual <= expected,
        }
    }
}

/// A recognized criterion, carrying its typed comparison. Unknown field
/// names become `Unrecognized`, which matches everything — tolerant
/// parsing is the intended policy here, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    LeadStatus { op: CompareOp, value: String },
    Source { op: CompareOp, value: String },
    VehicleInterest { needle: String },
    BudgetMin(f64),
    BudgetMax(f64),
    LastContactBefore(DateTime<Utc>),
    LastContactAfter(DateTime<Utc>),
    CreatedBefore(DateTime<Utc>),
    CreatedAfter(DateTime<Utc>),
    AssignedTo(Uuid),
    HasEmail(bool),
    Unrecognized,
}

/// Parse one raw criterion into its typed kind. Malformed values (a
/// non-numeric budget, an unparsable timestamp) degrade to `Unrecognized`
/// rather than failing the whole segment.
pub fn parse_criterion(criterion: &Criterion) -> CriterionKind {
    let op = CompareOp::parse(criterion.operator.as_deref());
    let value = &criterion.value;

    match criterion.field.as_str() {
        "lead_status" => match value.as_str() {
            Some(s) => CriterionKind::LeadStatus {
                op,
                value: s.to_string(),
            },
            None => CriterionKind::Unrecognized,
        },
        "source" => match value.as_str() {
            Some(s) => CriterionKind::Source {
                op,
                value: s.to_string(),
            },
            None => CriterionKind::Unrecognized,
        },
        // Operator is ignored: vehicle interest is always a substring match.
        "vehicle_interest" => match value.as_str() {
            Some(s) => CriterionKind::VehicleInterest {
                needle: s.to_string(),
            },
            None => CriterionKind::Unrecognized,
        },
        "budget_min" => match as_f64(value) {
            Some(n) => CriterionKind::BudgetMin(n),
            None => CriterionKind::Unrecognized,
        },
        "budget_max" => match as_f64(value) {
            Some(n) => CriterionKind::BudgetMax(n),
            None => CriterionKind::Unrecognized,
        },
        "last_contact_before" => match as_timestamp(value) {
            Some(t) => CriterionKind::LastContactBefore(t),
            None => CriterionKind::Unrecognized,
        },
        "last_contact_after" => match as_timestamp(value) {
            Some(t) => CriterionKind::LastContactAfter(t),
            None => CriterionKind::Unrecognized,
        },
        "created_before" => match as_timestamp(value) {
            Some(t) => CriterionKind::CreatedBefore(t),
            None => CriterionKind::Unrecognized,
        },
        "created_after" => match as_timestamp(value) {
            Some(t) => CriterionKind::CreatedAfter(t),
            None => CriterionKind::Unrecognized,
        },
        "assigned_to" => match value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(id) => CriterionKind::AssignedTo(id),
            None => CriterionKind::Unrecognized,
        },
        "has_email" => CriterionKind::HasEmail(truthy(value)),
        _ => CriterionKind::Unrecognized,
    }
}

impl CriterionKind {
    /// Does this criterion admit the contact?
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            CriterionKind::LeadStatus { op, value } => {
                op.matches_str(contact.lead_status.as_str(), value)
            }
            CriterionKind::Source { op, value } => contact
                .source
                .as_deref()
                .map(|s| op.matches_str(s, value))
                .unwrap_or(false),
            CriterionKind::VehicleInterest { needle } => contact
                .vehicle_interest
                .as_deref()
                .map(|v| v.contains(needle.as_str()))
                .unwrap_or(false),
            CriterionKind::BudgetMin(min) => {
                contact.budget.map(|b| b >= *min).unwrap_or(false)
            }
            CriterionKind::BudgetMax(max) => {
                contact.budget.map(|b| b <= *max).unwrap_or(false)
            }
            CriterionKind::LastContactBefore(t) => contact.updated_at < *t,
            CriterionKind::LastContactAfter(t) => contact.updated_at > *t,
            CriterionKind::CreatedBefore(t) => contact.created_at < *t,
            CriterionKind::CreatedAfter(t) => contact.created_at > *t,
            CriterionKind::AssignedTo(owner) => contact.assigned_to == Some(*owner),
            CriterionKind::HasEmail(wanted) => contact.email.is_some() == *wanted,
            CriterionKind::Unrecognized => true,
        }
    }
}

fn as_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn as_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Date-only values mean midnight UTC.
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty() && s != "0" && s != "false",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::LeadStatus;
    use serde_json::json;

    fn make_contact() -> Contact {
        let now = Utc::now();
        Contact {
            id: Uuid::new_v4(),
            phone: "628123456789".to_string(),
            name: "Budi".to_string(),
            email: Some("budi@example.com".to_string()),
            lead_status: LeadStatus::Qualified,
            vehicle_interest: Some("Toyota Avanza".to_string()),
            budget: Some(150_000_000.0),
            source: Some("walk_in".to_string()),
            metadata: json!({}),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn criterion(field: &str, operator: Option<&str>, value: serde_json::Value) -> Criterion {
        Criterion {
            field: field.to_string(),
            operator: operator.map(str::to_string),
            value,
        }
    }

    #[test]
    fn test_lead_status_defaults_to_equality() {
        let kind = parse_criterion(&criterion("lead_status", None, json!("qualified")));
        assert!(kind.matches(&make_contact()));

        let kind = parse_criterion(&criterion("lead_status", Some("!="), json!("qualified")));
        assert!(!kind.matches(&make_contact()));
    }

    #[test]
    fn test_vehicle_interest_is_substring_regardless_of_operator() {
        let kind = parse_criterion(&criterion("vehicle_interest", Some("="), json!("Toyota")));
        assert!(kind.matches(&make_contact()));

        let kind = parse_criterion(&criterion("vehicle_interest", None, json!("Honda")));
        assert!(!kind.matches(&make_contact()));
    }

    #[test]
    fn test_budget_bounds_are_inclusive() {
        let contact = make_contact();
        assert!(parse_criterion(&criterion("budget_min", None, json!(150_000_000.0)))
            .matches(&contact));
        assert!(parse_criterion(&criterion("budget_max", None, json!(150_000_000.0)))
            .matches(&contact));
        assert!(!parse_criterion(&criterion("budget_min", None, json!(150_000_001.0)))
            .matches(&contact));
    }

    #[test]
    fn test_budget_accepts_string_numbers() {
        let kind = parse_criterion(&criterion("budget_min", None, json!("100000000")));
        assert!(kind.matches(&make_contact()));
    }

    #[test]
    fn test_has_email_presence_and_absence() {
        let mut contact = make_contact();
        assert!(parse_criterion(&criterion("has_email", None, json!(true))).matches(&contact));
        assert!(!parse_criterion(&criterion("has_email", None, json!(false))).matches(&contact));

        contact.email = None;
        assert!(parse_criterion(&criterion("has_email", None, json!(false))).matches(&contact));
    }

    #[test]
    fn test_unknown_field_is_tolerated() {
        let kind = parse_criterion(&criterion("shoe_size", None, json!(42)));
        assert!(matches!(kind, CriterionKind::Unrecognized));
        assert!(kind.matches(&make_contact()));
    }

    #[test]
    fn test_created_before_accepts_dates() {
        let kind = parse_criterion(&criterion("created_before", None, json!("2030-01-01")));
        assert!(kind.matches(&make_contact()));
    }
}
