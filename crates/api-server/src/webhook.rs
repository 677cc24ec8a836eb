//! Provider webhook ingestion.
//!
//! One endpoint takes the provider's event envelope. Every branch's
//! failure is caught and logged; the endpoint always answers success so
//! provider-side webhook retries never mask unrelated internal errors.

use axum::extract::State;
use axum::Json;
use outreach_channel::addressing::{normalize_phone, phone_from_chat_id};
use outreach_core::event_bus::{make_event, EventType};
use outreach_core::types::*;
use outreach_core::OutreachResult;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::rest::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/webhooks/channel — provider event intake.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> Json<serde_json::Value> {
    info!(event = %envelope.event, session = %envelope.session, "Channel webhook received");
    metrics::counter!("webhook.received", "event" => envelope.event.clone()).increment(1);

    let result = match envelope.event.as_str() {
        "message" => handle_incoming_message(&state, &envelope.payload),
        "message.ack" => handle_message_ack(&state, &envelope.payload),
        "session.status" => handle_session_status(&state, &envelope.session, &envelope.payload),
        other => {
            warn!(event = %other, "Unknown webhook event");
            Ok(())
        }
    };

    if let Err(err) = result {
        // Swallowed on purpose: a failed event must not bubble into the
        // provider response or abort the ingestion path.
        error!(event = %envelope.event, error = %err, "Webhook handling failed");
        metrics::counter!("webhook.errors", "event" => envelope.event.clone()).increment(1);
    }

    Json(json!({ "status": "ok" }))
}

/// Inbound message: create-or-fetch the contact by normalized phone, then
/// record an already-delivered inbound message.
fn handle_incoming_message(state: &AppState, payload: &serde_json::Value) -> OutreachResult<()> {
    let Some(from) = payload.get("from").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let body = payload
        .get("body")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let external_id = payload.get("id").and_then(|v| v.as_str());
    let notify_name = payload
        .get("notifyName")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown");

    let phone = normalize_phone(phone_from_chat_id(from));
    let contact = state
        .store
        .contacts
        .get_or_create_by_phone(&phone, notify_name, "whatsapp_inbound");

    let now = chrono::Utc::now();
    let message = Message {
        id: Uuid::new_v4(),
        contact_id: contact.id,
        campaign_id: None,
        direction: Direction::Inbound,
        content: body.to_string(),
        media_url: None,
        channel_message_id: external_id.map(str::to_string),
        status: MessageStatus::Delivered,
        error_message: None,
        sent_at: None,
        delivered_at: Some(now),
        read_at: None,
        created_at: now,
    };
    let message_id = message.id;
    state.store.messages.insert(message);
    state.store.contacts.touch(&contact.id);

    state.event_sink.emit(make_event(
        EventType::InboundReceived,
        None,
        Some(contact.id),
        Some(message_id),
    ));
    info!(contact_id = %contact.id, phone = %phone, "Incoming message saved");
    Ok(())
}

/// Delivery/read acknowledgment for a previously sent message.
fn handle_message_ack(state: &AppState, payload: &serde_json::Value) -> OutreachResult<()> {
    let Some(external_id) = payload.get("id").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let ack = payload.get("ack").and_then(|v| v.as_i64()).unwrap_or(0);
    state.tracker.apply_ack(external_id, ack);
    Ok(())
}

fn handle_session_status(
    state: &AppState,
    session: &str,
    payload: &serde_json::Value,
) -> OutreachResult<()> {
    let Some(raw_status) = payload.get("status").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    match SessionStatus::parse(raw_status) {
        Some(status) => {
            state.store.sessions.upsert_status(session, status);
            info!(session = %session, ?status, "Session status updated");
            state
                .event_sink
                .emit(make_event(EventType::SessionStatusChanged, None, None, None));
        }
        None => warn!(session = %session, status = %raw_status, "Unknown session status"),
    }
    Ok(())
}
