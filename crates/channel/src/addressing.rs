//! Destination address normalization for the channel provider.

/// The provider's chat-id suffix for individual contacts.
pub const CHAT_SUFFIX: &str = "@c.us";

/// Normalize a raw phone number into international digits.
///
/// Non-digits are stripped; Indonesian local-format mobile numbers are
/// rewritten into international form: a leading `08` or bare `8` becomes
/// `628…`. Already-international numbers pass through unchanged.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if let Some(rest) = digits.strip_prefix("08") {
        format!("628{rest}")
    } else if digits.starts_with('8') {
        format!("62{digits}")
    } else {
        digits
    }
}

/// Full provider chat id for a phone number.
pub fn chat_id(raw: &str) -> String {
    format!("{}{}", normalize_phone(raw), CHAT_SUFFIX)
}

/// Extract the bare phone number from an inbound chat id.
pub fn phone_from_chat_id(chat_id: &str) -> &str {
    chat_id.strip_suffix(CHAT_SUFFIX).unwrap_or(chat_id)
}
