//! Message template rendering — substitutes contact fields into bracketed
//! placeholder tokens.

use crate::types::Contact;

/// Render a message template for a contact.
///
/// Recognized tokens: `[Nama]`, `[nama]`, `[Phone]`, `[Email]`,
/// `[Kendaraan]`, `[Budget]`. `[Nama]` and `[nama]` are a known historical
/// duplication — both substitute the contact name, they are not distinct
/// tokens. Matching is case-sensitive to these spellings; anything else in
/// brackets is left untouched.
pub fn render(template: &str, contact: &Contact) -> String {
    let budget = contact.budget.map(format_budget).unwrap_or_default();
    let substitutions = [
        ("[Nama]", contact.name.as_str()),
        ("[nama]", contact.name.as_str()),
        ("[Phone]", contact.phone.as_str()),
        ("[Email]", contact.email.as_deref().unwrap_or("")),
        ("[Kendaraan]", contact.vehicle_interest.as_deref().unwrap_or("")),
        ("[Budget]", budget.as_str()),
    ];

    let mut result = template.to_string();
    for (token, value) in substitutions {
        result = result.replace(token, value);
    }
    result
}

/// Group the integer part with thousands separators, e.g. 150000 -> "150,000".
fn format_budget(budget: f64) -> String {
    let whole = budget.trunc() as i64;
    let digits = whole.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if whole < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}
