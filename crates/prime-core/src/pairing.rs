//! Pure helpers for the pairing flow: input validation, addressing, and
//! identifier formatting.

use crate::error::PairingError;
use chrono::{DateTime, Utc};

/// Suffix of a personal WhatsApp address.
pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";

/// Accept only non-empty strings of ASCII digits.
pub fn validate_phone(phone_number: &str) -> Result<&str, PairingError> {
    if !phone_number.is_empty() && phone_number.bytes().all(|b| b.is_ascii_digit()) {
        Ok(phone_number)
    } else {
        Err(PairingError::InvalidInput(
            "phone number must contain digits only, including country code".to_string(),
        ))
    }
}

/// The user's own address: non-digits removed, `@s.whatsapp.net` appended.
pub fn user_jid(phone_number: &str) -> String {
    let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}{USER_JID_SUFFIX}")
}

/// Group a raw pairing code into blocks of four joined by `-`.
///
/// Separators already present in the raw code are dropped first, so
/// `"ABCD1234EFGH"` and `"ABCD-1234-EFGH"` both give `"ABCD-1234-EFGH"`.
pub fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Extract the paste id: the final non-empty path segment of an http(s) URL,
/// taken as-is.
pub fn paste_id_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let (_host, path) = rest.split_once('/')?;
    let segment = path.split('/').filter(|s| !s.is_empty()).last()?;
    if segment.chars().any(char::is_whitespace) {
        return None;
    }
    Some(segment.to_string())
}

/// The token handed to the user: `<product_tag>_<paste_id>`.
pub fn session_identifier(product_tag: &str, paste_id: &str) -> String {
    format!("{product_tag}_{paste_id}")
}

/// A fresh session key: creation time in milliseconds plus a random suffix.
pub fn new_session_key(created_at: DateTime<Utc>) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", created_at.timestamp_millis(), &token[..8])
}

/// Hide all but the last four digits, for logs and audit rows.
pub fn mask_phone(phone_number: &str) -> String {
    let len = phone_number.chars().count();
    if len <= 4 {
        return "*".repeat(len);
    }
    let visible: String = phone_number.chars().skip(len - 4).collect();
    format!("{}{visible}", "*".repeat(len - 4))
}
