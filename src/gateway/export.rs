//! Credential export to the paste service and delivery of the session id.

use super::workspace::CredentialStore;
use chrono::{DateTime, Local};
use prime_core::error::PairingError;
use prime_core::pairing::{paste_id_from_url, session_identifier, user_jid};
use prime_core::traits::{Paste, PasteService, ProtocolClient, Visibility};

/// Upload `creds.json` and derive the user's session identifier from the paste URL.
pub(super) async fn export_credentials(
    paste: &dyn PasteService,
    store: &CredentialStore,
    title: &str,
    product_tag: &str,
) -> Result<String, PairingError> {
    let text = store
        .read_raw()
        .await
        .map_err(|e| PairingError::Export(format!("cannot read credentials: {e}")))?;

    let url = paste
        .create_paste(&Paste {
            text,
            title: title.to_string(),
            format: "json".to_string(),
            visibility: Visibility::Unlisted,
            expiration: None,
        })
        .await
        .map_err(|e| PairingError::Export(e.to_string()))?;

    let paste_id = paste_id_from_url(&url)
        .ok_or_else(|| PairingError::Export(format!("no paste id in response: {url}")))?;

    Ok(session_identifier(product_tag, &paste_id))
}

/// Send the bare identifier, then the instructions, to the user's own chat.
pub(super) async fn deliver_session_id(
    client: &dyn ProtocolClient,
    phone_number: &str,
    session_id: &str,
    product_tag: &str,
    generated_at: DateTime<Local>,
) -> Result<(), PairingError> {
    let jid = user_jid(phone_number);

    client
        .send_text(&jid, session_id)
        .await
        .map_err(|e| PairingError::Delivery(e.to_string()))?;

    let instructions = instructions_message(session_id, product_tag, generated_at);
    client
        .send_text(&jid, &instructions)
        .await
        .map_err(|e| PairingError::Delivery(e.to_string()))?;

    Ok(())
}

/// Human-readable follow-up to the bare session id.
pub(super) fn instructions_message(
    session_id: &str,
    product_tag: &str,
    generated_at: DateTime<Local>,
) -> String {
    format!(
        "🤖 *{product_tag} Session Generated* 🤖\n\
         \n\
         ✅ *Your Session ID:*\n\
         `{session_id}`\n\
         \n\
         📱 *How to use it:*\n\
         1. Copy the session ID from the previous message\n\
         2. Set it as the session ID in your bot deployment\n\
         3. Start the bot\n\
         \n\
         ⚠️ *Keep it secret:*\n\
         - Anyone holding this ID can act as your WhatsApp account\n\
         - Never share it or post it publicly\n\
         - It is sent only once, so store it somewhere safe\n\
         \n\
         🔐 *Generated on:* {}\n\
         \n\
         Thank you for using {product_tag}! 🚀",
        generated_at.format("%Y-%m-%d %H:%M:%S %Z")
    )
}
