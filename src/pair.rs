//! Standalone pairing from the terminal via pairing code.

use crate::gateway::{CancelReason, EventSink, Gateway, SessionEvent};
use tokio::sync::mpsc;

/// Run the interactive pairing flow for `phone_number` and wait for the outcome.
pub async fn pair_phone(gateway: Gateway, phone_number: &str) -> anyhow::Result<()> {
    cliclack::intro(console::style("prime-pair pair").bold().to_string())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let claim = gateway
        .claim_owner("terminal", CancelReason::Superseded)
        .await;
    let start = {
        let gateway = gateway.clone();
        let phone_number = phone_number.to_string();
        tokio::spawn(async move {
            gateway
                .start_pairing(&phone_number, EventSink::new(tx), Some(claim))
                .await
        })
    };

    let mut spinner = cliclack::spinner();
    spinner.start("Starting session...");

    let completed = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(SessionEvent::Status { message }) => spinner.set_message(message),
                Some(SessionEvent::PairingCode { code }) => {
                    spinner.stop("Pairing code issued.");
                    cliclack::note(
                        "WhatsApp → Linked Devices → Link with phone number",
                        console::style(&code).bold().to_string(),
                    )?;
                    spinner = cliclack::spinner();
                    spinner.start("Waiting for you to enter the code...");
                }
                Some(SessionEvent::Success { message }) => {
                    spinner.stop(message);
                    break true;
                }
                Some(SessionEvent::Error { message }) => {
                    spinner.error(message);
                    break false;
                }
                None => {
                    spinner.error("Session ended without a result.");
                    break false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                spinner.error("Interrupted.");
                break false;
            }
        }
    };

    gateway.shutdown().await;
    start.abort();

    if completed {
        cliclack::outro("Done. Your session ID is waiting in your own WhatsApp chat.")?;
    } else {
        cliclack::outro(format!("Try again with: prime-pair pair {phone_number}"))?;
    }

    Ok(())
}
