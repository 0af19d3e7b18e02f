//! # prime-channels
//!
//! Protocol-client adapters for prime-pair.
//!
//! The WhatsApp multi-device protocol lives in an external bridge process;
//! [`bridge::BridgeClient`] drives one such process per pairing session.

pub mod bridge;

pub use bridge::{BridgeClient, BridgeClientFactory};
