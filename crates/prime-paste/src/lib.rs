//! # prime-paste
//!
//! Paste-service adapters used to export session credentials.

pub mod pastebin;

pub use pastebin::PastebinClient;
