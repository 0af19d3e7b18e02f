//! # prime-core
//!
//! Core types, traits, configuration, and error handling for prime-pair.

pub mod config;
pub mod error;
pub mod pairing;
pub mod traits;

/// Expand `~` to the user's home directory.
pub fn shellexpand(path: &str) -> String {
    if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}
