//! Self-check — verify every collaborator is reachable before serving.

use chrono::Utc;
use prime_core::config::{AuditConfig, BridgeConfig, Config, PasteConfig};
use prime_memory::AuditLogger;
use std::path::{Path, PathBuf};

/// Result of a single check.
struct CheckResult {
    name: String,
    detail: String,
    ok: bool,
}

impl CheckResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            detail: detail.into(),
            ok: true,
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            detail: detail.into(),
            ok: false,
        }
    }
}

/// Run all checks and print the results. Returns true if all passed.
pub async fn run(config: &Config) -> bool {
    let results = vec![
        check_sessions_dir(&config.pairing.sessions_root()).await,
        check_bridge(&config.bridge),
        check_paste(&config.paste),
        check_audit(&config.audit).await,
    ];

    println!("\nprime-pair Self-Check");
    println!("=====================");
    let mut all_ok = true;
    for r in &results {
        let icon = if r.ok { "+" } else { "x" };
        println!("  {icon} {} — {}", r.name, r.detail);
        if !r.ok {
            all_ok = false;
        }
    }
    println!();

    all_ok
}

async fn check_sessions_dir(root: &Path) -> CheckResult {
    if let Err(e) = tokio::fs::create_dir_all(root).await {
        return CheckResult::fail("Sessions", format!("{} (cannot create: {e})", root.display()));
    }

    let marker = root.join(".prime-check");
    match tokio::fs::write(&marker, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&marker).await;
            CheckResult::pass("Sessions", format!("{} (writable)", root.display()))
        }
        Err(e) => CheckResult::fail("Sessions", format!("{} (not writable: {e})", root.display())),
    }
}

/// Resolve `command` the way a shell would: as a path if it has a separator,
/// otherwise against `PATH`.
fn find_command(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

fn check_bridge(bridge: &BridgeConfig) -> CheckResult {
    match find_command(&bridge.command) {
        Some(path) => {
            let detail = match bridge.args.first() {
                Some(script) if !Path::new(script).exists() => {
                    return CheckResult::fail(
                        "Bridge",
                        format!("{} found, but {script} is missing", path.display()),
                    );
                }
                Some(script) => format!("{} {script}", path.display()),
                None => path.display().to_string(),
            };
            CheckResult::pass("Bridge", detail)
        }
        None => CheckResult::fail(
            "Bridge",
            format!("{} (NOT FOUND on PATH)", bridge.command),
        ),
    }
}

fn check_paste(paste: &PasteConfig) -> CheckResult {
    if paste.api_key.trim().is_empty() {
        CheckResult::fail(
            "Paste",
            "api_key missing (set [paste] api_key or PASTEBIN_API_KEY)",
        )
    } else {
        CheckResult::pass("Paste", format!("{} (key configured)", paste.api_url))
    }
}

async fn check_audit(audit: &AuditConfig) -> CheckResult {
    if !audit.enabled {
        return CheckResult::pass("Audit", "disabled");
    }

    let logger = match AuditLogger::open(&audit.db_path).await {
        Ok(l) => l,
        Err(e) => return CheckResult::fail("Audit", format!("FAILED: {e}")),
    };

    let since = Utc::now() - chrono::Duration::hours(24);
    match logger.outcome_counts(since).await {
        Ok(counts) => {
            let total: i64 = counts.iter().map(|(_, n)| n).sum();
            let breakdown = counts
                .iter()
                .map(|(outcome, n)| format!("{outcome} {n}"))
                .collect::<Vec<_>>()
                .join(", ");
            if total == 0 {
                CheckResult::pass("Audit", "accessible (no sessions in the last 24h)")
            } else {
                CheckResult::pass(
                    "Audit",
                    format!("accessible ({total} sessions in the last 24h: {breakdown})"),
                )
            }
        }
        Err(e) => CheckResult::fail("Audit", format!("FAILED: {e}")),
    }
}
