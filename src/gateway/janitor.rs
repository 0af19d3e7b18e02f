//! Janitor — periodically evicts sessions past the age limit and removes
//! workspace directories that no live session owns.

use super::session::CancelReason;
use super::workspace::sweep_orphans;
use super::Gateway;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info};

/// What one janitor pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub orphans: usize,
}

/// Background task: sweep every `janitor_interval` until aborted.
pub(super) async fn run(gateway: Gateway) {
    let interval = gateway.settings.janitor_interval;
    info!(
        "janitor: sweeping every {}s, max session age {}s",
        interval.as_secs(),
        gateway.settings.max_age.as_secs()
    );
    loop {
        tokio::time::sleep(interval).await;
        let report = sweep(&gateway, Utc::now()).await;
        if report.evicted > 0 || report.orphans > 0 {
            info!(
                "janitor: evicted {} session(s), removed {} orphaned workspace(s)",
                report.evicted, report.orphans
            );
        } else {
            debug!("janitor: nothing to clean");
        }
    }
}

/// Evict non-terminal sessions older than `max_age` at `now`, then remove
/// untracked workspace directories of the same age.
pub(super) async fn sweep(gateway: &Gateway, now: DateTime<Utc>) -> SweepReport {
    let max_age = gateway.settings.max_age;
    let mut report = SweepReport::default();

    for session in gateway.registry.snapshot() {
        if session.state().is_terminal() {
            continue;
        }
        let age = session.age(now).to_std().unwrap_or_default();
        if age > max_age {
            info!(
                "janitor: evicting session {} after {}s",
                session.id,
                age.as_secs()
            );
            gateway.force_release(&session, CancelReason::Evicted).await;
            report.evicted += 1;
        }
    }

    let tracked: HashSet<String> = gateway
        .registry
        .snapshot()
        .iter()
        .map(|s| s.id.clone())
        .collect();
    report.orphans = sweep_orphans(&gateway.settings.sessions_root, &tracked, max_age)
        .await
        .len();

    report
}
