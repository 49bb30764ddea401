use std::time::Duration;

use metrics::gauge;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::{now, MatchmakingEngine};
use crate::gateway::{NoticeKey, Outbound};
use crate::models::EndReason;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_searches: usize,
    pub idle_sessions: usize,
}

impl MatchmakingEngine {
    /// One reconciliation pass: drop waiting entries past the wait window and
    /// end sessions nobody has spoken in for longer than the idle bound.
    pub async fn sweep(&self) -> anonchat_shared::errors::AppResult<SweepReport> {
        let now = now();
        let mut report = SweepReport::default();
        let mut outbox = Vec::new();

        let cutoff = now - chrono::Duration::from_std(self.config().wait_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        for entry in self.pool.expire(cutoff).await? {
            self.timers.cancel(entry.user_id);
            outbox.extend(self.search_expired(&entry).await);
            report.expired_searches += 1;
        }

        let idle_before = now - chrono::Duration::from_std(self.config().session_idle).unwrap_or_else(|_| chrono::Duration::zero());
        for session in self.sessions.stale(idle_before).await? {
            if self.close_session(&session, EndReason::Idle, None).await? {
                outbox.push(Outbound::notice(session.member_a, NoticeKey::SessionExpired));
                outbox.push(Outbound::notice(session.member_b, NoticeKey::SessionExpired));
                report.idle_sessions += 1;
            }
        }

        self.deliver(outbox).await;

        gauge!("anonchat_waiting_users").set(self.pool.len().await? as f64);
        gauge!("anonchat_active_sessions").set(self.sessions.active_count().await? as f64);

        Ok(report)
    }
}

/// Run [`MatchmakingEngine::sweep`] every `interval` until `shutdown` fires.
pub async fn run(engine: MatchmakingEngine, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(interval_secs = interval.as_secs(), "sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match engine.sweep().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            expired_searches = report.expired_searches,
                            idle_sessions = report.idle_sessions,
                            "sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "sweep failed"),
                }
            }
        }
    }

    tracing::info!("sweeper stopped");
}
