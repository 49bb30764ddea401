//! Report handling: `/report` records an intent on the active session, the
//! reporter's next text message files it as a warning against the partner.

use metrics::counter;

use anonchat_shared::errors::AppResult;

use crate::events::DomainEvent;
use crate::gateway::{NoticeKey, Outbound};
use crate::matching::MatchmakingEngine;
use crate::models::{EndReason, ReportIntent, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Reason menu shown, intent recorded.
    Pending,
    NotPaired,
}

/// What happened to a filed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiledReport {
    pub intent: ReportIntent,
    pub warnings: u32,
    pub banned: bool,
}

#[derive(Clone)]
pub struct ModerationWorkflow {
    engine: MatchmakingEngine,
}

impl ModerationWorkflow {
    pub fn new(engine: MatchmakingEngine) -> Self {
        Self { engine }
    }

    pub async fn report(&self, user: UserId) -> AppResult<ReportOutcome> {
        let recorded = match self.engine.sessions.lookup(user).await? {
            Some(session) => self.engine.sessions.set_report_intent(session.pair_id, user).await?,
            None => false,
        };

        if !recorded {
            self.engine.deliver(vec![Outbound::notice(user, NoticeKey::NotPaired)]).await;
            return Ok(ReportOutcome::NotPaired);
        }

        tracing::debug!(user_id = %user, "report intent recorded");
        self.engine.deliver(vec![Outbound::ReportMenu { to: user }]).await;
        Ok(ReportOutcome::Pending)
    }

    /// File the reporter's pending report with `reason`. Returns `None` when
    /// there is nothing pending, in which case the text is an ordinary message.
    pub async fn finalize_report(&self, reporter: UserId, reason: &str) -> AppResult<Option<FiledReport>> {
        let Some(session) = self.engine.sessions.lookup(reporter).await? else {
            return Ok(None);
        };
        let Some(intent) = self.engine.sessions.take_report_intent(session.pair_id, reporter).await? else {
            return Ok(None);
        };

        let warnings = self.engine.users.increment_warnings(intent.target).await?;
        tracing::info!(
            reporter = %intent.reporter,
            target = %intent.target,
            pair_id = %intent.pair_id,
            warnings,
            "report filed"
        );
        counter!("anonchat_warnings_total").increment(1);
        self.engine
            .events
            .publish_all(vec![
                DomainEvent::ReportFiled { intent, reason: reason.to_string() },
                DomainEvent::UserWarned { user_id: intent.target, warnings },
            ])
            .await;

        let ended = self
            .engine
            .close_session(&session, EndReason::Reported, Some(reporter))
            .await?;

        let mut outbox = Vec::new();
        if ended {
            outbox.push(Outbound::notice(reporter, NoticeKey::YouLeft));
        }
        outbox.push(Outbound::notice(reporter, NoticeKey::ReportSuccess));

        let banned = warnings >= self.engine.config().max_warnings;
        if !banned && ended {
            outbox.push(Outbound::notice(intent.target, NoticeKey::PartnerLeft));
        }
        self.engine.deliver(outbox).await;

        if banned {
            self.engine.ban_user(intent.target).await?;
        }

        Ok(Some(FiledReport { intent, warnings, banned }))
    }
}
