use async_trait::async_trait;
use diesel::prelude::*;

use anonchat_shared::clients::db::DbPool;

use super::{DomainEvent, EventSink, SinkError};
use crate::models::{NewReportRecord, NewSessionRecord};
use crate::schema::{reports, session_history};

/// Writes ended sessions and filed reports to Postgres.
///
/// Live state stays in the store; this is history only.
#[derive(Clone)]
pub struct PgArchive {
    db: DbPool,
}

impl PgArchive {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn session_record(event: &DomainEvent) -> Option<NewSessionRecord> {
    let DomainEvent::SessionEnded { session, reason, ended_by, ended_at } = event else {
        return None;
    };
    let duration = (*ended_at - session.created_at).num_seconds().clamp(0, i32::MAX as i64) as i32;
    Some(NewSessionRecord {
        pair_id: session.pair_id,
        member_a: session.member_a,
        member_b: session.member_b,
        started_at: session.created_at,
        ended_at: *ended_at,
        end_reason: reason.as_str().to_string(),
        ended_by: *ended_by,
        duration_secs: duration,
    })
}

fn report_record(event: &DomainEvent) -> Option<NewReportRecord> {
    let DomainEvent::ReportFiled { intent, reason } = event else {
        return None;
    };
    Some(NewReportRecord {
        pair_id: intent.pair_id,
        reporter_id: intent.reporter,
        reported_id: intent.target,
        reason: reason.clone(),
    })
}

#[async_trait]
impl EventSink for PgArchive {
    fn name(&self) -> &'static str {
        "postgres-archive"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let session = session_record(event);
        let report = report_record(event);
        if session.is_none() && report.is_none() {
            return Ok(());
        }

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SinkError> {
            let mut conn = db.get()?;
            if let Some(record) = session {
                diesel::insert_into(session_history::table)
                    .values(&record)
                    .on_conflict_do_nothing()
                    .execute(&mut conn)?;
                tracing::debug!(pair_id = %record.pair_id, "session archived");
            }
            if let Some(record) = report {
                diesel::insert_into(reports::table).values(&record).execute(&mut conn)?;
                tracing::debug!(pair_id = %record.pair_id, reported_id = %record.reported_id, "report archived");
            }
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::models::{EndReason, ReportIntent, Session};

    #[test]
    fn ended_session_maps_to_history_row() {
        let start = Utc::now();
        let session = Session::open(Uuid::from_u128(7), Uuid::from_u128(2), Uuid::from_u128(1), start);
        let event = DomainEvent::session_ended(
            session,
            EndReason::Reported,
            Some(Uuid::from_u128(2)),
            start + Duration::seconds(42),
        );

        let row = session_record(&event).unwrap();
        assert_eq!(row.member_a, Uuid::from_u128(1));
        assert_eq!(row.end_reason, "reported");
        assert_eq!(row.duration_secs, 42);
        assert!(report_record(&event).is_none());
    }

    #[test]
    fn report_maps_to_report_row() {
        let intent = ReportIntent {
            pair_id: Uuid::from_u128(7),
            reporter: Uuid::from_u128(1),
            target: Uuid::from_u128(2),
        };
        let event = DomainEvent::ReportFiled { intent, reason: "Spam".into() };

        let row = report_record(&event).unwrap();
        assert_eq!(row.reported_id, Uuid::from_u128(2));
        assert_eq!(row.reason, "Spam");
        assert!(session_record(&event).is_none());
    }
}
