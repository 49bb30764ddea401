use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all domain events published to the topic exchange.
///
/// Routing key format: `anonchat.{domain}.{entity}.{action}`
/// Example: `anonchat.matching.session.started`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

pub mod routing_keys {
    // Matching events
    pub const MATCHING_SESSION_STARTED: &str = "anonchat.matching.session.started";
    pub const MATCHING_SESSION_ENDED: &str = "anonchat.matching.session.ended";
    pub const MATCHING_SEARCH_TIMED_OUT: &str = "anonchat.matching.search.timed_out";

    // Moderation events
    pub const MODERATION_REPORT_FILED: &str = "anonchat.moderation.report.filed";
    pub const MODERATION_USER_WARNED: &str = "anonchat.moderation.user.warned";
    pub const MODERATION_USER_BANNED: &str = "anonchat.moderation.user.banned";
}

pub mod payloads {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionStarted {
        pub pair_id: Uuid,
        pub member_a: Uuid,
        pub member_b: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionEnded {
        pub pair_id: Uuid,
        pub member_a: Uuid,
        pub member_b: Uuid,
        pub started_at: DateTime<Utc>,
        pub ended_at: DateTime<Utc>,
        pub duration_secs: i64,
        pub end_reason: String,
        pub ended_by: Option<Uuid>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SearchTimedOut {
        pub user_id: Uuid,
        pub waited_secs: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReportFiled {
        pub pair_id: Uuid,
        pub reporter_id: Uuid,
        pub reported_id: Uuid,
        pub reason: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserWarned {
        pub user_id: Uuid,
        pub warnings: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserBanned {
        pub user_id: Uuid,
        pub warnings: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_routing_key_as_event_type() {
        let user = Uuid::new_v4();
        let evt = Event::new(
            "anonchat-matching",
            routing_keys::MODERATION_USER_BANNED,
            payloads::UserBanned { user_id: user, warnings: 3 },
        )
        .with_user(user);

        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["event_type"], "anonchat.moderation.user.banned");
        assert_eq!(json["data"]["warnings"], 3);
        assert_eq!(json["user_id"], serde_json::json!(user));
    }
}
