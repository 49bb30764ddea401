use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{reports, session_history};

pub type UserId = Uuid;
pub type PairId = Uuid;

// --- UserProfile ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub language: String,
    pub warnings: u32,
    pub banned: bool,
    pub premium_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: UserId, language: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            language: language.into(),
            warnings: 0,
            banned: false,
            premium_expiry: None,
            created_at: now,
            last_active: now,
        }
    }
}

// --- WaitingEntry ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub user_id: UserId,
    pub language: String,
    pub enqueued_at: DateTime<Utc>,
}

impl WaitingEntry {
    pub fn new(user_id: UserId, language: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            language: language.into(),
            enqueued_at,
        }
    }
}

// --- Session ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// Why a session stopped. Stored with the ended session and in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A member pressed stop.
    Left,
    /// A member could no longer be reached by the gateway.
    Disconnected,
    /// A member filed a report.
    Reported,
    /// A member was banned.
    Banned,
    /// Nobody spoke for longer than the idle bound.
    Idle,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Left => "left",
            EndReason::Disconnected => "disconnected",
            EndReason::Reported => "reported",
            EndReason::Banned => "banned",
            EndReason::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub pair_id: PairId,
    pub member_a: UserId,
    pub member_b: UserId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Member who issued `/report` and has not yet given a reason.
    pub report_by: Option<UserId>,
}

impl Session {
    /// New active session with members in canonical order (smaller id first).
    pub fn open(pair_id: PairId, a: UserId, b: UserId, now: DateTime<Utc>) -> Self {
        let (member_a, member_b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            pair_id,
            member_a,
            member_b,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            report_by: None,
        }
    }

    pub fn has_member(&self, user: UserId) -> bool {
        self.member_a == user || self.member_b == user
    }

    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        if self.member_a == user {
            Some(self.member_b)
        } else if self.member_b == user {
            Some(self.member_a)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn report_intent(&self) -> Option<ReportIntent> {
        let reporter = self.report_by?;
        let target = self.partner_of(reporter)?;
        Some(ReportIntent { pair_id: self.pair_id, reporter, target })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportIntent {
    pub pair_id: PairId,
    pub reporter: UserId,
    pub target: UserId,
}

// --- Per-user state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchState {
    Idle,
    Searching,
    Paired,
    Banned,
}

// --- Archive rows ---

#[derive(Debug, Insertable)]
#[diesel(table_name = session_history)]
pub struct NewSessionRecord {
    pub pair_id: Uuid,
    pub member_a: Uuid,
    pub member_b: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: String,
    pub ended_by: Option<Uuid>,
    pub duration_secs: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reports)]
pub struct NewReportRecord {
    pub pair_id: Uuid,
    pub reporter_id: Uuid,
    pub reported_id: Uuid,
    pub reason: String,
}
