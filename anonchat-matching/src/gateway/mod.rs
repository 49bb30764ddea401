//! Outbound side of the messaging gateway.
//!
//! The core never formats text. It emits [`Outbound`] messages carrying a
//! [`NoticeKey`] and parameters; the gateway renders them in the recipient's
//! language and reports whether the recipient could be reached.

use async_trait::async_trait;

use crate::models::UserId;

pub mod i18n;
pub mod socket;

pub use self::i18n::Localizer;
pub use self::socket::SocketGateway;

/// Keys of the user-facing notices. The string form is the key in `lang.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKey {
    Hello,
    Help,
    Banned,
    AlreadyPaired,
    AlreadySearching,
    Searching,
    SearchStopped,
    PartnerFound,
    YouLeft,
    PartnerLeft,
    PartnerBanned,
    NotPaired,
    ReportSuccess,
    SendNext,
    SearchTimeout,
    SessionExpired,
    PremiumExpired,
}

impl NoticeKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKey::Hello => "hello",
            NoticeKey::Help => "helpText",
            NoticeKey::Banned => "banMessage",
            NoticeKey::AlreadyPaired => "inDialogueWarning",
            NoticeKey::AlreadySearching => "queue",
            NoticeKey::Searching => "partnerFinding",
            NoticeKey::SearchStopped => "searchStopped",
            NoticeKey::PartnerFound => "partnerFind",
            NoticeKey::YouLeft => "skipDialogue",
            NoticeKey::PartnerLeft => "partnerSkipDialogue",
            NoticeKey::PartnerBanned => "partnerBanned",
            NoticeKey::NotPaired => "dialogueHaveError",
            NoticeKey::ReportSuccess => "reportSuccess",
            NoticeKey::SendNext => "sendNext",
            NoticeKey::SearchTimeout => "searchTimeout",
            NoticeKey::SessionExpired => "sessionExpired",
            NoticeKey::PremiumExpired => "premiumExpired",
        }
    }
}

/// Key of the report prompt text.
pub const REPORT_PROMPT_KEY: &str = "reportOptions";
/// Key of the list of report reasons offered with the prompt.
pub const REPORT_REASONS_KEY: &str = "reportReasons";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Localised system notice.
    Notice {
        to: UserId,
        key: NoticeKey,
        params: Vec<(&'static str, String)>,
    },
    /// Partner text, relayed verbatim.
    Forward { to: UserId, text: String },
    /// Report prompt with the selectable reasons.
    ReportMenu { to: UserId },
}

impl Outbound {
    pub fn notice(to: UserId, key: NoticeKey) -> Self {
        Outbound::Notice { to, key, params: Vec::new() }
    }

    pub fn notice_with(to: UserId, key: NoticeKey, params: Vec<(&'static str, String)>) -> Self {
        Outbound::Notice { to, key, params }
    }

    pub fn recipient(&self) -> UserId {
        match self {
            Outbound::Notice { to, .. } | Outbound::Forward { to, .. } | Outbound::ReportMenu { to } => *to,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Nobody is connected for this user. Treated as an implicit disconnect.
    #[error("user {0} is unreachable")]
    Unreachable(UserId),

    /// Anything else. Logged and dropped; state is never rolled back.
    #[error("delivery failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Deliver one message rendered in `language`.
    async fn deliver(&self, message: &Outbound, language: &str) -> Result<(), DeliveryError>;
}
