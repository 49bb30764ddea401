//! Premium expiry gate. Entitlements are issued elsewhere; this only tells a
//! user, once, that theirs ran out.

use chrono::{DateTime, Utc};

use crate::gateway::{NoticeKey, Outbound};
use crate::models::UserProfile;
use crate::store::{StoreResult, UserDirectory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PremiumStatus {
    None,
    Active(DateTime<Utc>),
    Expired(DateTime<Utc>),
}

pub fn check_premium(profile: &UserProfile, now: DateTime<Utc>) -> PremiumStatus {
    match profile.premium_expiry {
        None => PremiumStatus::None,
        Some(expiry) if expiry > now => PremiumStatus::Active(expiry),
        Some(expiry) => PremiumStatus::Expired(expiry),
    }
}

/// If the profile's premium has expired, clear it and return the notice.
/// The clear is compare-and-set on the observed expiry, so two concurrent
/// events for the same user surface it at most once.
pub async fn surface_expiry(
    users: &dyn UserDirectory,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> StoreResult<Option<Outbound>> {
    let PremiumStatus::Expired(expiry) = check_premium(profile, now) else {
        return Ok(None);
    };
    if !users.clear_premium_if(profile.user_id, expiry).await? {
        return Ok(None);
    }
    tracing::info!(user_id = %profile.user_id, expired_at = %expiry, "premium expired");
    Ok(Some(Outbound::notice(profile.user_id, NoticeKey::PremiumExpired)))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn status_follows_the_expiry() {
        let now = Utc::now();
        let mut profile = UserProfile::new(Uuid::nil(), "en", now);
        assert_eq!(check_premium(&profile, now), PremiumStatus::None);

        profile.premium_expiry = Some(now + Duration::days(1));
        assert!(matches!(check_premium(&profile, now), PremiumStatus::Active(_)));

        profile.premium_expiry = Some(now - Duration::seconds(1));
        assert!(matches!(check_premium(&profile, now), PremiumStatus::Expired(_)));
    }

    #[tokio::test]
    async fn expiry_is_surfaced_once() {
        let store = MemoryStore::new("en");
        let user = Uuid::from_u128(1);
        let now = Utc::now();
        store.set_premium_expiry(user, Some(now - Duration::hours(1))).await.unwrap();
        let profile = UserDirectory::touch(&store, user, "en", now).await.unwrap();

        let first = surface_expiry(&store, &profile, now).await.unwrap();
        let second = surface_expiry(&store, &profile, now).await.unwrap();

        assert_eq!(first, Some(Outbound::notice(user, NoticeKey::PremiumExpired)));
        assert_eq!(second, None);
        assert!(UserDirectory::get(&store, user).await.unwrap().unwrap().premium_expiry.is_none());
    }

    #[tokio::test]
    async fn active_premium_is_left_alone() {
        let store = MemoryStore::new("en");
        let user = Uuid::from_u128(1);
        let now = Utc::now();
        store.set_premium_expiry(user, Some(now + Duration::hours(1))).await.unwrap();
        let profile = UserDirectory::touch(&store, user, "en", now).await.unwrap();

        assert_eq!(surface_expiry(&store, &profile, now).await.unwrap(), None);
    }
}
