//! Redis-backed store.
//!
//! Keys:
//! - `anonchat:user:{id}`         hash, the user profile
//! - `anonchat:waiting`           zset, member = user id, score = enqueued_at (ms)
//! - `anonchat:waiting:lang`      hash, user id -> language
//! - `anonchat:session:{pair}`    hash, the session record
//! - `anonchat:member:{id}`       string, user id -> active pair id
//! - `anonchat:sessions:active`   zset, pair id -> last activity (ms)
//!
//! Every transition that touches more than one key is a Lua script, so Redis
//! runs it as one atomic step. `MATCH_OR_ENQUEUE_LUA` derives member and
//! session keys from prefixes inside the script, which needs a single Redis
//! node rather than a cluster.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::Script;
use uuid::Uuid;

use anonchat_shared::clients::redis::RedisClient;

use super::{Enqueued, Placement, SessionRegistry, StoreError, StoreResult, UserDirectory, WaitingPool};
use crate::models::{
    EndReason, PairId, ReportIntent, Session, SessionStatus, UserId, UserProfile, WaitingEntry,
};

const USER_PREFIX: &str = "anonchat:user";
const WAITING_KEY: &str = "anonchat:waiting";
const WAITING_LANG_KEY: &str = "anonchat:waiting:lang";
const SESSION_PREFIX: &str = "anonchat:session";
const MEMBER_PREFIX: &str = "anonchat:member";
const ACTIVE_SESSIONS_KEY: &str = "anonchat:sessions:active";

/// Ended sessions stay readable for a day, then Redis drops them.
const ENDED_SESSION_TTL_SECS: i64 = 86_400;

// KEYS: waiting, waiting_lang, member:{user}
// ARGV: user, language, enqueued_at_ms
const ENQUEUE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then return -1 end
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then return 0 end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 1
"#;

// KEYS: waiting, waiting_lang
// ARGV: caller, language, not_before_ms
// Returns {candidate, language, enqueued_at_ms} or nil.
const MATCH_AND_REMOVE_LUA: &str = r#"
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[3], '+inf', 'WITHSCORES')
local picked, picked_score, picked_lang
for i = 1, #entries, 2 do
  local id = entries[i]
  if id ~= ARGV[1] then
    local lang = redis.call('HGET', KEYS[2], id)
    if lang == ARGV[2] then
      picked, picked_score, picked_lang = id, entries[i + 1], lang
      break
    end
    if not picked then
      picked, picked_score, picked_lang = id, entries[i + 1], lang
    end
  end
end
if not picked then return nil end
redis.call('ZREM', KEYS[1], ARGV[1], picked)
redis.call('HDEL', KEYS[2], ARGV[1], picked)
return {picked, picked_lang or '', picked_score}
"#;

// KEYS: waiting, waiting_lang, sessions_active
// ARGV: caller, language, enqueued_at_ms, not_before_ms, pair, member_prefix, session_prefix
// Returns {'in_session'}, {'already_waiting'}, {'waiting'} or
// {'paired', partner, language, enqueued_at_ms}.
const MATCH_OR_ENQUEUE_LUA: &str = r#"
local member = ARGV[6] .. ':'
if redis.call('EXISTS', member .. ARGV[1]) == 1 then return {'in_session'} end
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then return {'already_waiting'} end
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[4], '+inf', 'WITHSCORES')
local picked, picked_score, picked_lang
for i = 1, #entries, 2 do
  local id = entries[i]
  if id ~= ARGV[1] and redis.call('EXISTS', member .. id) == 0 then
    local lang = redis.call('HGET', KEYS[2], id)
    if lang == ARGV[2] then
      picked, picked_score, picked_lang = id, entries[i + 1], lang
      break
    end
    if not picked then
      picked, picked_score, picked_lang = id, entries[i + 1], lang
    end
  end
end
if not picked then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
  redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
  return {'waiting'}
end
redis.call('ZREM', KEYS[1], picked)
redis.call('HDEL', KEYS[2], picked)
local a, b = ARGV[1], picked
if b < a then a, b = b, a end
redis.call('SET', member .. a, ARGV[5])
redis.call('SET', member .. b, ARGV[5])
redis.call('HSET', ARGV[7] .. ':' .. ARGV[5],
  'member_a', a, 'member_b', b, 'status', 'active',
  'created_at', ARGV[3], 'last_activity', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[5])
return {'paired', picked, picked_lang or '', picked_score}
"#;

// KEYS: waiting, waiting_lang
// ARGV: user
const CANCEL_LUA: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return removed
"#;

// KEYS: waiting, waiting_lang
// ARGV: cutoff_ms (exclusive)
// Returns a flat list {id, language, enqueued_at_ms, ...}.
const EXPIRE_LUA: &str = r#"
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'WITHSCORES')
local out = {}
for i = 1, #entries, 2 do
  local id = entries[i]
  local lang = redis.call('HGET', KEYS[2], id) or ''
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  table.insert(out, id)
  table.insert(out, lang)
  table.insert(out, entries[i + 1])
end
return out
"#;

// KEYS: member:{a}, member:{b}, session:{pair}, sessions_active
// ARGV: pair, member_a, member_b, now_ms
// Returns 0 when a is paired, 1 when b is paired, 2 when created.
const CREATE_SESSION_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
if redis.call('EXISTS', KEYS[2]) == 1 then return 1 end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3],
  'member_a', ARGV[2], 'member_b', ARGV[3], 'status', 'active',
  'created_at', ARGV[4], 'last_activity', ARGV[4])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 2
"#;

// KEYS: session:{pair}, sessions_active, member:{a}, member:{b}
// ARGV: pair, reason, now_ms, ended_ttl_secs
const END_SESSION_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'active' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'ended', 'end_reason', ARGV[2], 'ended_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'report_by')
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('ZREM', KEYS[2], ARGV[1])
for i = 3, 4 do
  if redis.call('GET', KEYS[i]) == ARGV[1] then redis.call('DEL', KEYS[i]) end
end
return 1
"#;

// KEYS: session:{pair}, sessions_active
// ARGV: pair, now_ms
const TOUCH_SESSION_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'active' then return 0 end
redis.call('HSET', KEYS[1], 'last_activity', ARGV[2])
redis.call('ZADD', KEYS[2], 'XX', ARGV[2], ARGV[1])
return 1
"#;

// KEYS: session:{pair}
// ARGV: reporter
const SET_REPORT_LUA: &str = r#"
local s = redis.call('HMGET', KEYS[1], 'status', 'member_a', 'member_b')
if s[1] ~= 'active' then return 0 end
if s[2] ~= ARGV[1] and s[3] ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'report_by', ARGV[1])
return 1
"#;

// KEYS: session:{pair}
// ARGV: reporter
const TAKE_REPORT_LUA: &str = r#"
local s = redis.call('HMGET', KEYS[1], 'status', 'report_by')
if s[1] ~= 'active' or s[2] ~= ARGV[1] then return 0 end
redis.call('HDEL', KEYS[1], 'report_by')
return 1
"#;

// KEYS: user:{id}
// ARGV: expected_expiry_ms
const CLEAR_PREMIUM_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'premium_expiry') ~= ARGV[1] then return 0 end
redis.call('HDEL', KEYS[1], 'premium_expiry')
return 1
"#;

/// Queue the default fields of a profile that may not exist yet. `HSETNX`
/// leaves fields that are already set alone.
fn seed_profile<'a>(pipe: &'a mut redis::Pipeline, key: &str, language: &str, now_ms: i64) -> &'a mut redis::Pipeline {
    pipe.hset_nx(key, "language", language)
        .ignore()
        .hset_nx(key, "warnings", 0)
        .ignore()
        .hset_nx(key, "banned", 0)
        .ignore()
        .hset_nx(key, "created_at", now_ms)
        .ignore()
        .hset_nx(key, "last_active", now_ms)
        .ignore()
}

fn user_key(user: UserId) -> String {
    format!("{USER_PREFIX}:{user}")
}

fn session_key(pair_id: PairId) -> String {
    format!("{SESSION_PREFIX}:{pair_id}")
}

fn member_key(user: UserId) -> String {
    format!("{MEMBER_PREFIX}:{user}")
}

fn millis_to_datetime(key: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("timestamp out of range: {ms}"),
    })
}

fn parse_field<T: FromStr>(key: &str, fields: &HashMap<String, String>, name: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw = fields.get(name).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("missing field {name}"),
    })?;
    raw.parse::<T>().map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("field {name}: {e}"),
    })
}

fn parse_time(key: &str, fields: &HashMap<String, String>, name: &str) -> StoreResult<DateTime<Utc>> {
    millis_to_datetime(key, parse_field::<i64>(key, fields, name)?)
}

fn parse_profile(
    user: UserId,
    key: &str,
    fields: &HashMap<String, String>,
    default_language: &str,
) -> StoreResult<UserProfile> {
    let premium_expiry = match fields.get("premium_expiry") {
        Some(_) => Some(parse_time(key, fields, "premium_expiry")?),
        None => None,
    };
    Ok(UserProfile {
        user_id: user,
        language: fields.get("language").cloned().unwrap_or_else(|| default_language.into()),
        warnings: fields.get("warnings").map(|_| parse_field(key, fields, "warnings")).transpose()?.unwrap_or(0),
        banned: fields.get("banned").map(|v| v == "1").unwrap_or(false),
        premium_expiry,
        created_at: parse_time(key, fields, "created_at")?,
        last_active: parse_time(key, fields, "last_active")?,
    })
}

fn parse_session(pair_id: PairId, key: &str, fields: &HashMap<String, String>) -> StoreResult<Session> {
    let status: String = parse_field(key, fields, "status")?;
    let status = SessionStatus::from_str(&status).map_err(|reason| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    })?;
    let report_by = match fields.get("report_by") {
        Some(_) => Some(parse_field::<Uuid>(key, fields, "report_by")?),
        None => None,
    };
    Ok(Session {
        pair_id,
        member_a: parse_field(key, fields, "member_a")?,
        member_b: parse_field(key, fields, "member_b")?,
        status,
        created_at: parse_time(key, fields, "created_at")?,
        last_activity: parse_time(key, fields, "last_activity")?,
        report_by,
    })
}

/// Decode `{id, language, enqueued_at_ms}` triples returned by the pool scripts.
fn parse_entries(flat: Vec<String>) -> StoreResult<Vec<WaitingEntry>> {
    flat.chunks(3)
        .map(|chunk| match chunk {
            [id, language, score] => {
                let user_id = Uuid::parse_str(id).map_err(|e| StoreError::Corrupt {
                    key: WAITING_KEY.to_string(),
                    reason: format!("member {id}: {e}"),
                })?;
                // ZSET scores come back as floats
                let ms = score.parse::<f64>().map_err(|e| StoreError::Corrupt {
                    key: WAITING_KEY.to_string(),
                    reason: format!("score {score}: {e}"),
                })? as i64;
                Ok(WaitingEntry::new(user_id, language.as_str(), millis_to_datetime(WAITING_KEY, ms)?))
            }
            _ => Err(StoreError::Corrupt {
                key: WAITING_KEY.to_string(),
                reason: "truncated entry list".into(),
            }),
        })
        .collect()
}

pub struct RedisStore {
    redis: RedisClient,
    /// Language of profiles created implicitly by moderation or premium writes.
    default_language: String,
    enqueue: Script,
    match_and_remove: Script,
    match_or_enqueue: Script,
    cancel: Script,
    expire: Script,
    create_session: Script,
    end_session: Script,
    touch_session: Script,
    set_report: Script,
    take_report: Script,
    clear_premium: Script,
}

impl RedisStore {
    pub fn new(redis: RedisClient, default_language: impl Into<String>) -> Self {
        Self {
            redis,
            default_language: default_language.into(),
            enqueue: Script::new(ENQUEUE_LUA),
            match_and_remove: Script::new(MATCH_AND_REMOVE_LUA),
            match_or_enqueue: Script::new(MATCH_OR_ENQUEUE_LUA),
            cancel: Script::new(CANCEL_LUA),
            expire: Script::new(EXPIRE_LUA),
            create_session: Script::new(CREATE_SESSION_LUA),
            end_session: Script::new(END_SESSION_LUA),
            touch_session: Script::new(TOUCH_SESSION_LUA),
            set_report: Script::new(SET_REPORT_LUA),
            take_report: Script::new(TAKE_REPORT_LUA),
            clear_premium: Script::new(CLEAR_PREMIUM_LUA),
        }
    }

    async fn load_session(&self, pair_id: PairId) -> StoreResult<Option<Session>> {
        let key = session_key(pair_id);
        let fields = self.redis.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_session(pair_id, &key, &fields).map(Some)
    }
}

#[async_trait]
impl UserDirectory for RedisStore {
    async fn touch(&self, user: UserId, default_language: &str, now: DateTime<Utc>) -> StoreResult<UserProfile> {
        let key = user_key(user);
        let now_ms = now.timestamp_millis();
        let mut conn = self.redis.connection();

        let mut pipe = redis::pipe();
        pipe.atomic();
        seed_profile(&mut pipe, &key, default_language, now_ms)
            .hset(&key, "last_active", now_ms)
            .ignore()
            .hgetall(&key);
        let (fields,): (HashMap<String, String>,) = pipe.query_async(&mut conn).await?;

        parse_profile(user, &key, &fields, default_language)
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<UserProfile>> {
        let key = user_key(user);
        let fields = self.redis.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_profile(user, &key, &fields, &self.default_language).map(Some)
    }

    async fn set_language(&self, user: UserId, language: &str) -> StoreResult<()> {
        let key = user_key(user);
        let mut pipe = redis::pipe();
        pipe.atomic();
        seed_profile(&mut pipe, &key, language, Utc::now().timestamp_millis())
            .hset(&key, "language", language)
            .ignore();
        let () = pipe.query_async(&mut self.redis.connection()).await?;
        Ok(())
    }

    async fn increment_warnings(&self, user: UserId) -> StoreResult<u32> {
        let key = user_key(user);
        let mut pipe = redis::pipe();
        pipe.atomic();
        seed_profile(&mut pipe, &key, &self.default_language, Utc::now().timestamp_millis()).hincr(&key, "warnings", 1);
        let (count,): (i64,) = pipe.query_async(&mut self.redis.connection()).await?;
        Ok(count.max(0) as u32)
    }

    async fn set_banned(&self, user: UserId) -> StoreResult<()> {
        let key = user_key(user);
        let mut pipe = redis::pipe();
        pipe.atomic();
        seed_profile(&mut pipe, &key, &self.default_language, Utc::now().timestamp_millis())
            .hset(&key, "banned", 1)
            .ignore();
        let () = pipe.query_async(&mut self.redis.connection()).await?;
        Ok(())
    }

    async fn set_premium_expiry(&self, user: UserId, expiry: Option<DateTime<Utc>>) -> StoreResult<()> {
        let key = user_key(user);
        let mut pipe = redis::pipe();
        pipe.atomic();
        seed_profile(&mut pipe, &key, &self.default_language, Utc::now().timestamp_millis());
        match expiry {
            Some(at) => pipe.hset(&key, "premium_expiry", at.timestamp_millis()).ignore(),
            None => pipe.hdel(&key, "premium_expiry").ignore(),
        };
        let () = pipe.query_async(&mut self.redis.connection()).await?;
        Ok(())
    }

    async fn clear_premium_if(&self, user: UserId, expected: DateTime<Utc>) -> StoreResult<bool> {
        let cleared: i64 = self
            .redis
            .eval(&self.clear_premium, &[user_key(user)], &[expected.timestamp_millis()])
            .await?;
        Ok(cleared == 1)
    }
}

#[async_trait]
impl WaitingPool for RedisStore {
    async fn enqueue(&self, entry: WaitingEntry) -> StoreResult<Enqueued> {
        let keys = [WAITING_KEY.to_string(), WAITING_LANG_KEY.to_string(), member_key(entry.user_id)];
        let args = [
            entry.user_id.to_string(),
            entry.language.clone(),
            entry.enqueued_at.timestamp_millis().to_string(),
        ];
        let result: i64 = self.redis.eval(&self.enqueue, &keys, &args).await?;
        Ok(match result {
            1 => Enqueued::Added,
            0 => Enqueued::AlreadyWaiting,
            _ => Enqueued::InSession,
        })
    }

    async fn match_and_remove(
        &self,
        user: UserId,
        language: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<WaitingEntry>> {
        let args = [user.to_string(), language.to_string(), not_before.timestamp_millis().to_string()];
        let picked: Option<Vec<String>> = self
            .redis
            .eval(&self.match_and_remove, &[WAITING_KEY, WAITING_LANG_KEY], &args)
            .await?;
        match picked {
            Some(flat) => Ok(parse_entries(flat)?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn match_or_enqueue(&self, entry: WaitingEntry, not_before: DateTime<Utc>) -> StoreResult<Placement> {
        let pair_id = Uuid::now_v7();
        let args = [
            entry.user_id.to_string(),
            entry.language.clone(),
            entry.enqueued_at.timestamp_millis().to_string(),
            not_before.timestamp_millis().to_string(),
            pair_id.to_string(),
            MEMBER_PREFIX.to_string(),
            SESSION_PREFIX.to_string(),
        ];
        let mut reply: Vec<String> = self
            .redis
            .eval(&self.match_or_enqueue, &[WAITING_KEY, WAITING_LANG_KEY, ACTIVE_SESSIONS_KEY], &args)
            .await?;

        let tag = if reply.is_empty() { String::new() } else { reply.remove(0) };
        match tag.as_str() {
            "waiting" => Ok(Placement::Waiting),
            "already_waiting" => Ok(Placement::AlreadyWaiting),
            "in_session" => Ok(Placement::InSession),
            "paired" => {
                let partner = parse_entries(reply)?.into_iter().next().ok_or_else(|| StoreError::Corrupt {
                    key: WAITING_KEY.to_string(),
                    reason: "pairing reply without a partner".into(),
                })?;
                let session = Session::open(pair_id, entry.user_id, partner.user_id, entry.enqueued_at);
                Ok(Placement::Paired { session, partner })
            }
            other => Err(StoreError::Corrupt {
                key: WAITING_KEY.to_string(),
                reason: format!("unexpected match reply {other:?}"),
            }),
        }
    }

    async fn cancel(&self, user: UserId) -> StoreResult<bool> {
        let removed: i64 = self
            .redis
            .eval(&self.cancel, &[WAITING_KEY, WAITING_LANG_KEY], &[user.to_string()])
            .await?;
        Ok(removed == 1)
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<WaitingEntry>> {
        let member = user.to_string();
        let mut conn = self.redis.connection();
        let (score, language): (Option<f64>, Option<String>) = redis::pipe()
            .atomic()
            .zscore(WAITING_KEY, &member)
            .hget(WAITING_LANG_KEY, &member)
            .query_async(&mut conn)
            .await?;

        match score {
            Some(ms) => Ok(Some(WaitingEntry::new(
                user,
                language.unwrap_or_default(),
                millis_to_datetime(WAITING_KEY, ms as i64)?,
            ))),
            None => Ok(None),
        }
    }

    async fn expire(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WaitingEntry>> {
        let flat: Vec<String> = self
            .redis
            .eval(&self.expire, &[WAITING_KEY, WAITING_LANG_KEY], &[cutoff.timestamp_millis()])
            .await?;
        parse_entries(flat)
    }

    async fn len(&self) -> StoreResult<u64> {
        Ok(self.redis.zcard(WAITING_KEY).await?)
    }
}

#[async_trait]
impl SessionRegistry for RedisStore {
    async fn create(&self, a: UserId, b: UserId, now: DateTime<Utc>) -> StoreResult<Session> {
        let session = Session::open(Uuid::now_v7(), a, b, now);
        let keys = [
            member_key(session.member_a),
            member_key(session.member_b),
            session_key(session.pair_id),
            ACTIVE_SESSIONS_KEY.to_string(),
        ];
        let args = [
            session.pair_id.to_string(),
            session.member_a.to_string(),
            session.member_b.to_string(),
            now.timestamp_millis().to_string(),
        ];
        let result: i64 = self.redis.eval(&self.create_session, &keys, &args).await?;
        match result {
            2 => Ok(session),
            0 => Err(StoreError::Conflict(session.member_a)),
            _ => Err(StoreError::Conflict(session.member_b)),
        }
    }

    async fn lookup(&self, user: UserId) -> StoreResult<Option<Session>> {
        let Some(pair) = self.redis.get(&member_key(user)).await? else {
            return Ok(None);
        };
        let pair_id = Uuid::parse_str(&pair).map_err(|e| StoreError::Corrupt {
            key: member_key(user),
            reason: e.to_string(),
        })?;
        // the session may have ended between the two reads
        Ok(self
            .load_session(pair_id)
            .await?
            .filter(|s| s.is_active() && s.has_member(user)))
    }

    async fn end(&self, pair_id: PairId, reason: EndReason, now: DateTime<Utc>) -> StoreResult<Option<Session>> {
        let Some(session) = self.load_session(pair_id).await? else {
            return Ok(None);
        };
        if !session.is_active() {
            return Ok(None);
        }

        let keys = [
            session_key(pair_id),
            ACTIVE_SESSIONS_KEY.to_string(),
            member_key(session.member_a),
            member_key(session.member_b),
        ];
        let args = [
            pair_id.to_string(),
            reason.as_str().to_string(),
            now.timestamp_millis().to_string(),
            ENDED_SESSION_TTL_SECS.to_string(),
        ];
        let ended: i64 = self.redis.eval(&self.end_session, &keys, &args).await?;
        Ok((ended == 1).then_some(session))
    }

    async fn touch(&self, pair_id: PairId, now: DateTime<Utc>) -> StoreResult<()> {
        let keys = [session_key(pair_id), ACTIVE_SESSIONS_KEY.to_string()];
        let args = [pair_id.to_string(), now.timestamp_millis().to_string()];
        let _: i64 = self.redis.eval(&self.touch_session, &keys, &args).await?;
        Ok(())
    }

    async fn set_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<bool> {
        let set: i64 = self
            .redis
            .eval(&self.set_report, &[session_key(pair_id)], &[reporter.to_string()])
            .await?;
        Ok(set == 1)
    }

    async fn take_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<Option<ReportIntent>> {
        let taken: i64 = self
            .redis
            .eval(&self.take_report, &[session_key(pair_id)], &[reporter.to_string()])
            .await?;
        if taken != 1 {
            return Ok(None);
        }
        // members never change, so reading them after the take is safe
        let target = self.load_session(pair_id).await?.and_then(|s| s.partner_of(reporter));
        Ok(target.map(|target| ReportIntent { pair_id, reporter, target }))
    }

    async fn stale(&self, idle_before: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        let max = format!("({}", idle_before.timestamp_millis());
        let pairs = self.redis.zrangebyscore(ACTIVE_SESSIONS_KEY, "-inf", &max).await?;

        let mut sessions = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let Ok(pair_id) = Uuid::parse_str(&pair) else {
                tracing::warn!(member = %pair, "skipping malformed active session entry");
                continue;
            };
            if let Some(session) = self.load_session(pair_id).await? {
                if session.is_active() {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn active_count(&self) -> StoreResult<u64> {
        Ok(self.redis.zcard(ACTIVE_SESSIONS_KEY).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_session_hash() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let pair = Uuid::from_u128(10);
        let f = fields(&[
            ("member_a", &a.to_string()),
            ("member_b", &b.to_string()),
            ("status", "active"),
            ("created_at", "1700000000000"),
            ("last_activity", "1700000005000"),
            ("report_by", &b.to_string()),
        ]);

        let s = parse_session(pair, "k", &f).unwrap();
        assert!(s.is_active());
        assert_eq!(s.report_intent().unwrap().target, a);
        assert_eq!((s.last_activity - s.created_at).num_seconds(), 5);
    }

    #[test]
    fn session_without_status_is_corrupt() {
        let f = fields(&[("member_a", "x")]);
        let err = parse_session(Uuid::nil(), "anonchat:session:0", &f).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn parses_profile_defaults() {
        let f = fields(&[("created_at", "1700000000000"), ("last_active", "1700000000000")]);
        let p = parse_profile(Uuid::nil(), "k", &f, "ru").unwrap();
        assert_eq!(p.language, "ru");
        assert_eq!(p.warnings, 0);
        assert!(!p.banned);
        assert!(p.premium_expiry.is_none());
    }

    #[test]
    fn parses_script_entry_triples() {
        let id = Uuid::from_u128(5);
        let entries = parse_entries(vec![id.to_string(), "en".into(), "1700000000000".into()]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, id);
        assert_eq!(entries[0].language, "en");

        assert!(parse_entries(vec![id.to_string(), "en".into()]).is_err());
    }

    /// Runs the shared store cases against a real server. Each case flushes
    /// the selected database first, so point the variable at a disposable one.
    #[tokio::test]
    #[ignore = "needs a disposable Redis in ANONCHAT_TEST_REDIS_URL"]
    async fn redis_store_matches_the_memory_store() {
        use crate::store::contract;

        let url = std::env::var("ANONCHAT_TEST_REDIS_URL").expect("ANONCHAT_TEST_REDIS_URL not set");
        let client = RedisClient::connect(&url).await.unwrap();

        async fn fresh(client: &RedisClient, default_language: &str) -> RedisStore {
            let () = redis::cmd("FLUSHDB").query_async(&mut client.connection()).await.unwrap();
            RedisStore::new(client.clone(), default_language)
        }

        contract::match_prefers_same_language_then_oldest(&fresh(&client, "en").await).await;
        contract::match_skips_entries_past_the_window(&fresh(&client, "en").await).await;
        contract::match_removes_the_caller_as_well(&fresh(&client, "en").await).await;
        contract::enqueue_rejects_duplicates_and_paired_users(&fresh(&client, "en").await).await;
        contract::match_or_enqueue_waits_then_pairs(&fresh(&client, "en").await).await;
        contract::match_or_enqueue_skips_paired_and_expired_entries(&fresh(&client, "en").await).await;
        contract::create_conflicts_when_a_member_is_paired(&fresh(&client, "en").await).await;
        contract::end_frees_both_members_once(&fresh(&client, "en").await).await;
        contract::report_intent_is_single_use(&fresh(&client, "en").await).await;
        contract::stale_lists_only_idle_active_sessions(&fresh(&client, "en").await).await;
        contract::warnings_increment_and_premium_clears_once(&fresh(&client, "en").await).await;
        contract::implicit_profiles_use_the_configured_language(&fresh(&client, "ru").await, "ru").await;
    }
}
