//! Redis-backed [`HotStateCache`], implementing the CAS contract of §4.2 as
//! literal Lua scripts run via `EVAL` so the read-verify-mutate-reindex
//! sequence is atomic from Redis's perspective.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::config::RedisCacheConfig;
use crate::model::{AlertState, AlertStatus, HealthState, ObservationWindow};
use crate::{ControlPlaneError, Result};

use super::{AlertCacheRecord, CasOutcome, HotStateCache, ServiceCacheRecord};

const ALERT_STATE_INDEX_PREFIX: &str = "alert:index:alert_state:";
const ALERT_STATUS_INDEX_PREFIX: &str = "alert:index:";
const ALERT_SVC_INDEX_PREFIX: &str = "alert:index:svc:";
const HEALTH_INDEX_PREFIX: &str = "service_state:index:health:";

fn alert_key(id: &str) -> String {
    format!("alert:issue:{id}")
}

fn service_key(service: &str, version: &str) -> String {
    format!("service_state:{service}:{version}")
}

fn observation_key(service: &str, version: &str) -> String {
    format!("observation:{service}:{version}")
}

/// Buffer added to an observation window's duration before it becomes TTL,
/// guarding against clock skew and stalled consumers (§4.6).
const OBSERVATION_TTL_BUFFER: std::time::Duration = std::time::Duration::from_secs(5 * 60);

fn alert_state_str(s: AlertState) -> &'static str {
    match s {
        AlertState::Pending => "Pending",
        AlertState::InProcessing => "InProcessing",
        AlertState::Restored => "Restored",
    }
}

fn status_str(s: AlertStatus) -> &'static str {
    match s {
        AlertStatus::Open => "open",
        AlertStatus::Closed => "closed",
    }
}

fn health_str(h: HealthState) -> &'static str {
    match h {
        HealthState::Normal => "Normal",
        HealthState::Warning => "Warning",
        HealthState::Error => "Error",
    }
}

/// CAS `alert:issue:{id}`: verifies `ARGV[2]` (empty string means "no
/// expectation") against the decoded record's `alert_state`, then mutates
/// `alert_state` (and `state`, when `ARGV[4]` is non-empty) and moves the id
/// between the alert_state/open-closed/per-service secondary index sets.
const CAS_ALERT_STATE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local rec = cjson.decode(raw)
if ARGV[2] ~= '' and rec.alert_state ~= ARGV[2] then return -1 end

local old_state = rec.alert_state
rec.alert_state = ARGV[3]
redis.call('SREM', ARGV[5] .. old_state, ARGV[1])
redis.call('SADD', ARGV[5] .. ARGV[3], ARGV[1])

if ARGV[4] ~= '' then
    local old_status = rec.state
    rec.state = ARGV[4]
    redis.call('SREM', ARGV[6] .. old_status, ARGV[1])
    redis.call('SADD', ARGV[6] .. ARGV[4], ARGV[1])
    redis.call('SREM', ARGV[7] .. rec.service .. ':' .. old_status, ARGV[1])
    redis.call('SADD', ARGV[7] .. rec.service .. ':' .. ARGV[4], ARGV[1])
end

redis.call('SET', KEYS[1], cjson.encode(rec))
return 1
"#;

/// CAS `service_state:{service}:{version}`: a missing prior record is
/// treated as `{}` and created (never returns `Missing`). Upserts
/// `health_state` (and `resolved_at` when `ARGV[4]` is non-empty) and moves
/// the key between `service_state:index:health:*` sets.
const CAS_SERVICE_HEALTH_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local rec
if raw then
    rec = cjson.decode(raw)
else
    rec = {}
end

local old_health = rec.health_state
rec.service = ARGV[1]
rec.version = ARGV[2]
rec.health_state = ARGV[3]
if ARGV[4] ~= '' then
    rec.resolved_at = ARGV[4]
end

if old_health then
    redis.call('SREM', ARGV[5] .. old_health, KEYS[1])
end
redis.call('SADD', ARGV[5] .. ARGV[3], KEYS[1])
redis.call('SET', KEYS[1], cjson.encode(rec))
return 1
"#;

/// Redis-backed implementation of [`HotStateCache`].
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.addr.as_str())
            .map_err(|e| ControlPlaneError::Invalid(format!("redis url: {e}")))?;
        let mut conn = ConnectionManager::new(client).await?;
        if config.db != 0 {
            redis::cmd("SELECT").arg(config.db).query_async::<_, ()>(&mut conn).await?;
        }
        if let Some(password) = &config.password {
            redis::cmd("AUTH").arg(password).query_async::<_, ()>(&mut conn).await?;
        }
        Ok(Self { conn })
    }
}

#[async_trait]
impl HotStateCache for RedisCache {
    async fn put_alert_record(&self, record: AlertCacheRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = alert_key(&record.id);
        let state_key = alert_state_str(record.alert_state);
        let status_key = status_str(record.state);
        let payload = serde_json::to_string(&record)
            .map_err(|e| ControlPlaneError::Invalid(format!("encode alert record: {e}")))?;

        let _: () = conn.set(&key, payload).await?;
        let _: () = conn
            .sadd(format!("{ALERT_STATE_INDEX_PREFIX}{state_key}"), &record.id)
            .await?;
        let _: () = conn
            .sadd(format!("{ALERT_STATUS_INDEX_PREFIX}{status_key}"), &record.id)
            .await?;
        let _: () = conn
            .sadd(
                format!("{ALERT_SVC_INDEX_PREFIX}{}:{status_key}", record.service),
                &record.id,
            )
            .await?;
        Ok(())
    }

    async fn get_alert_record(&self, id: &str) -> Result<Option<AlertCacheRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(alert_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                ControlPlaneError::Invalid(format!("decode alert record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn cas_alert_state(
        &self,
        id: &str,
        expected: Option<AlertState>,
        new_state: AlertState,
        new_status: Option<AlertStatus>,
    ) -> Result<CasOutcome> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(CAS_ALERT_STATE_SCRIPT)
            .key(alert_key(id))
            .arg(id)
            .arg(expected.map(alert_state_str).unwrap_or(""))
            .arg(alert_state_str(new_state))
            .arg(new_status.map(status_str).unwrap_or(""))
            .arg(ALERT_STATE_INDEX_PREFIX)
            .arg(ALERT_STATUS_INDEX_PREFIX)
            .arg(ALERT_SVC_INDEX_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(match result {
            1 => CasOutcome::Applied,
            -1 => CasOutcome::Conflict,
            _ => CasOutcome::Missing,
        })
    }

    async fn get_service_record(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ServiceCacheRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(service_key(service, version)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                ControlPlaneError::Invalid(format!("decode service record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn cas_service_health(
        &self,
        service: &str,
        version: &str,
        new_health: HealthState,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome> {
        let mut conn = self.conn.clone();
        let resolved_at_str = resolved_at
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            .unwrap_or_default();
        let result: i64 = Script::new(CAS_SERVICE_HEALTH_SCRIPT)
            .key(service_key(service, version))
            .arg(service)
            .arg(version)
            .arg(health_str(new_health))
            .arg(resolved_at_str)
            .arg(HEALTH_INDEX_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(match result {
            1 => CasOutcome::Applied,
            _ => CasOutcome::Conflict,
        })
    }

    async fn start_observation(&self, window: ObservationWindow) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = observation_key(&window.service, &window.version);
        let ttl = window.duration + OBSERVATION_TTL_BUFFER;
        let payload = serde_json::to_string(&window)
            .map_err(|e| ControlPlaneError::Invalid(format!("encode observation window: {e}")))?;
        let _: () = conn.set_ex(key, payload, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn check_observation(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ObservationWindow>> {
        let mut conn = self.conn.clone();
        let key = observation_key(service, version);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else { return Ok(None) };
        let window: ObservationWindow = serde_json::from_str(&raw)
            .map_err(|e| ControlPlaneError::Invalid(format!("decode observation window: {e}")))?;
        if window.is_expired(Utc::now()) {
            let _: () = conn.del(&key).await?;
            return Ok(None);
        }
        Ok(Some(window))
    }

    async fn complete_observation(&self, service: &str, version: &str) -> Result<ObservationWindow> {
        let mut conn = self.conn.clone();
        let key = observation_key(service, version);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Err(ControlPlaneError::NotFound(format!("observation:{service}:{version}")));
        };
        let window: ObservationWindow = serde_json::from_str(&raw)
            .map_err(|e| ControlPlaneError::Invalid(format!("decode observation window: {e}")))?;
        let _: () = conn.del(&key).await?;
        Ok(window)
    }

    async fn cancel_observation(&self, service: &str, version: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(observation_key(service, version)).await?;
        Ok(())
    }
}
