//! Blocking gate: rejects clients with a standing block and turns repeated
//! violations into new blocks.
//!
//! Two escalation counters live in the counter store, keyed per client IP:
//! * `failed_auth:<ip>`, bumped by the auth gate on every failed verification
//!   and cleared on success
//! * `rate_exceed:<ip>`, bumped whenever a response to the client is a 429
//!
//! A counter that reaches its threshold is converted into a temporary block in the
//! policy store and deleted, so the client starts from zero once the block lapses.
use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    config::models::{ServerConfig, parse_period},
    core::{error::GatewayError, store_guard::bounded},
    ports::{
        counter_store::{CounterStore, StoreResult},
        policy_store::{BlockRecord, NewBlock, PolicyStore},
    },
};

pub const FAILED_AUTH_PREFIX: &str = "failed_auth:";
pub const RATE_EXCEED_PREFIX: &str = "rate_exceed:";

/// Policy store keys that override the configured failed-auth escalation.
pub const MAX_LOGIN_ATTEMPTS_KEY: &str = "max_login_attempts";
pub const BLOCK_DURATION_MINUTES_KEY: &str = "block_duration_minutes";

pub const AUTO_BLOCKER: &str = "auto-blocker";
pub const RATE_LIMIT_BLOCKER: &str = "rate-limit-blocker";

/// Everything a 403 body says about the block.
#[derive(Debug, Clone)]
pub struct BlockNotice {
    pub ip: String,
    pub reason: String,
    pub message: String,
    pub blocked_at: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    /// `None` for permanent blocks
    pub seconds_left: Option<i64>,
    pub is_permanent: bool,
}

impl BlockNotice {
    fn from_record(record: &BlockRecord, now: DateTime<Utc>) -> Self {
        Self {
            ip: record.ip.clone(),
            reason: record.reason.clone(),
            message: "Your IP address has been blocked".to_string(),
            blocked_at: Some(record.blocked_at),
            blocked_until: record.blocked_until,
            seconds_left: record.seconds_left(now),
            is_permanent: record.is_permanent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockingSettings {
    pub max_failed_auth: u64,
    pub failed_auth_window: Duration,
    pub failed_auth_block: Duration,
    pub max_rate_exceeded: u64,
    pub rate_exceed_window: Duration,
    pub rate_exceed_block: Duration,
    pub store_timeout: Duration,
    pub fail_closed: bool,
}

impl BlockingSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, String> {
        let esc = &config.escalation;
        Ok(Self {
            max_failed_auth: esc.max_failed_auth,
            failed_auth_window: parse_period(
                "escalation.failed_auth_window",
                &esc.failed_auth_window,
            )?,
            failed_auth_block: parse_period("escalation.failed_auth_block", &esc.failed_auth_block)?,
            max_rate_exceeded: esc.max_rate_exceeded,
            rate_exceed_window: parse_period(
                "escalation.rate_exceed_window",
                &esc.rate_exceed_window,
            )?,
            rate_exceed_block: parse_period("escalation.rate_exceed_block", &esc.rate_exceed_block)?,
            store_timeout: parse_period("stores.timeout", &config.stores.timeout)?,
            fail_closed: config.stores.fail_closed.block_lookup,
        })
    }
}

pub struct BlockingGate {
    counters: Arc<dyn CounterStore>,
    policies: Arc<dyn PolicyStore>,
    settings: BlockingSettings,
}

impl BlockingGate {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        policies: Arc<dyn PolicyStore>,
        settings: BlockingSettings,
    ) -> Self {
        Self {
            counters,
            policies,
            settings,
        }
    }

    /// Decide whether `ip` may proceed. Runs first for every request.
    pub async fn check(&self, ip: IpAddr) -> Result<(), GatewayError> {
        let ip_key = ip.to_string();

        match bounded(
            self.settings.store_timeout,
            "get_block",
            self.policies.get_block(&ip_key),
        )
        .await
        {
            Ok(Some(record)) => {
                let now = Utc::now();
                if record.is_active(now) {
                    tracing::warn!(client_ip = %ip, reason = %record.reason, "Blocked IP attempted access");
                    return Err(GatewayError::ClientBlocked(Box::new(BlockNotice::from_record(
                        &record, now,
                    ))));
                }
            }
            Ok(None) => {}
            Err(e) if self.settings.fail_closed => {
                tracing::error!(client_ip = %ip, error = %e, "Block lookup failed, rejecting request");
                return Err(GatewayError::internal("Unable to verify client block status", e));
            }
            Err(e) => {
                tracing::warn!(client_ip = %ip, error = %e, "Block lookup failed, allowing request");
            }
        }

        let failed_key = format!("{FAILED_AUTH_PREFIX}{ip}");
        if let Some(attempts) = self.read_counter(&failed_key).await {
            let threshold = self
                .config_u64(MAX_LOGIN_ATTEMPTS_KEY, self.settings.max_failed_auth)
                .await;
            if attempts >= threshold {
                let duration = match self.policy_u64(BLOCK_DURATION_MINUTES_KEY).await {
                    Some(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
                    None => self.settings.failed_auth_block,
                };
                return Err(self
                    .escalate(
                        &ip_key,
                        &failed_key,
                        format!("Too many failed authentication attempts ({attempts})"),
                        "Your IP has been blocked due to too many failed authentication attempts",
                        duration,
                        AUTO_BLOCKER,
                    )
                    .await);
            }
        }

        let exceed_key = format!("{RATE_EXCEED_PREFIX}{ip}");
        if let Some(violations) = self.read_counter(&exceed_key).await {
            if violations >= self.settings.max_rate_exceeded {
                return Err(self
                    .escalate(
                        &ip_key,
                        &exceed_key,
                        format!("Repeated rate limit violations ({violations})"),
                        "Your IP has been blocked due to repeated rate limit violations",
                        self.settings.rate_exceed_block,
                        RATE_LIMIT_BLOCKER,
                    )
                    .await);
            }
        }

        Ok(())
    }

    pub async fn record_failed_auth(&self, ip: IpAddr) {
        let key = format!("{FAILED_AUTH_PREFIX}{ip}");
        match bounded(
            self.settings.store_timeout,
            "increment_with_expiry",
            self.counters
                .increment_with_expiry(&key, self.settings.failed_auth_window),
        )
        .await
        {
            Ok(hit) => tracing::warn!(client_ip = %ip, attempts = hit.count, "Failed authentication"),
            Err(e) => tracing::warn!(client_ip = %ip, error = %e, "Could not record failed authentication"),
        }
    }

    pub async fn clear_failed_auth(&self, ip: IpAddr) {
        let key = format!("{FAILED_AUTH_PREFIX}{ip}");
        if let Err(e) = bounded(
            self.settings.store_timeout,
            "delete",
            self.counters.delete(&[key]),
        )
        .await
        {
            tracing::warn!(client_ip = %ip, error = %e, "Could not clear failed authentication counter");
        }
    }

    pub async fn record_rate_exceeded(&self, ip: IpAddr) {
        let key = format!("{RATE_EXCEED_PREFIX}{ip}");
        match bounded(
            self.settings.store_timeout,
            "increment_with_expiry",
            self.counters
                .increment_with_expiry(&key, self.settings.rate_exceed_window),
        )
        .await
        {
            Ok(hit) => tracing::debug!(client_ip = %ip, violations = hit.count, "Rate limit violation recorded"),
            Err(e) => tracing::warn!(client_ip = %ip, error = %e, "Could not record rate limit violation"),
        }
    }

    /// Create or replace a block by hand.
    pub async fn block(&self, block: NewBlock) -> StoreResult<BlockRecord> {
        let record = bounded(
            self.settings.store_timeout,
            "upsert_block",
            self.policies.upsert_block(block),
        )
        .await?;
        tracing::info!(
            client_ip = %record.ip,
            reason = %record.reason,
            created_by = %record.created_by,
            permanent = record.is_permanent,
            "IP blocked"
        );
        Ok(record)
    }

    /// Remove a block and reset both escalation counters for the IP.
    pub async fn unblock(&self, ip: &str) -> StoreResult<bool> {
        let removed = bounded(
            self.settings.store_timeout,
            "delete_block",
            self.policies.delete_block(ip),
        )
        .await?;
        let counters = [
            format!("{FAILED_AUTH_PREFIX}{ip}"),
            format!("{RATE_EXCEED_PREFIX}{ip}"),
        ];
        if let Err(e) = bounded(
            self.settings.store_timeout,
            "delete",
            self.counters.delete(&counters),
        )
        .await
        {
            tracing::warn!(client_ip = %ip, error = %e, "Could not reset escalation counters");
        }
        if removed {
            tracing::info!(client_ip = %ip, "IP unblocked");
        }
        Ok(removed)
    }

    pub async fn list(&self, limit: usize) -> StoreResult<Vec<BlockRecord>> {
        bounded(
            self.settings.store_timeout,
            "list_blocks",
            self.policies.list_blocks(limit),
        )
        .await
    }

    async fn escalate(
        &self,
        ip: &str,
        counter_key: &str,
        reason: String,
        message: &str,
        duration: Duration,
        created_by: &str,
    ) -> GatewayError {
        let now = Utc::now();
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        let block = NewBlock {
            ip: ip.to_string(),
            reason: reason.clone(),
            blocked_until: until,
            is_permanent: false,
            created_by: created_by.to_string(),
        };
        // The 403 is returned even if persisting the block fails.
        if let Err(e) = self.block(block).await {
            tracing::error!(client_ip = %ip, error = %e, "Failed to persist escalation block");
        }
        if let Err(e) = bounded(
            self.settings.store_timeout,
            "delete",
            self.counters.delete(&[counter_key.to_string()]),
        )
        .await
        {
            tracing::warn!(client_ip = %ip, error = %e, "Could not reset escalation counter");
        }

        GatewayError::ClientBlocked(Box::new(BlockNotice {
            ip: ip.to_string(),
            reason,
            message: message.to_string(),
            blocked_at: Some(now),
            blocked_until: until,
            seconds_left: i64::try_from(duration.as_secs()).ok(),
            is_permanent: false,
        }))
    }

    async fn read_counter(&self, key: &str) -> Option<u64> {
        match bounded(self.settings.store_timeout, "get", self.counters.get(key)).await {
            Ok(Some(value)) => match value.parse::<u64>() {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Ignoring non-numeric escalation counter");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Could not read escalation counter");
                None
            }
        }
    }

    async fn config_u64(&self, key: &str, default: u64) -> u64 {
        self.policy_u64(key).await.unwrap_or(default)
    }

    /// A positive integer tunable from the policy store, if one is set.
    async fn policy_u64(&self, key: &str) -> Option<u64> {
        match bounded(
            self.settings.store_timeout,
            "get_config_value",
            self.policies.get_config_value(key),
        )
        .await
        {
            Ok(Some(raw)) => match raw.trim().parse::<u64>() {
                Ok(value) if value > 0 => Some(value),
                _ => {
                    tracing::warn!(key, value = %raw, "Ignoring invalid policy value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key, error = %e, "Policy value unavailable, using default");
                None
            }
        }
    }
}
