//! Redis Ledger Adapter
//!
//! Implements the `AccessLedger` port on Redis. Keys are resource keys
//! as-is; values are RFC 3339 UTC timestamps (`2024-05-01T12:00:00.000Z`),
//! the same format other nodes of a cluster read and write.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::domain::ports::AccessLedger;
use crate::error::{Error, Result};

/// Ledger stored in Redis behind a reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
}

impl RedisLedger {
    /// Connect to `redis://host:port/`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| Error::Config(format!("Invalid Redis address {}:{}: {}", host, port, e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!(host, port, "Connected to Redis");
        Ok(Self { conn })
    }
}

impl std::fmt::Debug for RedisLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLedger").finish_non_exhaustive()
    }
}

/// Parse a stored value. Unreadable values count as absent.
pub fn parse_timestamp(key: &str, raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(key, value = raw, error = %e, "Ignoring unparseable access record");
            None
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl AccessLedger for RedisLedger {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|raw| parse_timestamp(key, &raw)))
    }

    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, format_timestamp(at)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_is_utc_with_millis() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(at), "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn test_parses_values_written_by_other_nodes() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("k", "2024-05-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("k", "2024-05-01T14:00:00+02:00"), Some(expected));
        assert!(parse_timestamp("k", "2024-05-01T12:00:00.123456789Z").is_some());
    }

    #[test]
    fn test_garbage_is_treated_as_absent() {
        assert_eq!(parse_timestamp("k", "yesterday"), None);
        assert_eq!(parse_timestamp("k", ""), None);
    }
}
