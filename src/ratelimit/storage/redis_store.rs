//! Redis implementation of the shared-store protocol.
//!
//! Each key is a hash with two fields, `v` (version) and `d` (encoded state).
//! The conditional write runs as a Lua script, so the version check and the
//! write are one atomic step on the server. Versions come from a single
//! counter key and therefore never repeat, even after a delete.
//!
//! The counter and state keys must live on the same node; Redis Cluster
//! deployments need a hash tag in the prefix.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::info;

use super::external::{CasReply, VersionedStore, VersionedValue};
use super::StorageError;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
  if current then return -1 end
else
  if not current then return -2 end
  if current ~= ARGV[1] then return -1 end
end
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', version, 'd', ARGV[2])
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return version
"#;

/// Shared store backed by a Redis server.
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
    ttl: Duration,
    cas: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`). Keys expire `ttl` after
    /// their last write; a zero `ttl` keeps them forever.
    pub async fn connect(url: &str, prefix: &str, ttl: Duration) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        info!(url = %url, prefix = %prefix, "Connected to Redis");

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            ttl,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn version_key(&self) -> String {
        format!("{}~version", self.prefix)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn unavailable(e: redis::RedisError) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl VersionedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError> {
        let mut connection = self.connection.clone();
        let (version, value): (Option<u64>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(self.state_key(key))
            .arg("v")
            .arg("d")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;

        Ok(match (version, value) {
            (Some(version), Some(value)) => Some(VersionedValue { version, value }),
            _ => None,
        })
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasReply, StorageError> {
        let mut connection = self.connection.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);

        let reply: i64 = self
            .cas
            .key(self.state_key(key))
            .key(self.version_key())
            .arg(expected)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;

        Ok(match reply {
            -2 => CasReply::NotFound,
            version if version > 0 => CasReply::Ok {
                version: version as u64,
            },
            _ => CasReply::VersionConflict,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.state_key(key))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
