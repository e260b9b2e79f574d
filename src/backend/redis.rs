//! Redis backend.
//!
//! Everything is native: `SET NX EX` for create-if-absent, an atomic Lua
//! increment, `SADD`/`SMEMBERS` for the tag index and `SCAN` for
//! enumeration. One multiplexed connection is shared by all callers.

use std::any::Any;

use ::redis::aio::MultiplexedConnection;
use ::redis::{IntoConnectionInfo, Script};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{CacheBackend, Capabilities, Expiry};
use crate::error::{Error, Result};

const SCAN_COUNT: usize = 500;

/// INCRBY that honours `create` and the expiry mode in one round trip.
///
/// ARGV: delta, create (0/1), expiry (-1 persist, 0 keep, n seconds)
const INCREMENT_SCRIPT: &str = r#"
if ARGV[2] == '0' and redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
local expiry = tonumber(ARGV[3])
if expiry > 0 then
  redis.call('EXPIRE', KEYS[1], expiry)
elseif expiry < 0 then
  redis.call('PERSIST', KEYS[1])
end
return value
"#;

/// DEL only while the key still holds ARGV[1]
const COMPARE_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed cache
pub struct RedisBackend {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    increment: Script,
    compare_delete: Script,
    database: i64,
}

impl RedisBackend {
    /// Connect to the first reachable URL in `urls`
    pub async fn connect(urls: &[String], database: i64, password: Option<String>) -> Result<Self> {
        let mut last_error = None;
        for url in urls {
            match Self::connect_one(url, database, password.clone()).await {
                Ok(backend) => {
                    info!(url = %url, database, "Connected to Redis");
                    return Ok(backend);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Redis connection failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Config("no redis url configured".into())))
    }

    async fn connect_one(url: &str, database: i64, password: Option<String>) -> Result<Self> {
        let mut info = url.into_connection_info()?;
        info.redis.db = database;
        if password.is_some() {
            info.redis.password = password;
        }
        let client = ::redis::Client::open(info)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            client,
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            compare_delete: Script::new(COMPARE_DELETE_SCRIPT),
            database,
        })
    }

    /// Underlying client, for commands the cache contract does not cover
    pub fn client(&self) -> &::redis::Client {
        &self.client
    }

    /// A handle on the shared multiplexed connection
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Escape glob metacharacters for `SCAN MATCH`
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: true,
            native_increment: true,
            native_sets: true,
            enumeration: true,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection();
        let value: Option<Vec<u8>> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let mut conn = self.connection();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        match expiry {
            Expiry::Never => {}
            Expiry::In(secs) => {
                cmd.arg("EX").arg(secs.max(1));
            }
            Expiry::Keep => {
                cmd.arg("KEEPTTL");
            }
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let mut conn = self.connection();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Expiry::In(secs) = expiry {
            cmd.arg("EX").arg(secs.max(1));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let count: i64 = ::redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool> {
        let mut conn = self.connection();
        match expiry {
            Expiry::In(secs) => {
                let set: i64 = ::redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(secs.max(1))
                    .query_async(&mut conn)
                    .await?;
                Ok(set == 1)
            }
            Expiry::Never => {
                if !self.contains(key).await? {
                    return Ok(false);
                }
                let _: i64 = ::redis::cmd("PERSIST").arg(key).query_async(&mut conn).await?;
                Ok(true)
            }
            Expiry::Keep => self.contains(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let deleted: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.connection();
        let deleted: i64 = self
            .compare_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        expiry: Expiry,
        create: bool,
    ) -> Result<Option<i64>> {
        let mut conn = self.connection();
        let expiry_arg: i64 = match expiry {
            Expiry::Never => -1,
            Expiry::Keep => 0,
            Expiry::In(secs) => secs.max(1) as i64,
        };
        let value: Option<i64> = self
            .increment
            .key(key)
            .arg(delta)
            .arg(if create { 1 } else { 0 })
            .arg(expiry_arg)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let added: i64 = ::redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.connection();
        let mut members: Vec<String> = ::redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        // Redis drops empty sets, so no members means no tag
        if members.is_empty() {
            return Ok(None);
        }
        members.sort();
        Ok(Some(members))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.scan("*").await
    }

    async fn flush(&self, prefixes: &[String]) -> Result<bool> {
        let mut conn = self.connection();
        if prefixes.is_empty() {
            let _: String = ::redis::cmd("FLUSHDB").query_async(&mut conn).await?;
            info!(database = self.database, "Flushed Redis database");
            return Ok(true);
        }
        let mut deleted = 0u64;
        for prefix in prefixes {
            let keys = self.scan(&glob_escape(prefix)).await?;
            for chunk in keys.chunks(SCAN_COUNT) {
                let n: u64 = ::redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
                deleted += n;
            }
        }
        info!(deleted, "Flushed Redis key prefixes");
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        let mut conn = self.connection();
        let info: String = ::redis::cmd("INFO").query_async(&mut conn).await?;
        let dbsize: u64 = ::redis::cmd("DBSIZE").query_async(&mut conn).await?;

        let mut fields = serde_json::Map::new();
        for line in info.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if matches!(
                    name,
                    "redis_version" | "uptime_in_seconds" | "connected_clients" | "used_memory"
                        | "used_memory_human" | "keyspace_hits" | "keyspace_misses"
                        | "evicted_keys"
                ) {
                    fields.insert(name.to_string(), json!(value.trim()));
                }
            }
        }
        Ok(json!({
            "database": self.database,
            "keys": dbsize,
            "server": fields,
        }))
    }

    async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        let deleted: u64 = ::redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
