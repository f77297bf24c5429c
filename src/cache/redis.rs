//! Redis-backed cache shared by every gateway instance.
//!
//! Layout: entries at `{prefix}:cache:{key}`, tag sets at `{prefix}:tag:{tag}`.
//! Tag sets hold raw keys (unprefixed).

use std::time::Duration;

use ::redis::{AsyncCommands, Cmd, Script};
use async_trait::async_trait;

use crate::cache::backend::CacheBackend;
use crate::store::{RedisStore, StoreError};

// KEYS[1] entry, KEYS[2..] tag sets; ARGV value, ttl ms, raw key
const SET_WITH_TAGS: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
local ttl = tonumber(ARGV[2])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[3])
  if redis.call('PTTL', KEYS[i]) < ttl then
    redis.call('PEXPIRE', KEYS[i], ttl)
  end
end
return 1
"#;

// KEYS[1] tag set; ARGV[1] entry key prefix
const INVALIDATE_TAG: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, member in ipairs(members) do
  removed = removed + redis.call('DEL', ARGV[1] .. member)
end
redis.call('DEL', KEYS[1])
return removed
"#;

/// Keys requested per SCAN page during a flush.
const SCAN_BATCH: usize = 500;

pub struct RedisBackend {
    store: RedisStore,
}

impl RedisBackend {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    fn entry_key(&self, key: &str) -> String {
        self.store.key(&["cache", key])
    }

    fn tag_key(&self, tag: &str) -> String {
        self.store.key(&["tag", tag])
    }

    /// Delete every key matching `pattern`, one SCAN page per round trip.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut cursor = 0u64;
        let mut removed = 0;
        loop {
            let page = scan_page(cursor, pattern);
            let (next, deleted) = self
                .store
                .run(|mut conn| async move {
                    let (next, keys): (u64, Vec<String>) = page.query_async(&mut conn).await?;
                    let deleted: usize = if keys.is_empty() { 0 } else { conn.unlink(keys).await? };
                    Ok((next, deleted))
                })
                .await?;
            removed += deleted;
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

fn scan_page(cursor: u64, pattern: &str) -> Cmd {
    let mut cmd = ::redis::cmd("SCAN");
    cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(SCAN_BATCH);
    cmd
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.entry_key(key);
        self.store
            .run(|mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<(), StoreError> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let script = Script::new(SET_WITH_TAGS);
        let mut invocation = script.key(self.entry_key(key));
        for tag in tags {
            invocation.key(self.tag_key(tag));
        }
        invocation.arg(value).arg(ttl_ms).arg(key);

        self.store
            .run(|mut conn| async move {
                let _: i64 = invocation.invoke_async(&mut conn).await?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.entry_key(key);
        let removed: u64 = self
            .store
            .run(|mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let script = Script::new(INVALIDATE_TAG);
        let mut invocation = script.key(self.tag_key(tag));
        invocation.arg(self.store.key(&["cache", ""]));

        let removed: u64 = self
            .store
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(removed as usize)
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StoreError> {
        let key = self.tag_key(tag);
        self.store
            .run(|mut conn| async move { conn.smembers(key).await })
            .await
    }

    async fn flush(&self) -> Result<usize, StoreError> {
        let removed = self.delete_matching(&self.store.key(&["cache", "*"])).await?;
        self.delete_matching(&self.store.key(&["tag", "*"])).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn args(cmd: &Cmd) -> String {
        String::from_utf8_lossy(&cmd.get_packed_command()).into_owned()
    }

    #[test]
    fn test_flush_pages_with_scan() {
        let packed = args(&scan_page(42, "gw:cache:*"));
        assert!(packed.contains("SCAN"));
        assert!(packed.contains("\r\n42\r\n"));
        assert!(packed.contains("MATCH\r\n$10\r\ngw:cache:*"));
        assert!(packed.contains(&format!("COUNT\r\n${}\r\n{SCAN_BATCH}", SCAN_BATCH.to_string().len())));
        assert!(!packed.contains("KEYS"));
    }

    #[tokio::test]
    async fn test_flush_against_unreachable_store_errors() {
        let config = StoreConfig {
            op_timeout_ms: 200,
            ..StoreConfig::default()
        };
        let store = RedisStore::open("redis://127.0.0.1:1", &config).unwrap();
        assert!(RedisBackend::new(store).flush().await.is_err());
    }
}
