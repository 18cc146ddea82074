use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::time::timeout;

use crate::error::StoreError;
use crate::store::{CounterStore, Increment, WindowRecord};

// Whole read-modify-write runs inside redis, so every gateway replica
// pointed at the same server shares one count per key.
// KEYS[1] = throttle key, ARGV = now_ms, window_ms, limit
// returns {window_start_ms, count, admitted}
const INCREMENT_OR_INIT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local start = tonumber(redis.call('HGET', KEYS[1], 'start'))
if not start or now >= start + window or now < start then
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'start', now, 'count', 1)
  redis.call('PEXPIRE', KEYS[1], window)
  return {now, 1, 1}
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
if count < limit then
  count = redis.call('HINCRBY', KEYS[1], 'count', 1)
  return {start, count, 1}
end
return {start, count, 0}
"#;

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// script reply -> Increment
pub(crate) fn decode_reply(reply: &[i64]) -> Result<Increment, StoreError> {
    let [start_ms, count, admitted] = reply else {
        return Err(StoreError::Unavailable(format!(
            "unexpected script reply {:?}",
            reply
        )));
    };
    let window_start = DateTime::from_timestamp_millis(*start_ms)
        .ok_or_else(|| StoreError::Unavailable(format!("bad window start {}", start_ms)))?;
    let count = u32::try_from(*count)
        .map_err(|_| StoreError::Unavailable(format!("bad count {}", count)))?;
    Ok(Increment {
        record: WindowRecord { window_start, count },
        admitted: *admitted == 1,
    })
}

// Counting store shared by a fleet through one redis server
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(unavailable)?;

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_OR_INIT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowRecord>, StoreError> {
        // lapsed keys are already gone: the script sets PEXPIRE on every new window
        let mut conn = self.conn.clone();
        let (start, count): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("start")
            .arg("count")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match (start, count) {
            // a start in our future means the clock stepped back: lapsed
            (Some(start), Some(count)) if start <= millis(now) => decode_reply(&[start, count, 1]).map(|hit| Some(hit.record)),
            _ => Ok(None),
        }
    }

    async fn increment_or_init(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Increment, StoreError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(millis(now))
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        decode_reply(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_admitted_and_refused_replies() {
        let hit = decode_reply(&[1_700_000_000_000, 3, 1]).unwrap();
        assert!(hit.admitted);
        assert_eq!(hit.record.count, 3);
        assert_eq!(hit.record.window_start.timestamp(), 1_700_000_000);

        assert!(!decode_reply(&[1_700_000_000_000, 5, 0]).unwrap().admitted);
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(decode_reply(&[]).is_err());
        assert!(decode_reply(&[1, 2]).is_err());
        assert!(decode_reply(&[1_700_000_000_000, -1, 1]).is_err());
        assert!(decode_reply(&[i64::MAX, 1, 1]).is_err());
    }

    // needs a live server: REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored
    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_URL"]
    async fn replicas_share_one_window() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let a = RedisStore::connect(&url, Duration::from_secs(2)).await.unwrap();
        let b = RedisStore::connect(&url, Duration::from_secs(2)).await.unwrap();

        let key = format!("throttle:test:{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let now = Utc::now();
        let window = Duration::from_secs(60);

        let mut admitted = 0;
        for i in 0..12 {
            let store = if i % 2 == 0 { &a } else { &b };
            if store.increment_or_init(&key, 5, window, now).await.unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        let record = a.get(&key, now).await.unwrap().unwrap();
        assert_eq!(record.count, 5);
        assert_eq!(record.window_start.timestamp_millis(), now.timestamp_millis());
    }
}
