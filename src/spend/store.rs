use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::{Result, SentinelError};

use super::{LimitDecision, SpendLedger};

/// Buckets live two hours past the last write so the sliding hour window is
/// always fully resident.
const SPEND_TTL_SECS: u64 = 7200;
const WINDOW_SECS: i64 = 3600;

/// Check-and-reserve, executed atomically on the store. Uses the store's
/// clock so proxy replicas cannot skew the window. Compacts buckets older
/// than one hour on every call to bound the hash size.
const CHECK_AND_RESERVE_LUA: &str = r#"
local spend_key = KEYS[1]
local limit_key = KEYS[2]
local estimated_cost = tonumber(ARGV[1]) or 0
local default_limit = tonumber(ARGV[2]) or 0
local ttl_secs = tonumber(ARGV[3]) or 0

local redis_time = redis.call('TIME')
local now = tonumber(redis_time[1])
local minute_bucket = math.floor(now / 60) * 60
local one_hour_ago = minute_bucket - 3600

local limit = default_limit
local limit_str = redis.call('GET', limit_key)
if limit_str then
  limit = tonumber(limit_str) or default_limit
end

local all_buckets = redis.call('HGETALL', spend_key)
local current_spend = 0
for i = 1, #all_buckets, 2 do
  local bucket_time = tonumber(all_buckets[i])
  if bucket_time and bucket_time >= one_hour_ago then
    current_spend = current_spend + (tonumber(all_buckets[i + 1]) or 0)
  end
end

local allowed = (estimated_cost <= 0) or (current_spend + estimated_cost <= limit)
local remaining = math.max(0, limit - current_spend)

if allowed and estimated_cost > 0 then
  redis.call('HINCRBYFLOAT', spend_key, tostring(minute_bucket), estimated_cost)
  redis.call('EXPIRE', spend_key, ttl_secs)
end

for i = 1, #all_buckets, 2 do
  local bucket_time = tonumber(all_buckets[i])
  if bucket_time and bucket_time < one_hour_ago then
    redis.call('HDEL', spend_key, all_buckets[i])
  end
end

return { allowed and '1' or '0', tostring(current_spend), tostring(limit), tostring(remaining) }
"#;

/// Signed adjustment of the current minute bucket. Refunds pass actual = 0
/// so the delta becomes -estimate.
const ADJUST_COST_LUA: &str = r#"
local spend_key = KEYS[1]
local estimate = tonumber(ARGV[1]) or 0
local actual = tonumber(ARGV[2]) or 0
local ttl_secs = tonumber(ARGV[3]) or 0

local redis_time = redis.call('TIME')
local now = tonumber(redis_time[1])
local minute_bucket = math.floor(now / 60) * 60

local adjustment = actual - estimate
if adjustment ~= 0 then
  redis.call('HINCRBYFLOAT', spend_key, tostring(minute_bucket), adjustment)
  redis.call('EXPIRE', spend_key, ttl_secs)
end

return 1
"#;

#[derive(Clone, Debug)]
pub struct RedisSpendStore {
    client: redis::Client,
    default_limit: f64,
}

impl RedisSpendStore {
    pub fn new(url: impl AsRef<str>, default_limit: f64) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            default_limit,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn spend_key(tenant: &str) -> String {
        format!("spend:{tenant}")
    }

    fn limit_key(tenant: &str) -> String {
        format!("limit:{tenant}")
    }

    async fn server_now(conn: &mut redis::aio::MultiplexedConnection) -> Result<i64> {
        let (seconds, _micros): (i64, i64) = redis::cmd("TIME").query_async(conn).await?;
        Ok(seconds)
    }
}

#[async_trait]
impl SpendLedger for RedisSpendStore {
    async fn check_and_reserve(&self, tenant: &str, estimated_cost: f64) -> Result<LimitDecision> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(CHECK_AND_RESERVE_LUA);
        let result: Vec<String> = script
            .key(Self::spend_key(tenant))
            .key(Self::limit_key(tenant))
            .arg(estimated_cost)
            .arg(self.default_limit)
            .arg(SPEND_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        let [allowed, current_spend, limit, remaining] = result.as_slice() else {
            return Err(SentinelError::InvalidResponse(format!(
                "check-and-reserve script returned {} values, expected 4",
                result.len()
            )));
        };

        Ok(LimitDecision {
            allowed: allowed.as_str() == "1",
            current_spend: parse_script_float(current_spend)?,
            limit: parse_script_float(limit)?,
            remaining: parse_script_float(remaining)?,
        })
    }

    async fn adjust_cost(&self, tenant: &str, estimate: f64, actual: f64) -> Result<()> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(ADJUST_COST_LUA);
        let _: i64 = script
            .key(Self::spend_key(tenant))
            .arg(estimate)
            .arg(actual)
            .arg(SPEND_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_spend(&self, tenant: &str) -> Result<f64> {
        let mut conn = self.connection().await?;
        let now = Self::server_now(&mut conn).await?;
        let one_hour_ago = (now / 60) * 60 - WINDOW_SECS;

        let buckets: HashMap<String, String> = conn.hgetall(Self::spend_key(tenant)).await?;
        let mut total = 0.0;
        for (bucket_time, cost) in buckets {
            let Ok(bucket_time) = bucket_time.parse::<i64>() else {
                continue;
            };
            if bucket_time >= one_hour_ago {
                if let Ok(cost) = cost.parse::<f64>() {
                    total += cost;
                }
            }
        }
        Ok(total)
    }

    async fn get_limit(&self, tenant: &str) -> Result<f64> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(Self::limit_key(tenant)).await?;
        match raw {
            Some(raw) => Ok(raw.parse::<f64>().unwrap_or(self.default_limit)),
            None => Ok(self.default_limit),
        }
    }
}

fn parse_script_float(raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|_| {
        SentinelError::InvalidResponse(format!("script returned non-numeric value: {raw}"))
    })
}
