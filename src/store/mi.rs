//! The Metadata Index (MI) adapter: Redis-backed job metadata, secondary
//! indices, and the pub/sub bus (PSB), since both live on the same Redis
//! deployment (SPEC_FULL.md §2).
//!
//! Job metadata is a Redis hash per job (`{prefix}:{queue}:{job_id}`); two
//! per-queue sorted sets (`idx:created`, `idx:grabbed`) stand in for the
//! secondary index spec.md §3 describes, scored by `created_ts`/`grab_ts`
//! respectively so `take` can always grab the lowest-score member. `take`
//! and `unstale` run as Lua scripts via `EVAL`, the "server-side script"
//! spec.md §4.1 calls for — the only critical section in the whole system
//! (spec.md §5).

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::RedisTarget;
use crate::errors::StoreError;
use crate::store::retry::with_backoff;
use crate::store::{MetadataIndex, PubSubBus, TakenJob};

const TAKE_SCRIPT_SRC: &str = r#"
local created_key = KEYS[1]
local grabbed_key = KEYS[2]
local hash_prefix = KEYS[3]
local now = ARGV[1]

local ids = redis.call('ZRANGE', created_key, 0, 0)
if #ids == 0 then
    return false
end

local job_id = ids[1]
redis.call('ZREM', created_key, job_id)
redis.call('ZADD', grabbed_key, now, job_id)
redis.call('HSET', hash_prefix .. job_id, 'status', 'in_progress', 'grab_ts', now)
return job_id
"#;

const UNSTALE_SCRIPT_SRC: &str = r#"
local grabbed_key = KEYS[1]
local created_key = KEYS[2]
local hash_prefix = KEYS[3]
local cutoff = ARGV[1]

local ids = redis.call('ZRANGEBYSCORE', grabbed_key, '-inf', cutoff)
for _, job_id in ipairs(ids) do
    redis.call('ZREM', grabbed_key, job_id)
    local hkey = hash_prefix .. job_id
    local created_ts = redis.call('HGET', hkey, 'created_ts')
    redis.call('ZADD', created_key, created_ts, job_id)
    redis.call('HSET', hkey, 'status', 'created')
    redis.call('HDEL', hkey, 'grab_ts')
end
return #ids
"#;

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn build_url(host: &str, port: u16, password: Option<&str>, db: i64) -> String {
    match password {
        Some(p) => format!("redis://:{p}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    }
}

/// Resolves the current master address by querying each sentinel in turn,
/// the protocol-level equivalent of `redis.asyncio.sentinel.Sentinel(...).
/// master_for(cluster_name)` in `zaku/server.py::Redis.__post_init__`.
async fn resolve_sentinel_master(
    hosts: &[(String, u16)],
    password: Option<&str>,
    cluster_name: &str,
) -> Result<(String, u16)> {
    for (host, port) in hosts {
        let url = build_url(host, *port, password, 0);
        let Ok(client) = redis::Client::open(url) else {
            continue;
        };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            continue;
        };
        let result: redis::RedisResult<(String, u16)> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(cluster_name)
            .query_async(&mut conn)
            .await;
        if let Ok(addr) = result {
            return Ok(addr);
        }
    }
    bail!("no sentinel in {hosts:?} could resolve master {cluster_name}")
}

fn classify(err: redis::RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::AuthenticationFailed {
        StoreError::Fatal(err.to_string())
    } else if err.is_connection_dropped() || err.is_timeout() || err.is_io_error() {
        StoreError::Transient(err.to_string())
    } else {
        // Conservative default: most Redis errors we'd hit (busy loading,
        // cluster-down, etc.) are worth one retry before giving up.
        StoreError::Transient(err.to_string())
    }
}

pub struct RedisIndex {
    prefix: String,
    client: redis::Client,
    conn: ConnectionManager,
    take_script: redis::Script,
    unstale_script: redis::Script,
}

/// Resolves `target` to a concrete `redis::Client`, following sentinels to
/// the current master if needed. Shared by [`RedisIndex::connect`] and the
/// Expiration Watcher, which needs its own dedicated connection to the same
/// node for `PSUBSCRIBE`.
pub async fn build_client(target: &RedisTarget) -> Result<redis::Client> {
    let url = match target {
        RedisTarget::Direct {
            host,
            port,
            password,
            db,
        } => build_url(host, *port, password.as_deref(), *db),
        RedisTarget::Sentinel {
            hosts,
            password,
            cluster_name,
            db,
            ..
        } => {
            let (host, port) =
                resolve_sentinel_master(hosts, password.as_deref(), cluster_name).await?;
            build_url(&host, port, password.as_deref(), *db)
        }
    };

    redis::Client::open(url).context("building redis client")
}

impl RedisIndex {
    pub async fn connect(prefix: &str, target: &RedisTarget) -> Result<Self> {
        let client = build_client(target).await?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("connecting to redis (MI is fatal if unreachable at startup)")?;

        Ok(RedisIndex {
            prefix: prefix.to_string(),
            client,
            conn,
            take_script: redis::Script::new(TAKE_SCRIPT_SRC),
            unstale_script: redis::Script::new(UNSTALE_SCRIPT_SRC),
        })
    }

    fn job_key_prefix(&self, queue: &str) -> String {
        format!("{}:{}:", self.prefix, queue)
    }

    fn job_key(&self, queue: &str, job_id: &str) -> String {
        format!("{}{}", self.job_key_prefix(queue), job_id)
    }

    fn idx_created_key(&self, queue: &str) -> String {
        format!("{}:{}:idx:created", self.prefix, queue)
    }

    fn idx_grabbed_key(&self, queue: &str) -> String {
        format!("{}:{}:idx:grabbed", self.prefix, queue)
    }

    fn queues_registry_key(&self) -> String {
        format!("{}:__queues__", self.prefix)
    }

    /// The key the Expiration Watcher will see fire for an ephemeral topic
    /// message, per spec.md §6's key-naming contract for the PS topic
    /// collection (`{prefix}_{queue}_topics`).
    pub fn topic_marker_key(&self, queue: &str, message_id: &str) -> String {
        format!("{}:{}:topics:{}", self.prefix, queue, message_id)
    }

    pub fn pubsub_channel(&self, queue: &str, topic_id: &str) -> String {
        format!("{}:{}.topics:{}", self.prefix, queue, topic_id)
    }

    pub fn job_collection(&self, queue: &str) -> String {
        format!("{}_{}", self.prefix, queue)
    }

    pub fn topics_collection(&self, queue: &str) -> String {
        format!("{}_{}_topics", self.prefix, queue)
    }
}

#[async_trait::async_trait]
impl MetadataIndex for RedisIndex {
    async fn create_queue(&self, queue: &str) -> Result<(), StoreError> {
        let key = self.queues_registry_key();
        with_backoff(|| {
            let mut conn = self.conn.clone();
            let key = key.clone();
            let queue = queue.to_string();
            async move {
                conn.sadd::<_, _, ()>(&key, &queue).await.map_err(classify)
            }
        })
        .await
    }

    async fn add_job(&self, queue: &str, job_id: &str, created_ts: f64) -> Result<(), StoreError> {
        let idx_key = self.idx_created_key(queue);
        let hash_key = self.job_key(queue, job_id);

        with_backoff(|| {
            let mut conn = self.conn.clone();
            let idx_key = idx_key.clone();
            let hash_key = hash_key.clone();
            async move {
                redis::pipe()
                    .atomic()
                    .zadd(&idx_key, job_id, created_ts)
                    .hset(&hash_key, "created_ts", created_ts)
                    .hset(&hash_key, "status", "created")
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await
    }

    async fn take(&self, queue: &str) -> Result<Option<TakenJob>, StoreError> {
        let registry_key = self.queues_registry_key();
        let is_registered: bool = with_backoff(|| {
            let mut conn = self.conn.clone();
            let registry_key = registry_key.clone();
            let queue = queue.to_string();
            async move { conn.sismember(&registry_key, &queue).await.map_err(classify) }
        })
        .await?;

        if !is_registered {
            return Ok(None);
        }

        let created_key = self.idx_created_key(queue);
        let grabbed_key = self.idx_grabbed_key(queue);
        let hash_prefix = self.job_key_prefix(queue);
        let now = now_secs();

        let result: redis::Value = with_backoff(|| {
            let mut conn = self.conn.clone();
            let created_key = created_key.clone();
            let grabbed_key = grabbed_key.clone();
            let hash_prefix = hash_prefix.clone();
            async move {
                self.take_script
                    .key(&created_key)
                    .key(&grabbed_key)
                    .key(&hash_prefix)
                    .arg(now)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await?;

        match result {
            redis::Value::Nil | redis::Value::Okay => Ok(None),
            redis::Value::BulkString(bytes) => {
                let job_id = String::from_utf8_lossy(&bytes).into_owned();
                Ok(Some(TakenJob { job_id, grab_ts: now }))
            }
            redis::Value::Int(0) => Ok(None),
            other => {
                // Defensive: treat anything unexpected (e.g. the script's
                // `false` return, which some redis versions surface as an
                // integer 0 or a bulk-nil) as "nothing available".
                tracing::debug!(?other, "unexpected take() script reply");
                Ok(None)
            }
        }
    }

    async fn done(&self, queue: &str, job_id: &str) -> Result<(), StoreError> {
        let created_key = self.idx_created_key(queue);
        let grabbed_key = self.idx_grabbed_key(queue);
        let hash_key = self.job_key(queue, job_id);

        with_backoff(|| {
            let mut conn = self.conn.clone();
            let created_key = created_key.clone();
            let grabbed_key = grabbed_key.clone();
            let hash_key = hash_key.clone();
            async move {
                redis::pipe()
                    .atomic()
                    .zrem(&created_key, job_id)
                    .zrem(&grabbed_key, job_id)
                    .del(&hash_key)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await
    }

    async fn reset(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        let hash_key = self.job_key(queue, job_id);
        let created_key = self.idx_created_key(queue);
        let grabbed_key = self.idx_grabbed_key(queue);

        let created_ts: Option<f64> = with_backoff(|| {
            let mut conn = self.conn.clone();
            let hash_key = hash_key.clone();
            async move { conn.hget(&hash_key, "created_ts").await.map_err(classify) }
        })
        .await?;

        let Some(created_ts) = created_ts else {
            return Ok(false);
        };

        with_backoff(|| {
            let mut conn = self.conn.clone();
            let hash_key = hash_key.clone();
            let created_key = created_key.clone();
            let grabbed_key = grabbed_key.clone();
            async move {
                redis::pipe()
                    .atomic()
                    .zrem(&grabbed_key, job_id)
                    .zadd(&created_key, job_id, created_ts)
                    .hset(&hash_key, "status", "created")
                    .hdel(&hash_key, "grab_ts")
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await?;

        Ok(true)
    }

    async fn remove(&self, queue: &str, job_id: &str) -> Result<u64, StoreError> {
        if job_id == "*" {
            let created_key = self.idx_created_key(queue);
            let grabbed_key = self.idx_grabbed_key(queue);
            let hash_prefix = self.job_key_prefix(queue);

            let ids: Vec<String> = with_backoff(|| {
                let mut conn = self.conn.clone();
                let created_key = created_key.clone();
                let grabbed_key = grabbed_key.clone();
                async move {
                    let mut ids: Vec<String> =
                        conn.zrange(&created_key, 0, -1).await.map_err(classify)?;
                    let grabbed: Vec<String> =
                        conn.zrange(&grabbed_key, 0, -1).await.map_err(classify)?;
                    ids.extend(grabbed);
                    Ok(ids)
                }
            })
            .await?;

            if ids.is_empty() {
                // Still drop the (possibly lingering empty) index keys.
                with_backoff(|| {
                    let mut conn = self.conn.clone();
                    let created_key = created_key.clone();
                    let grabbed_key = grabbed_key.clone();
                    async move {
                        conn.del::<_, ()>((created_key, grabbed_key))
                            .await
                            .map_err(classify)
                    }
                })
                .await?;
                return Ok(0);
            }

            let hash_keys: Vec<String> = ids
                .iter()
                .map(|id| format!("{hash_prefix}{id}"))
                .collect();

            with_backoff(|| {
                let mut conn = self.conn.clone();
                let created_key = created_key.clone();
                let grabbed_key = grabbed_key.clone();
                let hash_keys = hash_keys.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().del(&created_key).del(&grabbed_key);
                    for key in &hash_keys {
                        pipe.del(key);
                    }
                    pipe.query_async::<_, ()>(&mut conn).await.map_err(classify)
                }
            })
            .await?;

            Ok(hash_keys.len() as u64)
        } else {
            let created_key = self.idx_created_key(queue);
            let grabbed_key = self.idx_grabbed_key(queue);
            let hash_key = self.job_key(queue, job_id);

            let existed: bool = with_backoff(|| {
                let mut conn = self.conn.clone();
                let hash_key = hash_key.clone();
                async move { conn.exists(&hash_key).await.map_err(classify) }
            })
            .await?;

            with_backoff(|| {
                let mut conn = self.conn.clone();
                let created_key = created_key.clone();
                let grabbed_key = grabbed_key.clone();
                let hash_key = hash_key.clone();
                async move {
                    redis::pipe()
                        .atomic()
                        .zrem(&created_key, job_id)
                        .zrem(&grabbed_key, job_id)
                        .del(&hash_key)
                        .query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(classify)
                }
            })
            .await?;

            Ok(u64::from(existed))
        }
    }

    async fn count_created(&self, queue: &str) -> Result<Option<u64>, StoreError> {
        let registry_key = self.queues_registry_key();
        let is_registered: bool = with_backoff(|| {
            let mut conn = self.conn.clone();
            let registry_key = registry_key.clone();
            let queue = queue.to_string();
            async move { conn.sismember(&registry_key, &queue).await.map_err(classify) }
        })
        .await?;

        if !is_registered {
            return Ok(None);
        }

        let key = self.idx_created_key(queue);
        let count: u64 = with_backoff(|| {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.zcard(&key).await.map_err(classify) }
        })
        .await?;

        Ok(Some(count))
    }

    async fn unstale(&self, queue: &str, ttl: Option<f64>) -> Result<u64, StoreError> {
        let grabbed_key = self.idx_grabbed_key(queue);
        let created_key = self.idx_created_key(queue);
        let hash_prefix = self.job_key_prefix(queue);
        let cutoff = match ttl {
            Some(ttl) => (now_secs() - ttl).to_string(),
            None => "+inf".to_string(),
        };

        let count: u64 = with_backoff(|| {
            let mut conn = self.conn.clone();
            let grabbed_key = grabbed_key.clone();
            let created_key = created_key.clone();
            let hash_prefix = hash_prefix.clone();
            let cutoff = cutoff.clone();
            async move {
                self.unstale_script
                    .key(&grabbed_key)
                    .key(&created_key)
                    .key(&hash_prefix)
                    .arg(&cutoff)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await?;

        Ok(count)
    }

    async fn mark_ephemeral(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        with_backoff(|| {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(classify)
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl PubSubBus for RedisIndex {
    async fn publish(&self, channel: &str, message: &[u8]) -> Result<u64, StoreError> {
        with_backoff(|| {
            let mut conn = self.conn.clone();
            async move {
                conn.publish(channel, message).await.map_err(classify)
            }
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(classify)?;
        pubsub.subscribe(channel).await.map_err(classify)?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<Vec<u8>>().ok() });

        Ok(Box::pin(stream))
    }
}
