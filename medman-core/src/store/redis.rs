use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use super::JobStore;
use crate::error::{QueueError, Result};
use crate::job::{BulkAddOutcome, JobCounts, JobId, JobPayload, JobRecord, JobState, NewJob};

/// Multi-key transitions. Each runs atomically inside Redis, which is what
/// gives exactly-once claims across processes.
mod scripts {
    use redis::Script;

    /// Shared Lua helpers prepended to scripts that place jobs in ready sets.
    const HELPERS: &str = r#"
        local function ready_score(priority, seq)
            if priority > 1048576 then priority = 1048576 end
            if priority < -1048576 then priority = -1048576 end
            return -priority * 4294967296 + seq
        end

        local function promote_due(waiting, paused_set, prioritized, delayed, meta, prefix, now)
            local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
            if #due == 0 then return 0 end
            local paused = redis.call('HGET', meta, 'paused') == '1'
            for _, id in ipairs(due) do
                local key = prefix .. id
                redis.call('ZREM', delayed, id)
                if redis.call('EXISTS', key) == 1 then
                    local priority = tonumber(redis.call('HGET', key, 'priority'))
                    local seq = tonumber(redis.call('HGET', key, 'seq'))
                    local state, target
                    if priority > 0 then
                        state, target = 'prioritized', prioritized
                    elseif paused then
                        state, target = 'paused', paused_set
                    else
                        state, target = 'waiting', waiting
                    end
                    redis.call('HSET', key, 'state', state)
                    redis.call('HDEL', key, 'available_at')
                    redis.call('ZADD', target, ready_score(priority, seq), id)
                end
            end
            return #due
        end
    "#;

    fn with_helpers(body: &str) -> Script {
        Script::new(&format!("{HELPERS}\n{body}"))
    }

    /// KEYS: waiting, paused, prioritized, delayed, meta, seq.
    /// ARGV: job key prefix, now (ms), then (id, name, data, priority, delay ms) tuples.
    pub fn add_bulk() -> Script {
        with_helpers(
            r#"
            local prefix = ARGV[1]
            local now = tonumber(ARGV[2])
            local paused = redis.call('HGET', KEYS[5], 'paused') == '1'
            local added = 0
            for i = 3, #ARGV, 5 do
                local id = ARGV[i]
                local key = prefix .. id
                if redis.call('EXISTS', key) == 0 then
                    local priority = tonumber(ARGV[i + 3])
                    local delay = tonumber(ARGV[i + 4])
                    local seq = redis.call('INCR', KEYS[6])
                    local state, target, score
                    if delay > 0 then
                        state, target, score = 'delayed', KEYS[4], now + delay
                    else
                        score = ready_score(priority, seq)
                        if priority > 0 then
                            state, target = 'prioritized', KEYS[3]
                        elseif paused then
                            state, target = 'paused', KEYS[2]
                        else
                            state, target = 'waiting', KEYS[1]
                        end
                    end
                    redis.call('HSET', key,
                        'id', id, 'name', ARGV[i + 1], 'data', ARGV[i + 2],
                        'priority', ARGV[i + 3], 'state', state, 'seq', seq,
                        'created_at', ARGV[2], 'attempts', 0)
                    if delay > 0 then
                        redis.call('HSET', key, 'available_at', now + delay)
                    end
                    redis.call('ZADD', target, score, id)
                    added = added + 1
                end
            end
            return added
            "#,
        )
    }

    /// KEYS: waiting, paused, prioritized, delayed, meta.
    /// ARGV: job key prefix, now (ms).
    pub fn promote() -> Script {
        with_helpers(
            r#"
            return promote_due(KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], ARGV[1], tonumber(ARGV[2]))
            "#,
        )
    }

    /// KEYS: waiting, paused, prioritized, delayed, meta, active.
    /// ARGV: job key prefix, now (ms), worker id.
    pub fn claim() -> Script {
        with_helpers(
            r#"
            if redis.call('HGET', KEYS[5], 'paused') == '1' then
                return false
            end
            promote_due(KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], ARGV[1], tonumber(ARGV[2]))

            local best, source, best_score = nil, nil, nil
            for _, set in ipairs({KEYS[3], KEYS[1]}) do
                local head = redis.call('ZRANGE', set, 0, 0, 'WITHSCORES')
                if head[1] then
                    local score = tonumber(head[2])
                    if best_score == nil or score < best_score then
                        best, source, best_score = head[1], set, score
                    end
                end
            end
            if not best then
                return false
            end

            local key = ARGV[1] .. best
            redis.call('ZREM', source, best)
            redis.call('ZADD', KEYS[6], ARGV[2], best)
            redis.call('HSET', key, 'state', 'active', 'processed_at', ARGV[2], 'worker', ARGV[3])
            redis.call('HINCRBY', key, 'attempts', 1)
            return redis.call('HGETALL', key)
            "#,
        )
    }

    /// KEYS: active, target state set.
    /// ARGV: job key prefix, id, now (ms), target state, failure reason.
    /// Returns 1 on success, 0 for a missing job, -1 when it is not active.
    pub fn finish() -> Script {
        Script::new(
            r#"
            local key = ARGV[1] .. ARGV[2]
            if redis.call('EXISTS', key) == 0 then
                return 0
            end
            if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
                return -1
            end
            redis.call('ZREM', KEYS[1], ARGV[2])
            redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
            redis.call('HSET', key, 'state', ARGV[4], 'finished_at', ARGV[3])
            if ARGV[5] ~= '' then
                redis.call('HSET', key, 'failed_reason', ARGV[5])
            end
            return 1
            "#,
        )
    }

    /// KEYS: meta, source set, destination set.
    /// ARGV: job key prefix, paused flag, destination state.
    pub fn set_paused() -> Script {
        Script::new(
            r#"
            redis.call('HSET', KEYS[1], 'paused', ARGV[2])
            local members = redis.call('ZRANGE', KEYS[2], 0, -1, 'WITHSCORES')
            for i = 1, #members, 2 do
                redis.call('ZADD', KEYS[3], members[i + 1], members[i])
                redis.call('HSET', ARGV[1] .. members[i], 'state', ARGV[3])
            end
            redis.call('DEL', KEYS[2])
            return #members / 2
            "#,
        )
    }

    /// KEYS: active, then every other state set.
    /// ARGV: job key prefix, id.
    /// Returns 1 when removed, 0 when missing, -1 when the job is active.
    pub fn remove() -> Script {
        Script::new(
            r#"
            local key = ARGV[1] .. ARGV[2]
            if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
                return -1
            end
            if redis.call('EXISTS', key) == 0 then
                return 0
            end
            for i = 2, #KEYS do
                redis.call('ZREM', KEYS[i], ARGV[2])
            end
            redis.call('DEL', key)
            return 1
            "#,
        )
    }

    /// KEYS: state set.
    /// ARGV: job key prefix, cutoff (ms), limit (0 = unlimited).
    pub fn clean() -> Script {
        Script::new(
            r#"
            local cutoff = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            local removed = 0
            for _, id in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
                if limit > 0 and removed >= limit then
                    break
                end
                local key = ARGV[1] .. id
                local touched = redis.call('HGET', key, 'finished_at')
                    or redis.call('HGET', key, 'processed_at')
                    or redis.call('HGET', key, 'created_at')
                if (not touched) or tonumber(touched) <= cutoff then
                    redis.call('ZREM', KEYS[1], id)
                    redis.call('DEL', key)
                    removed = removed + 1
                end
            end
            return removed
            "#,
        )
    }
}

/// Key layout, namespaced by prefix and queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix of per-job hashes; the job id is appended.
    pub fn job_prefix(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    pub fn job(&self, queue: &str, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(queue), id)
    }

    /// Sorted set of job ids in `state`.
    pub fn state(&self, queue: &str, state: JobState) -> String {
        format!("{}:{}:{}", self.prefix, queue, state.as_str())
    }

    pub fn meta(&self, queue: &str) -> String {
        format!("{}:{}:meta", self.prefix, queue)
    }

    pub fn seq(&self, queue: &str) -> String {
        format!("{}:{}:seq", self.prefix, queue)
    }
}

struct Scripts {
    add_bulk: Script,
    promote: Script,
    claim: Script,
    finish: Script,
    set_paused: Script,
    remove: Script,
    clean: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add_bulk: scripts::add_bulk(),
            promote: scripts::promote(),
            claim: scripts::claim(),
            finish: scripts::finish(),
            set_paused: scripts::set_paused(),
            remove: scripts::remove(),
            clean: scripts::clean(),
        }
    }
}

/// Broker-backed job store for multi-process deployments.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    keys: QueueKeys,
    scripts: std::sync::Arc<Scripts>,
}

impl fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys)
            .finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_ms(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|raw| raw.parse::<f64>().ok())
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
}

/// Inclusive ZRANGE bounds for a page; `limit` must not be `Some(0)`.
fn range_bounds(offset: usize, limit: Option<usize>) -> (isize, isize) {
    let start = isize::try_from(offset).unwrap_or(isize::MAX);
    let stop = match limit {
        Some(limit) => {
            isize::try_from(offset.saturating_add(limit.saturating_sub(1))).unwrap_or(isize::MAX)
        }
        None => -1,
    };
    (start, stop)
}

fn decode_job(queue: &str, fields: HashMap<String, String>) -> Result<JobRecord> {
    let id = fields
        .get("id")
        .cloned()
        .ok_or_else(|| QueueError::Internal(format!("job hash in {queue} has no id")))?;
    let state = fields
        .get("state")
        .map(|raw| raw.parse::<JobState>())
        .transpose()?
        .ok_or_else(|| QueueError::Internal(format!("job {id} has no state")))?;
    let payload: JobPayload = match fields.get("data") {
        Some(raw) => serde_json::from_str(raw)?,
        None => JobPayload::new(),
    };
    let number = |name: &str| {
        fields
            .get(name)
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    Ok(JobRecord {
        queue: queue.to_string(),
        name: fields.get("name").cloned().unwrap_or_default(),
        payload,
        priority: number("priority") as i64,
        state,
        created_at: parse_ms(&fields, "created_at").unwrap_or_else(Utc::now),
        attempts: number("attempts") as u32,
        processed_at: parse_ms(&fields, "processed_at"),
        finished_at: parse_ms(&fields, "finished_at"),
        failed_reason: fields.get("failed_reason").cloned(),
        available_at: parse_ms(&fields, "available_at"),
        id: JobId(id),
    })
}

impl RedisJobStore {
    pub async fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        info!("Connecting to Redis job store at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| {
            QueueError::Internal(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            QueueError::Internal(format!("Failed to connect to Redis: {e}"))
        })?;

        info!("Successfully connected to Redis job store");

        Ok(Self::with_connection(conn, key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(key_prefix),
            scripts: std::sync::Arc::new(Scripts::load()),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn promote_due(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .scripts
            .promote
            .key(self.keys.state(queue, JobState::Waiting))
            .key(self.keys.state(queue, JobState::Paused))
            .key(self.keys.state(queue, JobState::Prioritized))
            .key(self.keys.state(queue, JobState::Delayed))
            .key(self.keys.meta(queue))
            .arg(self.keys.job_prefix(queue))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(queue, promoted, "promoted delayed jobs");
        }
        Ok(())
    }

    async fn finish(
        &self,
        queue: &str,
        id: &JobId,
        outcome: JobState,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .scripts
            .finish
            .key(self.keys.state(queue, JobState::Active))
            .key(self.keys.state(queue, outcome))
            .arg(self.keys.job_prefix(queue))
            .arg(id.as_str())
            .arg(now_ms())
            .arg(outcome.as_str())
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;
        match status {
            1 => Ok(()),
            0 => Err(QueueError::NotFound(id.to_string())),
            _ => Err(QueueError::InvalidInput(format!(
                "job {id} is not active and cannot be marked {outcome}"
            ))),
        }
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        let (from, to) = if paused {
            (JobState::Waiting, JobState::Paused)
        } else {
            (JobState::Paused, JobState::Waiting)
        };
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .set_paused
            .key(self.keys.meta(queue))
            .key(self.keys.state(queue, from))
            .key(self.keys.state(queue, to))
            .arg(self.keys.job_prefix(queue))
            .arg(if paused { "1" } else { "0" })
            .arg(to.as_str())
            .invoke_async(&mut conn)
            .await?;
        debug!(queue, paused, moved, "queue pause flag set");
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<BulkAddOutcome> {
        if jobs.is_empty() {
            return Ok(BulkAddOutcome::default());
        }
        let total = jobs.len();
        let mut invocation = self.scripts.add_bulk.prepare_invoke();
        invocation
            .key(self.keys.state(queue, JobState::Waiting))
            .key(self.keys.state(queue, JobState::Paused))
            .key(self.keys.state(queue, JobState::Prioritized))
            .key(self.keys.state(queue, JobState::Delayed))
            .key(self.keys.meta(queue))
            .key(self.keys.seq(queue))
            .arg(self.keys.job_prefix(queue))
            .arg(now_ms());
        for job in &jobs {
            let delay_ms = job.delay.map(|d| d.as_millis() as u64).unwrap_or(0);
            invocation
                .arg(job.id.as_str())
                .arg(job.name.as_str())
                .arg(serde_json::to_string(&job.payload)?)
                .arg(job.priority)
                .arg(delay_ms);
        }

        let mut conn = self.conn.clone();
        let added: usize = invocation.invoke_async(&mut conn).await?;
        let outcome = BulkAddOutcome {
            added,
            skipped: total - added.min(total),
        };
        debug!(queue, added = outcome.added, skipped = outcome.skipped, "bulk add");
        Ok(outcome)
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        self.set_paused(queue, true).await
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        self.set_paused(queue, false).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let flag: Option<String> = conn.hget(self.keys.meta(queue), "paused").await?;
        Ok(flag.as_deref() == Some("1"))
    }

    async fn get_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let (start, stop) = range_bounds(offset, limit);
        let ids: Vec<String> = conn
            .zrange(self.keys.state(queue, state), start, stop)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.job(queue, &JobId::from(id.as_str())));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        rows.into_iter()
            .filter(|fields| !fields.is_empty())
            .map(|fields| decode_job(queue, fields))
            .collect()
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(queue, id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(queue, fields).map(Some)
    }

    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool> {
        let mut invocation = self.scripts.remove.prepare_invoke();
        invocation.key(self.keys.state(queue, JobState::Active));
        for state in JobState::ALL.iter().filter(|s| **s != JobState::Active) {
            invocation.key(self.keys.state(queue, *state));
        }
        invocation.arg(self.keys.job_prefix(queue)).arg(id.as_str());

        let mut conn = self.conn.clone();
        let status: i64 = invocation.invoke_async(&mut conn).await?;
        match status {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(QueueError::JobLocked(id.to_string())),
        }
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<usize> {
        if state == JobState::Active {
            warn!(queue, "refusing to clean active jobs");
            return Ok(0);
        }
        self.promote_due(queue).await?;

        let cutoff = now_ms() - grace.as_millis() as i64;
        let mut conn = self.conn.clone();
        let removed: usize = self
            .scripts
            .clean
            .key(self.keys.state(queue, state))
            .arg(self.keys.job_prefix(queue))
            .arg(cutoff)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        self.promote_due(queue).await?;

        let mut pipe = redis::pipe();
        for state in JobState::ALL {
            pipe.zcard(self.keys.state(queue, state));
        }
        let mut conn = self.conn.clone();
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await?;

        let mut counts = JobCounts::default();
        for (state, size) in JobState::ALL.into_iter().zip(sizes) {
            counts.set(state, size);
        }
        Ok(counts)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .scripts
            .claim
            .key(self.keys.state(queue, JobState::Waiting))
            .key(self.keys.state(queue, JobState::Paused))
            .key(self.keys.state(queue, JobState::Prioritized))
            .key(self.keys.state(queue, JobState::Delayed))
            .key(self.keys.meta(queue))
            .key(self.keys.state(queue, JobState::Active))
            .arg(self.keys.job_prefix(queue))
            .arg(now_ms())
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;
        match fields {
            Some(fields) if !fields.is_empty() => {
                let job = decode_job(queue, fields)?;
                debug!(queue, worker = worker_id, job = %job.id, "claimed job");
                Ok(Some(job))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, queue: &str, id: &JobId) -> Result<()> {
        self.finish(queue, id, JobState::Completed, "").await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> Result<()> {
        self.finish(queue, id, JobState::Failed, reason).await
    }
}
