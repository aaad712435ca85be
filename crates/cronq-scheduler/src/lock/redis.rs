use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{Lease, LeaderLock};
use crate::error::Result;

/// Compare-and-delete so only the lease owner removes the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lease lock on a single Redis key (`SET key token NX PX lease`).
#[derive(Clone)]
pub struct RedisLeaderLock {
    conn: ConnectionManager,
    key: String,
    lease: Duration,
}

impl RedisLeaderLock {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, lease: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            lease,
        }
    }
}

#[async_trait]
impl LeaderLock for RedisLeaderLock {
    async fn try_acquire(&self) -> Result<Option<Lease>> {
        let mut conn = self.conn.clone();
        let lease = Lease::new();
        let set: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set.map(|_| lease))
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
