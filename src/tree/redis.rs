//! Redis-backed tree store for production runs.
//!
//! Connection parameters follow the deployment contract: 10s dial/read/write
//! timeouts and up to 5 retries with 8ms→512ms exponential backoff on
//! transient failures. One store owns one connection; the tree has a single
//! writer thread, so no pooling is needed on the mutation path.

use std::thread;
use std::time::Duration;

use redis::{Commands, Connection};

use super::TreeStore;
use crate::error::{PorError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 5;
const MIN_BACKOFF: Duration = Duration::from_millis(8);
const MAX_BACKOFF: Duration = Duration::from_millis(512);

pub struct RedisStore {
    client: redis::Client,
    conn: Connection,
}

impl RedisStore {
    pub fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{}", addr))?;
        let conn = Self::open_connection(&client)?;
        Ok(RedisStore { client, conn })
    }

    fn open_connection(client: &redis::Client) -> Result<Connection> {
        let conn = client.get_connection_with_timeout(DIAL_TIMEOUT)?;
        conn.set_read_timeout(Some(IO_TIMEOUT))?;
        conn.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(conn)
    }

    /// Runs `op`, reconnecting and retrying with exponential backoff on
    /// transient errors.
    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut backoff = MIN_BACKOFF;
        let mut last_err: Option<redis::RedisError> = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                if let Ok(conn) = Self::open_connection(&self.client) {
                    self.conn = conn;
                }
            }
            match op(&mut self.conn) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!("redis op failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }
        Err(PorError::Queue(last_err.expect("at least one attempt")))
    }
}

impl TreeStore for RedisStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_retry(|conn| conn.get::<_, Option<Vec<u8>>>(key))
    }

    fn set_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_retry(|conn| {
            let mut pipe = redis::pipe();
            for (key, value) in entries {
                pipe.set(key, value.as_slice()).ignore();
            }
            pipe.query::<()>(conn)
        })
    }

    fn delete_many(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.with_retry(|conn| {
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.del(key).ignore();
            }
            pipe.query::<()>(conn)
        })
    }
}
