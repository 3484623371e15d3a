//! Task Queue Module
//!
//! 증명 대기 배치 높이의 Redis FIFO
//!
//! The witness builder pushes heights in ascending order (`LPUSH`); prover
//! workers pop with a blocking `BRPOP` and a 10 second timeout. A timeout is
//! not an error: the worker re-checks the batch store for remaining work
//! and either retries or drains to completion.

use std::time::Duration;

use redis::Connection;

use crate::error::Result;

const POP_TIMEOUT_SECS: u64 = 10;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TaskQueue {
    client: redis::Client,
    conn: Connection,
    queue_name: String,
}

impl TaskQueue {
    /// `host` 는 `addr:port`; 비밀번호는 비어 있을 수 있음
    pub fn connect(host: &str, password: &str, queue_name: &str) -> Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{}", host)
        } else {
            format!("redis://:{}@{}", password, host)
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_with_timeout(DIAL_TIMEOUT)?;
        Ok(TaskQueue {
            client,
            conn,
            queue_name: queue_name.to_string(),
        })
    }

    fn reconnect(&mut self) {
        if let Ok(conn) = self.client.get_connection_with_timeout(DIAL_TIMEOUT) {
            self.conn = conn;
        }
    }

    /// 큐 맨 앞에 높이 추가 (오름차순 유지는 호출자가 보장)
    pub fn push_height(&mut self, height: i64) -> Result<()> {
        let result = redis::cmd("LPUSH")
            .arg(&self.queue_name)
            .arg(height)
            .query::<()>(&mut self.conn);
        if let Err(e) = result {
            tracing::warn!("queue push failed, reconnecting: {}", e);
            self.reconnect();
            redis::cmd("LPUSH")
                .arg(&self.queue_name)
                .arg(height)
                .query::<()>(&mut self.conn)?;
        }
        Ok(())
    }

    /// 블로킹 팝. 타임아웃이면 `None`: 호출자가 재시도 여부 판단
    pub fn pop_height(&mut self) -> Result<Option<i64>> {
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.queue_name)
            .arg(POP_TIMEOUT_SECS)
            .query(&mut self.conn)?;
        match reply {
            Some((_, raw)) => {
                let height = raw.parse::<i64>().map_err(|_| {
                    crate::error::PorError::ConfigInvariant(format!(
                        "queue entry {:?} is not a batch height",
                        raw
                    ))
                })?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }
}
