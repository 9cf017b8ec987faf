//! `redis` implementation of [`KeyValueObserver`].

use crate::{Error, Result};
use core::{future::Future, time::Duration};
use redis::{AsyncCommands, aio::MultiplexedConnection};
use stampede::{CollaboratorError, KeyValueObserver};
use tokio::time::timeout;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Read-mostly view of the platform's Redis.
///
/// Every command runs on a clone of one multiplexed connection and is bounded
/// by the call timeout.
#[derive(Clone)]
pub struct RedisObserver {
    conn: MultiplexedConnection,
    call_timeout: Duration,
}

impl RedisObserver {
    /// Opens the connection, bounded by `call_timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::Redis`] for a bad URL or a refused connection,
    /// [`Error::Timeout`] if the handshake does not finish in time.
    pub async fn connect(url: &str, call_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = timeout(call_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout(call_timeout))??;

        #[cfg(feature = "tracing")]
        tracing::info!(call_timeout = ?call_timeout, "connected to redis");

        Ok(Self { conn, call_timeout })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.call_timeout)),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.bounded(conn.exists(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(conn.get(key)).await
    }

    /// `BF.ADD filter member`; returns whether the member was new.
    pub async fn bf_add(&self, filter: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("BF.ADD");
        cmd.arg(filter).arg(member);
        let added: i64 = self.bounded(cmd.query_async(&mut conn)).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(filter, member, added, "BF.ADD");
        Ok(added == 1)
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }
}

impl KeyValueObserver for RedisObserver {
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send {
        async move { RedisObserver::exists(self, key).await.map_err(Into::into) }
    }

    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, CollaboratorError>> + Send {
        async move { RedisObserver::get(self, key).await.map_err(Into::into) }
    }

    fn forge_filter_entry(
        &self,
        filter: &str,
        member: &str,
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send {
        async move {
            self.bf_add(filter, member)
                .await
                .map(|_| ())
                .map_err(Into::into)
        }
    }

    fn evict(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send {
        async move { self.del(key).await.map_err(Into::into) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_rejected_before_connecting() {
        let err = RedisObserver::connect("not-a-redis-url", DEFAULT_CALL_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Redis(_)));
        assert!(matches!(
            CollaboratorError::from(err),
            CollaboratorError::Transport(_) | CollaboratorError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_not_a_protocol_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("redis://{addr}");
        let err = RedisObserver::connect(&url, DEFAULT_CALL_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(!matches!(
            CollaboratorError::from(err),
            CollaboratorError::Protocol(_)
        ));
    }
}
