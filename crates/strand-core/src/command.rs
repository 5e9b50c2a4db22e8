use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Out-of-band instruction for a running execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command_type", rename_all = "snake_case")]
pub enum Command {
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
    Pause {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Command {
    pub fn stop() -> Self {
        Self::Stop { reason: None }
    }

    pub fn pause() -> Self {
        Self::Pause { reason: None }
    }
}

/// Transport for commands. `poll` must never block waiting for a command.
pub trait CommandChannel: Send + Sync + 'static {
    fn send(&self, command: Command) -> BoxFuture<'_, Result<()>>;

    fn poll(&self) -> BoxFuture<'_, Result<Option<Command>>>;
}

/// In-process queue. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCommandChannel {
    queue: Arc<Mutex<VecDeque<Command>>>,
}

impl InMemoryCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Command>>> {
        self.queue
            .lock()
            .map_err(|e| StrandError::CommandChannel(e.to_string()))
    }
}

impl CommandChannel for InMemoryCommandChannel {
    fn send(&self, command: Command) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock()?.push_back(command);
            Ok(())
        })
    }

    fn poll(&self) -> BoxFuture<'_, Result<Option<Command>>> {
        Box::pin(async move { Ok(self.lock()?.pop_front()) })
    }
}

#[cfg(feature = "redis")]
pub use self::redis_channel::RedisCommandChannel;

#[cfg(feature = "redis")]
mod redis_channel {
    use futures::future::BoxFuture;
    use redis::aio::ConnectionManager;

    use super::{Command, CommandChannel};
    use crate::error::{Result, StrandError};

    /// Redis list keyed by execution id, so another process can `send`.
    #[derive(Clone)]
    pub struct RedisCommandChannel {
        conn: ConnectionManager,
        key: String,
    }

    impl RedisCommandChannel {
        pub async fn connect(url: &str, key_prefix: &str, execution_id: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(channel_err)?;
            let conn = client.get_connection_manager().await.map_err(channel_err)?;
            Ok(Self {
                conn,
                key: format!("{key_prefix}:{execution_id}"),
            })
        }

        pub fn key(&self) -> &str {
            &self.key
        }
    }

    fn channel_err(e: redis::RedisError) -> StrandError {
        StrandError::CommandChannel(e.to_string())
    }

    impl CommandChannel for RedisCommandChannel {
        fn send(&self, command: Command) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                let payload = serde_json::to_string(&command)?;
                let mut conn = self.conn.clone();
                let _: i64 = redis::cmd("RPUSH")
                    .arg(&self.key)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(channel_err)?;
                Ok(())
            })
        }

        fn poll(&self) -> BoxFuture<'_, Result<Option<Command>>> {
            Box::pin(async move {
                let mut conn = self.conn.clone();
                let raw: Option<String> = redis::cmd("LPOP")
                    .arg(&self.key)
                    .query_async(&mut conn)
                    .await
                    .map_err(channel_err)?;
                match raw {
                    Some(payload) => match serde_json::from_str(&payload) {
                        Ok(cmd) => Ok(Some(cmd)),
                        Err(e) => {
                            tracing::warn!(key = %self.key, error = %e, "Dropping malformed command");
                            Ok(None)
                        }
                    },
                    None => Ok(None),
                }
            })
        }
    }
}
