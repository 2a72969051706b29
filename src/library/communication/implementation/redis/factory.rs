use super::super::super::BrokerError;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Variant for redis connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisConnectionVariant {
    /// Individual connection that may be used for blocking commands without disturbing other users.
    /// Every consumer stream gets one of these for its `XREADGROUP ... BLOCK` calls.
    Owned,
    /// Connection that is shared between all users of the factory and does not permit blocking commands
    Multiplexed,
}

/// Hands out connections to a single redis server
pub struct RedisFactory {
    url: String,
    client: Client,
    shared: OnceCell<MultiplexedConnection>,
}

impl RedisFactory {
    /// Creates a new factory for the given URL without connecting to it
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Connection(Box::new(e)))?;

        Ok(Self {
            url: url.to_owned(),
            client,
            shared: OnceCell::new(),
        })
    }

    /// URL of the server connections are opened to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Establishes a new connection or clones the shared one
    pub async fn connection(
        &self,
        variant: RedisConnectionVariant,
    ) -> Result<MultiplexedConnection, BrokerError> {
        match variant {
            RedisConnectionVariant::Owned => self.connect().await,
            RedisConnectionVariant::Multiplexed => {
                trace!("Reusing shared connection");
                self.shared
                    .get_or_try_init(|| self.connect())
                    .await
                    .map(Clone::clone)
            }
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection, BrokerError> {
        debug!(url = %self.url, "Connecting to redis");

        match timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection()).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(error)) => Err(BrokerError::Connection(Box::new(error))),
            Err(elapsed) => Err(BrokerError::Connection(Box::new(elapsed))),
        }
    }
}
