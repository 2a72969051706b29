//! Options shared between modules
//!
//! Every module that talks to a broker flattens [`BrokerOptions`] into its own
//! options, so all subcommands accept the same connection flags.

use crate::library::communication::broker::SharedBroker;
use crate::library::communication::implementation::memory::MemoryBroker;
use crate::library::communication::implementation::redis::RedisBroker;
use crate::library::communication::BrokerError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::info;
use uuid::Uuid;

/// Broker implementation to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// In-process broker, only reachable from within the current process
    Memory,
    /// Redis server with stream support
    Redis,
}

impl fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerBackend::Memory => write!(f, "memory"),
            BrokerBackend::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BrokerBackend::Memory),
            "redis" => Ok(BrokerBackend::Redis),
            other => Err(format!(
                "unknown broker '{}', expected 'memory' or 'redis'",
                other
            )),
        }
    }
}

/// Location of the redis server
#[derive(Debug, StructOpt)]
pub struct RedisOptions {
    /// URL of the redis server, e.g. redis://127.0.0.1:6379/
    #[structopt(
        short = "r",
        long = "redis",
        env = "REDIS",
        global = true,
        default_value = "redis://127.0.0.1/",
        value_name = "url"
    )]
    pub url: String,
}

/// Options for connecting to a message broker
#[derive(Debug, StructOpt)]
pub struct BrokerOptions {
    /// Broker implementation to use
    ///
    /// Variants: memory, redis
    #[structopt(
        short = "b",
        long = "broker",
        env = "BROKER",
        global = true,
        default_value = "redis",
        value_name = "backend"
    )]
    pub backend: BrokerBackend,

    /// Consumer name of this process in the redis backend. Requests a worker
    /// received but never acknowledged are handed back to it when it restarts
    /// under the same name, other workers take them over after a minute of
    /// inactivity. Defaults to a random name, must be distinct between processes.
    #[structopt(long, env = "ID", global = true)]
    pub id: Option<String>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub redis: RedisOptions,
}

impl BrokerOptions {
    /// Name identifying this process towards the broker
    pub fn consumer_name(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("switchyard-{}", Uuid::new_v4().simple()),
        }
    }

    /// Opens the broker selected by these options
    pub async fn connect(&self) -> Result<SharedBroker, BrokerError> {
        info!(backend = %self.backend, "Connecting to broker");

        match self.backend {
            BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
            BrokerBackend::Redis => {
                let consumer = self.consumer_name();
                let broker = RedisBroker::connect(&self.redis.url, &consumer).await?;
                Ok(Arc::new(broker))
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::broker::Broker;

    #[test]
    fn parse_backends() {
        assert_eq!("memory".parse::<BrokerBackend>(), Ok(BrokerBackend::Memory));
        assert_eq!("redis".parse::<BrokerBackend>(), Ok(BrokerBackend::Redis));
        assert!("amqp".parse::<BrokerBackend>().is_err());
    }

    #[test]
    fn name_consumers_uniquely_by_default() {
        let options = |id: Option<&str>| BrokerOptions {
            backend: BrokerBackend::Redis,
            id: id.map(str::to_owned),
            redis: RedisOptions {
                url: "redis://127.0.0.1/".into(),
            },
        };

        assert_eq!(options(Some("worker-1")).consumer_name(), "worker-1");
        assert_ne!(options(None).consumer_name(), options(None).consumer_name());
        assert!(options(None).consumer_name().starts_with("switchyard-"));
    }

    #[tokio::test]
    async fn open_memory_broker() {
        let options = BrokerOptions {
            backend: BrokerBackend::Memory,
            id: None,
            redis: RedisOptions {
                url: "redis://127.0.0.1/".into(),
            },
        };

        let broker = options.connect().await.unwrap();
        let queue = broker
            .declare_queue("", Default::default())
            .await
            .unwrap();

        assert!(queue.name().starts_with("amq.gen-"));
    }
}
