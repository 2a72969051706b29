use super::super::super::broker::{
    AckMode, Broker, DeliveryStream, DeliveryTag, ExchangeKind, Message, QueueHandle,
    QueueOptions, DEFAULT_EXCHANGE,
};
use super::super::super::BrokerError;
use super::entry::{encode, Binding};
use super::{
    bindings_key, consumer, exchanges_key, queue_key, queues_key, RedisConnectionVariant,
    RedisFactory, CONSUMER_GROUP, STREAM_ID_HEAD, STREAM_ID_NEW,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Debug, Serialize, Deserialize)]
struct ExchangeDefinition {
    kind: ExchangeKind,
    durable: bool,
}

/// Delivery handed out by a consumer stream that has not been settled yet
pub(super) struct Unsettled {
    pub key: String,
    pub entry_id: String,
    pub message: Message,
    pub reader: u64,
    pub _permit: Option<OwnedSemaphorePermit>,
}

pub(super) struct Shared {
    pub factory: RedisFactory,
    pub consumer: String,
    pub unsettled: Mutex<HashMap<DeliveryTag, Unsettled>>,
    pub readers: Mutex<HashMap<String, usize>>,
    pub next_tag: AtomicU64,
    pub next_reader: AtomicU64,
}

impl Shared {
    pub fn unsettled(&self) -> MutexGuard<'_, HashMap<DeliveryTag, Unsettled>> {
        self.unsettled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn readers(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.factory
            .connection(RedisConnectionVariant::Multiplexed)
            .await
    }

    /// Removes a queue, its stream and all bindings pointing to it
    pub async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut con = self.connection().await?;

        con.del::<_, ()>(queue_key(queue)).await?;
        con.hdel::<_, _, ()>(queues_key(), queue).await?;

        let exchanges: Vec<String> = con.hkeys(exchanges_key()).await?;
        for exchange in exchanges {
            let members: Vec<String> = con.smembers(bindings_key(&exchange)).await?;

            for member in members {
                let pointing_here = serde_json::from_str::<Binding>(&member)
                    .map(|binding| binding.queue == queue)
                    .unwrap_or(false);

                if pointing_here {
                    con.srem::<_, _, ()>(bindings_key(&exchange), member).await?;
                }
            }
        }

        Ok(())
    }
}

/// Creates the consumer group of a queue stream if it does not exist yet
pub(super) async fn ensure_group(
    con: &mut MultiplexedConnection,
    key: &str,
) -> Result<(), BrokerError> {
    let result = con
        .xgroup_create_mkstream::<_, _, _, ()>(key, CONSUMER_GROUP, STREAM_ID_HEAD)
        .await;

    match result {
        Err(error) if error.code() != Some("BUSYGROUP") => Err(error.into()),
        _ => Ok(()),
    }
}

/// Acknowledges an entry and removes it from its stream
///
/// Streams only ever contain entries that have not been settled yet.
pub(super) async fn discard(
    con: &mut MultiplexedConnection,
    key: &str,
    entry_id: &str,
) -> Result<(), BrokerError> {
    redis::pipe()
        .atomic()
        .xack(key, CONSUMER_GROUP, &[entry_id])
        .ignore()
        .xdel(key, &[entry_id])
        .ignore()
        .query_async::<_, ()>(con)
        .await?;

    Ok(())
}

fn publish_error(exchange: &str) -> impl Fn(RedisError) -> BrokerError + '_ {
    move |error| BrokerError::Publish {
        exchange: exchange.to_owned(),
        source: Box::new(error),
    }
}

fn corrupt(what: &str, name: &str) -> impl Fn(serde_json::Error) -> BrokerError {
    let context = format!("corrupt {} definition for '{}'", what, name);
    move |error| BrokerError::Protocol(format!("{}: {}", context, error))
}

/// Broker backed by a redis server
#[derive(Clone)]
pub struct RedisBroker {
    shared: Arc<Shared>,
}

impl RedisBroker {
    /// Connects to a redis server, failing right away if it is unreachable
    ///
    /// The `consumer` name must be unique among running processes. Reusing it after a
    /// restart resumes unacknowledged deliveries right away instead of after they went idle.
    #[instrument(skip(url))]
    pub async fn connect(url: &str, consumer: &str) -> Result<Self, BrokerError> {
        let factory = RedisFactory::new(url)?;
        let mut con = factory
            .connection(RedisConnectionVariant::Multiplexed)
            .await?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut con)
            .await
            .map_err(|e| BrokerError::Connection(Box::new(e)))?;

        debug!(url = factory.url(), "Connected to redis");

        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                consumer: consumer.to_owned(),
                unsettled: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                next_reader: AtomicU64::new(1),
            }),
        })
    }

    async fn queue_options(
        &self,
        con: &mut MultiplexedConnection,
        queue: &str,
    ) -> Result<Option<QueueOptions>, BrokerError> {
        let raw: Option<String> = con.hget(queues_key(), queue).await?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(corrupt("queue", queue)))
            .transpose()
    }

    async fn exchange(
        &self,
        con: &mut MultiplexedConnection,
        exchange: &str,
    ) -> Result<Option<ExchangeDefinition>, BrokerError> {
        let raw: Option<String> = con.hget(exchanges_key(), exchange).await?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(corrupt("exchange", exchange)))
            .transpose()
    }

    async fn settle(&self, tag: DeliveryTag) -> Result<Unsettled, BrokerError> {
        self.shared
            .unsettled()
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, BrokerError> {
        let name = if name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        let mut con = self.shared.connection().await?;

        match self.queue_options(&mut con, &name).await? {
            Some(existing) if existing != options => {
                return Err(BrokerError::Protocol(format!(
                    "queue '{}' redeclared with different options",
                    name
                )))
            }
            Some(_) => {}
            None => {
                debug!(queue = %name, ?options, "Declaring queue");
                let definition = serde_json::to_string(&options).map_err(corrupt("queue", &name))?;
                con.hset::<_, _, _, ()>(queues_key(), &name, definition)
                    .await?;
            }
        }

        ensure_group(&mut con, &queue_key(&name)).await?;

        Ok(QueueHandle::new(name))
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::Protocol(
                "the default exchange can not be redeclared".into(),
            ));
        }

        let mut con = self.shared.connection().await?;

        match self.exchange(&mut con, name).await? {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::Protocol(format!(
                    "exchange '{}' redeclared as {} but it is {}",
                    name, kind, existing.kind
                )))
            }
            Some(_) => Ok(()),
            None => {
                debug!(exchange = %name, %kind, "Declaring exchange");
                let definition = serde_json::to_string(&ExchangeDefinition { kind, durable })
                    .map_err(corrupt("exchange", name))?;
                con.hset::<_, _, _, ()>(exchanges_key(), name, definition)
                    .await?;
                Ok(())
            }
        }
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut con = self.shared.connection().await?;

        if self.queue_options(&mut con, queue).await?.is_none() {
            return Err(BrokerError::UnknownQueue(queue.to_owned()));
        }

        if self.exchange(&mut con, exchange).await?.is_none() {
            return Err(BrokerError::UnknownExchange(exchange.to_owned()));
        }

        let binding = Binding {
            queue: queue.to_owned(),
            key: routing_key.to_owned(),
        };
        let member = serde_json::to_string(&binding).map_err(corrupt("binding", queue))?;

        debug!(%queue, %exchange, %routing_key, "Binding queue");
        con.sadd::<_, _, ()>(bindings_key(exchange), member).await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let mut con = self.shared.connection().await?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            let exists: bool = con
                .hexists(queues_key(), routing_key)
                .await
                .map_err(publish_error(exchange))?;

            if exists {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            }
        } else {
            let definition = self
                .exchange(&mut con, exchange)
                .await?
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_owned()))?;

            let members: Vec<String> = con
                .smembers(bindings_key(exchange))
                .await
                .map_err(publish_error(exchange))?;

            members
                .iter()
                .filter_map(|member| match serde_json::from_str::<Binding>(member) {
                    Ok(binding) => Some(binding),
                    Err(error) => {
                        warn!(%exchange, %error, "Skipping corrupt binding");
                        None
                    }
                })
                .filter(|binding| definition.kind.routes(&binding.key, routing_key))
                .map(|binding| binding.queue)
                .collect()
        };

        if targets.is_empty() {
            trace!(%exchange, %routing_key, "Dropping unroutable message");
        }

        let fields = encode(&message, false);
        for target in targets {
            con.xadd::<_, _, _, _, String>(queue_key(&target), STREAM_ID_NEW, fields.as_slice())
                .await
                .map_err(publish_error(exchange))?;
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut con = self.shared.connection().await?;

        let options = self
            .queue_options(&mut con, queue)
            .await?
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;

        ensure_group(&mut con, &queue_key(queue)).await?;

        {
            let mut readers = self.shared.readers();
            let count = readers.entry(queue.to_owned()).or_insert(0);

            if options.exclusive && *count > 0 {
                return Err(BrokerError::QueueLocked(queue.to_owned()));
            }

            *count += 1;
        }

        debug!(%queue, ?ack_mode, prefetch, consumer = %self.shared.consumer, "Starting consumer");

        Ok(consumer::delivery_stream(
            self.shared.clone(),
            queue.to_owned(),
            options,
            ack_mode,
            prefetch,
        ))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let unsettled = self.settle(tag).await?;
        let mut con = self.shared.connection().await?;

        discard(&mut con, &unsettled.key, &unsettled.entry_id).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let unsettled = self.settle(tag).await?;
        let mut con = self.shared.connection().await?;

        if requeue {
            // Append the copy first so the message survives if discarding the original fails
            let fields = encode(&unsettled.message, true);
            con.xadd::<_, _, _, _, String>(&unsettled.key, STREAM_ID_NEW, fields.as_slice())
                .await?;
        } else {
            debug!(%tag, key = %unsettled.key, "Discarding rejected delivery");
        }

        discard(&mut con, &unsettled.key, &unsettled.entry_id).await
    }
}
