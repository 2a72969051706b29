//! [`Broker`](super::super::broker::Broker) implementation using [`redis`](::redis)
//!
//! Queues are [Redis Streams](https://redis.io/topics/streams-intro) consumed through a single
//! consumer group, so that every entry is handed to exactly one consumer. Settling a delivery
//! acknowledges and deletes its entry, so streams only hold unsettled messages. Requeueing
//! appends a copy flagged as redelivered. Exchanges and bindings are plain hashes and sets next
//! to the streams.
//!
//! When a consumer restarts under the same name it first works through the entries it received
//! but never acknowledged before picking up new ones. Entries left pending by a consumer that
//! does not come back are taken over by other consumers once they have been idle for a minute
//! (`XAUTOCLAIM`, requires redis 6.2). Either way a request survives a worker crash.

mod broker;
mod consumer;
mod entry;
mod factory;

pub use broker::RedisBroker;
pub use factory::*;

const KEY_PREFIX: &str = "switchyard:";
const CONSUMER_GROUP: &str = "consumers";
const STREAM_ID_NEW: &str = "*";
const STREAM_ID_HEAD: &str = "0";
const STREAM_ID_ADDITIONS: &str = ">";

fn queues_key() -> String {
    format!("{}queues", KEY_PREFIX)
}

fn exchanges_key() -> String {
    format!("{}exchanges", KEY_PREFIX)
}

fn queue_key(queue: &str) -> String {
    format!("{}queue:{}", KEY_PREFIX, queue)
}

fn bindings_key(exchange: &str) -> String {
    format!("{}bindings:{}", KEY_PREFIX, exchange)
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn namespace_keys() {
        assert_eq!(queue_key("rpc_queue"), "switchyard:queue:rpc_queue");
        assert_eq!(bindings_key("logs"), "switchyard:bindings:logs");
        assert_ne!(queues_key(), exchanges_key());
    }
}
