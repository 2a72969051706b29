use super::super::super::broker::{Delivery, DeliveryTag, ExchangeKind, Message, QueueOptions};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit};

/// Identifies a single consumer stream so that its unsettled deliveries can be recovered
pub(super) type ConsumerId = u64;

/// Message waiting in a queue
#[derive(Debug)]
pub(super) struct Ready {
    pub message: Message,
    pub redelivered: bool,
}

#[derive(Debug)]
pub(super) struct QueueState {
    pub options: QueueOptions,
    pub ready: VecDeque<Ready>,
    pub consumers: usize,
    pub notify: Arc<Notify>,
}

impl QueueState {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn push_back(&mut self, message: Message) {
        self.ready.push_back(Ready {
            message,
            redelivered: false,
        });
        self.notify.notify_one();
    }

    /// Puts a previously handed out message back at the head of the queue
    pub fn requeue(&mut self, message: Message) {
        self.ready.push_front(Ready {
            message,
            redelivered: true,
        });
        self.notify.notify_one();
    }
}

#[derive(Debug)]
pub(super) struct Exchange {
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Pairs of queue name and binding key
    pub bindings: Vec<(String, String)>,
}

/// Delivery that has been handed out but not yet settled
pub(super) struct Unacked {
    pub queue: String,
    pub consumer: ConsumerId,
    pub message: Message,
    /// Slot within the prefetch window of the consumer, released on drop
    pub _permit: OwnedSemaphorePermit,
}

/// Outcome of trying to take a message from a queue
pub(super) enum Take {
    Delivered(Delivery),
    Empty(OwnedSemaphorePermit),
    Gone,
}

#[derive(Default)]
pub(super) struct State {
    pub queues: HashMap<String, QueueState>,
    pub exchanges: HashMap<String, Exchange>,
    pub unacked: HashMap<DeliveryTag, Unacked>,
}

impl State {
    /// Pops the head of a queue, recording it as unsettled if `manual` is set
    pub fn take(
        &mut self,
        queue: &str,
        consumer: ConsumerId,
        tag: DeliveryTag,
        permit: OwnedSemaphorePermit,
        manual: bool,
    ) -> Take {
        let state = match self.queues.get_mut(queue) {
            Some(state) => state,
            None => return Take::Gone,
        };

        let ready = match state.ready.pop_front() {
            Some(ready) => ready,
            None => return Take::Empty(permit),
        };

        // Wake up another consumer if there is more work to be done
        if !state.ready.is_empty() {
            state.notify.notify_one();
        }

        if manual {
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    consumer,
                    message: ready.message.clone(),
                    _permit: permit,
                },
            );
        }

        Take::Delivered(Delivery {
            tag,
            queue: queue.to_owned(),
            redelivered: ready.redelivered,
            message: ready.message,
        })
    }

    /// Returns all unsettled deliveries of a consumer to their queues
    pub fn recover(&mut self, consumer: ConsumerId) -> usize {
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();

        // Newest first so that the oldest delivery ends up at the head of the queue
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut recovered = 0;
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.requeue(unacked.message);
                    recovered += 1;
                }
            }
        }

        recovered
    }

    /// Removes a queue together with every binding pointing to it
    pub fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);

        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }
}
