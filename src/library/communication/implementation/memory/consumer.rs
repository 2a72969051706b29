use super::super::super::broker::{AckMode, DeliveryStream, DeliveryTag};
use super::state::{ConsumerId, Take};
use super::Inner;
use futures::stream::{self, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, trace};

/// Deregisters a consumer when its stream is dropped
///
/// Any delivery the consumer did not settle is put back into its queue, marked as redelivered.
/// Auto-delete queues disappear together with their last consumer.
pub(super) struct ConsumerGuard {
    inner: Arc<Inner>,
    queue: String,
    id: ConsumerId,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        let recovered = state.recover(self.id);

        if recovered > 0 {
            debug!(queue = %self.queue, recovered, "Requeued unsettled deliveries of departing consumer");
        }

        let delete = match state.queues.get_mut(&self.queue) {
            Some(queue) => {
                queue.consumers = queue.consumers.saturating_sub(1);
                queue.consumers == 0 && queue.options.auto_delete
            }
            None => false,
        };

        if delete {
            debug!(queue = %self.queue, "Deleting auto-delete queue");
            state.delete_queue(&self.queue);
        }
    }
}

struct ConsumerState {
    inner: Arc<Inner>,
    queue: String,
    manual: bool,
    window: Arc<Semaphore>,
    notify: Arc<Notify>,
    guard: ConsumerGuard,
}

pub(super) fn delivery_stream(
    inner: Arc<Inner>,
    queue: String,
    notify: Arc<Notify>,
    ack_mode: AckMode,
    prefetch: u16,
) -> DeliveryStream {
    // A prefetch of zero means "no limit", same as with AMQP
    let permits = match (ack_mode, prefetch) {
        (AckMode::Auto, _) | (AckMode::Manual, 0) => Semaphore::MAX_PERMITS,
        (AckMode::Manual, limit) => usize::from(limit),
    };

    let guard = ConsumerGuard {
        inner: inner.clone(),
        queue: queue.clone(),
        id: inner.next_consumer.fetch_add(1, Ordering::SeqCst),
    };

    let state = ConsumerState {
        inner,
        queue,
        manual: ack_mode == AckMode::Manual,
        window: Arc::new(Semaphore::new(permits)),
        notify,
        guard,
    };

    stream::unfold(state, |state| async move {
        loop {
            // Waiting for a permit is what enforces the prefetch limit
            let permit = state.window.clone().acquire_owned().await.ok()?;
            let tag = DeliveryTag::new(state.inner.next_tag.fetch_add(1, Ordering::SeqCst));

            let taken = state
                .inner
                .state()
                .take(&state.queue, state.guard.id, tag, permit, state.manual);

            match taken {
                Take::Delivered(delivery) => {
                    trace!(queue = %state.queue, %tag, "Handing out delivery");
                    return Some((Ok(delivery), state));
                }
                Take::Empty(permit) => {
                    drop(permit);
                    state.notify.notified().await;
                }
                Take::Gone => return None,
            }
        }
    })
    .boxed()
}
