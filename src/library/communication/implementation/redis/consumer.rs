use super::super::super::broker::{AckMode, DeliveryStream, DeliveryTag, QueueOptions};
use super::super::super::BrokerError;
use super::broker::{discard, Shared, Unsettled};
use super::{
    entry, queue_key, RedisConnectionVariant, CONSUMER_GROUP, STREAM_ID_ADDITIONS, STREAM_ID_HEAD,
};
use crate::library::helpers::Backoff;
use futures::stream::{self, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{from_redis_value, AsyncCommands, Value};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

/// How long a single `XREADGROUP` call blocks waiting for new entries
const BLOCK_MILLIS: usize = 5_000;

/// Entries left unacknowledged by another consumer for this long are taken over
const CLAIM_MIN_IDLE_MILLIS: u64 = 60_000;

/// Pause between two scans for abandoned entries
const CLAIM_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum number of entries taken over in one scan
const CLAIM_BATCH: usize = 10;

/// Cursor value of `XAUTOCLAIM` denoting the start and the end of a scan
const CLAIM_CURSOR_START: &str = "0-0";

/// Deregisters a reader from its queue when the stream is dropped
///
/// Unsettled deliveries stay in the pending entries list of the consumer and are handed out
/// again the next time a reader with the same consumer name starts up.
struct ReaderGuard {
    shared: Arc<Shared>,
    queue: String,
    options: QueueOptions,
    id: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.shared
            .unsettled()
            .retain(|_, unsettled| unsettled.reader != self.id);

        let remaining = {
            let mut readers = self.shared.readers();
            let count = readers.entry(self.queue.clone()).or_insert(1);
            *count = count.saturating_sub(1);
            *count
        };

        if remaining > 0 || !self.options.auto_delete {
            return;
        }

        // Deletion requires talking to the server, which is impossible outside of a runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            let queue = self.queue.clone();

            handle.spawn(async move {
                debug!(%queue, "Deleting auto-delete queue");
                if let Err(error) = shared.delete_queue(&queue).await {
                    warn!(%queue, %error, "Failed to delete auto-delete queue");
                }
            });
        }
    }
}

struct ReaderState {
    shared: Arc<Shared>,
    queue: String,
    key: String,
    con: Option<MultiplexedConnection>,
    cursor: String,
    manual: bool,
    window: Arc<Semaphore>,
    backoff: Backoff,
    failed: bool,
    finished: bool,
    claimed: VecDeque<StreamId>,
    claim_cursor: String,
    next_claim: Instant,
    guard: ReaderGuard,
}

impl ReaderState {
    fn read_options(&self) -> StreamReadOptions {
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.shared.consumer)
            .count(1)
            .block(BLOCK_MILLIS);

        if self.manual {
            options
        } else {
            options.noack()
        }
    }

    fn reading_pending(&self) -> bool {
        self.cursor != STREAM_ID_ADDITIONS
    }

    /// Whether to look for entries abandoned by other consumers
    ///
    /// Without acknowledgements nothing is ever left pending, and our own pending
    /// entries are worked through before any others are taken over.
    fn claim_due(&self) -> bool {
        self.manual
            && !self.reading_pending()
            && self.claimed.is_empty()
            && Instant::now() >= self.next_claim
    }

    fn in_flight(&self, entry_id: &str) -> bool {
        self.shared
            .unsettled()
            .values()
            .any(|unsettled| unsettled.key == self.key && unsettled.entry_id == entry_id)
    }

    async fn claim(&mut self, con: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let (cursor, entries) = claim_abandoned(
            con,
            &self.key,
            &self.shared.consumer,
            &self.claim_cursor,
        )
        .await?;

        // A scan that did not reach the end of the pending list continues right away
        self.next_claim = if cursor == CLAIM_CURSOR_START {
            Instant::now() + CLAIM_INTERVAL
        } else {
            Instant::now()
        };
        self.claim_cursor = cursor;

        for entry in entries {
            // Entries of our own we are still working on may show up once they have been idle long enough
            if self.in_flight(&entry.id) {
                continue;
            }

            info!(queue = %self.queue, entry = %entry.id, "Took over abandoned entry");
            self.claimed.push_back(entry);
        }

        Ok(())
    }
}

/// Transfers entries that have been pending for too long to the given consumer
async fn claim_abandoned(
    con: &mut MultiplexedConnection,
    key: &str,
    consumer: &str,
    cursor: &str,
) -> Result<(String, Vec<StreamId>), BrokerError> {
    let reply: Value = redis::cmd("XAUTOCLAIM")
        .arg(key)
        .arg(CONSUMER_GROUP)
        .arg(consumer)
        .arg(CLAIM_MIN_IDLE_MILLIS)
        .arg(cursor)
        .arg("COUNT")
        .arg(CLAIM_BATCH)
        .query_async(con)
        .await?;

    claimed_entries(reply)
}

/// Splits an `XAUTOCLAIM` reply into the cursor to continue with and the claimed entries
fn claimed_entries(reply: Value) -> Result<(String, Vec<StreamId>), BrokerError> {
    // Servers before 7.0 omit the third element listing deleted entries
    match reply {
        Value::Bulk(items) if items.len() >= 2 => {
            let cursor: String = from_redis_value(&items[0])?;
            let entries: StreamRangeReply = from_redis_value(&items[1])?;
            Ok((cursor, entries.ids))
        }
        other => Err(BrokerError::Protocol(format!(
            "unexpected XAUTOCLAIM reply: {:?}",
            other
        ))),
    }
}

fn first_entry(reply: Option<StreamReadReply>) -> Option<StreamId> {
    let mut reply = reply?;
    let mut stream = reply.keys.pop()?;

    if stream.ids.is_empty() {
        None
    } else {
        Some(stream.ids.remove(0))
    }
}

pub(super) fn delivery_stream(
    shared: Arc<Shared>,
    queue: String,
    options: QueueOptions,
    ack_mode: AckMode,
    prefetch: u16,
) -> DeliveryStream {
    let permits = match (ack_mode, prefetch) {
        (AckMode::Auto, _) | (AckMode::Manual, 0) => Semaphore::MAX_PERMITS,
        (AckMode::Manual, limit) => usize::from(limit),
    };

    let guard = ReaderGuard {
        shared: shared.clone(),
        queue: queue.clone(),
        options,
        id: shared.next_reader.fetch_add(1, Ordering::SeqCst),
    };

    let state = ReaderState {
        key: queue_key(&queue),
        shared,
        queue,
        con: None,
        // Start with our own pending entries left over from a previous run
        cursor: STREAM_ID_HEAD.to_owned(),
        manual: ack_mode == AckMode::Manual,
        window: Arc::new(Semaphore::new(permits)),
        backoff: Backoff::new(Duration::from_millis(100), 12).with_ceiling(Duration::from_secs(5)),
        failed: false,
        finished: false,
        claimed: VecDeque::new(),
        claim_cursor: CLAIM_CURSOR_START.to_owned(),
        next_claim: Instant::now(),
        guard,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if state.failed {
                match state.backoff.next() {
                    Some(delay) => {
                        debug!(queue = %state.queue, attempt = state.backoff.attempts(), ?delay, "Retrying consumer");
                        sleep(delay).await
                    }
                    None => {
                        error!(queue = %state.queue, "Giving up on consumer after repeated failures");
                        return None;
                    }
                }
            }

            let permit = state.window.clone().acquire_owned().await.ok()?;

            let mut con = match state.con.take() {
                Some(con) => con,
                None => match state
                    .shared
                    .factory
                    .connection(RedisConnectionVariant::Owned)
                    .await
                {
                    Ok(con) => con,
                    Err(error) => {
                        state.failed = true;
                        return Some((Err(error), state));
                    }
                },
            };

            if state.claim_due() {
                if let Err(error) = state.claim(&mut con).await {
                    warn!(queue = %state.queue, %error, "Failed to take over abandoned entries");
                    state.next_claim = Instant::now() + CLAIM_INTERVAL;
                }
            }

            let (entry, redelivered) = match state.claimed.pop_front() {
                Some(entry) => {
                    state.con = Some(con);
                    (entry, true)
                }
                None => {
                    let read_options = state.read_options();
                    let reply: Result<Option<StreamReadReply>, BrokerError> = con
                        .xread_options(&[&state.key], &[&state.cursor], &read_options)
                        .await
                        .map_err(Into::into);

                    let entry = match reply {
                        Ok(reply) => {
                            state.con = Some(con);
                            state.failed = false;
                            state.backoff.reset();
                            first_entry(reply)
                        }
                        Err(error) if error.is_transient() => {
                            warn!(queue = %state.queue, %error, "Failed to read from queue");
                            state.failed = true;
                            return Some((Err(error), state));
                        }
                        Err(error) => {
                            // e.g. the queue has been deleted, retrying will not help
                            error!(queue = %state.queue, %error, "Unable to read from queue");
                            state.finished = true;
                            return Some((Err(error), state));
                        }
                    };

                    let entry = match entry {
                        Some(entry) => entry,
                        None => {
                            if state.reading_pending() {
                                trace!(queue = %state.queue, "Caught up on pending entries");
                                state.cursor = STREAM_ID_ADDITIONS.to_owned();
                            }
                            continue;
                        }
                    };

                    let from_pending = state.reading_pending();
                    if from_pending {
                        state.cursor = entry.id.clone();
                    }

                    (entry, from_pending)
                }
            };

            let tag = DeliveryTag::new(state.shared.next_tag.fetch_add(1, Ordering::SeqCst));
            let decoded = entry::delivery(tag, &state.queue, &entry, redelivered);

            if decoded.is_err() || !state.manual {
                // Entries without a pending acknowledgement are of no use in the stream anymore
                let discarded = match state.shared.connection().await {
                    Ok(mut shared_con) => discard(&mut shared_con, &state.key, &entry.id).await,
                    Err(error) => Err(error),
                };

                if let Err(error) = discarded {
                    warn!(queue = %state.queue, entry = %entry.id, %error, "Failed to discard entry");
                }
            }

            match decoded {
                Ok((delivery, message)) => {
                    if state.manual {
                        state.shared.unsettled().insert(
                            tag,
                            Unsettled {
                                key: state.key.clone(),
                                entry_id: entry.id.clone(),
                                message,
                                reader: state.guard.id,
                                _permit: Some(permit),
                            },
                        );
                    }

                    return Some((Ok(delivery), state));
                }
                Err(error) => return Some((Err(error), state)),
            }
        }
    })
    .boxed()
}
