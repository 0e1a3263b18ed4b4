//! In-flight tracker: a bounded map of outstanding message contexts with
//! per-partition in-order offset advancement
//!
//! The tracker holds an entry for a coordinate exactly while the request is
//! admitted but its reply is unconfirmed. Capacity is a semaphore sized to
//! the in-flight ceiling: the dispatch loop acquires a permit per message,
//! the permit is absorbed on admission, and permits return when completed
//! entries are removed. Offsets are only marked up to the contiguous run of
//! completed entries at the head of each partition, so a crash never
//! commits past unreplied work.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::kafka::client::{InboundMessage, LogConsumer, ReplySink};
use crate::kafka::context::MsgContext;

/// Outcome of offering a consumed message to the tracker
pub enum Admission {
    /// Novel coordinate, headers parsed; the processor owns the reply
    Admitted(Arc<MsgContext>),
    /// Novel coordinate but the payload would not decode; the caller must
    /// drive an error reply so the offset can still advance
    BadPayload(Arc<MsgContext>),
    /// Coordinate already in flight: a redelivery, dropped silently
    Duplicate,
}

pub struct InFlightTracker {
    capacity: Arc<Semaphore>,
    entries: Mutex<HashMap<String, Arc<MsgContext>>>,
}

impl InFlightTracker {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            capacity: Arc::new(Semaphore::new(max_in_flight)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the in-flight count is below the ceiling. The permit must
    /// be passed to [`admit`], which either absorbs it (new entry) or
    /// returns it to the pool (duplicate).
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::FatalInvariant("in-flight capacity semaphore closed".into()))
    }

    /// Admit a consumed message, constructing its context.
    ///
    /// Redeliveries of a coordinate still in flight are dropped without
    /// entering the tracker; the original entry will reply and mark the
    /// offset past them. Contexts are inserted even when the payload fails
    /// to decode, so every admitted offset eventually advances.
    pub async fn admit(
        &self,
        permit: OwnedSemaphorePermit,
        msg: InboundMessage,
        sink: ReplySink,
    ) -> Admission {
        // Header parsing happens before the lock; the map mutex only ever
        // covers map mutations. A redelivery throws the fresh context away.
        let (ctx, parsed) = MsgContext::new(msg, sink);
        let ctx = Arc::new(ctx);
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(ctx.req_offset()) {
            info!(context = %existing, "message already in flight, ignoring redelivery");
            drop(permit);
            return Admission::Duplicate;
        }
        entries.insert(ctx.req_offset().to_string(), ctx.clone());
        permit.forget();
        drop(entries);
        info!(context = %ctx, "message now in flight");
        if parsed {
            Admission::Admitted(ctx)
        } else {
            Admission::BadPayload(ctx)
        }
    }

    /// Record a producer-confirmed reply and advance the partition offset.
    ///
    /// Marks the context complete, then walks the same-partition entries in
    /// offset order: the contiguous completed prefix is removed, the highest
    /// removed offset is marked on the consumer, and that many capacity
    /// permits return to the pool. A confirmation for an unknown coordinate
    /// is a logic bug and is fatal.
    pub async fn complete(&self, req_offset: &str, consumer: &dyn LogConsumer) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let ctx = entries.get(req_offset).cloned().ok_or_else(|| {
            BridgeError::FatalInvariant(format!(
                "received delivery confirmation for message not in flight: {req_offset}"
            ))
        })?;
        ctx.set_complete();

        let mut same_partition: Vec<Arc<MsgContext>> = entries
            .values()
            .filter(|c| c.topic() == ctx.topic() && c.partition() == ctx.partition())
            .cloned()
            .collect();
        same_partition.sort_by_key(|c| c.offset());

        let ready: Vec<Arc<MsgContext>> = same_partition
            .into_iter()
            .take_while(|c| c.is_complete())
            .collect();

        debug!(
            partition = ctx.partition(),
            offset = ctx.offset(),
            in_flight = entries.len(),
            ready = ready.len(),
            "reply confirmed"
        );

        if let Some(highest) = ready.last().cloned() {
            for c in &ready {
                entries.remove(c.req_offset());
            }
            info!(
                partition = highest.partition(),
                offset = highest.offset(),
                "marking offset"
            );
            consumer.mark_offset(highest.raw())?;
            self.capacity.add_permits(ready.len());
        }
        Ok(())
    }

    /// Diagnostic description of an in-flight context, for failure logs
    pub async fn describe(&self, req_offset: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(req_offset)
            .map(|ctx| ctx.to_string())
    }

    /// Number of contexts currently in flight
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
