// Event channel
//
// Bridges trapping threads to an async consumer. Trap handlers run on
// application threads and must never block, so delivery is a `try_send` into a
// bounded channel; when the consumer falls behind, events are dropped and
// logged.

use crate::events::{Event, EventSink, EventType};
use crate::types::ThreadId;
use crate::wire::encode_event_packet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest number of events folded into one wire packet
pub const MAX_BATCH: usize = 64;

/// Create a sink/receiver pair sharing a channel of `capacity` events.
///
/// All event kinds start disabled.
pub fn event_channel(capacity: usize) -> (ChannelSink, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = ChannelSink {
        enabled: AtomicU32::new(0),
        closed_reported: AtomicBool::new(false),
        tx,
    };
    (sink, EventReceiver { rx, next_packet_id: 1 })
}

/// `EventSink` that forwards over a bounded channel
pub struct ChannelSink {
    enabled: AtomicU32,
    closed_reported: AtomicBool,
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn set_enabled(&self, kind: EventType, enabled: bool) {
        if enabled {
            self.enabled.fetch_or(kind.bit(), Ordering::AcqRel);
        } else {
            self.enabled.fetch_and(!kind.bit(), Ordering::AcqRel);
        }
        debug!("Event {:?} enabled={}", kind, enabled);
    }

    pub fn enable(&self, kind: EventType) {
        self.set_enabled(kind, true);
    }

    pub fn disable(&self, kind: EventType) {
        self.set_enabled(kind, false);
    }

    pub fn is_enabled(&self, kind: EventType) -> bool {
        self.enabled.load(Ordering::Acquire) & kind.bit() != 0
    }

    pub fn enabled(&self) -> Vec<EventType> {
        EventType::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

impl EventSink for ChannelSink {
    fn wants(&self, kind: EventType, _thread: ThreadId) -> bool {
        self.is_enabled(kind) && !self.tx.is_closed()
    }

    fn deliver(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                error!(
                    "Event channel full! Dropping {:?} event for thread {}. Consider increasing event_queue_capacity or consuming events faster.",
                    event.kind(),
                    event.thread()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if !self.closed_reported.swap(true, Ordering::Relaxed) {
                    warn!("Event receiver dropped, future events will be discarded");
                }
            }
        }
    }
}

/// Consumer side of `event_channel`
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    next_packet_id: u32,
}

impl EventReceiver {
    /// Wait for the next event. `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for one event, then take whatever else is already queued, up to
    /// `max` in total.
    pub async fn recv_batch(&mut self, max: usize) -> Option<Vec<Event>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Write events to `writer` as composite event packets until the channel
    /// closes. Returns the number of packets written.
    pub async fn forward<W>(mut self, writer: &mut W, suspend_policy: u8) -> std::io::Result<u32>
    where
        W: AsyncWrite + Unpin,
    {
        info!("Event forwarder started");
        let mut packets = 0;

        while let Some(batch) = self.recv_batch(MAX_BATCH).await {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);

            let packet = encode_event_packet(id, suspend_policy, &batch);
            debug!("Writing event packet id={} with {} events", id, batch.len());

            if let Err(e) = writer.write_all(&packet).await {
                error!("Failed to write event packet: {}", e);
                return Err(e);
            }
            writer.flush().await?;
            packets += 1;
        }

        info!("Event forwarder shutting down after {} packets", packets);
        Ok(packets)
    }
}
