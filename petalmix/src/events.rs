//! Event types for PetalMix
//!
//! The mixer reports state changes through a bounded ring it never blocks on.
//! A dedicated thread drains the ring, drops retired effect states off the
//! real-time path, and forwards everything else to the application as
//! [`PetalMixEvent`]s.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::effect::EffectState;
use crate::error::{PetalMixError, Result};

/// Play state as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Which events the mixer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const SOURCE_STATE: Self = Self(1 << 0);
    pub const BUFFER_COMPLETED: Self = Self(1 << 1);
    pub const DISCONNECTED: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Longest disconnect message carried by an event, in bytes.
pub const MAX_MESSAGE_LEN: usize = 244;

/// Fixed-size text that can cross the ring without allocating.
#[derive(Clone, Copy)]
pub struct EventMessage {
    len: u8,
    bytes: [u8; MAX_MESSAGE_LEN],
}

impl EventMessage {
    /// Copies `text`, truncated on a character boundary.
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(MAX_MESSAGE_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0; MAX_MESSAGE_LEN];
        bytes[..end].copy_from_slice(&text.as_bytes()[..end]);
        Self {
            len: end as u8,
            bytes,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// What travels through the ring.
pub enum AsyncEvent {
    SourceStateChanged { source_id: u64, state: SourceState },
    BufferCompleted { source_id: u64, count: u32 },
    Disconnected { message: EventMessage },
    /// An effect state replaced on the mixer, to be dropped off the mixer.
    ReleaseEffectState(Box<dyn EffectState>),
    KillThread,
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceStateChanged { source_id, state } => f
                .debug_struct("SourceStateChanged")
                .field("source_id", source_id)
                .field("state", state)
                .finish(),
            Self::BufferCompleted { source_id, count } => f
                .debug_struct("BufferCompleted")
                .field("source_id", source_id)
                .field("count", count)
                .finish(),
            Self::Disconnected { message } => f
                .debug_struct("Disconnected")
                .field("message", message)
                .finish(),
            Self::ReleaseEffectState(_) => f.write_str("ReleaseEffectState"),
            Self::KillThread => f.write_str("KillThread"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PetalMixEvent {
    SourceStateChanged { source_id: u64, state: SourceState },
    BufferCompleted { source_id: u64, count: u32 },
    Disconnected { message: String },
    /// Events lost because the ring was full.
    EventsDropped { count: u32 },
}

impl PetalMixEvent {
    pub fn source_id(&self) -> Option<u64> {
        match self {
            Self::SourceStateChanged { source_id, .. } | Self::BufferCompleted { source_id, .. } => {
                Some(*source_id)
            }
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::EventsDropped { .. })
    }

    pub fn is_source_event(&self) -> bool {
        matches!(
            self,
            Self::SourceStateChanged { .. } | Self::BufferCompleted { .. }
        )
    }
}

/// State-change and disconnect events waiting for room in the ring.
const RETRY_SLOTS: usize = 16;

/// How long shutdown keeps handing parked events to a live event thread.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Mixer side of the event ring.
pub struct EventSink {
    producer: HeapProd<AsyncEvent>,
    retry: [Option<AsyncEvent>; RETRY_SLOTS],
    dropped: Arc<AtomicU32>,
    stopping: Arc<AtomicBool>,
    waker: thread::Thread,
}

impl EventSink {
    /// Posts a best-effort event. Returns it when the ring is full.
    pub fn post(&mut self, event: AsyncEvent) -> std::result::Result<(), AsyncEvent> {
        self.producer.try_push(event)
    }

    /// Posts an event that must not be lost: if the ring is full it waits in
    /// a retry slot for the next [`flush`](Self::flush).
    /// Parked events keep their order ahead of new ones.
    pub fn post_reliable(&mut self, event: AsyncEvent) {
        let pushed = if self.retry.iter().any(Option::is_some) {
            Err(event)
        } else {
            self.producer.try_push(event)
        };
        if let Err(event) = pushed {
            match self.retry.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(event),
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Counts a best-effort event that didn't fit.
    pub fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Retries parked events in order and wakes the event thread.
    pub fn flush(&mut self) {
        let mut sent = 0;
        for slot in self.retry.iter_mut() {
            let Some(event) = slot.take() else {
                break;
            };
            if let Err(event) = self.producer.try_push(event) {
                *slot = Some(event);
                break;
            }
            sent += 1;
        }
        self.retry.rotate_left(sent);
        self.waker.unpark();
    }

    pub fn pending_retries(&self) -> usize {
        self.retry.iter().filter(|slot| slot.is_some()).count()
    }

    /// Hands parked events to the event thread, then tells it to exit once
    /// the ring is empty. Never blocks on ring capacity past the grace period.
    /// Control side only.
    pub fn shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.pending_retries() > 0 && Instant::now() < deadline {
            self.flush();
            thread::yield_now();
        }
        let _ = self.producer.try_push(AsyncEvent::KillThread);
        self.stopping.store(true, Ordering::Release);
        self.waker.unpark();
    }
}

/// Application side: the thread draining the ring.
pub struct EventThread {
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Creates the ring and starts the thread forwarding events to `sender`.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Engine` if the thread cannot be spawned.
    pub fn spawn(capacity: usize, sender: Sender<PetalMixEvent>) -> Result<(Self, EventSink)> {
        let (producer, consumer) = HeapRb::<AsyncEvent>::new(capacity.max(1)).split();
        let dropped = Arc::new(AtomicU32::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_dropped = dropped.clone();
        let thread_stopping = stopping.clone();

        let handle = thread::Builder::new()
            .name("petalmix-events".into())
            .spawn(move || event_loop(consumer, sender, thread_dropped, thread_stopping))
            .map_err(|e| PetalMixError::Engine(format!("Failed to spawn event thread: {}", e)))?;

        let sink = EventSink {
            producer,
            retry: std::array::from_fn(|_| None),
            dropped,
            stopping,
            waker: handle.thread().clone(),
        };
        Ok((
            Self {
                handle: Some(handle),
            },
            sink,
        ))
    }

    /// Waits for the thread after [`EventSink::shutdown`].
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Event thread panicked");
            }
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.join();
    }
}

fn event_loop(
    mut consumer: HeapCons<AsyncEvent>,
    sender: Sender<PetalMixEvent>,
    dropped: Arc<AtomicU32>,
    stopping: Arc<AtomicBool>,
) {
    log::debug!("Event thread started");
    loop {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            log::warn!("Event ring full, dropped {} event(s)", lost);
            let _ = sender.send(PetalMixEvent::EventsDropped { count: lost });
        }

        // Read before popping: every push happens before the flag is set.
        let stop = stopping.load(Ordering::Acquire);
        let Some(event) = consumer.try_pop() else {
            if stop {
                break;
            }
            thread::park_timeout(Duration::from_millis(20));
            continue;
        };

        let forwarded = match event {
            AsyncEvent::KillThread => break,
            AsyncEvent::ReleaseEffectState(state) => {
                drop(state);
                continue;
            }
            AsyncEvent::SourceStateChanged { source_id, state } => {
                PetalMixEvent::SourceStateChanged { source_id, state }
            }
            AsyncEvent::BufferCompleted { source_id, count } => {
                PetalMixEvent::BufferCompleted { source_id, count }
            }
            AsyncEvent::Disconnected { message } => {
                log::error!("Device disconnected: {}", message.as_str());
                PetalMixEvent::Disconnected {
                    message: message.as_str().to_owned(),
                }
            }
        };
        // The application may have stopped listening; events are advisory.
        let _ = sender.send(forwarded);
    }
    log::debug!("Event thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_message_truncates_on_char_boundary() {
        let text = "é".repeat(200);
        let msg = EventMessage::new(&text);
        assert!(msg.as_str().len() <= MAX_MESSAGE_LEN);
        assert_eq!(msg.as_str().len() % 2, 0);
        assert_eq!(EventMessage::new("lost device").as_str(), "lost device");
    }

    #[test]
    fn test_mask() {
        let mask = EventMask::SOURCE_STATE | EventMask::DISCONNECTED;
        assert!(mask.contains(EventMask::SOURCE_STATE));
        assert!(!mask.contains(EventMask::BUFFER_COMPLETED));
        assert_eq!(EventMask::from_bits(0xff), EventMask::ALL);
    }

    #[test]
    fn test_events_reach_the_application() {
        let (tx, rx) = unbounded();
        let (mut thread, mut sink) = EventThread::spawn(8, tx).unwrap();
        sink.post_reliable(AsyncEvent::SourceStateChanged {
            source_id: 3,
            state: SourceState::Playing,
        });
        sink.post(AsyncEvent::BufferCompleted {
            source_id: 3,
            count: 2,
        })
        .unwrap();
        sink.shutdown();
        thread.join();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PetalMixEvent::SourceStateChanged {
                    source_id: 3,
                    state: SourceState::Playing
                },
                PetalMixEvent::BufferCompleted {
                    source_id: 3,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn test_full_ring_parks_reliable_events() {
        let (producer, _consumer) = HeapRb::<AsyncEvent>::new(1).split();
        let mut sink = EventSink {
            producer,
            retry: std::array::from_fn(|_| None),
            dropped: Arc::new(AtomicU32::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            waker: thread::current(),
        };
        sink.post_reliable(AsyncEvent::BufferCompleted {
            source_id: 1,
            count: 1,
        });
        sink.post_reliable(AsyncEvent::SourceStateChanged {
            source_id: 1,
            state: SourceState::Stopped,
        });
        assert_eq!(sink.pending_retries(), 1);
        sink.flush();
        assert_eq!(sink.pending_retries(), 1);
    }

    #[test]
    fn test_shutdown_with_parked_events() {
        let (tx, rx) = unbounded();
        let (mut thread, mut sink) = EventThread::spawn(1, tx).unwrap();
        for source_id in 0..10 {
            sink.post_reliable(AsyncEvent::SourceStateChanged {
                source_id,
                state: SourceState::Stopped,
            });
        }
        sink.shutdown();
        thread.join();

        let ids: Vec<_> = rx.try_iter().filter_map(|e| e.source_id()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_with_full_retry_slots() {
        let (tx, _rx) = unbounded();
        let (mut thread, mut sink) = EventThread::spawn(1, tx).unwrap();
        for source_id in 0..40 {
            sink.post_reliable(AsyncEvent::SourceStateChanged {
                source_id,
                state: SourceState::Playing,
            });
        }
        sink.shutdown();
        thread.join();
        assert_eq!(sink.pending_retries(), 0);
    }
}
