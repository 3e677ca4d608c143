//! Voice state transitions handed from control threads to the mixer.
//!
//! Changes are pool nodes chained through their links. The queue always keeps
//! one already-applied node as its head; the mixer walks from there to the end
//! of the chain and then releases every node but the last, which becomes the
//! new head. Control threads append a whole batch by linking its first node
//! after the current tail with a single release store.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::VoiceStart;
use crate::error::Result;
use crate::pool::{NIL, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceChangeKind {
    #[default]
    Stop,
    Pause,
    Play,
    Reset,
    /// Starts a voice at a new offset, fading out the old one.
    Restart,
}

/// A one-shot command for the mixer.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceChange {
    pub kind: VoiceChangeKind,
    pub voice: Option<usize>,
    pub old_voice: Option<usize>,
    pub source_id: u64,
    /// Initial state for a voice that starts playing.
    pub start: Option<VoiceStart>,
}

pub struct VoiceChangeQueue {
    pool: Pool<VoiceChange>,
    /// Last node the mixer applied. Mixer only.
    head: AtomicU32,
    /// Last node linked by a control thread.
    tail: Mutex<u32>,
    /// Changes published and applied so far.
    sent: AtomicU64,
    applied: AtomicU64,
}

impl VoiceChangeQueue {
    /// # Errors
    ///
    /// Fails if the initial nodes cannot be allocated.
    pub fn new(capacity: usize) -> Result<Self> {
        let pool = Pool::with_capacity("voice change", capacity.max(1))?;
        let sentinel = pool.acquire(VoiceChange::default())?;
        Ok(Self {
            pool,
            head: AtomicU32::new(sentinel),
            tail: Mutex::new(sentinel),
            sent: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        })
    }

    /// Publishes `changes` as one batch, applied in order by the next drain.
    /// Returns a ticket that [`applied`](Self::applied) reaches once the
    /// whole batch has taken effect.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::ResourceExhausted` if nodes cannot be
    /// allocated; nothing is published in that case.
    pub fn send(&self, changes: &[VoiceChange]) -> Result<u64> {
        if changes.is_empty() {
            return Ok(self.sent.load(Ordering::Acquire));
        }

        let mut first = NIL;
        let mut last = NIL;
        for change in changes {
            let idx = match self.pool.acquire(*change) {
                Ok(idx) => idx,
                Err(err) => {
                    self.release_chain(first);
                    return Err(err);
                }
            };
            if last == NIL {
                first = idx;
            } else if let Some(link) = self.pool.link(last) {
                link.store(idx, Ordering::Relaxed);
            }
            last = idx;
        }

        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = self.pool.link(*tail) {
            link.store(first, Ordering::Release);
        }
        *tail = last;
        let count = changes.len() as u64;
        let ticket = self.sent.fetch_add(count, Ordering::AcqRel) + count;
        log::debug!("Sent {} voice change(s)", changes.len());
        Ok(ticket)
    }

    /// Changes applied so far, comparable with tickets from [`send`](Self::send).
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    fn release_chain(&self, mut idx: u32) {
        while idx != NIL {
            let next = self.pool.next(idx);
            self.pool.release(idx);
            idx = next;
        }
    }

    /// Applies every published change in order. Mixer only, or a control
    /// thread holding the mixer lock.
    pub fn drain(&self, mut apply: impl FnMut(&VoiceChange)) -> usize {
        let mut cur = self.head.load(Ordering::Relaxed);
        let mut count = 0;
        loop {
            let next = self.pool.next(cur);
            if next == NIL {
                break;
            }
            // SAFETY: `next` was published with a release store after its
            // value was written, and the acquire load above observed it.
            if let Some(change) = unsafe { self.pool.get(next) } {
                apply(change);
            }
            self.pool.release(cur);
            cur = next;
            count += 1;
        }
        self.head.store(cur, Ordering::Relaxed);
        self.applied.fetch_add(count as u64, Ordering::Release);
        count
    }
}
