//! Index-addressed node arena with a lock-free free list.
//!
//! Nodes live in fixed 64-entry chunks that are never moved or freed while the
//! pool exists, so an index handed across threads always refers to the same
//! storage. Each node carries a write-once style `link` used to build singly
//! linked chains (voice changes, buffer queues) and a separate `free_next`
//! used only by the free list.
//!
//! Growth takes a mutex and only ever happens on control threads. The mixer
//! thread only reads nodes and returns them with [`Pool::release`], which is a
//! CAS loop.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::{PetalMixError, Result};

/// Null index.
pub const NIL: u32 = u32::MAX;

const CHUNK_BITS: u32 = 6;
const CHUNK_LEN: usize = 1 << CHUNK_BITS;
const MAX_CHUNKS: usize = 1024;

#[inline]
fn pack(tag: u32, idx: u32) -> u64 {
    ((tag as u64) << 32) | idx as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct Node<T> {
    value: UnsafeCell<T>,
    link: AtomicU32,
    free_next: AtomicU32,
}

pub struct Pool<T> {
    name: &'static str,
    chunks: Box<[OnceLock<Box<[Node<T>]>>]>,
    /// Tagged head of the free list, `tag << 32 | index`.
    free_head: AtomicU64,
    grow_lock: Mutex<usize>,
}

// SAFETY: a node's value is only written by the thread that popped it from the
// free list (or that holds it exclusively after taking it out of a mailbox),
// and handed to other threads through release/acquire atomics. Shared reads
// never overlap a write.
unsafe impl<T: Send> Send for Pool<T> {}
// SAFETY: see above; `T: Send + Sync` because references to values are handed
// to the mixer thread while the control thread keeps the pool.
unsafe impl<T: Send + Sync> Sync for Pool<T> {}

impl<T: Default> Pool<T> {
    pub fn new(name: &'static str) -> Self {
        let chunks = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect();
        Self {
            name,
            chunks,
            free_head: AtomicU64::new(pack(0, NIL)),
            grow_lock: Mutex::new(0),
        }
    }

    /// Creates a pool with `count` nodes ready for use.
    pub fn with_capacity(name: &'static str, count: usize) -> Result<Self> {
        let pool = Self::new(name);
        while pool.capacity() < count {
            pool.grow()?;
        }
        Ok(pool)
    }

    /// Number of nodes allocated so far.
    pub fn capacity(&self) -> usize {
        *self.grow_lock.lock().unwrap_or_else(PoisonError::into_inner) * CHUNK_LEN
    }

    fn grow(&self) -> Result<()> {
        let mut used = self.grow_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let chunk_idx = *used;
        let Some(slot) = self.chunks.get(chunk_idx) else {
            return Err(PetalMixError::ResourceExhausted(format!(
                "{} pool is full ({} nodes)",
                self.name,
                MAX_CHUNKS * CHUNK_LEN
            )));
        };

        let nodes: Box<[Node<T>]> = (0..CHUNK_LEN)
            .map(|_| Node {
                value: UnsafeCell::new(T::default()),
                link: AtomicU32::new(NIL),
                free_next: AtomicU32::new(NIL),
            })
            .collect();
        if slot.set(nodes).is_err() {
            return Err(PetalMixError::Engine(format!(
                "{} pool chunk {} initialized twice",
                self.name, chunk_idx
            )));
        }
        *used += 1;

        let base = (chunk_idx * CHUNK_LEN) as u32;
        for i in (0..CHUNK_LEN as u32).rev() {
            self.release(base + i);
        }
        log::debug!(
            "Grew {} pool to {} nodes",
            self.name,
            (chunk_idx + 1) * CHUNK_LEN
        );
        Ok(())
    }

    /// Takes a free node, storing `value` in it. The node's link is reset to
    /// [`NIL`]. Control thread only.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::ResourceExhausted` if the pool cannot grow.
    pub fn acquire(&self, value: T) -> Result<u32> {
        loop {
            if let Some(idx) = self.pop() {
                let Some(node) = self.node(idx) else {
                    continue;
                };
                // SAFETY: the node was just removed from the free list, no
                // other thread can reach it until its index is published.
                unsafe { *node.value.get() = value };
                node.link.store(NIL, Ordering::Relaxed);
                return Ok(idx);
            }
            self.grow()?;
        }
    }

    fn pop(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (tag, idx) = unpack(head);
            if idx == NIL {
                return None;
            }
            let next = self.node(idx)?.free_next.load(Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(idx),
                Err(actual) => head = actual,
            }
        }
    }
}

impl<T> Pool<T> {
    #[inline]
    fn node(&self, idx: u32) -> Option<&Node<T>> {
        let idx = idx as usize;
        self.chunks
            .get(idx >> CHUNK_BITS)?
            .get()
            .map(|chunk| &chunk[idx & (CHUNK_LEN - 1)])
    }

    /// Returns a node to the free list. Lock-free, safe on the mixer thread.
    ///
    /// The value stays in place until the node is acquired again, so anything
    /// it owns is dropped by the next [`acquire`](Pool::acquire) on a control
    /// thread.
    pub fn release(&self, idx: u32) {
        let Some(node) = self.node(idx) else {
            return;
        };
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            node.free_next.store(top, Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), idx),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Forward link of a node, for building chains.
    pub fn link(&self, idx: u32) -> Option<&AtomicU32> {
        self.node(idx).map(|n| &n.link)
    }

    /// Follows a node's link with acquire ordering, [`NIL`] at the end.
    pub fn next(&self, idx: u32) -> u32 {
        self.link(idx)
            .map_or(NIL, |link| link.load(Ordering::Acquire))
    }

    /// Shared access to a node's value.
    ///
    /// # Safety
    ///
    /// The index must have been obtained through an acquire handoff from the
    /// thread that filled it, and no thread may be writing the value.
    pub unsafe fn get(&self, idx: u32) -> Option<&T> {
        // SAFETY: upheld by the caller.
        self.node(idx).map(|n| unsafe { &*n.value.get() })
    }

    /// Exclusive access to a node's value.
    ///
    /// # Safety
    ///
    /// The caller must own the node exclusively, for example after taking
    /// it out of a [`Mailbox`] or before publishing its index.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, idx: u32) -> Option<&mut T> {
        // SAFETY: upheld by the caller.
        self.node(idx).map(|n| unsafe { &mut *n.value.get() })
    }
}

/// Single-slot handoff of a pool node from control threads to the mixer.
///
/// Publishing replaces any unconsumed node, which goes back to the pool, so
/// the mixer always sees the latest snapshot and sees it once.
#[derive(Debug)]
pub struct Mailbox(AtomicU32);

impl Default for Mailbox {
    fn default() -> Self {
        Self(AtomicU32::new(NIL))
    }
}

impl Mailbox {
    pub fn publish<T>(&self, pool: &Pool<T>, idx: u32) {
        let old = self.0.swap(idx, Ordering::AcqRel);
        if old != NIL {
            pool.release(old);
        }
    }

    /// Takes the pending node, if any. The caller owns it until released.
    pub fn take(&self) -> Option<u32> {
        let idx = self.0.swap(NIL, Ordering::AcqRel);
        (idx != NIL).then_some(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release_reuses_nodes() {
        let pool: Pool<u32> = Pool::new("test");
        let a = pool.acquire(7).unwrap();
        assert_eq!(unsafe { pool.get(a) }, Some(&7));
        pool.release(a);
        let b = pool.acquire(9).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { pool.get(b) }, Some(&9));
    }

    #[test]
    fn test_grows_past_one_chunk() {
        let pool: Pool<u64> = Pool::new("test");
        let indices: HashSet<u32> = (0..200).map(|i| pool.acquire(i).unwrap()).collect();
        assert_eq!(indices.len(), 200);
        assert_eq!(pool.capacity(), 256);
    }

    #[test]
    fn test_links_reset_on_acquire() {
        let pool: Pool<u8> = Pool::new("test");
        let a = pool.acquire(0).unwrap();
        let b = pool.acquire(1).unwrap();
        pool.link(a).unwrap().store(b, Ordering::Release);
        assert_eq!(pool.next(a), b);
        pool.release(a);
        let c = pool.acquire(2).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.next(c), NIL);
    }

    #[test]
    fn test_mailbox_keeps_latest() {
        let pool: Pool<u32> = Pool::with_capacity("test", 4).unwrap();
        let mailbox = Mailbox::default();
        let first = pool.acquire(1).unwrap();
        mailbox.publish(&pool, first);
        let second = pool.acquire(2).unwrap();
        mailbox.publish(&pool, second);

        let taken = mailbox.take().unwrap();
        assert_eq!(unsafe { pool.get(taken) }, Some(&2));
        assert!(mailbox.take().is_none());
        // The replaced node went back to the free list.
        assert_eq!(pool.acquire(3).unwrap(), first);
    }

    #[test]
    fn test_concurrent_release() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::with_capacity("test", 128).unwrap());
        let nodes: Vec<u32> = (0..128).map(|i| pool.acquire(i).unwrap()).collect();
        let (left, right) = nodes.split_at(64);
        let (left, right) = (left.to_vec(), right.to_vec());

        let p = pool.clone();
        let handle = std::thread::spawn(move || {
            for idx in left {
                p.release(idx);
            }
        });
        for idx in right {
            pool.release(idx);
        }
        handle.join().unwrap();

        let again: HashSet<u32> = (0..128).map(|i| pool.acquire(i).unwrap()).collect();
        assert_eq!(again.len(), 128);
        assert_eq!(pool.capacity(), 128);
    }
}
