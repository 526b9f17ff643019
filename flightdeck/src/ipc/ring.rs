//! Lock-free MPMC ring of fixed-size byte frames inside a shared region.
//!
//! The algorithm is Dmitry Vyukov's bounded MPMC queue with per-slot
//! sequence numbers:
//!
//! - Each slot has an atomic sequence number, initially `2 * index`
//! - Producers CAS `head` once `slot.seq == 2 * pos`, write, then publish
//!   with `slot.seq = 2 * pos + 1`
//! - Consumers CAS `tail` once `slot.seq == 2 * pos + 1`, read, then release
//!   with `slot.seq = 2 * (pos + capacity)`
//!
//! Sequences step by two so that "published for `pos`" (odd) never equals
//! "free for `pos + 1`" (even), which a single-slot ring would otherwise
//! confuse.
//!
//! Both ends are lock-free for any number of processes, which lets the
//! orchestrator drain a channel while workers still hold handles to it.
//!
//! # Layout
//!
//! ```text
//! ┌────────────┬───────────┬───────────┬──────────┬────────┬────────┬─────
//! │ RingHeader │ Producer  │ Consumer  │ Control  │ slot 0 │ slot 1 │ ...
//! │ (64 B)     │ head (64) │ tail (64) │ (64 B)   │ stride │ stride │
//! └────────────┴───────────┴───────────┴──────────┴────────┴────────┴─────
//! slot = SlotHeader { seq, len } followed by `frame_capacity` payload bytes
//! ```

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::backoff::{Backoff, Deadline};

const INIT_MAGIC: u64 = 0x4644_5249_4E47_4F4B; // "FDRINGOK"
const LAYOUT_VERSION: u64 = 2;
const CACHE_LINE: usize = 64;

/// How long [`Ring::attach`] waits for the creator's init marker.
pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Immutable description of a ring, written once by the creator.
#[repr(C)]
#[repr(align(64))]
struct RingHeader {
    init: AtomicU64,
    version: u64,
    capacity: u64,
    frame_capacity: u64,
    type_hash: u64,
}

#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    head: AtomicUsize,
}

#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    tail: AtomicUsize,
}

/// Shutdown bookkeeping shared by every endpoint.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ControlState {
    /// Set while the channel is drained; producers and consumers bail out.
    pub(crate) drained: AtomicBool,
    /// Producers currently between their drained check and their push.
    pub(crate) inflight: AtomicUsize,
}

#[repr(C)]
struct Control {
    header: RingHeader,
    producer: ProducerState,
    consumer: ConsumerState,
    control: ControlState,
}

#[repr(C)]
struct SlotHeader {
    /// - Initial: 2 * slot index
    /// - After producer write: 2 * position + 1
    /// - After consumer read: 2 * (position + capacity)
    seq: AtomicUsize,
    len: AtomicU32,
}

/// Sizes of a ring; identical on both sides of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingLayout {
    pub(crate) capacity: usize,
    pub(crate) frame_capacity: usize,
}

impl RingLayout {
    /// Creates a layout, `None` if either size is zero or overflows.
    pub(crate) fn new(capacity: usize, frame_capacity: usize) -> Option<Self> {
        if capacity == 0 || frame_capacity == 0 || frame_capacity > u32::MAX as usize {
            return None;
        }
        let layout = Self {
            capacity,
            frame_capacity,
        };
        layout.checked_region_len().map(|_| layout)
    }

    fn stride(&self) -> usize {
        (size_of::<SlotHeader>() + self.frame_capacity).next_multiple_of(CACHE_LINE)
    }

    fn checked_region_len(&self) -> Option<usize> {
        self.stride()
            .checked_mul(self.capacity)?
            .checked_add(size_of::<Control>())
    }

    /// Total bytes the shared region must hold.
    pub(crate) fn region_len(&self) -> usize {
        size_of::<Control>() + self.stride() * self.capacity
    }
}

/// View of a ring living in a mapped region.
///
/// Holds a raw pointer, so the owner must keep the mapping alive for as long
/// as the view exists.
#[derive(Debug)]
pub(crate) struct Ring {
    base: NonNull<u8>,
    layout: RingLayout,
    stride: usize,
}

// SAFETY: every access to the shared bytes goes through the slot sequence
// protocol or through atomics in the control block.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

/// Why a mapped region could not be attached as a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachError {
    NotInitialized,
    VersionMismatch(u64),
    Truncated { needed: usize, actual: usize },
}

impl Ring {
    /// Lays out a fresh ring at `base` and publishes the init marker.
    ///
    /// # Safety
    ///
    /// `base` must be 64-byte aligned, valid for `layout.region_len()` bytes,
    /// and not yet visible to any other process.
    pub(crate) unsafe fn init(base: NonNull<u8>, layout: RingLayout, type_hash: u64) -> Self {
        let control = base.cast::<Control>().as_ptr();
        unsafe {
            std::ptr::addr_of_mut!((*control).header).write(RingHeader {
                init: AtomicU64::new(0),
                version: LAYOUT_VERSION,
                capacity: layout.capacity as u64,
                frame_capacity: layout.frame_capacity as u64,
                type_hash,
            });
            std::ptr::addr_of_mut!((*control).producer).write(ProducerState {
                head: AtomicUsize::new(0),
            });
            std::ptr::addr_of_mut!((*control).consumer).write(ConsumerState {
                tail: AtomicUsize::new(0),
            });
            std::ptr::addr_of_mut!((*control).control).write(ControlState {
                drained: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
            });
        }

        let ring = Self {
            base,
            layout,
            stride: layout.stride(),
        };
        for i in 0..layout.capacity {
            unsafe {
                ring.slot_ptr(i).write(SlotHeader {
                    seq: AtomicUsize::new(free_seq(i)),
                    len: AtomicU32::new(0),
                });
            }
        }

        ring.control().header.init.store(INIT_MAGIC, Ordering::Release);
        ring
    }

    /// Attaches to a ring another process initialized.
    ///
    /// # Safety
    ///
    /// `base` must be valid for `len` bytes for the lifetime of the view.
    pub(crate) unsafe fn attach(
        base: NonNull<u8>,
        len: usize,
        timeout: Duration,
    ) -> Result<Self, AttachError> {
        if len < size_of::<Control>() {
            return Err(AttachError::Truncated {
                needed: size_of::<Control>(),
                actual: len,
            });
        }
        let control = unsafe { base.cast::<Control>().as_ref() };

        let deadline = Deadline::after(timeout.into());
        let mut backoff = Backoff::new();
        while control.header.init.load(Ordering::Acquire) != INIT_MAGIC {
            if deadline.expired() {
                return Err(AttachError::NotInitialized);
            }
            backoff.snooze(&deadline);
        }

        if control.header.version != LAYOUT_VERSION {
            return Err(AttachError::VersionMismatch(control.header.version));
        }
        let layout = RingLayout {
            capacity: control.header.capacity as usize,
            frame_capacity: control.header.frame_capacity as usize,
        };
        let needed = layout.region_len();
        if len < needed {
            return Err(AttachError::Truncated {
                needed,
                actual: len,
            });
        }
        Ok(Self {
            base,
            layout,
            stride: layout.stride(),
        })
    }

    fn control(&self) -> &Control {
        // SAFETY: init/attach established the control block at `base`.
        unsafe { self.base.cast::<Control>().as_ref() }
    }

    fn slot_ptr(&self, index: usize) -> *mut SlotHeader {
        debug_assert!(index < self.layout.capacity);
        // SAFETY: index < capacity keeps the offset inside the region.
        unsafe {
            self.base
                .as_ptr()
                .add(size_of::<Control>() + index * self.stride)
                .cast::<SlotHeader>()
        }
    }

    fn slot(&self, index: usize) -> &SlotHeader {
        // SAFETY: slots are initialized before the init marker is published.
        unsafe { &*self.slot_ptr(index) }
    }

    fn payload_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: the payload follows the slot header inside the same stride.
        unsafe { self.slot_ptr(index).cast::<u8>().add(size_of::<SlotHeader>()) }
    }

    /// Number of slots.
    pub(crate) fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Largest payload a slot holds.
    pub(crate) fn frame_capacity(&self) -> usize {
        self.layout.frame_capacity
    }

    pub(crate) fn type_hash(&self) -> u64 {
        self.control().header.type_hash
    }

    pub(crate) fn state(&self) -> &ControlState {
        &self.control().control
    }

    /// Approximate number of queued frames.
    pub(crate) fn len(&self) -> usize {
        let tail = self.control().consumer.tail.load(Ordering::Acquire);
        let head = self.control().producer.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.layout.capacity)
    }

    /// Copies `bytes` into the next free slot.
    ///
    /// Returns `false` if the ring is full. `bytes` must fit in a frame.
    pub(crate) fn push(&self, bytes: &[u8]) -> bool {
        debug_assert!(bytes.len() <= self.layout.frame_capacity);
        let head = &self.control().producer.head;
        loop {
            let pos = head.load(Ordering::Relaxed);
            let index = pos % self.layout.capacity;
            let slot = self.slot(index);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(free_seq(pos)) as isize;

            if diff == 0 {
                if head
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS gave this producer exclusive ownership
                    // of the slot until it publishes the new sequence.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            self.payload_ptr(index),
                            bytes.len(),
                        );
                    }
                    slot.len.store(bytes.len() as u32, Ordering::Relaxed);
                    slot.seq.store(published_seq(pos), Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                return false;
            }
        }
    }

    /// Pops the oldest frame and hands its bytes to `read`.
    ///
    /// Returns `None` if the ring is empty.
    pub(crate) fn pop_with<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let tail = &self.control().consumer.tail;
        loop {
            let pos = tail.load(Ordering::Relaxed);
            let index = pos % self.layout.capacity;
            let slot = self.slot(index);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(published_seq(pos)) as isize;

            if diff == 0 {
                if tail
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let len = (slot.len.load(Ordering::Relaxed) as usize)
                        .min(self.layout.frame_capacity);
                    // SAFETY: the sequence check shows the producer finished
                    // writing and the CAS makes this consumer the only reader.
                    let bytes =
                        unsafe { std::slice::from_raw_parts(self.payload_ptr(index), len) };
                    let out = read(bytes);
                    slot.seq.store(
                        free_seq(pos.wrapping_add(self.layout.capacity)),
                        Ordering::Release,
                    );
                    return Some(out);
                }
            } else if diff < 0 {
                return None;
            }
        }
    }

    /// Pops and discards one frame.
    pub(crate) fn discard(&self) -> bool {
        self.pop_with(|_| ()).is_some()
    }
}

/// Sequence of a slot ready to take the item for `pos`.
fn free_seq(pos: usize) -> usize {
    pos.wrapping_mul(2)
}

/// Sequence of a slot holding the item written at `pos`.
fn published_seq(pos: usize) -> usize {
    pos.wrapping_mul(2).wrapping_add(1)
}
