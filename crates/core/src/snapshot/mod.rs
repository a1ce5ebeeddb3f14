use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One complete, internally consistent set of visualizer values: the spectrum
/// bins, the RMS loudness scalar, and the capture timestamp produced by the
/// same analysis pass.
///
/// The `Default` value (no bins, zero rms and timestamp) doubles as the
/// consumer-facing empty representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bins: Vec<f32>,
    pub rms: f32,
    pub timestamp: f64,
}

/// What a write did to the buffer, so callers can count and log shape
/// changes without the write path ever failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The snapshot was published under the established shape.
    Published,
    /// The bin count changed: the new shape was adopted and every previously
    /// published snapshot was invalidated (implicit reset).
    Reshaped { previous: usize, current: usize },
}

// Role word layout: two bits per slot role plus a freshness flag. The writer
// always owns `back`, the reader always owns `front`, and `middle` carries
// the most recent published snapshot between them.
const FRONT_SHIFT: u8 = 0;
const MIDDLE_SHIFT: u8 = 2;
const BACK_SHIFT: u8 = 4;
const ROLE_MASK: u8 = 0b11;
const FRESH_BIT: u8 = 0b0100_0000;
const INITIAL_ROLES: u8 = (2 << BACK_SHIFT) | (1 << MIDDLE_SHIFT);

const SHAPE_UNSET: usize = usize::MAX;

fn role(state: u8, shift: u8) -> usize {
    ((state >> shift) & ROLE_MASK) as usize
}

struct Slot {
    bins: Vec<f32>,
    rms: f32,
    timestamp: f64,
    /// Write sequence that produced this slot; zero means never written.
    seq: u64,
}

impl Slot {
    fn with_capacity(bin_capacity: usize) -> Self {
        Self {
            bins: Vec::with_capacity(bin_capacity),
            rms: 0.0,
            timestamp: 0.0,
            seq: 0,
        }
    }
}

/// Concurrency-safe storage for the latest snapshot.
///
/// Three preallocated slots rotate through writer/exchange/reader roles via
/// compare-and-swap on a single atomic word, so the producer publishes a
/// fully written slot without ever waiting on the reader and the reader never
/// observes a half-written one. Reset does not touch slot memory at all: it
/// raises a sequence floor below which published slots read as empty.
pub struct SnapshotBuffer {
    slots: [UnsafeCell<Slot>; 3],
    roles: AtomicU8,
    /// Sequence of the most recently published write.
    write_seq: AtomicU64,
    /// Writes at or below this sequence are treated as cleared.
    reset_floor: AtomicU64,
    /// Established bin count; `SHAPE_UNSET` until the first write after
    /// construction or reset.
    shape: AtomicUsize,
    published: AtomicU64,
    dropped: AtomicU64,
    reshaped: AtomicU64,
}

// Safety: slot access is partitioned by the role word. Only the single
// `SnapshotWriter` dereferences the back slot and only the single
// `SnapshotReader` dereferences the front slot; ownership of a slot moves
// between the halves exclusively through the AcqRel CAS swaps below.
unsafe impl Send for SnapshotBuffer {}
unsafe impl Sync for SnapshotBuffer {}

impl SnapshotBuffer {
    fn new(bin_capacity: usize) -> Self {
        Self {
            slots: [
                UnsafeCell::new(Slot::with_capacity(bin_capacity)),
                UnsafeCell::new(Slot::with_capacity(bin_capacity)),
                UnsafeCell::new(Slot::with_capacity(bin_capacity)),
            ],
            roles: AtomicU8::new(INITIAL_ROLES),
            write_seq: AtomicU64::new(0),
            reset_floor: AtomicU64::new(0),
            shape: AtomicUsize::new(SHAPE_UNSET),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reshaped: AtomicU64::new(0),
        }
    }

    /// Clears the latest value and the shape constraint.
    ///
    /// Callable from any thread: the floor store makes every published slot
    /// read as empty without reclaiming memory the reader may be copying.
    pub fn clear(&self) {
        self.reset_floor
            .store(self.write_seq.load(Ordering::Acquire), Ordering::Release);
        self.shape.store(SHAPE_UNSET, Ordering::Release);
    }

    /// Bin count established by the first write of the current shape epoch.
    pub fn shape(&self) -> Option<usize> {
        match self.shape.load(Ordering::Acquire) {
            SHAPE_UNSET => None,
            count => Some(count),
        }
    }

    /// Total snapshots published since construction.
    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Published snapshots that were overwritten before any read (the
    /// drop-latest cases).
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Writes whose bin count differed from the established shape.
    pub fn shape_mismatches(&self) -> u64 {
        self.reshaped.load(Ordering::Relaxed)
    }

    fn invalidate(&self) {
        self.reset_floor
            .store(self.write_seq.load(Ordering::Acquire), Ordering::Release);
    }

    /// Swaps the freshly written back slot into the middle role, superseding
    /// any unread predecessor there.
    fn publish_back(&self) {
        loop {
            let state = self.roles.load(Ordering::Relaxed);
            let back = role(state, BACK_SHIFT);
            let middle = role(state, MIDDLE_SHIFT);
            let front = role(state, FRONT_SHIFT);
            let swapped = ((middle as u8) << BACK_SHIFT)
                | ((back as u8) << MIDDLE_SHIFT)
                | ((front as u8) << FRONT_SHIFT)
                | FRESH_BIT;
            if self
                .roles
                .compare_exchange_weak(state, swapped, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.published.fetch_add(1, Ordering::Relaxed);
                if state & FRESH_BIT != 0 {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
    }

    /// Claims the middle slot for the reader when it holds an unread
    /// snapshot; otherwise the front slot is already the latest.
    fn claim_fresh(&self) {
        loop {
            let state = self.roles.load(Ordering::Relaxed);
            if state & FRESH_BIT == 0 {
                return;
            }
            let back = role(state, BACK_SHIFT);
            let middle = role(state, MIDDLE_SHIFT);
            let front = role(state, FRONT_SHIFT);
            let swapped = ((back as u8) << BACK_SHIFT)
                | ((front as u8) << MIDDLE_SHIFT)
                | ((middle as u8) << FRONT_SHIFT);
            if self
                .roles
                .compare_exchange_weak(state, swapped, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl fmt::Debug for SnapshotBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBuffer")
            .field("shape", &self.shape())
            .field("write_seq", &self.write_seq.load(Ordering::Relaxed))
            .field("reset_floor", &self.reset_floor.load(Ordering::Relaxed))
            .field("published", &self.frames_published())
            .field("dropped", &self.frames_dropped())
            .field("reshaped", &self.shape_mismatches())
            .finish()
    }
}

/// Creates a buffer and splits it into its producer and consumer handles.
///
/// Exactly one of each handle exists, which is what makes the slot ownership
/// argument hold: `write` takes `&mut self` on the sole writer and
/// `read_latest` takes `&mut self` on the sole reader.
pub fn snapshot_buffer(bin_capacity: usize) -> (SnapshotWriter, SnapshotReader) {
    let shared = Arc::new(SnapshotBuffer::new(bin_capacity));
    (
        SnapshotWriter {
            shared: Arc::clone(&shared),
        },
        SnapshotReader { shared },
    )
}

/// Producer half: owned by the audio thread.
pub struct SnapshotWriter {
    shared: Arc<SnapshotBuffer>,
}

impl SnapshotWriter {
    /// Copies one snapshot into owned storage and publishes it.
    ///
    /// Infallible and bounded: atomic loads, stores, one short CAS loop, and
    /// a `copy_from_slice` into preallocated storage. A bin count different
    /// from the established shape adopts the new shape and implicitly resets;
    /// the outcome reports it so the caller can count and log.
    pub fn write(&mut self, bins: &[f32], rms: f32, timestamp: f64) -> WriteOutcome {
        let buf = &*self.shared;
        let outcome = self.apply_shape(bins.len());
        let seq = buf.write_seq.load(Ordering::Relaxed) + 1;

        let back = role(buf.roles.load(Ordering::Acquire), BACK_SHIFT);
        // Safety: this is the sole writer handle and `back` is the slot the
        // role word currently assigns to the writer; the reader cannot touch
        // it until `publish_back` swaps it away.
        let slot = unsafe { &mut *buf.slots[back].get() };
        slot.bins.resize(bins.len(), 0.0);
        slot.bins.copy_from_slice(bins);
        slot.rms = rms;
        slot.timestamp = timestamp;
        slot.seq = seq;

        buf.write_seq.store(seq, Ordering::Release);
        buf.publish_back();
        outcome
    }

    /// Clears the latest value and shape constraint from the producer side.
    pub fn clear(&mut self) {
        self.shared.clear();
    }

    fn apply_shape(&self, count: usize) -> WriteOutcome {
        let buf = &*self.shared;
        let previous = buf.shape.load(Ordering::Acquire);
        if previous == count {
            return WriteOutcome::Published;
        }
        buf.shape.store(count, Ordering::Release);
        if previous == SHAPE_UNSET {
            // First write after construction or reset establishes the shape.
            return WriteOutcome::Published;
        }
        buf.invalidate();
        buf.reshaped.fetch_add(1, Ordering::Relaxed);
        WriteOutcome::Reshaped {
            previous,
            current: count,
        }
    }

    pub(crate) fn shared(&self) -> Arc<SnapshotBuffer> {
        Arc::clone(&self.shared)
    }
}

impl fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotWriter").finish()
    }
}

/// Consumer half: held by whatever drives the consumer execution context.
pub struct SnapshotReader {
    shared: Arc<SnapshotBuffer>,
}

impl SnapshotReader {
    /// Returns a consistent copy of the most recently published snapshot, or
    /// `None` when nothing has been written since construction or since the
    /// last reset.
    ///
    /// Safe to call at arbitrary frequency and concurrently with an in-flight
    /// write: the result is always entirely the previous or entirely the new
    /// snapshot.
    pub fn read_latest(&mut self) -> Option<Snapshot> {
        let buf = &*self.shared;
        buf.claim_fresh();

        let front = role(buf.roles.load(Ordering::Acquire), FRONT_SHIFT);
        // Safety: this is the sole reader handle and `front` is the slot the
        // role word currently assigns to the reader; the writer cannot reuse
        // it until a later `claim_fresh` swap releases it.
        let slot = unsafe { &*buf.slots[front].get() };
        if slot.seq <= buf.reset_floor.load(Ordering::Acquire) {
            return None;
        }
        Some(Snapshot {
            bins: slot.bins.clone(),
            rms: slot.rms,
            timestamp: slot.timestamp,
        })
    }
}

impl fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReader").finish()
    }
}
