//! Lock-free ring buffer for audio samples
//!
//! Single-producer single-consumer ring of interleaved `f32` samples
//! shared between the I/O context (producer) and the real-time render
//! callback (consumer). Each side owns one cursor and only reads the
//! other's; no locks are taken on either side.
//!
//! Cursors advance monotonically and are reduced modulo capacity on
//! access, so `available_read() + available_write() == capacity()` at
//! all times. Overflow drops the newest samples: the write cursor never
//! laps the read cursor.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    /// Sample storage as raw `f32` bits
    slots: Box<[AtomicU32]>,
    capacity: usize,
    write_idx: CachePadded<AtomicUsize>,
    read_idx: CachePadded<AtomicUsize>,
    /// Samples rejected because the ring was full
    dropped: AtomicU64,
    /// Render cycles that found too few samples
    underruns: AtomicU64,
}

impl Shared {
    fn available_read(&self) -> usize {
        let r = self.read_idx.load(Ordering::Acquire);
        let w = self.write_idx.load(Ordering::Acquire);
        w.wrapping_sub(r).min(self.capacity)
    }

    fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity,
            available: self.available_read(),
            dropped_samples: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

/// Create a ring holding `capacity` samples and split it into its two halves.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    assert!(capacity > 0, "ring capacity must be positive");

    let slots = (0..capacity)
        .map(|_| AtomicU32::new(0.0f32.to_bits()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        slots,
        capacity,
        write_idx: CachePadded::new(AtomicUsize::new(0)),
        read_idx: CachePadded::new(AtomicUsize::new(0)),
        dropped: AtomicU64::new(0),
        underruns: AtomicU64::new(0),
    });

    (
        SampleProducer {
            shared: shared.clone(),
        },
        SampleConsumer { shared },
    )
}

/// Write half. Owned by the I/O context.
pub struct SampleProducer {
    shared: Arc<Shared>,
}

impl SampleProducer {
    /// Write as many samples as fit and return how many were written.
    ///
    /// Samples that do not fit are dropped from the end of `samples`
    /// and counted; unread data is never overwritten.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let shared = &*self.shared;
        let w = shared.write_idx.load(Ordering::Relaxed);
        let r = shared.read_idx.load(Ordering::Acquire);
        let free = shared.capacity - w.wrapping_sub(r);
        let n = samples.len().min(free);

        let start = w % shared.capacity;
        let first = n.min(shared.capacity - start);
        for (slot, &sample) in shared.slots[start..start + first].iter().zip(&samples[..first]) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        for (slot, &sample) in shared.slots[..n - first].iter().zip(&samples[first..n]) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }

        shared.write_idx.store(w.wrapping_add(n), Ordering::Release);

        if n < samples.len() {
            shared
                .dropped
                .fetch_add((samples.len() - n) as u64, Ordering::Relaxed);
        }
        n
    }

    pub fn available_read(&self) -> usize {
        self.shared.available_read()
    }

    pub fn available_write(&self) -> usize {
        self.shared.capacity - self.shared.available_read()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}

/// Read half. Owned by the render callback.
pub struct SampleConsumer {
    shared: Arc<Shared>,
}

impl SampleConsumer {
    /// Fill `dst` with exactly `dst.len()` samples and advance the read cursor.
    ///
    /// Returns `false` without touching the cursor if fewer samples are
    /// available; substituting silence is the caller's decision.
    pub fn pull(&mut self, dst: &mut [f32]) -> bool {
        let shared = &*self.shared;
        let r = shared.read_idx.load(Ordering::Relaxed);
        let w = shared.write_idx.load(Ordering::Acquire);
        let n = dst.len();
        if w.wrapping_sub(r) < n {
            return false;
        }

        let start = r % shared.capacity;
        let first = n.min(shared.capacity - start);
        let (head, tail) = dst.split_at_mut(first);
        for (out, slot) in head.iter_mut().zip(&shared.slots[start..start + first]) {
            *out = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        for (out, slot) in tail.iter_mut().zip(&shared.slots[..n - first]) {
            *out = f32::from_bits(slot.load(Ordering::Relaxed));
        }

        shared.read_idx.store(r.wrapping_add(n), Ordering::Release);
        true
    }

    pub fn available_read(&self) -> usize {
        self.shared.available_read()
    }

    pub fn available_write(&self) -> usize {
        self.shared.capacity - self.shared.available_read()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Count one render cycle that had to output silence
    pub fn record_underrun(&self) {
        self.shared.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub available: usize,
    pub dropped_samples: u64,
    pub underruns: u64,
}
