//! Small deterministic helpers shared by the exchange and the harness.

use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Tiny `SplitMix64` generator. Seeded explicitly so that re-running a map task
/// over the same input makes the same choices.
#[derive(Clone, Copy, Debug)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline]
    pub const fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    #[allow(clippy::cast_precision_loss)]
    pub fn next_f64(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        ((self.next_u64() >> 11) as f64) * SCALE
    }

    /// Uniform in `[0, n)`; `n` must be non-zero.
    #[inline]
    pub fn next_below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// Fixed-size uniform sample of a stream (priority sampling with unit
/// weights: every item draws a random priority and the `k` highest survive).
///
/// Items are only moved into the reservoir, so callers decide what to copy
/// before offering.
#[derive(Debug)]
pub struct Reservoir<T> {
    k: usize,
    rng: SplitMix64,
    seen: u64,
    heap: BinaryHeap<Reverse<(OrderedFloat<f64>, u64)>>,
    items: Vec<Option<T>>,
    slot_of: HashMap<u64, usize>,
}

impl<T> Reservoir<T> {
    #[must_use]
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            rng: SplitMix64::new(seed.wrapping_mul(0xA24B_AED4_0B9C_497C)),
            seen: 0,
            heap: BinaryHeap::new(),
            items: Vec::new(),
            slot_of: HashMap::new(),
        }
    }

    /// Number of items offered so far.
    #[must_use]
    pub const fn seen(&self) -> u64 {
        self.seen
    }

    /// Whether an item offered now would be kept. Lets callers skip copying
    /// items that are about to be discarded.
    pub fn admit(&mut self) -> Option<Ticket> {
        let seq = self.seen;
        self.seen += 1;
        if self.k == 0 {
            return None;
        }
        let priority = OrderedFloat(self.rng.next_f64());
        if self.heap.len() < self.k {
            return Some(Ticket { priority, seq });
        }
        match self.heap.peek() {
            Some(Reverse((lowest, _))) if priority > *lowest => Some(Ticket { priority, seq }),
            _ => None,
        }
    }

    /// Store an admitted item, evicting the lowest priority one if full.
    pub fn insert(&mut self, ticket: Ticket, item: T) {
        if self.heap.len() >= self.k {
            if let Some(Reverse((_, evicted))) = self.heap.pop() {
                if let Some(slot) = self.slot_of.remove(&evicted) {
                    self.items[slot] = None;
                }
            }
        }
        self.slot_of.insert(ticket.seq, self.items.len());
        self.items.push(Some(item));
        self.heap.push(Reverse((ticket.priority, ticket.seq)));
    }

    /// Surviving items in arrival order.
    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items.into_iter().flatten().collect()
    }
}

/// Admission granted by [`Reservoir::admit`].
#[derive(Clone, Copy, Debug)]
pub struct Ticket {
    priority: OrderedFloat<f64>,
    seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_keeps_at_most_k() {
        let mut r = Reservoir::new(5, 7);
        for i in 0..100 {
            if let Some(t) = r.admit() {
                r.insert(t, i);
            }
        }
        assert_eq!(r.seen(), 100);
        let items = r.into_items();
        assert_eq!(items.len(), 5);
        assert!(items.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reservoir_keeps_everything_when_small() {
        let mut r = Reservoir::new(10, 1);
        for i in 0..4 {
            if let Some(t) = r.admit() {
                r.insert(t, i);
            }
        }
        assert_eq!(r.into_items(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn split_mix_is_deterministic() {
        let mut a = SplitMix64::new(3);
        let mut b = SplitMix64::new(3);
        assert_eq!(a.next_u64(), b.next_u64());
        assert!(a.next_f64() < 1.0);
    }
}
