use std::sync::atomic::{AtomicU32, Ordering};

use crate::type_alias::Tag;

/// Wrapping tag counter shared by all forwarded calls.
///
/// Tags pair an unexpected request send with its pre-posted expected
/// response receive. Uniqueness is only guaranteed for pairs issued close in
/// time; after `max + 1` allocations the counter has wrapped.
pub struct TagGenerator {
    counter: AtomicU32,
    max: Tag,
}

impl TagGenerator {
    /// Create a generator over `[0, max_tag >> 2]`.
    ///
    /// The top two bits of the transport tag space stay reserved for
    /// internal signalling (e.g. one-sided request tags).
    pub fn new(transport_max_tag: Tag) -> Self {
        Self {
            counter: AtomicU32::new(0),
            max: transport_max_tag >> 2,
        }
    }

    /// Largest tag this generator produces.
    #[inline(always)]
    pub fn max_tag(&self) -> Tag {
        self.max
    }

    /// Produce the next tag, wrapping at the maximum back to zero.
    pub fn next(&self) -> Tag {
        if self
            .counter
            .compare_exchange(self.max, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            0
        } else {
            self.counter.fetch_add(1, Ordering::AcqRel) + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_sequence() {
        // Transport reports 15; two reserved bits leave a maximum of 3.
        let generator = TagGenerator::new(15);
        assert_eq!(generator.max_tag(), 3);

        let tags: Vec<Tag> = (0..5).map(|_| generator.next()).collect();
        assert_eq!(tags, vec![1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_full_coverage_over_one_period() {
        let generator = TagGenerator::new(15);
        let max = generator.max_tag();

        let mut seen = vec![false; max as usize + 1];
        for _ in 0..max + 2 {
            seen[generator.next() as usize] = true;
        }
        assert!(seen.into_iter().all(|s| s));
    }
}
