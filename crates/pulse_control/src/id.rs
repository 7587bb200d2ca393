//! Instance identity allocation

use parking_lot::Mutex;

/// Hands out strictly increasing ids, starting at 1
///
/// Ids live only as long as the process; nothing is persisted.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: Mutex<u64>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let mut last = self.last.lock();
        *last += 1;
        *last
    }

    /// Highest id handed out so far (0 if none)
    pub fn current(&self) -> u64 {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_one() {
        let ids = IdAllocator::new();
        assert_eq!(ids.current(), 0);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.current(), 2);
    }

    #[test]
    fn test_concurrent_ids_are_contiguous() {
        let ids = Arc::new(IdAllocator::new());
        for _ in 0..5 {
            ids.next();
        }
        let high_water = ids.current();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let all: BTreeSet<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(all.len(), 800);
        assert_eq!(all.first().copied(), Some(high_water + 1));
        assert_eq!(all.last().copied(), Some(high_water + 800));
    }
}
