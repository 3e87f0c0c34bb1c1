use std::num::NonZeroUsize;

/// Groups an iterator into `Vec`s of `size` items; the final group holds the
/// remainder and is never empty.
pub struct Batcher<I> {
    inner: I,
    size: NonZeroUsize,
}

impl<I: Iterator> Batcher<I> {
    pub fn new(inner: I, size: NonZeroUsize) -> Self {
        Self { inner, size }
    }
}

impl<I: Iterator> Iterator for Batcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.size.get();
        let mut batch = Vec::with_capacity(size);
        batch.extend(self.inner.by_ref().take(size));
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(n: usize, s: usize) -> Vec<usize> {
        Batcher::new(0..n, NonZeroUsize::new(s).unwrap())
            .map(|b| b.len())
            .collect()
    }

    #[test]
    fn emits_remainder_last() {
        assert_eq!(sizes(7, 3), vec![3, 3, 1]);
        assert_eq!(sizes(1, 100), vec![1]);
    }

    #[test]
    fn exact_multiple_has_no_short_batch() {
        assert_eq!(sizes(6, 3), vec![3, 3]);
        assert_eq!(sizes(5, 1), vec![1; 5]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(sizes(0, 4).is_empty());
    }

    #[test]
    fn batch_count_and_order_hold_across_sizes() {
        for n in 0..40usize {
            for s in 1..9usize {
                let batches: Vec<Vec<usize>> =
                    Batcher::new(0..n, NonZeroUsize::new(s).unwrap()).collect();
                assert_eq!(batches.len(), n.div_ceil(s), "n={n} s={s}");
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= s));
                let flat: Vec<usize> = batches.into_iter().flatten().collect();
                assert_eq!(flat, (0..n).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn pulls_lazily() {
        let mut pulled = 0;
        let source = std::iter::from_fn(|| {
            pulled += 1;
            Some(pulled)
        });
        let first = Batcher::new(source, NonZeroUsize::new(2).unwrap())
            .next()
            .unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(pulled, 2);
    }
}
