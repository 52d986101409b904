use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Stable k-way merge of individually sorted sources.
///
/// Items are ordered by `(key, source index, position within source)`, so
/// equal keys come out in source order and, within a source, in the order the
/// source produced them. Only the head of each source is held at a time.
pub struct KWayMerge<I: Iterator, K, F> {
    sources: Vec<I>,
    heads: Vec<Option<I::Item>>,
    positions: Vec<u64>,
    heap: BinaryHeap<Reverse<(K, usize, u64)>>,
    key: F,
}

impl<I, K, F> KWayMerge<I, K, F>
where
    I: Iterator,
    K: Ord,
    F: FnMut(&I::Item) -> K,
{
    pub fn new(sources: Vec<I>, key: F) -> Self {
        let n = sources.len();
        let mut merge = Self {
            sources,
            heads: (0..n).map(|_| None).collect(),
            positions: vec![0; n],
            heap: BinaryHeap::with_capacity(n),
            key,
        };
        for idx in 0..n {
            merge.advance(idx);
        }
        merge
    }

    fn advance(&mut self, idx: usize) {
        if let Some(item) = self.sources[idx].next() {
            let position = self.positions[idx];
            self.positions[idx] += 1;
            self.heap
                .push(Reverse(((self.key)(&item), idx, position)));
            self.heads[idx] = Some(item);
        }
    }

    /// Like `next`, but also returns the index of the source.
    pub fn next_with_source(&mut self) -> Option<(usize, I::Item)> {
        let Reverse((_, idx, _)) = self.heap.pop()?;
        let item = self.heads[idx].take()?;
        self.advance(idx);
        Some((idx, item))
    }

    pub fn sources(&self) -> &[I] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [I] {
        &mut self.sources
    }
}

impl<I, K, F> Iterator for KWayMerge<I, K, F>
where
    I: Iterator,
    K: Ord,
    F: FnMut(&I::Item) -> K,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_source().map(|(_, item)| item)
    }
}
