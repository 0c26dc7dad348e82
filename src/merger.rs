//! Multiway merge iterator.

use std::cmp::Ordering;

struct HeapEntry<T> {
    item: T,
    source: usize,
}

/// Merges K sorted inputs into a single sorted output, lazily.
///
/// The order is defined by the caller's comparator; inputs must already be
/// sorted under the same comparator or the result is undefined. Duplicates
/// are preserved. When two items compare equal across different inputs the
/// one from the lower input index is yielded first, so the input list order
/// is the tie-break precedence. A binary heap keyed by (item, input index)
/// keeps the cost at O(*m* · log *K*) comparisons for *m* merged items.
pub struct MultiwayMerger<T, E, C, F>
where
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    heap: Vec<HeapEntry<T>>,
    sources: Vec<C::IntoIter>,
    compare: F,
    // initialization is resumable so an input error does not lose cursors
    init_idx: usize,
    pending_err: Option<E>,
}

impl<T, E, C, F> MultiwayMerger<T, E, C, F>
where
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    /// Creates a merger over `sources`; their order defines tie precedence.
    pub fn new<I>(sources: I, compare: F) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let sources = Vec::from_iter(sources.into_iter().map(|s| s.into_iter()));
        let heap = Vec::with_capacity(sources.len());

        return MultiwayMerger {
            heap,
            sources,
            compare,
            init_idx: 0,
            pending_err: None,
        };
    }

    /// Wraps the merger so equal items collapse to their first occurrence;
    /// every dropped duplicate is handed to `on_duplicate`.
    pub fn unique<D>(self, on_duplicate: D) -> Unique<Self, T, E, F, D>
    where
        F: Clone,
        D: FnMut(T),
    {
        let compare = self.compare.clone();
        Unique::new(self, compare, on_duplicate)
    }

    fn entry_less(&self, a: &HeapEntry<T>, b: &HeapEntry<T>) -> bool {
        (self.compare)(&a.item, &b.item).then(a.source.cmp(&b.source)) == Ordering::Less
    }

    fn heap_push(&mut self, item: T, source: usize) {
        self.heap.push(HeapEntry { item, source });
        self.sift_up(self.heap.len() - 1);
    }

    fn heap_pop(&mut self) -> Option<HeapEntry<T>> {
        if self.heap.is_empty() {
            return None;
        }
        let root = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        return Some(root);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.entry_less(&self.heap[idx], &self.heap[parent]) {
                break;
            }
            self.heap.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.entry_less(&self.heap[child], &self.heap[smallest]) {
                    smallest = child;
                }
            }
            if smallest == idx {
                break;
            }
            self.heap.swap(idx, smallest);
            idx = smallest;
        }
    }
}

impl<T, E, C, F> Iterator for MultiwayMerger<T, E, C, F>
where
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_err.take() {
            return Some(Err(err));
        }

        while self.init_idx < self.sources.len() {
            let idx = self.init_idx;
            self.init_idx += 1;
            match self.sources[idx].next() {
                Some(Ok(item)) => self.heap_push(item, idx),
                Some(Err(err)) => return Some(Err(err)),
                None => {}
            }
        }

        let root = self.heap_pop()?;
        match self.sources[root.source].next() {
            Some(Ok(item)) => self.heap_push(item, root.source),
            // yield the popped item first, surface the error on the next call
            Some(Err(err)) => self.pending_err = Some(err),
            None => {}
        }

        return Some(Ok(root.item));
    }
}

/// Duplicate-dropping adapter over a sorted `Result` iterator.
///
/// The first occurrence of every equal run is yielded; later occurrences are
/// passed to the duplicate callback instead. Errors pass through untouched.
pub struct Unique<I, T, E, F, D>
where
    I: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
    D: FnMut(T),
{
    inner: I,
    compare: F,
    on_duplicate: D,
    pending: Option<T>,
}

impl<I, T, E, F, D> Unique<I, T, E, F, D>
where
    I: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
    D: FnMut(T),
{
    pub fn new(inner: I, compare: F, on_duplicate: D) -> Self {
        Unique {
            inner,
            compare,
            on_duplicate,
            pending: None,
        }
    }
}

impl<I, T, E, F, D> Iterator for Unique<I, T, E, F, D>
where
    I: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering,
    D: FnMut(T),
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next() {
                None => return self.pending.take().map(Ok),
                Some(Err(err)) => return Some(Err(err)),
                Some(Ok(item)) => {
                    let duplicate = match &self.pending {
                        Some(prev) => (self.compare)(prev, &item) == Ordering::Equal,
                        None => false,
                    };
                    if duplicate {
                        (self.on_duplicate)(item);
                    } else if let Some(prev) = self.pending.replace(item) {
                        return Some(Ok(prev));
                    }
                }
            }
        }
    }
}
