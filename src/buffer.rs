//! Chunk boundary policies.
//!
//! A buffer bounds one sub-stream of the input: items are pushed until the
//! buffer reports it is full, at which point the sub-stream is closed and the
//! buffer content becomes one sorted disk run. Fullness is checked after each
//! push, so a closed buffer always holds at least one item even when a single
//! item alone exceeds the threshold.

use rayon;

/// Buffer builder. A fresh buffer is built for every sub-stream.
pub trait ChunkBufferBuilder<T: Send>: Clone {
    type Buffer: ChunkBuffer<T>;

    /// Creates a new empty buffer.
    fn build(&self) -> Self::Buffer;
}

/// Bounded chunk buffer interface.
pub trait ChunkBuffer<T: Send>: IntoIterator<Item = T> + rayon::slice::ParallelSliceMut<T> + Send {
    /// Adds a new element to the buffer.
    fn push(&mut self, item: T);

    /// Returns buffer length.
    fn len(&self) -> usize;

    /// Checks if the buffer reached its threshold.
    fn is_full(&self) -> bool;
}

/// Builder for [`LimitedBuffer`].
#[derive(Clone)]
pub struct LimitedBufferBuilder {
    buffer_limit: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    pub fn new(buffer_limit: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            buffer_limit,
            preallocate,
        }
    }
}

impl<T: Send> ChunkBufferBuilder<T> for LimitedBufferBuilder {
    type Buffer = LimitedBuffer<T>;

    fn build(&self) -> Self::Buffer {
        if self.preallocate {
            LimitedBuffer::with_capacity(self.buffer_limit)
        } else {
            LimitedBuffer::new(self.buffer_limit)
        }
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        LimitedBufferBuilder {
            buffer_limit: usize::MAX,
            preallocate: false,
        }
    }
}

/// Buffer limited by element count.
pub struct LimitedBuffer<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> LimitedBuffer<T> {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }
}

impl<T: Send> ChunkBuffer<T> for LimitedBuffer<T> {
    fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }
}

impl<T> IntoIterator for LimitedBuffer<T> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<T: Send> rayon::slice::ParallelSliceMut<T> for LimitedBuffer<T> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}

/// Builder for [`WeightedBuffer`].
///
/// The weight function assigns every item a caller-defined cost (serialized
/// byte size, cardinality estimate, ...); the buffer closes once the
/// accumulated cost reaches the limit.
#[derive(Clone)]
pub struct WeightedBufferBuilder<W> {
    weight_limit: u64,
    weight: W,
}

impl<W> WeightedBufferBuilder<W> {
    pub fn new(weight_limit: u64, weight: W) -> Self {
        WeightedBufferBuilder { weight_limit, weight }
    }
}

impl<T, W> ChunkBufferBuilder<T> for WeightedBufferBuilder<W>
where
    T: Send,
    W: Fn(&T) -> u64 + Clone + Send,
{
    type Buffer = WeightedBuffer<T, W>;

    fn build(&self) -> Self::Buffer {
        WeightedBuffer {
            limit: self.weight_limit,
            current_weight: 0,
            weight: self.weight.clone(),
            inner: Vec::new(),
        }
    }
}

/// Buffer limited by accumulated item weight.
pub struct WeightedBuffer<T, W> {
    limit: u64,
    current_weight: u64,
    weight: W,
    inner: Vec<T>,
}

impl<T, W> WeightedBuffer<T, W> {
    /// Accumulated weight of the buffered items.
    pub fn weight(&self) -> u64 {
        self.current_weight
    }
}

impl<T, W> ChunkBuffer<T> for WeightedBuffer<T, W>
where
    T: Send,
    W: Fn(&T) -> u64 + Clone + Send,
{
    fn push(&mut self, item: T) {
        self.current_weight += (self.weight)(&item);
        self.inner.push(item);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_full(&self) -> bool {
        self.current_weight >= self.limit
    }
}

impl<T, W> IntoIterator for WeightedBuffer<T, W> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<T: Send, W> rayon::slice::ParallelSliceMut<T> for WeightedBuffer<T, W> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}

#[cfg(test)]
mod test {
    use super::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder, WeightedBufferBuilder};

    #[test]
    fn test_limited_buffer() {
        let builder = LimitedBufferBuilder::new(2, true);
        let mut buffer = builder.build();

        buffer.push(0);
        assert_eq!(buffer.is_full(), false);
        buffer.push(1);
        assert_eq!(buffer.is_full(), true);

        let data = Vec::from_iter(buffer);
        assert_eq!(data, vec![0, 1]);
    }

    #[test]
    fn test_weighted_buffer() {
        let builder = WeightedBufferBuilder::new(10, |s: &String| s.len() as u64);
        let mut buffer = builder.build();

        buffer.push("hello".to_string());
        assert_eq!(buffer.weight(), 5);
        assert_eq!(buffer.is_full(), false);
        buffer.push("world!".to_string());
        assert_eq!(buffer.weight(), 11);
        assert_eq!(buffer.is_full(), true);

        let data = Vec::from_iter(buffer);
        assert_eq!(data, vec!["hello".to_string(), "world!".to_string()]);
    }

    #[test]
    fn test_weighted_buffer_oversized_item() {
        // a single item heavier than the limit still yields a one-item stream
        let builder = WeightedBufferBuilder::new(4, |s: &String| s.len() as u64);
        let mut buffer = builder.build();

        buffer.push("oversized".to_string());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.is_full(), true);
    }
}

#[cfg(feature = "memory-limit")]
pub mod mem {
    //! Buffers bounded by measured memory consumption.

    use deepsize;
    use rayon;

    use super::{ChunkBuffer, ChunkBufferBuilder};

    #[derive(Clone)]
    pub struct MemoryLimitedBufferBuilder {
        buffer_limit: u64,
    }

    impl MemoryLimitedBufferBuilder {
        pub fn new(buffer_limit: u64) -> Self {
            MemoryLimitedBufferBuilder { buffer_limit }
        }
    }

    impl<T: Send> ChunkBufferBuilder<T> for MemoryLimitedBufferBuilder
    where
        T: deepsize::DeepSizeOf,
    {
        type Buffer = MemoryLimitedBuffer<T>;

        fn build(&self) -> Self::Buffer {
            MemoryLimitedBuffer::new(self.buffer_limit)
        }
    }

    impl Default for MemoryLimitedBufferBuilder {
        fn default() -> Self {
            MemoryLimitedBufferBuilder { buffer_limit: u64::MAX }
        }
    }

    /// Buffer limited by consumed memory.
    pub struct MemoryLimitedBuffer<T> {
        limit: u64,
        current_size: u64,
        inner: Vec<T>,
    }

    impl<T> MemoryLimitedBuffer<T> {
        pub fn new(limit: u64) -> Self {
            MemoryLimitedBuffer {
                limit,
                current_size: 0,
                inner: Vec::new(),
            }
        }

        pub fn mem_size(&self) -> u64 {
            self.current_size
        }
    }

    impl<T: Send> ChunkBuffer<T> for MemoryLimitedBuffer<T>
    where
        T: deepsize::DeepSizeOf,
    {
        fn push(&mut self, item: T) {
            self.current_size += item.deep_size_of() as u64;
            self.inner.push(item);
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn is_full(&self) -> bool {
            self.current_size >= self.limit
        }
    }

    impl<T> IntoIterator for MemoryLimitedBuffer<T> {
        type Item = T;
        type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.inner.into_iter()
        }
    }

    impl<T: Send> rayon::slice::ParallelSliceMut<T> for MemoryLimitedBuffer<T> {
        fn as_parallel_slice_mut(&mut self) -> &mut [T] {
            self.inner.as_mut_slice()
        }
    }

}
