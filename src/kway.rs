//! External k-way merge sorter.
//!
//! Specializes the tree reduction engine for disk-resident runs: producing a
//! leaf means draining one bounded sub-stream of the input, sorting it in
//! memory (in parallel) and persisting it as a [`SortedRun`]; combining
//! means streaming a k-way merge of up to `k` runs into a new run and
//! deleting the inputs. Runs are scheduled smallest level first so similarly
//! sized runs merge together, which keeps the number of simultaneously
//! pending run files logarithmic in the number of leaves. The result is a
//! single sorted run handed to the caller as a [`SortedOutput`].

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log;
use rayon::slice::ParallelSliceMut;

use crate::buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder};
use crate::chunk::{MsgPackFormat, RunError, RunFormat, RunReader, RunWriter, SortedRun};
use crate::merger::MultiwayMerger;
use crate::worker::{TreeError, TreeWorkerBuilder};

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error, I: Error> {
    /// Temporary file creation error.
    TempFile(io::Error),
    /// Sorting thread pool initialization error.
    ThreadPoolBuild(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Run serialization error.
    Serialization(S),
    /// Run deserialization error.
    Deserialization(D),
    /// Input data stream error.
    Input(I),
    /// The input stream yielded no items.
    EmptyInput,
    /// A worker thread panicked.
    WorkerPanic,
}

impl<S, D, I> Error for SortError<S, D, I>
where
    S: Error + 'static,
    D: Error + 'static,
    I: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempFile(err) => Some(err),
            SortError::ThreadPoolBuild(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Serialization(err) => Some(err),
            SortError::Deserialization(err) => Some(err),
            SortError::Input(err) => Some(err),
            SortError::EmptyInput => None,
            SortError::WorkerPanic => None,
        }
    }
}

impl<S: Error, D: Error, I: Error> Display for SortError<S, D, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempFile(err) => write!(f, "temporary file not created: {}", err),
            SortError::ThreadPoolBuild(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Serialization(err) => write!(f, "run serialization error: {}", err),
            SortError::Deserialization(err) => write!(f, "run deserialization error: {}", err),
            SortError::Input(err) => write!(f, "input data stream error: {}", err),
            SortError::EmptyInput => write!(f, "input data stream yielded no items"),
            SortError::WorkerPanic => write!(f, "worker thread panicked"),
        }
    }
}

fn write_err<S: Error, D: Error, I: Error>(err: RunError<S>) -> SortError<S, D, I> {
    match err {
        RunError::IO(err) => SortError::IO(err),
        RunError::Codec(err) => SortError::Serialization(err),
    }
}

/// Like [`write_err`], but an I/O failure here means the run file itself
/// could not be created.
fn create_err<S: Error, D: Error, I: Error>(err: RunError<S>) -> SortError<S, D, I> {
    match err {
        RunError::IO(err) => SortError::TempFile(err),
        RunError::Codec(err) => SortError::Serialization(err),
    }
}

fn read_err<S: Error, D: Error, I: Error>(err: RunError<D>) -> SortError<S, D, I> {
    match err {
        RunError::IO(err) => SortError::IO(err),
        RunError::Codec(err) => SortError::Deserialization(err),
    }
}

fn flatten_err<S: Error, D: Error, I: Error>(err: TreeError<SortError<S, D, I>>) -> SortError<S, D, I> {
    match err {
        TreeError::EmptyInput => SortError::EmptyInput,
        TreeError::Source(err) => err,
        TreeError::Combine(err) => err,
        TreeError::Spawn(err) => SortError::IO(err),
        TreeError::Panicked => SortError::WorkerPanic,
    }
}

/// K-way merger builder. Provides methods for [`KWayMerger`] initialization.
#[derive(Clone)]
pub struct KWayMergerBuilder<T, E, B = LimitedBufferBuilder, F = MsgPackFormat<T>>
where
    T: Send,
    E: Error,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
{
    /// Number of threads used both for parallel chunk sorting and as the
    /// merge worker pool size.
    threads_number: Option<usize>,
    /// Merge fan-in: how many runs one merge pass consumes.
    branching: usize,
    /// Directory the temporary run files are created in.
    tmp_dir: Option<Box<Path>>,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Run file format.
    run_format: F,

    /// Input item type.
    item_type: PhantomData<T>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, B, F> KWayMergerBuilder<T, E, B, F>
where
    T: Send,
    E: Error,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self
    where
        B: Default,
        F: Default,
    {
        KWayMergerBuilder::default()
    }

    /// Builds a [`KWayMerger`] instance using the provided configuration.
    pub fn build(self) -> Result<KWayMerger<T, E, B, F>, SortError<F::SerializationError, F::DeserializationError, E>> {
        KWayMerger::new(
            self.threads_number,
            self.branching,
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.run_format,
            self.rw_buf_size,
        )
    }

    /// Sets the number of threads used to sort and merge data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> Self {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets the merge fan-in (at least 2).
    pub fn with_branching(mut self, branching: usize) -> Self {
        self.branching = branching.max(2);
        return self;
    }

    /// Sets the directory temporary run files are created in. The directory
    /// must exist; it is neither created nor removed by the sorter.
    pub fn with_tmp_dir(mut self, path: &Path) -> Self {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets the chunk buffer builder.
    pub fn with_buffer(mut self, buffer_builder: B) -> Self {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets the run file format.
    pub fn with_run_format(mut self, run_format: F) -> Self {
        self.run_format = run_format;
        return self;
    }

    /// Sets the run file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

impl<T, E, B, F> Default for KWayMergerBuilder<T, E, B, F>
where
    T: Send,
    E: Error,
    B: ChunkBufferBuilder<T> + Default,
    F: RunFormat<T> + Default,
{
    fn default() -> Self {
        KWayMergerBuilder {
            threads_number: None,
            branching: 8,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: B::default(),
            run_format: F::default(),
            item_type: PhantomData,
            input_error_type: PhantomData,
        }
    }
}

/// External k-way merge sorter.
pub struct KWayMerger<T, E, B = LimitedBufferBuilder, F = MsgPackFormat<T>>
where
    T: Send,
    E: Error,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
{
    /// Worker pool size for the merge scheduler.
    threads_number: Option<usize>,
    /// Merge fan-in.
    branching: usize,
    /// Chunk sorting thread pool.
    sort_pool: Arc<rayon::ThreadPool>,
    /// Directory the temporary run files are created in.
    tmp_dir: PathBuf,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Run file format.
    run_format: Arc<F>,

    /// Input item type.
    item_type: PhantomData<T>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, B, F> KWayMerger<T, E, B, F>
where
    T: Send,
    E: Error,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
{
    /// Creates a new k-way merger instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads used for parallel sorting and merging. If the parameter is [`None`]
    ///   the thread number is selected based on the available CPU core number.
    /// * `branching` - Merge fan-in: how many runs one merge pass consumes.
    /// * `tmp_path` - Directory for temporary run files. If the parameter is [`None`] the default OS temporary
    ///   directory is used. The directory itself is never created or removed by the sorter.
    /// * `buffer_builder` - Buffer builder deciding where sub-streams are cut into chunks.
    /// * `run_format` - Binary framing for the run files.
    /// * `rw_buf_size` - Run file read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        branching: usize,
        tmp_path: Option<&Path>,
        buffer_builder: B,
        run_format: F,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError<F::SerializationError, F::DeserializationError, E>> {
        let tmp_dir = match tmp_path {
            Some(path) => path.to_path_buf(),
            None => std::env::temp_dir(),
        };
        log::info!("using {} as a temporary directory", tmp_dir.display());

        return Ok(KWayMerger {
            threads_number,
            branching: branching.max(2),
            sort_pool: Arc::new(Self::init_sort_pool(threads_number)?),
            tmp_dir,
            rw_buf_size,
            buffer_builder,
            run_format: Arc::new(run_format),
            item_type: PhantomData,
            input_error_type: PhantomData,
        });
    }

    fn init_sort_pool(
        threads_number: Option<usize>,
    ) -> Result<rayon::ThreadPool, SortError<F::SerializationError, F::DeserializationError, E>> {
        let mut pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            pool_builder = pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let pool = pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuild(err))?;

        return Ok(pool);
    }

    /// Sorts data from the input down to a single run file.
    /// Returns a handle exposing the run's path and a reading iterator.
    ///
    /// # Arguments
    /// * `input` - Input stream the data is fetched from
    pub fn sort<I>(
        &self,
        input: I,
    ) -> Result<SortedOutput<T, F>, SortError<F::SerializationError, F::DeserializationError, E>>
    where
        T: Ord + 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: 'static,
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
    {
        self.sort_by(input, |a: &T, b: &T| a.cmp(b))
    }

    /// Sorts data from the input using a custom compare function.
    ///
    /// # Arguments
    /// * `input` - Input stream the data is fetched from
    /// * `compare` - Function used to compare items
    pub fn sort_by<I, C>(
        &self,
        input: I,
        compare: C,
    ) -> Result<SortedOutput<T, F>, SortError<F::SerializationError, F::DeserializationError, E>>
    where
        T: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: 'static,
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
        C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
    {
        let supplier = RunSupplier {
            input: input.into_iter(),
            done: false,
            buffer_builder: self.buffer_builder.clone(),
            sort_pool: Arc::clone(&self.sort_pool),
            format: Arc::clone(&self.run_format),
            tmp_dir: self.tmp_dir.clone(),
            rw_buf_size: self.rw_buf_size,
            compare: compare.clone(),
            next_seq: 0,
        };

        let format = Arc::clone(&self.run_format);
        let tmp_dir = self.tmp_dir.clone();
        let rw_buf_size = self.rw_buf_size;
        let combine = move |mut runs: Vec<SortedRun>| {
            // order the inputs by leaf precedence so equal items keep their
            // production order across the merge
            runs.sort_by_key(SortedRun::seq);

            let total: u64 = runs.iter().map(SortedRun::len).sum();
            let level: u64 = runs.iter().map(SortedRun::level).sum();
            let seq = runs.first().map(SortedRun::seq).unwrap_or(0);
            log::debug!("merging {} runs ({} items)", runs.len(), total);

            let mut readers = Vec::with_capacity(runs.len());
            for run in &runs {
                readers.push(run.open(Arc::clone(&format), rw_buf_size).map_err(read_err)?);
            }

            let merger = MultiwayMerger::new(readers, |a: &T, b: &T| compare(a, b));
            let mut writer =
                RunWriter::create(&tmp_dir, format.as_ref(), total, rw_buf_size).map_err(create_err)?;
            for item in merger {
                let item = item.map_err(SortError::Deserialization)?;
                writer.push(&item).map_err(write_err)?;
            }
            let merged = writer.finish(level, seq).map_err(write_err)?;

            // dropping the consumed inputs removes their files
            drop(runs);
            return Ok(merged);
        };

        let mut worker_builder = TreeWorkerBuilder::new()
            .with_branching(self.branching)
            .with_priority(|run: &SortedRun| run.level());
        if let Some(threads_number) = self.threads_number {
            worker_builder = worker_builder.with_workers(threads_number);
        }

        let worker = worker_builder.start(supplier, combine).map_err(flatten_err)?;
        let run = worker.join().map_err(flatten_err)?;
        log::debug!("external merge sort complete ({} items)", run.len());

        return Ok(SortedOutput {
            run,
            format: Arc::clone(&self.run_format),
            rw_buf_size: self.rw_buf_size,
            item_type: PhantomData,
        });
    }
}

/// Leaf source of the merge scheduler: cuts the input into bounded
/// sub-streams and persists each as one sorted run.
struct RunSupplier<I, B, F, C> {
    input: I,
    done: bool,
    buffer_builder: B,
    sort_pool: Arc<rayon::ThreadPool>,
    format: Arc<F>,
    tmp_dir: PathBuf,
    rw_buf_size: Option<usize>,
    compare: C,
    next_seq: u64,
}

impl<T, E, I, B, F, C> RunSupplier<I, B, F, C>
where
    T: Send,
    E: Error,
    I: Iterator<Item = Result<T, E>>,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    fn build_run(
        &mut self,
        mut buffer: B::Buffer,
    ) -> Result<SortedRun, SortError<F::SerializationError, F::DeserializationError, E>> {
        let len = buffer.len() as u64;

        log::debug!("sorting chunk data ({} items)", len);
        let compare = &self.compare;
        self.sort_pool.install(|| buffer.par_sort_by(|a, b| compare(a, b)));

        log::debug!("saving chunk data");
        let mut writer =
            RunWriter::create(&self.tmp_dir, self.format.as_ref(), len, self.rw_buf_size).map_err(create_err)?;
        for item in buffer {
            writer.push(&item).map_err(write_err)?;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        return writer.finish(1, seq).map_err(write_err);
    }
}

impl<T, E, I, B, F, C> Iterator for RunSupplier<I, B, F, C>
where
    T: Send,
    E: Error,
    I: Iterator<Item = Result<T, E>>,
    B: ChunkBufferBuilder<T>,
    F: RunFormat<T>,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    type Item = Result<SortedRun, SortError<F::SerializationError, F::DeserializationError, E>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buffer = self.buffer_builder.build();
        loop {
            match self.input.next() {
                Some(Ok(item)) => {
                    buffer.push(item);
                    if buffer.is_full() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(SortError::Input(err)));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if buffer.len() == 0 {
            return None;
        }
        return Some(self.build_run(buffer));
    }
}

/// The final sorted run produced by [`KWayMerger::sort`].
///
/// The backing file lives as long as the handle and is removed when it is
/// dropped; use [`SortedOutput::keep`] to take the file over instead.
pub struct SortedOutput<T, F: RunFormat<T>> {
    run: SortedRun,
    format: Arc<F>,
    rw_buf_size: Option<usize>,
    item_type: PhantomData<T>,
}

impl<T, F: RunFormat<T>> SortedOutput<T, F> {
    /// Number of sorted items in the run.
    pub fn len(&self) -> u64 {
        self.run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
    }

    /// Path of the run file.
    pub fn path(&self) -> &Path {
        self.run.path()
    }

    /// Detaches the run file so it survives the handle.
    pub fn keep(self) -> Result<PathBuf, io::Error> {
        self.run.keep()
    }

    /// Opens the run for reading from the beginning.
    pub fn reader(&self) -> Result<RunReader<T, F>, RunError<F::DeserializationError>> {
        self.run.open(Arc::clone(&self.format), self.rw_buf_size)
    }
}

impl<T, F: RunFormat<T>> Debug for SortedOutput<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedOutput")
            .field("run", &self.run)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::cmp;
    use std::fs;
    use std::io::{self, Read, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{KWayMerger, KWayMergerBuilder, SortError};
    use crate::buffer::LimitedBufferBuilder;
    use crate::chunk::{MsgPackFormat, RunFormat};

    fn build_sorter(
        tmp_dir: &Path,
        threads: usize,
        branching: usize,
        chunk_size: usize,
    ) -> KWayMerger<i32, io::Error> {
        KWayMergerBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(chunk_size, true))
            .with_threads_number(threads)
            .with_branching(branching)
            .with_tmp_dir(tmp_dir)
            .build()
            .unwrap()
    }

    fn collect(output: &super::SortedOutput<i32, MsgPackFormat<i32>>) -> Vec<i32> {
        let items: Result<Vec<i32>, _> = output.reader().unwrap().collect();
        items.unwrap()
    }

    fn dir_entries(path: &Path) -> usize {
        fs::read_dir(path).unwrap().count()
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 2)]
    #[case(8, 2)]
    #[case(1, 8)]
    #[case(2, 8)]
    #[case(8, 8)]
    fn test_sort_scenario(#[case] threads: usize, #[case] branching: usize) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut rng = rand::thread_rng();

        let input: Vec<i32> = (0..1000).map(|_| rng.gen()).collect();
        let mut expected = input.clone();
        expected.sort();

        let sorter = build_sorter(tmp_dir.path(), threads, branching, 100);
        let output = sorter
            .sort(input.into_iter().map(Ok::<i32, io::Error>))
            .unwrap();

        assert_eq!(output.len(), 1000);
        assert_eq!(collect(&output), expected);

        drop(output);
        assert_eq!(dir_entries(tmp_dir.path()), 0);
    }

    #[test]
    fn test_duplicates_are_preserved() {
        let tmp_dir = tempfile::tempdir().unwrap();

        // every value appears many times and is spread over many chunks
        let mut input: Vec<i32> = (0..500).map(|v| v % 50).collect();
        input.shuffle(&mut rand::thread_rng());
        let mut expected = input.clone();
        expected.sort();

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 16);
        let output = sorter
            .sort(input.into_iter().map(Ok::<i32, io::Error>))
            .unwrap();

        assert_eq!(collect(&output), expected);
    }

    #[test]
    fn test_single_chunk_input() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 100);
        let output = sorter
            .sort(vec![Ok::<i32, io::Error>(3), Ok(1), Ok(2)])
            .unwrap();

        assert_eq!(collect(&output), vec![1, 2, 3]);
    }

    #[test]
    fn test_single_item_input() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 100);
        let output = sorter.sort(vec![Ok::<i32, io::Error>(7)]).unwrap();

        assert_eq!(collect(&output), vec![7]);
    }

    #[test]
    fn test_empty_input_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 100);
        let result = sorter.sort(Vec::<Result<i32, io::Error>>::new());

        assert!(matches!(result, Err(SortError::EmptyInput)));
        assert_eq!(dir_entries(tmp_dir.path()), 0);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_sort_by_custom_order(#[case] reversed: bool) {
        let tmp_dir = tempfile::tempdir().unwrap();

        let mut input = Vec::from_iter(0..200);
        input.shuffle(&mut rand::thread_rng());

        let compare: fn(&i32, &i32) -> cmp::Ordering = if reversed {
            |a, b| a.cmp(b).reverse()
        } else {
            |a, b| a.cmp(b)
        };

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 32);
        let output = sorter
            .sort_by(input.into_iter().map(Ok::<i32, io::Error>), compare)
            .unwrap();

        let expected = if reversed {
            Vec::from_iter((0..200).rev())
        } else {
            Vec::from_iter(0..200)
        };
        assert_eq!(collect(&output), expected);
    }

    #[test]
    fn test_sort_stability_with_single_worker() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let input_sorted = Vec::from_iter((0..20).flat_map(|x| (0..5).map(move |y| (x, y))));

        let mut input_shuffled = input_sorted.clone();
        input_shuffled.shuffle(&mut rand::thread_rng());
        // pre-sort by the second field to make stability observable
        input_shuffled.sort_by(|a: &(i32, i32), b: &(i32, i32)| a.1.cmp(&b.1));

        let sorter: KWayMerger<(i32, i32), io::Error> = KWayMergerBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_threads_number(1)
            .with_branching(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let output = sorter
            .sort_by(
                input_shuffled.into_iter().map(Ok::<(i32, i32), io::Error>),
                |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0),
            )
            .unwrap();

        let items: Result<Vec<(i32, i32)>, _> = output.reader().unwrap().collect();
        assert_eq!(items.unwrap(), input_sorted);
    }

    #[test]
    fn test_input_error_leaves_no_files_behind() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let input = (0..400).map(|v| {
            if v < 350 {
                Ok(v)
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "input stream broke"))
            }
        });

        let sorter = build_sorter(tmp_dir.path(), 2, 2, 100);
        let result = sorter.sort(Vec::from_iter(input));

        assert!(result.is_err());
        assert_eq!(dir_entries(tmp_dir.path()), 0);
    }

    /// MessagePack format that starts failing reads after a fixed number of
    /// items, to break a merge somewhere mid-tree.
    struct FlakyFormat {
        inner: MsgPackFormat<i32>,
        remaining_reads: AtomicUsize,
    }

    impl Default for FlakyFormat {
        fn default() -> Self {
            FlakyFormat {
                inner: MsgPackFormat::default(),
                remaining_reads: AtomicUsize::new(150),
            }
        }
    }

    impl RunFormat<i32> for FlakyFormat {
        type SerializationError = rmp_serde::encode::Error;
        type DeserializationError = rmp_serde::decode::Error;

        fn write_len(&self, writer: &mut dyn Write, len: u64) -> Result<(), Self::SerializationError> {
            self.inner.write_len(writer, len)
        }

        fn write_item(&self, writer: &mut dyn Write, item: &i32) -> Result<(), Self::SerializationError> {
            self.inner.write_item(writer, item)
        }

        fn write_trailer(&self, writer: &mut dyn Write) -> Result<(), Self::SerializationError> {
            self.inner.write_trailer(writer)
        }

        fn read_len(&self, reader: &mut dyn Read) -> Result<u64, Self::DeserializationError> {
            self.inner.read_len(reader)
        }

        fn read_item(&self, reader: &mut dyn Read) -> Result<i32, Self::DeserializationError> {
            if self.remaining_reads.fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |v| v.checked_sub(1)).is_err() {
                return Err(rmp_serde::decode::Error::InvalidDataRead(io::Error::new(
                    io::ErrorKind::Other,
                    "injected read failure",
                )));
            }
            self.inner.read_item(reader)
        }

        fn read_trailer(&self, reader: &mut dyn Read) -> Result<(), Self::DeserializationError> {
            self.inner.read_trailer(reader)
        }
    }

    #[test]
    fn test_merge_failure_leaves_no_files_behind() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let sorter: KWayMerger<i32, io::Error, LimitedBufferBuilder, FlakyFormat> = KWayMergerBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(50, true))
            .with_threads_number(2)
            .with_branching(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let result = sorter.sort(Vec::from_iter((0..400).map(Ok::<i32, io::Error>)));

        assert!(matches!(result, Err(SortError::Deserialization(_))));
        assert_eq!(dir_entries(tmp_dir.path()), 0);
    }

    #[test]
    fn test_pending_run_files_stay_bounded() {
        let tmp_dir = tempfile::tempdir().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let peak = Arc::new(AtomicUsize::new(0));

        let sampler = {
            let stop = Arc::clone(&stop);
            let peak = Arc::clone(&peak);
            let dir = tmp_dir.path().to_path_buf();
            thread::spawn(move || {
                while !stop.load(AtomicOrdering::Relaxed) {
                    if let Ok(entries) = fs::read_dir(&dir) {
                        peak.fetch_max(entries.count(), AtomicOrdering::Relaxed);
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };

        // 100 leaf runs; smallest-first scheduling keeps the pending count
        // logarithmic, so the file count stays far below the leaf count
        let sorter = build_sorter(tmp_dir.path(), 2, 2, 10);
        let output = sorter
            .sort(Vec::from_iter((0..1000).rev().map(Ok::<i32, io::Error>)))
            .unwrap();
        assert_eq!(output.len(), 1000);
        drop(output);

        stop.store(true, AtomicOrdering::Relaxed);
        sampler.join().unwrap();

        let peak = peak.load(AtomicOrdering::Relaxed);
        assert!(peak <= 32, "peak simultaneous run files: {}", peak);
    }
}
