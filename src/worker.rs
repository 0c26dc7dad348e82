//! Concurrent tree reduction engine.
//!
//! A fixed pool of worker threads folds a stream of leaf values bottom-up
//! into a single root: each worker repeatedly pulls a fresh leaf from the
//! serialized source or claims pending values, combines up to K of them into
//! one, and feeds the result back into the pending pool. The run terminates
//! once the source is exhausted and exactly one value remains; that value is
//! the root. The first failure from any worker cancels the rest and becomes
//! the run's outcome.
//!
//! Lifecycle: [`TreeWorkerBuilder::start`] spawns the pool (CREATED to
//! RUNNING); [`TreeWorker::join`] blocks until the run is COMPLETED or
//! FAILED and consumes the handle, so the terminal state is observed exactly
//! once.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log;

use crate::outcome::Outcome;

/// Reduction error.
#[derive(Debug)]
pub enum TreeError<E> {
    /// The leaf source ended before producing a single value.
    EmptyInput,
    /// The leaf source failed.
    Source(E),
    /// A combine call failed.
    Combine(E),
    /// A worker thread could not be spawned.
    Spawn(io::Error),
    /// A combine or source call panicked.
    Panicked,
}

impl<E: Error + 'static> Error for TreeError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            TreeError::EmptyInput => None,
            TreeError::Source(err) => Some(err),
            TreeError::Combine(err) => Some(err),
            TreeError::Spawn(err) => Some(err),
            TreeError::Panicked => None,
        }
    }
}

impl<E: Display> Display for TreeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            TreeError::EmptyInput => write!(f, "leaf source produced no values"),
            TreeError::Source(err) => write!(f, "leaf source error: {}", err),
            TreeError::Combine(err) => write!(f, "combine error: {}", err),
            TreeError::Spawn(err) => write!(f, "worker thread spawn failed: {}", err),
            TreeError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

/// A single logical producer of leaf values.
///
/// The engine serializes calls under a mutex, so implementations may block
/// and keep internal cursor state. `Ok(None)` reports exhaustion; the engine
/// never calls `pull` again once it has seen the end.
pub trait LeafSource: Send {
    type Value: Send;
    type Error: Send;

    fn pull(&mut self) -> Result<Option<Self::Value>, Self::Error>;
}

/// Any fallible iterator is a leaf source.
impl<I, T, E> LeafSource for I
where
    I: Iterator<Item = Result<T, E>> + Send,
    T: Send,
    E: Send,
{
    type Value = T;
    type Error = E;

    fn pull(&mut self) -> Result<Option<T>, E> {
        self.next().transpose()
    }
}

type CombineFn<V, E> = Box<dyn Fn(Vec<V>) -> Result<V, E> + Send + Sync>;
type DiscardFn<V> = Box<dyn Fn(V) + Send + Sync>;
type PriorityFn<V> = Box<dyn Fn(&V) -> u64 + Send + Sync>;
type SourceBox<V, E> = Box<dyn LeafSource<Value = V, Error = E>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tree reduction builder. Provides methods for [`TreeWorker`] initialization.
pub struct TreeWorkerBuilder<V> {
    workers: usize,
    branching: usize,
    discard: Option<DiscardFn<V>>,
    priority: Option<PriorityFn<V>>,
}

impl<V: Send + 'static> TreeWorkerBuilder<V> {
    /// Creates a builder with default parameters: one worker per available
    /// CPU core, branching factor 2.
    pub fn new() -> Self {
        TreeWorkerBuilder {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            branching: 2,
            discard: None,
            priority: None,
        }
    }

    /// Sets the number of worker threads (at least 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        return self;
    }

    /// Sets the maximum number of values folded by one combine call
    /// (at least 2).
    pub fn with_branching(mut self, branching: usize) -> Self {
        self.branching = branching.max(2);
        return self;
    }

    /// Sets a hook invoked for every value abandoned on a failure path.
    /// Without it abandoned values are simply dropped.
    pub fn with_discard(mut self, discard: impl Fn(V) + Send + Sync + 'static) -> Self {
        self.discard = Some(Box::new(discard));
        return self;
    }

    /// Sets a scheduling weight. Pending values are claimed smallest first
    /// and a value only triggers a combine once enough peers of equal or
    /// smaller weight are pending, so similarly sized values fold together.
    pub fn with_priority(mut self, priority: impl Fn(&V) -> u64 + Send + Sync + 'static) -> Self {
        self.priority = Some(Box::new(priority));
        return self;
    }

    /// Spawns the worker pool over `source` and `combine` and returns the
    /// running engine handle.
    pub fn start<S, C>(self, source: S, combine: C) -> Result<TreeWorker<V, S::Error>, TreeError<S::Error>>
    where
        S: LeafSource<Value = V> + 'static,
        S::Error: Send + 'static,
        C: Fn(Vec<V>) -> Result<V, S::Error> + Send + Sync + 'static,
    {
        log::debug!(
            "starting tree reduction ({} workers, branching factor {})",
            self.workers,
            self.branching
        );

        let shared = Arc::new(Shared {
            branching: self.branching,
            combine: Box::new(combine) as CombineFn<V, S::Error>,
            discard: self.discard,
            priority: self.priority,
            source: Mutex::new(Box::new(source) as SourceBox<V, S::Error>),
            pool: Mutex::new(Pool {
                pending: Vec::new(),
                outstanding: 0,
                exhausted: false,
                produced: 0,
            }),
            available: Condvar::new(),
            outcome: Outcome::new(),
            cancelled: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(self.workers);
        for idx in 0..self.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("tree-worker-{}", idx))
                .spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker_main(worker_shared.as_ref())));
                    if outcome.is_err() {
                        worker_shared.fail(TreeError::Panicked);
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shared.fail(TreeError::Spawn(io::Error::new(err.kind(), err.to_string())));
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(TreeError::Spawn(err));
                }
            }
        }

        return Ok(TreeWorker { shared, handles });
    }
}

impl<V: Send + 'static> Default for TreeWorkerBuilder<V> {
    fn default() -> Self {
        TreeWorkerBuilder::new()
    }
}

/// A running tree reduction.
pub struct TreeWorker<V, E> {
    shared: Arc<Shared<V, E>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<V: Send, E: Send> TreeWorker<V, E> {
    /// Blocks until the reduction reaches its terminal state and returns the
    /// root value or the first failure. All workers are joined and, on
    /// failure, every value still pending is discarded before returning, so
    /// no value outlives the run.
    pub fn join(mut self) -> Result<V, TreeError<E>> {
        self.shared.outcome.wait();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        let leftovers = std::mem::take(&mut lock(&self.shared.pool).pending);
        for value in leftovers {
            self.shared.dispose(value);
        }

        return self.shared.outcome.wait_take();
    }
}

struct Pool<V> {
    /// Pending values, sorted by descending priority so the smallest is
    /// popped from the tail first. Insertion order within equal priorities
    /// is preserved.
    pending: Vec<V>,
    /// Values currently held by workers: claimed batches, combine inputs and
    /// carried results. `pending.len() + outstanding` is the number of live
    /// values.
    outstanding: usize,
    /// The leaf source reported the end.
    exhausted: bool,
    /// Total leaves pulled so far.
    produced: u64,
}

struct Shared<V, E> {
    branching: usize,
    combine: CombineFn<V, E>,
    discard: Option<DiscardFn<V>>,
    priority: Option<PriorityFn<V>>,
    source: Mutex<SourceBox<V, E>>,
    pool: Mutex<Pool<V>>,
    available: Condvar,
    outcome: Outcome<Result<V, TreeError<E>>>,
    cancelled: AtomicBool,
}

impl<V: Send, E: Send> Shared<V, E> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Records the first failure and signals every worker to stop.
    fn fail(&self, err: TreeError<E>) {
        self.outcome.set(Err(err));
        self.cancelled.store(true, AtomicOrdering::Release);
        self.available.notify_all();
    }

    fn dispose(&self, value: V) {
        match &self.discard {
            Some(discard) => discard(value),
            None => drop(value),
        }
    }

    /// Inserts a value into the pending pool keeping the descending
    /// priority order; equal priorities stay in insertion order.
    fn insert(&self, pool: &mut Pool<V>, value: V) {
        match &self.priority {
            Some(priority) => {
                let key = priority(&value);
                let pos = pool.pending.partition_point(|v| priority(v) > key);
                pool.pending.insert(pos, value);
            }
            None => pool.pending.push(value),
        }
    }

    /// Number of pending values with priority not above `value`'s, capped at
    /// one batch. Without a priority hook every pending value is eligible.
    fn eligible_peers(&self, pool: &Pool<V>, value: &V) -> usize {
        let cap = self.branching - 1;
        match &self.priority {
            Some(priority) => {
                let key = priority(value);
                pool.pending
                    .iter()
                    .rev()
                    .take_while(|v| priority(v) <= key)
                    .take(cap)
                    .count()
            }
            None => pool.pending.len().min(cap),
        }
    }
}

fn worker_main<V: Send, E: Send>(shared: &Shared<V, E>) {
    // the value this worker is holding: a fresh leaf or a combine result
    let mut carry: Option<V> = None;

    loop {
        if shared.is_cancelled() {
            break;
        }

        match carry.take() {
            Some(value) => match place(shared, value) {
                Placed::Batch(batch) => match run_combine(shared, batch) {
                    Some(result) => carry = Some(result),
                    None => break,
                },
                Placed::Parked => {}
                Placed::Root => return,
            },
            None => {
                let exhausted = lock(&shared.pool).exhausted;
                if !exhausted {
                    match pull_leaf(shared) {
                        Pulled::Leaf(value) => carry = Some(value),
                        Pulled::End => {}
                        Pulled::Stop => break,
                    }
                } else {
                    match drain_claim(shared) {
                        Claimed::Batch(batch) => match run_combine(shared, batch) {
                            Some(result) => carry = Some(result),
                            None => break,
                        },
                        Claimed::Retry => {}
                        Claimed::Done => return,
                    }
                }
            }
        }
    }

    // stopped by a failure: release whatever this worker still holds
    if let Some(value) = carry.take() {
        let mut pool = lock(&shared.pool);
        pool.outstanding -= 1;
        drop(pool);
        shared.dispose(value);
        shared.available.notify_all();
    }
}

enum Placed<V> {
    /// Enough peers were claimable: combine this batch.
    Batch(Vec<V>),
    /// The value went back to the pending pool.
    Parked,
    /// The value was the last one alive and became the root.
    Root,
}

/// Decides what happens to a value a worker holds: it either triggers a
/// combine with pending peers of equal or smaller priority, becomes the
/// root, or is parked in the pending pool.
fn place<V: Send, E: Send>(shared: &Shared<V, E>, value: V) -> Placed<V> {
    let mut pool = lock(&shared.pool);

    let eligible = shared.eligible_peers(&pool, &value);
    // before exhaustion wait for a full batch so similarly sized values
    // fold together; afterwards any pair is worth folding
    let trigger = if pool.exhausted {
        eligible >= 1
    } else {
        eligible + 1 >= shared.branching
    };

    if trigger {
        let mut batch = Vec::with_capacity(eligible + 1);
        for _ in 0..eligible {
            if let Some(peer) = pool.pending.pop() {
                pool.outstanding += 1;
                batch.push(peer);
            }
        }
        batch.push(value);
        return Placed::Batch(batch);
    }

    if pool.exhausted && pool.pending.is_empty() && pool.outstanding == 1 {
        // this worker holds the only value left: the root
        pool.outstanding -= 1;
        drop(pool);
        publish_root(shared, value);
        return Placed::Root;
    }

    pool.outstanding -= 1;
    shared.insert(&mut pool, value);
    if pool.pending.len() >= 2 {
        shared.available.notify_all();
    }
    return Placed::Parked;
}

enum Pulled<V> {
    Leaf(V),
    /// The source is exhausted.
    End,
    /// The source failed; the run is cancelled.
    Stop,
}

/// Pulls one leaf from the source. Calls are serialized by the source mutex.
fn pull_leaf<V: Send, E: Send>(shared: &Shared<V, E>) -> Pulled<V> {
    let mut source = lock(&shared.source);

    // a sibling may have drained the source while we waited for its lock
    if lock(&shared.pool).exhausted {
        return Pulled::End;
    }
    if shared.is_cancelled() {
        return Pulled::Stop;
    }

    match source.pull() {
        Ok(Some(value)) => {
            let mut pool = lock(&shared.pool);
            pool.outstanding += 1;
            pool.produced += 1;
            return Pulled::Leaf(value);
        }
        Ok(None) => {
            lock(&shared.pool).exhausted = true;
            log::debug!("leaf source exhausted");
            shared.available.notify_all();
            return Pulled::End;
        }
        Err(err) => {
            shared.fail(TreeError::Source(err));
            return Pulled::Stop;
        }
    }
}

enum Claimed<V> {
    Batch(Vec<V>),
    /// Woke up from the pool condvar; re-evaluate.
    Retry,
    /// Terminal state reached (root published here or by a sibling, or the
    /// input was empty).
    Done,
}

/// Claims up to one batch of the smallest pending values once the source is
/// exhausted. Blocks when fewer than two values are claimable while siblings
/// still hold some.
fn drain_claim<V: Send, E: Send>(shared: &Shared<V, E>) -> Claimed<V> {
    let mut pool = lock(&shared.pool);

    let mut batch = Vec::new();
    while batch.len() < shared.branching {
        match pool.pending.pop() {
            Some(value) => {
                pool.outstanding += 1;
                batch.push(value);
            }
            None => break,
        }
    }

    if batch.len() >= 2 {
        return Claimed::Batch(batch);
    }

    if let Some(value) = batch.pop() {
        if pool.pending.is_empty() && pool.outstanding == 1 {
            pool.outstanding -= 1;
            drop(pool);
            publish_root(shared, value);
            return Claimed::Done;
        }
        // siblings still hold values that may come back; give it up and wait
        pool.outstanding -= 1;
        shared.insert(&mut pool, value);
        if pool.pending.len() >= 2 {
            shared.available.notify_all();
            return Claimed::Retry;
        }
    } else if pool.pending.is_empty() && pool.outstanding == 0 {
        if pool.produced == 0 {
            drop(pool);
            shared.fail(TreeError::EmptyInput);
        }
        return Claimed::Done;
    }

    let _unused = shared
        .available
        .wait(pool)
        .unwrap_or_else(PoisonError::into_inner);
    return Claimed::Retry;
}

/// Runs one combine call; the inputs are consumed. Returns the result value
/// (still owned by this worker) or `None` if the combine failed and the run
/// was cancelled.
fn run_combine<V: Send, E: Send>(shared: &Shared<V, E>, batch: Vec<V>) -> Option<V> {
    let n = batch.len();
    log::trace!("combining {} values", n);

    match (shared.combine)(batch) {
        Ok(value) => {
            // the result replaces its n inputs and stays with this worker
            lock(&shared.pool).outstanding -= n - 1;
            return Some(value);
        }
        Err(err) => {
            lock(&shared.pool).outstanding -= n;
            shared.fail(TreeError::Combine(err));
            return None;
        }
    }
}

fn publish_root<V: Send, E: Send>(shared: &Shared<V, E>, root: V) {
    log::debug!("tree reduction complete");
    if let Some(Ok(rejected)) = shared.outcome.set(Ok(root)) {
        // a concurrent failure won the outcome; the root is superseded
        shared.dispose(rejected);
    }
    shared.available.notify_all();
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    use rstest::*;

    use super::{TreeError, TreeWorkerBuilder};

    fn leaves(range: std::ops::RangeInclusive<i64>) -> std::vec::IntoIter<Result<i64, io::Error>> {
        Vec::from_iter(range.map(Ok)).into_iter()
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 2)]
    #[case(8, 2)]
    #[case(1, 8)]
    #[case(8, 8)]
    fn test_reduction_folds_every_leaf(#[case] workers: usize, #[case] branching: usize) {
        let worker = TreeWorkerBuilder::new()
            .with_workers(workers)
            .with_branching(branching)
            .start(leaves(1..=100), |values: Vec<i64>| {
                Ok(values.into_iter().sum::<i64>())
            })
            .unwrap();

        assert_eq!(worker.join().unwrap(), 5050);
    }

    #[test]
    fn test_empty_source_fails() {
        let worker = TreeWorkerBuilder::new()
            .with_workers(2)
            .start(leaves(1..=0), |values: Vec<i64>| {
                Ok(values.into_iter().sum::<i64>())
            })
            .unwrap();

        assert!(matches!(worker.join(), Err(TreeError::EmptyInput)));
    }

    #[test]
    fn test_single_leaf_returned_without_combine() {
        let combines = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&combines);

        let worker = TreeWorkerBuilder::new()
            .with_workers(4)
            .start(leaves(42..=42), move |values: Vec<i64>| {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(values.into_iter().sum::<i64>())
            })
            .unwrap();

        assert_eq!(worker.join().unwrap(), 42);
        assert_eq!(combines.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn test_source_error_aborts_run() {
        let input: Vec<Result<i64, io::Error>> = vec![
            Ok(1),
            Ok(2),
            Err(io::Error::new(io::ErrorKind::Other, "broken source")),
        ];

        let worker = TreeWorkerBuilder::new()
            .with_workers(2)
            .start(input.into_iter(), |values: Vec<i64>| {
                Ok(values.into_iter().sum::<i64>())
            })
            .unwrap();

        assert!(matches!(worker.join(), Err(TreeError::Source(_))));
    }

    #[test]
    fn test_combine_error_aborts_run() {
        let worker = TreeWorkerBuilder::new()
            .with_workers(4)
            .start(leaves(1..=64), |_values: Vec<i64>| {
                Err(io::Error::new(io::ErrorKind::Other, "combine refused"))
            })
            .unwrap();

        assert!(matches!(worker.join(), Err(TreeError::Combine(_))));
    }

    #[test]
    fn test_no_value_survives_a_failed_run() {
        struct Tracked {
            value: i64,
            alive: Arc<AtomicI64>,
        }

        impl Tracked {
            fn new(value: i64, alive: &Arc<AtomicI64>) -> Self {
                alive.fetch_add(1, AtomicOrdering::SeqCst);
                Tracked {
                    value,
                    alive: Arc::clone(alive),
                }
            }
        }

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.alive.fetch_sub(1, AtomicOrdering::SeqCst);
            }
        }

        let alive = Arc::new(AtomicI64::new(0));

        let source_alive = Arc::clone(&alive);
        let input = Vec::from_iter(
            (1..=32).map(move |v| Ok::<_, io::Error>(Tracked::new(v, &source_alive))),
        );

        let combine_alive = Arc::clone(&alive);
        let worker = TreeWorkerBuilder::new()
            .with_workers(4)
            .start(input.into_iter(), move |values: Vec<Tracked>| {
                let sum: i64 = values.iter().map(|v| v.value).sum();
                if sum >= 8 {
                    return Err(io::Error::new(io::ErrorKind::Other, "poisoned batch"));
                }
                Ok(Tracked::new(sum, &combine_alive))
            })
            .unwrap();

        assert!(worker.join().is_err());
        assert_eq!(alive.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_discard_receives_abandoned_values() {
        let discarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&discarded);

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);

        // single worker, priority = value: the first combine folds [10, 20]
        // and parks 30; the small leaves 1 and 2 then trigger the second
        // combine on their own (30 outranks them), and its failure leaves
        // the parked 30 behind to discard
        let input: Vec<Result<i64, io::Error>> = vec![Ok(10), Ok(20), Ok(1), Ok(2)];

        let worker = TreeWorkerBuilder::new()
            .with_workers(1)
            .with_branching(2)
            .with_priority(|value: &i64| *value as u64)
            .with_discard(move |value: i64| sink.lock().unwrap().push(value))
            .start(input.into_iter(), move |values: Vec<i64>| {
                if counter.fetch_add(1, AtomicOrdering::SeqCst) == 1 {
                    return Err(io::Error::new(io::ErrorKind::Other, "second combine fails"));
                }
                Ok(values.into_iter().sum::<i64>())
            })
            .unwrap();

        assert!(matches!(worker.join(), Err(TreeError::Combine(_))));
        assert_eq!(discarded.lock().unwrap().as_slice(), &[30]);
    }

    #[test]
    fn test_panicking_combine_surfaces_as_error() {
        let worker = TreeWorkerBuilder::new()
            .with_workers(2)
            .start(leaves(1..=16), |_values: Vec<i64>| -> Result<i64, io::Error> {
                panic!("combine blew up");
            })
            .unwrap();

        assert!(matches!(worker.join(), Err(TreeError::Panicked)));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    fn test_priority_folds_smallest_first(#[case] workers: usize) {
        // values carry their subsumed-leaf count in the upper bits so the
        // reduction shape is observable: with smallest-first folding the
        // final count must equal the leaf count no matter the shape
        let worker = TreeWorkerBuilder::new()
            .with_workers(workers)
            .with_branching(2)
            .with_priority(|value: &i64| (*value >> 32) as u64)
            .start(
                Vec::from_iter((0..100i64).map(|v| Ok::<_, io::Error>((1 << 32) | v))).into_iter(),
                |values: Vec<i64>| {
                    let count: i64 = values.iter().map(|v| v >> 32).sum();
                    Ok(count << 32)
                },
            )
            .unwrap();

        assert_eq!(worker.join().unwrap() >> 32, 100);
    }
}
