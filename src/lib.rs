//! `kway-sort` is an external k-way merge sort built on a concurrent tree-reduction engine.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data that do not
//! fit into the main memory (RAM) of a computer and instead must reside in slower external memory, usually
//! a hard disk drive. The input is cut into bounded chunks that each fit in RAM, every chunk is sorted in
//! parallel and persisted as a temporary sorted run, and a pool of worker threads then folds the runs
//! bottom-up, merging up to `k` of them at a time, until a single sorted run remains. Runs are scheduled
//! smallest first, so similarly sized runs merge together and the number of simultaneously pending run
//! files stays logarithmic in the number of chunks.
//! For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `kway-sort` supports the following features:
//!
//! * **Data agnostic:**
//!   it supports all data types that implement `serde` serialization/deserialization by default,
//!   otherwise you can implement your own run file format.
//! * **Serialization format agnostic:**
//!   the library uses `MessagePack` serialization format by default, but it can be easily substituted by
//!   your custom one if `MessagePack` serialization/deserialization performance is not sufficient for
//!   your task.
//! * **Multithreading support:**
//!   chunks are sorted on a thread pool and independent merges run concurrently, utilizing maximum CPU
//!   resources and reducing sorting time.
//! * **Configurable fan-in:**
//!   merges consume up to `k` runs at a time, trading merge pass count against the number of
//!   simultaneously open files.
//! * **Memory limit support:**
//!   memory limited chunking is supported. It allows you to limit sorting memory consumption
//!   (`memory-limit` feature required).
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//! use std::path;
//!
//! use kway_sort::{KWayMerger, KWayMergerBuilder, LimitedBufferBuilder};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
//!     let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!
//!     let sorter: KWayMerger<String, io::Error> = KWayMergerBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_buffer(LimitedBufferBuilder::new(1_000_000, true))
//!         .with_branching(8)
//!         .build()
//!         .unwrap();
//!
//!     let sorted = sorter.sort(input_reader.lines()).unwrap();
//!
//!     for item in sorted.reader().unwrap().map(Result::unwrap) {
//!         output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
//!     }
//!     output_writer.flush().unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod kway;
pub mod merger;
pub mod outcome;
pub mod worker;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBuffer, LimitedBufferBuilder, WeightedBuffer, WeightedBufferBuilder};
pub use chunk::{MsgPackFormat, RunError, RunFormat, RunReader, RunWriter, SortedRun};
pub use kway::{KWayMerger, KWayMergerBuilder, SortError, SortedOutput};
pub use merger::{MultiwayMerger, Unique};
pub use outcome::Outcome;
pub use worker::{LeafSource, TreeError, TreeWorker, TreeWorkerBuilder};
