//! Disk-resident sorted runs.
//!
//! A [`SortedRun`] binds one sorted sequence of items to one temporary file.
//! The file layout is a count header followed by the items in the format's
//! binary encoding, terminated by a marker the format alone understands; the
//! engine itself never interprets run contents. Run files are deleted when
//! the handle is dropped, so abandoning a run on any failure path removes its
//! file as well.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log;
use tempfile;

/// Error raised while writing or reading a run file.
#[derive(Debug)]
pub enum RunError<E: Error> {
    /// Temporary file creation or raw I/O error.
    IO(io::Error),
    /// Item encoding/decoding error reported by the run format.
    Codec(E),
}

impl<E: Error + 'static> Error for RunError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            RunError::IO(err) => err,
            RunError::Codec(err) => err,
        })
    }
}

impl<E: Error> Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RunError::IO(err) => write!(f, "run file I/O failed: {}", err),
            RunError::Codec(err) => write!(f, "run data codec error: {}", err),
        }
    }
}

impl<E: Error> From<io::Error> for RunError<E> {
    fn from(err: io::Error) -> Self {
        RunError::IO(err)
    }
}

/// Binary framing for run files.
///
/// The engine drives the format one item at a time and treats everything it
/// produces as opaque bytes. Implementations decide the item encoding, the
/// count header representation and the trailing end marker.
pub trait RunFormat<T>: Send + Sync {
    type SerializationError: Error + Send + 'static;
    type DeserializationError: Error + Send + 'static;

    /// Writes the item-count header.
    fn write_len(&self, writer: &mut dyn Write, len: u64) -> Result<(), Self::SerializationError>;

    /// Writes one item.
    fn write_item(&self, writer: &mut dyn Write, item: &T) -> Result<(), Self::SerializationError>;

    /// Writes the end marker after the last item. Defaults to nothing.
    fn write_trailer(&self, _writer: &mut dyn Write) -> Result<(), Self::SerializationError> {
        Ok(())
    }

    /// Reads the item-count header.
    fn read_len(&self, reader: &mut dyn Read) -> Result<u64, Self::DeserializationError>;

    /// Reads one item.
    fn read_item(&self, reader: &mut dyn Read) -> Result<T, Self::DeserializationError>;

    /// Reads and verifies the end marker. Defaults to nothing.
    fn read_trailer(&self, _reader: &mut dyn Read) -> Result<(), Self::DeserializationError> {
        Ok(())
    }
}

/// End marker written by [`MsgPackFormat`] after the last item.
const MSGPACK_RUN_TRAILER: u32 = 0x6b77_6179;

/// MessagePack run format, the default. It supports every item type that
/// implements `serde` serialization/deserialization.
/// For more information see <https://msgpack.org/>.
pub struct MsgPackFormat<T> {
    // fn-pointer marker: the format never stores a T, so it stays Send + Sync
    // regardless of the item type
    item_type: PhantomData<fn(T) -> T>,
}

impl<T> Default for MsgPackFormat<T> {
    fn default() -> Self {
        MsgPackFormat { item_type: PhantomData }
    }
}

impl<T> RunFormat<T> for MsgPackFormat<T>
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned + Send,
{
    type SerializationError = rmp_serde::encode::Error;
    type DeserializationError = rmp_serde::decode::Error;

    fn write_len(&self, mut writer: &mut dyn Write, len: u64) -> Result<(), Self::SerializationError> {
        rmp_serde::encode::write(&mut writer, &len)
    }

    fn write_item(&self, mut writer: &mut dyn Write, item: &T) -> Result<(), Self::SerializationError> {
        rmp_serde::encode::write(&mut writer, item)
    }

    fn write_trailer(&self, mut writer: &mut dyn Write) -> Result<(), Self::SerializationError> {
        rmp_serde::encode::write(&mut writer, &MSGPACK_RUN_TRAILER)
    }

    fn read_len(&self, mut reader: &mut dyn Read) -> Result<u64, Self::DeserializationError> {
        rmp_serde::decode::from_read(&mut reader)
    }

    fn read_item(&self, mut reader: &mut dyn Read) -> Result<T, Self::DeserializationError> {
        rmp_serde::decode::from_read(&mut reader)
    }

    fn read_trailer(&self, mut reader: &mut dyn Read) -> Result<(), Self::DeserializationError> {
        let marker: u32 = rmp_serde::decode::from_read(&mut reader)?;
        if marker != MSGPACK_RUN_TRAILER {
            return Err(rmp_serde::decode::Error::InvalidDataRead(io::Error::new(
                io::ErrorKind::InvalidData,
                "run end marker mismatch",
            )));
        }
        return Ok(());
    }
}

/// A sorted run persisted to one temporary file.
///
/// `level` counts the original leaf runs the file subsumes (a fresh leaf is
/// level 1, a merge output sums its inputs); `seq` is the production order of
/// the earliest leaf it contains. Both only steer merge scheduling. The file
/// is removed when the handle is dropped, unless [`SortedRun::keep`] detached
/// it first.
pub struct SortedRun {
    path: tempfile::TempPath,
    items: u64,
    level: u64,
    seq: u64,
}

impl SortedRun {
    /// Number of items stored in the run.
    pub fn len(&self) -> u64 {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Number of leaf runs subsumed by this run.
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Production sequence number of the earliest subsumed leaf.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the backing file from the handle so it survives drop.
    pub fn keep(self) -> Result<PathBuf, io::Error> {
        self.path.keep().map_err(|err| err.error)
    }

    /// Opens the run for reading. The header count must match the handle.
    pub fn open<T, F>(&self, format: Arc<F>, buf_size: Option<usize>) -> Result<RunReader<T, F>, RunError<F::DeserializationError>>
    where
        F: RunFormat<T>,
    {
        let file = fs::File::open(&self.path)?;
        let mut reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let stored = format.read_len(&mut reader).map_err(RunError::Codec)?;
        if stored != self.items {
            return Err(RunError::IO(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("run header reports {} items, handle expects {}", stored, self.items),
            )));
        }

        return Ok(RunReader {
            format,
            reader,
            remaining: self.items,
            done: false,
            item_type: PhantomData,
        });
    }
}

impl Debug for SortedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedRun")
            .field("path", &self.path())
            .field("items", &self.items)
            .field("level", &self.level)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Streaming writer producing one [`SortedRun`].
///
/// The expected item count is fixed up front so the header can be written
/// first. Dropping the writer without calling [`RunWriter::finish`] removes
/// the partially written file.
pub struct RunWriter<'f, T, F: RunFormat<T>> {
    format: &'f F,
    writer: io::BufWriter<fs::File>,
    path: tempfile::TempPath,
    expected: u64,
    written: u64,
    item_type: PhantomData<T>,
}

impl<'f, T, F: RunFormat<T>> RunWriter<'f, T, F> {
    /// Creates a run file in `dir` and writes the count header.
    pub fn create(
        dir: &Path,
        format: &'f F,
        expected: u64,
        buf_size: Option<usize>,
    ) -> Result<Self, RunError<F::SerializationError>> {
        let tmp_file = tempfile::Builder::new().prefix("run-").suffix(".bin").tempfile_in(dir)?;
        let (file, path) = tmp_file.into_parts();

        let mut writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };
        format.write_len(&mut writer, expected).map_err(RunError::Codec)?;

        return Ok(RunWriter {
            format,
            writer,
            path,
            expected,
            written: 0,
            item_type: PhantomData,
        });
    }

    /// Appends one item.
    pub fn push(&mut self, item: &T) -> Result<(), RunError<F::SerializationError>> {
        self.format.write_item(&mut self.writer, item).map_err(RunError::Codec)?;
        self.written += 1;

        let step = self.expected / 10;
        if step > 0 && self.written % step == 0 {
            log::trace!("run write progress: {}/{} items", self.written, self.expected);
        }
        return Ok(());
    }

    /// Writes the end marker, flushes and seals the run.
    pub fn finish(mut self, level: u64, seq: u64) -> Result<SortedRun, RunError<F::SerializationError>> {
        debug_assert_eq!(self.written, self.expected);

        self.format.write_trailer(&mut self.writer).map_err(RunError::Codec)?;
        self.writer.flush()?;

        return Ok(SortedRun {
            path: self.path,
            items: self.written,
            level,
            seq,
        });
    }
}

/// Iterator over the items of an open run. Yields exactly the number of
/// items announced by the header, then verifies the end marker.
pub struct RunReader<T, F: RunFormat<T>> {
    format: Arc<F>,
    reader: io::BufReader<fs::File>,
    remaining: u64,
    done: bool,
    item_type: PhantomData<T>,
}

impl<T, F: RunFormat<T>> Iterator for RunReader<T, F> {
    type Item = Result<T, F::DeserializationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.remaining == 0 {
            self.done = true;
            return match self.format.read_trailer(&mut self.reader) {
                Ok(()) => None,
                Err(err) => Some(Err(err)),
            };
        }

        self.remaining -= 1;
        return match self.format.read_item(&mut self.reader) {
            Ok(item) => Some(Ok(item)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        };
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize + 1))
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use rstest::*;

    use super::{MsgPackFormat, RunFormat, RunWriter, SortedRun};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_run(dir: &tempfile::TempDir, items: &[i32]) -> SortedRun {
        let format = MsgPackFormat::<i32>::default();
        let mut writer = RunWriter::create(dir.path(), &format, items.len() as u64, None).unwrap();
        for item in items {
            writer.push(item).unwrap();
        }
        writer.finish(1, 0).unwrap()
    }

    #[rstest]
    fn test_run_round_trip(tmp_dir: tempfile::TempDir) {
        let saved = Vec::from_iter(0..100);
        let run = write_run(&tmp_dir, &saved);

        assert_eq!(run.len(), 100);
        assert_eq!(run.level(), 1);

        let format = Arc::new(MsgPackFormat::<i32>::default());
        let restored: Result<Vec<i32>, _> = run.open(format, None).unwrap().collect();
        assert_eq!(restored.unwrap(), saved);
    }

    #[rstest]
    fn test_run_file_removed_on_drop(tmp_dir: tempfile::TempDir) {
        let run = write_run(&tmp_dir, &[1, 2, 3]);
        let path = run.path().to_path_buf();

        assert!(path.exists());
        drop(run);
        assert!(!path.exists());
    }

    #[rstest]
    fn test_run_keep_detaches_file(tmp_dir: tempfile::TempDir) {
        let run = write_run(&tmp_dir, &[1, 2, 3]);
        let kept = run.keep().unwrap();

        assert!(kept.exists());
        fs::remove_file(kept).unwrap();
    }

    #[rstest]
    fn test_truncated_run_reports_error(tmp_dir: tempfile::TempDir) {
        let run = write_run(&tmp_dir, &[1, 2, 3]);

        let len = fs::metadata(run.path()).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(run.path()).unwrap();
        file.set_len(len - 1).unwrap();

        let format = Arc::new(MsgPackFormat::<i32>::default());
        let items: Vec<_> = run.open(format, None).unwrap().collect();
        assert!(items.last().unwrap().is_err());
    }

    #[test]
    fn test_format_shared_across_threads() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}

        // the format must be shareable even when the item type is not Sync
        assert_send_sync(&MsgPackFormat::<std::cell::Cell<i32>>::default());
        assert_send_sync(&MsgPackFormat::<i32>::default());
    }

    #[test]
    fn test_trailer_mismatch() {
        let format = MsgPackFormat::<i32>::default();
        let mut buf = Vec::new();
        rmp_serde::encode::write(&mut buf, &0u32).unwrap();

        let result = format.read_trailer(&mut buf.as_slice());
        assert!(result.is_err());
    }
}
