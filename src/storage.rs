//! Storage backends: an ordered sequence of serialized rows with append,
//! full scan, and atomic bulk rewrite.
//!
//! The engine is backend-agnostic; anything implementing [`Storage`] works.
//! Two backends are provided: [`MemoryStorage`] (a row vector, no
//! durability) and [`CsvStorage`] (one CSV row per point, append-only
//! writes, stage-and-swap rewrites through a temp file).

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::TinyFluxError;
use crate::point::Row;

/// Lazy scan over a backend: `(row-id, raw row)` in insertion order.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<(usize, Row), TinyFluxError>> + 'a>;

/// The capability a storage backend supplies to the engine.
///
/// Row-ids are dense positions `0..len-1`, stable until the next `rewrite`.
pub trait Storage {
    /// Streams every row in insertion order.
    fn read_all(&mut self) -> Result<RowIter<'_>, TinyFluxError>;

    /// Appends one row, returning its row-id. Never reads existing data.
    fn append(&mut self, row: Row) -> Result<usize, TinyFluxError>;

    /// Appends a batch of rows, returning their row-ids.
    fn append_many(&mut self, rows: Vec<Row>) -> Result<Vec<usize>, TinyFluxError> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(self.append(row)?);
        }
        Ok(ids)
    }

    /// Replaces the whole backend with `rows`, atomically: a failure leaves
    /// the previous contents intact.
    fn rewrite(&mut self, rows: Vec<Row>) -> Result<(), TinyFluxError>;

    /// Number of stored rows.
    fn len(&mut self) -> Result<usize, TinyFluxError>;

    /// Optional cleanup hook.
    fn close(&mut self) -> Result<(), TinyFluxError> {
        Ok(())
    }
}

/// In-process backend: an ordered vector of raw rows.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: Vec<Row>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn read_all(&mut self) -> Result<RowIter<'_>, TinyFluxError> {
        Ok(Box::new(
            self.rows
                .iter()
                .cloned()
                .enumerate()
                .map(Ok::<_, TinyFluxError>),
        ))
    }

    fn append(&mut self, row: Row) -> Result<usize, TinyFluxError> {
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    fn rewrite(&mut self, rows: Vec<Row>) -> Result<(), TinyFluxError> {
        self.rows = rows;
        Ok(())
    }

    fn len(&mut self) -> Result<usize, TinyFluxError> {
        Ok(self.rows.len())
    }
}

/// Default on-disk backend: one CSV record per point.
///
/// Records are comma-separated, quoted per standard CSV rules, terminated by
/// a bare `\n` with no platform newline translation. The file is opened once
/// and the handle reused; appends seek to the end, scans seek to the start.
#[derive(Debug)]
pub struct CsvStorage {
    path: PathBuf,
    handle: File,
    row_count: usize,
}

impl CsvStorage {
    /// Opens (or creates) the CSV file at `path`, creating missing parent
    /// directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TinyFluxError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut storage = CsvStorage {
            path,
            handle,
            row_count: 0,
        };
        storage.row_count = storage.count_rows()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn count_rows(&mut self) -> Result<usize, TinyFluxError> {
        self.handle.seek(SeekFrom::Start(0))?;
        let mut reader = reader_for(BufReader::new(&self.handle));
        let mut count = 0;
        for record in reader.records() {
            record?;
            count += 1;
        }
        Ok(count)
    }
}

fn reader_for<R: std::io::Read>(inner: R) -> csv::Reader<R> {
    // Rows have variable column counts, so the reader must be flexible and
    // header-less.
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(inner)
}

impl Storage for CsvStorage {
    fn read_all(&mut self) -> Result<RowIter<'_>, TinyFluxError> {
        self.handle.seek(SeekFrom::Start(0))?;
        let reader = reader_for(BufReader::new(&self.handle));
        Ok(Box::new(reader.into_records().enumerate().map(
            |(id, record)| {
                record
                    .map(|r| (id, r.iter().map(str::to_string).collect()))
                    .map_err(TinyFluxError::from)
            },
        )))
    }

    fn append(&mut self, row: Row) -> Result<usize, TinyFluxError> {
        self.append_many(vec![row]).map(|ids| ids[0])
    }

    fn append_many(&mut self, rows: Vec<Row>) -> Result<Vec<usize>, TinyFluxError> {
        self.handle.seek(SeekFrom::End(0))?;
        {
            let mut writer = csv::Writer::from_writer(&self.handle);
            for row in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        self.handle.sync_data()?;
        let first = self.row_count;
        self.row_count += rows.len();
        Ok((first..self.row_count).collect())
    }

    fn rewrite(&mut self, rows: Vec<Row>) -> Result<(), TinyFluxError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        // Stage into a temp file on the same filesystem, then rename over
        // the primary. The original file is untouched until the staged copy
        // is complete.
        let mut staged = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::Writer::from_writer(staged.as_file_mut());
            for row in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        staged.as_file().sync_all()?;
        staged
            .persist(&self.path)
            .map_err(|e| TinyFluxError::Io(e.error))?;

        self.handle = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.row_count = rows.len();
        Ok(())
    }

    fn len(&mut self) -> Result<usize, TinyFluxError> {
        Ok(self.row_count)
    }

    fn close(&mut self) -> Result<(), TinyFluxError> {
        self.handle.sync_all()?;
        Ok(())
    }
}
