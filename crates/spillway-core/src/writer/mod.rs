//! Chunked record writer.
//!
//! Records go into a temporary file beside the destination. Every `chunk_size`
//! rows the sink flushes and reports [`StreamProgress`]. `finish` moves the
//! temporary file into place atomically without replacing an existing file
//! (a taken name becomes `stem_1.ext`, `stem_2.ext`, ...); dropping an
//! unfinished sink removes it, so a failed or cancelled write never leaves a
//! file that looks complete.

pub mod flatten;

use std::collections::BTreeSet;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::OutputFormat;

/// `stem_N.ext` を試す上限
const MAX_RENAMES: u32 = 1_000;

/// Running counters of one write. Both only count flushed data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamProgress {
    pub rows_written: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Where the file ended up; differs from the requested destination only
    /// when that name was already taken.
    pub location: PathBuf,
    pub rows_written: u64,
    pub bytes_written: u64,

    /// CSV columns first seen after the header was fixed.
    pub dropped_columns: Vec<String>,
}

/// Write failed midway. Counts are what had been flushed before the failure;
/// the partial artifact has already been removed.
#[derive(Debug, Clone, Error)]
#[error("writing {} failed after {rows_written} rows ({bytes_written} bytes): {message}", path.display())]
pub struct WriteFailure {
    pub path: PathBuf,
    pub message: String,
    pub rows_written: u64,
    pub bytes_written: u64,
}

/// `io::Write` adapter that counts bytes passed through.
struct Counting<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Write for Counting<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Encoder {
    Csv {
        out: csv::Writer<Counting<NamedTempFile>>,
        header: Option<Vec<String>>,
        /// rows of the first chunk, held until the header is known
        held: Vec<Vec<(String, String)>>,
    },
    Json {
        out: Counting<BufWriter<NamedTempFile>>,
        first: bool,
    },
}

/// Open write handle; see [`StreamingWriter::open`].
pub struct RecordSink {
    destination: PathBuf,
    chunk_size: usize,
    encoder: Encoder,
    pending: u64,
    progress: StreamProgress,
    dropped: BTreeSet<String>,
}

impl RecordSink {
    fn create(destination: &Path, format: OutputFormat, chunk_size: usize) -> Result<Self, WriteFailure> {
        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir).map_err(|e| WriteFailure {
            path: destination.to_path_buf(),
            message: format!("cannot create temporary file: {e}"),
            rows_written: 0,
            bytes_written: 0,
        })?;

        let encoder = match format {
            OutputFormat::Csv => Encoder::Csv {
                out: csv::Writer::from_writer(Counting { inner: tmp, bytes: 0 }),
                header: None,
                held: Vec::new(),
            },
            OutputFormat::Json => Encoder::Json {
                out: Counting {
                    inner: BufWriter::new(tmp),
                    bytes: 0,
                },
                first: true,
            },
        };

        Ok(Self {
            destination: destination.to_path_buf(),
            chunk_size: chunk_size.max(1),
            encoder,
            pending: 0,
            progress: StreamProgress::default(),
            dropped: BTreeSet::new(),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Flushed counters so far.
    pub fn progress(&self) -> StreamProgress {
        self.progress
    }

    fn failure(&self, message: impl Into<String>) -> WriteFailure {
        WriteFailure {
            path: self.destination.clone(),
            message: message.into(),
            rows_written: self.progress.rows_written,
            bytes_written: self.progress.bytes_written,
        }
    }

    /// Append one record. Returns the new progress when this push completed a
    /// chunk (and therefore flushed).
    pub fn push(&mut self, record: &serde_json::Value) -> Result<Option<StreamProgress>, WriteFailure> {
        let result: Result<(), String> = match &mut self.encoder {
            Encoder::Csv { out, header, held } => {
                let row = flatten::flatten(record);
                match header {
                    None => {
                        held.push(row);
                        Ok(())
                    }
                    Some(columns) => write_projected(out, columns, row, &mut self.dropped)
                        .map_err(|e| e.to_string()),
                }
            }
            Encoder::Json { out, first } => {
                let sep: &[u8] = if *first { b"[\n" } else { b",\n" };
                *first = false;
                match out.write_all(sep) {
                    Ok(()) => serde_json::to_writer(&mut *out, record).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
        };
        result.map_err(|m| self.failure(m))?;

        self.pending += 1;
        if self.pending >= self.chunk_size as u64 {
            return self.flush_chunk().map(Some);
        }
        Ok(None)
    }

    /// Push a batch; `on_progress` runs after every chunk flush.
    pub fn extend<'r, I, F>(&mut self, records: I, mut on_progress: F) -> Result<(), WriteFailure>
    where
        I: IntoIterator<Item = &'r serde_json::Value>,
        F: FnMut(StreamProgress),
    {
        for record in records {
            if let Some(progress) = self.push(record)? {
                on_progress(progress);
            }
        }
        Ok(())
    }

    /// Flush whatever is pending, fixing the CSV header on the first call.
    pub fn flush_chunk(&mut self) -> Result<StreamProgress, WriteFailure> {
        let result = match &mut self.encoder {
            Encoder::Csv { out, header, held } => flush_csv(out, header, held, &mut self.dropped),
            Encoder::Json { out, .. } => out.flush().map(|()| out.bytes).map_err(csv::Error::from),
        };
        let bytes = result.map_err(|e| self.failure(e.to_string()))?;

        // held CSV rows (header still undecided) are not on disk yet
        let held = match &self.encoder {
            Encoder::Csv { held, .. } => held.len() as u64,
            Encoder::Json { .. } => 0,
        };
        self.progress.rows_written += self.pending - held;
        self.pending = held;
        self.progress.bytes_written = bytes;
        debug!(
            rows = self.progress.rows_written,
            bytes = self.progress.bytes_written,
            "chunk flushed"
        );
        Ok(self.progress)
    }

    /// Flush the remainder and move the file onto the destination.
    pub fn finish(mut self) -> Result<WriteSummary, WriteFailure> {
        if let Encoder::Json { out, first } = &mut self.encoder {
            let tail: &[u8] = if *first { b"[]\n" } else { b"\n]\n" };
            *first = false;
            out.write_all(tail)
                .map_err(|e| WriteFailure {
                    path: self.destination.clone(),
                    message: e.to_string(),
                    rows_written: self.progress.rows_written,
                    bytes_written: self.progress.bytes_written,
                })?;
        }
        self.flush_chunk()?;
        if let Encoder::Csv { header: None, held, .. } = &mut self.encoder {
            if !held.is_empty() {
                warn!(
                    path = %self.destination.display(),
                    records = held.len(),
                    "records without any column were skipped"
                );
                held.clear();
                self.pending = 0;
            }
        }

        let Self {
            destination,
            encoder,
            progress,
            dropped,
            ..
        } = self;

        let tmp = match encoder {
            Encoder::Csv { out, .. } => out
                .into_inner()
                .map(|c| c.inner)
                .map_err(|e| e.error().to_string()),
            Encoder::Json { out, .. } => out.inner.into_inner().map_err(|e| e.error().to_string()),
        };
        let fail = |message: String| WriteFailure {
            path: destination.clone(),
            message,
            rows_written: progress.rows_written,
            bytes_written: progress.bytes_written,
        };
        let tmp = tmp.map_err(fail)?;
        tmp.as_file().sync_all().map_err(|e| fail(e.to_string()))?;
        let location = persist_unique(tmp, &destination).map_err(|e| fail(e.to_string()))?;
        if location != destination {
            info!(
                requested = %destination.display(),
                path = %location.display(),
                "destination already existed; wrote beside it"
            );
        }

        let dropped_columns: Vec<String> = dropped.into_iter().collect();
        if !dropped_columns.is_empty() {
            warn!(
                path = %location.display(),
                columns = ?dropped_columns,
                "columns absent from the first chunk were dropped"
            );
        }
        Ok(WriteSummary {
            location,
            rows_written: progress.rows_written,
            bytes_written: progress.bytes_written,
            dropped_columns,
        })
    }

    /// Discard the partial write. Same as dropping the sink, but logged.
    pub fn abort(self) {
        debug!(
            path = %self.destination.display(),
            rows = self.progress.rows_written,
            "partial write discarded"
        );
    }
}

/// Move `tmp` onto `destination`, or onto the first free `stem_N.ext` beside it.
fn persist_unique(mut tmp: NamedTempFile, destination: &Path) -> io::Result<PathBuf> {
    let mut candidate = destination.to_path_buf();
    let mut n = 0;
    loop {
        match tmp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists && n < MAX_RENAMES => {
                tmp = e.file;
                n += 1;
                candidate = numbered(destination, n);
            }
            Err(e) => return Err(e.error),
        }
    }
}

fn numbered(destination: &Path, n: u32) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    destination.with_file_name(name)
}

/// Fix the header from the held rows (first call only), then flush.
/// Returns the byte count on disk.
fn flush_csv(
    out: &mut csv::Writer<Counting<NamedTempFile>>,
    header: &mut Option<Vec<String>>,
    held: &mut Vec<Vec<(String, String)>>,
    dropped: &mut BTreeSet<String>,
) -> Result<u64, csv::Error> {
    if header.is_none() {
        let mut columns: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for row in held.iter() {
            for (column, _) in row {
                if seen.insert(column.as_str()) {
                    columns.push(column.clone());
                }
            }
        }
        // an all-`{}` chunk leaves the header undecided
        if !columns.is_empty() {
            out.write_record(&columns)?;
            for row in held.drain(..) {
                write_projected(out, &columns, row, dropped)?;
            }
            *header = Some(columns);
        }
    }
    out.flush()?;
    Ok(out.get_ref().bytes)
}

fn write_projected<W: Write>(
    out: &mut csv::Writer<W>,
    columns: &[String],
    row: Vec<(String, String)>,
    dropped: &mut BTreeSet<String>,
) -> Result<(), csv::Error> {
    let mut cells = vec![String::new(); columns.len()];
    for (column, value) in row {
        match columns.iter().position(|c| *c == column) {
            Some(i) => cells[i] = value,
            None => {
                dropped.insert(column);
            }
        }
    }
    out.write_record(&cells)
}

/// Entry point: opens sinks and writes whole record sequences.
#[derive(Debug, Clone, Copy)]
pub struct StreamingWriter {
    chunk_size: usize,
}

impl StreamingWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn open(&self, destination: &Path, format: OutputFormat) -> Result<RecordSink, WriteFailure> {
        RecordSink::create(destination, format, self.chunk_size)
    }

    /// Write a whole (lazy) sequence and persist it.
    pub fn write<I, F>(
        &self,
        records: I,
        destination: &Path,
        format: OutputFormat,
        mut on_progress: F,
    ) -> Result<WriteSummary, WriteFailure>
    where
        I: IntoIterator<Item = serde_json::Value>,
        F: FnMut(StreamProgress),
    {
        let mut sink = self.open(destination, format)?;
        for record in records {
            if let Some(progress) = sink.push(&record)? {
                on_progress(progress);
            }
        }
        let summary = sink.finish()?;
        on_progress(StreamProgress {
            rows_written: summary.rows_written,
            bytes_written: summary.bytes_written,
        });
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn rows(n: usize) -> impl Iterator<Item = serde_json::Value> {
        (0..n).map(|i| json!({"id": i, "geo": {"lat": 1.5, "lon": -2.0}, "tags": ["a", "b"]}))
    }

    #[test]
    fn csv_rows_match_what_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut flushes = Vec::new();

        let summary = StreamingWriter::new(100)
            .write(rows(250), &path, OutputFormat::Csv, |p| flushes.push(p))
            .unwrap();

        assert_eq!(summary.rows_written, 250);
        assert_eq!(summary.bytes_written, fs::metadata(&path).unwrap().len());
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<_> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, vec!["geo_lat", "geo_lon", "id", "tags"]);
        let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len() as u64, summary.rows_written);
        assert_eq!(&records[7][3], r#"["a","b"]"#);

        let counts: Vec<u64> = flushes.iter().map(|p| p.rows_written).collect();
        assert_eq!(counts, vec![100, 200, 250]);
    }

    #[test]
    fn json_output_is_one_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let summary = StreamingWriter::new(2)
            .write(rows(5), &path, OutputFormat::Json, |_| {})
            .unwrap();

        let parsed: Vec<serde_json::Value> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.len() as u64, summary.rows_written);
        assert_eq!(parsed[3]["geo"]["lat"], json!(1.5));
    }

    #[test]
    fn empty_input_produces_valid_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StreamingWriter::new(10);

        let json_path = dir.path().join("empty.json");
        let summary = writer
            .write(std::iter::empty(), &json_path, OutputFormat::Json, |_| {})
            .unwrap();
        assert_eq!(summary.rows_written, 0);
        let parsed: Vec<serde_json::Value> =
            serde_json::from_slice(&fs::read(&json_path).unwrap()).unwrap();
        assert!(parsed.is_empty());

        let csv_path = dir.path().join("empty.csv");
        writer
            .write(std::iter::empty(), &csv_path, OutputFormat::Csv, |_| {})
            .unwrap();
        assert!(csv_path.exists());
    }

    #[test]
    fn late_columns_are_dropped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.csv");
        let records = vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3, "b": 9})];

        let summary = StreamingWriter::new(2)
            .write(records, &path, OutputFormat::Csv, |_| {})
            .unwrap();

        assert_eq!(summary.rows_written, 3);
        assert_eq!(summary.dropped_columns, vec!["b".to_string()]);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(reader.records().count(), 3);
    }

    #[test]
    fn columns_within_first_chunk_are_unioned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("union.csv");
        let records = vec![json!({"a": 1}), json!({"b": "x"}), json!({"a": 3})];

        let summary = StreamingWriter::new(10)
            .write(records, &path, OutputFormat::Csv, |_| {})
            .unwrap();

        assert!(summary.dropped_columns.is_empty());
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), vec!["a", "b"]);
        let rows: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(&rows[1][0], "");
        assert_eq!(&rows[1][1], "x");
    }

    #[test]
    fn existing_file_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.csv");
        fs::write(&path, "keep me\n").unwrap();
        let writer = StreamingWriter::new(10);

        let first = writer.write(rows(3), &path, OutputFormat::Csv, |_| {}).unwrap();
        let second = writer.write(rows(4), &path, OutputFormat::Csv, |_| {}).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me\n");
        assert_eq!(first.location, dir.path().join("obs_1.csv"));
        assert_eq!(second.location, dir.path().join("obs_2.csv"));
        assert_eq!(csv::Reader::from_path(&first.location).unwrap().records().count(), 3);
        assert_eq!(csv::Reader::from_path(&second.location).unwrap().records().count(), 4);
    }

    #[test]
    fn colliding_flattened_columns_keep_both_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collide.csv");
        let summary = StreamingWriter::new(10)
            .write(vec![json!({"a_b": 1, "a": {"b": 2}})], &path, OutputFormat::Csv, |_| {})
            .unwrap();

        assert!(summary.dropped_columns.is_empty());
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let mut header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        header.sort();
        assert_eq!(header, vec!["a_b", "a_b_2"]);
        let record = reader.records().next().unwrap().unwrap();
        let mut cells: Vec<&str> = record.iter().collect();
        cells.sort_unstable();
        assert_eq!(cells, vec!["1", "2"]);
    }

    #[test]
    fn abandoned_sink_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        let mut sink = StreamingWriter::new(2).open(&path, OutputFormat::Csv).unwrap();
        for r in rows(5) {
            sink.push(&r).unwrap();
        }
        assert_eq!(sink.progress().rows_written, 4);
        sink.abort();

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_directory_is_a_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("out.csv");
        let err = StreamingWriter::new(10)
            .write(rows(1), &path, OutputFormat::Csv, |_| {})
            .unwrap_err();
        assert_eq!(err.rows_written, 0);
        assert_eq!(err.path, path);
    }
}
