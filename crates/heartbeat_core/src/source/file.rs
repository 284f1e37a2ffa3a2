//! Source adapter that tails a JSON-lines sample file.
//!
//! Each line is one `{ "bpm", "start", "end", "source" }` object. Cursors have
//! the form `offset:<bytes>` and always point just past a complete line, so a
//! line still being written is picked up by the next query. A line longer
//! than the read window is skipped as malformed once its newline exists.

use crate::model::sample::{RawSample, Sample};
use crate::source::{AuthError, Cursor, QueryBatch, QueryError, SampleSource, WakeReceiver};
use async_trait::async_trait;
use log::warn;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const CURSOR_PREFIX: &str = "offset:";
const DEFAULT_READ_LIMIT: u64 = 1024 * 1024;

/// File-backed source without push notifications; pair it with periodic wakes.
pub struct JsonLinesSource {
    source_id: String,
    path: PathBuf,
    read_limit: u64,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source_id: format!("jsonl:{}", path.display()),
            path,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }

    /// Caps the bytes read by one query (minimum 1).
    pub fn with_read_limit(mut self, bytes: u64) -> Self {
        self.read_limit = bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_from(&self, offset: u64) -> Result<Vec<u8>, QueryError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        if offset > len {
            // Truncated or replaced file: the cursor no longer names a position.
            return Err(QueryError::InvalidCursor(format!(
                "{CURSOR_PREFIX}{offset} is past the end of {} ({len} bytes)",
                self.path.display()
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(self.read_limit).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Offset just past the first newline at or after `from`, if written yet.
    fn next_line_start(&self, from: u64) -> Result<Option<u64>, QueryError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(from))?;
        let mut chunk = vec![0; 64 * 1024];
        let mut position = from;
        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                return Ok(None);
            }
            if let Some(index) = chunk[..read].iter().position(|byte| *byte == b'\n') {
                return Ok(Some(position + index as u64 + 1));
            }
            position += read as u64;
        }
    }
}

#[async_trait]
impl SampleSource for JsonLinesSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_available(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
            _ => true,
        }
    }

    async fn request_authorization(&self) -> Result<(), AuthError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => Err(AuthError::CapabilityUnavailable),
            Ok(_) => File::open(&self.path).map(|_| ()).map_err(|err| match err.kind() {
                ErrorKind::PermissionDenied => AuthError::Denied,
                _ => AuthError::Unavailable,
            }),
            Err(err) => match err.kind() {
                ErrorKind::NotFound => Ok(()),
                ErrorKind::PermissionDenied => Err(AuthError::Denied),
                _ => Err(AuthError::Unavailable),
            },
        }
    }

    async fn query_anchored(&self, anchor: Option<&Cursor>) -> Result<QueryBatch, QueryError> {
        let mut offset = match anchor {
            Some(cursor) => parse_cursor(cursor)?,
            None => 0,
        };
        let (buf, complete) = loop {
            let buf = self.read_from(offset)?;
            let complete = buf
                .iter()
                .rposition(|byte| *byte == b'\n')
                .map_or(0, |index| index + 1);
            let window_full = buf.len() as u64 >= self.read_limit;
            if complete > 0 || !window_full {
                break (buf, complete);
            }
            // No newline in a full window: the line at `offset` is oversized.
            match self.next_line_start(offset + buf.len() as u64)? {
                Some(next) => {
                    warn!(
                        "event=source_query module=source status=skip source={} offset={} skipped_bytes={} reason=line_exceeds_read_limit",
                        self.source_id,
                        offset,
                        next - offset
                    );
                    offset = next;
                }
                None => break (Vec::new(), 0),
            }
        };

        let mut samples = Vec::new();
        for (line_no, line) in buf[..complete].split(|byte| *byte == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match parse_line(line) {
                Ok(sample) => samples.push(sample),
                Err(reason) => warn!(
                    "event=source_query module=source status=skip source={} line_in_batch={} reason={}",
                    self.source_id, line_no, reason
                ),
            }
        }

        Ok(QueryBatch {
            samples,
            cursor: Cursor::new(format!("{CURSOR_PREFIX}{}", offset + complete as u64)),
        })
    }

    fn register_wakeups(&self) -> Option<WakeReceiver> {
        None
    }

    fn release_wakeups(&self) {}
}

fn parse_line(line: &[u8]) -> Result<Sample, String> {
    let raw: RawSample = serde_json::from_slice(line).map_err(|err| err.to_string())?;
    Sample::try_from(raw).map_err(|err| err.to_string())
}

fn parse_cursor(cursor: &Cursor) -> Result<u64, QueryError> {
    cursor
        .as_str()
        .strip_prefix(CURSOR_PREFIX)
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or_else(|| QueryError::InvalidCursor(cursor.to_string()))
}

#[cfg(test)]
mod tests {
    use super::JsonLinesSource;
    use crate::source::{AuthError, Cursor, QueryError, SampleSource};
    use std::fs::OpenOptions;
    use std::io::Write;

    const LINE_A: &str =
        r#"{"bpm":72,"start":"2024-03-01T10:00:00Z","end":"2024-03-01T10:00:00Z","source":"Watch"}"#;
    const LINE_B: &str =
        r#"{"bpm":75.4,"start":"2024-03-01T10:01:00Z","end":"2024-03-01T10:01:00Z","source":"Watch"}"#;

    fn append(path: &std::path::Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn missing_file_yields_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::new(dir.path().join("samples.jsonl"));
        assert!(source.is_available());
        assert_eq!(source.request_authorization().await, Ok(()));

        let batch = source.query_anchored(None).await.unwrap();
        assert!(batch.samples.is_empty());
        assert_eq!(batch.cursor, Cursor::new("offset:0"));
    }

    #[tokio::test]
    async fn partial_trailing_line_is_left_for_next_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        append(&path, &format!("{LINE_A}\n{}", &LINE_B[..20]));
        let source = JsonLinesSource::new(&path);

        let first = source.query_anchored(None).await.unwrap();
        assert_eq!(first.samples.len(), 1);
        assert_eq!(
            first.cursor,
            Cursor::new(format!("offset:{}", LINE_A.len() + 1))
        );

        append(&path, &format!("{}\n", &LINE_B[20..]));
        let second = source.query_anchored(Some(&first.cursor)).await.unwrap();
        assert_eq!(second.samples.len(), 1);
        assert_eq!(second.samples[0].bpm(), 75.4);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_but_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        append(&path, &format!("not json\n\n{LINE_A}\n"));
        let source = JsonLinesSource::new(&path);

        let batch = source.query_anchored(None).await.unwrap();
        assert_eq!(batch.samples.len(), 1);
        let again = source.query_anchored(Some(&batch.cursor)).await.unwrap();
        assert!(again.samples.is_empty());
    }

    #[tokio::test]
    async fn cursor_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        append(&path, &format!("{LINE_A}\n"));
        let source = JsonLinesSource::new(&path);

        let err = source
            .query_anchored(Some(&Cursor::new("offset:100000")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_instead_of_stalling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        append(&path, &format!("{}\n{LINE_A}\n", "x".repeat(300)));
        let source = JsonLinesSource::new(&path).with_read_limit(128);

        let batch = source.query_anchored(None).await.unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].bpm(), 72.0);
        assert_eq!(
            batch.cursor,
            Cursor::new(format!("offset:{}", 300 + 1 + LINE_A.len() + 1))
        );
    }

    #[tokio::test]
    async fn oversized_line_still_being_written_holds_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        append(&path, &"x".repeat(300));
        let source = JsonLinesSource::new(&path).with_read_limit(128);

        let batch = source.query_anchored(None).await.unwrap();
        assert!(batch.samples.is_empty());
        assert_eq!(batch.cursor, Cursor::new("offset:0"));

        append(&path, &format!("\n{LINE_B}\n"));
        let batch = source.query_anchored(Some(&batch.cursor)).await.unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].bpm(), 75.4);
    }

    #[tokio::test]
    async fn directory_path_is_capability_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::new(dir.path());
        assert_eq!(
            source.request_authorization().await,
            Err(AuthError::CapabilityUnavailable)
        );
    }
}
