//! Per-job I/O logs.
//!
//! Each captured chunk of output becomes one JSON line
//! `[delay_seconds, "stdout"|"stderr", "<base64 payload>"]`, where the delay
//! is measured from the previous chunk (or from process start for the first
//! one). The file is gzip-compressed.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use base64::prelude::*;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

/// Suffix of I/O log file names.
pub const IO_LOG_SUFFIX: &str = ".record.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoStream {
    Stdout,
    Stderr,
}

/// One captured chunk of output.
#[derive(Debug, Clone, PartialEq)]
pub struct IoLogRecord {
    /// Seconds since the previous record.
    pub delay: f64,
    pub stream: IoStream,
    pub data: Vec<u8>,
}

impl IoLogRecord {
    pub fn new(delay: f64, stream: IoStream, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delay,
            stream,
            data: data.into(),
        }
    }

    fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(&(self.delay, self.stream, BASE64_STANDARD.encode(&self.data)))
    }

    fn from_line(line: &str) -> std::io::Result<Self> {
        let (delay, stream, payload): (f64, IoStream, String) =
            serde_json::from_str(line).map_err(std::io::Error::other)?;
        let data = BASE64_STANDARD
            .decode(payload)
            .map_err(std::io::Error::other)?;
        Ok(Self {
            delay,
            stream,
            data,
        })
    }
}

/// Concatenated stdout of a log, decoded lossily.
pub fn stdout_text(records: &[IoLogRecord]) -> String {
    let bytes: Vec<u8> = records
        .iter()
        .filter(|r| r.stream == IoStream::Stdout)
        .flat_map(|r| r.data.iter().copied())
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Makes a job id safe for use as a file name.
pub fn slugify(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File name of the I/O log of `job_id`.
pub fn io_log_filename(job_id: &str) -> String {
    format!("{}{}", slugify(job_id), IO_LOG_SUFFIX)
}

/// Streams records into a compressed log file.
pub struct IoLogWriter {
    encoder: GzEncoder<File>,
}

impl IoLogWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            encoder: GzEncoder::new(file, Compression::fast()),
        })
    }

    pub fn write_record(&mut self, record: &IoLogRecord) -> std::io::Result<()> {
        let line = record.to_line().map_err(std::io::Error::other)?;
        self.encoder.write_all(line.as_bytes())?;
        self.encoder.write_all(b"\n")
    }

    /// Flushes the compressed stream and syncs the file.
    pub fn finish(self) -> std::io::Result<()> {
        let file = self.encoder.finish()?;
        file.sync_all()
    }
}

/// Reads every record of a compressed log file.
pub struct IoLogReader;

impl IoLogReader {
    pub fn read_all(path: &Path) -> std::io::Result<Vec<IoLogRecord>> {
        let reader = BufReader::new(GzDecoder::new(File::open(path)?));
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(IoLogRecord::from_line(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(io_log_filename("ns::disk/read"));
        let records = vec![
            IoLogRecord::new(0.0, IoStream::Stdout, "name: fwts\n"),
            IoLogRecord::new(0.25, IoStream::Stderr, vec![0xff, 0x00, b'\n']),
        ];

        let mut writer = IoLogWriter::create(&path).unwrap();
        for record in &records {
            writer.write_record(record).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(IoLogReader::read_all(&path).unwrap(), records);
    }

    #[test]
    fn test_line_format() {
        let line = IoLogRecord::new(1.5, IoStream::Stdout, "hi").to_line().unwrap();
        assert_eq!(line, r#"[1.5,"stdout","aGk="]"#);
    }

    #[test]
    fn test_stdout_text_ignores_stderr() {
        let records = vec![
            IoLogRecord::new(0.0, IoStream::Stdout, "a: 1\n"),
            IoLogRecord::new(0.0, IoStream::Stderr, "warning\n"),
            IoLogRecord::new(0.0, IoStream::Stdout, "b: 2\n"),
        ];
        assert_eq!(stdout_text(&records), "a: 1\nb: 2\n");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("com.example::disk/read sda"), "com.example__disk_read_sda");
        assert_eq!(io_log_filename("a::b"), "a__b.record.gz");
    }
}
