//! Chunk processing
//!
//! [`ChunkProcessor`] turns a byte range of a log file into a
//! [`MetricsPartial`]. [`AccessLogProcessor`] is the default for
//! access-log style lines.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::coordinator::aggregator::MetricsPartial;
use crate::error::{AnalyzerError, Result};

/// Computes metrics for one chunk.
///
/// Called from a blocking thread; implementations may do synchronous I/O.
pub trait ChunkProcessor: Send + Sync + 'static {
    fn process(&self, filepath: &Path, offset: u64, size: u64) -> Result<MetricsPartial>;
}

/// Classification of a single request line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestLine {
    pub status: Option<u16>,
    pub response_time: f64,
}

impl RequestLine {
    /// Parse one line, `None` when it is blank.
    ///
    /// The first three-digit token in 100..=599 is the status code. The last
    /// numeric token after it is the response time. A bare number directly
    /// after the status is the bytes field and only counts with an `ms` suffix.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return None;
        }

        let status_pos = tokens.iter().position(|t| parse_status(t).is_some());
        let status = status_pos.and_then(|i| parse_status(tokens[i]));
        let search_from = status_pos.map_or(0, |i| i + 1);
        let bytes_pos = status_pos.map(|i| i + 1);

        let response_time = tokens
            .iter()
            .enumerate()
            .skip(search_from)
            .rev()
            .find_map(|(i, t)| parse_response_time(t, Some(i) != bytes_pos))
            .unwrap_or(0.0);

        Some(Self {
            status,
            response_time,
        })
    }

    pub fn is_error(&self) -> bool {
        self.status.is_some_and(|s| s >= 500)
    }
}

fn parse_status(token: &str) -> Option<u16> {
    if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok().filter(|s| (100..=599).contains(s))
}

fn parse_response_time(token: &str, allow_bare: bool) -> Option<f64> {
    let token = token.trim_matches('"');
    let number = match token.strip_suffix("ms") {
        Some(number) => number,
        None if allow_bare => token,
        None => return None,
    };
    number
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Default processor for access logs.
///
/// A line belongs to the chunk holding its first byte: a partial first line
/// is left to the previous chunk and the last line is read to its end even
/// past `offset + size`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogProcessor;

impl AccessLogProcessor {
    fn scan(&self, filepath: &Path, offset: u64, size: u64) -> std::io::Result<MetricsPartial> {
        let mut metrics = MetricsPartial::default();
        if size == 0 {
            return Ok(metrics);
        }

        let mut reader = BufReader::new(File::open(filepath)?);
        let mut pos = offset;
        let mut buf = Vec::new();

        if offset > 0 {
            reader.seek(SeekFrom::Start(offset - 1))?;
            let mut prev = [0u8; 1];
            reader.read_exact(&mut prev)?;
            if prev[0] != b'\n' {
                pos += reader.read_until(b'\n', &mut buf)? as u64;
            }
        }

        let end = offset + size;
        while pos < end {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            pos += read as u64;

            if let Some(line) = RequestLine::parse(&String::from_utf8_lossy(&buf)) {
                metrics.total_requests += 1;
                if line.is_error() {
                    metrics.error_count += 1;
                }
                metrics.sum_response_time += line.response_time;
            }
        }

        Ok(metrics)
    }
}

impl ChunkProcessor for AccessLogProcessor {
    fn process(&self, filepath: &Path, offset: u64, size: u64) -> Result<MetricsPartial> {
        self.scan(filepath, offset, size)
            .map_err(|e| AnalyzerError::Processing {
                filepath: filepath.display().to_string(),
                offset,
                reason: e.to_string(),
            })
    }
}
