//! Cursor-based tailer for one growing log file.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Tailer for a single append-only log file.
///
/// The cursor marks the byte offset just past the last complete line that
/// was handed out. It is monotonically non-decreasing except when the
/// file shrinks below it (truncation/rotation), where it resets to 0 and
/// the next poll re-reads the new file from the beginning.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    cursor: u64,
}

impl LogTailer {
    /// Create a tailer positioned at the current end of file, so lines
    /// already present are never replayed. A missing file starts the
    /// cursor at 0.
    pub fn new(path: PathBuf) -> Self {
        let cursor = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, cursor }
    }

    /// Create a tailer starting from offset 0 (for testing).
    #[cfg(test)]
    fn from_start(path: PathBuf) -> Self {
        Self { path, cursor: 0 }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Poll for complete lines appended since the last call.
    ///
    /// A partial trailing line (no newline yet) is left for the next
    /// poll; the cursor only ever advances past whole lines, so a line
    /// is delivered at most once and never before it is fully written.
    /// Lines are decoded lossily: bytes that are not valid UTF-8 become
    /// replacement characters rather than stalling the cursor on them.
    /// I/O errors are returned so the caller can log and back off; the
    /// cursor keeps whatever progress was made before the error.
    pub fn poll_new_lines(&mut self) -> io::Result<Vec<String>> {
        let len = fs::metadata(&self.path)?.len();

        if len < self.cursor {
            tracing::info!(
                path = %self.path.display(),
                cursor = self.cursor,
                len,
                "log file shrank, treating as rotation and restarting from 0"
            );
            self.cursor = 0;
            // Prior content is not emitted as new; the next poll reads
            // the replacement file from the beginning.
            return Ok(Vec::new());
        }
        if len == self.cursor {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.cursor))?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if !buf.ends_with(b"\n") {
                // Partial trailing line: re-read on the next poll.
                break;
            }
            self.cursor += n as u64;
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }

        Ok(lines)
    }
}
