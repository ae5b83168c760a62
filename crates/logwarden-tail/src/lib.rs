//! Incremental reader over a single append-only log file.
//!
//! Tracks a byte cursor per file, yields only whole lines appended after
//! the tailer was created, and detects truncation/rotation by the file
//! shrinking below the cursor.

mod tailer;

pub use tailer::LogTailer;
