//! Pattern correlation over newly appended log lines.
//!
//! Three independent checks run against every line: a stateless simple
//! phrase match, a 3-step time-bounded sequence machine, and a sliding
//! occurrence-threshold counter. One `Correlator` exists per instance and
//! is mutated only by that instance's tailing task.

use chrono::{DateTime, Duration, Utc};

use crate::types::Detection;

/// Known failure phrases that raise an immediate simple event
/// (case-insensitive contains, first match wins).
pub const SIMPLE_EVENT_PHRASES: &[&str] = &[
    "Failed to find or reach a new hotspot after 5 attempts",
    "Oops! Looks like we couldn't find optimal Return Route for current location!",
];

/// Step 1 of the kill sequence (case-insensitive).
pub const SEQUENCE_STEP1: &str = "You were killed by Blue Ringed Octopus";
/// Step 2 (case-insensitive). Only considered once step 1 has been seen.
pub const SEQUENCE_STEP2: &str = "Disabling Route Executor";
/// Step 3 (case-sensitive exact substring; the §c color code matters).
pub const SEQUENCE_STEP3: &str = "Fishing: §cDisabled";
/// The whole sequence must complete within this many seconds of step 1.
pub const SEQUENCE_WINDOW_SECS: i64 = 10;

/// Phrase counted by the sliding occurrence threshold (case-insensitive).
pub const THRESHOLD_PHRASE: &str = "Predicted hotspot doesn't seem to match the actual hotspot";
/// Occurrences needed within the window to raise a threshold event.
pub const THRESHOLD_COUNT: u32 = 5;
/// Window measured from the first occurrence.
pub const THRESHOLD_WINDOW_SECS: i64 = 5;

fn contains_ignore_case(line: &str, phrase: &str) -> bool {
    line.to_lowercase().contains(&phrase.to_lowercase())
}

/// 3-step ordered sequence state.
///
/// Invariant: `step > 0` implies `first_step_at` is set. Both later
/// transitions are timed from step 1, not from the preceding step.
#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    step: u8,
    first_step_at: Option<DateTime<Utc>>,
}

impl SequenceState {
    pub fn step(&self) -> u8 {
        self.step
    }

    fn reset(&mut self) {
        self.step = 0;
        self.first_step_at = None;
    }

    /// Advance the machine by one line. At most one transition per line,
    /// precedence step 1 > step 2 > step 3. Returns true when the line
    /// completed the sequence.
    fn observe(&mut self, line: &str, now: DateTime<Utc>) -> bool {
        // Step 1 unconditionally restarts, overwriting any progress.
        if contains_ignore_case(line, SEQUENCE_STEP1) {
            self.step = 1;
            self.first_step_at = Some(now);
            return false;
        }

        if self.step >= 1 && contains_ignore_case(line, SEQUENCE_STEP2) {
            match self.first_step_at {
                Some(t1)
                    if now.signed_duration_since(t1)
                        <= Duration::seconds(SEQUENCE_WINDOW_SECS) =>
                {
                    self.step = 2;
                }
                _ => self.reset(),
            }
            return false;
        }

        if self.step >= 2 && line.contains(SEQUENCE_STEP3) {
            let complete = matches!(
                self.first_step_at,
                Some(t1)
                    if now.signed_duration_since(t1) <= Duration::seconds(SEQUENCE_WINDOW_SECS)
            );
            self.reset();
            return complete;
        }

        false
    }
}

/// Sliding occurrence counter state.
///
/// Invariant: `count > 0` implies `first_at` is set.
#[derive(Debug, Clone, Default)]
pub struct ThresholdState {
    count: u32,
    first_at: Option<DateTime<Utc>>,
}

impl ThresholdState {
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Count one line. Returns the final count when the threshold is
    /// reached, after which the state is cleared.
    fn observe(&mut self, line: &str, now: DateTime<Utc>) -> Option<u32> {
        if !contains_ignore_case(line, THRESHOLD_PHRASE) {
            return None;
        }

        match self.first_at {
            Some(t0)
                if now.signed_duration_since(t0) <= Duration::seconds(THRESHOLD_WINDOW_SECS) =>
            {
                self.count += 1;
                if self.count >= THRESHOLD_COUNT {
                    let count = self.count;
                    self.count = 0;
                    self.first_at = None;
                    return Some(count);
                }
                None
            }
            _ => {
                // First occurrence, or the window from the first lapsed.
                self.first_at = Some(now);
                self.count = 1;
                None
            }
        }
    }
}

/// Per-instance correlator: runs all three checks on every line.
///
/// Performs no I/O and holds no locks; the caller injects `now` so tests
/// control the clock.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    sequence: SequenceState,
    threshold: ThresholdState,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> &SequenceState {
        &self.sequence
    }

    pub fn threshold(&self) -> &ThresholdState {
        &self.threshold
    }

    /// Evaluate one newly appended line, returning every detection it
    /// produced (a single line can match independent checks).
    pub fn observe(&mut self, line: &str, now: DateTime<Utc>) -> Vec<Detection> {
        let mut detections = Vec::new();

        if let Some(phrase) = SIMPLE_EVENT_PHRASES
            .iter()
            .find(|p| contains_ignore_case(line, p))
        {
            detections.push(Detection::Simple { phrase });
        }

        if self.sequence.observe(line, now) {
            detections.push(Detection::SequenceComplete);
        }

        if let Some(count) = self.threshold.observe(line, now) {
            detections.push(Detection::ThresholdReached { count });
        }

        detections
    }
}
