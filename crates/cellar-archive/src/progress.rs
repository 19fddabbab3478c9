//! Progress sampling from GNU tar checkpoints.

/// Prefix echoed on stderr at every checkpoint, followed by its number.
pub const CHECKPOINT_MARKER: &str = "cellar-checkpoint:";

/// Size of one tar record (20 blocks of 512 bytes).
pub const RECORD_SIZE: u64 = 10240;

/// Checkpoint number carried by a stderr line, if it is a checkpoint line.
///
/// GNU tar may prefix the echoed text with its program name.
pub fn parse_checkpoint(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once(CHECKPOINT_MARKER)?;
    let digits: &str = &rest[..rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len())];
    digits.parse().ok()
}

/// Turns checkpoint numbers into a monotonic fraction of an expected total.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    expected:             Option<u64>,
    bytes_per_checkpoint: u64,
    last:                 f64,
}

impl ProgressTracker {
    pub fn new(expected: Option<u64>, records_per_checkpoint: u64) -> Self {
        Self {
            expected,
            bytes_per_checkpoint: records_per_checkpoint.max(1).saturating_mul(RECORD_SIZE),
            last: 0.0,
        }
    }

    /// New fraction in `0.0..=1.0`, or `None` when it would not advance.
    pub fn observe(&mut self, checkpoint: u64) -> Option<f64> {
        let expected = self.expected.filter(|e| *e > 0)?;
        let seen = checkpoint.saturating_mul(self.bytes_per_checkpoint);
        let fraction = (seen as f64 / expected as f64).min(1.0);
        if fraction > self.last {
            self.last = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    pub fn last(&self) -> f64 { self.last }
}
