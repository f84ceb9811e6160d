// 📊 Batch Progress Reporter
//
// Text progress bar for long scans plus the per-pass tally printed at the end.

use serde::Serialize;
use tracing::info;

pub const DEFAULT_BAR_LENGTH: usize = 50;

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    total: usize,
    every: usize,
    bar_length: usize,
}

impl ProgressReporter {
    /// `every` is the reporting cadence in items; 0 is treated as 1
    pub fn new(total: usize, every: usize) -> Self {
        ProgressReporter {
            total,
            every: every.max(1),
            bar_length: DEFAULT_BAR_LENGTH,
        }
    }

    pub fn with_bar_length(mut self, bar_length: usize) -> Self {
        self.bar_length = bar_length.max(1);
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// `Progress: [#####     ] 5/10 - note`
    ///
    /// A zero total renders as complete. `current` beyond `total` is clamped.
    pub fn render(&self, current: usize, note: &str) -> String {
        let filled = if self.total == 0 {
            self.bar_length
        } else {
            current.min(self.total) * self.bar_length / self.total
        };

        let mut line = format!(
            "Progress: [{}{}] {}/{}",
            "#".repeat(filled),
            " ".repeat(self.bar_length - filled),
            current,
            self.total
        );
        if !note.is_empty() {
            line.push_str(" - ");
            line.push_str(note);
        }
        line
    }

    pub fn report(&self, current: usize, note: &str) {
        info!("{}", self.render(current, note));
    }

    /// Report on cadence and on the last item. Returns whether a line was emitted.
    pub fn tick(&self, current: usize, note: &str) -> bool {
        if current % self.every == 0 || current == self.total {
            self.report(current, note);
            true
        } else {
            false
        }
    }
}

/// Counters for one reconciliation or fixup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassTally {
    pub scanned: usize,
    pub matched: usize,
    pub updated: usize,
    pub skipped: usize,
    pub declined: usize,
    pub failed: usize,
}

impl PassTally {
    pub fn summary(&self) -> String {
        format!(
            "{} scanned | {} matched, {} updated, {} skipped, {} declined, {} failed",
            self.scanned, self.matched, self.updated, self.skipped, self.declined, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_half_way() {
        let reporter = ProgressReporter::new(10, 1).with_bar_length(10);
        assert_eq!(
            reporter.render(5, "5 updated"),
            "Progress: [#####     ] 5/10 - 5 updated"
        );
    }

    #[test]
    fn test_render_bounds() {
        let reporter = ProgressReporter::new(4, 1).with_bar_length(8);
        assert_eq!(reporter.render(0, ""), "Progress: [        ] 0/4");
        assert_eq!(reporter.render(4, ""), "Progress: [########] 4/4");
        assert_eq!(reporter.render(9, ""), "Progress: [########] 9/4");
    }

    #[test]
    fn test_zero_total_does_not_divide() {
        let reporter = ProgressReporter::new(0, 10).with_bar_length(4);
        assert_eq!(reporter.render(0, "empty"), "Progress: [####] 0/0 - empty");
    }

    #[test]
    fn test_tick_cadence() {
        let reporter = ProgressReporter::new(25, 10);
        let emitted: Vec<usize> = (1..=25).filter(|&i| reporter.tick(i, "")).collect();
        assert_eq!(emitted, vec![10, 20, 25]);
    }

    #[test]
    fn test_tally_summary() {
        let tally = PassTally {
            scanned: 12,
            matched: 10,
            updated: 7,
            skipped: 2,
            declined: 1,
            failed: 0,
        };
        assert_eq!(
            tally.summary(),
            "12 scanned | 10 matched, 7 updated, 2 skipped, 1 declined, 0 failed"
        );
    }
}
