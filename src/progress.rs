use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::ImportStage;

/// Receives `(message, percent)` updates during a run.
pub trait ProgressSink {
    fn report(&mut self, message: &str, percent: u8);
}

impl<F: FnMut(&str, u8)> ProgressSink for F {
    fn report(&mut self, message: &str, percent: u8) {
        self(message, percent)
    }
}

/// Discards all updates.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _message: &str, _percent: u8) {}
}

/// Maps stage-local progress onto the overall percentage and never lets it go
/// backwards.
pub struct ProgressTracker<P> {
    sink: P,
    last: u8,
}

impl<P: ProgressSink> ProgressTracker<P> {
    pub fn new(sink: P) -> Self {
        Self { sink, last: 0 }
    }

    pub fn update(&mut self, stage: ImportStage, fraction: f64, message: &str) {
        let (start, weight) = stage.span();
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let percent = (start + weight * fraction).floor().clamp(0.0, 100.0) as u8;
        self.last = self.last.max(percent);
        self.sink.report(message, self.last);
    }
}

/// Terminal progress bar for the command-line loader.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new(bar: ProgressBar) -> Self {
        bar.set_length(100);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [import {elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }
}

impl ProgressSink for TerminalProgress {
    fn report(&mut self, message: &str, percent: u8) {
        self.bar.set_position(u64::from(percent));
        self.bar.set_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;

    #[test]
    fn percentages_never_decrease() {
        let mut seen = Vec::new();
        {
            let mut tracker = ProgressTracker::new(|_: &str, pct: u8| seen.push(pct));
            tracker.update(ImportStage::Parsing, 1.0, "parsed");
            tracker.update(ImportStage::ExtractingReferenceData(EntityKind::Drug), 0.5, "drugs");
            // A late update from an earlier stage must not move the bar back.
            tracker.update(ImportStage::Parsing, 0.5, "parsed again");
            tracker.update(ImportStage::Loading, f64::NAN, "loading");
            tracker.update(ImportStage::Complete, 0.0, "done");
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.first(), Some(&20));
        assert_eq!(seen.last(), Some(&100));
    }
}
