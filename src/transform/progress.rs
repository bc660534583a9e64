//! Progress events emitted by the pipeline and their standard consumers.

use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::models::PrivacyTier;

/// Cumulative counters, emitted at startup (batch 0) and after every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformProgress {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub by_tier: TierCounts,
    pub body_full: usize,
    pub body_chunked: usize,
    pub batch_num: usize,
    pub total_batches: usize,
}

/// Outcome counts keyed by privacy tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierCounts {
    pub sensitive: usize,
    pub personal: usize,
    pub public: usize,
}

impl TierCounts {
    pub fn add(&mut self, tier: PrivacyTier) {
        match tier {
            PrivacyTier::Sensitive => self.sensitive += 1,
            PrivacyTier::Personal => self.personal += 1,
            PrivacyTier::Public => self.public += 1,
        }
    }

    pub fn merge(&mut self, other: TierCounts) {
        self.sensitive += other.sensitive;
        self.personal += other.personal;
        self.public += other.public;
    }
}

/// Callback signature the pipeline emits to.
pub type ProgressFn = dyn Fn(&TransformProgress) + Send + Sync;

/// Plain-text consumer: one log line per event.
pub fn log_progress(progress: &TransformProgress) {
    info!(
        "batch {}/{}: {} processed, {} failed (SENSITIVE={} PERSONAL={} PUBLIC={} | full={} chunked={})",
        progress.batch_num,
        progress.total_batches,
        progress.processed,
        progress.failed,
        progress.by_tier.sensitive,
        progress.by_tier.personal,
        progress.by_tier.public,
        progress.body_full,
        progress.body_chunked,
    );
}

/// Terminal consumer rendering a bar over the selected email count.
#[derive(Clone)]
pub struct ProgressBarReporter {
    bar: ProgressBar,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} transforming [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .expect("valid template")
                .progress_chars("#>-"),
        );
        Self { bar }
    }

    pub fn update(&self, progress: &TransformProgress) {
        if self.bar.length().unwrap_or(0) != progress.total as u64 {
            self.bar.set_length(progress.total as u64);
        }
        self.bar
            .set_position((progress.processed + progress.failed) as u64);
        self.bar.set_message(format!(
            "ok={} failed={} S/P/P={}:{}:{}",
            progress.processed,
            progress.failed,
            progress.by_tier.sensitive,
            progress.by_tier.personal,
            progress.by_tier.public,
        ));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_counts_accumulate() {
        let mut counts = TierCounts::default();
        counts.add(PrivacyTier::Public);
        counts.add(PrivacyTier::Public);
        counts.add(PrivacyTier::Sensitive);

        let mut other = TierCounts::default();
        other.add(PrivacyTier::Personal);
        counts.merge(other);

        assert_eq!(counts.sensitive, 1);
        assert_eq!(counts.personal, 1);
        assert_eq!(counts.public, 2);
    }
}
