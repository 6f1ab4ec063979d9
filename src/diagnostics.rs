use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Counters for one materialized stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub output_dir: PathBuf,
    pub saved: u64,
    /// Payloads that did not decode to a raster, or failed to write.
    pub skipped_decode: u64,
    /// Records whose message bytes did not parse.
    pub malformed: u64,
    /// Records dropped after the per-stream frame cap was reached.
    pub ignored_over_cap: u64,
}

impl StreamStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_decode + self.malformed
    }
}

/// Outcome of one extraction pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub streams: BTreeMap<String, StreamStats>,
    /// Container-level read errors not attributable to a known stream.
    pub container_errors: u64,
}

impl ExtractionReport {
    pub fn total_saved(&self) -> u64 {
        self.streams.values().map(|s| s.saved).sum()
    }

    pub fn log_summary(&self) {
        for (topic, stats) in &self.streams {
            tracing::info!(
                topic = %topic,
                saved = stats.saved,
                skipped = stats.skipped(),
                malformed = stats.malformed,
                ignored = stats.ignored_over_cap,
                "{} -> {}",
                topic,
                stats.output_dir.display()
            );
        }
        if self.container_errors > 0 {
            tracing::warn!(errors = self.container_errors, "container read errors during extraction");
        }
    }

    pub async fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::utils::write_atomic(path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_counts_both_failure_kinds() {
        let stats = StreamStats { skipped_decode: 2, malformed: 3, ..StreamStats::default() };
        assert_eq!(stats.skipped(), 5);
    }

    #[test]
    fn totals_across_streams() {
        let mut report = ExtractionReport::default();
        report.streams.insert("/a".into(), StreamStats { saved: 4, ..StreamStats::default() });
        report.streams.insert("/b".into(), StreamStats { saved: 6, ..StreamStats::default() });
        assert_eq!(report.total_saved(), 10);
    }
}
