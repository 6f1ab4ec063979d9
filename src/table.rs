use crate::correspondence::{CorrespondenceMapper, CorrespondenceRecord};
use crate::error::{PipelineError, Result};
use crate::utils::{list_files_with_ext, parse_frame_index, write_atomic, FrameName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Correspondence rows in ascending source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrespondenceTable {
    rows: Vec<CorrespondenceRecord>,
}

impl CorrespondenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row. Source indices must increase and target indices may
    /// repeat but never go backwards.
    pub fn push(&mut self, record: CorrespondenceRecord) -> Result<()> {
        if let Some(last) = self.rows.last() {
            if record.source_index <= last.source_index {
                return Err(PipelineError::Table(format!(
                    "source index {} after {}",
                    record.source_index, last.source_index
                )));
            }
            if record.target_index < last.target_index {
                return Err(PipelineError::Table(format!(
                    "target index {} for source {} precedes {}",
                    record.target_index, record.source_index, last.target_index
                )));
            }
        }
        self.rows.push(record);
        Ok(())
    }

    pub fn rows(&self) -> &[CorrespondenceRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// CSV with columns `source_index,target_index,timestamp_sec,timestamp_nsec`.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        if self.rows.is_empty() {
            wtr.write_record(["source_index", "target_index", "timestamp_sec", "timestamp_nsec"])?;
        }
        wtr.into_inner().map_err(|e| e.into_error().into())
    }
}

/// A source index that could not be placed in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrespondenceFailure {
    MissingSourceFrame { source_index: u32 },
    OutOfRange { source_index: u32, target_index: u64, available: usize },
    Emit { source_index: u32, reason: String },
}

impl CorrespondenceFailure {
    /// Classify why `source_index` produced no row.
    pub fn from_error(source_index: u32, err: PipelineError) -> Self {
        match err {
            PipelineError::MissingSourceFrame(source_index) => CorrespondenceFailure::MissingSourceFrame { source_index },
            PipelineError::CorrespondenceOutOfRange { source_index, target_index, available } => {
                CorrespondenceFailure::OutOfRange { source_index, target_index, available }
            }
            other => CorrespondenceFailure::Emit { source_index, reason: other.to_string() },
        }
    }
}

#[derive(Debug, Default)]
pub struct TableReport {
    pub table: CorrespondenceTable,
    pub failures: Vec<CorrespondenceFailure>,
}

impl TableReport {
    pub fn out_of_range_count(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f, CorrespondenceFailure::OutOfRange { .. }))
            .count()
    }
}

/// Untimed frames on disk, keyed by the index parsed from their names.
pub fn scan_source_frames(dir: &Path, ext: &str) -> Result<BTreeMap<u32, PathBuf>> {
    let mut frames = BTreeMap::new();
    for path in list_files_with_ext(dir, ext)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        match parse_frame_index(name) {
            Some(index) => {
                if let Some(previous) = frames.insert(index, path.clone()) {
                    tracing::warn!(index, kept = %path.display(), dropped = %previous.display(), "duplicate source frame index");
                }
            }
            None => tracing::debug!(file = name, "no frame index in name, ignoring"),
        }
    }
    Ok(frames)
}

/// Builds the correspondence table and re-emits each untimed frame under a
/// timestamped name.
pub struct TableBuilder<'a> {
    mapper: CorrespondenceMapper<'a>,
    output_dir: PathBuf,
    prefix: String,
}

impl<'a> TableBuilder<'a> {
    pub fn new(mapper: CorrespondenceMapper<'a>, output_dir: impl Into<PathBuf>, prefix: &str) -> Self {
        TableBuilder { mapper, output_dir: output_dir.into(), prefix: prefix.to_string() }
    }

    /// Walk source indices `0..expected` (or up to the largest index found)
    /// in order. Per-index failures are collected, not fatal.
    pub async fn build(&self, sources: &BTreeMap<u32, PathBuf>, expected: Option<u32>) -> Result<TableReport> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let end = match expected {
            Some(n) => n,
            None => sources.keys().next_back().map(|i| i + 1).unwrap_or(0),
        };
        for extra in sources.range(end..).map(|(i, _)| *i) {
            tracing::warn!(index = extra, expected = end, "source frame beyond expected range, ignoring");
        }

        let mut report = TableReport::default();
        for source_index in 0..end {
            match self.process(source_index, sources.get(&source_index)).await {
                Ok(record) => report.table.push(record)?,
                Err(e) => {
                    tracing::warn!(error = %e, "no correspondence for source frame {}", source_index);
                    report.failures.push(CorrespondenceFailure::from_error(source_index, e));
                }
            }
        }

        tracing::info!(
            rows = report.table.len(),
            failures = report.failures.len(),
            "built correspondence table"
        );
        Ok(report)
    }

    async fn process(&self, source_index: u32, source: Option<&PathBuf>) -> Result<CorrespondenceRecord> {
        let source = source.ok_or(PipelineError::MissingSourceFrame(source_index))?;
        let record = self.mapper.resolve(source_index)?;
        self.emit(source, &record).await?;
        Ok(record)
    }

    async fn emit(&self, source: &Path, record: &CorrespondenceRecord) -> Result<PathBuf> {
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("png");
        let name = FrameName::new(&self.prefix, record.source_index, record.target_sec, record.target_nsec, ext);
        let dest = self.output_dir.join(name.file_name());
        let data = tokio::fs::read(source).await?;
        write_atomic(&dest, &data).await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::RateModel;
    use crate::timestamps::TimestampIndex;
    use tempfile::TempDir;

    fn rec(source_index: u32, target_index: u32) -> CorrespondenceRecord {
        CorrespondenceRecord { source_index, target_index, target_sec: 1, target_nsec: 2 }
    }

    fn oracle(frames: u32) -> TimestampIndex {
        let mut index = TimestampIndex::new();
        for i in 0..frames {
            index.push(i, 1000 + i / 30, (i % 30) * 33_000_000).unwrap();
        }
        index
    }

    fn small_model() -> RateModel {
        RateModel { threshold: 2, offset: 3, timed_rate_hz: 30.0, untimed_rate_hz: 30.0 }
    }

    #[test]
    fn table_rejects_inversions_but_allows_ties() {
        let mut table = CorrespondenceTable::new();
        table.push(rec(0, 5)).unwrap();
        table.push(rec(1, 5)).unwrap();
        assert!(table.push(rec(2, 4)).is_err());
        assert!(table.push(rec(1, 6)).is_err());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn csv_has_expected_columns() {
        let mut table = CorrespondenceTable::new();
        table.push(rec(0, 105)).unwrap();
        let text = String::from_utf8(table.to_csv().unwrap()).unwrap();
        assert_eq!(text, "source_index,target_index,timestamp_sec,timestamp_nsec\n0,105,1,2\n");

        let empty = String::from_utf8(CorrespondenceTable::new().to_csv().unwrap()).unwrap();
        assert_eq!(empty, "source_index,target_index,timestamp_sec,timestamp_nsec\n");
    }

    #[test]
    fn scans_loosely_named_sources() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        for name in ["rgb_00002.png", "rgb_00000.png", "rgb_00001.png", "cover.png", "rgb_00003.jpg"] {
            std::fs::write(tmpdir.path().join(name), b"x")?;
        }
        let frames = scan_source_frames(tmpdir.path(), "png")?;
        assert_eq!(frames.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn failures_are_classified_from_errors() {
        assert_eq!(
            CorrespondenceFailure::from_error(7, PipelineError::MissingSourceFrame(7)),
            CorrespondenceFailure::MissingSourceFrame { source_index: 7 }
        );
        assert_eq!(
            CorrespondenceFailure::from_error(
                7,
                PipelineError::CorrespondenceOutOfRange { source_index: 7, target_index: 40, available: 12 }
            ),
            CorrespondenceFailure::OutOfRange { source_index: 7, target_index: 40, available: 12 }
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        match CorrespondenceFailure::from_error(7, io.into()) {
            CorrespondenceFailure::Emit { source_index, reason } => {
                assert_eq!(source_index, 7);
                assert!(reason.contains("read-only"));
            }
            other => panic!("unexpected failure {:?}", other),
        }
    }

    #[tokio::test]
    async fn builds_table_and_reemits_frames() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let src_dir = tmpdir.path().join("rgb");
        std::fs::create_dir_all(&src_dir)?;
        for i in [0u32, 1, 3, 4] {
            std::fs::write(src_dir.join(format!("rgb_{:05}.png", i)), format!("frame {}", i))?;
        }
        let sources = scan_source_frames(&src_dir, "png")?;

        let index = oracle(20);
        let mapper = CorrespondenceMapper::new(small_model(), &index)?;
        let out_dir = tmpdir.path().join("timestamped");
        let builder = TableBuilder::new(mapper, &out_dir, "rgb");
        let report = builder.build(&sources, None).await?;

        assert_eq!(
            report.failures,
            vec![CorrespondenceFailure::MissingSourceFrame { source_index: 2 }]
        );
        let targets: Vec<_> = report.table.rows().iter().map(|r| (r.source_index, r.target_index)).collect();
        assert_eq!(targets, vec![(0, 3), (1, 4), (3, 6), (4, 7)]);

        let ts = index.get(6).unwrap();
        let emitted = out_dir.join(FrameName::new("rgb", 3, ts.sec, ts.nsec, "png").file_name());
        assert_eq!(std::fs::read_to_string(emitted)?, "frame 3");
        assert_eq!(std::fs::read_dir(&out_dir)?.count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_rows_are_reported() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let src_dir = tmpdir.path().join("rgb");
        std::fs::create_dir_all(&src_dir)?;
        for i in 0..4u32 {
            std::fs::write(src_dir.join(format!("rgb_{:05}.png", i)), b"x")?;
        }
        let sources = scan_source_frames(&src_dir, "png")?;

        let index = oracle(5);
        let mapper = CorrespondenceMapper::new(small_model(), &index)?;
        let builder = TableBuilder::new(mapper, tmpdir.path().join("out"), "rgb");
        let report = builder.build(&sources, Some(4)).await?;

        assert_eq!(report.table.len(), 2);
        assert_eq!(report.out_of_range_count(), 2);
        assert_eq!(
            report.failures[0],
            CorrespondenceFailure::OutOfRange { source_index: 2, target_index: 5, available: 5 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn expected_count_flags_missing_tail() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let src_dir = tmpdir.path().join("rgb");
        std::fs::create_dir_all(&src_dir)?;
        std::fs::write(src_dir.join("rgb_00000.png"), b"x")?;
        let sources = scan_source_frames(&src_dir, "png")?;

        let index = oracle(20);
        let mapper = CorrespondenceMapper::new(small_model(), &index)?;
        let builder = TableBuilder::new(mapper, tmpdir.path().join("out"), "rgb");
        let report = builder.build(&sources, Some(3)).await?;
        assert_eq!(report.table.len(), 1);
        assert_eq!(report.failures.len(), 2);
        Ok(())
    }
}
