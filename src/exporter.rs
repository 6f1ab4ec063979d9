use crate::correspondence::RateModel;
use crate::diagnostics::ExtractionReport;
use crate::error::Result;
use crate::table::{CorrespondenceFailure, TableReport};
use crate::utils::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata written next to an exported correspondence table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub export_id: String,
    pub timestamp_utc: u128,
    pub table_path: PathBuf,
    pub timed_topic: String,
    pub source_dir: PathBuf,
    pub model: RateModel,
    pub num_records: u64,
    pub failures: Vec<CorrespondenceFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionReport>,
}

/// Where the table came from, for the manifest.
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub timed_topic: String,
    pub source_dir: PathBuf,
    pub model: RateModel,
    pub container_sha256: Option<String>,
    pub extraction: Option<ExtractionReport>,
}

/// Path of the manifest belonging to `table_path`: `<stem>.manifest.json`.
pub fn manifest_path(table_path: &Path) -> PathBuf {
    let stem = table_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "correspondence".to_string());
    table_path.with_file_name(format!("{}.manifest.json", stem))
}

/// Write the correspondence CSV and its manifest.
pub async fn export_table(report: &TableReport, table_path: &Path, ctx: ExportContext) -> Result<ExportManifest> {
    tracing::info!("exporting correspondence table to {}", table_path.display());

    if let Some(parent) = table_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomic(table_path, &report.table.to_csv()?).await?;

    let timestamp_utc = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let manifest = ExportManifest {
        export_id: format!("correspondence-{}", timestamp_utc),
        timestamp_utc,
        table_path: table_path.to_path_buf(),
        timed_topic: ctx.timed_topic,
        source_dir: ctx.source_dir,
        model: ctx.model,
        num_records: report.table.len() as u64,
        failures: report.failures.clone(),
        container_sha256: ctx.container_sha256,
        extraction: ctx.extraction,
    };

    let manifest_path = manifest_path(table_path);
    let manifest_json = serde_json::to_vec_pretty(&manifest)?;
    write_atomic(&manifest_path, &manifest_json).await?;

    tracing::info!("manifest written: {}", manifest_path.display());
    Ok(manifest)
}
