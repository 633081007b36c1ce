//! Dataset writers with clean feature flag handling.
//!
//! Every run gets its own folder, `datadir/YYYYMMDD/HHMMSS_label/` (with a
//! `_1`, `_2`, ... suffix when that name is taken), holding
//! one data file named after the label.
use crate::{
    data::dataset::Dataset,
    error::{AppResult, McError},
    metadata::Metadata,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// One storage backend. `save_dataset` calls the methods in order.
#[async_trait]
pub trait DataWriter: Send {
    /// Create the measurement folder and return it.
    async fn init(&mut self, datadir: &Path, label: &str) -> Result<PathBuf>;
    /// Record run metadata ahead of the data.
    async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()>;
    /// Write every row of the dataset.
    async fn write(&mut self, dataset: &Dataset) -> Result<()>;
    /// Flush and release the file.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Replace anything that is awkward in a file name with `_`.
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "measurement".to_string()
    } else {
        cleaned
    }
}

/// `datadir/YYYYMMDD/HHMMSS_label`
#[must_use]
pub fn measurement_folder(datadir: &Path, label: &str, at: DateTime<Local>) -> PathBuf {
    datadir
        .join(at.format("%Y%m%d").to_string())
        .join(format!("{}_{}", at.format("%H%M%S"), sanitize_label(label)))
}

/// Create a fresh folder for this run. Two runs with the same label in the
/// same second get `_1`, `_2`, ... appended instead of sharing a folder.
fn create_measurement_folder(datadir: &Path, label: &str) -> Result<PathBuf> {
    let base = measurement_folder(datadir, label, Local::now());
    if let Some(day) = base.parent() {
        std::fs::create_dir_all(day)
            .with_context(|| format!("Failed to create data directory at {:?}", day))?;
    }
    let mut folder = base.clone();
    let mut suffix = 0usize;
    loop {
        match std::fs::create_dir(&folder) {
            Ok(()) => return Ok(folder),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                suffix += 1;
                let mut name = base.as_os_str().to_os_string();
                name.push(format!("_{}", suffix));
                folder = PathBuf::from(name);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create measurement folder at {:?}", folder)
                })
            }
        }
    }
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    /// CSV file with the metadata as `# ` comment lines above the header.
    pub struct CsvWriter {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
    }

    impl Default for CsvWriter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CsvWriter {
        /// Writer with no file yet; `init` picks the path.
        #[must_use]
        pub fn new() -> Self {
            Self {
                path: PathBuf::new(),
                writer: None,
            }
        }

        /// Data file of the current run.
        #[must_use]
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl DataWriter for CsvWriter {
        async fn init(&mut self, datadir: &Path, label: &str) -> Result<PathBuf> {
            let folder = create_measurement_folder(datadir, label)?;
            self.path = folder.join(format!("{}.csv", sanitize_label(label)));
            tracing::info!(path = %self.path.display(), "CSV writer initialized");
            Ok(folder)
        }

        async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()> {
            let mut file = File::create(&self.path)
                .with_context(|| format!("Failed to create CSV file at {:?}", self.path))?;

            let json_string = serde_json::to_string_pretty(metadata)
                .context("Failed to serialize metadata to JSON")?;

            for line in json_string.lines() {
                file.write_all(b"# ")
                    .and_then(|_| file.write_all(line.as_bytes()))
                    .and_then(|_| file.write_all(b"\n"))
                    .context("Failed to write metadata to CSV file")?;
            }

            self.writer = Some(csv::Writer::from_writer(file));
            Ok(())
        }

        async fn write(&mut self, dataset: &Dataset) -> Result<()> {
            let writer = match self.writer.as_mut() {
                Some(writer) => writer,
                None => anyhow::bail!("CSV writer used before set_metadata"),
            };
            writer
                .write_record(dataset.column_labels())
                .context("Failed to write CSV header")?;
            for row in &dataset.rows {
                writer
                    .write_record(row.iter().map(|v| v.to_string()))
                    .context("Failed to write row to CSV file")?;
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            tracing::debug!("CSV writer shut down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder that reports the missing `storage_csv` feature.
    pub struct CsvWriter;

    impl CsvWriter {
        /// Stub writer.
        #[must_use]
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for CsvWriter {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DataWriter for CsvWriter {
        async fn init(&mut self, _datadir: &Path, _label: &str) -> Result<PathBuf> {
            Err(McError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn set_metadata(&mut self, _metadata: &Metadata) -> Result<()> {
            Err(McError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn write(&mut self, _dataset: &Dataset) -> Result<()> {
            Err(McError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Err(McError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

// ============================================================================
// JSON Writer
// ============================================================================

/// Single JSON document holding the dataset and its metadata.
#[derive(Default)]
pub struct JsonWriter {
    path: PathBuf,
    metadata: Option<Metadata>,
}

impl JsonWriter {
    /// Writer with no file yet; `init` picks the path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Data file of the current run.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataWriter for JsonWriter {
    async fn init(&mut self, datadir: &Path, label: &str) -> Result<PathBuf> {
        let folder = create_measurement_folder(datadir, label)?;
        self.path = folder.join(format!("{}.json", sanitize_label(label)));
        tracing::info!(path = %self.path.display(), "JSON writer initialized");
        Ok(folder)
    }

    async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    async fn write(&mut self, dataset: &Dataset) -> Result<()> {
        let mut value =
            serde_json::to_value(dataset).context("Failed to serialize dataset to JSON")?;
        if let (Some(metadata), Some(obj)) = (&self.metadata, value.as_object_mut()) {
            obj.insert(
                "metadata".to_string(),
                serde_json::to_value(metadata).context("Failed to serialize metadata")?,
            );
        }
        let text = serde_json::to_string_pretty(&value).context("Failed to format JSON")?;
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("Failed to write JSON file at {:?}", self.path))?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        tracing::debug!("JSON writer shut down");
        Ok(())
    }
}

/// Writer for a configured backend name; `None` disables saving.
pub fn writer_for(backend: &str) -> AppResult<Option<Box<dyn DataWriter>>> {
    match backend.to_lowercase().as_str() {
        "csv" => Ok(Some(Box::new(CsvWriter::new()))),
        "json" => Ok(Some(Box::new(JsonWriter::new()))),
        "none" => Ok(None),
        other => Err(McError::Configuration(format!(
            "Unknown storage backend '{}'",
            other
        ))),
    }
}

/// Run a writer through its whole lifecycle for one dataset.
pub async fn save_dataset(
    writer: &mut dyn DataWriter,
    datadir: &Path,
    dataset: &Dataset,
) -> Result<PathBuf> {
    let folder = writer.init(datadir, &dataset.name).await?;
    writer.set_metadata(&dataset.metadata).await?;
    writer.write(dataset).await?;
    writer.shutdown().await?;
    Ok(folder)
}
