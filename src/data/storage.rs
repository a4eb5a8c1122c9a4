//! Record sinks with clean feature flag handling.
//!
//! A recorder receives the raw record of every calibration and measurement
//! cycle and the absorbance record derived from it. The core never picks
//! file names or formats on its own; callers choose a recorder.
use crate::{
    channel::{CHANNEL_COUNT, WAVELENGTHS},
    error::AppResult,
    measurement::{AbsorbanceRecord, MeasurementRecord},
    metadata::Metadata,
};
use async_trait::async_trait;

/// Destination for raw and derived records.
#[async_trait]
pub trait Recorder: Send {
    /// Called once before the first record of a session.
    async fn set_metadata(&mut self, metadata: &Metadata) -> AppResult<()>;

    /// `[user, sample, type, 48 raw values]`
    async fn record_raw(&mut self, record: &MeasurementRecord) -> AppResult<()>;

    /// `[user, sample, type, 16 absorbance values]`
    async fn record_absorbance(&mut self, record: &AbsorbanceRecord) -> AppResult<()>;

    async fn shutdown(&mut self) -> AppResult<()>;
}

/// Header of the raw file: three columns per channel.
pub fn raw_header() -> Vec<String> {
    let mut header = base_header();
    for wavelength in WAVELENGTHS {
        header.push(format!("{wavelength}_nm_M"));
        header.push(format!("{wavelength}_nm_A"));
        header.push(format!("{wavelength}_nm_B"));
    }
    header
}

/// Header of the absorbance file: one column per channel.
pub fn absorbance_header() -> Vec<String> {
    let mut header = base_header();
    header.extend(WAVELENGTHS.iter().map(|w| format!("{w}_nm_M")));
    header
}

fn base_header() -> Vec<String> {
    ["timestamp", "ID", "SAMPLE", "TYPE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn raw_row(timestamp: &str, record: &MeasurementRecord) -> Vec<String> {
    let mut row = vec![
        timestamp.to_string(),
        record.user_id.clone(),
        record.sample.clone(),
        record.label.clone(),
    ];
    row.extend(record.raw_values().iter().map(u16::to_string));
    row
}

fn absorbance_row(timestamp: &str, record: &AbsorbanceRecord) -> Vec<String> {
    let mut row = vec![
        timestamp.to_string(),
        record.user_id.clone(),
        record.sample.clone(),
        record.label.clone(),
    ];
    row.extend(
        record
            .values
            .iter()
            .take(CHANNEL_COUNT)
            .map(|v| v.as_ref().map_or(String::new(), |v| v.to_string())),
    );
    row
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============================================================================
// In-memory recorder
// ============================================================================

/// Keeps every record in memory; handy for front ends that plot directly.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    pub metadata: Option<Metadata>,
    pub raw: Vec<MeasurementRecord>,
    pub absorbance: Vec<AbsorbanceRecord>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn set_metadata(&mut self, metadata: &Metadata) -> AppResult<()> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    async fn record_raw(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        self.raw.push(record.clone());
        Ok(())
    }

    async fn record_absorbance(&mut self, record: &AbsorbanceRecord) -> AppResult<()> {
        self.absorbance.push(record.clone());
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

// ============================================================================
// CSV recorder
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::error::DaqError;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// Suffix of the absorbance file next to the raw data file.
    pub const ABSORBANCE_SUFFIX: &str = "_log.csv";

    /// Writes raw records to `<name>.csv` and absorbance records to
    /// `<name>_log.csv`, each with its header row.
    pub struct CsvRecorder {
        raw_path: PathBuf,
        absorbance_path: PathBuf,
        raw: Option<csv::Writer<File>>,
        absorbance: Option<csv::Writer<File>>,
    }

    impl CsvRecorder {
        pub fn new(path: impl AsRef<Path>) -> Self {
            let raw_path = path.as_ref().to_path_buf();
            let stem = raw_path.with_extension("");
            let absorbance_path = PathBuf::from(format!("{}{ABSORBANCE_SUFFIX}", stem.display()));
            Self {
                raw_path,
                absorbance_path,
                raw: None,
                absorbance: None,
            }
        }

        pub fn raw_path(&self) -> &Path {
            &self.raw_path
        }

        pub fn absorbance_path(&self) -> &Path {
            &self.absorbance_path
        }

        fn open(path: &Path, metadata: &Metadata, header: &[String]) -> AppResult<csv::Writer<File>> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            let json = serde_json::to_string_pretty(metadata)
                .map_err(|e| DaqError::Configuration(format!("metadata is not serializable: {e}")))?;
            for line in json.lines() {
                writeln!(file, "# {line}")?;
            }
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(header)?;
            writer.flush()?;
            Ok(writer)
        }

        fn writer<'a>(
            writer: &'a mut Option<csv::Writer<File>>,
            path: &Path,
        ) -> AppResult<&'a mut csv::Writer<File>> {
            writer.as_mut().ok_or_else(|| {
                DaqError::Configuration(format!(
                    "CSV recorder for {} has no metadata yet",
                    path.display()
                ))
            })
        }
    }

    #[async_trait]
    impl Recorder for CsvRecorder {
        async fn set_metadata(&mut self, metadata: &Metadata) -> AppResult<()> {
            self.raw = Some(Self::open(&self.raw_path, metadata, &raw_header())?);
            self.absorbance = Some(Self::open(&self.absorbance_path, metadata, &absorbance_header())?);
            tracing::info!("CSV recorder writing to '{}'", self.raw_path.display());
            Ok(())
        }

        async fn record_raw(&mut self, record: &MeasurementRecord) -> AppResult<()> {
            let writer = Self::writer(&mut self.raw, &self.raw_path)?;
            writer.write_record(raw_row(&timestamp(), record))?;
            writer.flush()?;
            Ok(())
        }

        async fn record_absorbance(&mut self, record: &AbsorbanceRecord) -> AppResult<()> {
            let writer = Self::writer(&mut self.absorbance, &self.absorbance_path)?;
            writer.write_record(absorbance_row(&timestamp(), record))?;
            writer.flush()?;
            Ok(())
        }

        async fn shutdown(&mut self) -> AppResult<()> {
            for mut writer in [self.raw.take(), self.absorbance.take()].into_iter().flatten() {
                writer.flush()?;
            }
            tracing::info!("CSV recorder shut down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::DaqError;
    use std::path::Path;

    pub struct CsvRecorder;

    impl CsvRecorder {
        pub fn new(_path: impl AsRef<Path>) -> Self {
            Self
        }
    }

    #[async_trait]
    impl Recorder for CsvRecorder {
        async fn set_metadata(&mut self, _metadata: &Metadata) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn record_raw(&mut self, _record: &MeasurementRecord) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn record_absorbance(&mut self, _record: &AbsorbanceRecord) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn shutdown(&mut self) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{CsvRecorder, ABSORBANCE_SUFFIX};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvRecorder;
