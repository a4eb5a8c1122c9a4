//! Session metadata attached to calibration and measurement records.
//!
//! Every record handed to a recorder carries the operator's user id and the
//! sample label. `Metadata` holds those plus free-form notes that the CSV
//! recorder writes as a commented JSON preamble, so a data file stays
//! self-describing.
//!
//! Use [`MetadataBuilder`] to assemble it:
//!
//! ```
//! use photometer_daq::metadata::MetadataBuilder;
//!
//! let metadata = MetadataBuilder::new()
//!     .user_id("user_20261016_0930")
//!     .sample("milk-3.5")
//!     .parameter("temperature_c", serde_json::json!(21.5))
//!     .build();
//! assert!(metadata.validate().is_ok());
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sample label the operator has not chosen yet.
pub const SAMPLE_NOT_SET: &str = "Not set...";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Operator identifier written in the `ID` column.
    pub user_id: String,
    /// Sample label written in the `SAMPLE` column.
    pub sample: String,
    pub annotations: String,
    /// User-defined parameters (temperature, batch, ...).
    pub parameters: HashMap<String, serde_json::Value>,
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            sample: SAMPLE_NOT_SET.to_string(),
            annotations: String::new(),
            parameters: HashMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.inner.user_id = user_id.to_string();
        self
    }

    pub fn sample(mut self, sample: &str) -> Self {
        self.inner.sample = sample.to_string();
        self
    }

    pub fn annotations(mut self, annotations: &str) -> Self {
        self.inner.annotations = annotations.to_string();
        self
    }

    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// A user id is required for every record.
    pub fn validate(&self) -> AppResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(DaqError::Aborted(
                "define a user before calibrating or measuring".to_string(),
            ));
        }
        Ok(())
    }

    /// Measurements additionally need a chosen sample.
    pub fn validate_for_measurement(&self) -> AppResult<()> {
        self.validate()?;
        if self.sample.trim().is_empty() || self.sample == SAMPLE_NOT_SET {
            return Err(DaqError::Aborted(
                "define a sample before measuring".to_string(),
            ));
        }
        Ok(())
    }
}
