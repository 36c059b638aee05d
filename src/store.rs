//! Persistent records of uploaded images and their analyses.

use crate::error::ProcessingError;
use crate::models::{ImageAnalysisRecord, ImageMetadataRecord};

use std::path::Path;

const METADATA_TREE: &str = "image_metadata";
const ANALYSIS_TREE: &str = "image_analysis";

/// Embedded key-value store holding image metadata and analysis records.
///
/// Metadata records are keyed by file path, so there is at most one per image. Analysis
/// records are keyed by a generated id and kept in insertion order. Values are JSON.
#[derive(Clone)]
pub struct MetadataStore {
    db: sled::Db,
    metadata: sled::Tree,
    analysis: sled::Tree,
}

impl MetadataStore {
    /// Open or create a store at a path.
    pub fn open(path: &Path) -> Result<Self, ProcessingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_db(sled::open(path)?)
    }

    /// Create a store that is deleted when dropped.
    pub fn temporary() -> Result<Self, ProcessingError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, ProcessingError> {
        let metadata = db.open_tree(METADATA_TREE)?;
        let analysis = db.open_tree(ANALYSIS_TREE)?;
        Ok(Self {
            db,
            metadata,
            analysis,
        })
    }

    /// Insert or replace the metadata record of an image.
    ///
    /// Returns whether an existing record was replaced.
    pub fn upsert_metadata(&self, record: &ImageMetadataRecord) -> Result<bool, ProcessingError> {
        let value = serde_json::to_vec(record)?;
        let previous = self.metadata.insert(record.file_path.as_bytes(), value)?;
        tracing::debug!(file_path = %record.file_path, replaced = previous.is_some(), "stored metadata");
        Ok(previous.is_some())
    }

    /// Returns the metadata record of an image, if there is one.
    pub fn metadata(&self, file_path: &str) -> Result<Option<ImageMetadataRecord>, ProcessingError> {
        self.metadata
            .get(file_path.as_bytes())?
            .map(|value| serde_json::from_slice(&value))
            .transpose()
            .map_err(ProcessingError::from)
    }

    /// Append an analysis record, returning its id.
    pub fn record_analysis(&self, record: &ImageAnalysisRecord) -> Result<u64, ProcessingError> {
        let id = self.db.generate_id()?;
        self.analysis
            .insert(id.to_be_bytes(), serde_json::to_vec(record)?)?;
        tracing::debug!(file_path = %record.file_path, id, "stored analysis");
        Ok(id)
    }

    /// Returns the analysis records of an image in insertion order.
    pub fn analyses(&self, file_path: &str) -> Result<Vec<ImageAnalysisRecord>, ProcessingError> {
        let mut records = vec![];
        for entry in self.analysis.iter() {
            let (_, value) = entry?;
            let record: ImageAnalysisRecord = serde_json::from_slice(&value)?;
            if record.file_path == file_path {
                records.push(record);
            }
        }
        Ok(records)
    }
}
