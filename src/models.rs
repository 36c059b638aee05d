//! Data types and associated functions and methods

use crate::error::ProcessingError;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use strum_macros::Display;
use validator::Validate;

/// Supported numerical data types
///
/// The string form matches the NumPy dtype name, e.g. `uint8`.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [u8]
    Uint8,
    /// [u16]
    Uint16,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [i8]
    Int8,
    /// [i16]
    Int16,
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the data type for a TIFF `SampleFormat` and `BitsPerSample` pair.
    ///
    /// # Arguments
    ///
    /// * `format`: SampleFormat tag value (1 = unsigned, 2 = signed, 3 = floating point)
    /// * `bits`: BitsPerSample tag value
    pub fn from_sample_format(format: u16, bits: u8) -> Result<Self, ProcessingError> {
        match (format, bits) {
            (1, 8) => Ok(Self::Uint8),
            (1, 16) => Ok(Self::Uint16),
            (1, 32) => Ok(Self::Uint32),
            (1, 64) => Ok(Self::Uint64),
            (2, 8) => Ok(Self::Int8),
            (2, 16) => Ok(Self::Int16),
            (2, 32) => Ok(Self::Int32),
            (2, 64) => Ok(Self::Int64),
            (3, 32) => Ok(Self::Float32),
            (3, 64) => Ok(Self::Float64),
            _ => Err(ProcessingError::UnsupportedSampleType { format, bits }),
        }
    }
}

/// Axes of an image volume, in storage order.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Axis {
    X,
    Y,
    Z,
    Time,
    Channel,
}

impl Axis {
    /// Position of the axis in the (X, Y, Z, Time, Channel) shape.
    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::Time => 3,
            Self::Channel => 4,
        }
    }
}

/// Optional per-axis indices selecting a sub-array of a volume.
///
/// Axes left as `None` keep their full extent. Negative indices count back from the end of
/// the axis, as in NumPy.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SliceSelector {
    pub z: Option<isize>,
    pub time: Option<isize>,
    pub channel: Option<isize>,
}

/// Query parameters naming an image file
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct FileQuery {
    /// Path to the image file
    #[validate(length(min = 1, message = "file_path must not be empty"))]
    pub file_path: String,
}

/// Query parameters for slice extraction
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct SliceQuery {
    /// Path to the image file
    #[validate(length(min = 1, message = "file_path must not be empty"))]
    pub file_path: String,
    /// Z index of the slice
    pub z: Option<isize>,
    /// Time index of the slice
    pub time: Option<isize>,
    /// Channel index of the slice
    pub channel: Option<isize>,
}

impl SliceQuery {
    /// Returns the selector described by the query.
    pub fn selector(&self) -> SliceSelector {
        SliceSelector {
            z: self.z,
            time: self.time,
            channel: self.channel,
        }
    }
}

fn default_components() -> usize {
    3
}

/// Request body for PCA analysis
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeRequest {
    /// Path to the image file
    #[validate(length(min = 1, message = "file_path must not be empty"))]
    pub file_path: String,
    /// Number of principal components to retain
    #[serde(default = "default_components")]
    pub components: usize,
}

fn default_clusters() -> usize {
    3
}

/// Query parameters for k-means segmentation
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct SegmentQuery {
    /// Path to the image file
    #[validate(length(min = 1, message = "file_path must not be empty"))]
    pub file_path: String,
    /// Channel to segment
    #[serde(default)]
    pub channel: usize,
    /// Number of clusters
    #[serde(default = "default_clusters")]
    pub k: usize,
}

/// Summary of a volume: its shape, data type and value range
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Metadata {
    /// (X, Y, Z, Time, Channel) extents
    pub shape: [usize; 5],
    /// Element data type
    pub dtype: DType,
    /// Smallest non-NaN value
    pub min: f64,
    /// Largest non-NaN value
    pub max: f64,
}

/// Summary statistics of one channel
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics for every channel of a volume, indexed by channel.
///
/// Serialises as a map keyed `"Channel <c>"` in ascending channel order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeStatistics(pub Vec<ChannelStatistics>);

impl Serialize for VolumeStatistics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (channel, statistics) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("Channel {}", channel), statistics)?;
        }
        map.end()
    }
}

/// Persisted description of an uploaded image.
///
/// The file path is the unique key.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ImageMetadataRecord {
    pub file_path: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub time_frames: usize,
    pub channels: usize,
    pub dtype: DType,
}

impl ImageMetadataRecord {
    /// Return a record for an image of the given (X, Y, Z, Time, Channel) shape.
    pub fn new(file_path: String, shape: [usize; 5], dtype: DType) -> Self {
        let [height, width, depth, time_frames, channels] = shape;
        Self {
            file_path,
            width,
            height,
            depth,
            time_frames,
            channels,
            dtype,
        }
    }
}

/// Persisted result of an analysis of an image.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ImageAnalysisRecord {
    pub file_path: String,
    pub pca_components: Option<usize>,
    pub statistics: Option<serde_json::Value>,
}

/// Response to a successful upload
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub file_path: String,
}

/// Response to a metadata request
#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub metadata: Metadata,
}

/// Response to a PCA analysis request
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub message: String,
    pub file_path: String,
    /// Fraction of the total variance explained by each retained component
    pub explained_variance_ratio: Vec<f64>,
}

/// Response to a statistics request
#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub statistics: VolumeStatistics,
}

/// Response to a segmentation request
#[derive(Debug, Serialize)]
pub struct SegmentResponse {
    pub file_path: String,
}

/// A TIFF file sent to the client as an attachment
#[derive(Debug)]
pub struct TiffDownload {
    /// Encoded TIFF file
    pub body: Vec<u8>,
    /// File name offered to the client
    pub filename: String,
    /// Shape of the stored array
    pub shape: Vec<usize>,
    /// Data type of the stored array
    pub dtype: DType,
}
