//! This crate provides Hyperstack, an HTTP service for analysing five dimensional
//! (X, Y, Z, Time, Channel) TIFF images that may be larger than memory.
//!
//! Images are never loaded whole. A volume is opened per request and read as a sequence of
//! chunks of whole TIFF pages, each chunk reduced independently and the partial results
//! combined. This supports:
//!
//! * Metadata: shape, data type and value range.
//! * Slice extraction along the Z, Time and Channel axes.
//! * Per-channel statistics (mean, population standard deviation, minimum and maximum).
//! * Incremental principal component analysis across channels.
//! * K-means segmentation of a single channel.
//!
//! Derived images are written back as 8-bit TIFF files.
//!
//! Hyperstack is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON request and response data.
//! * [tiff] decodes and encodes TIFF pages.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used in numerical
//!   computation, and [nalgebra] the eigendecomposition behind PCA.
//! * [Rayon](rayon) reduces chunks in parallel.
//! * [sled] stores image metadata and analysis records.

pub mod app;
pub mod app_state;
pub mod chunks;
pub mod cli;
pub mod error;
pub mod kmeans;
pub mod metrics;
pub mod models;
pub mod narrow;
pub mod operation;
pub mod operations;
pub mod pca;
pub mod server;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tiff_file;
pub mod tracing;
pub mod validated;
pub mod volume;
