//! Lazily loaded 5D image volumes.

use crate::chunks::{self, Chunk, ChunkIter, ChunkPolicy, RowLayout};
use crate::error::ProcessingError;
use crate::models::DType;
use crate::tiff_file::{self, PageReader};

use std::path::{Path, PathBuf};

/// A 5D (X, Y, Z, Time, Channel) volume stored in a TIFF file.
///
/// Opening a volume reads only its layout. Pixel data is read on demand, chunk by chunk,
/// through readers that own their file handle. A volume is never modified; operations derive
/// new data from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageVolume {
    path: PathBuf,
    shape: [usize; 5],
    dtype: DType,
    page_len: usize,
    policy: ChunkPolicy,
}

impl ImageVolume {
    /// Open a volume.
    ///
    /// Fails with [ProcessingError::Shape] if the stored array does not have exactly five
    /// dimensions.
    ///
    /// # Arguments
    ///
    /// * `path`: Path to the TIFF file
    /// * `policy`: How the volume is partitioned into chunks
    #[tracing::instrument(level = "DEBUG")]
    pub fn open(path: &Path, policy: ChunkPolicy) -> Result<Self, ProcessingError> {
        let header = tiff_file::read_header(path)?;
        let shape: [usize; 5] = header
            .shape
            .as_slice()
            .try_into()
            .map_err(|_| ProcessingError::Shape {
                shape: header.shape.clone(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            shape,
            dtype: header.dtype,
            page_len: header.page_len,
            policy,
        })
    }

    /// (X, Y, Z, Time, Channel) extents.
    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of channels (C).
    pub fn channels(&self) -> usize {
        self.shape[4]
    }

    /// Number of (x, y, z, t) positions, i.e. elements per channel.
    pub fn positions(&self) -> usize {
        self.shape[..4].iter().product()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row layout of the stored data.
    pub fn layout(&self) -> RowLayout {
        RowLayout {
            rows: self.positions(),
            channels: self.channels(),
            page_len: self.page_len,
        }
    }

    /// Returns an iterator over all chunks in traversal order.
    pub fn chunks(&self) -> Result<ChunkIter, ProcessingError> {
        let layout = self.layout();
        ChunkIter::new(&self.path, &layout, chunks::plan(&layout, &self.policy))
    }

    /// Apply a function to every chunk, returning the results in chunk order.
    ///
    /// See [chunks::map_chunks].
    pub fn map_chunks<T, F>(&self, operation: &'static str, f: F) -> Result<Vec<T>, ProcessingError>
    where
        T: Send,
        F: Fn(Chunk) -> Result<T, ProcessingError> + Sync,
    {
        chunks::map_chunks(&self.path, &self.layout(), &self.policy, operation, f)
    }

    /// Open a reader for random access to elements.
    pub fn reader(&self) -> Result<PageReader, ProcessingError> {
        PageReader::open(&self.path, self.page_len)
    }
}
