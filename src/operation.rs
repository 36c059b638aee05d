use crate::chunks::ChunkPolicy;
use crate::error::ProcessingError;
use crate::volume::ImageVolume;

use std::path::Path;

/// Trait for image volume operations.
///
/// This forms the contract between the API layer and operations.
pub trait Operation {
    /// Name of the operation, used in logs and metrics.
    const NAME: &'static str;

    /// Result of the operation.
    type Output;

    /// Execute the operation.
    ///
    /// # Arguments
    ///
    /// * `volume`: Volume to operate on
    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError>;
}

/// Open a volume, run one operation on it and release it.
///
/// The volume and every file handle opened on its behalf are dropped before returning, on
/// success and on error.
///
/// # Arguments
///
/// * `path`: Path to the TIFF file
/// * `policy`: How the volume is partitioned into chunks
/// * `operation`: Operation to execute
pub fn process<O: Operation>(
    path: &Path,
    policy: ChunkPolicy,
    operation: &O,
) -> Result<O::Output, ProcessingError> {
    let span = tracing::debug_span!("process", operation = O::NAME, path = %path.display());
    let _guard = span.enter();
    let volume = ImageVolume::open(path, policy)?;
    tracing::debug!(shape = ?volume.shape(), dtype = %volume.dtype(), "opened volume");
    operation.execute(&volume)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;

    struct ShapeOp {}

    impl Operation for ShapeOp {
        const NAME: &'static str = "shape";
        type Output = [usize; 5];

        fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
            Ok(volume.shape())
        }
    }

    struct FailingOp {}

    impl Operation for FailingOp {
        const NAME: &'static str = "failing";
        type Output = ();

        fn execute(&self, _volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
            Err(ProcessingError::InvalidClusterCount { k: 0 })
        }
    }

    #[test]
    fn process_opens_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 3, 1, 2, 1]);
        let shape = process(&path, ChunkPolicy::default(), &ShapeOp {}).unwrap();
        assert_eq!([2, 3, 1, 2, 1], shape);
    }

    #[test]
    fn process_propagates_operation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [1, 1, 1, 1, 1]);
        match process(&path, ChunkPolicy::default(), &FailingOp {}).unwrap_err() {
            ProcessingError::InvalidClusterCount { k: 0 } => (),
            error => panic!("unexpected error {error:?}"),
        }
        // The file is closed again and can be removed.
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn process_propagates_load_error() {
        let dir = tempfile::tempdir().unwrap();
        match process(&dir.path().join("missing.tif"), ChunkPolicy::default(), &ShapeOp {}) {
            Err(ProcessingError::Io(_)) => (),
            result => panic!("unexpected result {result:?}"),
        }
    }
}
