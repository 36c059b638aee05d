//! Image volume operations.
//!
//! Each operation is implemented as a struct that implements the
//! [Operation](crate::operation::Operation) trait. Operations read the volume through its
//! chunks and never hold more than the chunks in flight plus their own output in memory.

use crate::chunks::{tree_reduce, Chunk};
use crate::error::ProcessingError;
use crate::kmeans::{self, KMeansModel, KMeansParams, WeightedValues};
use crate::metrics::DECODED_PAGES;
use crate::models::{Axis, ChannelStatistics, Metadata, SliceSelector, VolumeStatistics};
use crate::operation::Operation;
use crate::pca::{PcaAccumulator, PcaModel};
use crate::tiff_file::PageReader;
use crate::volume::ImageVolume;

use ndarray::{s, Array, Array2, Array4, Array5, ArrayD, IxDyn};
use ndarray_stats::QuantileExt;
use std::ops::Range;
use std::sync::{Mutex, PoisonError};

/// Shape, data type and value range of a volume.
///
/// The value range needs a full pass over the data.
pub struct Describe {}

/// Smallest and largest finite value, if any.
type Range2 = Option<(f64, f64)>;

fn merge_ranges(a: Range2, b: Range2) -> Range2 {
    match (a, b) {
        (Some((amin, amax)), Some((bmin, bmax))) => Some((amin.min(bmin), amax.max(bmax))),
        (a, None) => a,
        (None, b) => b,
    }
}

fn chunk_range(chunk: Chunk) -> Result<Range2, ProcessingError> {
    let data = chunk
        .data
        .mapv(|value| if value.is_finite() { value } else { f64::NAN });
    let min = *data.min_skipnan();
    let max = *data.max_skipnan();
    if min.is_nan() || max.is_nan() {
        Ok(None)
    } else {
        Ok(Some((min, max)))
    }
}

impl Operation for Describe {
    const NAME: &'static str = "describe";
    type Output = Metadata;

    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
        if volume.is_empty() {
            return Err(ProcessingError::EmptyVolume {
                operation: Self::NAME,
                reason: "volume has no elements".to_string(),
            });
        }
        let ranges = volume.map_chunks(Self::NAME, chunk_range)?;
        let (min, max) = tree_reduce(ranges, merge_ranges)
            .flatten()
            .ok_or_else(|| ProcessingError::EmptyVolume {
                operation: Self::NAME,
                reason: "volume has no finite values".to_string(),
            })?;
        Ok(Metadata {
            shape: volume.shape(),
            dtype: volume.dtype(),
            min,
            max,
        })
    }
}

/// Extraction of a dense sub-array.
///
/// Fixed axes are dropped from the result, which has the X and Y axes followed by each axis
/// left unspecified. Only the pages holding selected elements are decoded.
pub struct Slice {
    pub selector: SliceSelector,
}

/// Resolve a possibly negative index against an axis length.
fn normalize_index(axis: Axis, index: isize, length: usize) -> Result<usize, ProcessingError> {
    let out_of_range = || ProcessingError::IndexOutOfRange {
        axis,
        index,
        length,
    };
    let length_signed = isize::try_from(length).map_err(|_| out_of_range())?;
    let resolved = if index < 0 {
        index + length_signed
    } else {
        index
    };
    if (0..length_signed).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(out_of_range())
    }
}

/// Range of indices selected along an axis of a volume.
fn axis_range(
    axis: Axis,
    index: Option<isize>,
    shape: &[usize; 5],
) -> Result<(Range<usize>, bool), ProcessingError> {
    let length = shape[axis.index()];
    match index {
        Some(index) => {
            let index = normalize_index(axis, index, length)?;
            Ok((index..index + 1, false))
        }
        None => Ok((0..length, true)),
    }
}

impl Slice {
    /// Read the selected elements through a reader.
    fn extract(
        &self,
        volume: &ImageVolume,
        reader: &mut PageReader,
    ) -> Result<ArrayD<f64>, ProcessingError> {
        let shape = volume.shape();
        let [nx, ny, nz, nt, nc] = shape;
        let (zs, keep_z) = axis_range(Axis::Z, self.selector.z, &shape)?;
        let (ts, keep_t) = axis_range(Axis::Time, self.selector.time, &shape)?;
        let (cs, keep_c) = axis_range(Axis::Channel, self.selector.channel, &shape)?;

        let mut output_shape = vec![nx, ny];
        for (range, keep) in [(&zs, keep_z), (&ts, keep_t), (&cs, keep_c)] {
            if keep {
                output_shape.push(range.len());
            }
        }

        let mut values = Vec::with_capacity(output_shape.iter().product());
        for x in 0..nx {
            for y in 0..ny {
                for z in zs.clone() {
                    for t in ts.clone() {
                        let row = ((x * ny + y) * nz + z) * nt + t;
                        for c in cs.clone() {
                            values.push(reader.value(row * nc + c)?);
                        }
                    }
                }
            }
        }
        Ok(Array::from_shape_vec(IxDyn(&output_shape), values)?)
    }
}

impl Operation for Slice {
    const NAME: &'static str = "slice";
    type Output = ArrayD<f64>;

    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
        let mut reader = volume.reader()?;
        let slice = self.extract(volume, &mut reader)?;
        DECODED_PAGES
            .with_label_values(&[Self::NAME])
            .inc_by(reader.pages_decoded() as u64);
        tracing::debug!(shape = ?slice.shape(), pages = reader.pages_decoded(), "extracted slice");
        Ok(slice)
    }
}

/// Per-channel mean, population standard deviation, minimum and maximum.
///
/// Non-finite values are skipped.
pub struct Statistics {}

/// Running moments of one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Moments {
    n: f64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Moments {
    fn empty() -> Self {
        Self {
            n: 0.0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(mut self, value: f64) -> Self {
        self.n += 1.0;
        let delta = value - self.mean;
        self.mean += delta / self.n;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self
    }

    fn merge(self, other: Self) -> Self {
        if self.n == 0.0 {
            return other;
        }
        if other.n == 0.0 {
            return self;
        }
        let n = self.n + other.n;
        let delta = other.mean - self.mean;
        Self {
            n,
            mean: self.mean + delta * other.n / n,
            m2: self.m2 + other.m2 + delta * delta * self.n * other.n / n,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

fn chunk_moments(chunk: Chunk) -> Result<Vec<Moments>, ProcessingError> {
    Ok(chunk
        .data
        .columns()
        .into_iter()
        .map(|column| {
            column
                .iter()
                .copied()
                .filter(|value| value.is_finite())
                .fold(Moments::empty(), Moments::push)
        })
        .collect())
}

impl Operation for Statistics {
    const NAME: &'static str = "statistics";
    type Output = VolumeStatistics;

    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
        if volume.channels() == 0 {
            return Err(ProcessingError::EmptyVolume {
                operation: Self::NAME,
                reason: "volume has no channels".to_string(),
            });
        }
        if volume.positions() == 0 {
            return Err(ProcessingError::EmptyVolume {
                operation: Self::NAME,
                reason: "channels have no elements".to_string(),
            });
        }
        let partials = volume.map_chunks(Self::NAME, chunk_moments)?;
        let totals = tree_reduce(partials, |a, b| {
            a.into_iter().zip(b).map(|(a, b)| a.merge(b)).collect()
        })
        .unwrap_or_default();

        totals
            .into_iter()
            .enumerate()
            .map(|(channel, moments)| {
                if moments.n == 0.0 {
                    return Err(ProcessingError::EmptyVolume {
                        operation: Self::NAME,
                        reason: format!("channel {} has no finite values", channel),
                    });
                }
                Ok(ChannelStatistics {
                    mean: moments.mean,
                    std: (moments.m2 / moments.n).sqrt(),
                    min: moments.min,
                    max: moments.max,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(VolumeStatistics)
    }
}

/// Incremental principal component analysis over the channel axis.
///
/// The fit folds one [PcaAccumulator] per chunk, in chunk index order, and combines them
/// pairwise. A second pass projects every (x, y, z, t) channel vector onto the retained
/// components.
pub struct Pca {
    pub components: usize,
}

/// Output of [Pca].
#[derive(Debug)]
pub struct PcaOutput {
    /// Projected volume of shape (X, Y, Z, T, K)
    pub data: Array5<f64>,
    pub model: PcaModel,
}

impl Operation for Pca {
    const NAME: &'static str = "pca";
    type Output = PcaOutput;

    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
        let channels = volume.channels();
        if self.components == 0 || self.components > channels {
            return Err(ProcessingError::InvalidComponentCount {
                components: self.components,
                channels,
            });
        }
        let accumulators = volume.map_chunks(Self::NAME, |chunk| {
            Ok(PcaAccumulator::from_rows(chunk.data.view()))
        })?;
        let model = tree_reduce(accumulators, PcaAccumulator::merge)
            .unwrap_or_else(|| PcaAccumulator::empty(channels))
            .fit(self.components)?;
        tracing::debug!(
            explained_variance_ratio = ?model.explained_variance_ratio,
            "fitted PCA model"
        );

        // Each chunk writes its rows straight into the output.
        let projected = Mutex::new(Array2::<f64>::zeros((volume.positions(), self.components)));
        volume.map_chunks(Self::NAME, |chunk| {
            let rows = model.transform(chunk.data.view());
            projected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .slice_mut(s![chunk.spec.rows.clone(), ..])
                .assign(&rows);
            Ok(())
        })?;
        let [nx, ny, nz, nt, _] = volume.shape();
        let data = projected
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_shape((nx, ny, nz, nt, self.components))?;
        Ok(PcaOutput { data, model })
    }
}

/// K-means segmentation of one channel by intensity.
///
/// Labels are numbered by ascending cluster centre.
pub struct KMeansSegmentation {
    pub channel: usize,
    pub k: usize,
    pub params: KMeansParams,
}

/// Output of [KMeansSegmentation].
#[derive(Debug)]
pub struct SegmentationOutput {
    /// Labels of shape (X, Y, Z, T), each in `0..k`
    pub labels: Array4<u32>,
    pub model: KMeansModel,
}

impl Operation for KMeansSegmentation {
    const NAME: &'static str = "kmeans";
    type Output = SegmentationOutput;

    fn execute(&self, volume: &ImageVolume) -> Result<Self::Output, ProcessingError> {
        let channels = volume.channels();
        if self.channel >= channels {
            return Err(ProcessingError::InvalidChannel {
                channel: self.channel,
                channels,
            });
        }
        if self.k == 0 {
            return Err(ProcessingError::InvalidClusterCount { k: self.k });
        }
        if volume.positions() == 0 {
            return Err(ProcessingError::EmptyChannel {
                channel: self.channel,
            });
        }

        let channel = self.channel;
        let histograms = volume.map_chunks(Self::NAME, |chunk| {
            Ok(WeightedValues::from_samples(
                chunk.data.column(channel).iter().copied(),
            ))
        })?;
        let histogram = tree_reduce(histograms, WeightedValues::merge).unwrap_or_default();
        let model = kmeans::fit(&histogram, self.k, &self.params);

        let labels = Mutex::new(vec![0_u32; volume.positions()]);
        volume.map_chunks(Self::NAME, |chunk| {
            let chunk_labels: Vec<u32> = chunk
                .data
                .column(channel)
                .iter()
                .map(|&value| model.label(value))
                .collect();
            labels.lock().unwrap_or_else(PoisonError::into_inner)[chunk.spec.rows.clone()]
                .copy_from_slice(&chunk_labels);
            Ok(())
        })?;
        let [nx, ny, nz, nt, _] = volume.shape();
        let labels = Array::from_shape_vec(
            (nx, ny, nz, nt),
            labels.into_inner().unwrap_or_else(PoisonError::into_inner),
        )?;
        Ok(SegmentationOutput { labels, model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::chunks::ChunkPolicy;
    use crate::models::DType;
    use crate::test_utils;
    use crate::tiff_file::write_volume;
    use ndarray::{s, Array5};
    use tiff::encoder::colortype;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn small_chunks(parallel: bool) -> ChunkPolicy {
        ChunkPolicy {
            target_bytes: 256,
            parallel,
        }
    }

    fn open(path: &Path, policy: ChunkPolicy) -> ImageVolume {
        ImageVolume::open(path, policy).unwrap()
    }

    #[test]
    fn describe_ramp() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [4, 3, 2, 2, 3]);
        let metadata = Describe {}.execute(&open(&path, small_chunks(false))).unwrap();
        assert_eq!([4, 3, 2, 2, 3], metadata.shape);
        assert_eq!(DType::Uint16, metadata.dtype);
        assert_eq!(0.0, metadata.min);
        assert_eq!(143.0, metadata.max);
    }

    #[test]
    fn describe_skips_nan() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = Array5::<f32>::from_elem((2, 2, 1, 1, 2), 3.0);
        array[[0, 0, 0, 0, 0]] = f32::NAN;
        array[[1, 1, 0, 0, 1]] = -2.5;
        array[[1, 0, 0, 0, 1]] = f32::INFINITY;
        let path = test_utils::write_f32(dir.path(), "nan.tif", &array);
        let metadata = Describe {}.execute(&open(&path, small_chunks(false))).unwrap();
        assert_eq!(DType::Float32, metadata.dtype);
        assert_eq!(-2.5, metadata.min);
        assert_eq!(3.0, metadata.max);
    }

    #[test]
    fn describe_empty_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_utils::write_u8(
            dir.path(),
            "empty.tif",
            &Array5::<u8>::zeros((2, 0, 1, 1, 1)),
        );
        match (Describe {}).execute(&open(&path, ChunkPolicy::default())) {
            Err(ProcessingError::EmptyVolume {
                operation: "describe",
                reason: _,
            }) => (),
            result => panic!("unexpected result {result:?}"),
        }
    }

    #[test]
    fn slice_all_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [3, 4, 5, 2, 3]);
        let selector = SliceSelector {
            z: Some(2),
            time: Some(1),
            channel: Some(1),
        };
        let slice = Slice { selector }
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap();
        assert_eq!(&[3, 4], slice.shape());
        let full = Array::from_shape_vec((3, 4, 5, 2, 3), (0..360).map(f64::from).collect())
            .unwrap();
        assert_eq!(full.slice(s![.., .., 2, 1, 1]).into_dyn(), slice);
    }

    #[test]
    fn slice_keeps_unspecified_axes() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [3, 4, 5, 2, 3]);
        let selector = SliceSelector {
            z: None,
            time: Some(-1),
            channel: None,
        };
        let slice = Slice { selector }
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap();
        assert_eq!(&[3, 4, 5, 3], slice.shape());
        let full = Array::from_shape_vec((3, 4, 5, 2, 3), (0..360).map(f64::from).collect())
            .unwrap();
        assert_eq!(full.slice(s![.., .., .., 1, ..]).into_dyn(), slice);
    }

    #[test]
    fn slice_no_selection_is_whole_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 2, 2, 2, 2]);
        let slice = Slice {
            selector: SliceSelector::default(),
        }
        .execute(&open(&path, ChunkPolicy::default()))
        .unwrap();
        assert_eq!(&[2, 2, 2, 2, 2], slice.shape());
        assert_eq!(31.0, slice[IxDyn(&[1, 1, 1, 1, 1])]);
    }

    #[test]
    fn slice_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 2, 3, 2, 2]);
        let volume = open(&path, ChunkPolicy::default());
        let selector = SliceSelector {
            z: Some(3),
            ..Default::default()
        };
        match (Slice { selector }).execute(&volume).unwrap_err() {
            ProcessingError::IndexOutOfRange {
                axis: Axis::Z,
                index: 3,
                length: 3,
            } => (),
            error => panic!("unexpected error {error:?}"),
        }
        let selector = SliceSelector {
            channel: Some(-3),
            ..Default::default()
        };
        match (Slice { selector }).execute(&volume).unwrap_err() {
            ProcessingError::IndexOutOfRange {
                axis: Axis::Channel,
                index: -3,
                length: 2,
            } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn slice_decodes_only_selected_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.tif");
        // One page per (x, y, z) position.
        let array = Array5::<u8>::zeros((2, 2, 4, 1, 1));
        write_volume::<colortype::Gray8, _>(&path, array.view(), 3).unwrap();
        let volume = open(&path, ChunkPolicy::default());
        let selector = SliceSelector {
            z: Some(1),
            time: None,
            channel: None,
        };
        let mut reader = volume.reader().unwrap();
        let slice = Slice { selector }.extract(&volume, &mut reader).unwrap();
        assert_eq!(&[2, 2, 1, 1], slice.shape());
        assert_eq!(4, reader.pages_decoded());
    }

    #[test]
    fn normalize_negative_index() {
        assert_eq!(4, normalize_index(Axis::Z, -1, 5).unwrap());
        assert_eq!(0, normalize_index(Axis::Z, -5, 5).unwrap());
        assert!(normalize_index(Axis::Z, -6, 5).is_err());
        assert!(normalize_index(Axis::Z, 0, 0).is_err());
    }

    #[test]
    fn statistics_match_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([6, 5, 4, 3, 3], 7);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        for parallel in [false, true] {
            let statistics = Statistics {}
                .execute(&open(&path, small_chunks(parallel)))
                .unwrap();
            assert_eq!(3, statistics.0.len());
            for (channel, stats) in statistics.0.iter().enumerate() {
                let values = array.slice(s![.., .., .., .., channel]).mapv(f64::from);
                let mean = values.mean().unwrap();
                let std = values.std(0.0);
                assert!((stats.mean - mean).abs() < 1e-9);
                assert!((stats.std - std).abs() < 1e-9);
                assert_eq!(*values.min().unwrap(), stats.min);
                assert_eq!(*values.max().unwrap(), stats.max);
                assert!(stats.min <= stats.mean && stats.mean <= stats.max);
                assert!(stats.std >= 0.0);
            }
        }
    }

    #[test]
    fn describe_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([5, 4, 3, 2, 2], 11);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        let first = Describe {}.execute(&open(&path, small_chunks(true))).unwrap();
        let second = Describe {}.execute(&open(&path, small_chunks(true))).unwrap();
        assert_eq!(first, second);
        assert_eq!([5, 4, 3, 2, 2], first.shape);
        assert_eq!(f64::from(*array.iter().min().unwrap()), first.min);
        assert_eq!(f64::from(*array.iter().max().unwrap()), first.max);
    }

    #[test]
    fn statistics_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [5, 4, 3, 2, 2]);
        let first = Statistics {}.execute(&open(&path, small_chunks(true))).unwrap();
        let second = Statistics {}.execute(&open(&path, small_chunks(true))).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn statistics_no_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_utils::write_u8(
            dir.path(),
            "empty.tif",
            &Array5::<u8>::zeros((2, 2, 1, 1, 0)),
        );
        match (Statistics {}).execute(&open(&path, ChunkPolicy::default())) {
            Err(ProcessingError::EmptyVolume {
                operation: "statistics",
                reason,
            }) => assert_eq!("volume has no channels", reason),
            result => panic!("unexpected result {result:?}"),
        }
    }

    #[test]
    fn statistics_no_elements() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_utils::write_u8(
            dir.path(),
            "empty.tif",
            &Array5::<u8>::zeros((2, 2, 0, 1, 3)),
        );
        match (Statistics {}).execute(&open(&path, ChunkPolicy::default())) {
            Err(ProcessingError::EmptyVolume {
                operation: "statistics",
                reason,
            }) => assert_eq!("channels have no elements", reason),
            result => panic!("unexpected result {result:?}"),
        }
    }

    #[test]
    fn statistics_channel_all_nan() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = Array5::<f32>::from_elem((2, 2, 1, 1, 2), 1.0);
        array.slice_mut(s![.., .., .., .., 1]).fill(f32::NAN);
        let path = test_utils::write_f32(dir.path(), "nan.tif", &array);
        match (Statistics {}).execute(&open(&path, ChunkPolicy::default())) {
            Err(ProcessingError::EmptyVolume {
                operation: "statistics",
                reason,
            }) => assert_eq!("channel 1 has no finite values", reason),
            result => panic!("unexpected result {result:?}"),
        }
    }

    #[test]
    fn moments_merge() {
        let values = [1.0, 4.0, 2.0, 8.0, 5.0];
        let whole = values.iter().copied().fold(Moments::empty(), Moments::push);
        let left = values[..2].iter().copied().fold(Moments::empty(), Moments::push);
        let right = values[2..].iter().copied().fold(Moments::empty(), Moments::push);
        let merged = left.merge(right);
        assert_eq!(whole.n, merged.n);
        assert!((whole.mean - merged.mean).abs() < 1e-12);
        assert!((whole.m2 - merged.m2).abs() < 1e-12);
        assert_eq!(1.0, merged.min);
        assert_eq!(8.0, merged.max);
    }

    #[test]
    fn pca_shape_and_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([5, 4, 3, 2, 3], 11);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        for components in 1..=3 {
            let output = Pca { components }
                .execute(&open(&path, small_chunks(false)))
                .unwrap();
            assert_eq!(&[5, 4, 3, 2, components], output.data.shape());
            assert_eq!(components, output.model.explained_variance_ratio.len());
        }
    }

    #[test]
    fn pca_chunking_agrees_with_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([6, 5, 2, 2, 3], 3);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        let whole = Pca { components: 2 }
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap();
        let chunked = Pca { components: 2 }
            .execute(&open(&path, small_chunks(true)))
            .unwrap();
        for (a, b) in whole.data.iter().zip(chunked.data.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }

    #[test]
    fn pca_projection_keeps_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([6, 5, 2, 2, 3], 5);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        let output = Pca { components: 2 }
            .execute(&open(&path, small_chunks(true)))
            .unwrap();
        let rows = array.mapv(f64::from).into_shape((120, 3)).unwrap();
        let expected = output.model.transform(rows.view());
        let actual = output.data.view().into_shape((120, 2)).unwrap();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn pca_invalid_component_count() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 2, 1, 1, 3]);
        let volume = open(&path, ChunkPolicy::default());
        for components in [0, 4] {
            match (Pca { components }).execute(&volume).unwrap_err() {
                ProcessingError::InvalidComponentCount {
                    components: c,
                    channels: 3,
                } => assert_eq!(components, c),
                error => panic!("unexpected error {error:?}"),
            }
        }
    }

    #[test]
    fn pca_too_few_samples() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [1, 1, 1, 1, 3]);
        match (Pca { components: 2 })
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap_err()
        {
            ProcessingError::PcaFit { reason: _ } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    fn seeded(channel: usize, k: usize) -> KMeansSegmentation {
        KMeansSegmentation {
            channel,
            k,
            params: KMeansParams {
                seed: Some(1),
                ..Default::default()
            },
        }
    }

    #[test]
    fn segment_two_levels() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = Array5::<u8>::zeros((4, 4, 2, 1, 2));
        array.slice_mut(s![2.., .., .., .., 1]).fill(200);
        let path = test_utils::write_u8(dir.path(), "levels.tif", &array);
        let output = seeded(1, 2)
            .execute(&open(&path, small_chunks(false)))
            .unwrap();
        assert_eq!(&[4, 4, 2, 1], output.labels.shape());
        assert!(output.labels.slice(s![..2, .., .., ..]).iter().all(|&l| l == 0));
        assert!(output.labels.slice(s![2.., .., .., ..]).iter().all(|&l| l == 1));
        assert_eq!(vec![0.0, 200.0], output.model.centres);
    }

    #[test]
    fn segment_sequential_and_parallel_agree() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([6, 5, 2, 2, 2], 5);
        let path = test_utils::write_u8(dir.path(), "random.tif", &array);
        let sequential = seeded(0, 4)
            .execute(&open(&path, small_chunks(false)))
            .unwrap();
        let parallel = seeded(0, 4)
            .execute(&open(&path, small_chunks(true)))
            .unwrap();
        assert_eq!(sequential.labels, parallel.labels);
    }

    #[test]
    fn segment_invalid_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 2, 1, 1, 3]);
        match seeded(3, 2)
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap_err()
        {
            ProcessingError::InvalidChannel {
                channel: 3,
                channels: 3,
            } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn segment_invalid_cluster_count() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = test_utils::write_ramp(dir.path(), [2, 2, 1, 1, 3]);
        match seeded(0, 0)
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap_err()
        {
            ProcessingError::InvalidClusterCount { k: 0 } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn segment_empty_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_utils::write_u8(
            dir.path(),
            "empty.tif",
            &Array5::<u8>::zeros((0, 2, 1, 1, 2)),
        );
        match seeded(1, 2)
            .execute(&open(&path, ChunkPolicy::default()))
            .unwrap_err()
        {
            ProcessingError::EmptyChannel { channel: 1 } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn end_to_end_random_volume() {
        let dir = tempfile::tempdir().unwrap();
        let array = test_utils::random_u8([100, 100, 10, 5, 3], 2024);
        let path = test_utils::write_u8(dir.path(), "test_image.tif", &array);
        let policy = ChunkPolicy {
            target_bytes: 1024 * 1024,
            parallel: true,
        };
        let volume = open(&path, policy);
        assert_eq!([100, 100, 10, 5, 3], volume.shape());

        let pca = Pca { components: 2 }.execute(&volume).unwrap();
        assert_eq!(&[100, 100, 10, 5, 2], pca.data.shape());

        let segmentation = seeded(0, 3).execute(&volume).unwrap();
        assert_eq!(&[100, 100, 10, 5], segmentation.labels.shape());
        let labels: BTreeSet<u32> = segmentation.labels.iter().copied().collect();
        assert_eq!(BTreeSet::from([0, 1, 2]), labels);

        let selector = SliceSelector {
            z: Some(5),
            time: Some(2),
            channel: Some(1),
        };
        let slice = Slice { selector }.execute(&volume).unwrap();
        assert_eq!(&[100, 100], slice.shape());
    }
}
