//! Explicit chunked evaluation of a stored volume.
//!
//! A volume of shape (X, Y, Z, T, C) is viewed as an (X·Y·Z·T) × C matrix whose rows are the
//! channel vectors of one (x, y, z, t) position. Rows are contiguous in storage, so a chunk is
//! a run of whole rows. Chunks are produced on demand in ascending index order and reductions
//! are folds over them; nothing is evaluated implicitly.

use crate::error::ProcessingError;
use crate::metrics::DECODED_PAGES;
use crate::tiff_file::PageReader;

use ndarray::Array2;
use rayon::prelude::*;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per element of chunk data once widened to `f64`.
const WORKING_SIZE: usize = std::mem::size_of::<f64>();

/// Default in-memory size of a chunk.
pub const DEFAULT_CHUNK_BYTES: usize = 128 * 1024 * 1024;

/// How a volume is partitioned into chunks and how chunks are evaluated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkPolicy {
    /// Target in-memory size of one chunk's data
    pub target_bytes: usize,
    /// Evaluate chunks on the rayon thread pool
    pub parallel: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            target_bytes: DEFAULT_CHUNK_BYTES,
            parallel: false,
        }
    }
}

/// Bounds of one chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSpec {
    /// Position of the chunk in traversal order
    pub index: usize,
    /// Rows covered by the chunk
    pub rows: Range<usize>,
}

/// A chunk with its data loaded as a rows × channels matrix.
#[derive(Debug)]
pub struct Chunk {
    pub spec: ChunkSpec,
    pub data: Array2<f64>,
}

/// Geometry of the row matrix of a stored volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RowLayout {
    /// Number of rows (X·Y·Z·T)
    pub rows: usize,
    /// Elements per row (C)
    pub channels: usize,
    /// Elements per TIFF page
    pub page_len: usize,
}

/// Returns the number of rows per chunk for a layout and policy.
///
/// Derived from the target size and the row size. When pages hold whole rows and a chunk spans
/// at least one page, the count is rounded down to whole pages so that no page is decoded by
/// two chunks.
pub fn rows_per_chunk(layout: &RowLayout, policy: &ChunkPolicy) -> usize {
    let row_bytes = layout.channels.max(1) * WORKING_SIZE;
    let rows = (policy.target_bytes / row_bytes).max(1);
    if layout.channels > 0 && layout.page_len % layout.channels == 0 {
        let rows_per_page = layout.page_len / layout.channels;
        if rows_per_page > 0 && rows >= rows_per_page {
            return rows - rows % rows_per_page;
        }
    }
    rows
}

/// Partition the rows of a layout into chunks.
///
/// A layout without rows or channels has no chunks.
#[tracing::instrument(level = "DEBUG")]
pub fn plan(layout: &RowLayout, policy: &ChunkPolicy) -> Vec<ChunkSpec> {
    if layout.rows == 0 || layout.channels == 0 {
        return vec![];
    }
    let step = rows_per_chunk(layout, policy);
    let specs: Vec<ChunkSpec> = (0..layout.rows)
        .step_by(step)
        .enumerate()
        .map(|(index, start)| ChunkSpec {
            index,
            rows: start..(start + step).min(layout.rows),
        })
        .collect();
    tracing::debug!(chunks = specs.len(), rows_per_chunk = step, "planned chunks");
    specs
}

/// Load the data of one chunk.
fn read_chunk(
    reader: &mut PageReader,
    spec: ChunkSpec,
    channels: usize,
) -> Result<Chunk, ProcessingError> {
    let values = reader.read(spec.rows.start * channels..spec.rows.end * channels)?;
    let data = Array2::from_shape_vec((spec.rows.len(), channels), values)?;
    Ok(Chunk { spec, data })
}

/// Iterator over the chunks of a stored volume, in ascending index order.
///
/// Owns a [PageReader], so the file is open for as long as the iterator lives.
pub struct ChunkIter {
    reader: PageReader,
    specs: std::vec::IntoIter<ChunkSpec>,
    channels: usize,
}

impl ChunkIter {
    /// Open an iterator over the given chunks.
    pub fn new(
        path: &Path,
        layout: &RowLayout,
        specs: Vec<ChunkSpec>,
    ) -> Result<Self, ProcessingError> {
        Ok(Self {
            reader: PageReader::open(path, layout.page_len)?,
            specs: specs.into_iter(),
            channels: layout.channels,
        })
    }

    /// Number of pages decoded so far.
    pub fn pages_decoded(&self) -> usize {
        self.reader.pages_decoded()
    }
}

impl Iterator for ChunkIter {
    type Item = Result<Chunk, ProcessingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let spec = self.specs.next()?;
        Some(read_chunk(&mut self.reader, spec, self.channels))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.specs.size_hint()
    }
}

/// Apply a function to every chunk, returning the results in chunk order.
///
/// With a parallel policy chunks are evaluated on the rayon thread pool, each worker reading
/// through its own [PageReader]. The first error encountered is returned.
///
/// # Arguments
///
/// * `path`: Path to the TIFF file
/// * `layout`: Row layout of the stored volume
/// * `policy`: Chunking policy
/// * `operation`: Operation name, used to label metrics
/// * `f`: Function to apply to each chunk
pub fn map_chunks<T, F>(
    path: &Path,
    layout: &RowLayout,
    policy: &ChunkPolicy,
    operation: &'static str,
    f: F,
) -> Result<Vec<T>, ProcessingError>
where
    T: Send,
    F: Fn(Chunk) -> Result<T, ProcessingError> + Sync,
{
    let specs = plan(layout, policy);
    if specs.is_empty() {
        return Ok(vec![]);
    }
    let (results, pages) = if policy.parallel {
        let pages = AtomicUsize::new(0);
        let results = specs
            .into_par_iter()
            .map_init(
                || None,
                |slot: &mut Option<PageReader>, spec| {
                    let reader = match slot.take() {
                        Some(reader) => reader,
                        None => PageReader::open(path, layout.page_len)?,
                    };
                    let reader = slot.insert(reader);
                    let before = reader.pages_decoded();
                    let chunk = read_chunk(reader, spec, layout.channels)?;
                    pages.fetch_add(reader.pages_decoded() - before, Ordering::Relaxed);
                    f(chunk)
                },
            )
            .collect::<Result<Vec<T>, ProcessingError>>()?;
        (results, pages.into_inner())
    } else {
        let mut chunks = ChunkIter::new(path, layout, specs)?;
        let results = chunks
            .by_ref()
            .map(|chunk| chunk.and_then(&f))
            .collect::<Result<Vec<T>, ProcessingError>>()?;
        (results, chunks.pages_decoded())
    };
    DECODED_PAGES
        .with_label_values(&[operation])
        .inc_by(pages as u64);
    tracing::debug!(operation, pages, "decoded pages");
    Ok(results)
}

/// Combine partial results pairwise until one remains.
///
/// Neighbours are combined level by level, so the combination order depends only on the
/// number of parts. Returns `None` when there are no parts.
pub fn tree_reduce<T, F>(mut parts: Vec<T>, combine: F) -> Option<T>
where
    F: Fn(T, T) -> T,
{
    while parts.len() > 1 {
        let mut next = Vec::with_capacity((parts.len() + 1) / 2);
        let mut iter = parts.into_iter();
        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => next.push(combine(left, right)),
                None => next.push(left),
            }
        }
        parts = next;
    }
    parts.pop()
}
