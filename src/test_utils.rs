use crate::tiff_file::{read_header, write_volume, TiffHeader};

use ndarray::{Array, Array5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tiff::encoder::colortype;

/// Write a 5D u16 volume whose elements count up from zero in storage order.
pub(crate) fn write_ramp(dir: &Path, shape: [usize; 5]) -> (PathBuf, TiffHeader) {
    let len = shape.iter().product::<usize>();
    let array = Array::from_shape_vec(shape, (0..len).map(|i| i as u16).collect()).unwrap();
    let path = dir.join("ramp.tif");
    write_volume::<colortype::Gray16, _>(&path, array.view(), 1).unwrap();
    let header = read_header(&path).unwrap();
    (path, header)
}

/// Returns a 5D u8 volume of uniformly random values.
pub(crate) fn random_u8(shape: [usize; 5], seed: u64) -> Array5<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array::from_shape_simple_fn(shape, || rng.random::<u8>())
}

/// Write a u8 volume of any dimensionality with one page per leading index.
pub(crate) fn write_u8<D: ndarray::Dimension>(
    dir: &Path,
    name: &str,
    array: &Array<u8, D>,
) -> PathBuf {
    let path = dir.join(name);
    write_volume::<colortype::Gray8, _>(&path, array.view(), 1).unwrap();
    path
}

/// Write a 5D f32 volume with one page per leading index.
pub(crate) fn write_f32(dir: &Path, name: &str, array: &Array5<f32>) -> PathBuf {
    let path = dir.join(name);
    write_volume::<colortype::Gray32Float, _>(&path, array.view(), 1).unwrap();
    path
}
