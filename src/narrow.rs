//! Narrowing of derived data to 8-bit output.
//!
//! Values are clamped to the `u8` range and truncated, never wrapped. They are not rescaled
//! from the data's own range first, so anything outside [0, 255] saturates.

use ndarray::{Array, ArrayBase, Data, Dimension};
use num_traits::AsPrimitive;

/// Clamp a value to [0, 255] and cast it to `u8`. NaN maps to 0.
pub fn clamp_u8<T: AsPrimitive<f64>>(value: T) -> u8 {
    let value: f64 = value.as_();
    if value.is_nan() {
        0
    } else {
        value.clamp(0.0, 255.0) as u8
    }
}

/// Narrow every element of an array to `u8` with [clamp_u8].
pub fn to_u8<S, D>(array: &ArrayBase<S, D>) -> Array<u8, D>
where
    S: Data,
    S::Elem: AsPrimitive<f64>,
    D: Dimension,
{
    array.mapv(clamp_u8)
}
