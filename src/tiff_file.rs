//! Reading and writing N-dimensional arrays stored in TIFF files.
//!
//! An array is stored as a sequence of equally sized pages (image file directories). The
//! pages, concatenated in file order, hold the array elements in row-major order. The shape of
//! the array is recorded as JSON (`{"shape": [...]}`) in the ImageDescription tag of the first
//! page, which is also how tifffile records the shape of the arrays it writes. Files without
//! a shape description are treated as a `[pages, height, width(, samples)]` stack.

use crate::error::ProcessingError;
use crate::models::DType;

use ndarray::{ArrayView, Dimension};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::ops::Range;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tiff::ColorType;

/// Shape description stored in the ImageDescription tag.
#[derive(Debug, Deserialize, Serialize)]
struct ShapeDescription {
    shape: Vec<usize>,
}

/// Layout of an array stored in a TIFF file.
#[derive(Clone, Debug, PartialEq)]
pub struct TiffHeader {
    /// Shape of the stored array
    pub shape: Vec<usize>,
    /// Element data type
    pub dtype: DType,
    /// Number of pages
    pub pages: usize,
    /// Number of elements in each page
    pub page_len: usize,
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>, ProcessingError> {
    let file = File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    Ok(decoder)
}

/// Returns the number of samples per pixel and the bits per sample of a colour type.
fn samples_and_bits(colortype: ColorType) -> Result<(usize, u8), ProcessingError> {
    match colortype {
        ColorType::Gray(bits) | ColorType::Palette(bits) => Ok((1, bits)),
        ColorType::GrayA(bits) => Ok((2, bits)),
        ColorType::RGB(bits) | ColorType::YCbCr(bits) => Ok((3, bits)),
        ColorType::RGBA(bits) | ColorType::CMYK(bits) => Ok((4, bits)),
        other => Err(ProcessingError::Layout {
            reason: format!("unsupported colour type {:?}", other),
        }),
    }
}

/// Parse the array shape from an ImageDescription, if it holds one.
fn shape_from_description(description: &str) -> Option<Vec<usize>> {
    serde_json::from_str::<ShapeDescription>(description)
        .ok()
        .map(|description| description.shape)
}

/// Read the layout of the array stored in a TIFF file.
///
/// Only the image file directories are visited; no pixel data is decoded. The file is closed
/// before returning.
///
/// # Arguments
///
/// * `path`: Path to the TIFF file
#[tracing::instrument(level = "DEBUG")]
pub fn read_header(path: &Path) -> Result<TiffHeader, ProcessingError> {
    let mut decoder = open_decoder(path)?;
    let description = decoder
        .find_tag(Tag::ImageDescription)?
        .map(|value| value.into_string())
        .transpose()?;
    let (width, height) = decoder.dimensions()?;
    let colortype = decoder.colortype()?;
    let (samples, bits) = samples_and_bits(colortype)?;
    let format = decoder
        .find_tag_unsigned_vec::<u16>(Tag::SampleFormat)?
        .and_then(|formats| formats.first().copied())
        .unwrap_or(1);
    let dtype = DType::from_sample_format(format, bits)?;
    let width = usize::try_from(width)?;
    let height = usize::try_from(height)?;
    let page_len = width * height * samples;

    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image()?;
        let (page_width, page_height) = decoder.dimensions()?;
        if (usize::try_from(page_width)?, usize::try_from(page_height)?) != (width, height)
            || decoder.colortype()? != colortype
        {
            return Err(ProcessingError::Layout {
                reason: format!("page {} differs in size or colour type from page 0", pages),
            });
        }
        pages += 1;
    }

    let shape = match description.as_deref().and_then(shape_from_description) {
        Some(shape) => shape,
        None => {
            let mut shape = vec![pages, height, width];
            if samples > 1 {
                shape.push(samples);
            }
            shape
        }
    };
    let len: usize = shape.iter().product();
    if len != 0 && len != pages * page_len {
        return Err(ProcessingError::Layout {
            reason: format!(
                "shape {:?} holds {} elements but {} pages of {} elements were found",
                shape, len, pages, page_len
            ),
        });
    }
    tracing::debug!(?shape, %dtype, pages, page_len, "read TIFF header");
    Ok(TiffHeader {
        shape,
        dtype,
        pages,
        page_len,
    })
}

/// Convert decoded samples of any type to `f64`.
fn widen(result: DecodingResult) -> Vec<f64> {
    fn to_f64<T: AsPrimitive<f64>>(values: Vec<T>) -> Vec<f64> {
        values.into_iter().map(|value| value.as_()).collect()
    }
    match result {
        DecodingResult::U8(values) => to_f64(values),
        DecodingResult::U16(values) => to_f64(values),
        DecodingResult::U32(values) => to_f64(values),
        DecodingResult::U64(values) => to_f64(values),
        DecodingResult::I8(values) => to_f64(values),
        DecodingResult::I16(values) => to_f64(values),
        DecodingResult::I32(values) => to_f64(values),
        DecodingResult::I64(values) => to_f64(values),
        DecodingResult::F32(values) => to_f64(values),
        DecodingResult::F64(values) => values,
    }
}

/// Reads elements of a stored array page by page.
///
/// Owns the file handle for its lifetime, which is released when the reader is dropped. The
/// most recently decoded page is kept so that consecutive reads from one page decode it once.
pub struct PageReader {
    decoder: Decoder<BufReader<File>>,
    page_len: usize,
    cached: Option<(usize, Vec<f64>)>,
    pages_decoded: usize,
}

impl PageReader {
    /// Open a reader.
    ///
    /// # Arguments
    ///
    /// * `path`: Path to the TIFF file
    /// * `page_len`: Number of elements in each page, from [TiffHeader]
    pub fn open(path: &Path, page_len: usize) -> Result<Self, ProcessingError> {
        if page_len == 0 {
            return Err(ProcessingError::Layout {
                reason: "pages must not be empty".to_string(),
            });
        }
        Ok(Self {
            decoder: open_decoder(path)?,
            page_len,
            cached: None,
            pages_decoded: 0,
        })
    }

    /// Number of pages decoded so far.
    pub fn pages_decoded(&self) -> usize {
        self.pages_decoded
    }

    /// Returns the elements of a page, decoding it if it is not cached.
    fn page(&mut self, page: usize) -> Result<&[f64], ProcessingError> {
        let hit = matches!(&self.cached, Some((index, _)) if *index == page);
        if !hit {
            self.decoder.seek_to_image(page)?;
            let values = widen(self.decoder.read_image()?);
            if values.len() != self.page_len {
                return Err(ProcessingError::Layout {
                    reason: format!(
                        "page {} holds {} elements, expected {}",
                        page,
                        values.len(),
                        self.page_len
                    ),
                });
            }
            self.pages_decoded += 1;
            self.cached = Some((page, values));
        }
        Ok(self
            .cached
            .as_ref()
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[]))
    }

    /// Returns the element at a row-major flat index.
    pub fn value(&mut self, index: usize) -> Result<f64, ProcessingError> {
        let page = index / self.page_len;
        let offset = index % self.page_len;
        Ok(self.page(page)?[offset])
    }

    /// Returns the elements in a range of row-major flat indices.
    ///
    /// Only the pages overlapping the range are decoded.
    pub fn read(&mut self, range: Range<usize>) -> Result<Vec<f64>, ProcessingError> {
        let mut values = Vec::with_capacity(range.len());
        let mut position = range.start;
        while position < range.end {
            let page = position / self.page_len;
            let offset = position % self.page_len;
            let take = (self.page_len - offset).min(range.end - position);
            values.extend_from_slice(&self.page(page)?[offset..offset + take]);
            position += take;
        }
        Ok(values)
    }
}

/// Encode an array as a TIFF stream.
///
/// The first `leading_axes` axes are flattened into pages; each page is a 2D image whose width
/// is the last axis. At most `ndim - 2` axes are used for pages.
///
/// # Arguments
///
/// * `writer`: Destination of the TIFF stream
/// * `array`: Array to encode
/// * `leading_axes`: Number of leading axes spread across pages
pub fn encode_volume<W, C, D>(
    writer: W,
    array: ArrayView<C::Inner, D>,
    leading_axes: usize,
) -> Result<(), ProcessingError>
where
    W: Write + Seek,
    C: colortype::ColorType,
    C::Inner: Clone + Default,
    [C::Inner]: TiffValue,
    D: Dimension,
{
    let shape = array.shape().to_vec();
    let ndim = shape.len();
    let (height, width) = match ndim {
        0 => (1, 1),
        1 => (1, shape[0]),
        _ => {
            let leading = leading_axes.min(ndim - 2);
            (shape[leading..ndim - 1].iter().product(), shape[ndim - 1])
        }
    };
    let description = serde_json::to_string(&ShapeDescription {
        shape: shape.clone(),
    })?;

    let mut encoder = TiffEncoder::new(writer)?;
    if array.is_empty() {
        // TIFF images cannot be empty; the description records the real (empty) shape.
        let mut image = encoder.new_image::<C>(1, 1)?;
        image
            .encoder()
            .write_tag(Tag::ImageDescription, description.as_str())?;
        image.write_data(&[C::Inner::default()])?;
        return Ok(());
    }

    let data = array.as_standard_layout();
    let data = data.as_slice().ok_or_else(|| ProcessingError::Layout {
        reason: "array is not contiguous".to_string(),
    })?;
    let page_len = width * height;
    for (page, values) in data.chunks(page_len).enumerate() {
        let mut image = encoder.new_image::<C>(u32::try_from(width)?, u32::try_from(height)?)?;
        if page == 0 {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description.as_str())?;
        }
        image.write_data(values)?;
    }
    Ok(())
}

/// Write an array to a TIFF file, replacing any existing file.
///
/// See [encode_volume] for the page layout.
#[tracing::instrument(level = "DEBUG", skip(array))]
pub fn write_volume<C, D>(
    path: &Path,
    array: ArrayView<C::Inner, D>,
    leading_axes: usize,
) -> Result<(), ProcessingError>
where
    C: colortype::ColorType,
    C::Inner: Clone + Default,
    [C::Inner]: TiffValue,
    D: Dimension,
{
    let mut writer = BufWriter::new(File::create(path)?);
    encode_volume::<_, C, D>(&mut writer, array, leading_axes)?;
    writer.flush()?;
    Ok(())
}
