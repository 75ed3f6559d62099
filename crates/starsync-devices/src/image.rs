/*!
 * Binary image payload decoding.
 *
 * Alpaca cameras return captured frames in the `application/imagebytes`
 * representation: a 44-byte little-endian header followed by the raw pixel
 * buffer. Every declared dimension is validated against the buffer length
 * before an image is exposed to observers; a payload that fails validation
 * never produces a partial [`ImageData`].
 */
use bytes::Bytes;

use crate::device::{DeviceError, Result};

/// Byte offset of the pixel data when the server uses the minimal header
const HEADER_LEN: usize = 44;

/// Pixel element type declared in an ImageBytes header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageElementType {
    /// Unsigned 8-bit integer
    Byte,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// 64-bit float
    Double,
}

impl ImageElementType {
    fn from_wire(code: i32) -> Result<Self> {
        // Transmission element type codes from the ImageBytes metadata
        match code {
            6 => Ok(ImageElementType::Byte),
            1 => Ok(ImageElementType::Int16),
            8 => Ok(ImageElementType::UInt16),
            2 => Ok(ImageElementType::Int32),
            3 => Ok(ImageElementType::Double),
            other => Err(DeviceError::decode(format!(
                "unsupported image element type {}",
                other
            ))),
        }
    }

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            ImageElementType::Byte => 1,
            ImageElementType::Int16 | ImageElementType::UInt16 => 2,
            ImageElementType::Int32 => 4,
            ImageElementType::Double => 8,
        }
    }
}

/// Decoded pixel buffer
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// Unsigned 8-bit pixels
    U8(Vec<u8>),
    /// Signed 16-bit pixels
    I16(Vec<i16>),
    /// Unsigned 16-bit pixels
    U16(Vec<u16>),
    /// Signed 32-bit pixels
    I32(Vec<i32>),
    /// 64-bit float pixels
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Number of pixel elements
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::I16(v) => v.len(),
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::I32(v) => v.len(),
            PixelBuffer::F64(v) => v.len(),
        }
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fully validated captured image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    /// Element type of the pixel data
    pub element_type: ImageElementType,
    /// Array rank: 2 for mono, 3 for color planes
    pub rank: u32,
    /// Declared dimensions; unused trailing dimensions are zero
    pub dimensions: [u32; 3],
    /// The pixel data
    pub pixels: PixelBuffer,
}

impl ImageData {
    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.dimensions[0]
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.dimensions[1]
    }

    /// Number of color planes (1 for mono)
    pub fn channels(&self) -> u32 {
        if self.rank == 3 {
            self.dimensions[2]
        } else {
            1
        }
    }
}

fn read_i32(payload: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Decode an ImageBytes payload
///
/// Header layout (little-endian): metadata version, error number, client
/// transaction id, server transaction id, data start, image element type,
/// transmission element type, rank, then three dimensions.
pub fn decode_image(action: &str, payload: &Bytes) -> Result<ImageData> {
    if payload.len() < HEADER_LEN {
        return Err(DeviceError::decode(format!(
            "payload of {} bytes is shorter than the {}-byte header",
            payload.len(),
            HEADER_LEN
        )));
    }

    let metadata_version = read_i32(payload, 0);
    if metadata_version != 1 {
        return Err(DeviceError::decode(format!(
            "unsupported metadata version {}",
            metadata_version
        )));
    }

    let error_number = read_i32(payload, 4);
    let data_start = read_i32(payload, 16);
    if data_start < 0 || (data_start as usize) < HEADER_LEN || (data_start as usize) > payload.len()
    {
        return Err(DeviceError::decode(format!(
            "data start {} outside payload of {} bytes",
            data_start,
            payload.len()
        )));
    }

    if error_number != 0 {
        // After the header the payload carries the UTF-8 error string
        let message = String::from_utf8_lossy(&payload[data_start as usize..]).to_string();
        return Err(DeviceError::protocol(
            action,
            format!("{} ({})", message, error_number),
        ));
    }

    let transmission_type = ImageElementType::from_wire(read_i32(payload, 24))?;
    let rank = read_u32(payload, 28);
    if !(rank == 2 || rank == 3) {
        return Err(DeviceError::decode(format!("unsupported rank {}", rank)));
    }

    let dimensions = [
        read_u32(payload, 32),
        read_u32(payload, 36),
        read_u32(payload, 40),
    ];
    let declared: u64 = match rank {
        2 => u64::from(dimensions[0]) * u64::from(dimensions[1]),
        _ => u64::from(dimensions[0]) * u64::from(dimensions[1]) * u64::from(dimensions[2]),
    };

    let data = &payload[data_start as usize..];
    let element_size = transmission_type.size() as u64;
    if declared * element_size != data.len() as u64 {
        return Err(DeviceError::decode(format!(
            "declared {}x{}x{} elements of {} bytes but buffer holds {} bytes",
            dimensions[0],
            dimensions[1],
            dimensions[2],
            element_size,
            data.len()
        )));
    }

    let count = declared as usize;
    let pixels = match transmission_type {
        ImageElementType::Byte => PixelBuffer::U8(data.to_vec()),
        ImageElementType::Int16 => PixelBuffer::I16(
            (0..count)
                .map(|i| i16::from_le_bytes([data[i * 2], data[i * 2 + 1]]))
                .collect(),
        ),
        ImageElementType::UInt16 => PixelBuffer::U16(
            (0..count)
                .map(|i| u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]))
                .collect(),
        ),
        ImageElementType::Int32 => PixelBuffer::I32(
            (0..count).map(|i| read_i32(data, i * 4)).collect(),
        ),
        ImageElementType::Double => PixelBuffer::F64(
            (0..count)
                .map(|i| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data[i * 8..i * 8 + 8]);
                    f64::from_le_bytes(raw)
                })
                .collect(),
        ),
    };

    Ok(ImageData {
        element_type: transmission_type,
        rank,
        dimensions,
        pixels,
    })
}

/// Convert a mono or RGB image to RGBA display pixels using a LUT
///
/// The lookup table maps source intensity to display intensity; values past
/// the end of the table render black. Supported sources are u8 and u16
/// pixel buffers with 1 or 3 channels.
pub fn to_display_rgba(image: &ImageData, lut: &[u8]) -> Result<Vec<u8>> {
    let channels = image.channels();
    if !(channels == 1 || channels == 3) {
        return Err(DeviceError::decode(format!(
            "cannot display image with {} channels",
            channels
        )));
    }

    let pixel_count = image.width() as usize * image.height() as usize;
    let mut output = vec![0u8; pixel_count * 4];

    let lookup = |value: usize| lut.get(value).copied().unwrap_or(0);

    match &image.pixels {
        PixelBuffer::U8(data) => {
            fill_rgba(&mut output, pixel_count, channels as usize, |idx| {
                lookup(data[idx] as usize)
            });
        }
        PixelBuffer::U16(data) => {
            fill_rgba(&mut output, pixel_count, channels as usize, |idx| {
                lookup(data[idx] as usize)
            });
        }
        other => {
            return Err(DeviceError::decode(format!(
                "no display conversion for {:?} pixels",
                std::mem::discriminant(other)
            )));
        }
    }

    Ok(output)
}

fn fill_rgba<F>(output: &mut [u8], pixel_count: usize, channels: usize, source: F)
where
    F: Fn(usize) -> u8,
{
    if channels == 1 {
        for idx in 0..pixel_count {
            let tgt = idx * 4;
            let display = source(idx);
            output[tgt] = display;
            output[tgt + 1] = display;
            output[tgt + 2] = display;
            output[tgt + 3] = 255;
        }
    } else {
        for idx in 0..pixel_count {
            let base = idx * 3;
            let tgt = idx * 4;
            output[tgt] = source(base);
            output[tgt + 1] = source(base + 1);
            output[tgt + 2] = source(base + 2);
            output[tgt + 3] = 255;
        }
    }
}
