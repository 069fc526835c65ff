//! Keyed blob-store collaborator
//!
//! The engine consumes packaged assets through two operations: `open`
//! returning a readable byte stream and `stat` returning the blob size.
//! Texture blobs carry a small binary header followed by raw mip data in
//! descending level order; everything else (vertex data, index data,
//! compiled shaders) is opaque bytes.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by pack access and blob decoding.
#[derive(Debug, Error)]
pub enum PackError {
    /// No blob exists under the requested name
    #[error("no pack entry named '{0}'")]
    NotFound(String),

    /// The underlying store failed
    #[error("pack i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A blob header was malformed
    #[error("malformed blob: {0}")]
    Malformed(&'static str),
}

/// Metadata for a single pack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackEntry {
    /// Size of the blob in bytes
    pub size: u64,
}

/// A readable blob stream.
pub trait PackStream: Read + Send {}

impl<T: Read + Send> PackStream for T {}

/// A named, keyed blob store.
pub trait Pack: Send + Sync {
    /// Opens the named blob for reading.
    fn open(&self, name: &str) -> Result<Box<dyn PackStream>, PackError>;

    /// Returns metadata for the named blob.
    fn stat(&self, name: &str) -> Result<PackEntry, PackError>;
}

/// Pack implementation backed by a directory tree, mapping entry names to
/// relative file paths. Used by the tools and in tests; a production pack
/// file satisfies the same trait.
pub struct DirectoryPack {
    root: PathBuf,
}

impl DirectoryPack {
    /// Creates a pack rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }
}

impl Pack for DirectoryPack {
    fn open(&self, name: &str) -> Result<Box<dyn PackStream>, PackError> {
        let file = File::open(self.entry_path(name))
            .map_err(|_| PackError::NotFound(name.to_owned()))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn stat(&self, name: &str) -> Result<PackEntry, PackError> {
        let metadata = std::fs::metadata(self.entry_path(name))
            .map_err(|_| PackError::NotFound(name.to_owned()))?;
        Ok(PackEntry {
            size: metadata.len(),
        })
    }
}

/// Texture blob pixel format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// BC1 block compression, sRGB
    Bc1Srgb,
    /// BC3 block compression, sRGB + alpha
    Bc3Srgba,
    /// BC5 two-channel block compression
    Bc5Unorm,
    /// Uncompressed two-channel
    RgUnorm,
    /// Uncompressed four-channel
    RgbaUnorm,
    /// BC7 block compression, sRGB
    Bc7Srgb,
}

impl ImageFormat {
    fn from_byte(byte: u8) -> Result<Self, PackError> {
        match byte {
            0 => Ok(Self::Bc1Srgb),
            1 => Ok(Self::Bc3Srgba),
            2 => Ok(Self::Bc5Unorm),
            3 => Ok(Self::RgUnorm),
            4 => Ok(Self::RgbaUnorm),
            5 => Ok(Self::Bc7Srgb),
            _ => Err(PackError::Malformed("unknown image format code")),
        }
    }

    /// Bytes per block for compressed formats, per texel otherwise.
    pub fn unit_size(self) -> u32 {
        match self {
            Self::Bc1Srgb => 8,
            Self::Bc3Srgba | Self::Bc5Unorm | Self::Bc7Srgb => 16,
            Self::RgUnorm => 2,
            Self::RgbaUnorm => 4,
        }
    }

    /// Whether the format is 4x4 block compressed.
    pub fn is_block_compressed(self) -> bool {
        matches!(self, Self::Bc1Srgb | Self::Bc3Srgba | Self::Bc5Unorm | Self::Bc7Srgb)
    }

    /// Byte size of one mip level with the given extent.
    pub fn mip_size(self, width: u32, height: u32) -> u32 {
        if self.is_block_compressed() {
            ((width + 3) / 4) * ((height + 3) / 4) * self.unit_size()
        } else {
            width * height * self.unit_size()
        }
    }
}

/// Texture sampling filter stored in the blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFilter {
    /// Nearest-texel sampling
    Nearest,
    /// Linear interpolation
    Linear,
}

impl ImageFilter {
    fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Self::Nearest
        } else {
            Self::Linear
        }
    }
}

/// Texture wrap mode stored in the blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageWrapMode {
    /// Repeat the texture
    Repeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

impl ImageWrapMode {
    fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Self::Repeat
        } else {
            Self::ClampToEdge
        }
    }
}

/// Decoded texture blob header; the mip bytes follow it in the stream.
#[derive(Debug, Clone, Copy)]
pub struct TextureHeader {
    /// Pixel format of every mip level
    pub format: ImageFormat,
    /// Magnification filter
    pub mag_filter: ImageFilter,
    /// Minification filter
    pub min_filter: ImageFilter,
    /// Wrap mode along U
    pub wrap_u: ImageWrapMode,
    /// Wrap mode along V
    pub wrap_v: ImageWrapMode,
    /// Width of mip 0
    pub width: u32,
    /// Height of mip 0
    pub height: u32,
    /// Number of mip levels present
    pub mip_count: u32,
}

impl TextureHeader {
    /// Decodes a texture blob header from the front of a stream.
    pub fn decode(stream: &mut dyn Read) -> Result<Self, PackError> {
        let format = ImageFormat::from_byte(read_byte(stream)?)?;
        let mag_filter = ImageFilter::from_byte(read_byte(stream)?);
        let min_filter = ImageFilter::from_byte(read_byte(stream)?);
        let wrap_u = ImageWrapMode::from_byte(read_byte(stream)?);
        let wrap_v = ImageWrapMode::from_byte(read_byte(stream)?);
        let width = read_varint(stream)?;
        let height = read_varint(stream)?;
        let mip_count = read_varint(stream)?;
        if width == 0 || height == 0 || mip_count == 0 {
            return Err(PackError::Malformed("degenerate texture extent"));
        }
        if mip_count > 16 {
            return Err(PackError::Malformed("implausible mip count"));
        }
        Ok(Self {
            format,
            mag_filter,
            min_filter,
            wrap_u,
            wrap_v,
            width,
            height,
            mip_count,
        })
    }
}

fn read_byte(stream: &mut dyn Read) -> Result<u8, PackError> {
    let mut byte = [0u8];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Reads an LEB128 variable-length unsigned integer.
pub fn read_varint(stream: &mut dyn Read) -> Result<u32, PackError> {
    let mut value = 0u32;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(stream)?;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 32 {
            return Err(PackError::Malformed("varint too long"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn varint_bytes(mut value: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            bytes.push(byte);
            if value == 0 {
                return bytes;
            }
        }
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 65535, u32::MAX] {
            let mut cursor = Cursor::new(varint_bytes(value));
            assert_eq!(read_varint(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn texture_header_decode() {
        let mut blob = vec![5u8, 1, 1, 0, 0];
        blob.extend(varint_bytes(1024));
        blob.extend(varint_bytes(512));
        blob.extend(varint_bytes(11));
        let header = TextureHeader::decode(&mut Cursor::new(blob)).unwrap();
        assert_eq!(header.format, ImageFormat::Bc7Srgb);
        assert_eq!(header.mag_filter, ImageFilter::Linear);
        assert_eq!(header.wrap_u, ImageWrapMode::Repeat);
        assert_eq!((header.width, header.height, header.mip_count), (1024, 512, 11));
    }

    #[test]
    fn block_compressed_mip_sizes() {
        // BC1 consumes 8 bytes per 4x4 block and rounds partial blocks up.
        assert_eq!(ImageFormat::Bc1Srgb.mip_size(8, 8), 32);
        assert_eq!(ImageFormat::Bc1Srgb.mip_size(1, 1), 8);
        assert_eq!(ImageFormat::RgbaUnorm.mip_size(2, 2), 16);
    }

    #[test]
    fn unknown_format_rejected() {
        let blob = vec![9u8, 0, 0, 0, 0, 1, 1, 1];
        assert!(TextureHeader::decode(&mut Cursor::new(blob)).is_err());
    }
}
