//! Firmware images: Intel hex loading, layout checks and padding.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::protocol::CHUNK_LEN;

/// Largest image the 16-bit START length can describe
pub const MAX_IMAGE_LEN: usize = u16::MAX as usize;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ImageError {
    #[error("unable to read image file: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("invalid hex file: {0}")]
    Parse(String),

    #[error("image contains no data")]
    Empty,

    #[error("more than one segment in hex file ({0} found)")]
    Segments(usize),

    #[error("image segment does not start at address 0 (starts at 0x{0:08X})")]
    Base(u32),

    #[error("image length {0} does not fit the 16-bit START length")]
    TooLarge(usize),
}

/// Contiguous run of addressed bytes
#[derive(Clone, PartialEq, Debug)]
pub struct Segment {
    pub start: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// First address past the segment
    pub fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }
}

/// Contents of an Intel hex file, grouped into contiguous segments.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct HexImage {
    segments: Vec<Segment>,
}

impl HexImage {
    /// Parse Intel hex text
    pub fn parse(text: &str) -> Result<Self, ImageError> {
        let mut bytes = BTreeMap::new();
        let mut base = 0u32;

        for record in ihex::Reader::new(text) {
            match record.map_err(|e| ImageError::Parse(e.to_string()))? {
                ihex::Record::Data { offset, value } => {
                    let start = base.wrapping_add(offset as u32);
                    for (i, v) in value.into_iter().enumerate() {
                        bytes.insert(start.wrapping_add(i as u32), v);
                    }
                }
                ihex::Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                ihex::Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
                ihex::Record::EndOfFile => break,
                other => trace!("Ignoring hex record: {:?}", other),
            }
        }

        let mut segments: Vec<Segment> = Vec::new();
        for (addr, value) in bytes {
            match segments.last_mut() {
                Some(s) if s.end() == addr as u64 => s.data.push(value),
                _ => segments.push(Segment {
                    start: addr,
                    data: vec![value],
                }),
            }
        }

        Ok(Self { segments })
    }

    /// Read and parse an Intel hex file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let text = std::fs::read_to_string(path).map_err(|e| ImageError::Io(e.kind()))?;
        Self::parse(&text)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Extract the single segment at address 0 that the boot loader can load
    pub fn into_single_segment(mut self) -> Result<Vec<u8>, ImageError> {
        match self.segments.len() {
            0 => Err(ImageError::Empty),
            1 => {
                let segment = self.segments.remove(0);
                if segment.start != 0 {
                    return Err(ImageError::Base(segment.start));
                }
                Ok(segment.data)
            }
            n => Err(ImageError::Segments(n)),
        }
    }
}

/// How an image is extended to a whole number of DATA chunks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Padding {
    /// Pad to the next multiple of 8, aligned images are left untouched
    Align,
    /// Always append `8 - len % 8` bytes, so aligned images gain a full zero
    /// block. Matches images loaded by earlier versions of the loader.
    FullBlock,
}

impl Default for Padding {
    fn default() -> Self {
        Padding::Align
    }
}

impl Padding {
    /// Number of zero bytes appended to an image of `len` bytes
    pub fn pad_len(self, len: usize) -> usize {
        let remainder = len % CHUNK_LEN;
        match self {
            Padding::Align => (CHUNK_LEN - remainder) % CHUNK_LEN,
            Padding::FullBlock => CHUNK_LEN - remainder,
        }
    }
}

impl FromStr for Padding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "align" => Ok(Padding::Align),
            "full-block" => Ok(Padding::FullBlock),
            _ => Err(format!("unknown padding policy '{}' (align, full-block)", s)),
        }
    }
}

/// Image ready for transfer: starts at 0, padded to whole chunks.
#[derive(Clone, PartialEq, Debug)]
pub struct Firmware {
    data: Vec<u8>,
    original_len: usize,
}

impl Firmware {
    /// Pad raw image bytes, checking the result still fits a START command
    pub fn new(mut data: Vec<u8>, padding: Padding) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }

        let original_len = data.len();
        let pad = padding.pad_len(original_len);
        data.resize(original_len + pad, 0);

        if data.len() > MAX_IMAGE_LEN {
            return Err(ImageError::TooLarge(data.len()));
        }

        debug!(
            "Image length {} padded by {} to {}",
            original_len,
            pad,
            data.len()
        );

        Ok(Self { data, original_len })
    }

    /// Check a parsed hex file holds one segment at address 0, then pad it
    pub fn from_hex(image: HexImage, padding: Padding) -> Result<Self, ImageError> {
        Self::new(image.into_single_segment()?, padding)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Padded length, as announced by START
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the image before padding
    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// DATA payloads in transfer order
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(CHUNK_LEN)
    }
}
