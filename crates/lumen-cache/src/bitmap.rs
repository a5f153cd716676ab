//! Pixel Buffers
//!
//! The decoded payload type shared by the memory cache and the bitmap pool.

/// Pixel layout of a decoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8 bits per channel RGBA
    #[default]
    Rgba8888,
    /// 16-bit packed RGB
    Rgb565,
    /// Alpha-only mask
    Alpha8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Alpha8 => 1,
        }
    }
}

/// Dimensions and format of a buffer, used as the pooling bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl BufferShape {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Bytes a buffer of this shape occupies
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// A decoded pixel buffer
///
/// Treated as immutable once published into a `CountedBitmap`; the
/// `mutable` flag only gates whether the pool may hand it out for reuse.
#[derive(Debug)]
pub struct PixelBuffer {
    /// Raw pixel data in `format` layout
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    mutable: bool,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let shape = BufferShape::new(width, height, format);
        Self {
            data: vec![0; shape.byte_size()],
            width,
            height,
            format,
            mutable: true,
        }
    }

    /// Wrap decoded pixel data
    ///
    /// The data is padded or truncated to the exact size the shape requires.
    pub fn from_data(mut data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        let expected = BufferShape::new(width, height, format).byte_size();
        data.resize(expected, 0);
        Self {
            data,
            width,
            height,
            format,
            mutable: true,
        }
    }

    /// Mark the buffer as immutable, making it ineligible for pool reuse
    pub fn freeze(&mut self) {
        self.mutable = false;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Pixel data in `format` layout
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Pooling bucket key for this buffer
    pub fn shape(&self) -> BufferShape {
        BufferShape::new(self.width, self.height, self.format)
    }

    /// Zero the pixel data before handing the buffer out for reuse
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}
