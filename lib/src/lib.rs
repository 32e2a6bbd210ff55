//! This library provides the two pieces of a display server that have to
//! reason about concurrency and resource lifetimes:
//!
//! * The `swapchain` module provides `BufferQueue`, a bounded pool of graphics
//!   buffers that hands buffers back and forth between one producer (usually a
//!   client rendering into the buffer) and one consumer (the compositor). The
//!   ownership of each buffer is tracked so that no buffer is ever written to
//!   while it is being composited, and the compositor always picks the most
//!   recently completed frame.
//!
//! * The `dispatch` module provides the `Multiplexer`, a level-triggered reactor
//!   built on top of epoll that watches any number of `Dispatchable` sources
//!   and invokes their handlers sequentially from a single thread, as well as
//!   the `ActionQueue` that lets any thread defer work to that reactor thread.
//!
//! The `input` module defines the narrow interface through which device
//! adapters feed decoded input events to the rest of the server, and the
//! `report` module the diagnostics interface every subsystem reports its
//! errors to.
//!
//! Buffer allocation, rendering and device decoding are left to collaborators
//! implementing the traits exposed here.
pub mod dispatch;
pub mod input;
pub mod report;
pub mod swapchain;

use std::fmt;

/// A Fourcc pixel format, as used to describe the layout of a graphics
/// buffer. It can be converted back and forth from a 32-bit integer, or a
/// 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 32-bit RGB with unused alpha, in `[B, G, R, X]` byte order.
    pub const XRGB8888: PixelFormat = PixelFormat::from_fourcc(b"XR24");
    /// 32-bit RGB with alpha, in `[B, G, R, A]` byte order.
    pub const ARGB8888: PixelFormat = PixelFormat::from_fourcc(b"AR24");
    /// 32-bit BGR with unused alpha, in `[R, G, B, X]` byte order.
    pub const XBGR8888: PixelFormat = PixelFormat::from_fourcc(b"XB24");
    /// 32-bit BGR with alpha, in `[R, G, B, A]` byte order.
    pub const ABGR8888: PixelFormat = PixelFormat::from_fourcc(b"AB24");
    /// 24-bit packed RGB.
    pub const RGB888: PixelFormat = PixelFormat::from_fourcc(b"RG24");
    /// 16-bit RGB 5:6:5.
    pub const RGB565: PixelFormat = PixelFormat::from_fourcc(b"RG16");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the number of bytes a single pixel takes in this format, if
    /// the format is a known single-plane RGB format.
    ///
    /// # Examples
    ///
    /// ```
    /// # use swapr::PixelFormat;
    /// assert_eq!(PixelFormat::XRGB8888.bytes_per_pixel(), Some(4));
    /// assert_eq!(PixelFormat::from(b"NV12").bytes_per_pixel(), None);
    /// ```
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::XRGB8888 | Self::ARGB8888 | Self::XBGR8888 | Self::ABGR8888 => Some(4),
            Self::RGB888 => Some(3),
            Self::RGB565 => Some(2),
            _ => None,
        }
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use swapr::PixelFormat;
/// // Fourcc representation of XR24.
/// let xrgb = u32::from_le(0x34325258);
/// let f = PixelFormat::from(xrgb);
/// assert_eq!(u32::from(f), xrgb);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"XR24") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use swapr::PixelFormat;
/// let f = PixelFormat::from(b"XR24");
/// assert_eq!(f, PixelFormat::XRGB8888);
/// assert_eq!(&<[u8; 4]>::from(f), b"XR24");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use swapr::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::XRGB8888), "0x34325258 (XR24)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Dimensions of a buffer, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Position on the output, in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// How the contents of a buffer are going to be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferUsage {
    /// Written by the CPU.
    #[default]
    Software,
    /// Rendered into by a GPU.
    Hardware,
}

/// What the buffers of a queue look like. Passed to the allocator every time
/// a new buffer is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferProperties {
    pub size: Size,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl BufferProperties {
    pub const fn new(size: Size, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            size,
            format,
            usage,
        }
    }

    /// Returns the number of bytes per line of a tightly-packed buffer with
    /// these properties, if the pixel format is known.
    ///
    /// # Examples
    ///
    /// ```
    /// # use swapr::{BufferProperties, BufferUsage, PixelFormat, Size};
    /// let props = BufferProperties::new(
    ///     Size::new(640, 480),
    ///     PixelFormat::XRGB8888,
    ///     BufferUsage::Software,
    /// );
    /// assert_eq!(props.stride(), Some(2560));
    /// assert_eq!(props.frame_size(), Some(2560 * 480));
    /// ```
    pub fn stride(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| bpp * self.size.width as usize)
    }

    /// Returns the number of bytes a tightly-packed frame with these
    /// properties takes, if the pixel format is known.
    pub fn frame_size(&self) -> Option<usize> {
        self.stride().map(|stride| stride * self.size.height as usize)
    }
}
