//! Frame types and the materializer that turns OS pixel buffers into packed
//! BGRA frames.
//!
//! The OS hands over a [`RawFrame`]: a borrowed buffer whose rows may be padded
//! (`row_pitch > width * 4`) and whose channel order may differ from BGRA. The
//! materializer compacts and normalizes it into an owned [`Frame`] in a single
//! pass over the rows. Consumers receive either the shared [`Frame`] published
//! by the session or an independent [`FrameBuffer`] copy.
use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::{ParallelSlice, ParallelSliceMut};

use crate::settings::ColorFormat;

/// Bytes per pixel of every published frame.
pub const BYTES_PER_PIXEL: usize = 4;

/// Errors raised while validating or materializing a frame.
#[derive(thiserror::Error, Eq, PartialEq, Clone, Debug)]
pub enum Error {
    #[error("Invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("Row pitch of {row_pitch} bytes is smaller than one row of {row_bytes} bytes")]
    InvalidRowPitch { row_pitch: usize, row_bytes: usize },
    #[error("Frame buffer holds {actual} bytes but {expected} are required")]
    BufferSizeMismatch { expected: usize, actual: usize },
}

/// A single pixel in BGRA order.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Bgra {
    pub b: u8,
    pub g: u8,
    pub r: u8,
    pub a: u8,
}

/// Pixel buffer borrowed from the OS for the duration of one frame callback.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    row_pitch: usize,
    format: ColorFormat,
}

impl<'a> RawFrame<'a> {
    /// Wraps an OS buffer.
    ///
    /// `row_pitch` is the distance in bytes between the start of two rows. The
    /// last row is allowed to stop right after its pixels, mapped GPU textures
    /// are not required to carry trailing padding.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the size is zero, the pitch cannot hold one row or
    /// the buffer is too short for `height` rows.
    #[inline]
    pub fn new(data: &'a [u8], width: u32, height: u32, row_pitch: usize, format: ColorFormat) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSize { width, height });
        }

        let row_bytes = width as usize * BYTES_PER_PIXEL;
        if row_pitch < row_bytes {
            return Err(Error::InvalidRowPitch { row_pitch, row_bytes });
        }

        let expected = (height as usize - 1) * row_pitch + row_bytes;
        if data.len() < expected {
            return Err(Error::BufferSizeMismatch { expected, actual: data.len() });
        }

        Ok(Self { data, width, height, row_pitch, format })
    }

    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    #[inline]
    pub const fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    #[must_use]
    #[inline]
    pub const fn format(&self) -> ColorFormat {
        self.format
    }

    /// Checks if the rows carry alignment padding.
    #[must_use]
    #[inline]
    pub const fn has_padding(&self) -> bool {
        self.row_pitch != self.width as usize * BYTES_PER_PIXEL
    }

    /// Size in bytes of the packed BGRA output.
    #[must_use]
    #[inline]
    pub const fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Packs the frame into a new BGRA buffer.
    #[must_use]
    pub fn materialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.packed_len());
        self.materialize_into(&mut buffer);
        buffer
    }

    /// Packs the frame into `buffer`, reusing its allocation.
    ///
    /// On return `buffer` holds exactly `height * width * 4` bytes in BGRA order.
    pub fn materialize_into(&self, buffer: &mut Vec<u8>) {
        let len = self.packed_len();
        buffer.clear();

        if !self.has_padding() && self.format == ColorFormat::Bgra8 {
            buffer.extend_from_slice(&self.data[..len]);
            return;
        }

        buffer.resize(len, 0);

        let row_bytes = self.width as usize * BYTES_PER_PIXEL;
        let format = self.format;
        buffer
            .par_chunks_exact_mut(row_bytes)
            .zip(self.data.par_chunks(self.row_pitch))
            .for_each(|(dst, src)| {
                dst.copy_from_slice(&src[..row_bytes]);

                if format == ColorFormat::Rgba8 {
                    for pixel in dst.chunks_exact_mut(BYTES_PER_PIXEL) {
                        pixel.swap(0, 2);
                    }
                }
            });
    }
}

/// A packed BGRA frame as published by a capture session.
///
/// Frames are immutable once published and shared through `Arc`, so a frame
/// obtained from [`crate::capture::Capture::frame`] stays readable after newer
/// frames replace it.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Frame {
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u64,
}

impl Frame {
    /// Creates an unpublished frame from a packed BGRA buffer.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the size is zero or `buffer` is not exactly
    /// `height * width * 4` bytes long.
    #[inline]
    pub fn new(buffer: Vec<u8>, width: u32, height: u32) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSize { width, height });
        }

        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if buffer.len() != expected {
            return Err(Error::BufferSizeMismatch { expected, actual: buffer.len() });
        }

        Ok(Self { buffer, width, height, sequence: 0 })
    }

    #[inline]
    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Publication number assigned by the frame slot, `0` if never published.
    #[must_use]
    #[inline]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes per row. Published frames carry no padding.
    #[must_use]
    #[inline]
    pub const fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    #[must_use]
    #[inline]
    pub const fn format(&self) -> ColorFormat {
        ColorFormat::Bgra8
    }

    /// `(height, width, 4)`, the row-major layout of [`Self::as_bytes`].
    #[must_use]
    #[inline]
    pub const fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, BYTES_PER_PIXEL)
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Bgra> {
        pixel_at(&self.buffer, self.width, self.height, x, y)
    }

    /// Copies the frame into a consumer-owned buffer.
    #[must_use]
    #[inline]
    pub fn to_buffer(&self) -> FrameBuffer {
        FrameBuffer { data: self.buffer.clone(), width: self.width, height: self.height }
    }

    #[inline]
    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Consumer-owned copy of a frame, independent of the session's storage.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl FrameBuffer {
    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// `(height, width, 4)`.
    #[must_use]
    #[inline]
    pub const fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, BYTES_PER_PIXEL)
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    #[inline]
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Bgra> {
        pixel_at(&self.data, self.width, self.height, x, y)
    }

    #[must_use]
    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<FrameBuffer> for Vec<u8> {
    #[inline]
    fn from(value: FrameBuffer) -> Self {
        value.data
    }
}

fn pixel_at(buffer: &[u8], width: u32, height: u32, x: u32, y: u32) -> Option<Bgra> {
    if x >= width || y >= height {
        return None;
    }

    let index = (y as usize * width as usize + x as usize) * BYTES_PER_PIXEL;
    let pixel = buffer.get(index..index + BYTES_PER_PIXEL)?;
    Some(Bgra { b: pixel[0], g: pixel[1], r: pixel[2], a: pixel[3] })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // Two rows of two pixels with four bytes of padding after each row.
    const PADDED_RGBA: [u8; 24] = [
        1, 2, 3, 4, 5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE, //
        9, 10, 11, 12, 13, 14, 15, 16, 0xEE, 0xEE, 0xEE, 0xEE,
    ];

    #[test]
    fn rejects_pitch_shorter_than_row() {
        let data = [0u8; 16];
        let err = RawFrame::new(&data, 2, 2, 4, ColorFormat::Bgra8).unwrap_err();

        assert_eq!(err, Error::InvalidRowPitch { row_pitch: 4, row_bytes: 8 });
    }

    #[test]
    fn rejects_truncated_buffer() {
        let data = [0u8; 15];
        let err = RawFrame::new(&data, 2, 2, 8, ColorFormat::Bgra8).unwrap_err();

        assert_eq!(err, Error::BufferSizeMismatch { expected: 16, actual: 15 });
    }

    #[test]
    fn rejects_empty_frame() {
        assert_eq!(
            RawFrame::new(&[], 0, 10, 0, ColorFormat::Bgra8).unwrap_err(),
            Error::InvalidSize { width: 0, height: 10 }
        );
    }

    #[test]
    fn last_row_may_omit_padding() {
        let raw = RawFrame::new(&PADDED_RGBA[..20], 2, 2, 12, ColorFormat::Bgra8).unwrap();

        assert_eq!(raw.materialize(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
    }

    #[test]
    fn compacts_padded_bgra_rows() {
        let raw = RawFrame::new(&PADDED_RGBA, 2, 2, 12, ColorFormat::Bgra8).unwrap();

        assert!(raw.has_padding());
        assert_eq!(raw.materialize(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
    }

    #[test]
    fn swaps_red_and_blue_for_rgba_sources() {
        let raw = RawFrame::new(&PADDED_RGBA, 2, 2, 12, ColorFormat::Rgba8).unwrap();

        assert_eq!(raw.materialize(), vec![3, 2, 1, 4, 7, 6, 5, 8, 11, 10, 9, 12, 15, 14, 13, 16]);
    }

    #[test]
    fn reuses_the_destination_allocation() {
        let raw = RawFrame::new(&PADDED_RGBA, 2, 2, 12, ColorFormat::Bgra8).unwrap();
        let mut buffer = vec![0xAA; 64];
        let capacity = buffer.capacity();

        raw.materialize_into(&mut buffer);

        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn frame_requires_exact_packed_size() {
        assert_eq!(
            Frame::new(vec![0; 15], 2, 2).unwrap_err(),
            Error::BufferSizeMismatch { expected: 16, actual: 15 }
        );
    }

    #[test]
    fn frame_reports_shape_and_pixels() {
        let frame = Frame::new((0..24).collect(), 3, 2).unwrap();

        assert_eq!(frame.shape(), (2, 3, 4));
        assert_eq!(frame.stride(), 12);
        assert_eq!(frame.pixel(1, 1), Some(Bgra { b: 16, g: 17, r: 18, a: 19 }));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn buffer_copy_is_independent() {
        let frame = Frame::new(vec![7; 16], 2, 2).unwrap();
        let mut copy = frame.to_buffer();

        copy.as_mut_bytes()[0] = 0;

        assert_eq!(frame.as_bytes()[0], 7);
        assert_eq!(copy.shape(), frame.shape());
    }

    proptest! {
        #[test]
        fn packed_output_matches_source_rows(
            width in 1u32..24,
            height in 1u32..24,
            padding in 0usize..32,
            seed in any::<u8>(),
        ) {
            let row_bytes = width as usize * BYTES_PER_PIXEL;
            let row_pitch = row_bytes + padding;
            let data: Vec<u8> = (0..row_pitch * height as usize)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();

            let raw = RawFrame::new(&data, width, height, row_pitch, ColorFormat::Bgra8).unwrap();
            let packed = raw.materialize();

            prop_assert_eq!(packed.len(), raw.packed_len());
            for (y, row) in packed.chunks_exact(row_bytes).enumerate() {
                let start = y * row_pitch;
                prop_assert_eq!(row, &data[start..start + row_bytes]);
            }
        }
    }
}
