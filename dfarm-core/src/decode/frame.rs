//! Decoded video frames.

/// A decoded YUV420P frame: three planes with per-plane strides.
///
/// This is exactly the shape handed to frame consumers:
/// `(width, height, plane 0, plane 1, plane 2, stride 0, stride 1, stride 2)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Y, U, V plane buffers.
    pub planes: [Vec<u8>; 3],
    /// Bytes per row for each plane.
    pub strides: [usize; 3],
}

impl VideoFrame {
    /// An empty frame holding no allocation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resize the frame for the given geometry, reusing allocations
    /// where possible. Chroma planes are half resolution (4:2:0).
    pub fn reset_for(&mut self, width: u32, height: u32) {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        self.width = width;
        self.height = height;
        self.strides = [w, cw, cw];
        self.planes[0].resize(w * h, 0);
        self.planes[1].resize(cw * ch, 0);
        self.planes[2].resize(cw * ch, 0);
    }

    /// Total pixel-data length across all planes.
    pub fn payload_len(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }

    /// Whether the frame holds decoded pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Copy pixel data and geometry from another frame, reusing this
    /// frame's allocations.
    pub fn copy_from(&mut self, src: &VideoFrame) {
        self.width = src.width;
        self.height = src.height;
        self.strides = src.strides;
        for (dst, s) in self.planes.iter_mut().zip(&src.planes) {
            dst.clear();
            dst.extend_from_slice(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_sizes_planes_for_yuv420() {
        let mut f = VideoFrame::empty();
        f.reset_for(640, 480);
        assert_eq!(f.planes[0].len(), 640 * 480);
        assert_eq!(f.planes[1].len(), 320 * 240);
        assert_eq!(f.planes[2].len(), 320 * 240);
        assert_eq!(f.strides, [640, 320, 320]);
        assert_eq!(f.payload_len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let mut f = VideoFrame::empty();
        f.reset_for(101, 57);
        assert_eq!(f.planes[1].len(), 51 * 29);
    }

    #[test]
    fn copy_from_transfers_geometry_and_pixels() {
        let mut src = VideoFrame::empty();
        src.reset_for(4, 4);
        src.planes[0][0] = 0xAB;

        let mut dst = VideoFrame::empty();
        dst.copy_from(&src);
        assert_eq!(dst.width, 4);
        assert_eq!(dst.planes[0][0], 0xAB);
    }
}
