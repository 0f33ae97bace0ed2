//! Planar pixel buffers and stride-aware copying.
//!
//! Used to duplicate a captured frame into a freshly allocated buffer whose
//! row stride may differ from the source (local preview of an encrypted
//! stream, checks against the source frame).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanarError {
    #[error("image has no planes")]
    NoPlanes,
    #[error("plane {plane}: bytes per row {bytes_per_row} below width {width}")]
    StrideTooSmall {
        plane: usize,
        width: usize,
        bytes_per_row: usize,
    },
    #[error("buffer holds {actual} bytes, layout needs {required}")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("plane count mismatch: source {src}, destination {dst}")]
    PlaneCountMismatch { src: usize, dst: usize },
    #[error("plane {plane}: height mismatch, source {src}, destination {dst}")]
    HeightMismatch {
        plane: usize,
        src: usize,
        dst: usize,
    },
    #[error("layout size overflows usize")]
    Overflow,
}

type Result<T> = std::result::Result<T, PlanarError>;

/// Geometry of one plane. `width` is in bytes of visible content per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: usize,
    pub height: usize,
    pub bytes_per_row: usize,
}

impl PlaneLayout {
    pub fn new(width: usize, height: usize, bytes_per_row: usize) -> Self {
        Self {
            width,
            height,
            bytes_per_row,
        }
    }

    /// Tightly packed plane.
    pub fn packed(width: usize, height: usize) -> Self {
        Self::new(width, height, width)
    }

    fn byte_len(&self) -> Option<usize> {
        self.height.checked_mul(self.bytes_per_row)
    }
}

/// A contiguous buffer holding one or more planes back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarImage {
    planes: Vec<PlaneLayout>,
    offsets: Vec<usize>,
    data: Vec<u8>,
}

impl PlanarImage {
    /// Wraps existing pixel data. `data` may be longer than the layout needs.
    pub fn new(planes: Vec<PlaneLayout>, data: Vec<u8>) -> Result<Self> {
        let (offsets, required) = Self::plan(&planes)?;
        if data.len() < required {
            return Err(PlanarError::BufferTooSmall {
                required,
                actual: data.len(),
            });
        }
        Ok(Self {
            planes,
            offsets,
            data,
        })
    }

    /// Allocates a zeroed image with the given layout.
    pub fn allocate(planes: Vec<PlaneLayout>) -> Result<Self> {
        let (offsets, required) = Self::plan(&planes)?;
        Ok(Self {
            planes,
            offsets,
            data: vec![0u8; required],
        })
    }

    fn plan(planes: &[PlaneLayout]) -> Result<(Vec<usize>, usize)> {
        if planes.is_empty() {
            return Err(PlanarError::NoPlanes);
        }
        let mut offsets = Vec::with_capacity(planes.len());
        let mut total = 0usize;
        for (i, p) in planes.iter().enumerate() {
            if p.bytes_per_row < p.width {
                return Err(PlanarError::StrideTooSmall {
                    plane: i,
                    width: p.width,
                    bytes_per_row: p.bytes_per_row,
                });
            }
            offsets.push(total);
            let len = p.byte_len().ok_or(PlanarError::Overflow)?;
            total = total.checked_add(len).ok_or(PlanarError::Overflow)?;
        }
        Ok((offsets, total))
    }

    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let layout = self.planes.get(index)?;
        let start = self.offsets[index];
        self.data
            .get(start..start + layout.height * layout.bytes_per_row)
    }

    fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let layout = self.planes.get(index)?;
        let start = self.offsets[index];
        self.data
            .get_mut(start..start + layout.height * layout.bytes_per_row)
    }

    /// Row `y` of plane `index`, including stride padding.
    pub fn row(&self, index: usize, y: usize) -> Option<&[u8]> {
        let layout = self.planes.get(index)?;
        if y >= layout.height {
            return None;
        }
        let plane = self.plane(index)?;
        plane.get(y * layout.bytes_per_row..(y + 1) * layout.bytes_per_row)
    }

    /// Copies this image into a new buffer with `dst_planes` geometry.
    pub fn copy_with_layout(&self, dst_planes: Vec<PlaneLayout>) -> Result<PlanarImage> {
        let mut dst = PlanarImage::allocate(dst_planes)?;
        copy_planes(self, &mut dst)?;
        Ok(dst)
    }
}

/// Copies every plane of `src` into `dst`, row by row.
///
/// Each row copies `min(src.bytes_per_row, dst.bytes_per_row)` bytes; plane
/// counts and heights must match.
pub fn copy_planes(src: &PlanarImage, dst: &mut PlanarImage) -> Result<()> {
    if src.planes.len() != dst.planes.len() {
        return Err(PlanarError::PlaneCountMismatch {
            src: src.planes.len(),
            dst: dst.planes.len(),
        });
    }

    for index in 0..src.planes.len() {
        let s = src.planes[index];
        let d = dst.planes[index];
        if s.height != d.height {
            return Err(PlanarError::HeightMismatch {
                plane: index,
                src: s.height,
                dst: d.height,
            });
        }
        if s.height == 0 {
            continue;
        }

        let src_plane = src.plane(index).ok_or(PlanarError::BufferTooSmall {
            required: s.height * s.bytes_per_row,
            actual: src.data.len(),
        })?;
        let dst_len = dst.data.len();
        let dst_plane = dst.plane_mut(index).ok_or(PlanarError::BufferTooSmall {
            required: d.height * d.bytes_per_row,
            actual: dst_len,
        })?;

        if s.bytes_per_row == d.bytes_per_row {
            dst_plane.copy_from_slice(src_plane);
            continue;
        }

        let row_len = s.bytes_per_row.min(d.bytes_per_row);
        for (src_row, dst_row) in src_plane
            .chunks_exact(s.bytes_per_row)
            .zip(dst_plane.chunks_exact_mut(d.bytes_per_row))
        {
            dst_row[..row_len].copy_from_slice(&src_row[..row_len]);
        }
    }
    Ok(())
}
