//! Image geometry and ROI mask transfer between pixel grids.
//!
//! Each image gets a 4×4 affine taking a voxel index `(column, row, slice, 1)`
//! to patient coordinates in millimetres:
//!
//! ```text
//! | Xr·Δc  Yr·Δr  Nr·Δs  Pr |
//! | Xc·Δc  Yc·Δr  Nc·Δs  Pc |
//! | Xs·Δc  Ys·Δr  Ns·Δs  Ps |
//! |   0      0      0     1 |
//! ```
//!
//! with `X`/`Y` the row and column direction cosines of
//! ImageOrientationPatient, `N = X × Y`, `Δr`/`Δc` the PixelSpacing,
//! `Δs` the slice spacing and `P` the ImagePositionPatient.
//!
//! Masks are `(row, column)` indexed, so coordinates are swapped on the way
//! into and out of the affine. Only in-plane results are kept: a point whose
//! mapped slice index is not 0 falls on another slice of the target and is
//! dropped.

use nalgebra::{Matrix4, Matrix4xX, Vector3, Vector4};
use ndarray::{Array2, ArrayView2};

use crate::error::{IndexError, Result};
use crate::tag::{Dataset, Tag};

/// Geometry of one image: the affine of its first frame plus the shift
/// between consecutive frames. Single-frame images have one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    first: Matrix4<f64>,
    step: Vector3<f64>,
    frame_count: usize,
}

impl Geometry {
    /// Build the geometry from ImageOrientationPatient, PixelSpacing,
    /// SpacingBetweenSlices (or SliceThickness) and ImagePositionPatient.
    ///
    /// Frames of a multi-frame image are stacked along the slice normal at
    /// the slice spacing. Their affines are computed on request.
    ///
    /// # Errors
    ///
    /// `GeometryMissing` naming the first absent or malformed tag.
    pub fn from_dataset(tags: &impl Dataset) -> Result<Self> {
        let orientation = tags
            .floats(Tag::ImageOrientationPatient)
            .filter(|values| values.len() == 6)
            .ok_or(IndexError::GeometryMissing(Tag::ImageOrientationPatient))?;
        let spacing = tags
            .floats(Tag::PixelSpacing)
            .filter(|values| values.len() == 2)
            .ok_or(IndexError::GeometryMissing(Tag::PixelSpacing))?;
        let slice_spacing = tags
            .float(Tag::SpacingBetweenSlices)
            .or_else(|| tags.float(Tag::SliceThickness))
            .ok_or(IndexError::GeometryMissing(Tag::SliceThickness))?;
        let position = tags
            .floats(Tag::ImagePositionPatient)
            .filter(|values| values.len() == 3)
            .ok_or(IndexError::GeometryMissing(Tag::ImagePositionPatient))?;

        let row_cosine = Vector3::new(orientation[0], orientation[1], orientation[2]);
        let column_cosine = Vector3::new(orientation[3], orientation[4], orientation[5]);
        let normal = row_cosine.cross(&column_cosine);
        let origin = Vector3::new(position[0], position[1], position[2]);

        let frame_count = tags
            .int(Tag::NumberOfFrames)
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(1)
            .max(1);
        Ok(Self {
            first: Self::affine(
                &row_cosine,
                &column_cosine,
                &normal,
                (spacing[0], spacing[1]),
                slice_spacing,
                &origin,
            ),
            step: normal * slice_spacing,
            frame_count,
        })
    }

    fn affine(
        row_cosine: &Vector3<f64>,
        column_cosine: &Vector3<f64>,
        normal: &Vector3<f64>,
        (row_spacing, column_spacing): (f64, f64),
        slice_spacing: f64,
        position: &Vector3<f64>,
    ) -> Matrix4<f64> {
        let mut affine = Matrix4::identity();
        affine
            .fixed_view_mut::<3, 1>(0, 0)
            .copy_from(&(row_cosine * column_spacing));
        affine
            .fixed_view_mut::<3, 1>(0, 1)
            .copy_from(&(column_cosine * row_spacing));
        affine
            .fixed_view_mut::<3, 1>(0, 2)
            .copy_from(&(normal * slice_spacing));
        affine.fixed_view_mut::<3, 1>(0, 3).copy_from(position);
        affine
    }

    pub fn from_affine(affine: Matrix4<f64>) -> Self {
        Self {
            first: affine,
            step: Vector3::zeros(),
            frame_count: 1,
        }
    }

    /// Affine of the first frame.
    pub fn affine_matrix(&self) -> &Matrix4<f64> {
        &self.first
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Affine of frame `index`, or `None` past the last frame.
    pub fn frame(&self, index: usize) -> Option<Matrix4<f64>> {
        if index >= self.frame_count {
            return None;
        }
        let mut affine = self.first;
        let position = self.first.fixed_view::<3, 1>(0, 3).into_owned() + self.step * index as f64;
        affine.fixed_view_mut::<3, 1>(0, 3).copy_from(&position);
        Some(affine)
    }
}

pub struct AffineMapper;

impl AffineMapper {
    /// Map the True pixels of `mask` from the source grid onto the target
    /// grid, first frame to first frame.
    ///
    /// Returns `(row, column)` pairs on the target grid. The list may be
    /// empty, which means the mapping ran and nothing landed in plane.
    pub fn map_mask(
        mask: ArrayView2<'_, bool>,
        source: &Geometry,
        target: &Geometry,
    ) -> Result<Vec<(i64, i64)>> {
        Self::map_points(&Self::mask_points(mask), source.affine_matrix(), target.affine_matrix())
    }

    /// Same as [`Self::map_mask`] for explicit frames of multi-frame images.
    pub fn map_mask_frames(
        mask: ArrayView2<'_, bool>,
        source: &Geometry,
        source_frame: usize,
        target: &Geometry,
        target_frame: usize,
    ) -> Result<Vec<(i64, i64)>> {
        let source = source
            .frame(source_frame)
            .ok_or(IndexError::GeometryMissing(Tag::NumberOfFrames))?;
        let target = target
            .frame(target_frame)
            .ok_or(IndexError::GeometryMissing(Tag::NumberOfFrames))?;
        Self::map_points(&Self::mask_points(mask), &source, &target)
    }

    /// Build both geometries from tag sets, then map.
    ///
    /// # Errors
    ///
    /// `GeometryMissing` when either image lacks geometry, which is distinct
    /// from an `Ok` empty mapping.
    pub fn map_mask_between(
        mask: ArrayView2<'_, bool>,
        source: &impl Dataset,
        target: &impl Dataset,
    ) -> Result<Vec<(i64, i64)>> {
        let source = Geometry::from_dataset(source)?;
        let target = Geometry::from_dataset(target)?;
        Self::map_mask(mask, &source, &target)
    }

    /// `(row, column)` of every True pixel, in row-major order.
    pub fn mask_points(mask: ArrayView2<'_, bool>) -> Vec<(usize, usize)> {
        mask.indexed_iter()
            .filter(|(_, selected)| **selected)
            .map(|(point, _)| point)
            .collect()
    }

    /// Map `(row, column)` points through `inverse(target) · source`.
    pub fn map_points(
        points: &[(usize, usize)],
        source: &Matrix4<f64>,
        target: &Matrix4<f64>,
    ) -> Result<Vec<(i64, i64)>> {
        let inverse = target.try_inverse().ok_or(IndexError::SingularGeometry)?;
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let transform = inverse * source;

        let columns: Vec<Vector4<f64>> = points
            .iter()
            .map(|&(row, column)| Vector4::new(column as f64, row as f64, 0.0, 1.0))
            .collect();
        let mapped = transform * Matrix4xX::from_columns(&columns);

        Ok(mapped
            .column_iter()
            .filter_map(|point| {
                let column = snap(point[0]);
                let row = snap(point[1]);
                (snap(point[2]) == 0).then_some((row, column))
            })
            .collect())
    }
}

/// Nearest voxel index. The intermediate rounding to 3 decimals removes
/// floating point noise (9.9999999 → 10) before the final rounding.
fn snap(value: f64) -> i64 {
    ((value * 1000.0).round_ties_even() / 1000.0).round_ties_even() as i64
}

/// Rasterise mapped coordinates into a `shape`-sized mask. Points outside
/// the grid are dropped.
pub fn mask_from_coordinates(points: &[(i64, i64)], shape: (usize, usize)) -> Array2<bool> {
    let mut mask = Array2::from_elem(shape, false);
    for &(row, column) in points {
        if let (Ok(row), Ok(column)) = (usize::try_from(row), usize::try_from(column)) {
            if let Some(cell) = mask.get_mut((row, column)) {
                *cell = true;
            }
        }
    }
    mask
}
