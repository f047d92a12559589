// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Coordinate-oriented medical images.
//!
//! An [`OrientedImage`] pairs an [`ArrayStore`] with an origin, a
//! positive per-axis spacing and an orthonormal direction matrix (the
//! qfac sign is absorbed into the direction). The derived affine
//! `p = A [i; 1]` with `A = [R diag(s), o; 0, 1]` and its inverse are
//! cached and recomputed by every orientation setter before the next
//! index/point conversion.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::error::Error;
use crate::kind::ScalarKind;
use crate::store::ArrayStore;

/// Slice acquisition order codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceOrder
{
    /// sequential, increasing
    Seq,
    /// sequential, decreasing
    RSeq,
    /// alternating, even slices first
    Alt,
    /// alternating, decreasing
    RAlt,
    /// alternating, odd slices first
    AltShift,
    /// alternating shifted, decreasing
    RAltShift,
}

/// An n-dimensional image with physical-space orientation and
/// acquisition metadata.
#[derive(Clone)]
pub struct OrientedImage
{
    store: ArrayStore,
    origin: DVector<f64>,
    spacing: DVector<f64>,
    direction: DMatrix<f64>,
    affine: DMatrix<f64>,
    inv_affine: DMatrix<f64>,

    pub freqdim: Option<usize>,
    pub phasedim: Option<usize>,
    pub slicedim: Option<usize>,
    pub slice_duration: f64,
    pub slice_start: i64,
    pub slice_end: i64,
    pub slice_order: Option<SliceOrder>,
    slice_timing: BTreeMap<i64, f64>,
}

impl OrientedImage
{
    /// Wrap a store with the default orientation: identity direction,
    /// unit spacing, zero origin.
    pub fn new(store: ArrayStore) -> OrientedImage
    {
        let n = store.rank();
        let mut img = OrientedImage {
            store,
            origin: DVector::zeros(n),
            spacing: DVector::from_element(n, 1.),
            direction: DMatrix::identity(n, n),
            affine: DMatrix::identity(n + 1, n + 1),
            inv_affine: DMatrix::identity(n + 1, n + 1),
            freqdim: None,
            phasedim: None,
            slicedim: None,
            slice_duration: 0.,
            slice_start: -1,
            slice_end: -1,
            slice_order: None,
            slice_timing: BTreeMap::new(),
        };
        img.update_affine();
        img
    }

    /// Allocate a zeroed image with default orientation.
    pub fn zeros(dim: &[usize], kind: ScalarKind) -> Result<OrientedImage, Error>
    {
        Ok(OrientedImage::new(ArrayStore::zeros(dim, kind)?))
    }

    #[inline]
    pub fn store(&self) -> &ArrayStore
    {
        &self.store
    }

    #[inline]
    pub fn store_mut(&mut self) -> &mut ArrayStore
    {
        &mut self.store
    }

    #[inline]
    pub fn rank(&self) -> usize
    {
        self.store.rank()
    }

    #[inline]
    pub fn shape(&self) -> &[usize]
    {
        self.store.shape()
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> usize
    {
        self.store.dim(axis)
    }

    #[inline]
    pub fn elements(&self) -> usize
    {
        self.store.elements()
    }

    #[inline]
    pub fn tlen(&self) -> usize
    {
        self.store.tlen()
    }

    #[inline]
    pub fn kind(&self) -> ScalarKind
    {
        self.store.kind()
    }

    #[inline]
    pub fn origin(&self) -> &DVector<f64>
    {
        &self.origin
    }

    #[inline]
    pub fn spacing(&self) -> &DVector<f64>
    {
        &self.spacing
    }

    #[inline]
    pub fn direction(&self) -> &DMatrix<f64>
    {
        &self.direction
    }

    /// The cached index-to-point affine.
    #[inline]
    pub fn affine(&self) -> &DMatrix<f64>
    {
        &self.affine
    }

    /// Set origin, spacing and direction together.
    pub fn set_orient(&mut self, origin: DVector<f64>, spacing: DVector<f64>, direction: DMatrix<f64>)
        -> Result<(), Error>
    {
        let n = self.rank();
        if origin.len() != n || spacing.len() != n || direction.nrows() != n || direction.ncols() != n {
            return Err(Error::invalid_argument("orientation dimensions do not match image rank"));
        }
        if spacing.iter().any(|&s| s <= 0.) {
            return Err(Error::invalid_argument("spacing must be positive"));
        }
        self.origin = origin;
        self.spacing = spacing;
        self.direction = direction;
        self.update_affine();
        Ok(())
    }

    pub fn set_origin(&mut self, origin: DVector<f64>) -> Result<(), Error>
    {
        if origin.len() != self.rank() {
            return Err(Error::invalid_argument("origin length does not match image rank"));
        }
        self.origin = origin;
        self.update_affine();
        Ok(())
    }

    pub fn set_spacing(&mut self, spacing: DVector<f64>) -> Result<(), Error>
    {
        if spacing.len() != self.rank() {
            return Err(Error::invalid_argument("spacing length does not match image rank"));
        }
        if spacing.iter().any(|&s| s <= 0.) {
            return Err(Error::invalid_argument("spacing must be positive"));
        }
        self.spacing = spacing;
        self.update_affine();
        Ok(())
    }

    pub fn set_direction(&mut self, direction: DMatrix<f64>) -> Result<(), Error>
    {
        let n = self.rank();
        if direction.nrows() != n || direction.ncols() != n {
            return Err(Error::invalid_argument("direction shape does not match image rank"));
        }
        self.direction = direction;
        self.update_affine();
        Ok(())
    }

    fn update_affine(&mut self)
    {
        let n = self.rank();
        let mut a = DMatrix::identity(n + 1, n + 1);
        for r in 0..n {
            for c in 0..n {
                a[(r, c)] = self.direction[(r, c)] * self.spacing[c];
            }
            a[(r, n)] = self.origin[r];
        }
        self.inv_affine = a
            .clone()
            .try_inverse()
            .expect("orthonormal direction with positive spacing is invertible");
        self.affine = a;
    }

    /// Map a (possibly continuous) index to a physical point. A
    /// shorter input has its trailing components taken as zero; the
    /// output has the image rank.
    pub fn index_to_point(&self, index: &[f64]) -> DVector<f64>
    {
        let n = self.rank();
        let mut h = DVector::zeros(n + 1);
        for d in 0..n {
            h[d] = index.get(d).copied().unwrap_or(0.);
        }
        h[n] = 1.;
        let p = &self.affine * h;
        DVector::from_fn(n, |d, _| p[d])
    }

    /// Map a physical point to a continuous index. A shorter input has
    /// its trailing components taken as zero.
    pub fn point_to_index(&self, point: &[f64]) -> DVector<f64>
    {
        let n = self.rank();
        let mut h = DVector::zeros(n + 1);
        for d in 0..n {
            h[d] = point.get(d).copied().unwrap_or(0.);
        }
        h[n] = 1.;
        let p = &self.inv_affine * h;
        DVector::from_fn(n, |d, _| p[d])
    }

    /// Map a physical point to the nearest integer index.
    pub fn point_to_index_rounded(&self, point: &[f64]) -> Vec<i64>
    {
        self.point_to_index(point).iter().map(|&v| v.round() as i64).collect()
    }

    /// Whether an index lies inside the field of view.
    pub fn index_inside_fov(&self, index: &[f64]) -> bool
    {
        (0..self.rank()).all(|d| {
            let v = index.get(d).copied().unwrap_or(0.);
            v > -0.5 && v < self.dim(d) as f64 - 0.5
        })
    }

    /// Whether a physical point lies inside the field of view.
    pub fn point_inside_fov(&self, point: &[f64]) -> bool
    {
        let idx = self.point_to_index(point);
        self.index_inside_fov(idx.as_slice())
    }

    /// Grid and orientation equality test, spatial axes only when
    /// `spatial_only` is set.
    pub fn matching_orientation(&self, other: &OrientedImage, spatial_only: bool, tol: f64) -> bool
    {
        let n = if spatial_only {
            self.rank().min(3)
        } else {
            self.rank()
        };
        let m = if spatial_only {
            other.rank().min(3)
        } else {
            other.rank()
        };
        if n != m {
            return false;
        }
        for d in 0..n {
            if self.dim(d) != other.dim(d) {
                return false;
            }
            if (self.spacing[d] - other.spacing[d]).abs() > tol {
                return false;
            }
            if (self.origin[d] - other.origin[d]).abs() > tol {
                return false;
            }
            for c in 0..n {
                if (self.direction[(d, c)] - other.direction[(d, c)]).abs() > tol {
                    return false;
                }
            }
        }
        true
    }

    /// Whether the spatial spacing is isotropic to relative tolerance.
    pub fn is_isotropic(&self, tol: f64) -> bool
    {
        let n = self.rank().min(3);
        let s0 = self.spacing[0];
        (1..n).all(|d| ((self.spacing[d] - s0) / s0).abs() <= tol)
    }

    /// A zeroed image of the same shape, kind and orientation.
    pub fn create_another(&self) -> OrientedImage
    {
        let mut out = OrientedImage::new(
            ArrayStore::zeros(self.shape(), self.kind()).expect("shape and kind were valid"),
        );
        out.copy_metadata_from(self);
        out
    }

    /// Copy orientation and acquisition metadata from another image of
    /// the same rank.
    pub fn copy_metadata_from(&mut self, other: &OrientedImage)
    {
        assert_eq!(self.rank(), other.rank(), "metadata copy needs equal rank");
        self.origin = other.origin.clone();
        self.spacing = other.spacing.clone();
        self.direction = other.direction.clone();
        self.freqdim = other.freqdim;
        self.phasedim = other.phasedim;
        self.slicedim = other.slicedim;
        self.slice_duration = other.slice_duration;
        self.slice_start = other.slice_start;
        self.slice_end = other.slice_end;
        self.slice_order = other.slice_order;
        self.slice_timing = other.slice_timing.clone();
        self.update_affine();
    }

    /// Cast the pixel data, keeping shape and orientation.
    pub fn copy_cast(&self, new_kind: ScalarKind) -> Result<OrientedImage, Error>
    {
        let store = self.store.copy_cast(self.shape(), new_kind)?;
        let mut out = OrientedImage::new(store);
        out.copy_metadata_from(self);
        Ok(out)
    }

    /// Crop a region (see [`ArrayStore::extract_cast`]); the origin of
    /// the result is moved so physical positions are preserved on the
    /// kept axes.
    pub fn extract_cast(&self, lo: &[usize], size: &[usize], new_kind: ScalarKind)
        -> Result<OrientedImage, Error>
    {
        let store = self.store.extract_cast(lo, size, new_kind)?;
        let kept: Vec<usize> = (0..size.len()).filter(|&d| size[d] > 0).collect();
        let n = kept.len();

        let lo_f: Vec<f64> = lo.iter().map(|&v| v as f64).collect();
        let new_origin_full = self.index_to_point(&lo_f);

        let mut out = OrientedImage::new(store);
        let origin = DVector::from_fn(n, |i, _| new_origin_full[kept[i]]);
        let spacing = DVector::from_fn(n, |i, _| self.spacing[kept[i]]);
        let direction = DMatrix::from_fn(n, n, |r, c| self.direction[(kept[r], kept[c])]);
        out.set_orient(origin, spacing, direction)?;
        Ok(out)
    }

    /// Acquisition time of each slice, keyed by slice index. Empty
    /// until [`update_slice_timing`](Self::update_slice_timing) runs
    /// with a known order.
    pub fn slice_timing(&self) -> &BTreeMap<i64, f64>
    {
        &self.slice_timing
    }

    /// Derive the slice-timing map from the acquisition description.
    /// An unset order clears the map.
    pub fn update_slice_timing(
        &mut self, duration: f64, start: i64, end: i64, order: Option<SliceOrder>,
    )
    {
        self.slice_duration = duration;
        self.slice_start = start;
        self.slice_end = end;
        self.slice_order = order;
        self.slice_timing.clear();

        let order = match order {
            Some(o) => o,
            None => return,
        };
        if start < 0 || end < start {
            return;
        }

        let dur = duration;
        let mut t = 0.;
        let mut at = |map: &mut BTreeMap<i64, f64>, i: i64| {
            map.insert(i, t);
            t += dur;
        };
        match order {
            SliceOrder::Seq => {
                for i in start..=end {
                    at(&mut self.slice_timing, i);
                }
            }
            SliceOrder::RSeq => {
                for i in (start..=end).rev() {
                    at(&mut self.slice_timing, i);
                }
            }
            SliceOrder::Alt => {
                for i in (start..=end).step_by(2) {
                    at(&mut self.slice_timing, i);
                }
                for i in (start + 1..=end).step_by(2) {
                    at(&mut self.slice_timing, i);
                }
            }
            SliceOrder::RAlt => {
                for i in (start..=end).rev().step_by(2) {
                    at(&mut self.slice_timing, i);
                }
                for i in (start..end).rev().step_by(2) {
                    at(&mut self.slice_timing, i);
                }
            }
            SliceOrder::AltShift => {
                for i in (start + 1..=end).step_by(2) {
                    at(&mut self.slice_timing, i);
                }
                for i in (start..=end).step_by(2) {
                    at(&mut self.slice_timing, i);
                }
            }
            SliceOrder::RAltShift => {
                for i in (start..end).rev().step_by(2) {
                    at(&mut self.slice_timing, i);
                }
                for i in (start..=end).rev().step_by(2) {
                    at(&mut self.slice_timing, i);
                }
            }
        }
    }
}

impl std::fmt::Debug for OrientedImage
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("OrientedImage")
            .field("shape", &self.shape())
            .field("kind", &self.kind())
            .field("spacing", &self.spacing.as_slice())
            .field("origin", &self.origin.as_slice())
            .finish()
    }
}
