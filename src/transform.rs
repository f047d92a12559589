// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Six-parameter rigid transforms with index/RAS duality.
//!
//! The transform maps `y = Rx(rx) Ry(ry) Rz(rz) (x - c) + s + c` and
//! carries a flag telling whether its parameters live in index space
//! or in the physical (RAS) space of a reference image. Conversion
//! between the two uses the reference image's affine.

use nalgebra::{Matrix3, Vector3};

use crate::error::Error;
use crate::image::OrientedImage;

#[derive(Clone, Debug, PartialEq)]
pub struct RigidTransform
{
    /// Euler angles about x, y, z, in radians.
    pub rotation: Vector3<f64>,
    pub shift: Vector3<f64>,
    pub center: Vector3<f64>,
    /// Whether parameters are in RAS (physical) rather than index
    /// coordinates.
    pub ras_coord: bool,
}

impl Default for RigidTransform
{
    fn default() -> Self
    {
        RigidTransform {
            rotation: Vector3::zeros(),
            shift: Vector3::zeros(),
            center: Vector3::zeros(),
            ras_coord: false,
        }
    }
}

/// `Rx(a) Ry(b) Rz(c)` from Euler angles.
pub fn rotation_xyz(angles: &Vector3<f64>) -> Matrix3<f64>
{
    let rx = Matrix3::new(
        1., 0., 0.,
        0., angles[0].cos(), -angles[0].sin(),
        0., angles[0].sin(), angles[0].cos(),
    );
    let ry = Matrix3::new(
        angles[1].cos(), 0., angles[1].sin(),
        0., 1., 0.,
        -angles[1].sin(), 0., angles[1].cos(),
    );
    let rz = Matrix3::new(
        angles[2].cos(), -angles[2].sin(), 0.,
        angles[2].sin(), angles[2].cos(), 0.,
        0., 0., 1.,
    );
    rx * ry * rz
}

/// Extract `(rx, ry, rz)` with `R = Rx Ry Rz`.
pub fn euler_xyz(r: &Matrix3<f64>) -> Vector3<f64>
{
    // R = Rx Ry Rz puts sin(ry) at (0, 2)
    let ry = r[(0, 2)].clamp(-1., 1.).asin();
    let rz = (-r[(0, 1)]).atan2(r[(0, 0)]);
    let rx = (-r[(1, 2)]).atan2(r[(2, 2)]);
    Vector3::new(rx, ry, rz)
}

impl RigidTransform
{
    pub fn identity() -> Self
    {
        Self::default()
    }

    /// The rotation matrix of this transform.
    pub fn rotation_matrix(&self) -> Matrix3<f64>
    {
        rotation_xyz(&self.rotation)
    }

    /// Set the Euler angles from a rotation matrix.
    pub fn set_rotation(&mut self, r: &Matrix3<f64>)
    {
        self.rotation = euler_xyz(r);
    }

    /// Apply to a point in the transform's own coordinate space.
    pub fn apply(&self, x: &Vector3<f64>) -> Vector3<f64>
    {
        self.rotation_matrix() * (x - self.center) + self.shift + self.center
    }

    /// Invert in place: `c' = s + c`, `s' = -s`, `R' = R^-1`.
    pub fn invert(&mut self)
    {
        let q = self.rotation_matrix().transpose();
        let s = self.shift;
        self.center += s;
        self.shift = -s;
        self.rotation = euler_xyz(&q);
    }

    /// Convert parameters from index space to the RAS space of `img`.
    ///
    /// With `A` the scaled direction matrix and `b` the origin:
    /// `Q = A R A^-1`, `t = Q(d - b) + A(s + c - Rc) + b - d`, where
    /// `d` is the center mapped into RAS. No-op when already RAS.
    pub fn to_ras_coords(&mut self, img: &OrientedImage) -> Result<(), Error>
    {
        if self.ras_coord {
            return Ok(());
        }
        if img.rank() < 3 {
            return Err(Error::invalid_argument("rigid transforms need a 3D reference image"));
        }
        let (a, b) = scaled_direction(img);
        let a_inv = a
            .try_inverse()
            .ok_or_else(|| Error::numeric("singular direction matrix"))?;

        let r = self.rotation_matrix();
        let s = self.shift;
        let c = self.center;

        let d_full = img.index_to_point(&[c[0], c[1], c[2]]);
        let d = Vector3::new(d_full[0], d_full[1], d_full[2]);

        let q = a * r * a_inv;
        let t = q * (d - b) + a * (s + c - r * c) + b - d;

        self.rotation = euler_xyz(&q);
        self.shift = t;
        self.center = d;
        self.ras_coord = true;
        Ok(())
    }

    /// Convert parameters from RAS space to the index space of `img`.
    /// With `force_grid_center`, the center of rotation becomes the
    /// grid center `(dim - 1) / 2` instead of the mapped RAS center.
    pub fn to_index_coords(&mut self, img: &OrientedImage, force_grid_center: bool) -> Result<(), Error>
    {
        if !self.ras_coord {
            return Err(Error::invalid_argument("transform is already in index coordinates"));
        }
        if img.rank() < 3 {
            return Err(Error::invalid_argument("rigid transforms need a 3D reference image"));
        }
        let (a, b) = scaled_direction(img);
        let a_inv = a
            .try_inverse()
            .ok_or_else(|| Error::numeric("singular direction matrix"))?;

        let q = self.rotation_matrix();
        let t = self.shift;
        let d = self.center;

        let c = if force_grid_center {
            Vector3::new(
                (img.dim(0) as f64 - 1.) / 2.,
                (img.dim(1) as f64 - 1.) / 2.,
                (img.dim(2) as f64 - 1.) / 2.,
            )
        } else {
            let ci = img.point_to_index(&[d[0], d[1], d[2]]);
            Vector3::new(ci[0], ci[1], ci[2])
        };

        let r = a_inv * q * a;
        let s = a_inv * (q * (b + a * c - d) + t + d - b) - c;

        self.rotation = euler_xyz(&r);
        self.shift = s;
        self.center = c;
        self.ras_coord = false;
        Ok(())
    }
}

/// Direction matrix premultiplied by spacing, and the origin, of the
/// first three axes.
fn scaled_direction(img: &OrientedImage) -> (Matrix3<f64>, Vector3<f64>)
{
    let dir = img.direction();
    let sp = img.spacing();
    let a = Matrix3::from_fn(|r, c| dir[(r, c)] * sp[c]);
    let b = Vector3::new(img.origin()[0], img.origin()[1], img.origin()[2]);
    (a, b)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::kind::ScalarKind;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};

    fn assert_vec_eq(a: &Vector3<f64>, b: &Vector3<f64>, eps: f64)
    {
        for d in 0..3 {
            assert_abs_diff_eq!(a[d], b[d], epsilon = eps);
        }
    }

    #[test]
    fn euler_round_trip()
    {
        for angles in [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(-0.4, 0.25, -0.15),
            Vector3::new(0., 0., 0.),
        ] {
            let r = rotation_xyz(&angles);
            let back = euler_xyz(&r);
            assert_vec_eq(&back, &angles, 1e-12);
            // orthonormality
            let should_be_i = r.transpose() * r;
            assert_abs_diff_eq!((should_be_i - Matrix3::identity()).norm(), 0., epsilon = 1e-12);
        }
    }

    #[test]
    fn invert_round_trips_points()
    {
        let t = RigidTransform {
            rotation: Vector3::new(0.2, -0.1, 0.3),
            shift: Vector3::new(1., -2., 3.),
            center: Vector3::new(4., 4., 4.),
            ras_coord: false,
        };
        let mut ti = t.clone();
        ti.invert();
        for p in [Vector3::new(0., 0., 0.), Vector3::new(3., -1., 7.)] {
            let q = t.apply(&p);
            let back = ti.apply(&q);
            assert_vec_eq(&back, &p, 1e-10);
        }
    }

    fn oriented_test_image() -> OrientedImage
    {
        let mut img = OrientedImage::zeros(&[10, 12, 14], ScalarKind::Float64).unwrap();
        img.set_spacing(DVector::from_vec(vec![1.5, 2., 0.75])).unwrap();
        img.set_origin(DVector::from_vec(vec![-4., 7., 11.])).unwrap();
        // a permutation-with-flip direction matrix, orthonormal
        let dir = DMatrix::from_row_slice(3, 3, &[0., 1., 0., -1., 0., 0., 0., 0., 1.]);
        img.set_direction(dir).unwrap();
        img
    }

    #[test]
    fn ras_index_conversion_round_trip()
    {
        let img = oriented_test_image();
        let orig = RigidTransform {
            rotation: Vector3::new(0.12, -0.2, 0.07),
            shift: Vector3::new(0.5, 1.5, -0.75),
            center: Vector3::new(4.5, 5.5, 6.5),
            ras_coord: false,
        };
        let mut t = orig.clone();
        t.to_ras_coords(&img).unwrap();
        assert!(t.ras_coord);
        t.to_index_coords(&img, false).unwrap();
        assert!(!t.ras_coord);
        assert_vec_eq(&t.rotation, &orig.rotation, 1e-9);
        assert_vec_eq(&t.shift, &orig.shift, 1e-9);
        assert_vec_eq(&t.center, &orig.center, 1e-9);
    }

    #[test]
    fn conversion_preserves_the_point_map()
    {
        // the transform expressed in RAS must map A x + b the same way
        // the index-space transform maps x
        let img = oriented_test_image();
        let mut t = RigidTransform {
            rotation: Vector3::new(0.05, 0.1, -0.08),
            shift: Vector3::new(1., 0., 2.),
            center: Vector3::new(5., 6., 7.),
            ras_coord: false,
        };
        let index_t = t.clone();
        t.to_ras_coords(&img).unwrap();

        for idx in [Vector3::new(1., 2., 3.), Vector3::new(8., 3., 9.)] {
            let yi = index_t.apply(&idx);
            let p_in = img.index_to_point(&[idx[0], idx[1], idx[2]]);
            let p = Vector3::new(p_in[0], p_in[1], p_in[2]);
            let yp = t.apply(&p);
            let yi_p_full = img.index_to_point(&[yi[0], yi[1], yi[2]]);
            let yi_p = Vector3::new(yi_p_full[0], yi_p_full[1], yi_p_full[2]);
            assert_vec_eq(&yp, &yi_p, 1e-9);
        }
    }

    #[test]
    fn force_grid_center_moves_center_only()
    {
        let img = oriented_test_image();
        let mut t = RigidTransform {
            rotation: Vector3::new(0.1, 0., 0.),
            shift: Vector3::new(1., 1., 1.),
            center: Vector3::new(0., 0., 0.),
            ras_coord: false,
        };
        t.to_ras_coords(&img).unwrap();
        let index_equiv = {
            let mut u = t.clone();
            u.to_index_coords(&img, true).unwrap();
            u
        };
        assert_vec_eq(
            &index_equiv.center,
            &Vector3::new(4.5, 5.5, 6.5),
            1e-12,
        );
        // same point map regardless of center representation
        for idx in [Vector3::new(2., 2., 2.), Vector3::new(7., 1., 10.)] {
            let want = {
                let mut u = t.clone();
                u.to_index_coords(&img, false).unwrap();
                u.apply(&idx)
            };
            let got = index_equiv.apply(&idx);
            assert_vec_eq(&want, &got, 1e-9);
        }
    }
}
