// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Correlation between a fixed image and a rigidly transformed moving
//! image, with the analytic gradient over the six parameters.

use nalgebra::{DVector, Matrix3, Vector3};

use crate::error::Error;
use crate::filter::gradient_image;
use crate::image::OrientedImage;
use crate::interp::LinearInterp;
use crate::kind::ScalarKind;
use crate::metric::{sample_corr, sample_var, Metric};
use crate::view::View;

/// Derivatives of `Rx Ry Rz` with respect to each Euler angle.
pub(crate) fn rotation_param_derivs(rx: f64, ry: f64, rz: f64) -> [Matrix3<f64>; 3]
{
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    let ddrx = Matrix3::new(
        0., 0., 0.,
        cx * cz * sy - sx * sz, -(cz * sx) - cx * sy * sz, -(cx * cy),
        cz * sx * sy + cx * sz, cx * cz - sx * sy * sz, -(cy * sx),
    );
    let ddry = Matrix3::new(
        -(cz * sy), sy * sz, cy,
        cy * cz * sx, -(cy * sx * sz), sx * sy,
        -(cx * cy * cz), cx * cy * sz, -(cx * sy),
    );
    let ddrz = Matrix3::new(
        -(cy * sz), -(cy * cz), 0.,
        cx * cz - sx * sy * sz, -(cz * sx * sy) - cx * sz, 0.,
        cz * sx + cx * sy * sz, cx * cz * sy - sx * sz, 0.,
    );
    [ddrx, ddry, ddrz]
}

/// Correlation metric for six-parameter rigid registration.
///
/// Parameters are ordered `(rx, ry, rz)` in degrees then
/// `(sx, sy, sz)` in millimeters; they are converted to radians and
/// voxel units internally, and the gradient is rescaled back to the
/// caller's units. In difference mode the value and gradient are
/// negated so that minimization maximizes correlation.
pub struct RigidCorrMetric
{
    fixed: OrientedImage,
    moving: OrientedImage,
    dmoving: OrientedImage,
    center: Vector3<f64>,
    difference: bool,
}

impl RigidCorrMetric
{
    pub fn new(fixed: &OrientedImage, moving: &OrientedImage, difference: bool) -> Result<Self, Error>
    {
        if fixed.rank() != 3 || moving.rank() != 3 {
            return Err(Error::invalid_argument("rigid correlation expects 3D images"));
        }
        if !fixed.matching_orientation(moving, true, 1e-6) {
            return Err(Error::invalid_argument(
                "fixed and moving images must share grid and orientation",
            ));
        }
        let fixed = fixed.copy_cast(ScalarKind::Float64)?;
        let moving = moving.copy_cast(ScalarKind::Float64)?;
        let dmoving = gradient_image(&moving)?;
        let center = Vector3::new(
            (moving.dim(0) as f64 - 1.) / 2.,
            (moving.dim(1) as f64 - 1.) / 2.,
            (moving.dim(2) as f64 - 1.) / 2.,
        );
        Ok(RigidCorrMetric { fixed, moving, dmoving, center, difference })
    }

    /// Center of rotation, in voxels.
    pub fn center(&self) -> Vector3<f64>
    {
        self.center
    }

    fn params_to_internal(&self, p: &DVector<f64>) -> (Matrix3<f64>, Vector3<f64>, [f64; 3])
    {
        let angles = [
            p[0] * std::f64::consts::PI / 180.,
            p[1] * std::f64::consts::PI / 180.,
            p[2] * std::f64::consts::PI / 180.,
        ];
        let shift = Vector3::new(
            p[3] / self.moving.spacing()[0],
            p[4] / self.moving.spacing()[1],
            p[5] / self.moving.spacing()[2],
        );
        let r = crate::transform::rotation_xyz(&Vector3::new(angles[0], angles[1], angles[2]));
        (r, shift, angles)
    }
}

impl Metric for RigidCorrMetric
{
    fn n_params(&self) -> usize
    {
        6
    }

    fn value(&mut self, p: &DVector<f64>) -> Result<f64, Error>
    {
        let (r, shift, _) = self.params_to_internal(p);
        let rinv = r.transpose();

        let fix_vw = LinearInterp::<f64>::new(&self.fixed)?;
        let mov = View::<f64>::new(self.moving.store())?;
        let stride = self.moving.store().strides();
        let dims = [self.moving.dim(0), self.moving.dim(1), self.moving.dim(2)];

        let (mut s1, mut s2, mut q1, mut q2, mut s12) = (0., 0., 0., 0., 0.);
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let ind = Vector3::new(x as f64, y as f64, z as f64);
                    let cind = rinv * (ind - shift - self.center) + self.center;
                    let g = mov.get(x * stride[0] + y * stride[1] + z * stride[2]);
                    let f = fix_vw.get(&[cind[0], cind[1], cind[2]]);
                    s1 += g;
                    q1 += g * g;
                    s2 += f;
                    q2 += f * f;
                    s12 += g * f;
                }
            }
        }
        let mut val = sample_corr(self.moving.elements(), s1, s2, q1, q2, s12);
        if self.difference {
            val = -val;
        }
        Ok(val)
    }

    fn grad(&mut self, p: &DVector<f64>, g: &mut DVector<f64>) -> Result<(), Error>
    {
        self.value_grad(p, g).map(|_| ())
    }

    fn value_grad(&mut self, p: &DVector<f64>, grad: &mut DVector<f64>) -> Result<f64, Error>
    {
        if grad.len() != 6 {
            return Err(Error::invalid_argument("gradient vector must have 6 entries"));
        }
        let (r, shift, angles) = self.params_to_internal(p);
        let rinv = r.transpose();
        let dd = rotation_param_derivs(angles[0], angles[1], angles[2]);

        let fix_vw = LinearInterp::<f64>::new(&self.fixed)?;
        let mov = View::<f64>::new(self.moving.store())?;
        let dmov = View::<f64>::new(self.dmoving.store())?;
        let stride = self.moving.store().strides();
        let dstride = self.dmoving.store().strides();
        let dims = [self.moving.dim(0), self.moving.dim(1), self.moving.dim(2)];

        grad.fill(0.);
        let (mut s1, mut s2, mut q1, mut q2, mut s12) = (0., 0., 0., 0., 0.);
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let ind = Vector3::new(x as f64, y as f64, z as f64);
                    let cind = rinv * (ind - shift - self.center) + self.center;

                    let dflat = x * dstride[0] + y * dstride[1] + z * dstride[2];
                    let grad_g = Vector3::new(dmov.get(dflat), dmov.get(dflat + 1), dmov.get(dflat + 2));

                    // dg/dp over the rotations: rows are the parameter
                    // derivatives of the rotated coordinate
                    let arm = cind - self.center;
                    let dgdr = Vector3::new(
                        (dd[0] * arm).dot(&grad_g),
                        (dd[1] * arm).dot(&grad_g),
                        (dd[2] * arm).dot(&grad_g),
                    );

                    let g = mov.get(x * stride[0] + y * stride[1] + z * stride[2]);
                    let f = fix_vw.get(&[cind[0], cind[1], cind[2]]);
                    s1 += g;
                    q1 += g * g;
                    s2 += f;
                    q2 += f * f;
                    s12 += g * f;

                    grad[0] += f * dgdr[0];
                    grad[1] += f * dgdr[1];
                    grad[2] += f * dgdr[2];
                    grad[3] += f * grad_g[0];
                    grad[4] += f * grad_g[1];
                    grad[5] += f * grad_g[2];
                }
            }
        }

        // user units: degrees and millimeters
        let deg = std::f64::consts::PI / 180.;
        grad[0] *= deg;
        grad[1] *= deg;
        grad[2] *= deg;
        grad[3] /= self.moving.spacing()[0];
        grad[4] /= self.moving.spacing()[1];
        grad[5] /= self.moving.spacing()[2];

        let count = self.moving.elements();
        let mut val = sample_corr(count, s1, s2, q1, q2, s12);
        let sd1 = sample_var(count, s1, q1).sqrt();
        let sd2 = sample_var(count, s2, q2).sqrt();
        let denom = (count as f64 - 1.) * sd1 * sd2;
        if denom == 0. || !denom.is_finite() {
            // degenerate covariance: no direction to move in
            grad.fill(0.);
            return Err(Error::numeric("zero-variance image in correlation gradient"));
        }
        *grad /= denom;

        if self.difference {
            val = -val;
            *grad *= -1.;
        }
        Ok(val)
    }
}
