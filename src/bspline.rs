//! Cubic B-spline kernels and coarse-grid deformation fields.
//!
//! The kernels back two unrelated pieces of machinery: the Parzen
//! windows of the information metrics (radius-scaled kernels over
//! histogram bins) and the deformation field of the distortion
//! metric (knot coefficients on a coarse oriented grid).

use nalgebra::DVector;

use crate::error::Error;
use crate::image::OrientedImage;
use crate::view::View;

/// Cubic B-spline, support `[-2, 2]`, unit integral.
pub fn b3_kernel(x: f64) -> f64
{
    let x = x.abs();
    if x < 1. {
        (4. - 6. * x * x + 3. * x * x * x) / 6.
    } else if x < 2. {
        let t = 2. - x;
        t * t * t / 6.
    } else {
        0.
    }
}

/// First derivative of [`b3_kernel`].
pub fn b3_deriv(x: f64) -> f64
{
    let ax = x.abs();
    let sign = if x < 0. { -1. } else { 1. };
    if ax < 1. {
        sign * (-12. * ax + 9. * ax * ax) / 6.
    } else if ax < 2. {
        let t = 2. - ax;
        sign * -t * t / 2.
    } else {
        0.
    }
}

/// Second derivative of [`b3_kernel`].
pub fn b3_deriv2(x: f64) -> f64
{
    let ax = x.abs();
    if ax < 1. {
        3. * ax - 2.
    } else if ax < 2. {
        2. - ax
    } else {
        0.
    }
}

/// Radius-scaled kernel with support `[-radius, radius]`, used as the
/// Parzen window over histogram bins.
#[inline]
pub fn b3_kernel_scaled(x: f64, radius: usize) -> f64
{
    b3_kernel(2. * x / radius as f64)
}

/// Derivative of [`b3_kernel_scaled`] with respect to `x`.
#[inline]
pub fn b3_deriv_scaled(x: f64, radius: usize) -> f64
{
    let r = radius as f64;
    b3_deriv(2. * x / r) * 2. / r
}

/// A cubic-B-spline field over the knot coefficients stored in an
/// [`OrientedImage`]. Knot indices are clamped at the grid edge
/// (zero-flux), and sampling accepts physical points.
pub struct BSplineField<'a>
{
    knots: &'a OrientedImage,
    view: View<'a, f64>,
}

impl<'a> BSplineField<'a>
{
    pub fn new(knots: &'a OrientedImage) -> Result<Self, Error>
    {
        if knots.rank() < 3 {
            return Err(Error::invalid_argument("knot image must be rank >= 3"));
        }
        Ok(BSplineField { knots, view: View::new(knots.store())? })
    }

    #[inline]
    pub fn knots(&self) -> &OrientedImage
    {
        self.knots
    }

    /// Evaluate the field and its derivative along `dir` (in physical
    /// units) at a physical point.
    pub fn sample(&self, point: &[f64], dir: usize) -> (f64, f64)
    {
        let cind = self.knots.point_to_index(point);
        self.sample_index(cind.as_slice(), dir)
    }

    /// Evaluate at a continuous knot-grid index.
    pub fn sample_index(&self, cind: &[f64], dir: usize) -> (f64, f64)
    {
        let n = 3;
        let store = self.knots.store();
        let stride = store.strides();
        let inv_space = 1. / self.knots.spacing()[dir];

        let mut base = [0i64; 3];
        for d in 0..n {
            base[d] = cind[d].floor() as i64;
        }

        let mut value = 0.;
        let mut deriv = 0.;
        for a in -1..=2i64 {
            for b in -1..=2i64 {
                for c in -1..=2i64 {
                    let k = [base[0] + a, base[1] + b, base[2] + c];
                    let mut flat = 0usize;
                    for d in 0..n {
                        let clamped = k[d].clamp(0, store.dim(d) as i64 - 1) as usize;
                        flat += clamped * stride[d];
                    }
                    let coef = self.view.get(flat);
                    let mut w = 1.;
                    let mut dw = 1.;
                    for d in 0..n {
                        let x = cind[d] - k[d] as f64;
                        w *= b3_kernel(x);
                        if d == dir {
                            dw *= b3_deriv(x) * inv_space;
                        } else {
                            dw *= b3_kernel(x);
                        }
                    }
                    value += coef * w;
                    deriv += coef * dw;
                }
            }
        }
        (value, deriv)
    }

    /// Jacobian regularizer `sum (1 + dphi/dx_dir)^2` over knots, plus
    /// its gradient with respect to every knot coefficient when
    /// `grad` is given.
    pub fn jacobian_energy(&self, dir: usize, mut grad: Option<&mut DVector<f64>>) -> f64
    {
        let store = self.knots.store();
        let dims = [store.dim(0), store.dim(1), store.dim(2)];
        let stride = store.strides();
        let inv_space = 1. / self.knots.spacing()[dir];
        if let Some(g) = grad.as_deref_mut() {
            g.fill(0.);
        }

        let mut energy = 0.;
        for i in 0..dims[0] {
            for j in 0..dims[1] {
                for k in 0..dims[2] {
                    // dphi/dx_dir at knot (i, j, k)
                    let mut d = 0.;
                    let knot = [i as i64, j as i64, k as i64];
                    for a in -2..=2i64 {
                        for b in -2..=2i64 {
                            for c in -2..=2i64 {
                                let q = [knot[0] + a, knot[1] + b, knot[2] + c];
                                let mut flat = 0usize;
                                for dd in 0..3 {
                                    let cl = q[dd].clamp(0, dims[dd] as i64 - 1) as usize;
                                    flat += cl * stride[dd];
                                }
                                let coef = self.view.get(flat);
                                let w = knot_weight(knot, q, dir, inv_space);
                                d += coef * w;
                            }
                        }
                    }
                    let term = 1. + d;
                    energy += term * term;

                    if let Some(g) = grad.as_deref_mut() {
                        // d(term^2)/dcoef_q = 2 term * w(q); out-of-range
                        // q collapse onto the clamped edge coefficient,
                        // mirroring the zero-flux read above
                        for a in -2..=2i64 {
                            for b in -2..=2i64 {
                                for c in -2..=2i64 {
                                    let q = [knot[0] + a, knot[1] + b, knot[2] + c];
                                    let mut flat = 0usize;
                                    for dd in 0..3 {
                                        let cl = q[dd].clamp(0, dims[dd] as i64 - 1) as usize;
                                        flat += cl * stride[dd];
                                    }
                                    let w = knot_weight(knot, q, dir, inv_space);
                                    g[flat] += 2. * term * w;
                                }
                            }
                        }
                    }
                }
            }
        }
        energy
    }

    /// Thin-plate regularizer `sum ||hessian phi||^2` over knots, plus
    /// its gradient when `grad` is given. Mixed second derivatives are
    /// counted twice, as usual for the bending energy.
    pub fn thin_plate_energy(&self, mut grad: Option<&mut DVector<f64>>) -> f64
    {
        let store = self.knots.store();
        let dims = [store.dim(0), store.dim(1), store.dim(2)];
        let stride = store.strides();
        let spacing = [
            self.knots.spacing()[0],
            self.knots.spacing()[1],
            self.knots.spacing()[2],
        ];
        if let Some(g) = grad.as_deref_mut() {
            g.fill(0.);
        }

        let pairs: [(usize, usize, f64); 6] =
            [(0, 0, 1.), (1, 1, 1.), (2, 2, 1.), (0, 1, 2.), (0, 2, 2.), (1, 2, 2.)];

        let mut energy = 0.;
        for i in 0..dims[0] {
            for j in 0..dims[1] {
                for k in 0..dims[2] {
                    let knot = [i as i64, j as i64, k as i64];
                    for &(u, v, mult) in &pairs {
                        let mut d2 = 0.;
                        for a in -2..=2i64 {
                            for b in -2..=2i64 {
                                for c in -2..=2i64 {
                                    let q = [knot[0] + a, knot[1] + b, knot[2] + c];
                                    let mut flat = 0usize;
                                    for dd in 0..3 {
                                        let cl = q[dd].clamp(0, dims[dd] as i64 - 1) as usize;
                                        flat += cl * stride[dd];
                                    }
                                    let coef = self.view.get(flat);
                                    d2 += coef * hessian_weight(knot, q, u, v, &spacing);
                                }
                            }
                        }
                        energy += mult * d2 * d2;

                        if let Some(g) = grad.as_deref_mut() {
                            for a in -2..=2i64 {
                                for b in -2..=2i64 {
                                    for c in -2..=2i64 {
                                        let q = [knot[0] + a, knot[1] + b, knot[2] + c];
                                        let mut flat = 0usize;
                                        for dd in 0..3 {
                                            let cl = q[dd].clamp(0, dims[dd] as i64 - 1) as usize;
                                            flat += cl * stride[dd];
                                        }
                                        let w = hessian_weight(knot, q, u, v, &spacing);
                                        g[flat] += mult * 2. * d2 * w;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        energy
    }
}

fn knot_weight(at: [i64; 3], coef: [i64; 3], dir: usize, inv_space: f64) -> f64
{
    let mut w = 1.;
    for d in 0..3 {
        let x = (at[d] - coef[d]) as f64;
        if d == dir {
            w *= b3_deriv(x) * inv_space;
        } else {
            w *= b3_kernel(x);
        }
    }
    w
}

fn hessian_weight(at: [i64; 3], coef: [i64; 3], u: usize, v: usize, spacing: &[f64; 3]) -> f64
{
    let mut w = 1.;
    for d in 0..3 {
        let x = (at[d] - coef[d]) as f64;
        if u == v && d == u {
            w *= b3_deriv2(x) / (spacing[d] * spacing[d]);
        } else if d == u || d == v {
            w *= b3_deriv(x) / spacing[d];
        } else {
            w *= b3_kernel(x);
        }
    }
    w
}
