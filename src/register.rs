// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Multi-scale registration drivers.
//!
//! The drivers own the smooth/downsample pyramid; each metric owns a
//! single image pair. Between levels the running transform is
//! converted into the level grid's index coordinates (centered on the
//! grid), packed into the optimizer's parameter vector, and unpacked
//! back to RAS form afterwards.
//!
//! The returned rigid transform maps fixed-image indices to moving-
//! image indices, so [`apply_rigid`] resamples the moving image onto
//! the fixed grid.

use log::info;
use nalgebra::{DVector, Vector3};

use crate::bspline::BSplineField;
use crate::error::Error;
use crate::filter::{downsample, smooth};
use crate::image::OrientedImage;
use crate::interp::{LanczosInterp, LinearInterp};
use crate::kind::ScalarKind;
use crate::metric::{DistortionMetric, InfoKind, Metric, MetricKind, RigidCorrMetric, RigidInfoMetric};
use crate::optimize::{Lbfgs, StopReason};
use crate::transform::RigidTransform;
use crate::view::ViewMut;

/// Options shared by the registration drivers.
#[derive(Clone, Debug)]
pub struct RegisterOpts
{
    pub optimizer: Lbfgs,
    /// histogram bins for the information metrics
    pub bins: usize,
    /// Parzen kernel radius in bins
    pub krad: usize,
}

impl Default for RegisterOpts
{
    fn default() -> Self
    {
        RegisterOpts { optimizer: Lbfgs::default(), bins: 128, krad: 4 }
    }
}

fn level_factor(sigma: f64) -> usize
{
    (sigma.round() as usize).max(1)
}

fn info_kind(kind: MetricKind) -> Option<(InfoKind, bool)>
{
    match kind {
        MetricKind::Cor => None,
        MetricKind::Mi => Some((InfoKind::MutualInformation, true)),
        MetricKind::Nmi => Some((InfoKind::NormalizedMutualInformation, true)),
        MetricKind::Vi => Some((InfoKind::VariationOfInformation, false)),
    }
}

/// Rigid registration of `moving` onto `fixed` over a sigma pyramid.
///
/// Returns the transform in RAS coordinates and the last level's stop
/// reason.
pub fn rigid_register(
    fixed: &OrientedImage, moving: &OrientedImage, sigmas: &[f64], kind: MetricKind,
    opts: &RegisterOpts,
) -> Result<(RigidTransform, StopReason), Error>
{
    if sigmas.is_empty() {
        return Err(Error::invalid_argument("at least one pyramid level is required"));
    }
    let mut transform = RigidTransform::identity();
    transform.ras_coord = true;
    let mut reason = StopReason::MaxIters;

    for (li, &sigma) in sigmas.iter().enumerate() {
        let factor = level_factor(sigma);
        let fl = downsample(&smooth(fixed, sigma)?, factor)?;
        let ml = downsample(&smooth(moving, sigma)?, factor)?;
        info!(
            "rigid level {} (sigma {}, factor {}): {:?}",
            li,
            sigma,
            factor,
            fl.shape()
        );

        transform.to_index_coords(&ml, true)?;
        let mut p = pack_rigid(&transform, &ml);

        reason = match info_kind(kind) {
            None => {
                let mut metric = RigidCorrMetric::new(&fl, &ml, true)?;
                opts.optimizer.minimize(&mut metric, &mut p)?
            }
            Some((ik, diff)) => {
                let mut metric = RigidInfoMetric::new(&fl, &ml, ik, diff)?;
                metric.set_bins(opts.bins, opts.krad)?;
                opts.optimizer.minimize(&mut metric, &mut p)?
            }
        };
        unpack_rigid(&mut transform, &p, &ml);
        transform.to_ras_coords(&ml)?;
        info!("rigid level {} done: {:?} ({:?})", li, transform, reason);
    }
    Ok((transform, reason))
}

fn pack_rigid(t: &RigidTransform, img: &OrientedImage) -> DVector<f64>
{
    debug_assert!(!t.ras_coord);
    let deg = 180. / std::f64::consts::PI;
    DVector::from_vec(vec![
        t.rotation[0] * deg,
        t.rotation[1] * deg,
        t.rotation[2] * deg,
        t.shift[0] * img.spacing()[0],
        t.shift[1] * img.spacing()[1],
        t.shift[2] * img.spacing()[2],
    ])
}

fn unpack_rigid(t: &mut RigidTransform, p: &DVector<f64>, img: &OrientedImage)
{
    let rad = std::f64::consts::PI / 180.;
    t.rotation = Vector3::new(p[0] * rad, p[1] * rad, p[2] * rad);
    t.shift = Vector3::new(
        p[3] / img.spacing()[0],
        p[4] / img.spacing()[1],
        p[5] / img.spacing()[2],
    );
}

/// Resample `moving` through a rigid transform onto its own grid with
/// Lanczos interpolation: `out(u) = moving(T u)` in index space.
pub fn apply_rigid(moving: &OrientedImage, t: &RigidTransform) -> Result<OrientedImage, Error>
{
    if moving.rank() != 3 {
        return Err(Error::invalid_argument("apply_rigid expects a 3D image"));
    }
    let mut t = t.clone();
    if t.ras_coord {
        t.to_index_coords(moving, false)?;
    }

    let src = moving.copy_cast(ScalarKind::Float64)?;
    let mut out = src.create_another();
    let interp = LanczosInterp::<f64>::new(&src)?;
    let dims = [out.dim(0), out.dim(1), out.dim(2)];
    let stride = out.store().strides().to_vec();
    {
        let mut vm = ViewMut::<f64>::new(out.store_mut())?;
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let v = t.apply(&Vector3::new(x as f64, y as f64, z as f64));
                    let s = interp.get(&[v[0], v[1], v[2]]);
                    vm.set(x * stride[0] + y * stride[1] + z * stride[2], s);
                }
            }
        }
    }
    Ok(out)
}

/// Output of [`distortion_correct`].
pub struct DistortionResult
{
    /// B-spline knot coefficient field, in millimeters of displacement
    pub deform: OrientedImage,
    pub reason: StopReason,
}

/// Estimate a phase-encode distortion field over a sigma pyramid. The
/// knot grid is built once from the fixed image so coefficients carry
/// across levels (levels smooth but do not decimate).
#[allow(clippy::too_many_arguments)]
pub fn distortion_correct(
    fixed: &OrientedImage, moving: &OrientedImage, sigmas: &[f64], dir: Option<usize>,
    knot_spacing: f64, jac_reg: f64, tps_reg: f64, kind: MetricKind, opts: &RegisterOpts,
) -> Result<DistortionResult, Error>
{
    if sigmas.is_empty() {
        return Err(Error::invalid_argument("at least one pyramid level is required"));
    }
    let (ik, diff) = info_kind(kind).unwrap_or((InfoKind::MutualInformation, true));

    let mut params: Option<DVector<f64>> = None;
    let mut deform = None;
    let mut reason = StopReason::MaxIters;
    for (li, &sigma) in sigmas.iter().enumerate() {
        let fl = smooth(fixed, sigma)?;
        let ml = smooth(moving, sigma)?;
        let mut metric = DistortionMetric::new(&fl, &ml, dir, knot_spacing, ik, diff)?;
        metric.set_bins(opts.bins, opts.krad)?;
        metric.jac_reg = jac_reg;
        metric.tps_reg = tps_reg;

        let mut p = match params.take() {
            Some(p) if p.len() == metric.n_params() => p,
            _ => DVector::zeros(metric.n_params()),
        };
        info!("distortion level {} (sigma {}): {} knots", li, sigma, p.len());
        reason = opts.optimizer.minimize(&mut metric, &mut p)?;

        // keep the optimized field for the next level / the caller
        let mut field = metric.deform().clone();
        {
            let store = field.store_mut();
            store.make_unique();
            let mut vm = ViewMut::<f64>::new(store)?;
            for (i, &v) in p.iter().enumerate() {
                vm.set(i, v);
            }
        }
        deform = Some(field);
        params = Some(p);
    }
    Ok(DistortionResult { deform: deform.expect("at least one level ran"), reason })
}

/// Resample a 3D image through a distortion field:
/// `out(x) = moving(x + phi(x)/spacing e_dir) * (1 + dphi/dx_dir)`.
pub fn apply_distortion(
    moving: &OrientedImage, knots: &OrientedImage, dir: usize,
) -> Result<OrientedImage, Error>
{
    if moving.rank() != 3 {
        return Err(Error::invalid_argument("apply_distortion expects a 3D image"));
    }
    let src = moving.copy_cast(ScalarKind::Float64)?;
    let field = BSplineField::new(knots)?;
    let interp = LinearInterp::<f64>::new(&src)?;
    let mut out = src.create_another();
    let dims = [out.dim(0), out.dim(1), out.dim(2)];
    let stride = out.store().strides().to_vec();
    let spacing_dir = moving.spacing()[dir];
    {
        let mut vm = ViewMut::<f64>::new(out.store_mut())?;
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let ind = [x as f64, y as f64, z as f64];
                    let pt = moving.index_to_point(&ind);
                    let (def, ddef) = field.sample(pt.as_slice(), dir);
                    let mut cind = ind;
                    cind[dir] += def / spacing_dir;
                    let factor = if ddef < -1. { 0. } else { 1. + ddef };
                    let v = interp.get(&cind) * factor;
                    vm.set(x * stride[0] + y * stride[1] + z * stride[2], v);
                }
            }
        }
    }
    Ok(out)
}

/// Motion-correct a 4-D series: every volume is rigidly registered to
/// the reference timepoint and resampled onto its grid. Returns the
/// corrected series and one transform per volume (identity at the
/// reference).
pub fn motion_correct(
    input: &OrientedImage, reference: usize, sigmas: &[f64], opts: &RegisterOpts,
) -> Result<(OrientedImage, Vec<RigidTransform>), Error>
{
    if input.rank() != 4 {
        return Err(Error::invalid_argument("motion correction expects a 4D series"));
    }
    let tlen = input.tlen();
    if reference >= tlen {
        return Err(Error::invalid_argument(format!(
            "reference volume {} out of range ({} timepoints)",
            reference, tlen
        )));
    }
    let dims = [input.dim(0), input.dim(1), input.dim(2)];
    let extract = |t: usize| input.extract_cast(&[0, 0, 0, t], &[dims[0], dims[1], dims[2], 0], ScalarKind::Float64);

    let fixed = extract(reference)?;
    let mut out = input.copy_cast(ScalarKind::Float64)?;
    let mut transforms = Vec::with_capacity(tlen);

    for t in 0..tlen {
        if t == reference {
            let mut id = RigidTransform::identity();
            id.ras_coord = true;
            transforms.push(id);
            continue;
        }
        let moving = extract(t)?;
        let (tr, reason) = rigid_register(&fixed, &moving, sigmas, MetricKind::Cor, opts)?;
        info!("motion volume {}: {:?} ({:?})", t, tr, reason);
        let resampled = apply_rigid(&moving, &tr)?;
        let rv = crate::view::View::<f64>::new(resampled.store())?;
        {
            let store = out.store_mut();
            store.make_unique();
            let mut vm = ViewMut::<f64>::new(store)?;
            for x in 0..dims[0] {
                for y in 0..dims[1] {
                    for z in 0..dims[2] {
                        vm.set_nd(&[x, y, z, t], rv.get_nd(&[x, y, z]));
                    }
                }
            }
        }
        transforms.push(tr);
    }
    Ok((out, transforms))
}

/// Compare a metric's analytic gradient against centered finite
/// differences at `x0`. Passes when every component agrees to `tol`
/// relative error (with an absolute floor).
pub fn deriv_check(
    metric: &mut dyn Metric, x0: &DVector<f64>, step: f64, tol: f64,
) -> Result<bool, Error>
{
    let n = metric.n_params();
    let mut g = DVector::zeros(n);
    metric.value_grad(x0, &mut g)?;
    // components far below the gradient norm only need to agree in
    // absolute terms
    let floor = 0.01 * g.norm() / (n as f64).sqrt();

    let mut ok = true;
    let mut x = x0.clone();
    for i in 0..n {
        x[i] = x0[i] + step;
        let fp = metric.value(&x)?;
        x[i] = x0[i] - step;
        let fm = metric.value(&x)?;
        x[i] = x0[i];
        let fd = (fp - fm) / (2. * step);
        let err = (fd - g[i]).abs();
        let scale = fd.abs().max(g[i].abs()).max(floor);
        if err > tol * scale {
            log::warn!("deriv mismatch at {}: analytic {} vs fd {}", i, g[i], fd);
            ok = false;
        }
    }
    Ok(ok)
}

/// Gradient check for the rigid correlation metric.
pub fn cor_deriv_test(
    step: f64, tol: f64, fixed: &OrientedImage, moving: &OrientedImage,
) -> Result<bool, Error>
{
    let mut metric = RigidCorrMetric::new(fixed, moving, true)?;
    let x0 = DVector::from_vec(vec![0.3, -0.2, 0.15, 0.4, -0.3, 0.2]);
    deriv_check(&mut metric, &x0, step, tol)
}

/// Gradient check for the rigid information metrics.
pub fn info_deriv_test(
    step: f64, tol: f64, fixed: &OrientedImage, moving: &OrientedImage, kind: InfoKind,
) -> Result<bool, Error>
{
    let mut metric = RigidInfoMetric::new(fixed, moving, kind, true)?;
    metric.set_bins(64, 4)?;
    let x0 = DVector::from_vec(vec![0.3, -0.2, 0.15, 0.4, -0.3, 0.2]);
    deriv_check(&mut metric, &x0, step, tol)
}

/// Gradient check for the distortion metric.
pub fn distortion_deriv_test(
    step: f64, tol: f64, fixed: &OrientedImage, moving: &OrientedImage, knot_spacing: f64,
) -> Result<bool, Error>
{
    let mut metric = DistortionMetric::new(
        fixed,
        moving,
        Some(1),
        knot_spacing,
        InfoKind::MutualInformation,
        true,
    )?;
    metric.set_bins(32, 2)?;
    let n = metric.n_params();
    let x0 = DVector::from_fn(n, |i, _| 0.2 * (((i * 7919) % 11) as f64 - 5.) / 5.);
    deriv_check(&mut metric, &x0, step, tol)
}
