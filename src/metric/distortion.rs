// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Distortion-correction metric: a cubic-B-spline deformation along
//! the phase-encode axis, scored against a fixed image with the
//! Parzen information machinery and regularized on the knot grid.
//!
//! The moving image is sampled at `x + phi(x) e_dir` and multiplied by
//! `1 + dphi/dx_dir` so intensity is preserved under the stretch or
//! compression the deformation induces. The parameter vector is the
//! flat array of knot coefficients, in millimeters of displacement.

use nalgebra::DVector;

use crate::bspline::{b3_deriv, b3_deriv_scaled, b3_kernel, b3_kernel_scaled, BSplineField};
use crate::error::Error;
use crate::filter::gradient_image;
use crate::image::OrientedImage;
use crate::kind::ScalarKind;
use crate::metric::information::InfoKind;
use crate::metric::Metric;
use crate::store::ArrayStore;
use crate::view::{View, ViewMut};

pub struct DistortionMetric
{
    fixed: OrientedImage,
    moving: OrientedImage,
    /// directional derivative of the moving image along `dir`, index
    /// units
    dmoving: OrientedImage,
    /// knot coefficient image
    deform: OrientedImage,
    dir: usize,
    kind: InfoKind,
    difference: bool,

    pub jac_reg: f64,
    pub tps_reg: f64,

    bins: usize,
    krad: usize,
    range_fix: [f64; 2],
    range_move: [f64; 2],

    pdf_fix: Vec<f64>,
    pdf_move: Vec<f64>,
    pdf_joint: Vec<f64>,
    /// nknots x bins x bins
    dpdf_joint: Vec<f64>,
    /// nknots x bins
    dpdf_move: Vec<f64>,

    move_cache: OrientedImage,
    dmove_cache: OrientedImage,
    corr_cache: OrientedImage,
    /// `1 + dphi/dx_dir` per voxel (zero where the field folds over)
    factor_cache: Vec<f64>,
}

impl DistortionMetric
{
    /// Build the metric and its knot image. The knot grid covers the
    /// fixed image's bounding box with a four-knot pad on every side
    /// at `knot_spacing` (physical units); `dir` is the phase-encode
    /// axis, defaulting to the moving image's `phasedim` or 1.
    pub fn new(
        fixed: &OrientedImage, moving: &OrientedImage, dir: Option<usize>, knot_spacing: f64,
        kind: InfoKind, difference: bool,
    ) -> Result<Self, Error>
    {
        if fixed.rank() != 3 || moving.rank() != 3 {
            return Err(Error::invalid_argument("distortion metric expects 3D images"));
        }
        if !fixed.matching_orientation(moving, true, 1e-6) {
            return Err(Error::invalid_argument(
                "fixed and moving images must share grid and orientation",
            ));
        }
        if knot_spacing <= 0. {
            return Err(Error::invalid_argument("knot spacing must be positive"));
        }
        let dir = dir.or(moving.phasedim).unwrap_or(1);
        if dir >= 3 {
            return Err(Error::invalid_argument("phase-encode axis must be spatial"));
        }

        let fixed = fixed.copy_cast(ScalarKind::Float64)?;
        let moving = moving.copy_cast(ScalarKind::Float64)?;
        let dmoving = directional_derivative(&moving, dir)?;

        let deform = build_knot_image(&fixed, knot_spacing, dir)?;

        let range_fix = full_range(&fixed)?;
        let mut move_cache = moving.create_another();
        let mut dmove_cache = moving.create_another();
        let mut corr_cache = moving.create_another();
        move_cache.store_mut().make_unique();
        dmove_cache.store_mut().make_unique();
        corr_cache.store_mut().make_unique();

        let mut metric = DistortionMetric {
            fixed,
            moving,
            dmoving,
            deform,
            dir,
            kind,
            difference,
            jac_reg: 0.,
            tps_reg: 0.,
            bins: 0,
            krad: 0,
            range_fix,
            range_move: [0., 1.],
            pdf_fix: vec![],
            pdf_move: vec![],
            pdf_joint: vec![],
            dpdf_joint: vec![],
            dpdf_move: vec![],
            move_cache,
            dmove_cache,
            corr_cache,
            factor_cache: vec![],
        };
        metric.set_bins(128, 4)?;
        Ok(metric)
    }

    pub fn set_bins(&mut self, bins: usize, krad: usize) -> Result<(), Error>
    {
        if bins <= 2 * krad + 1 {
            return Err(Error::invalid_argument("bins must exceed 2*krad+1"));
        }
        self.bins = bins;
        self.krad = krad;
        let nk = self.deform.elements();
        self.pdf_fix = vec![0.; bins];
        self.pdf_move = vec![0.; bins];
        self.pdf_joint = vec![0.; bins * bins];
        self.dpdf_joint = vec![0.; nk * bins * bins];
        self.dpdf_move = vec![0.; nk * bins];
        Ok(())
    }

    /// The knot coefficient image (current deformation estimate).
    pub fn deform(&self) -> &OrientedImage
    {
        &self.deform
    }

    pub fn phase_dir(&self) -> usize
    {
        self.dir
    }

    fn load_params(&mut self, p: &DVector<f64>) -> Result<(), Error>
    {
        if p.len() != self.deform.elements() {
            return Err(Error::invalid_argument(format!(
                "expected {} knot coefficients, got {}",
                self.deform.elements(),
                p.len()
            )));
        }
        let mut vm = ViewMut::<f64>::new(self.deform.store_mut())?;
        for (i, &v) in p.iter().enumerate() {
            vm.set(i, v);
        }
        Ok(())
    }

    /// Recompute the deformed moving image, its directional
    /// derivative, and the intensity-corrected image.
    fn update_caches(&mut self) -> Result<(), Error>
    {
        let field = BSplineField::new(&self.deform)?;
        let move_vw = View::<f64>::new(self.moving.store())?;
        let dmove_vw = View::<f64>::new(self.dmoving.store())?;
        let stride = self.moving.store().strides().to_vec();
        let dims = [self.moving.dim(0), self.moving.dim(1), self.moving.dim(2)];
        let spacing_dir = self.moving.spacing()[self.dir];
        let dirlen = dims[self.dir];

        let mut range = [0f64, 0f64];
        self.factor_cache.resize(self.moving.elements(), 0.);
        let factors = &mut self.factor_cache;
        let mut mc = ViewMut::<f64>::new(self.move_cache.store_mut())?;
        let mut dc = ViewMut::<f64>::new(self.dmove_cache.store_mut())?;
        let mut cc = ViewMut::<f64>::new(self.corr_cache.store_mut())?;

        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let ind = [x as f64, y as f64, z as f64];
                    let pt = self.moving.index_to_point(&ind);
                    let (def, ddef) = field.sample(pt.as_slice(), self.dir);

                    let mut mind = [x, y, z];
                    let cind = ind[self.dir] + def / spacing_dir;
                    let below = cind.floor() as i64;

                    let mut fm = 0.;
                    let mut dfm = 0.;
                    for cand in [below, below + 1] {
                        if cand >= 0 && cand < dirlen as i64 {
                            let w = crate::interp::lin_kern(cand as f64 - cind);
                            mind[self.dir] = cand as usize;
                            let flat =
                                mind[0] * stride[0] + mind[1] * stride[1] + mind[2] * stride[2];
                            fm += w * move_vw.get(flat);
                            dfm += w * dmove_vw.get(flat);
                        }
                    }

                    // fold-over: the stretched voxel collapses
                    let factor = if ddef < -1. { 0. } else { 1. + ddef };
                    let fc = fm * factor;

                    let flat = x * stride[0] + y * stride[1] + z * stride[2];
                    mc.set(flat, fm);
                    dc.set(flat, dfm);
                    cc.set(flat, fc);
                    factors[flat] = factor;
                    range[0] = range[0].min(fc);
                    range[1] = range[1].max(fc);
                }
            }
        }
        if !(range[1] > range[0]) {
            return Err(Error::numeric("deformed image has no intensity range"));
        }
        self.range_move = range;
        Ok(())
    }

    fn widths(&self) -> (f64, f64)
    {
        let denom = (self.bins - 2 * self.krad - 1) as f64;
        (
            (self.range_fix[1] - self.range_fix[0]) / denom,
            (self.range_move[1] - self.range_move[0]) / denom,
        )
    }

    fn accumulate(&mut self, with_grad: bool) -> Result<(), Error>
    {
        self.update_caches()?;

        let (wfix, wmove) = self.widths();
        let bins = self.bins;
        let krad = self.krad as i64;
        let kradius = self.krad;

        self.pdf_fix.fill(0.);
        self.pdf_move.fill(0.);
        self.pdf_joint.fill(0.);
        if with_grad {
            self.dpdf_joint.fill(0.);
            self.dpdf_move.fill(0.);
        }

        let fix = View::<f64>::new(self.fixed.store())?;
        let mc = View::<f64>::new(self.move_cache.store())?;
        let dc = View::<f64>::new(self.dmove_cache.store())?;
        let cc = View::<f64>::new(self.corr_cache.store())?;
        let stride = self.fixed.store().strides();
        let dims = [self.fixed.dim(0), self.fixed.dim(1), self.fixed.dim(2)];

        let kdims = [self.deform.dim(0), self.deform.dim(1), self.deform.dim(2)];
        let kstride = self.deform.store().strides().to_vec();
        let kspace_dir = self.deform.spacing()[self.dir];
        let mspace_dir = self.moving.spacing()[self.dir];

        let mut movweight = vec![0f64; 2 * kradius + 1];
        let mut dmovweight = vec![0f64; 2 * kradius + 1];
        let mut fixweight = vec![0f64; 2 * kradius + 1];

        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let flat = x * stride[0] + y * stride[1] + z * stride[2];
                    let ff = fix.get(flat);
                    let fm = mc.get(flat);
                    let dfm = dc.get(flat);
                    let fc = cc.get(flat);

                    let cbin_f = ((ff - self.range_fix[0]) / wfix + kradius as f64)
                        .clamp(krad as f64, (bins as i64 - 1 - krad) as f64);
                    let cbin_m = ((fc - self.range_move[0]) / wmove + kradius as f64)
                        .clamp(krad as f64, (bins as i64 - 1 - krad) as f64);
                    let bin_f = cbin_f.round() as i64;
                    let bin_m = cbin_m.round() as i64;

                    for jj in (bin_m - krad)..=(bin_m + krad) {
                        let o = (jj - bin_m + krad) as usize;
                        movweight[o] = b3_kernel_scaled(jj as f64 - cbin_m, kradius);
                        dmovweight[o] = b3_deriv_scaled(jj as f64 - cbin_m, kradius);
                    }
                    for ii in (bin_f - krad)..=(bin_f + krad) {
                        fixweight[(ii - bin_f + krad) as usize] =
                            b3_kernel_scaled(ii as f64 - cbin_f, kradius);
                    }

                    for ii in (bin_f - krad)..=(bin_f + krad) {
                        let wf = fixweight[(ii - bin_f + krad) as usize];
                        if wf == 0. {
                            continue;
                        }
                        for jj in (bin_m - krad)..=(bin_m + krad) {
                            self.pdf_joint[ii as usize * bins + jj as usize] +=
                                wf * movweight[(jj - bin_m + krad) as usize];
                        }
                    }

                    if !with_grad {
                        continue;
                    }

                    let ind = [x as f64, y as f64, z as f64];
                    let pt = self.fixed.index_to_point(&ind);
                    let dcind = self.deform.point_to_index(pt.as_slice());
                    let base = [
                        dcind[0].floor() as i64,
                        dcind[1].floor() as i64,
                        dcind[2].floor() as i64,
                    ];
                    let factor = self.factor_cache[flat];
                    if dfm == 0. && fm == 0. {
                        continue;
                    }

                    for a in -1..=2i64 {
                        for b in -1..=2i64 {
                            for c in -1..=2i64 {
                                let q = [base[0] + a, base[1] + b, base[2] + c];
                                // zero-flux: out-of-range support
                                // collapses onto the edge knot
                                let mut kflat = 0usize;
                                for d in 0..3 {
                                    let cl = q[d].clamp(0, kdims[d] as i64 - 1) as usize;
                                    kflat += cl * kstride[d];
                                }

                                // knot weight on the field value
                                let mut w_phi = 1.;
                                // knot weight on d(field)/dx_dir
                                let mut w_dphi = 1.;
                                for d in 0..3 {
                                    let xk = dcind[d] - q[d] as f64;
                                    w_phi *= b3_kernel(xk);
                                    if d == self.dir {
                                        w_dphi *= b3_deriv(xk) / kspace_dir;
                                    } else {
                                        w_dphi *= b3_kernel(xk);
                                    }
                                }
                                if w_phi == 0. && w_dphi == 0. {
                                    continue;
                                }

                                // dFc/dknot: shift of the sampling
                                // point plus the intensity correction
                                let dg = dfm * w_phi / mspace_dir * factor + fm * w_dphi;
                                if dg == 0. {
                                    continue;
                                }

                                for jj in (bin_m - krad)..=(bin_m + krad) {
                                    let tmp = dg * dmovweight[(jj - bin_m + krad) as usize];
                                    if tmp == 0. {
                                        continue;
                                    }
                                    self.dpdf_move[kflat * bins + jj as usize] += tmp;
                                    for ii in (bin_f - krad)..=(bin_f + krad) {
                                        let wf = fixweight[(ii - bin_f + krad) as usize];
                                        self.dpdf_joint
                                            [kflat * bins * bins + ii as usize * bins + jj as usize] +=
                                            tmp * wf;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn entropies(&mut self) -> (f64, f64, f64, f64)
    {
        let bins = self.bins;
        let total: f64 = self.pdf_joint.iter().sum();
        let scale = 1. / total;
        for v in &mut self.pdf_joint {
            *v *= scale;
        }
        for i in 0..bins {
            for j in 0..bins {
                let p = self.pdf_joint[i * bins + j];
                self.pdf_fix[i] += p;
                self.pdf_move[j] += p;
            }
        }
        let ent = |p: &[f64]| -> f64 {
            -p.iter().map(|&v| if v > 0. { v * v.ln() } else { 0. }).sum::<f64>()
        };
        (ent(&self.pdf_fix), ent(&self.pdf_move), ent(&self.pdf_joint), scale)
    }

    fn info_value(&self, hf: f64, hm: f64, hj: f64) -> f64
    {
        let mut val = match self.kind {
            InfoKind::MutualInformation => hf + hm - hj,
            InfoKind::NormalizedMutualInformation => (hf + hm) / hj,
            InfoKind::VariationOfInformation => 2. * hj - hf - hm,
        };
        if self.negates() {
            val = -val;
        }
        val
    }

    fn negates(&self) -> bool
    {
        self.difference
            && matches!(
                self.kind,
                InfoKind::MutualInformation | InfoKind::NormalizedMutualInformation
            )
    }
}

impl Metric for DistortionMetric
{
    fn n_params(&self) -> usize
    {
        self.deform.elements()
    }

    fn value(&mut self, p: &DVector<f64>) -> Result<f64, Error>
    {
        self.load_params(p)?;
        self.accumulate(false)?;
        let (hf, hm, hj, _) = self.entropies();
        let mut val = self.info_value(hf, hm, hj);

        let field = BSplineField::new(&self.deform)?;
        if self.tps_reg > 0. {
            val += self.tps_reg * field.thin_plate_energy(None);
        }
        if self.jac_reg > 0. {
            val += self.jac_reg * field.jacobian_energy(self.dir, None);
        }
        Ok(val)
    }

    fn grad(&mut self, p: &DVector<f64>, g: &mut DVector<f64>) -> Result<(), Error>
    {
        self.value_grad(p, g).map(|_| ())
    }

    fn value_grad(&mut self, p: &DVector<f64>, grad: &mut DVector<f64>) -> Result<f64, Error>
    {
        let nk = self.deform.elements();
        if grad.len() != nk {
            return Err(Error::invalid_argument("gradient length must match knot count"));
        }
        self.load_params(p)?;
        self.accumulate(true)?;
        let (hf, hm, hj, scale) = self.entropies();

        let bins = self.bins;
        let tbins = bins * bins;
        let (_, wmove) = self.widths();
        let dscale = -scale / wmove;
        for v in &mut self.dpdf_joint {
            *v *= dscale;
        }
        for v in &mut self.dpdf_move {
            *v *= dscale;
        }

        for q in 0..nk {
            let mut ghm = 0.;
            for j in 0..bins {
                let pm = self.pdf_move[j];
                if pm > 0. {
                    ghm -= self.dpdf_move[q * bins + j] * (pm.ln() + 1.);
                }
            }
            let mut ghj = 0.;
            for b in 0..tbins {
                let pj = self.pdf_joint[b];
                if pj > 0. {
                    ghj -= self.dpdf_joint[q * tbins + b] * (pj.ln() + 1.);
                }
            }
            grad[q] = match self.kind {
                InfoKind::MutualInformation => ghm - ghj,
                InfoKind::NormalizedMutualInformation => ghm / hj - ghj * (hf + hm) / (hj * hj),
                InfoKind::VariationOfInformation => 2. * ghj - ghm,
            };
        }

        let mut val = self.info_value(hf, hm, hj);
        if self.negates() {
            *grad *= -1.;
        }

        let field = BSplineField::new(&self.deform)?;
        let mut reg_grad = DVector::zeros(nk);
        if self.tps_reg > 0. {
            val += self.tps_reg * field.thin_plate_energy(Some(&mut reg_grad));
            grad.axpy(self.tps_reg, &reg_grad, 1.);
        }
        if self.jac_reg > 0. {
            val += self.jac_reg * field.jacobian_energy(self.dir, Some(&mut reg_grad));
            grad.axpy(self.jac_reg, &reg_grad, 1.);
        }
        Ok(val)
    }
}

/// Derivative of a 3D image along one axis, central differences in
/// index units.
fn directional_derivative(img: &OrientedImage, dir: usize) -> Result<OrientedImage, Error>
{
    let full = gradient_image(img)?;
    let dims = [img.dim(0), img.dim(1), img.dim(2)];
    let mut store = ArrayStore::zeros(&dims, ScalarKind::Float64)?;
    let src = View::<f64>::new(full.store())?;
    {
        let mut dst = ViewMut::<f64>::new(&mut store)?;
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    dst.set_nd(&[x, y, z], src.get_nd(&[x, y, z, dir]));
                }
            }
        }
    }
    let mut out = OrientedImage::new(store);
    out.copy_metadata_from(img);
    Ok(out)
}

/// Knot image spanning the fixed FOV plus a four-knot pad, aligned to
/// the fixed direction and centered on the fixed image's center.
fn build_knot_image(fixed: &OrientedImage, space: f64, dir: usize) -> Result<OrientedImage, Error>
{
    let mut kdim = [0usize; 3];
    for d in 0..3 {
        kdim[d] = 4 + (fixed.dim(d) as f64 * fixed.spacing()[d] / space).ceil() as usize;
    }
    let store = ArrayStore::zeros(&kdim, ScalarKind::Float64)?;
    let mut knots = OrientedImage::new(store);

    let spacing = nalgebra::DVector::from_element(3, space);
    let direction = fixed.direction().clone();

    // origin from the center alignment: o = c - R diag(s) x_c
    let indc = [
        (fixed.dim(0) as f64 - 1.) / 2.,
        (fixed.dim(1) as f64 - 1.) / 2.,
        (fixed.dim(2) as f64 - 1.) / 2.,
    ];
    let ptc = fixed.index_to_point(&indc);
    let kindc = nalgebra::DVector::from_vec(vec![
        (kdim[0] as f64 - 1.) / 2.,
        (kdim[1] as f64 - 1.) / 2.,
        (kdim[2] as f64 - 1.) / 2.,
    ]);
    let scaled = &direction * nalgebra::DMatrix::from_diagonal(&spacing) * kindc;
    let origin = ptc - scaled;

    knots.set_orient(origin, spacing, direction)?;
    knots.phasedim = Some(dir);
    Ok(knots)
}

fn full_range(img: &OrientedImage) -> Result<[f64; 2], Error>
{
    let v = View::<f64>::new(img.store())?;
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for i in 0..img.elements() {
        let x = v.get(i);
        lo = lo.min(x);
        hi = hi.max(x);
    }
    if !(hi > lo) {
        return Err(Error::numeric("image has no intensity range"));
    }
    Ok([lo, hi])
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::metric::testimg::gaussian_ball;

    fn small_metric() -> DistortionMetric
    {
        let fixed = gaussian_ball(10, 4.5, 4.0, 4.5, 2.0);
        let moving = gaussian_ball(10, 4.5, 5.0, 4.5, 2.0);
        let mut m =
            DistortionMetric::new(&fixed, &moving, Some(1), 4.0, InfoKind::MutualInformation, true)
                .unwrap();
        m.set_bins(16, 2).unwrap();
        m
    }

    #[test]
    fn knot_grid_covers_fov_with_pad()
    {
        let m = small_metric();
        let k = m.deform();
        // 10 voxels at unit spacing, 4 mm knots: ceil(10/4) + 4 = 7
        assert_eq!(k.shape(), &[7, 7, 7]);
        assert_eq!(k.phasedim, Some(1));
        // the fixed center maps to the knot-grid center
        let center = k.point_to_index(&[4.5, 4.5, 4.5]);
        for d in 0..3 {
            assert!((center[d] - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_deformation_reproduces_moving()
    {
        let mut m = small_metric();
        let p = DVector::zeros(m.n_params());
        m.load_params(&p).unwrap();
        m.update_caches().unwrap();
        let mv = View::<f64>::new(m.moving.store()).unwrap();
        let cv = View::<f64>::new(m.corr_cache.store()).unwrap();
        for i in 0..m.moving.elements() {
            assert!((mv.get(i) - cv.get(i)).abs() < 1e-9);
        }
    }

    #[test]
    fn value_improves_toward_true_displacement()
    {
        // moving displaced +1 voxel along y; a uniform field of -1
        // (sampling back) should beat zero deformation
        let mut m = small_metric();
        let zero = m.value(&DVector::zeros(m.n_params())).unwrap();
        let correcting = m
            .value(&DVector::from_element(m.n_params(), -1.0))
            .unwrap();
        assert!(
            correcting < zero,
            "corrected {} should improve on {}",
            correcting,
            zero
        );
    }

    #[test]
    fn regularizers_add_to_value()
    {
        let mut m = small_metric();
        let p = DVector::from_fn(m.n_params(), |i, _| ((i % 5) as f64 - 2.) / 10.);
        let bare = m.value(&p).unwrap();
        m.jac_reg = 0.1;
        m.tps_reg = 0.1;
        let reg = m.value(&p).unwrap();
        assert!(reg > bare);
    }
}
