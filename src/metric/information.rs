// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Information-theoretic rigid metrics: MI, NMI and VI from Parzen
//! joint histograms, with analytic gradients over the six rigid
//! parameters.

use nalgebra::{DVector, Vector3};

use crate::bspline::{b3_deriv_scaled, b3_kernel_scaled};
use crate::error::Error;
use crate::filter::gradient_image;
use crate::image::OrientedImage;
use crate::interp::LinearInterp;
use crate::kind::ScalarKind;
use crate::metric::correlation::rotation_param_derivs;
use crate::metric::Metric;
use crate::view::View;

/// Which information functional to report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InfoKind
{
    /// `H_f + H_m - H_fm`
    MutualInformation,
    /// `(H_f + H_m) / H_fm`
    NormalizedMutualInformation,
    /// `2 H_fm - H_f - H_m`
    VariationOfInformation,
}

/// Parzen-window information metric for rigid registration.
///
/// Owns the marginal and joint PDFs over `bins` histogram bins, a
/// kernel radius in bins, and the `6 x bins x bins` analytic PDF
/// derivatives. Parameters and gradient units match
/// [`RigidCorrMetric`](crate::metric::RigidCorrMetric): degrees and
/// millimeters. MI and NMI are negated in difference mode; VI is
/// already a distance.
pub struct RigidInfoMetric
{
    fixed: OrientedImage,
    moving: OrientedImage,
    dmoving: OrientedImage,
    center: Vector3<f64>,
    kind: InfoKind,
    difference: bool,

    bins: usize,
    krad: usize,
    range_fix: [f64; 2],
    range_move: [f64; 2],

    pdf_fix: Vec<f64>,
    pdf_move: Vec<f64>,
    pdf_joint: Vec<f64>,
    dpdf_joint: Vec<f64>,
    dpdf_move: Vec<f64>,
}

impl RigidInfoMetric
{
    pub fn new(
        fixed: &OrientedImage, moving: &OrientedImage, kind: InfoKind, difference: bool,
    ) -> Result<Self, Error>
    {
        if fixed.rank() != 3 || moving.rank() != 3 {
            return Err(Error::invalid_argument("rigid information metric expects 3D images"));
        }
        if !fixed.matching_orientation(moving, true, 1e-6) {
            return Err(Error::invalid_argument(
                "fixed and moving images must share grid and orientation",
            ));
        }
        let fixed = fixed.copy_cast(ScalarKind::Float64)?;
        let moving = moving.copy_cast(ScalarKind::Float64)?;
        let dmoving = gradient_image(&moving)?;

        let range_fix = value_range(&fixed, false)?;
        // outside samples map through the boundary policy toward the
        // edge values; zero stays representable
        let range_move = value_range(&moving, true)?;
        let center = Vector3::new(
            (moving.dim(0) as f64 - 1.) / 2.,
            (moving.dim(1) as f64 - 1.) / 2.,
            (moving.dim(2) as f64 - 1.) / 2.,
        );

        let mut metric = RigidInfoMetric {
            fixed,
            moving,
            dmoving,
            center,
            kind,
            difference,
            bins: 0,
            krad: 0,
            range_fix,
            range_move,
            pdf_fix: vec![],
            pdf_move: vec![],
            pdf_joint: vec![],
            dpdf_joint: vec![],
            dpdf_move: vec![],
        };
        metric.set_bins(128, 4)?;
        Ok(metric)
    }

    /// Reallocate the histograms. The kernel radius must use less than
    /// half the bins.
    pub fn set_bins(&mut self, bins: usize, krad: usize) -> Result<(), Error>
    {
        if bins <= 2 * krad + 1 {
            return Err(Error::invalid_argument("bins must exceed 2*krad+1"));
        }
        self.bins = bins;
        self.krad = krad;
        self.pdf_fix = vec![0.; bins];
        self.pdf_move = vec![0.; bins];
        self.pdf_joint = vec![0.; bins * bins];
        self.dpdf_joint = vec![0.; 6 * bins * bins];
        self.dpdf_move = vec![0.; 6 * bins];
        Ok(())
    }

    pub fn bins(&self) -> usize
    {
        self.bins
    }

    fn widths(&self) -> (f64, f64)
    {
        let denom = (self.bins - 2 * self.krad - 1) as f64;
        (
            (self.range_fix[1] - self.range_fix[0]) / denom,
            (self.range_move[1] - self.range_move[0]) / denom,
        )
    }

    fn params_to_internal(&self, p: &DVector<f64>) -> (Vector3<f64>, Vector3<f64>)
    {
        let angles = Vector3::new(
            p[0] * std::f64::consts::PI / 180.,
            p[1] * std::f64::consts::PI / 180.,
            p[2] * std::f64::consts::PI / 180.,
        );
        let shift = Vector3::new(
            p[3] / self.moving.spacing()[0],
            p[4] / self.moving.spacing()[1],
            p[5] / self.moving.spacing()[2],
        );
        (angles, shift)
    }

    fn accumulate(&mut self, p: &DVector<f64>, with_grad: bool) -> Result<(), Error>
    {
        let (angles, shift) = self.params_to_internal(p);
        let rot = crate::transform::rotation_xyz(&angles);
        let dd = rotation_param_derivs(angles[0], angles[1], angles[2]);

        let (wfix, wmove) = self.widths();
        let bins = self.bins;
        let krad = self.krad as i64;

        self.pdf_fix.fill(0.);
        self.pdf_move.fill(0.);
        self.pdf_joint.fill(0.);
        self.dpdf_joint.fill(0.);
        self.dpdf_move.fill(0.);

        let move_vw = LinearInterp::<f64>::new(&self.moving)?;
        let dmove_vw = LinearInterp::<f64>::new(&self.dmoving)?;
        let fix = View::<f64>::new(self.fixed.store())?;
        let stride = self.fixed.store().strides();
        let dims = [self.fixed.dim(0), self.fixed.dim(1), self.fixed.dim(2)];

        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let ind = Vector3::new(x as f64, y as f64, z as f64);
                    let cind = rot * (ind - self.center) + self.center + shift;

                    let g = move_vw.get(&[cind[0], cind[1], cind[2]]);
                    let f = fix.get(x * stride[0] + y * stride[1] + z * stride[2]);

                    let cbin_f =
                        ((f - self.range_fix[0]) / wfix + self.krad as f64).clamp(krad as f64, (bins as i64 - 1 - krad) as f64);
                    let cbin_m =
                        ((g - self.range_move[0]) / wmove + self.krad as f64).clamp(krad as f64, (bins as i64 - 1 - krad) as f64);
                    let bin_f = cbin_f.round() as i64;
                    let bin_m = cbin_m.round() as i64;

                    for ii in (bin_f - krad)..=(bin_f + krad) {
                        let wf = b3_kernel_scaled(ii as f64 - cbin_f, self.krad);
                        if wf == 0. {
                            continue;
                        }
                        for jj in (bin_m - krad)..=(bin_m + krad) {
                            let wm = b3_kernel_scaled(jj as f64 - cbin_m, self.krad);
                            self.pdf_joint[ii as usize * bins + jj as usize] += wf * wm;
                        }
                    }

                    if with_grad {
                        let grad_g = Vector3::new(
                            dmove_vw.get_vec(cind[0], cind[1], cind[2], 0),
                            dmove_vw.get_vec(cind[0], cind[1], cind[2], 1),
                            dmove_vw.get_vec(cind[0], cind[1], cind[2], 2),
                        );
                        let arm = ind - self.center;
                        let dgdp = [
                            (dd[0] * arm).dot(&grad_g),
                            (dd[1] * arm).dot(&grad_g),
                            (dd[2] * arm).dot(&grad_g),
                            grad_g[0],
                            grad_g[1],
                            grad_g[2],
                        ];

                        for (phi, &dg) in dgdp.iter().enumerate() {
                            if dg == 0. {
                                continue;
                            }
                            let base = phi * bins * bins;
                            for ii in (bin_f - krad)..=(bin_f + krad) {
                                let wf = b3_kernel_scaled(ii as f64 - cbin_f, self.krad);
                                if wf == 0. {
                                    continue;
                                }
                                for jj in (bin_m - krad)..=(bin_m + krad) {
                                    let dwm = b3_deriv_scaled(jj as f64 - cbin_m, self.krad);
                                    self.dpdf_joint[base + ii as usize * bins + jj as usize] +=
                                        wf * dwm * dg;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Normalize, marginalize and compute entropies. Returns
    /// `(H_fix, H_move, H_joint, scale)`.
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

fn value_range(img: &OrientedImage, include_zero: bool) -> Result<[f64; 2], Error>
{
    let v = View::<f64>::new(img.store())?;
    let mut lo = if include_zero { 0. } else { f64::INFINITY };
    let mut hi = if include_zero { 0. } else { f64::NEG_INFINITY };
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

impl Metric for RigidInfoMetric
{
    fn n_params(&self) -> usize
    {
        6
    }

    fn value(&mut self, p: &DVector<f64>) -> Result<f64, Error>
    {
        self.accumulate(p, false)?;
        let (hf, hm, hj, _) = self.entropies();
        Ok(self.info_value(hf, hm, hj))
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
        self.accumulate(p, true)?;
        let (hf, hm, hj, scale) = self.entropies();

        let bins = self.bins;
        let tbins = bins * bins;
        let (_, wmove) = self.widths();

        // d(bin)/d(value) chain: the kernel derivative enters with a
        // negative sign through its argument
        let dscale = -scale / wmove;
        for v in &mut self.dpdf_joint {
            *v *= dscale;
        }
        self.dpdf_move.fill(0.);
        for phi in 0..6 {
            for i in 0..bins {
                for j in 0..bins {
                    self.dpdf_move[phi * bins + j] += self.dpdf_joint[phi * tbins + i * bins + j];
                }
            }
        }

        let mut grad_hm = [0f64; 6];
        let mut grad_hj = [0f64; 6];
        for phi in 0..6 {
            for j in 0..bins {
                let pm = self.pdf_move[j];
                if pm > 0. {
                    grad_hm[phi] -= self.dpdf_move[phi * bins + j] * (pm.ln() + 1.);
                }
            }
            for b in 0..tbins {
                let pj = self.pdf_joint[b];
                if pj > 0. {
                    grad_hj[phi] -= self.dpdf_joint[phi * tbins + b] * (pj.ln() + 1.);
                }
            }
        }

        for phi in 0..6 {
            grad[phi] = match self.kind {
                InfoKind::MutualInformation => grad_hm[phi] - grad_hj[phi],
                InfoKind::NormalizedMutualInformation =>
                    grad_hm[phi] / hj - grad_hj[phi] * (hf + hm) / (hj * hj),
                InfoKind::VariationOfInformation => 2. * grad_hj[phi] - grad_hm[phi],
            };
        }

        let deg = std::f64::consts::PI / 180.;
        grad[0] *= deg;
        grad[1] *= deg;
        grad[2] *= deg;
        grad[3] /= self.moving.spacing()[0];
        grad[4] /= self.moving.spacing()[1];
        grad[5] /= self.moving.spacing()[2];

        if self.negates() {
            *grad *= -1.;
        }
        Ok(self.info_value(hf, hm, hj))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::metric::testimg::gaussian_ball;

    #[test]
    fn mi_peaks_at_alignment()
    {
        let img = gaussian_ball(14, 6.5, 6.5, 6.5, 2.5);
        let mut m = RigidInfoMetric::new(&img, &img, InfoKind::MutualInformation, false).unwrap();
        m.set_bins(32, 2).unwrap();
        let aligned = m.value(&DVector::zeros(6)).unwrap();
        let shifted = m
            .value(&DVector::from_vec(vec![0., 0., 0., 2., 0., 0.]))
            .unwrap();
        assert!(aligned > shifted, "MI {} should exceed {}", aligned, shifted);
    }

    #[test]
    fn vi_is_zero_for_identical_alignment()
    {
        // identical images at identity: joint is diagonal, so
        // H_fm = H_f = H_m and VI = 0
        let img = gaussian_ball(12, 5.5, 5.5, 5.5, 2.0);
        let mut m = RigidInfoMetric::new(&img, &img, InfoKind::VariationOfInformation, false).unwrap();
        m.set_bins(32, 2).unwrap();
        let v = m.value(&DVector::zeros(6)).unwrap();
        assert!(v.abs() < 0.2, "VI at identity was {}", v);
    }

    #[test]
    fn difference_mode_negates_mi_not_vi()
    {
        let img = gaussian_ball(12, 5.5, 5.5, 5.5, 2.0);
        let p = DVector::from_vec(vec![0., 0., 0., 1., 0., 0.]);
        for (kind, flips) in [
            (InfoKind::MutualInformation, true),
            (InfoKind::NormalizedMutualInformation, true),
            (InfoKind::VariationOfInformation, false),
        ] {
            let mut plain = RigidInfoMetric::new(&img, &img, kind, false).unwrap();
            let mut diff = RigidInfoMetric::new(&img, &img, kind, true).unwrap();
            plain.set_bins(32, 2).unwrap();
            diff.set_bins(32, 2).unwrap();
            let a = plain.value(&p).unwrap();
            let b = diff.value(&p).unwrap();
            if flips {
                assert!((a + b).abs() < 1e-12);
            } else {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn set_bins_validates()
    {
        let img = gaussian_ball(8, 3.5, 3.5, 3.5, 1.5);
        let mut m = RigidInfoMetric::new(&img, &img, InfoKind::MutualInformation, false).unwrap();
        assert!(m.set_bins(8, 4).is_err());
        assert!(m.set_bins(16, 4).is_ok());
    }
}
