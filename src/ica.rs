// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! FastICA, symmetric and deflationary, over a reduced basis.
//!
//! Both variants first center every column and scale it to unit
//! variance, then search for an orthogonal unmixing matrix under the
//! nonlinearity `g(u) = u exp(-u^2/2)`.

use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Error;
use crate::optimize::StopReason;

const MAX_ITERS: usize = 10_000;
const MAG_THRESH: f64 = 1e-4;
/// smoothing weight for the running nonlinearity average
const ARMA_WEIGHT: f64 = 0.1;

/// Result of an ICA run.
pub struct Ica
{
    /// `S = Y W`: one independent component per column
    pub source: DMatrix<f64>,
    /// the unmixing matrix `W`
    pub unmix: DMatrix<f64>,
    pub reason: StopReason,
}

#[inline]
fn g(u: f64) -> f64
{
    u * (-u * u / 2.).exp()
}

#[inline]
fn dg(u: f64) -> f64
{
    (1. - u * u) * (-u * u / 2.).exp()
}

/// contrast function whose derivative is `g`
#[inline]
fn contrast(u: f64) -> f64
{
    -(-u * u / 2.).exp()
}

/// Center and unit-variance scale every column.
fn standardize(x: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>
{
    let n = x.nrows() as f64;
    if x.nrows() < 2 {
        return Err(Error::invalid_argument("ICA needs at least two samples"));
    }
    let mut out = x.clone();
    for mut col in out.column_iter_mut() {
        let mean = col.sum() / n;
        let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.);
        if var <= 0. {
            return Err(Error::numeric("zero-variance column in ICA input"));
        }
        let sd = var.sqrt();
        for v in col.iter_mut() {
            *v = (*v - mean) / sd;
        }
    }
    Ok(out)
}

/// Symmetric FastICA: all components estimated jointly, decorrelated
/// by the inverse square root of `W W^T` each sweep.
pub fn sym_ica<R: Rng + ?Sized>(xin: &DMatrix<f64>, rng: &mut R) -> Result<Ica, Error>
{
    let x = standardize(xin)?;
    let dims = x.ncols();
    let samples = x.nrows();

    // random orthogonal start
    let mut w = DMatrix::from_fn(dims, dims, |_, _| rng.sample(StandardNormal));
    w = w.qr().q();

    let mut arma = -1e-4;
    let mut reason = StopReason::MaxIters;
    for iter in 0..MAX_ITERS {
        let wprev = w.clone();
        let proj = &x * &wprev;

        let nonlin = proj.iter().map(|&u| contrast(u)).sum::<f64>() / (dims * samples) as f64;
        let improving = nonlin - arma >= 1e-5;
        arma = arma * (1. - ARMA_WEIGHT) + nonlin * ARMA_WEIGHT;

        // W+ = X^T g(X W) - W diag(sum g'(X W))
        let col_dg: DVector<f64> =
            DVector::from_fn(dims, |c, _| proj.column(c).iter().map(|&u| dg(u)).sum());
        let mut wnew = x.transpose() * proj.map(g);
        wnew -= &wprev * DMatrix::from_diagonal(&col_dg);

        // symmetric decorrelation: W (W^T W)^{-1/2} via the eigen
        // decomposition of W+ W+^T
        let eig = SymmetricEigen::new(&wnew * wnew.transpose());
        let mut dinv = eig.eigenvalues.clone();
        for v in dinv.iter_mut() {
            if *v <= 0. {
                return Err(Error::numeric("degenerate unmixing matrix in symmetric ICA"));
            }
            *v = 1. / v.sqrt();
        }
        w = &eig.eigenvectors * DMatrix::from_diagonal(&dinv) * eig.eigenvectors.transpose() * wnew;

        // angle change per component: |max |w_prev^T w|_c - 1|
        let wtw = wprev.transpose() * &w;
        let mag: f64 = (0..dims)
            .map(|c| (wtw.column(c).amax() - 1.).abs())
            .sum();
        debug!("sym_ica iter {}: change {:.3e}, contrast {:.6}", iter, mag, nonlin);

        if mag < MAG_THRESH && !improving {
            reason = StopReason::FDiff;
            break;
        }
    }

    Ok(Ica { source: &x * &w, unmix: w, reason })
}

/// Deflationary FastICA: one component at a time, Gram-Schmidt
/// deflated against those already accepted.
pub fn asym_ica<R: Rng + ?Sized>(xin: &DMatrix<f64>, rng: &mut R) -> Result<Ica, Error>
{
    let x = standardize(xin)?;
    let dims = x.ncols();
    let samples = x.nrows();
    let ncomp = dims.min(samples);

    let mut w = DMatrix::zeros(dims, ncomp);
    let mut reason = StopReason::FDiff;
    for p in 0..ncomp {
        let mut wp: DVector<f64> = DVector::from_fn(dims, |_, _| rng.sample(StandardNormal));
        deflate(&mut wp, &w, p);
        wp.normalize_mut();

        let mut converged = false;
        for iter in 0..MAX_ITERS {
            let wprev = wp.clone();
            let proj = &x * &wprev;

            // w <- X^T g(X w) - w sum g'(X w)
            let sum_dg: f64 = proj.iter().map(|&u| dg(u)).sum();
            wp = x.transpose() * proj.map(g) - &wprev * sum_dg;

            deflate(&mut wp, &w, p);
            let norm = wp.norm();
            if norm == 0. {
                return Err(Error::numeric("deflated direction vanished in ICA"));
            }
            wp /= norm;

            let mag = (1. - wp.dot(&wprev).abs()).abs();
            if mag < MAG_THRESH {
                debug!("asym_ica component {} converged after {} sweeps", p, iter);
                converged = true;
                break;
            }
        }
        if !converged {
            reason = StopReason::MaxIters;
        }
        w.column_mut(p).copy_from(&wp);
    }

    Ok(Ica { source: &x * &w, unmix: w, reason })
}

/// Remove projections onto the first `p` accepted columns of `w`.
fn deflate(v: &mut DVector<f64>, w: &DMatrix<f64>, p: usize)
{
    for j in 0..p {
        let col = w.column(j);
        let d = col.dot(v);
        v.axpy(-d, &col.clone_owned(), 1.);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Two deterministic non-Gaussian sources mixed linearly.
    fn mixed_sources(n: usize) -> (DMatrix<f64>, DMatrix<f64>)
    {
        let mut s = DMatrix::zeros(n, 2);
        for i in 0..n {
            let t = i as f64 / n as f64;
            // a square wave and a sawtooth
            s[(i, 0)] = if (t * 8.).fract() < 0.5 { 1. } else { -1. };
            s[(i, 1)] = 2. * (t * 5.).fract() - 1.;
        }
        let a = DMatrix::from_row_slice(2, 2, &[0.8, 0.3, -0.4, 0.9]);
        let x = &s * a.transpose();
        (s, x)
    }

    fn best_abs_corr(a: &DVector<f64>, s: &DMatrix<f64>) -> f64
    {
        let mut best: f64 = 0.;
        for c in 0..s.ncols() {
            let col = s.column(c).clone_owned();
            let am = a.sum() / a.len() as f64;
            let cm = col.sum() / col.len() as f64;
            let mut num = 0.;
            let mut da = 0.;
            let mut dc = 0.;
            for i in 0..a.len() {
                num += (a[i] - am) * (col[i] - cm);
                da += (a[i] - am).powi(2);
                dc += (col[i] - cm).powi(2);
            }
            best = best.max((num / (da.sqrt() * dc.sqrt())).abs());
        }
        best
    }

    #[test]
    fn symmetric_ica_recovers_sources()
    {
        let (s, x) = mixed_sources(512);
        let mut rng = StdRng::seed_from_u64(5);
        let ica = sym_ica(&x, &mut rng).unwrap();
        for c in 0..2 {
            let comp = ica.source.column(c).clone_owned();
            let corr = best_abs_corr(&comp, &s);
            assert!(corr > 0.95, "component {} correlates only {}", c, corr);
        }
    }

    #[test]
    fn deflation_ica_recovers_sources()
    {
        let (s, x) = mixed_sources(512);
        let mut rng = StdRng::seed_from_u64(17);
        let ica = asym_ica(&x, &mut rng).unwrap();
        for c in 0..2 {
            let comp = ica.source.column(c).clone_owned();
            let corr = best_abs_corr(&comp, &s);
            assert!(corr > 0.95, "component {} correlates only {}", c, corr);
        }
    }

    #[test]
    fn unmixing_is_orthogonal_for_symmetric()
    {
        let (_, x) = mixed_sources(256);
        let mut rng = StdRng::seed_from_u64(2);
        let ica = sym_ica(&x, &mut rng).unwrap();
        let wtw = ica.unmix.transpose() * &ica.unmix;
        let err = (&wtw - DMatrix::identity(2, 2)).norm();
        assert!(err < 1e-6, "W^T W deviates by {}", err);
    }

    #[test]
    fn constant_column_is_rejected()
    {
        let x = DMatrix::from_fn(64, 2, |i, c| if c == 0 { 1. } else { i as f64 });
        let mut rng = StdRng::seed_from_u64(1);
        assert!(sym_ica(&x, &mut rng).is_err());
    }
}
