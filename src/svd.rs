// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Randomized subspace SVD, in memory or over on-disk tall chunks.
//!
//! The algorithm is the transposed form of Halko-Martinsson-Tropp 4.4:
//! a Gaussian sketch of `X^T`, optional power iterations, rank growth
//! with modified Gram-Schmidt against the accepted basis, then a
//! deterministic thin SVD of the projected matrix. The full matrix is
//! only ever touched through its products.

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Error;
use crate::reorg::MatrixReorg;

/// Thin SVD of a tall matrix: `X ~ u * diag(s) * v^T`.
pub struct TallSvd
{
    /// `rows x k`
    pub u: DMatrix<f64>,
    /// descending singular values
    pub s: DVector<f64>,
    /// `cols x k`
    pub v: DMatrix<f64>,
}

/// A matrix reachable only through its products.
pub trait TallOp
{
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;

    /// `X^T * rhs`
    fn xt_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>;

    /// `X * rhs`
    fn x_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>;
}

impl TallOp for MatrixReorg
{
    fn rows(&self) -> usize
    {
        MatrixReorg::rows(self)
    }

    fn cols(&self) -> usize
    {
        MatrixReorg::cols(self)
    }

    fn xt_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>
    {
        let mut out = DMatrix::zeros(self.cols(), rhs.ncols());
        self.post_mult(&mut out, rhs, true)?;
        Ok(out)
    }

    fn x_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>
    {
        let mut out = DMatrix::zeros(self.rows(), rhs.ncols());
        self.post_mult(&mut out, rhs, false)?;
        Ok(out)
    }
}

impl TallOp for DMatrix<f64>
{
    fn rows(&self) -> usize
    {
        self.nrows()
    }

    fn cols(&self) -> usize
    {
        self.ncols()
    }

    fn xt_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>
    {
        Ok(self.transpose() * rhs)
    }

    fn x_mul(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>
    {
        Ok(self * rhs)
    }
}

fn gaussian_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f64>
{
    DMatrix::from_fn(rows, cols, |_, _| rng.sample(StandardNormal))
}

fn thin_q(m: DMatrix<f64>) -> DMatrix<f64>
{
    m.qr().q()
}

/// Randomized SVD of an operator. `startrank <= 1` selects
/// `ceil(log2(min(rows, cols)))`; `maxrank = 0` allows the full rank.
pub fn subspace_svd<R: Rng + ?Sized>(
    op: &dyn TallOp, tol: f64, startrank: usize, maxrank: usize, power_iters: usize, rng: &mut R,
) -> Result<TallSvd, Error>
{
    let (rows, cols) = (op.rows(), op.cols());
    let mindim = rows.min(cols);
    let startrank = if startrank <= 1 {
        ((mindim as f64).log2().ceil() as usize).max(1)
    } else {
        startrank
    };
    let maxrank = if maxrank == 0 { mindim } else { maxrank.min(cols) };

    let mut q: Option<DMatrix<f64>> = None;
    let mut curank = startrank.min(cols);
    const MAXIT: usize = 1000;
    let mut iters = 0;
    loop {
        iters += 1;
        if iters > MAXIT {
            return Err(Error::runtime("subspace iteration did not converge"));
        }
        let basis_cols = q.as_ref().map_or(0, |q| q.ncols());
        let nextsize = curank.min(cols - basis_cols).max(1);

        let omega = gaussian_matrix(rows, nextsize, rng);
        let mut qtmp = thin_q(op.xt_mul(&omega)?);
        for pi in 0..power_iters {
            debug!("power iteration {}", pi);
            let qhat = thin_q(op.x_mul(&qtmp)?);
            qtmp = thin_q(op.xt_mul(&qhat)?);
        }

        match q.take() {
            None => {
                q = Some(qtmp);
            }
            Some(basis) => {
                // orthogonalize against the accepted basis, twice
                let mut qc = &qtmp - &basis * (basis.transpose() * &qtmp);
                let reproj = &basis * (basis.transpose() * &qc);
                qc -= reproj;

                // modified Gram-Schmidt among the new columns, with
                // tolerance-based rejection
                let mut kept: Vec<DVector<f64>> = Vec::new();
                for c in 0..qc.ncols() {
                    let mut col = qc.column(c).clone_owned();
                    for k in &kept {
                        let d = k.dot(&col);
                        col.axpy(-d, k, 1.);
                    }
                    let norm = col.norm();
                    if norm > tol {
                        kept.push(col / norm);
                    }
                }
                info!("keeping {} new ranks", kept.len());
                if kept.is_empty() {
                    q = Some(basis);
                    break;
                }
                let mut grown = DMatrix::zeros(cols, basis.ncols() + kept.len());
                grown.columns_mut(0, basis.ncols()).copy_from(&basis);
                for (i, k) in kept.iter().enumerate() {
                    grown.column_mut(basis.ncols() + i).copy_from(k);
                }
                q = Some(grown);
            }
        }
        curank = q.as_ref().unwrap().ncols();
        debug!("basis rank {}", curank);
        if curank >= maxrank || curank >= cols {
            break;
        }
    }

    let q = q.expect("at least one pass ran");
    // B = (X Q)^T, then a deterministic thin SVD; the factors swap
    // because the subspace was built for the transposed problem
    let b = op.x_mul(&q)?.transpose();
    let svd = b.svd(true, true);
    let bu = svd.u.ok_or_else(|| Error::runtime("SVD did not produce U"))?;
    let bvt = svd.v_t.ok_or_else(|| Error::runtime("SVD did not produce V^T"))?;

    Ok(TallSvd {
        u: bvt.transpose(),
        s: svd.singular_values,
        v: q * bu,
    })
}

/// Randomized SVD over the on-disk reorganizer.
pub fn on_disk_svd<R: Rng + ?Sized>(
    reorg: &MatrixReorg, tol: f64, startrank: usize, maxrank: usize, power_iters: usize, rng: &mut R,
) -> Result<TallSvd, Error>
{
    subspace_svd(reorg, tol, startrank, maxrank, power_iters, rng)
}

/// Randomized SVD of an in-memory matrix.
pub fn randomized_svd<R: Rng + ?Sized>(
    x: &DMatrix<f64>, tol: f64, startrank: usize, maxrank: usize, power_iters: usize, rng: &mut R,
) -> Result<TallSvd, Error>
{
    subspace_svd(x, tol, startrank, maxrank, power_iters, rng)
}

/// Principal-component projection of a samples-by-dims matrix: the
/// columns are centered and the data projected onto the components
/// holding `var_thresh` of the variance (at most `max_dims` when
/// nonzero).
pub fn pca<R: Rng + ?Sized>(
    x: &DMatrix<f64>, var_thresh: f64, max_dims: usize, rng: &mut R,
) -> Result<DMatrix<f64>, Error>
{
    let n = x.nrows() as f64;
    if x.nrows() < 2 {
        return Err(Error::invalid_argument("PCA needs at least two samples"));
    }
    let mut centered = x.clone();
    for mut col in centered.column_iter_mut() {
        let mean = col.sum() / n;
        for v in col.iter_mut() {
            *v -= mean;
        }
    }

    let svd = subspace_svd(&centered, 1e-12, 0, 0, 2, rng)?;
    // variance is the squared spectrum
    let energy = DVector::from_fn(svd.s.len(), |i, _| svd.s[i] * svd.s[i]);
    let mut k = rank_for_variance(&energy, var_thresh).max(1);
    if max_dims > 0 {
        k = k.min(max_dims);
    }
    info!("pca keeping {} of {} components", k, svd.s.len());
    Ok(&centered * svd.v.columns(0, k))
}

/// Smallest rank whose cumulative spectrum share reaches `threshold`
/// of the total.
pub fn rank_for_variance(s: &DVector<f64>, threshold: f64) -> usize
{
    let total: f64 = s.iter().sum();
    if total <= 0. {
        return 0;
    }
    let mut acc = 0.;
    for (i, &v) in s.iter().enumerate() {
        acc += v;
        if acc >= threshold * total {
            return i + 1;
        }
    }
    s.len()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn low_rank_matrix(rng: &mut StdRng, rows: usize, cols: usize, rank: usize) -> DMatrix<f64>
    {
        let a = gaussian_matrix(rows, rank, rng);
        let b = gaussian_matrix(rank, cols, rng);
        a * b
    }

    #[test]
    fn reconstructs_exact_low_rank()
    {
        let mut rng = StdRng::seed_from_u64(7);
        let x = low_rank_matrix(&mut rng, 60, 40, 5);
        let svd = randomized_svd(&x, 1e-10, 8, 20, 2, &mut rng).unwrap();
        let k = 5;
        let approx = svd.u.columns(0, k)
            * DMatrix::from_diagonal(&svd.s.rows(0, k).clone_owned())
            * svd.v.columns(0, k).transpose();
        let err = (&x - approx).norm() / x.norm();
        assert!(err < 1e-8, "relative error {}", err);
    }

    #[test]
    fn singular_values_descend()
    {
        let mut rng = StdRng::seed_from_u64(3);
        let x = low_rank_matrix(&mut rng, 30, 30, 8);
        let svd = randomized_svd(&x, 1e-10, 10, 20, 1, &mut rng).unwrap();
        for i in 1..svd.s.len() {
            assert!(svd.s[i] <= svd.s[i - 1] + 1e-12);
        }
    }

    #[test]
    fn factors_are_orthonormal()
    {
        let mut rng = StdRng::seed_from_u64(11);
        let x = low_rank_matrix(&mut rng, 25, 18, 6);
        let svd = randomized_svd(&x, 1e-10, 8, 12, 2, &mut rng).unwrap();
        let k = 6.min(svd.v.ncols());
        let vtv = svd.v.columns(0, k).transpose() * svd.v.columns(0, k);
        let err = (&vtv - DMatrix::identity(k, k)).norm();
        assert!(err < 1e-8, "V^T V deviates by {}", err);
    }

    #[test]
    fn matches_dense_svd_spectrum()
    {
        let mut rng = StdRng::seed_from_u64(21);
        let x = low_rank_matrix(&mut rng, 40, 32, 10);
        let dense = x.clone().svd(false, false);
        let rsvd = randomized_svd(&x, 1e-10, 12, 20, 3, &mut rng).unwrap();
        for i in 0..10 {
            let rel = (dense.singular_values[i] - rsvd.s[i]).abs() / dense.singular_values[i];
            assert!(rel < 0.05, "singular value {} off by {}", i, rel);
        }
    }

    #[test]
    fn pca_reduces_to_the_informative_directions()
    {
        let mut rng = StdRng::seed_from_u64(19);
        // 2 strong directions + small isotropic noise in 6 dims
        let n = 200;
        let mut x = DMatrix::zeros(n, 6);
        for i in 0..n {
            let a = (i as f64 / 7.).sin() * 5.;
            let b = (i as f64 / 11.).cos() * 3.;
            for d in 0..6 {
                let w = gaussian_matrix(1, 1, &mut rng)[(0, 0)] * 0.01;
                x[(i, d)] = a * ((d % 2) as f64) + b * (((d + 1) % 2) as f64) + w;
            }
        }
        let reduced = pca(&x, 0.99, 0, &mut rng).unwrap();
        assert_eq!(reduced.nrows(), n);
        assert!(reduced.ncols() <= 3, "kept {} dims", reduced.ncols());
        // kept coordinates are centered
        for c in 0..reduced.ncols() {
            let mean = reduced.column(c).sum() / n as f64;
            assert!(mean.abs() < 1e-9);
        }
    }

    #[test]
    fn variance_rank_cut()
    {
        let s = DVector::from_vec(vec![5., 3., 1.5, 0.4, 0.1]);
        assert_eq!(rank_for_variance(&s, 0.5), 1);
        assert_eq!(rank_for_variance(&s, 0.8), 2);
        assert_eq!(rank_for_variance(&s, 1.0), 5);
        assert_eq!(rank_for_variance(&DVector::zeros(3), 0.9), 0);
    }

    #[test]
    fn deterministic_under_a_fixed_seed()
    {
        let x = {
            let mut rng = StdRng::seed_from_u64(1);
            low_rank_matrix(&mut rng, 20, 15, 4)
        };
        let a = randomized_svd(&x, 1e-10, 6, 10, 1, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = randomized_svd(&x, 1e-10, 6, 10, 1, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.s.len(), b.s.len());
        for i in 0..a.s.len() {
            assert!((a.s[i] - b.s[i]).abs() < 1e-14);
        }
    }
}
