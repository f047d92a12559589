// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! K-means and Gaussian-mixture classifiers, used to post-process
//! component maps. Samples are rows; both classifiers seed from the
//! probabilistic farthest-point heuristic.

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::error::Error;
use crate::optimize::StopReason;

/// k-means++-style probabilistic seeding: each next center is drawn
/// with probability proportional to the squared distance from the
/// centers chosen so far.
pub fn approx_kmeans<R: Rng + ?Sized>(
    samples: &DMatrix<f64>, nclass: usize, rng: &mut R,
) -> Result<DMatrix<f64>, Error>
{
    let npoints = samples.nrows();
    let ndim = samples.ncols();
    if nclass == 0 || npoints < nclass {
        return Err(Error::invalid_argument("need at least as many samples as classes"));
    }

    let mut means = DMatrix::zeros(nclass, ndim);
    let first = rng.random_range(0..npoints);
    means.row_mut(0).copy_from(&samples.row(first));

    let mut dists = vec![0f64; npoints];
    for cc in 1..nclass {
        let mut norm = 0.;
        for (pp, d) in dists.iter_mut().enumerate() {
            let mut best = f64::INFINITY;
            for tt in 0..cc {
                let v = (samples.row(pp) - means.row(tt)).norm_squared();
                best = best.min(v);
            }
            *d = best;
            norm += best;
        }
        // walk the cdf to a random fraction of the total mass
        let mut pct = norm * rng.random::<f64>();
        let mut chosen = npoints - 1;
        for (pp, &d) in dists.iter().enumerate() {
            pct -= d;
            if pct <= 0. {
                chosen = pp;
                break;
            }
        }
        means.row_mut(cc).copy_from(&samples.row(chosen));
    }
    Ok(means)
}

/// Hard-assignment k-means.
pub struct KMeans
{
    k: usize,
    means: DMatrix<f64>,
    valid: bool,
    pub max_iters: usize,
}

impl KMeans
{
    pub fn new(ndim: usize, k: usize) -> KMeans
    {
        KMeans { k, means: DMatrix::zeros(k, ndim), valid: false, max_iters: 100 }
    }

    pub fn means(&self) -> &DMatrix<f64>
    {
        &self.means
    }

    /// Replace the centroids directly.
    pub fn set_means(&mut self, means: DMatrix<f64>) -> Result<(), Error>
    {
        if means.nrows() != self.k || means.ncols() != self.means.ncols() {
            return Err(Error::invalid_argument("centroid matrix has the wrong shape"));
        }
        self.means = means;
        self.valid = true;
        Ok(())
    }

    /// Nearest-centroid labels for each sample row.
    pub fn classify(&self, samples: &DMatrix<f64>) -> Result<Vec<usize>, Error>
    {
        let mut classes = vec![0usize; samples.nrows()];
        self.classify_into(samples, &mut classes)?;
        Ok(classes)
    }

    /// Classify in place; returns how many labels changed.
    pub fn classify_into(&self, samples: &DMatrix<f64>, classes: &mut [usize]) -> Result<usize, Error>
    {
        if !self.valid {
            return Err(Error::invalid_argument("classifier has not been initialized"));
        }
        if samples.ncols() != self.means.ncols() || classes.len() != samples.nrows() {
            return Err(Error::invalid_argument("sample dimensions do not match classifier"));
        }
        let mut changed = 0;
        for rr in 0..samples.nrows() {
            let mut best = f64::INFINITY;
            let mut bestc = 0;
            for kk in 0..self.k {
                let d = (samples.row(rr) - self.means.row(kk)).norm_squared();
                if d < best {
                    best = d;
                    bestc = kk;
                }
            }
            if classes[rr] != bestc {
                changed += 1;
            }
            classes[rr] = bestc;
        }
        Ok(changed)
    }

    fn update_means(&mut self, samples: &DMatrix<f64>, classes: &[usize])
    {
        self.means.fill(0.);
        let mut counts = vec![0usize; self.k];
        for (rr, &c) in classes.iter().enumerate() {
            let mut row = self.means.row_mut(c);
            row += samples.row(rr);
            counts[c] += 1;
        }
        for (c, &n) in counts.iter().enumerate() {
            if n > 0 {
                let mut row = self.means.row_mut(c);
                row /= n as f64;
            }
        }
    }

    /// Lloyd iterations until no label changes or the budget runs out.
    pub fn update<R: Rng + ?Sized>(
        &mut self, samples: &DMatrix<f64>, reinit: bool, rng: &mut R,
    ) -> Result<StopReason, Error>
    {
        if reinit || !self.valid {
            self.means = approx_kmeans(samples, self.k, rng)?;
            self.valid = true;
        }
        let mut classes = vec![0usize; samples.nrows()];
        self.classify_into(samples, &mut classes)?;
        self.update_means(samples, &classes);
        for it in 0..self.max_iters {
            let changed = self.classify_into(samples, &mut classes)?;
            debug!("kmeans iter {}: {} changed", it, changed);
            if changed == 0 {
                return Ok(StopReason::FDiff);
            }
            self.update_means(samples, &classes);
        }
        Ok(StopReason::MaxIters)
    }
}

/// Full-covariance Gaussian-mixture EM.
pub struct ExpMax
{
    k: usize,
    ndim: usize,
    /// one mean per row
    means: DMatrix<f64>,
    /// `k` stacked `ndim x ndim` covariance blocks
    covs: DMatrix<f64>,
    tau: DVector<f64>,
    log_likelihood: f64,
    valid: bool,
    pub max_iters: usize,
}

impl ExpMax
{
    pub fn new(ndim: usize, k: usize) -> ExpMax
    {
        ExpMax {
            k,
            ndim,
            means: DMatrix::zeros(k, ndim),
            covs: DMatrix::zeros(k * ndim, ndim),
            tau: DVector::zeros(k),
            log_likelihood: f64::MIN,
            valid: false,
            max_iters: 100,
        }
    }

    pub fn means(&self) -> &DMatrix<f64>
    {
        &self.means
    }

    pub fn tau(&self) -> &DVector<f64>
    {
        &self.tau
    }

    pub fn log_likelihood(&self) -> f64
    {
        self.log_likelihood
    }

    /// Most probable component per sample.
    pub fn classify(&self, samples: &DMatrix<f64>) -> Result<Vec<usize>, Error>
    {
        if !self.valid {
            return Err(Error::invalid_argument("classifier has not been initialized"));
        }
        let mut prob = DMatrix::zeros(samples.nrows(), self.k);
        // responsibilities without reseeding
        self.responsibilities(samples, &mut prob)?;
        Ok((0..samples.nrows())
            .map(|rr| {
                let row = prob.row(rr);
                (0..self.k).max_by(|&a, &b| row[a].partial_cmp(&row[b]).unwrap()).unwrap()
            })
            .collect())
    }

    /// E-step: fill `prob` with row-normalized responsibilities and
    /// return the accumulated log-likelihood of the unnormalized
    /// densities.
    fn responsibilities(&self, samples: &DMatrix<f64>, prob: &mut DMatrix<f64>) -> Result<f64, Error>
    {
        let n = samples.nrows();
        let d = self.ndim;
        let mut loglike = 0.;
        for cc in 0..self.k {
            let (cinv, logdet) = if self.tau[cc] > 0. {
                let cov = self.covs.rows(cc * d, d).clone_owned();
                let chol = nalgebra::Cholesky::new(cov)
                    .ok_or_else(|| Error::numeric("degenerate covariance in EM"))?;
                let logdet = 2. * (0..d).map(|i| chol.l()[(i, i)].ln()).sum::<f64>();
                (chol.inverse(), logdet)
            } else {
                // empty component: infinitely wide, never the argmax
                (DMatrix::from_element(d, d, f64::INFINITY), 1.)
            };
            let cval = if self.tau[cc] > 0. {
                self.tau[cc].ln() - 0.5 * logdet - d as f64 / 2. * (2. * std::f64::consts::PI).ln()
            } else {
                f64::NEG_INFINITY
            };
            for pp in 0..n {
                let x = (samples.row(pp) - self.means.row(cc)).transpose();
                let mut ll = cval - 0.5 * (x.dot(&(&cinv * &x)));
                if !ll.is_finite() {
                    ll = f64::NEG_INFINITY;
                } else {
                    loglike += ll;
                }
                prob[(pp, cc)] = ll.exp();
            }
        }
        for mut row in prob.row_iter_mut() {
            let s = row.sum();
            if s > 0. {
                row /= s;
            }
        }
        Ok(loglike)
    }

    /// E-step plus empty-component reseeding. Returns `|delta logL|`.
    fn expectation<R: Rng + ?Sized>(
        &mut self, samples: &DMatrix<f64>, prob: &mut DMatrix<f64>, rng: &mut R,
    ) -> Result<f64, Error>
    {
        let newll = self.responsibilities(samples, prob)?;

        if self.tau.iter().any(|&t| t <= 0.) {
            // points confidently owned by a dead component get fresh
            // random responsibilities
            const RAND_FACTOR: f64 = 10.;
            let mut reseeded = 0usize;
            for pp in 0..samples.nrows() {
                let row = prob.row(pp);
                let maxp = (0..self.k).map(|c| row[c]).fold(f64::MIN, f64::max);
                let p_reseed = (1. - maxp).powf(RAND_FACTOR);
                if rng.random::<f64>() < p_reseed {
                    reseeded += 1;
                    for c in 0..self.k {
                        prob[(pp, c)] = rng.random::<f64>();
                    }
                }
            }
            debug!("EM reseeded {} samples", reseeded);
        }

        let delta = (newll - self.log_likelihood).abs();
        self.log_likelihood = newll;
        Ok(delta)
    }

    /// M-step: responsibilities-weighted priors, means and
    /// covariances.
    fn maximize(&mut self, samples: &DMatrix<f64>, prob: &DMatrix<f64>)
    {
        let n = samples.nrows();
        let d = self.ndim;
        let total: f64 = prob.sum();
        for cc in 0..self.k {
            let wsum: f64 = prob.column(cc).sum();
            self.tau[cc] = wsum / total;

            let mut mean = DVector::zeros(d);
            for pp in 0..n {
                mean.axpy(prob[(pp, cc)], &samples.row(pp).transpose(), 1.);
            }
            if wsum > 0. {
                mean /= wsum;
            }
            self.means.row_mut(cc).copy_from(&mean.transpose());

            let mut cov = DMatrix::zeros(d, d);
            for pp in 0..n {
                let x = samples.row(pp).transpose() - &mean;
                cov.ger(prob[(pp, cc)], &x, &x, 1.);
            }
            if wsum > 0. {
                cov /= wsum;
            }
            // keep the covariance safely positive definite
            for i in 0..d {
                cov[(i, i)] += 1e-9;
            }
            self.covs.rows_mut(cc * d, d).copy_from(&cov);
        }
    }

    /// Run EM until `|delta logL| <= 1` or the budget runs out.
    pub fn update<R: Rng + ?Sized>(
        &mut self, samples: &DMatrix<f64>, reinit: bool, rng: &mut R,
    ) -> Result<StopReason, Error>
    {
        let n = samples.nrows();
        let mut prob = DMatrix::zeros(n, self.k);
        self.log_likelihood = f64::MIN;

        if reinit || !self.valid {
            // hard k-means++ assignment as the starting point
            let means = approx_kmeans(samples, self.k, rng)?;
            let mut km = KMeans::new(self.ndim, self.k);
            km.set_means(means)?;
            let classes = km.classify(samples)?;
            prob.fill(0.);
            for (pp, &c) in classes.iter().enumerate() {
                prob[(pp, c)] = 1.;
            }
            self.maximize(samples, &prob);
            self.valid = true;
        }

        for it in 0..self.max_iters {
            let delta = self.expectation(samples, &mut prob, rng)?;
            self.maximize(samples, &prob);
            debug!("EM iter {}: logL {} (delta {})", it, self.log_likelihood, delta);
            if delta <= 1. {
                return Ok(StopReason::FDiff);
            }
        }
        Ok(StopReason::MaxIters)
    }
}
