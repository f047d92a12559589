// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Limited-memory BFGS over a [`Metric`].
//!
//! The optimizer performs no I/O and never raises on non-convergence:
//! every run ends with a [`StopReason`]. Cancellation is cooperative,
//! by setting `max_iters` to zero between runs.

use std::collections::VecDeque;

use log::debug;
use nalgebra::DVector;

use crate::error::Error;
use crate::metric::Metric;

/// Why the optimizer stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason
{
    /// step length fell below `stop_x`
    XDiff,
    /// gradient norm fell below `stop_g`
    GradNorm,
    /// value change fell below `stop_f`
    FDiff,
    /// value fell below `stop_f_under`
    FUnder,
    /// iteration budget exhausted
    MaxIters,
    /// no descent step could be found
    LineSearchFailed,
}

impl StopReason
{
    /// Whether the stop indicates convergence rather than exhaustion.
    pub fn converged(self) -> bool
    {
        matches!(self, StopReason::XDiff | StopReason::GradNorm | StopReason::FDiff | StopReason::FUnder)
    }
}

/// L-BFGS with backtracking Armijo line search.
#[derive(Clone, Debug)]
pub struct Lbfgs
{
    /// curvature-pair history length
    pub history: usize,
    /// stop when the step norm falls below this
    pub stop_x: f64,
    /// stop when the gradient norm falls below this
    pub stop_g: f64,
    /// stop when the value improvement falls below this
    pub stop_f: f64,
    /// optional hard lower bound on the value
    pub stop_f_under: Option<f64>,
    pub max_iters: usize,
}

impl Default for Lbfgs
{
    fn default() -> Self
    {
        Lbfgs {
            history: 6,
            stop_x: 1e-9,
            stop_g: 1e-7,
            stop_f: 1e-10,
            stop_f_under: None,
            max_iters: 200,
        }
    }
}

impl Lbfgs
{
    /// Minimize `metric` starting from `x`, updating it in place.
    pub fn minimize(&self, metric: &mut dyn Metric, x: &mut DVector<f64>) -> Result<StopReason, Error>
    {
        let n = x.len();
        if n != metric.n_params() {
            return Err(Error::invalid_argument("parameter vector length does not match metric"));
        }
        if self.max_iters == 0 {
            return Ok(StopReason::MaxIters);
        }

        let mut g = DVector::zeros(n);
        let mut f = metric.value_grad(x, &mut g)?;
        // (s, y, 1/s'y) pairs, most recent in back
        let mut pairs: VecDeque<(DVector<f64>, DVector<f64>, f64)> = VecDeque::new();

        for iter in 0..self.max_iters {
            if let Some(bound) = self.stop_f_under {
                if f < bound {
                    return Ok(StopReason::FUnder);
                }
            }
            let gnorm = g.norm();
            if gnorm < self.stop_g {
                return Ok(StopReason::GradNorm);
            }

            let dir = two_loop(&pairs, &g);

            // descent check; fall back to steepest descent otherwise
            let mut dir = dir;
            if dir.dot(&g) >= 0. {
                pairs.clear();
                dir = -&g;
            }

            // backtracking Armijo search
            let dg = dir.dot(&g);
            let mut alpha = 1.0f64;
            let c1 = 1e-4;
            let mut moved = false;
            let mut f_new = f;
            let mut x_new = x.clone();
            for _ in 0..32 {
                x_new = &*x + &dir * alpha;
                match metric.value(&x_new) {
                    Ok(v) if v.is_finite() && v <= f + c1 * alpha * dg => {
                        f_new = v;
                        moved = true;
                        break;
                    }
                    // NaN in the accumulation reads as "no move here"
                    Ok(_) | Err(_) => alpha *= 0.5,
                }
            }
            if !moved {
                if pairs.is_empty() {
                    return Ok(StopReason::LineSearchFailed);
                }
                // stale curvature: restart from steepest descent
                pairs.clear();
                continue;
            }

            let step = &x_new - &*x;
            let mut g_new = DVector::zeros(n);
            let f_checked = metric.value_grad(&x_new, &mut g_new)?;
            debug!(
                "lbfgs iter {}: f {} -> {} (step {:.3e}, |g| {:.3e})",
                iter,
                f,
                f_checked,
                step.norm(),
                g_new.norm()
            );

            let y = &g_new - &g;
            let sy = step.dot(&y);
            if sy > 1e-12 {
                if pairs.len() == self.history {
                    pairs.pop_front();
                }
                pairs.push_back((step.clone(), y, 1. / sy));
            }

            let df = (f - f_new).abs();
            let dx = step.norm();
            *x = x_new;
            f = f_new;
            g = g_new;

            if dx < self.stop_x {
                return Ok(StopReason::XDiff);
            }
            if df < self.stop_f {
                return Ok(StopReason::FDiff);
            }
        }
        Ok(StopReason::MaxIters)
    }
}

fn two_loop(pairs: &VecDeque<(DVector<f64>, DVector<f64>, f64)>, g: &DVector<f64>) -> DVector<f64>
{
    let mut q = g.clone();
    let mut alphas = Vec::with_capacity(pairs.len());
    for (s, y, rho) in pairs.iter().rev() {
        let a = rho * s.dot(&q);
        q.axpy(-a, y, 1.);
        alphas.push(a);
    }
    // initial Hessian scaling from the most recent pair
    if let Some((s, y, _)) = pairs.back() {
        let gamma = s.dot(y) / y.dot(y);
        q *= gamma;
    }
    for ((s, y, rho), a) in pairs.iter().zip(alphas.into_iter().rev()) {
        let b = rho * y.dot(&q);
        q.axpy(a - b, s, 1.);
    }
    -q
}
