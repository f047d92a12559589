// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Image-similarity metrics with analytic gradients.
//!
//! A metric owns a fixed/moving image pair and exposes value, gradient
//! and fused value+gradient over a parameter vector; the optimizer
//! consumes nothing else. The PDF accumulators of the information
//! metrics live inside the metric, which is why all three entry points
//! take `&mut self`.

mod correlation;
mod distortion;
mod information;

pub use correlation::RigidCorrMetric;
pub use distortion::DistortionMetric;
pub use information::{InfoKind, RigidInfoMetric};

use nalgebra::DVector;

use crate::error::Error;

/// Which similarity a registration driver should optimize.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetricKind
{
    /// Pearson correlation
    Cor,
    /// mutual information
    Mi,
    /// normalized mutual information
    Nmi,
    /// variation of information
    Vi,
}

/// Value/gradient interface consumed by the optimizer.
pub trait Metric
{
    /// Length of the parameter vector.
    fn n_params(&self) -> usize;

    fn value(&mut self, x: &DVector<f64>) -> Result<f64, Error>;

    fn grad(&mut self, x: &DVector<f64>, g: &mut DVector<f64>) -> Result<(), Error>;

    fn value_grad(&mut self, x: &DVector<f64>, g: &mut DVector<f64>) -> Result<f64, Error>;
}

/// Sample variance from the running sums.
pub(crate) fn sample_var(count: usize, sum: f64, sumsq: f64) -> f64
{
    (sumsq - sum * sum / count as f64) / (count as f64 - 1.)
}

/// Sample Pearson correlation from the running sums.
pub(crate) fn sample_corr(count: usize, sum1: f64, sum2: f64, ss1: f64, ss2: f64, s12: f64) -> f64
{
    let n = count as f64;
    let num = s12 - sum1 * sum2 / n;
    let den = ((ss1 - sum1 * sum1 / n) * (ss2 - sum2 * sum2 / n)).sqrt();
    if den == 0. {
        0.
    } else {
        num / den
    }
}
