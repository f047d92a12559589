// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Continuous sampling of oriented images.
//!
//! Three samplers share one contract: input is a continuous index (or
//! a physical point when `in_ras` is set), output is a value of the
//! view type, and out-of-range neighbors are resolved by a
//! [`BoundaryPolicy`] instead of an error. Complex and color stores
//! interpolate component-wise through the typed-view cast.

use crate::error::Error;
use crate::image::OrientedImage;
use crate::kind::{Rgb, Rgba, Sample, Scalar};
use crate::view::View;

use num_complex::{Complex32, Complex64};

/// Resolution of samples outside the array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BoundaryPolicy
{
    /// Clamp each out-of-range axis to `[0, dim-1]`.
    #[default]
    ZeroFlux,
    /// Fold each axis modularly into `[0, dim-1]`.
    Wrap,
    /// Out-of-range samples contribute zero.
    ConstZero,
}

impl BoundaryPolicy
{
    /// Resolve one axis index; `None` means the sample contributes
    /// nothing.
    #[inline]
    pub fn resolve(self, idx: i64, len: usize) -> Option<usize>
    {
        let n = len as i64;
        if (0..n).contains(&idx) {
            return Some(idx as usize);
        }
        match self {
            BoundaryPolicy::ZeroFlux => Some(idx.clamp(0, n - 1) as usize),
            BoundaryPolicy::Wrap => Some(idx.rem_euclid(n) as usize),
            BoundaryPolicy::ConstZero => None,
        }
    }
}

/// Tent weight for linear interpolation.
#[inline]
pub fn lin_kern(x: f64) -> f64
{
    (1. - x.abs().min(1.)).abs()
}

/// Lanczos kernel of the given radius.
pub fn lanczos_kern(x: f64, radius: usize) -> f64
{
    let r = radius as f64;
    if x == 0. {
        return 1.;
    }
    if x.abs() >= r {
        return 0.;
    }
    let px = std::f64::consts::PI * x;
    (px.sin() / px) * ((px / r).sin() / (px / r))
}

/// A value type that supports weighted accumulation, component-wise
/// for complex and color values.
pub trait Interpolable: Scalar
{
    type Accum: Copy + Default;

    fn accumulate(acc: &mut Self::Accum, w: f64, v: Self);
    fn finish(acc: Self::Accum) -> Self;
    fn zero() -> Self
    {
        Self::from_sample(Sample::Real(0.))
    }
}

macro_rules! real_interpolable {
    ($($t:ty),*) => {
        $(
        impl Interpolable for $t
        {
            type Accum = f64;

            #[inline]
            fn accumulate(acc: &mut f64, w: f64, v: Self)
            {
                *acc += w * v.into_sample().as_f64();
            }

            #[inline]
            fn finish(acc: f64) -> Self
            {
                Self::from_sample(Sample::Real(acc))
            }
        }
        )*
    };
}

real_interpolable!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Interpolable for Complex64
{
    type Accum = Complex64;

    #[inline]
    fn accumulate(acc: &mut Complex64, w: f64, v: Self)
    {
        *acc += v * w;
    }

    #[inline]
    fn finish(acc: Complex64) -> Self
    {
        acc
    }
}

impl Interpolable for Complex32
{
    type Accum = Complex64;

    #[inline]
    fn accumulate(acc: &mut Complex64, w: f64, v: Self)
    {
        *acc += Complex64::new(v.re as f64, v.im as f64) * w;
    }

    #[inline]
    fn finish(acc: Complex64) -> Self
    {
        Complex32::new(acc.re as f32, acc.im as f32)
    }
}

macro_rules! color_interpolable {
    ($t:ty, $n:expr) => {
        impl Interpolable for $t
        {
            type Accum = [f64; 4];

            #[inline]
            fn accumulate(acc: &mut [f64; 4], w: f64, v: Self)
            {
                for c in 0..$n {
                    acc[c] += w * v.0[c] as f64;
                }
            }

            #[inline]
            fn finish(acc: [f64; 4]) -> Self
            {
                let mut out = <$t>::default();
                for c in 0..$n {
                    out.0[c] = acc[c].clamp(0., 255.).round() as u8;
                }
                out
            }
        }
    };
}

color_interpolable!(Rgb, 3);
color_interpolable!(Rgba, 4);

fn continuous_index(img: &OrientedImage, input: &[f64], in_ras: bool, out: &mut [f64; 8]) -> usize
{
    let n = img.rank();
    if in_ras {
        let ci = img.point_to_index(input);
        for d in 0..n {
            out[d] = ci[d];
        }
    } else {
        for d in 0..n {
            out[d] = input.get(d).copied().unwrap_or(0.);
        }
    }
    n
}

/// Nearest-neighbor sampler.
pub struct NearestInterp<'a, T: Interpolable>
{
    img: &'a OrientedImage,
    view: View<'a, T>,
    pub policy: BoundaryPolicy,
    pub in_ras: bool,
}

impl<'a, T: Interpolable> NearestInterp<'a, T>
{
    pub fn new(img: &'a OrientedImage) -> Result<Self, Error>
    {
        Ok(NearestInterp {
            img,
            view: View::new(img.store())?,
            policy: BoundaryPolicy::default(),
            in_ras: false,
        })
    }

    pub fn get(&self, index: &[f64]) -> T
    {
        let mut ci = [0f64; 8];
        let n = continuous_index(self.img, index, self.in_ras, &mut ci);
        let mut idx = [0usize; 8];
        for d in 0..n {
            match self.policy.resolve(ci[d].round() as i64, self.img.dim(d)) {
                Some(i) => idx[d] = i,
                None => return T::zero(),
            }
        }
        self.view.get_nd(&idx[..n])
    }
}

/// Multilinear sampler. Corners with zero aggregate weight are
/// skipped, so NaNs in zero-weighted regions do not propagate.
pub struct LinearInterp<'a, T: Interpolable>
{
    img: &'a OrientedImage,
    view: View<'a, T>,
    pub policy: BoundaryPolicy,
    pub in_ras: bool,
}

impl<'a, T: Interpolable> LinearInterp<'a, T>
{
    pub fn new(img: &'a OrientedImage) -> Result<Self, Error>
    {
        Ok(LinearInterp {
            img,
            view: View::new(img.store())?,
            policy: BoundaryPolicy::default(),
            in_ras: false,
        })
    }

    pub fn get(&self, index: &[f64]) -> T
    {
        let mut ci = [0f64; 8];
        let n = continuous_index(self.img, index, self.in_ras, &mut ci);
        self.sample_over(&ci[..n], n, 0)
    }

    /// Sample at `(x, y, z)` of a 3-or-higher-rank image, reading the
    /// flattened higher-dimension element `t`. Interpolation runs over
    /// the first three axes only.
    pub fn get_vec(&self, x: f64, y: f64, z: f64, t: usize) -> T
    {
        debug_assert!(self.img.rank() >= 3 && t < self.img.tlen());
        let ci = [x, y, z];
        self.sample_over(&ci, 3, t)
    }

    fn sample_over(&self, ci: &[f64], n: usize, textra: usize) -> T
    {
        let store = self.img.store();
        let stride = store.strides();

        let mut base = [0i64; 8];
        let mut w = [[0f64; 2]; 8];
        for d in 0..n {
            let lo = ci[d].floor();
            base[d] = lo as i64;
            w[d][0] = lin_kern(lo - ci[d]);
            w[d][1] = lin_kern(lo + 1. - ci[d]);
        }

        let mut acc = T::Accum::default();
        for corner in 0..(1usize << n) {
            let mut weight = 1.;
            let mut flat = textra;
            let mut keep = true;
            for d in 0..n {
                let hi = (corner >> d) & 1;
                weight *= w[d][hi];
                if weight == 0. {
                    keep = false;
                    break;
                }
                match self.policy.resolve(base[d] + hi as i64, store.dim(d)) {
                    Some(i) => flat += i * stride[d],
                    None => {
                        keep = false;
                        break;
                    }
                }
            }
            if keep && weight != 0. {
                T::accumulate(&mut acc, weight, self.view.get(flat));
            }
        }
        T::finish(acc)
    }
}

/// Separable Lanczos sampler of configurable radius (default 2).
pub struct LanczosInterp<'a, T: Interpolable>
{
    img: &'a OrientedImage,
    view: View<'a, T>,
    pub policy: BoundaryPolicy,
    pub in_ras: bool,
    radius: usize,
}

impl<'a, T: Interpolable> LanczosInterp<'a, T>
{
    pub fn new(img: &'a OrientedImage) -> Result<Self, Error>
    {
        Ok(LanczosInterp {
            img,
            view: View::new(img.store())?,
            policy: BoundaryPolicy::default(),
            in_ras: false,
            radius: 2,
        })
    }

    pub fn set_radius(&mut self, radius: usize)
    {
        // the per-axis tap buffer holds up to 2*7+1 kernel values
        self.radius = radius.clamp(1, 7);
    }

    pub fn radius(&self) -> usize
    {
        self.radius
    }

    pub fn get(&self, index: &[f64]) -> T
    {
        let mut ci = [0f64; 8];
        let n = continuous_index(self.img, index, self.in_ras, &mut ci);
        let store = self.img.store();
        let stride = store.strides();
        let r = self.radius as i64;
        let width = (2 * r + 1) as usize;

        // per-axis centers and kernel values
        let mut center = [0i64; 8];
        let mut kval = [[0f64; 16]; 8];
        for d in 0..n {
            center[d] = ci[d].round() as i64;
            for (j, off) in (-r..=r).enumerate() {
                kval[d][j] = lanczos_kern((center[d] + off) as f64 - ci[d], self.radius);
            }
        }

        let mut acc = T::Accum::default();
        let mut counter = [0usize; 8];
        'outer: loop {
            let mut weight = 1.;
            let mut flat = 0usize;
            let mut keep = true;
            for d in 0..n {
                weight *= kval[d][counter[d]];
                if weight == 0. {
                    keep = false;
                    break;
                }
                let idx = center[d] + counter[d] as i64 - r;
                match self.policy.resolve(idx, store.dim(d)) {
                    Some(i) => flat += i * stride[d],
                    None => {
                        keep = false;
                        break;
                    }
                }
            }
            if keep && weight != 0. {
                T::accumulate(&mut acc, weight, self.view.get(flat));
            }

            let mut d = n;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                counter[d] += 1;
                if counter[d] < width {
                    break;
                }
                counter[d] = 0;
            }
        }
        T::finish(acc)
    }
}
