//! Separable spatial filters over oriented images: Gaussian
//! smoothing, decimation, and central-difference gradients.
//!
//! Every output is a fresh image carrying the input's orientation
//! metadata; downsampling scales the spacing so physical positions of
//! kept samples are preserved.

use nalgebra::DVector;

use crate::error::Error;
use crate::image::OrientedImage;
use crate::kind::ScalarKind;
use crate::slicer::Slicer;
use crate::store::ArrayStore;
use crate::view::{View, ViewMut};

/// Normalized Gaussian taps out to three standard deviations.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64>
{
    if sigma <= 0. {
        return vec![1.];
    }
    let radius = (3. * sigma).ceil() as i64;
    let mut taps: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i as f64) * (i as f64) / (2. * sigma * sigma)).exp())
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

/// Gaussian-smooth the spatial axes (the first three, or fewer for
/// lower rank) with zero-flux boundaries. The result is `Float64`.
pub fn smooth(img: &OrientedImage, sigma: f64) -> Result<OrientedImage, Error>
{
    let mut out = img.copy_cast(ScalarKind::Float64)?;
    if sigma <= 0. {
        return Ok(out);
    }
    let taps = gaussian_kernel(sigma);
    let radius = (taps.len() / 2) as i64;
    let spatial = img.rank().min(3);

    let dims = out.shape().to_vec();
    let strides = out.store().strides().to_vec();
    for axis in 0..spatial {
        let src = out.store().clone();
        let src_view = View::<f64>::new(&src)?;
        let store = out.store_mut();
        store.make_unique();
        let mut dst = ViewMut::<f64>::new(store)?;

        let mut sl = Slicer::new(&dims)?;
        // walk the filtered axis fastest so the window is contiguous
        sl.set_order(&[axis], false)?;
        for flat in sl {
            let pos_along = (flat / strides[axis]) % dims[axis];
            let mut acc = 0.;
            for (j, &w) in taps.iter().enumerate() {
                let off = j as i64 - radius;
                let neighbor = (pos_along as i64 + off).clamp(0, dims[axis] as i64 - 1);
                let nflat = (flat as i64 + (neighbor - pos_along as i64) * strides[axis] as i64) as usize;
                acc += w * src_view.get(nflat);
            }
            dst.set(flat, acc);
        }
    }
    Ok(out)
}

/// Keep every `factor`-th sample along the spatial axes. Spacing is
/// scaled by the factor; the origin is unchanged because index zero is
/// kept.
pub fn downsample(img: &OrientedImage, factor: usize) -> Result<OrientedImage, Error>
{
    if factor == 0 {
        return Err(Error::invalid_argument("downsample factor must be positive"));
    }
    if factor == 1 {
        return Ok(img.clone());
    }
    let spatial = img.rank().min(3);
    let mut new_dim = img.shape().to_vec();
    for d in 0..spatial {
        new_dim[d] = (img.dim(d) + factor - 1) / factor;
    }

    let mut store = ArrayStore::zeros(&new_dim, ScalarKind::Float64)?;
    let src_view = View::<f64>::new(img.store())?;
    {
        let mut dst = ViewMut::<f64>::new(&mut store)?;
        let mut sl = Slicer::new(&new_dim)?;
        sl.go_begin();
        let mut src_idx = vec![0usize; img.rank()];
        loop {
            if sl.is_end() {
                break;
            }
            for (d, &p) in sl.pos().iter().enumerate() {
                src_idx[d] = if d < spatial { p * factor } else { p };
            }
            let v = src_view.get(img.store().linear_index(&src_idx));
            let flat = sl.flat();
            dst.set(flat, v);
            sl.advance();
        }
    }

    let mut out = OrientedImage::new(store);
    out.copy_metadata_from_resized(img, factor)?;
    Ok(out)
}

impl OrientedImage
{
    /// Metadata copy for a decimated grid: same origin and direction,
    /// spacing scaled on the spatial axes.
    pub(crate) fn copy_metadata_from_resized(&mut self, src: &OrientedImage, factor: usize)
        -> Result<(), Error>
    {
        let spatial = src.rank().min(3);
        let mut spacing = src.spacing().clone();
        for d in 0..spatial {
            spacing[d] *= factor as f64;
        }
        self.freqdim = src.freqdim;
        self.phasedim = src.phasedim;
        self.slicedim = src.slicedim;
        self.slice_duration = src.slice_duration;
        self.slice_start = src.slice_start;
        self.slice_end = src.slice_end;
        self.slice_order = src.slice_order;
        self.set_orient(src.origin().clone(), spacing, src.direction().clone())
    }
}

/// Central-difference spatial gradient of a 3D image, in index units.
/// The output has rank 4 with shape `[x, y, z, 3]` and the input's
/// orientation on the spatial axes.
pub fn gradient_image(img: &OrientedImage) -> Result<OrientedImage, Error>
{
    if img.rank() != 3 {
        return Err(Error::invalid_argument("gradient_image expects a 3D image"));
    }
    let dims = [img.dim(0), img.dim(1), img.dim(2)];
    let mut store = ArrayStore::zeros(&[dims[0], dims[1], dims[2], 3], ScalarKind::Float64)?;
    let src = View::<f64>::new(img.store())?;
    let sstride = img.store().strides().to_vec();
    {
        let mut dst = ViewMut::<f64>::new(&mut store)?;
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let center = [x, y, z];
                    let flat = x * sstride[0] + y * sstride[1] + z * sstride[2];
                    for axis in 0..3 {
                        let hi = (center[axis] + 1).min(dims[axis] - 1);
                        let lo = center[axis].saturating_sub(1);
                        let fhi = flat + (hi - center[axis]) * sstride[axis];
                        let flo = flat - (center[axis] - lo) * sstride[axis];
                        let denom = (hi - lo).max(1) as f64;
                        let g = (src.get(fhi) - src.get(flo)) / denom;
                        dst.set_nd(&[x, y, z, axis], g);
                    }
                }
            }
        }
    }

    let mut out = OrientedImage::new(store);
    let mut origin = DVector::zeros(4);
    let mut spacing = DVector::from_element(4, 1.);
    let mut direction = nalgebra::DMatrix::identity(4, 4);
    for d in 0..3 {
        origin[d] = img.origin()[d];
        spacing[d] = img.spacing()[d];
        for c in 0..3 {
            direction[(d, c)] = img.direction()[(d, c)];
        }
    }
    out.set_orient(origin, spacing, direction)?;
    Ok(out)
}
