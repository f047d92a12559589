//! Kernel-window traversal: a [`Slicer`] that also exposes the flat
//! offsets of every point in a rectangular neighborhood of the current
//! center.
//!
//! The KSlicer clamps neighborhood offsets to the array bounds so that
//! every reported offset is dereferenceable; whether a clamped sample
//! should instead wrap or contribute zero weight is the interpolator's
//! boundary policy, not the slicer's.

use crate::error::Error;
use crate::slicer::Slicer;

#[derive(Clone, Debug)]
pub struct KSlicer
{
    inner: Slicer,
    /// per-axis inclusive window [k_lo, k_hi], k_lo <= 0 <= k_hi
    window: Vec<(i64, i64)>,
    /// kernel point offsets, slowest axis outermost
    offs: Vec<Vec<i64>>,
    /// index of the all-zero offset in `offs`
    center: usize,
}

impl KSlicer
{
    /// KSlicer over the full array with a degenerate (single point)
    /// kernel.
    pub fn new(dim: &[usize]) -> Result<KSlicer, Error>
    {
        let inner = Slicer::new(dim)?;
        let n = dim.len();
        let mut k = KSlicer {
            inner,
            window: vec![(0, 0); n],
            offs: vec![],
            center: 0,
        };
        k.rebuild_offsets();
        Ok(k)
    }

    /// Same radius on every axis.
    pub fn set_radius(&mut self, radius: usize) -> Result<(), Error>
    {
        let r = radius as i64;
        let win: Vec<(i64, i64)> = vec![(-r, r); self.inner.rank()];
        self.set_window(&win)
    }

    /// Per-axis radii; unnamed trailing axes get radius 0.
    pub fn set_radii(&mut self, radii: &[usize]) -> Result<(), Error>
    {
        let mut win = vec![(0i64, 0i64); self.inner.rank()];
        for (d, &r) in radii.iter().enumerate().take(self.inner.rank()) {
            win[d] = (-(r as i64), r as i64);
        }
        self.set_window(&win)
    }

    /// Arbitrary inclusive window per axis. Every range must contain
    /// zero. Unnamed trailing axes get `[0, 0]`.
    pub fn set_window(&mut self, window: &[(i64, i64)]) -> Result<(), Error>
    {
        if window.len() > self.inner.rank() {
            return Err(Error::invalid_argument("window rank exceeds slicer rank"));
        }
        let mut win = vec![(0i64, 0i64); self.inner.rank()];
        for (d, &(lo, hi)) in window.iter().enumerate() {
            if lo > 0 || hi < 0 {
                return Err(Error::invalid_argument(format!(
                    "kernel window [{}, {}] on axis {} must contain zero",
                    lo, hi, d
                )));
            }
            win[d] = (lo, hi);
        }
        self.window = win;
        self.rebuild_offsets();
        Ok(())
    }

    fn rebuild_offsets(&mut self)
    {
        let n = self.inner.rank();
        let mut offs = vec![];
        let mut cur: Vec<i64> = self.window.iter().map(|w| w.0).collect();
        'outer: loop {
            offs.push(cur.clone());
            let mut d = n;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                cur[d] += 1;
                if cur[d] <= self.window[d].1 {
                    break;
                }
                cur[d] = self.window[d].0;
            }
        }
        self.center = offs
            .iter()
            .position(|o| o.iter().all(|&v| v == 0))
            .expect("window contains zero");
        self.offs = offs;
    }

    pub fn set_roi(&mut self, roi: &[(usize, usize)]) -> Result<(), Error>
    {
        self.inner.set_roi(roi)
    }

    pub fn set_order(&mut self, order: &[usize], reverse: bool) -> Result<(), Error>
    {
        self.inner.set_order(order, reverse)
    }

    pub fn go_begin(&mut self)
    {
        self.inner.go_begin()
    }

    pub fn go_end(&mut self)
    {
        self.inner.go_end()
    }

    pub fn go_index(&mut self, index: &[usize]) -> Result<(), Error>
    {
        self.inner.go_index(index)
    }

    pub fn advance(&mut self) -> Option<usize>
    {
        self.inner.advance()
    }

    pub fn is_end(&self) -> bool
    {
        self.inner.is_end()
    }

    /// Number of kernel points.
    pub fn ksize(&self) -> usize
    {
        self.offs.len()
    }

    /// Flat offset of the center.
    pub fn center(&self) -> usize
    {
        self.inner.flat()
    }

    /// N-d position of the center.
    pub fn center_index(&self) -> &[usize]
    {
        self.inner.pos()
    }

    /// Flat offset of the `k`-th kernel point, clamped into the array,
    /// plus whether the unclamped point left the ROI.
    pub fn offset(&self, k: usize) -> (usize, bool)
    {
        self.inner.offset(&self.offs[k])
    }

    /// N-d index of the `k`-th kernel point. With `bound` the index is
    /// clamped into the array; otherwise it is the raw center+offset
    /// and may be negative or past the end.
    pub fn offset_index(&self, k: usize, bound: bool) -> Vec<i64>
    {
        let pos = self.inner.pos();
        let mut out = Vec::with_capacity(pos.len());
        for d in 0..pos.len() {
            let raw = pos[d] as i64 + self.offs[k][d];
            if bound {
                out.push(raw.clamp(0, self.dim(d) as i64 - 1));
            } else {
                out.push(raw);
            }
        }
        out
    }

    fn dim(&self, axis: usize) -> usize
    {
        self.inner.shape()[axis]
    }

    /// Shape of the underlying array.
    pub fn dims(&self) -> &[usize]
    {
        self.inner.shape()
    }
}

impl Iterator for KSlicer
{
    type Item = usize;

    fn next(&mut self) -> Option<usize>
    {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn degenerate_kernel_is_plain_slicer()
    {
        let k = KSlicer::new(&[2, 3]).unwrap();
        assert_eq!(k.ksize(), 1);
        let offs: Vec<usize> = k.collect();
        assert_eq!(offs, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn radius_window_size()
    {
        let mut k = KSlicer::new(&[5, 5, 5]).unwrap();
        k.set_radius(1).unwrap();
        assert_eq!(k.ksize(), 27);
        k.set_radii(&[2, 0, 1]).unwrap();
        assert_eq!(k.ksize(), 5 * 1 * 3);
    }

    #[test]
    fn window_must_contain_zero()
    {
        let mut k = KSlicer::new(&[5, 5]).unwrap();
        assert!(k.set_window(&[(1, 2), (0, 0)]).is_err());
        assert!(k.set_window(&[(-1, 2), (0, 0)]).is_ok());
    }

    #[test]
    fn interior_offsets_match_strides()
    {
        let mut k = KSlicer::new(&[4, 4]).unwrap();
        k.set_radius(1).unwrap();
        k.go_index(&[2, 2]).unwrap();
        let c = k.center();
        assert_eq!(c, 10);
        let mut got = vec![];
        for i in 0..k.ksize() {
            let (o, outside) = k.offset(i);
            assert!(!outside);
            got.push(o);
        }
        got.sort();
        let want = vec![5, 6, 7, 9, 10, 11, 13, 14, 15];
        assert_eq!(got, want);
    }

    #[test]
    fn boundary_offsets_are_clamped_and_flagged()
    {
        let mut k = KSlicer::new(&[4, 4]).unwrap();
        k.set_radius(1).unwrap();
        k.go_begin();
        let mut any_outside = false;
        for i in 0..k.ksize() {
            let (o, outside) = k.offset(i);
            assert!(o < 16);
            any_outside |= outside;
            let idx = k.offset_index(i, true);
            assert!(idx.iter().all(|&v| (0..4).contains(&v)));
        }
        assert!(any_outside);
        // unbound indices report the theoretical position
        let raw = k.offset_index(0, false);
        assert_eq!(raw, vec![-1, -1]);
    }
}
