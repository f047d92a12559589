// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ordered traversal of a region of interest in an n-d array.
//!
//! A [`Slicer`] is a cursor over flat element offsets. It carries an
//! inclusive per-axis ROI, an explicit traversal order (fastest axis
//! first) and a current position; the past-the-end state is a
//! dedicated flag, since the last legal position along the slowest
//! axis is otherwise indistinguishable from it.

use crate::error::Error;
use crate::store::row_major_strides;

#[derive(Clone, Debug)]
pub struct Slicer
{
    dim: Vec<usize>,
    stride: Vec<usize>,
    /// traversal order, fastest first
    order: Vec<usize>,
    /// inclusive [lo, hi] per axis
    roi: Vec<(usize, usize)>,
    pos: Vec<usize>,
    linpos: usize,
    end: bool,
}

impl Slicer
{
    /// Slicer over a full array of the given shape, iterating in
    /// memory order (last axis fastest).
    pub fn new(dim: &[usize]) -> Result<Slicer, Error>
    {
        if dim.is_empty() || dim.iter().any(|&d| d == 0) {
            return Err(Error::invalid_argument("slicer shape must be nonempty and positive"));
        }
        let n = dim.len();
        let mut s = Slicer {
            dim: dim.to_vec(),
            stride: row_major_strides(dim),
            order: (0..n).rev().collect(),
            roi: dim.iter().map(|&d| (0, d - 1)).collect(),
            pos: vec![0; n],
            linpos: 0,
            end: false,
        };
        s.go_begin();
        Ok(s)
    }

    pub fn rank(&self) -> usize
    {
        self.dim.len()
    }

    /// Shape of the underlying array.
    pub fn shape(&self) -> &[usize]
    {
        &self.dim
    }

    /// Restrict iteration to an inclusive `[lo, hi]` box per axis.
    pub fn set_roi(&mut self, roi: &[(usize, usize)]) -> Result<(), Error>
    {
        if roi.len() != self.rank() {
            return Err(Error::invalid_argument("roi rank mismatch"));
        }
        for (d, &(lo, hi)) in roi.iter().enumerate() {
            if lo > hi || hi >= self.dim[d] {
                return Err(Error::invalid_argument(format!(
                    "roi [{}, {}] out of range on axis {} (len {})",
                    lo, hi, d, self.dim[d]
                )));
            }
        }
        self.roi = roi.to_vec();
        self.go_begin();
        Ok(())
    }

    /// Set the traversal order. `order` lists axes fastest first and
    /// may be partial: unnamed axes become the slowest dimensions, in
    /// decreasing index order (small memory steps first), or
    /// increasing if `reverse` is set. An empty list restores plain
    /// memory order.
    pub fn set_order(&mut self, order: &[usize], reverse: bool) -> Result<(), Error>
    {
        let n = self.rank();
        let mut used = vec![false; n];
        for &d in order {
            if d >= n {
                return Err(Error::invalid_argument(format!("order names axis {} of rank {}", d, n)));
            }
            if used[d] {
                return Err(Error::invalid_argument(format!("axis {} repeated in order", d)));
            }
            used[d] = true;
        }
        let mut full: Vec<usize> = order.to_vec();
        let rest = (0..n).filter(|&d| !used[d]);
        if reverse {
            full.extend(rest);
        } else {
            full.extend(rest.rev());
        }
        self.order = full;
        self.go_begin();
        Ok(())
    }

    /// Jump to the first position of the ROI.
    pub fn go_begin(&mut self)
    {
        for d in 0..self.rank() {
            self.pos[d] = self.roi[d].0;
        }
        self.linpos = self.lin_of_pos();
        self.end = false;
    }

    /// Jump past the end of iteration.
    pub fn go_end(&mut self)
    {
        for d in 0..self.rank() {
            self.pos[d] = self.roi[d].1;
        }
        self.linpos = self.lin_of_pos();
        self.end = true;
    }

    /// Jump to a position, which must lie inside the ROI.
    pub fn go_index(&mut self, index: &[usize]) -> Result<(), Error>
    {
        if index.len() != self.rank() {
            return Err(Error::invalid_argument("index rank mismatch"));
        }
        for (d, &i) in index.iter().enumerate() {
            if i < self.roi[d].0 || i > self.roi[d].1 {
                return Err(Error::invalid_argument(format!("index {} outside roi on axis {}", i, d)));
            }
        }
        self.pos.copy_from_slice(index);
        self.linpos = self.lin_of_pos();
        self.end = false;
        Ok(())
    }

    fn lin_of_pos(&self) -> usize
    {
        self.pos.iter().zip(&self.stride).map(|(&p, &s)| p * s).sum()
    }

    /// Current flat offset.
    #[inline]
    pub fn flat(&self) -> usize
    {
        self.linpos
    }

    /// Current n-d position.
    #[inline]
    pub fn pos(&self) -> &[usize]
    {
        &self.pos
    }

    #[inline]
    pub fn is_end(&self) -> bool
    {
        self.end
    }

    pub fn is_begin(&self) -> bool
    {
        !self.end && (0..self.rank()).all(|d| self.pos[d] == self.roi[d].0)
    }

    /// Advance one position in traversal order. Returns the new flat
    /// offset, or `None` when iteration moves past the end.
    pub fn advance(&mut self) -> Option<usize>
    {
        if self.end {
            return None;
        }
        for oi in 0..self.order.len() {
            let d = self.order[oi];
            if self.pos[d] < self.roi[d].1 {
                self.pos[d] += 1;
                self.linpos += self.stride[d];
                return Some(self.linpos);
            }
            self.linpos -= (self.pos[d] - self.roi[d].0) * self.stride[d];
            self.pos[d] = self.roi[d].0;
        }
        self.end = true;
        None
    }

    /// Step back one position in traversal order. Returns the new
    /// flat offset, or `None` when already at the beginning.
    pub fn retreat(&mut self) -> Option<usize>
    {
        if self.end {
            // step back from past-the-end onto the last position
            self.end = false;
            for d in 0..self.rank() {
                self.pos[d] = self.roi[d].1;
            }
            self.linpos = self.lin_of_pos();
            return Some(self.linpos);
        }
        for oi in 0..self.order.len() {
            let d = self.order[oi];
            if self.pos[d] > self.roi[d].0 {
                self.pos[d] -= 1;
                self.linpos -= self.stride[d];
                return Some(self.linpos);
            }
            self.linpos += (self.roi[d].1 - self.pos[d]) * self.stride[d];
            self.pos[d] = self.roi[d].1;
        }
        // was at the beginning; restore it
        self.go_begin();
        None
    }

    /// Move `dist` along one axis, clamped to the ROI. Returns the new
    /// flat offset and whether the unclamped target lay outside.
    pub fn step(&mut self, axis: usize, dist: i64) -> (usize, bool)
    {
        debug_assert!(axis < self.rank());
        let (lo, hi) = self.roi[axis];
        let want = self.pos[axis] as i64 + dist;
        let clamped = want.clamp(lo as i64, hi as i64) as usize;
        let outside = want < lo as i64 || want > hi as i64;
        self.linpos = self.linpos + clamped * self.stride[axis] - self.pos[axis] * self.stride[axis];
        self.pos[axis] = clamped;
        (self.linpos, outside)
    }

    /// Flat offset at a delta from the current position without
    /// moving. The offset is clamped to the array bounds so it is
    /// always dereferenceable; the flag reports whether any axis left
    /// the ROI.
    pub fn offset(&self, deltas: &[i64]) -> (usize, bool)
    {
        debug_assert!(deltas.len() <= self.rank());
        let mut flat = 0;
        let mut outside = false;
        for d in 0..self.rank() {
            let delta = deltas.get(d).copied().unwrap_or(0);
            let want = self.pos[d] as i64 + delta;
            if want < self.roi[d].0 as i64 || want > self.roi[d].1 as i64 {
                outside = true;
            }
            let clamped = want.clamp(0, self.dim[d] as i64 - 1) as usize;
            flat += clamped * self.stride[d];
        }
        (flat, outside)
    }
}

impl Iterator for Slicer
{
    type Item = usize;

    /// Yields the current flat offset, then advances.
    fn next(&mut self) -> Option<usize>
    {
        if self.end {
            return None;
        }
        let cur = self.linpos;
        self.advance();
        Some(cur)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn covers_whole_array_in_memory_order()
    {
        let s = Slicer::new(&[2, 3, 4]).unwrap();
        let offs: Vec<usize> = s.collect();
        let want: Vec<usize> = (0..24).collect();
        assert_eq!(offs, want);
    }

    #[test]
    fn roi_is_inclusive_and_exact()
    {
        let mut s = Slicer::new(&[4, 5]).unwrap();
        s.set_roi(&[(1, 2), (2, 4)]).unwrap();
        let offs: Vec<usize> = s.collect();
        assert_eq!(offs.len(), 2 * 3);
        let mut want = vec![];
        for r in 1..=2 {
            for c in 2..=4 {
                want.push(r * 5 + c);
            }
        }
        assert_eq!(offs, want);
    }

    #[test]
    fn order_controls_fastest_axis()
    {
        let mut s = Slicer::new(&[2, 3]).unwrap();
        // axis 0 fastest
        s.set_order(&[0], false).unwrap();
        let offs: Vec<usize> = s.clone().collect();
        let want = vec![0, 3, 1, 4, 2, 5];
        assert_eq!(offs, want);

        // partial order without reverse: unnamed axes slowest, in
        // decreasing index order => [2, 1, 0], plain memory order
        let mut s = Slicer::new(&[2, 2, 2]).unwrap();
        s.set_order(&[2], false).unwrap();
        let offs: Vec<usize> = s.collect();
        assert_eq!(offs, vec![0, 1, 2, 3, 4, 5, 6, 7]);

        // with reverse the unnamed tail is increasing => [2, 0, 1]
        let mut s = Slicer::new(&[2, 2, 2]).unwrap();
        s.set_order(&[2], true).unwrap();
        let offs: Vec<usize> = s.collect();
        assert_eq!(offs, vec![0, 1, 4, 5, 2, 3, 6, 7]);
    }

    #[test]
    fn each_offset_seen_exactly_once_any_order()
    {
        let mut s = Slicer::new(&[3, 4, 2]).unwrap();
        s.set_order(&[1, 0], false).unwrap();
        s.set_roi(&[(0, 2), (1, 3), (0, 1)]).unwrap();
        let offs: Vec<usize> = s.collect();
        let mut seen = std::collections::HashSet::new();
        for o in &offs {
            assert!(seen.insert(*o));
        }
        assert_eq!(offs.len(), 3 * 3 * 2);
    }

    #[test]
    fn retreat_reverses_advance()
    {
        let mut s = Slicer::new(&[2, 3]).unwrap();
        let forward: Vec<usize> = s.clone().collect();
        s.go_end();
        let mut backward = vec![];
        while let Some(o) = s.retreat() {
            backward.push(o);
        }
        backward.reverse();
        assert_eq!(forward, backward);
        assert!(s.is_begin());
    }

    #[test]
    fn step_clamps_to_roi()
    {
        let mut s = Slicer::new(&[4, 4]).unwrap();
        s.set_roi(&[(1, 2), (1, 2)]).unwrap();
        s.go_begin();
        let (_, outside) = s.step(0, 1);
        assert!(!outside);
        let (flat, outside) = s.step(0, 10);
        assert!(outside);
        assert_eq!(flat, 2 * 4 + 1);
    }

    #[test]
    fn offset_reports_roi_violation()
    {
        let mut s = Slicer::new(&[4, 4]).unwrap();
        s.set_roi(&[(1, 2), (1, 2)]).unwrap();
        s.go_begin();
        let (flat, outside) = s.offset(&[-1, 0]);
        assert!(outside);
        assert_eq!(flat, 1); // clamped to array bounds, not roi
        let (flat, outside) = s.offset(&[1, 1]);
        assert!(!outside);
        assert_eq!(flat, 2 * 4 + 2);
    }

    #[test]
    fn go_index_and_end_flag()
    {
        let mut s = Slicer::new(&[2, 2]).unwrap();
        s.go_index(&[1, 1]).unwrap();
        assert_eq!(s.flat(), 3);
        assert!(s.advance().is_none());
        assert!(s.is_end());
        s.go_begin();
        assert!(s.is_begin());
        assert!(s.go_index(&[2, 0]).is_err());
    }
}
