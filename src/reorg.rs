// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reorganizes a grid of 4-D volumes into memory-mapped "tall"
//! column-block matrices.
//!
//! The full matrix has `rows = sum of timepoints` and `cols = sum of
//! masked voxels`; it is never materialized. Columns are partitioned
//! into chunks sized to `max_doubles`, never crossing a space-block
//! boundary, each stored as a file holding two `u64` counts followed
//! by a column-major `f64` payload. Matrix products against the full
//! matrix stream one chunk at a time.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::{debug, info};
use memmap2::{Mmap, MmapMut};
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut};

use crate::error::Error;
use crate::image::OrientedImage;
use crate::kind::ScalarKind;
use crate::source::VolumeSource;
use crate::view::View;

const HEADER_BYTES: usize = 16;

/// A memory-mapped tall-chunk file. The matrix view borrows the map,
/// which owns the open file handle; dropping the `MatMap` invalidates
/// every derived view by construction.
#[derive(Debug)]
pub struct MatMap
{
    map: MapRepr,
    rows: usize,
    cols: usize,
}

#[derive(Debug)]
enum MapRepr
{
    Read(Mmap),
    Write(MmapMut),
}

impl MatMap
{
    /// Create a pre-sized chunk file and write its header.
    pub fn create(path: &Path, rows: usize, cols: usize) -> Result<MatMap, Error>
    {
        let len = HEADER_BYTES as u64 + 8 * (rows as u64) * (cols as u64);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::runtime(format!("creating {}: {}", path.display(), e)))?;
        file.set_len(len)
            .map_err(|e| Error::runtime(format!("sizing {}: {}", path.display(), e)))?;
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::runtime(format!("mapping {}: {}", path.display(), e)))?;
        map[0..8].copy_from_slice(&(rows as u64).to_ne_bytes());
        map[8..16].copy_from_slice(&(cols as u64).to_ne_bytes());
        Ok(MatMap { map: MapRepr::Write(map), rows, cols })
    }

    /// Open an existing chunk read-only, validating length against the
    /// header.
    pub fn open(path: &Path) -> Result<MatMap, Error>
    {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Error::runtime(format!("opening {}: {}", path.display(), e)))?;
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::runtime(format!("mapping {}: {}", path.display(), e)))?;
        let (rows, cols) = Self::validate(&map, path)?;
        Ok(MatMap { map: MapRepr::Read(map), rows, cols })
    }

    /// Open an existing chunk for filling.
    pub fn open_mut(path: &Path) -> Result<MatMap, Error>
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::runtime(format!("opening {}: {}", path.display(), e)))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::runtime(format!("mapping {}: {}", path.display(), e)))?;
        let (rows, cols) = Self::validate(&map, path)?;
        Ok(MatMap { map: MapRepr::Write(map), rows, cols })
    }

    fn validate(bytes: &[u8], path: &Path) -> Result<(usize, usize), Error>
    {
        if bytes.len() < HEADER_BYTES {
            return Err(Error::runtime(format!("{} is shorter than its header", path.display())));
        }
        let rows = u64::from_ne_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let cols = u64::from_ne_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let want = HEADER_BYTES + 8 * rows * cols;
        if bytes.len() != want {
            return Err(Error::runtime(format!(
                "{}: header says {}x{} ({} bytes) but file is {} bytes",
                path.display(),
                rows,
                cols,
                want,
                bytes.len()
            )));
        }
        Ok((rows, cols))
    }

    #[inline]
    pub fn rows(&self) -> usize
    {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize
    {
        self.cols
    }

    /// Column-major matrix view of the payload.
    pub fn matrix(&self) -> DMatrixView<'_, f64>
    {
        let bytes = match &self.map {
            MapRepr::Read(m) => &m[HEADER_BYTES..],
            MapRepr::Write(m) => &m[HEADER_BYTES..],
        };
        // the payload starts 16 bytes into a page-aligned map
        let floats =
            unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f64, self.rows * self.cols) };
        DMatrixView::from_slice(floats, self.rows, self.cols)
    }

    /// Mutable matrix view; requires a writable map.
    pub fn matrix_mut(&mut self) -> Result<DMatrixViewMut<'_, f64>, Error>
    {
        let (rows, cols) = (self.rows, self.cols);
        match &mut self.map {
            MapRepr::Read(_) => Err(Error::invalid_argument("chunk is mapped read-only")),
            MapRepr::Write(m) => {
                let bytes = &mut m[HEADER_BYTES..];
                let floats = unsafe {
                    std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f64, rows * cols)
                };
                Ok(DMatrixViewMut::from_slice(floats, rows, cols))
            }
        }
    }
}

/// Inputs to [`MatrixReorg::create`]: a `time_blocks x space_blocks`
/// grid of image paths in time-major order, optional per-space-block
/// masks, and the chunking budget.
#[derive(Clone, Debug)]
pub struct ReorgConfig
{
    pub time_blocks: usize,
    pub space_blocks: usize,
    /// `space_blocks * time_blocks` paths; the image for space block
    /// `s`, time block `t` is at `s * time_blocks + t`
    pub image_paths: Vec<PathBuf>,
    /// up to `space_blocks` mask paths; missing masks are derived from
    /// the non-zero-variance voxels of the column's first image
    pub mask_paths: Vec<PathBuf>,
    /// cap on the doubles held by any one chunk
    pub max_doubles: usize,
    /// z-score each time series before writing
    pub normalize: bool,
}

/// Handle to a built (or reloaded) set of tall chunks.
#[derive(Debug)]
pub struct MatrixReorg
{
    prefix: PathBuf,
    total_rows: usize,
    total_cols: usize,
    chunk_cols: Vec<usize>,
    in_rows: Vec<usize>,
    in_cols: Vec<usize>,
}

impl MatrixReorg
{
    pub fn rows(&self) -> usize
    {
        self.total_rows
    }

    pub fn cols(&self) -> usize
    {
        self.total_cols
    }

    /// Columns per tall chunk.
    pub fn chunk_cols(&self) -> &[usize]
    {
        &self.chunk_cols
    }

    /// Timepoints per time block.
    pub fn block_rows(&self) -> &[usize]
    {
        &self.in_rows
    }

    /// Masked voxels per space block.
    pub fn block_cols(&self) -> &[usize]
    {
        &self.in_cols
    }

    pub fn nchunks(&self) -> usize
    {
        self.chunk_cols.len()
    }

    pub fn chunk_path(&self, i: usize) -> PathBuf
    {
        suffixed(&self.prefix, &format!("_tall_{}", i))
    }

    pub fn mask_path(&self, s: usize) -> PathBuf
    {
        suffixed(&self.prefix, &format!("_mask_{}", s))
    }

    /// Build the chunk files from a grid of volumes.
    pub fn create(
        source: &dyn VolumeSource, prefix: impl Into<PathBuf>, config: &ReorgConfig,
    ) -> Result<MatrixReorg, Error>
    {
        let prefix = prefix.into();
        let t_blocks = config.time_blocks;
        let s_blocks = config.space_blocks;
        if t_blocks == 0 || s_blocks == 0 {
            return Err(Error::invalid_argument("need at least one time and space block"));
        }
        if config.image_paths.len() != t_blocks * s_blocks {
            return Err(Error::invalid_argument(format!(
                "grid wants {} image paths, got {}",
                t_blocks * s_blocks,
                config.image_paths.len()
            )));
        }
        if config.mask_paths.len() > s_blocks {
            return Err(Error::invalid_argument("more masks than space blocks"));
        }

        let mut reorg = MatrixReorg {
            prefix,
            total_rows: 0,
            total_cols: 0,
            chunk_cols: vec![],
            in_rows: vec![0; t_blocks],
            in_cols: vec![0; s_blocks],
        };

        // pass 1: masks and sizes
        for sb in 0..s_blocks {
            let mask = if sb < config.mask_paths.len() {
                source.read(&config.mask_paths[sb])?
            } else {
                let img = source.read(&config.image_paths[sb * t_blocks])?;
                variance_mask(&img)?
            };
            source.write(&mask, &reorg.mask_path(sb))?;
            let count = count_nonzero(&mask)?;
            if count == 0 {
                return Err(Error::invalid_argument(format!(
                    "mask for space block {} has no non-zero voxels",
                    sb
                )));
            }
            reorg.in_cols[sb] = count;
            reorg.total_cols += count;
        }
        for tb in 0..t_blocks {
            let img = source.read(&config.image_paths[tb])?;
            reorg.in_rows[tb] = img.tlen();
            reorg.total_rows += img.tlen();
        }
        info!(
            "reorg: {} rows (timepoints) x {} cols (voxels)",
            reorg.total_rows, reorg.total_cols
        );

        if reorg.total_rows > config.max_doubles {
            return Err(Error::invalid_argument(
                "max_doubles is not large enough to hold a single full column",
            ));
        }

        // pass 2: chunk layout and pre-sized files; a chunk never
        // crosses a space-block boundary and never exceeds the budget
        reorg.chunk_cols.clear();
        let mut cur = 0usize;
        let mut block_left = reorg.in_cols[0];
        let mut blocknum = 0usize;
        for _ in 0..reorg.total_cols {
            if block_left == 0 {
                blocknum += 1;
                block_left = reorg.in_cols[blocknum];
                if cur > 0 {
                    reorg.chunk_cols.push(cur);
                    cur = 0;
                }
            } else if (cur + 1) * reorg.total_rows > config.max_doubles {
                reorg.chunk_cols.push(cur);
                cur = 0;
            }
            cur += 1;
            block_left -= 1;
        }
        if cur > 0 {
            reorg.chunk_cols.push(cur);
        }
        for (i, &cols) in reorg.chunk_cols.iter().enumerate() {
            MatMap::create(&reorg.chunk_path(i), reorg.total_rows, cols)?;
        }
        debug!("reorg chunks: {:?}", reorg.chunk_cols);

        // pass 3: stream the masked time series into the chunks
        let mut chunk_base = 0usize; // first chunk of the current space block
        for sb in 0..s_blocks {
            let mask = source.read(&reorg.mask_path(sb))?;
            let mask_view = View::<f64>::new(mask.store())?;
            let mask_spatial: usize = mask.shape().iter().take(3).product();
            let mask_tlen = mask.tlen();

            let mut glob_row = 0usize;
            for tb in 0..t_blocks {
                let img = source
                    .read(&config.image_paths[sb * t_blocks + tb])?
                    .copy_cast(ScalarKind::Float64)?;
                if !img.matching_orientation(&mask, true, 1e-4) {
                    return Err(Error::invalid_argument(format!(
                        "mask/image grid mismatch in space block {}, time block {}",
                        sb, tb
                    )));
                }
                let tlen = img.tlen();
                if tlen != reorg.in_rows[tb] {
                    return Err(Error::invalid_argument(format!(
                        "time-length mismatch in space block {}, time block {}",
                        sb, tb
                    )));
                }
                let img_view = View::<f64>::new(img.store())?;

                let mut chunk_idx = chunk_base;
                let mut map = MatMap::open_mut(&reorg.chunk_path(chunk_idx))?;
                let mut cc = 0usize;
                let mut series = vec![0f64; tlen];
                for vox in 0..mask_spatial {
                    if mask_view.get(vox * mask_tlen) == 0. {
                        continue;
                    }
                    if cc == map.cols() {
                        chunk_idx += 1;
                        map = MatMap::open_mut(&reorg.chunk_path(chunk_idx))?;
                        cc = 0;
                    }
                    for (t, v) in series.iter_mut().enumerate() {
                        *v = img_view.get(vox * tlen + t);
                    }
                    if config.normalize {
                        zscore(&mut series);
                    }
                    let mut m = map.matrix_mut()?;
                    for (t, &v) in series.iter().enumerate() {
                        m[(glob_row + t, cc)] = v;
                    }
                    cc += 1;
                }
                glob_row += tlen;
            }

            // advance to the first chunk of the next space block
            let mut covered = 0usize;
            while covered < reorg.in_cols[sb] {
                covered += reorg.chunk_cols[chunk_base];
                chunk_base += 1;
            }
        }
        Ok(reorg)
    }

    /// Reopen chunks and masks written by an earlier
    /// [`create`](Self::create), re-deriving the layout from headers
    /// and failing on any inconsistency.
    pub fn load(source: &dyn VolumeSource, prefix: impl Into<PathBuf>) -> Result<MatrixReorg, Error>
    {
        let prefix: PathBuf = prefix.into();
        let mut reorg = MatrixReorg {
            prefix,
            total_rows: 0,
            total_cols: 0,
            chunk_cols: vec![],
            in_rows: vec![],
            in_cols: vec![],
        };

        loop {
            let path = reorg.chunk_path(reorg.chunk_cols.len());
            if !path.exists() {
                break;
            }
            let map = MatMap::open(&path)?;
            if reorg.chunk_cols.is_empty() {
                reorg.total_rows = map.rows();
            } else if map.rows() != reorg.total_rows {
                return Err(Error::runtime(format!(
                    "{}: row count {} disagrees with {}",
                    path.display(),
                    map.rows(),
                    reorg.total_rows
                )));
            }
            reorg.total_cols += map.cols();
            reorg.chunk_cols.push(map.cols());
        }
        if reorg.chunk_cols.is_empty() {
            return Err(Error::runtime(format!(
                "no tall chunks under prefix {}",
                reorg.prefix.display()
            )));
        }

        // masks must re-derive the same column count
        let mut mask_cols = 0usize;
        let mut sb = 0usize;
        while mask_cols < reorg.total_cols {
            let mask = source.read(&reorg.mask_path(sb))?;
            let count = count_nonzero(&mask)?;
            reorg.in_cols.push(count);
            mask_cols += count;
            sb += 1;
        }
        if mask_cols != reorg.total_cols {
            return Err(Error::runtime(format!(
                "masks cover {} columns but chunks hold {}",
                mask_cols, reorg.total_cols
            )));
        }
        Ok(reorg)
    }

    /// `out = X * rhs` (or `X^T * rhs` when `transpose`), chunk by
    /// chunk.
    pub fn post_mult(
        &self, out: &mut DMatrix<f64>, rhs: &DMatrix<f64>, transpose: bool,
    ) -> Result<(), Error>
    {
        if !transpose {
            if out.nrows() != self.rows() || out.ncols() != rhs.ncols() || self.cols() != rhs.nrows() {
                return Err(Error::invalid_argument(
                    "non-conforming dimensions for post_mult",
                ));
            }
            out.fill(0.);
            let mut c0 = 0;
            for (b, &bc) in self.chunk_cols.iter().enumerate() {
                let map = MatMap::open(&self.chunk_path(b))?;
                *out += map.matrix() * rhs.rows(c0, bc);
                c0 += bc;
            }
        } else {
            if out.nrows() != self.cols() || out.ncols() != rhs.ncols() || self.rows() != rhs.nrows() {
                return Err(Error::invalid_argument(
                    "non-conforming dimensions for transposed post_mult",
                ));
            }
            let mut c0 = 0;
            for (b, &bc) in self.chunk_cols.iter().enumerate() {
                let map = MatMap::open(&self.chunk_path(b))?;
                out.rows_mut(c0, bc).copy_from(&(map.matrix().transpose() * rhs));
                c0 += bc;
            }
        }
        Ok(())
    }

    /// `out = lhs * X` (or `lhs * X^T` when `transpose`), chunk by
    /// chunk.
    pub fn pre_mult(
        &self, out: &mut DMatrix<f64>, lhs: &DMatrix<f64>, transpose: bool,
    ) -> Result<(), Error>
    {
        if !transpose {
            if out.nrows() != lhs.nrows() || out.ncols() != self.cols() || self.rows() != lhs.ncols() {
                return Err(Error::invalid_argument(
                    "non-conforming dimensions for pre_mult",
                ));
            }
            let mut c0 = 0;
            for (b, &bc) in self.chunk_cols.iter().enumerate() {
                let map = MatMap::open(&self.chunk_path(b))?;
                out.columns_mut(c0, bc).copy_from(&(lhs * map.matrix()));
                c0 += bc;
            }
        } else {
            if out.nrows() != lhs.nrows() || out.ncols() != self.rows() || self.cols() != lhs.ncols() {
                return Err(Error::invalid_argument(
                    "non-conforming dimensions for transposed pre_mult",
                ));
            }
            out.fill(0.);
            let mut c0 = 0;
            for (b, &bc) in self.chunk_cols.iter().enumerate() {
                let map = MatMap::open(&self.chunk_path(b))?;
                *out += lhs.columns(c0, bc) * map.matrix().transpose();
                c0 += bc;
            }
        }
        Ok(())
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf
{
    let mut name = prefix.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    prefix.with_file_name(name)
}

fn count_nonzero(mask: &OrientedImage) -> Result<usize, Error>
{
    let v = View::<f64>::new(mask.store())?;
    let spatial: usize = mask.shape().iter().take(3).product();
    let tlen = mask.tlen();
    Ok((0..spatial).filter(|&i| v.get(i * tlen) != 0.).count())
}

/// Fallback mask: voxels whose time series has non-zero variance.
fn variance_mask(img: &OrientedImage) -> Result<OrientedImage, Error>
{
    let tlen = img.tlen();
    let spatial: usize = img.shape().iter().take(3).product();
    let v = View::<f64>::new(img.store())?;

    let sdims: Vec<usize> = img.shape().iter().take(3).copied().collect();
    let mut mask = OrientedImage::zeros(&sdims, ScalarKind::UInt8)?;
    {
        let mut vm = crate::view::ViewMut::<u8>::new(mask.store_mut())?;
        for vox in 0..spatial {
            let (mut sum, mut sumsq) = (0., 0.);
            for t in 0..tlen {
                let x = v.get(vox * tlen + t);
                sum += x;
                sumsq += x * x;
            }
            let var = sumsq / tlen as f64 - (sum / tlen as f64).powi(2);
            vm.set(vox, (var > 1e-12) as u8);
        }
    }
    // orientation follows the spatial axes of the input
    let n = sdims.len();
    let origin = nalgebra::DVector::from_fn(n, |d, _| img.origin()[d]);
    let spacing = nalgebra::DVector::from_fn(n, |d, _| img.spacing()[d]);
    let direction = nalgebra::DMatrix::from_fn(n, n, |r, c| img.direction()[(r, c)]);
    mask.set_orient(origin, spacing, direction)?;
    Ok(mask)
}

fn zscore(series: &mut [f64])
{
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let var = series.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.).max(1.);
    let sd = var.sqrt();
    if sd > 0. {
        for v in series.iter_mut() {
            *v = (*v - mean) / sd;
        }
    } else {
        for v in series.iter_mut() {
            *v = 0.;
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn matmap_round_trip()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk");
        {
            let mut m = MatMap::create(&path, 3, 2).unwrap();
            let mut mat = m.matrix_mut().unwrap();
            for r in 0..3 {
                for c in 0..2 {
                    mat[(r, c)] = (r * 10 + c) as f64;
                }
            }
        }
        let m = MatMap::open(&path).unwrap();
        assert_eq!((m.rows(), m.cols()), (3, 2));
        let mat = m.matrix();
        assert_eq!(mat[(2, 1)], 21.);

        // header first, column-major payload after
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16 + 8 * 6);
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 3);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 2);
        let first = f64::from_ne_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(first, 0.);
        let second = f64::from_ne_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(second, 10.); // row 1 of column 0
    }

    #[test]
    fn truncated_chunk_is_detected()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk");
        MatMap::create(&path, 4, 4).unwrap();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(16 + 8 * 7).unwrap();
        let err = MatMap::open(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RuntimeError);
        assert!(err.to_string().contains("chunk"));
    }

    #[test]
    fn zscore_normalizes()
    {
        let mut s = vec![1., 2., 3., 4., 5.];
        zscore(&mut s);
        let mean: f64 = s.iter().sum::<f64>() / 5.;
        assert!(mean.abs() < 1e-12);
        let var: f64 = s.iter().map(|v| v * v).sum::<f64>() / 4.;
        assert!((var - 1.).abs() < 1e-12);

        let mut flat = vec![2., 2., 2.];
        zscore(&mut flat);
        assert!(flat.iter().all(|&v| v == 0.));
    }
}
