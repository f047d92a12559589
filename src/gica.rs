//! Group ICA of a grid of 4-D volumes: reorganize to tall chunks, run
//! the on-disk randomized SVD, cut the rank by explained variance, and
//! unmix the reduced basis with symmetric FastICA.

use std::path::PathBuf;

use log::info;
use nalgebra::DMatrix;
use rand::Rng;

use crate::error::Error;
use crate::ica::{sym_ica, Ica};
use crate::image::OrientedImage;
use crate::kind::ScalarKind;
use crate::reorg::{MatrixReorg, ReorgConfig};
use crate::source::VolumeSource;
use crate::svd::{on_disk_svd, rank_for_variance, TallSvd};
use crate::view::{View, ViewMut};

/// Configuration of a group-ICA run.
#[derive(Clone, Debug)]
pub struct GroupIca
{
    /// explained-variance threshold for the rank cut
    pub var_thresh: f64,
    /// hard rank ceiling (0 for unrestricted)
    pub max_rank: usize,
    /// basis-rejection tolerance of the randomized SVD
    pub svd_tol: f64,
    pub power_iters: usize,
    /// spatial ICA unmixes `V`; temporal ICA unmixes `U`
    pub spatial: bool,
    /// z-score every time series during the reorganization
    pub normalize: bool,
    /// chunking budget in doubles
    pub max_doubles: usize,
}

impl Default for GroupIca
{
    fn default() -> Self
    {
        GroupIca {
            var_thresh: 0.99,
            max_rank: 0,
            svd_tol: 1e-10,
            power_iters: 2,
            spatial: false,
            normalize: true,
            max_doubles: 1 << 30,
        }
    }
}

/// Everything a group-ICA run produces.
pub struct GroupIcaOutput
{
    pub reorg: MatrixReorg,
    pub svd: TallSvd,
    /// rank kept after the variance cut
    pub rank: usize,
    pub ica: Ica,
}

impl GroupIca
{
    /// Run the pipeline over a `time_blocks x space_blocks` grid of
    /// image paths (time-major, as in [`ReorgConfig`]).
    pub fn compute<R: Rng + ?Sized>(
        &self, source: &dyn VolumeSource, prefix: impl Into<PathBuf>, time_blocks: usize,
        space_blocks: usize, image_paths: Vec<PathBuf>, mask_paths: Vec<PathBuf>, rng: &mut R,
    ) -> Result<GroupIcaOutput, Error>
    {
        let config = ReorgConfig {
            time_blocks,
            space_blocks,
            image_paths,
            mask_paths,
            max_doubles: self.max_doubles,
            normalize: self.normalize,
        };
        let reorg = MatrixReorg::create(source, prefix, &config)?;
        info!("group ICA: {} x {} reorganized", reorg.rows(), reorg.cols());

        let svd = on_disk_svd(&reorg, self.svd_tol, 0, self.max_rank, self.power_iters, rng)?;
        let mut rank = rank_for_variance(&svd.s, self.var_thresh);
        if self.max_rank > 0 {
            rank = rank.min(self.max_rank);
        }
        rank = rank.max(2).min(svd.s.len());
        info!("group ICA: rank {} of {} kept", rank, svd.s.len());

        let basis = if self.spatial {
            svd.v.columns(0, rank).clone_owned()
        } else {
            svd.u.columns(0, rank).clone_owned()
        };
        let ica = sym_ica(&basis, rng)?;

        Ok(GroupIcaOutput { reorg, svd, rank, ica })
    }

    /// Scatter per-voxel component weights back into mask-shaped
    /// volumes. For spatial ICA the sources are already per voxel; for
    /// temporal ICA the spatial maps are `X^T S` through the reorg.
    pub fn component_maps(
        &self, source: &dyn VolumeSource, out: &GroupIcaOutput,
    ) -> Result<Vec<OrientedImage>, Error>
    {
        let ncomp = out.ica.source.ncols();
        let per_voxel: DMatrix<f64> = if self.spatial {
            out.ica.source.clone()
        } else {
            let mut maps = DMatrix::zeros(out.reorg.cols(), ncomp);
            out.reorg.post_mult(&mut maps, &out.ica.source, true)?;
            maps
        };

        let mut images = Vec::with_capacity(ncomp);
        for comp in 0..ncomp {
            let mut col = 0usize;
            let mut maps_for_comp = Vec::new();
            for sb in 0..out.reorg.block_cols().len() {
                let mask = source.read(&out.reorg.mask_path(sb))?;
                let sdims: Vec<usize> = mask.shape().iter().take(3).copied().collect();
                let mut img = OrientedImage::zeros(&sdims, ScalarKind::Float64)?;
                img.copy_metadata_from(&mask);
                let mask_view = View::<f64>::new(mask.store())?;
                let mask_tlen = mask.tlen();
                let spatial: usize = sdims.iter().product();
                {
                    let mut vm = ViewMut::<f64>::new(img.store_mut())?;
                    for vox in 0..spatial {
                        if mask_view.get(vox * mask_tlen) != 0. {
                            vm.set(vox, per_voxel[(col, comp)]);
                            col += 1;
                        }
                    }
                }
                maps_for_comp.push(img);
            }
            // one volume per space block, component-major order
            images.extend(maps_for_comp);
        }
        Ok(images)
    }
}
