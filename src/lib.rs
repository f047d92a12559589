// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
#![crate_name = "ndvox"]

//! The `ndvox` crate provides runtime-typed n-dimensional voxel
//! arrays and the numerical machinery built on top of them for
//! medical-image processing.
//!
//! - [`ArrayStore`]: dynamically typed n-dimensional storage with a
//!   closed set of scalar kinds.
//! - [`View`] / [`ViewMut`]: typed accessors casting between the
//!   stored kind and a chosen value type.
//! - [`Slicer`] / [`KSlicer`]: ordered traversal of regions of
//!   interest, with optional kernel neighborhoods.
//! - [`OrientedImage`]: a store plus origin, spacing and direction,
//!   with cached index/physical affine conversions and slice-timing
//!   metadata.
//! - [`interp`]: nearest, linear and Lanczos samplers under
//!   configurable boundary policies.
//! - [`metric`] and [`optimize`]: rigid and B-spline-distortion
//!   similarity metrics with analytic gradients, driven by L-BFGS;
//!   multi-scale drivers in [`register`].
//! - [`reorg`], [`svd`], [`ica`], [`cluster`], [`gica`]: the
//!   out-of-core matrix reorganizer, randomized SVD, FastICA and
//!   classifiers forming the group-ICA pipeline.
//!
//! ## Highlights
//!
//! - Storage is rank-erased (rank 1 through 8) and reference counted;
//!   mutation requires a unique handle, read views are cheap clones.
//! - Interpolators never fail: out-of-range samples resolve through a
//!   boundary policy.
//! - Iterative solvers report a [`StopReason`] instead of raising on
//!   non-convergence.
//! - The group-ICA pipeline touches the full data matrix only through
//!   block products of memory-mapped chunk files.

pub use crate::cluster::{approx_kmeans, ExpMax, KMeans};
pub use crate::error::{Error, ErrorKind};
pub use crate::gica::{GroupIca, GroupIcaOutput};
pub use crate::ica::{asym_ica, sym_ica, Ica};
pub use crate::image::{OrientedImage, SliceOrder};
pub use crate::interp::{BoundaryPolicy, Interpolable, LanczosInterp, LinearInterp, NearestInterp};
pub use crate::kind::{Rgb, Rgba, Sample, Scalar, ScalarKind};
pub use crate::kslicer::KSlicer;
pub use crate::metric::{
    DistortionMetric, InfoKind, Metric, MetricKind, RigidCorrMetric, RigidInfoMetric,
};
pub use crate::optimize::{Lbfgs, StopReason};
pub use crate::register::{
    apply_distortion, apply_rigid, distortion_correct, motion_correct, rigid_register,
    DistortionResult, RegisterOpts,
};
pub use crate::reorg::{MatMap, MatrixReorg, ReorgConfig};
pub use crate::slicer::Slicer;
pub use crate::source::{MemorySource, VolumeSource};
pub use crate::store::{ArrayStore, Buffer, MAX_RANK};
pub use crate::svd::{on_disk_svd, pca, randomized_svd, rank_for_variance, TallOp, TallSvd};
pub use crate::transform::RigidTransform;
pub use crate::view::{Pixel3DView, Vector3DConstView, Vector3DView, View, ViewMut};

pub mod bspline;
pub mod cluster;
mod error;
pub mod filter;
pub mod gica;
pub mod ica;
pub mod image;
pub mod interp;
mod kind;
pub mod kslicer;
pub mod metric;
pub mod optimize;
pub mod prelude;
pub mod register;
pub mod reorg;
pub mod slicer;
pub mod source;
mod store;
pub mod svd;
pub mod transform;
mod view;

mod private;
