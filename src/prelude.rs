// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ndvox prelude.
//!
//! This module contains the most used types and traits. Import it
//! with:
//!
//! ```
//! use ndvox::prelude::*;
//! ```

#[doc(no_inline)]
pub use crate::{
    ArrayStore, BoundaryPolicy, Error, ErrorKind, KSlicer, Metric, MetricKind, OrientedImage,
    Sample, Scalar, ScalarKind, SliceOrder, Slicer, StopReason, View, ViewMut, VolumeSource,
};
