// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Runtime-typed, rank-erased n-dimensional storage.
//!
//! An [`ArrayStore`] owns a contiguous byte buffer of one
//! [`ScalarKind`] and carries rank, shape and row-major strides. The
//! buffer is reference counted: clones of a store are cheap shared
//! handles, and mutation requires the handle to be the unique live
//! reference (see [`ArrayStore::bytes_mut`]).

use std::sync::Arc;

use crate::error::Error;
use crate::kind::{Sample, Scalar, ScalarKind};

/// Maximum supported rank.
pub const MAX_RANK: usize = 8;

/// A reference-counted element buffer, either allocated by the crate
/// or grafted from a caller with a custom deleter.
pub struct Buffer
{
    repr: BufferRepr,
}

enum BufferRepr
{
    Owned(Vec<u8>),
    Foreign
    {
        ptr: *mut u8,
        len: usize,
        drop: Option<Box<dyn FnMut(*mut u8, usize) + Send + Sync>>,
    },
}

// Foreign pointers are exclusively owned by the buffer and the deleter
// is Send + Sync by bound.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer
{
    fn owned(data: Vec<u8>) -> Self
    {
        Buffer { repr: BufferRepr::Owned(data) }
    }

    /// Adopt a caller-owned allocation. `deleter` is invoked with the
    /// pointer and length exactly once, when the last store handle is
    /// dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the buffer, and must not be freed by anyone but the
    /// deleter.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, deleter: Box<dyn FnMut(*mut u8, usize) + Send + Sync>)
        -> Self
    {
        Buffer { repr: BufferRepr::Foreign { ptr, len, drop: Some(deleter) } }
    }

    pub fn len(&self) -> usize
    {
        match &self.repr {
            BufferRepr::Owned(v) => v.len(),
            BufferRepr::Foreign { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    fn as_ptr(&self) -> *const u8
    {
        match &self.repr {
            BufferRepr::Owned(v) => v.as_ptr(),
            BufferRepr::Foreign { ptr, .. } => *ptr,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8
    {
        match &mut self.repr {
            BufferRepr::Owned(v) => v.as_mut_ptr(),
            BufferRepr::Foreign { ptr, .. } => *ptr,
        }
    }

    fn as_slice(&self) -> &[u8]
    {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8]
    {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

impl Drop for Buffer
{
    fn drop(&mut self)
    {
        if let BufferRepr::Foreign { ptr, len, drop } = &mut self.repr {
            if let Some(mut f) = drop.take() {
                f(*ptr, *len);
            }
        }
    }
}

/// Row-major strides for `dim`, in elements, with the last stride 1.
pub(crate) fn row_major_strides(dim: &[usize]) -> Vec<usize>
{
    let mut stride = vec![1; dim.len()];
    for i in (0..dim.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1] * dim[i + 1];
    }
    stride
}

fn check_shape(dim: &[usize]) -> Result<(), Error>
{
    if dim.is_empty() || dim.len() > MAX_RANK {
        return Err(Error::invalid_argument(format!(
            "rank must be in 1..={}, got {}",
            MAX_RANK,
            dim.len()
        )));
    }
    if dim.iter().any(|&d| d == 0) {
        return Err(Error::invalid_argument("zero-length axis in shape"));
    }
    Ok(())
}

/// A dynamically typed n-dimensional array.
#[derive(Clone)]
pub struct ArrayStore
{
    kind: ScalarKind,
    dim: Vec<usize>,
    stride: Vec<usize>,
    buf: Arc<Buffer>,
}

impl ArrayStore
{
    /// Allocate a zero-initialized store.
    pub fn zeros(dim: &[usize], kind: ScalarKind) -> Result<ArrayStore, Error>
    {
        check_shape(dim)?;
        kind.check_representable()?;
        let elements: usize = dim.iter().product();
        let buf = Buffer::owned(vec![0u8; elements * kind.size_of()]);
        Ok(ArrayStore {
            kind,
            dim: dim.to_vec(),
            stride: row_major_strides(dim),
            buf: Arc::new(buf),
        })
    }

    /// Adopt a buffer whose length must equal the product of `dim`
    /// times the element size.
    pub fn graft(dim: &[usize], kind: ScalarKind, buf: Buffer) -> Result<ArrayStore, Error>
    {
        check_shape(dim)?;
        kind.check_representable()?;
        let elements: usize = dim.iter().product();
        if buf.len() != elements * kind.size_of() {
            return Err(Error::invalid_argument(format!(
                "grafted buffer is {} bytes, shape needs {}",
                buf.len(),
                elements * kind.size_of()
            )));
        }
        Ok(ArrayStore {
            kind,
            dim: dim.to_vec(),
            stride: row_major_strides(dim),
            buf: Arc::new(buf),
        })
    }

    /// Build a store of `kind` from a slice of typed elements.
    pub fn from_elems<T: Scalar>(dim: &[usize], elems: &[T]) -> Result<ArrayStore, Error>
    {
        check_shape(dim)?;
        let n: usize = dim.iter().product();
        if n != elems.len() {
            return Err(Error::invalid_argument(format!(
                "shape wants {} elements, slice has {}",
                n,
                elems.len()
            )));
        }
        let mut store = ArrayStore::zeros(dim, T::KIND)?;
        {
            let esz = store.kind.size_of();
            let bytes = store.bytes_mut().expect("fresh store is unique");
            for (i, &e) in elems.iter().enumerate() {
                unsafe {
                    (bytes.as_mut_ptr().add(i * esz) as *mut T).write_unaligned(e);
                }
            }
        }
        Ok(store)
    }

    #[inline]
    pub fn rank(&self) -> usize
    {
        self.dim.len()
    }

    #[inline]
    pub fn shape(&self) -> &[usize]
    {
        &self.dim
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> usize
    {
        self.dim[axis]
    }

    #[inline]
    pub fn strides(&self) -> &[usize]
    {
        &self.stride
    }

    #[inline]
    pub fn kind(&self) -> ScalarKind
    {
        self.kind
    }

    #[inline]
    pub fn elements(&self) -> usize
    {
        self.dim.iter().product()
    }

    #[inline]
    pub fn bytes(&self) -> usize
    {
        self.buf.len()
    }

    /// Number of elements in the fourth and higher dimensions, or 1
    /// when the rank is below 4.
    #[inline]
    pub fn tlen(&self) -> usize
    {
        self.dim.iter().skip(3).product()
    }

    /// Flat element offset of an n-d index. Indices beyond the rank
    /// are ignored; missing trailing indices are taken as zero.
    /// Out-of-range indices are a caller error.
    #[inline]
    pub fn linear_index(&self, index: &[usize]) -> usize
    {
        let mut flat = 0;
        for (d, &i) in index.iter().enumerate().take(self.rank()) {
            debug_assert!(i < self.dim[d], "index {} out of range on axis {}", i, d);
            flat += i * self.stride[d];
        }
        flat
    }

    /// Byte address (offset into the buffer) of a flat element index.
    #[inline]
    pub fn addr(&self, flat: usize) -> usize
    {
        flat * self.kind.size_of()
    }

    pub(crate) fn bytes_ref(&self) -> &[u8]
    {
        self.buf.as_slice()
    }

    /// Mutable access to the raw bytes. Fails unless this handle is
    /// the unique live reference to the buffer; clone-free read views
    /// keep the buffer shared.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], Error>
    {
        match Arc::get_mut(&mut self.buf) {
            Some(b) => Ok(b.as_mut_slice()),
            None => Err(Error::invalid_argument("store buffer is shared; mutation needs a unique handle")),
        }
    }

    /// True if no other handle shares the buffer.
    pub fn is_unique(&self) -> bool
    {
        Arc::strong_count(&self.buf) == 1
    }

    /// Replace a shared buffer with a private copy, making this handle
    /// unique.
    pub fn make_unique(&mut self)
    {
        if !self.is_unique() {
            let copy = Buffer::owned(self.buf.as_slice().to_vec());
            self.buf = Arc::new(copy);
        }
    }

    /// Read one element as a [`Sample`], whatever the stored kind.
    pub fn sample(&self, flat: usize) -> Sample
    {
        let p = unsafe { self.buf.as_ptr().add(self.addr(flat)) };
        macro_rules! rd {
            ($t:ty) => {
                unsafe { (p as *const $t).read_unaligned() }.into_sample()
            };
        }
        match self.kind {
            ScalarKind::UInt8 => rd!(u8),
            ScalarKind::Int8 => rd!(i8),
            ScalarKind::UInt16 => rd!(u16),
            ScalarKind::Int16 => rd!(i16),
            ScalarKind::UInt32 => rd!(u32),
            ScalarKind::Int32 => rd!(i32),
            ScalarKind::UInt64 => rd!(u64),
            ScalarKind::Int64 => rd!(i64),
            ScalarKind::Float32 => rd!(f32),
            ScalarKind::Float64 => rd!(f64),
            ScalarKind::Complex64 => rd!(num_complex::Complex32),
            ScalarKind::Complex128 => rd!(num_complex::Complex64),
            ScalarKind::Rgb24 => rd!(crate::Rgb),
            ScalarKind::Rgba32 => rd!(crate::Rgba),
            ScalarKind::Float128 | ScalarKind::Complex256 => unreachable!("unrepresentable kind in store"),
        }
    }

    /// Write one element from a [`Sample`], casting to the stored
    /// kind. Requires a unique handle.
    pub fn set_sample(&mut self, flat: usize, s: Sample) -> Result<(), Error>
    {
        let kind = self.kind;
        let addr = self.addr(flat);
        let bytes = self.bytes_mut()?;
        let p = unsafe { bytes.as_mut_ptr().add(addr) };
        macro_rules! wr {
            ($t:ty) => {
                unsafe { (p as *mut $t).write_unaligned(<$t>::from_sample(s)) }
            };
        }
        match kind {
            ScalarKind::UInt8 => wr!(u8),
            ScalarKind::Int8 => wr!(i8),
            ScalarKind::UInt16 => wr!(u16),
            ScalarKind::Int16 => wr!(i16),
            ScalarKind::UInt32 => wr!(u32),
            ScalarKind::Int32 => wr!(i32),
            ScalarKind::UInt64 => wr!(u64),
            ScalarKind::Int64 => wr!(i64),
            ScalarKind::Float32 => wr!(f32),
            ScalarKind::Float64 => wr!(f64),
            ScalarKind::Complex64 => wr!(num_complex::Complex32),
            ScalarKind::Complex128 => wr!(num_complex::Complex64),
            ScalarKind::Rgb24 => wr!(crate::Rgb),
            ScalarKind::Rgba32 => wr!(crate::Rgba),
            ScalarKind::Float128 | ScalarKind::Complex256 => unreachable!("unrepresentable kind in store"),
        }
        Ok(())
    }

    /// Deep copy, same shape and kind.
    pub fn copy(&self) -> ArrayStore
    {
        ArrayStore {
            kind: self.kind,
            dim: self.dim.clone(),
            stride: self.stride.clone(),
            buf: Arc::new(Buffer::owned(self.buf.as_slice().to_vec())),
        }
    }

    /// Allocate a new store of possibly different shape and kind and
    /// copy the rectangular overlap, casting element-wise. Axes the
    /// new shape adds beyond the old rank copy only their zero slice;
    /// any extension stays default initialized.
    pub fn copy_cast(&self, new_dim: &[usize], new_kind: ScalarKind) -> Result<ArrayStore, Error>
    {
        let mut out = ArrayStore::zeros(new_dim, new_kind)?;

        // overlap in the common rank; missing axes contribute index 0
        let common = self.rank().min(out.rank());
        let mut overlap = vec![1usize; common.max(1)];
        for d in 0..common {
            overlap[d] = self.dim[d].min(out.dim[d]);
        }

        let mut idx = vec![0usize; common];
        loop {
            let sflat = self.linear_index(&idx);
            let dflat = out.linear_index(&idx);
            let s = self.sample(sflat);
            out.set_sample(dflat, s)?;

            // odometer over the overlap box
            let mut d = common;
            loop {
                if d == 0 {
                    return Ok(out);
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < overlap[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    /// Crop a region starting at `lo` with extents `size`, casting to
    /// `new_kind`. A zero entry in `size` deletes that axis from the
    /// output (the slice at `lo` is kept); a one entry keeps a
    /// length-1 axis.
    pub fn extract_cast(&self, lo: &[usize], size: &[usize], new_kind: ScalarKind)
        -> Result<ArrayStore, Error>
    {
        if lo.len() != size.len() || lo.len() > self.rank() {
            return Err(Error::invalid_argument("extract region rank mismatch"));
        }
        for d in 0..lo.len() {
            let len = size[d].max(1);
            if lo[d] + len > self.dim[d] {
                return Err(Error::invalid_argument(format!(
                    "extract region exceeds axis {} ({}+{} > {})",
                    d, lo[d], len, self.dim[d]
                )));
            }
        }

        let kept: Vec<usize> = (0..lo.len()).filter(|&d| size[d] > 0).collect();
        if kept.is_empty() {
            return Err(Error::invalid_argument("extract would delete every axis"));
        }
        let out_dim: Vec<usize> = kept.iter().map(|&d| size[d]).collect();
        let mut out = ArrayStore::zeros(&out_dim, new_kind)?;

        let mut oidx = vec![0usize; out_dim.len()];
        let mut sidx = lo.to_vec();
        loop {
            for (k, &d) in kept.iter().enumerate() {
                sidx[d] = lo[d] + oidx[k];
            }
            let s = self.sample(self.linear_index(&sidx));
            let dflat = out.linear_index(&oidx);
            out.set_sample(dflat, s)?;

            let mut d = out_dim.len();
            loop {
                if d == 0 {
                    return Ok(out);
                }
                d -= 1;
                oidx[d] += 1;
                if oidx[d] < out_dim[d] {
                    break;
                }
                oidx[d] = 0;
            }
        }
    }

    pub(crate) fn base_ptr(&self) -> *const u8
    {
        self.buf.as_ptr()
    }

    pub(crate) fn base_ptr_mut(&mut self) -> Result<*mut u8, Error>
    {
        self.bytes_mut().map(|b| b.as_mut_ptr())
    }
}

impl std::fmt::Debug for ArrayStore
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ArrayStore")
            .field("kind", &self.kind)
            .field("dim", &self.dim)
            .field("stride", &self.stride)
            .field("shared", &!self.is_unique())
            .finish()
    }
}
