// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Typed views over a runtime-typed [`ArrayStore`].
//!
//! A view fixes a value type `T` at compile time and installs a
//! matching `(get, set)` function-pointer pair at construction, chosen
//! from the monomorphized cast matrix over the store's [`ScalarKind`].
//! Reads and writes then cost one indirect call and one cast,
//! independent of the stored kind.

use crate::error::Error;
use crate::kind::{Scalar, ScalarKind};
use crate::store::ArrayStore;

fn cast_get<S: Scalar, T: Scalar>(p: *const u8) -> T
{
    T::from_sample(unsafe { (p as *const S).read_unaligned() }.into_sample())
}

fn cast_set<S: Scalar, T: Scalar>(p: *mut u8, v: T)
{
    unsafe { (p as *mut S).write_unaligned(S::from_sample(v.into_sample())) }
}

macro_rules! dispatch_kind {
    ($kind:expr, $apply:ident) => {
        match $kind {
            ScalarKind::UInt8 => $apply!(u8),
            ScalarKind::Int8 => $apply!(i8),
            ScalarKind::UInt16 => $apply!(u16),
            ScalarKind::Int16 => $apply!(i16),
            ScalarKind::UInt32 => $apply!(u32),
            ScalarKind::Int32 => $apply!(i32),
            ScalarKind::UInt64 => $apply!(u64),
            ScalarKind::Int64 => $apply!(i64),
            ScalarKind::Float32 => $apply!(f32),
            ScalarKind::Float64 => $apply!(f64),
            ScalarKind::Complex64 => $apply!(num_complex::Complex32),
            ScalarKind::Complex128 => $apply!(num_complex::Complex64),
            ScalarKind::Rgb24 => $apply!(crate::Rgb),
            ScalarKind::Rgba32 => $apply!(crate::Rgba),
            other => {
                return Err(Error::invalid_argument(format!(
                    "no accessor for scalar kind {:?}",
                    other
                )))
            }
        }
    };
}

fn getter_for<T: Scalar>(kind: ScalarKind) -> Result<fn(*const u8) -> T, Error>
{
    macro_rules! pick {
        ($s:ty) => {
            cast_get::<$s, T> as fn(*const u8) -> T
        };
    }
    Ok(dispatch_kind!(kind, pick))
}

fn setter_for<T: Scalar>(kind: ScalarKind) -> Result<fn(*mut u8, T), Error>
{
    macro_rules! pick {
        ($s:ty) => {
            cast_set::<$s, T> as fn(*mut u8, T)
        };
    }
    Ok(dispatch_kind!(kind, pick))
}

/// Read-only typed view of a store.
pub struct View<'a, T: Scalar>
{
    store: &'a ArrayStore,
    get: fn(*const u8) -> T,
}

impl<'a, T: Scalar> View<'a, T>
{
    pub fn new(store: &'a ArrayStore) -> Result<Self, Error>
    {
        Ok(View { store, get: getter_for::<T>(store.kind())? })
    }

    #[inline]
    pub fn store(&self) -> &ArrayStore
    {
        self.store
    }

    /// Read the element at a flat offset, cast to `T`.
    #[inline]
    pub fn get(&self, flat: usize) -> T
    {
        debug_assert!(flat < self.store.elements());
        let p = unsafe { self.store.base_ptr().add(self.store.addr(flat)) };
        (self.get)(p)
    }

    /// Read the element at an n-d index, cast to `T`.
    #[inline]
    pub fn get_nd(&self, index: &[usize]) -> T
    {
        self.get(self.store.linear_index(index))
    }

    /// Iterate every element in flat order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_
    {
        (0..self.store.elements()).map(move |i| self.get(i))
    }
}

/// Mutable typed view; requires the store handle to hold the unique
/// reference to its buffer.
pub struct ViewMut<'a, T: Scalar>
{
    store: &'a mut ArrayStore,
    get: fn(*const u8) -> T,
    set: fn(*mut u8, T),
}

impl<'a, T: Scalar> ViewMut<'a, T>
{
    pub fn new(store: &'a mut ArrayStore) -> Result<Self, Error>
    {
        if !store.is_unique() {
            return Err(Error::invalid_argument(
                "store buffer is shared; a mutable view needs a unique handle",
            ));
        }
        let kind = store.kind();
        Ok(ViewMut {
            get: getter_for::<T>(kind)?,
            set: setter_for::<T>(kind)?,
            store,
        })
    }

    #[inline]
    pub fn get(&self, flat: usize) -> T
    {
        debug_assert!(flat < self.store.elements());
        let p = unsafe { self.store.base_ptr().add(self.store.addr(flat)) };
        (self.get)(p)
    }

    #[inline]
    pub fn get_nd(&self, index: &[usize]) -> T
    {
        self.get(self.store.linear_index(index))
    }

    /// Write the element at a flat offset, casting from `T` to the
    /// stored kind.
    #[inline]
    pub fn set(&mut self, flat: usize, v: T)
    {
        debug_assert!(flat < self.store.elements());
        let addr = self.store.addr(flat);
        // uniqueness was checked at construction
        let p = unsafe { self.store.base_ptr_mut().expect("unique").add(addr) };
        (self.set)(p, v)
    }

    #[inline]
    pub fn set_nd(&mut self, index: &[usize], v: T)
    {
        self.set(self.store.linear_index(index), v)
    }

    /// Fill the whole store with one value.
    pub fn fill(&mut self, v: T)
    {
        for i in 0..self.store.elements() {
            self.set(i, v);
        }
    }
}

/// Three-dimensional pixel view: `(x, y, z)` access over the first
/// three axes of a store of rank at least 3.
pub struct Pixel3DView<'a, T: Scalar>
{
    view: View<'a, T>,
    stride: [usize; 3],
}

impl<'a, T: Scalar> Pixel3DView<'a, T>
{
    pub fn new(store: &'a ArrayStore) -> Result<Self, Error>
    {
        if store.rank() < 3 {
            return Err(Error::invalid_argument("Pixel3DView needs rank >= 3"));
        }
        let s = store.strides();
        let stride = [s[0], s[1], s[2]];
        Ok(Pixel3DView { view: View::new(store)?, stride })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T
    {
        self.view.get(x * self.stride[0] + y * self.stride[1] + z * self.stride[2])
    }
}

/// Vector view of a 3+D store: `(x, y, z, t)` where `t` runs over the
/// flattened fourth-and-higher dimensions.
pub struct Vector3DConstView<'a, T: Scalar>
{
    view: View<'a, T>,
    stride: [usize; 3],
    tlen: usize,
}

impl<'a, T: Scalar> Vector3DConstView<'a, T>
{
    pub fn new(store: &'a ArrayStore) -> Result<Self, Error>
    {
        if store.rank() < 3 {
            return Err(Error::invalid_argument("Vector3DConstView needs rank >= 3"));
        }
        let s = store.strides();
        let stride = [s[0], s[1], s[2]];
        let tlen = store.tlen();
        Ok(Vector3DConstView { view: View::new(store)?, stride, tlen })
    }

    #[inline]
    pub fn tlen(&self) -> usize
    {
        self.tlen
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, t: usize) -> T
    {
        debug_assert!(t < self.tlen);
        self.view
            .get(x * self.stride[0] + y * self.stride[1] + z * self.stride[2] + t)
    }
}

/// Mutable counterpart of [`Vector3DConstView`].
pub struct Vector3DView<'a, T: Scalar>
{
    view: ViewMut<'a, T>,
    stride: [usize; 3],
    tlen: usize,
}

impl<'a, T: Scalar> Vector3DView<'a, T>
{
    pub fn new(store: &'a mut ArrayStore) -> Result<Self, Error>
    {
        if store.rank() < 3 {
            return Err(Error::invalid_argument("Vector3DView needs rank >= 3"));
        }
        let s = store.strides();
        let stride = [s[0], s[1], s[2]];
        let tlen = store.tlen();
        Ok(Vector3DView { view: ViewMut::new(store)?, stride, tlen })
    }

    #[inline]
    pub fn tlen(&self) -> usize
    {
        self.tlen
    }

    #[inline]
    fn flat(&self, x: usize, y: usize, z: usize, t: usize) -> usize
    {
        debug_assert!(t < self.tlen);
        x * self.stride[0] + y * self.stride[1] + z * self.stride[2] + t
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, t: usize) -> T
    {
        self.view.get(self.flat(x, y, z, t))
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, t: usize, v: T)
    {
        let f = self.flat(x, y, z, t);
        self.view.set(f, v)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::kind::{Rgb, ScalarKind};
    use num_complex::Complex64;

    #[test]
    fn view_casts_every_supported_kind()
    {
        // fill an i16 store and read it through several view types
        let vals: Vec<i16> = (-4..8).collect();
        let store = ArrayStore::from_elems(&[3, 4], &vals).unwrap();
        let vf = View::<f64>::new(&store).unwrap();
        let vi = View::<i64>::new(&store).unwrap();
        let vc = View::<Complex64>::new(&store).unwrap();
        for (i, &v) in vals.iter().enumerate() {
            assert_eq!(vf.get(i), v as f64);
            assert_eq!(vi.get(i), v as i64);
            assert_eq!(vc.get(i), Complex64::new(v as f64, 0.));
        }
    }

    #[test]
    fn view_mut_writes_with_cast()
    {
        let mut store = ArrayStore::zeros(&[4], ScalarKind::UInt8).unwrap();
        {
            let mut vm = ViewMut::<f64>::new(&mut store).unwrap();
            vm.set(0, 3.9); // truncates
            vm.set(1, -2.0); // saturates at 0
            vm.set(2, 300.0); // saturates at 255
        }
        assert_eq!(store.sample(0).as_u64(), 3);
        assert_eq!(store.sample(1).as_u64(), 0);
        assert_eq!(store.sample(2).as_u64(), 255);
    }

    #[test]
    fn view_mut_requires_unique_store()
    {
        let mut store = ArrayStore::zeros(&[4], ScalarKind::Float32).unwrap();
        let alias = store.clone();
        assert!(ViewMut::<f64>::new(&mut store).is_err());
        drop(alias);
        assert!(ViewMut::<f64>::new(&mut store).is_ok());
    }

    #[test]
    fn vector3d_flattens_high_dims()
    {
        let mut store = ArrayStore::zeros(&[2, 3, 4, 5], ScalarKind::Float64).unwrap();
        {
            let mut vm = ViewMut::<f64>::new(&mut store).unwrap();
            for i in 0..store_len(&vm) {
                vm.set(i, i as f64);
            }
        }
        let v = Vector3DConstView::<f64>::new(&store).unwrap();
        assert_eq!(v.tlen(), 5);
        let flat = store.linear_index(&[1, 2, 3, 4]);
        assert_eq!(v.get(1, 2, 3, 4), flat as f64);
    }

    fn store_len<T: Scalar>(v: &ViewMut<'_, T>) -> usize
    {
        v.store.elements()
    }

    #[test]
    fn pixel3d_and_vector3d_views()
    {
        let mut store = ArrayStore::zeros(&[3, 3, 3, 2], ScalarKind::Float32).unwrap();
        {
            let mut v = Vector3DView::<f64>::new(&mut store).unwrap();
            assert_eq!(v.tlen(), 2);
            v.set(1, 2, 0, 1, 8.5);
            assert_eq!(v.get(1, 2, 0, 1), 8.5);
        }
        let p = Pixel3DView::<f64>::new(&store).unwrap();
        // the pixel view reads the first vector element
        assert_eq!(p.get(1, 2, 0), 0.);
        let flat = store.linear_index(&[1, 2, 0, 1]);
        assert_eq!(store.sample(flat).as_f64(), 8.5);

        let too_flat = ArrayStore::zeros(&[4, 4], ScalarKind::Float32).unwrap();
        assert!(Pixel3DView::<f64>::new(&too_flat).is_err());
    }

    #[test]
    fn rgb_views_cast_componentwise()
    {
        let store = ArrayStore::from_elems(&[2], &[Rgb([10, 20, 30]), Rgb([0, 0, 0])]).unwrap();
        let v = View::<f64>::new(&store).unwrap();
        assert_eq!(v.get(0), 20.);
        assert_eq!(v.get(1), 0.);
    }
}
