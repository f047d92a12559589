// Copyright 2014-2016 bluss and ndarray developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The closed set of storable scalar kinds and the casting rules
//! between them.
//!
//! Every [`ArrayStore`](crate::ArrayStore) carries exactly one
//! [`ScalarKind`] tag. Typed views read and write through the
//! [`Scalar`] trait, which routes conversions through the [`Sample`]
//! value so that integer precision survives integer-to-integer casts.

use num_complex::{Complex32, Complex64};
use num_traits::AsPrimitive;

use crate::error::Error;
use crate::private::{seal, Sealed};

/// Tag identifying the element type stored in an array buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind
{
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
    /// Recognized for interchange, but not representable on this
    /// platform; allocation requests are rejected.
    Float128,
    Complex64,
    Complex128,
    /// Recognized for interchange, but not representable on this
    /// platform; allocation requests are rejected.
    Complex256,
    Rgb24,
    Rgba32,
}

impl ScalarKind
{
    /// All kinds, in tag order.
    pub const ALL: [ScalarKind; 16] = [
        ScalarKind::UInt8,
        ScalarKind::Int8,
        ScalarKind::UInt16,
        ScalarKind::Int16,
        ScalarKind::UInt32,
        ScalarKind::Int32,
        ScalarKind::UInt64,
        ScalarKind::Int64,
        ScalarKind::Float32,
        ScalarKind::Float64,
        ScalarKind::Float128,
        ScalarKind::Complex64,
        ScalarKind::Complex128,
        ScalarKind::Complex256,
        ScalarKind::Rgb24,
        ScalarKind::Rgba32,
    ];

    /// Size of one element in bytes.
    pub fn size_of(self) -> usize
    {
        match self {
            ScalarKind::UInt8 | ScalarKind::Int8 => 1,
            ScalarKind::UInt16 | ScalarKind::Int16 => 2,
            ScalarKind::UInt32 | ScalarKind::Int32 | ScalarKind::Float32 => 4,
            ScalarKind::UInt64 | ScalarKind::Int64 | ScalarKind::Float64 => 8,
            ScalarKind::Float128 => 16,
            ScalarKind::Complex64 => 8,
            ScalarKind::Complex128 => 16,
            ScalarKind::Complex256 => 32,
            ScalarKind::Rgb24 => 3,
            ScalarKind::Rgba32 => 4,
        }
    }

    /// Whether values of this kind can be stored and accessed on this
    /// platform.
    pub fn representable(self) -> bool
    {
        !matches!(self, ScalarKind::Float128 | ScalarKind::Complex256)
    }

    pub fn is_complex(self) -> bool
    {
        matches!(self, ScalarKind::Complex64 | ScalarKind::Complex128 | ScalarKind::Complex256)
    }

    pub fn is_integer(self) -> bool
    {
        matches!(
            self,
            ScalarKind::UInt8
                | ScalarKind::Int8
                | ScalarKind::UInt16
                | ScalarKind::Int16
                | ScalarKind::UInt32
                | ScalarKind::Int32
                | ScalarKind::UInt64
                | ScalarKind::Int64
        )
    }

    pub(crate) fn check_representable(self) -> Result<(), Error>
    {
        if self.representable() {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!("scalar kind {:?} is not representable", self)))
        }
    }
}

/// A 24-bit RGB pixel.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgb(pub [u8; 3]);

/// A 32-bit RGBA pixel.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

/// A single element value in transit between two scalar kinds.
///
/// Conversions are lossless within a class (ints stay `i64`/`u64`,
/// never bounced through `f64`) and follow fixed rules across classes:
/// real to integer truncates toward zero, complex to real keeps the
/// real part, color to scalar reads the channel mean and scalar to
/// color writes the clamped value into every channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Sample
{
    Int(i64),
    UInt(u64),
    Real(f64),
    Complex(Complex64),
    Color([u8; 4]),
}

impl Sample
{
    pub fn as_f64(self) -> f64
    {
        match self {
            Sample::Int(v) => v as f64,
            Sample::UInt(v) => v as f64,
            Sample::Real(v) => v,
            Sample::Complex(c) => c.re,
            Sample::Color(c) => (c[0] as f64 + c[1] as f64 + c[2] as f64) / 3.,
        }
    }

    pub fn as_i64(self) -> i64
    {
        match self {
            Sample::Int(v) => v,
            Sample::UInt(v) => v as i64,
            // `as` truncates toward zero and saturates at the limits
            Sample::Real(v) => v as i64,
            Sample::Complex(c) => c.re as i64,
            Sample::Color(_) => self.as_f64() as i64,
        }
    }

    pub fn as_u64(self) -> u64
    {
        match self {
            Sample::Int(v) => v as u64,
            Sample::UInt(v) => v,
            Sample::Real(v) => v as u64,
            Sample::Complex(c) => c.re as u64,
            Sample::Color(_) => self.as_f64() as u64,
        }
    }

    pub fn as_c64(self) -> Complex64
    {
        match self {
            Sample::Complex(c) => c,
            other => Complex64::new(other.as_f64(), 0.),
        }
    }

    pub fn as_color(self) -> [u8; 4]
    {
        match self {
            Sample::Color(c) => c,
            other => {
                let v = other.as_f64().clamp(0., 255.) as u8;
                [v, v, v, 255]
            }
        }
    }
}

/// An element type that can live in an array buffer or serve as the
/// value type of a typed view. Sealed: the cast matrix is closed.
pub trait Scalar: Copy + PartialEq + Send + Sync + 'static + Sealed
{
    const KIND: ScalarKind;

    fn into_sample(self) -> Sample;
    fn from_sample(s: Sample) -> Self;
}

seal!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, Complex32, Complex64, Rgb, Rgba);

macro_rules! int_scalar {
    ($($t:ty => $kind:ident, $variant:ident;)*) => {
        $(
        impl Scalar for $t
        {
            const KIND: ScalarKind = ScalarKind::$kind;

            #[inline]
            fn into_sample(self) -> Sample
            {
                Sample::$variant(self as _)
            }

            /// Integer sources convert with `as` semantics; real
            /// sources truncate toward zero and saturate at the type
            /// limits.
            #[inline]
            fn from_sample(s: Sample) -> Self
            {
                match s {
                    Sample::Int(v) => v.as_(),
                    Sample::UInt(v) => v.as_(),
                    Sample::Real(v) => v.as_(),
                    Sample::Complex(c) => c.re.as_(),
                    Sample::Color(_) => s.as_f64().as_(),
                }
            }
        }
        )*
    };
}

int_scalar! {
    u8  => UInt8,  UInt;
    u16 => UInt16, UInt;
    u32 => UInt32, UInt;
    u64 => UInt64, UInt;
    i8  => Int8,   Int;
    i16 => Int16,  Int;
    i32 => Int32,  Int;
    i64 => Int64,  Int;
}

impl Scalar for f32
{
    const KIND: ScalarKind = ScalarKind::Float32;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Real(self as f64)
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        s.as_f64() as f32
    }
}

impl Scalar for f64
{
    const KIND: ScalarKind = ScalarKind::Float64;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Real(self)
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        s.as_f64()
    }
}

impl Scalar for Complex32
{
    const KIND: ScalarKind = ScalarKind::Complex64;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Complex(Complex64::new(self.re as f64, self.im as f64))
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        let c = s.as_c64();
        Complex32::new(c.re as f32, c.im as f32)
    }
}

impl Scalar for Complex64
{
    const KIND: ScalarKind = ScalarKind::Complex128;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Complex(self)
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        s.as_c64()
    }
}

impl Scalar for Rgb
{
    const KIND: ScalarKind = ScalarKind::Rgb24;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Color([self.0[0], self.0[1], self.0[2], 255])
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        let c = s.as_color();
        Rgb([c[0], c[1], c[2]])
    }
}

impl Scalar for Rgba
{
    const KIND: ScalarKind = ScalarKind::Rgba32;

    #[inline]
    fn into_sample(self) -> Sample
    {
        Sample::Color(self.0)
    }

    #[inline]
    fn from_sample(s: Sample) -> Self
    {
        Rgba(s.as_color())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn sizes()
    {
        assert_eq!(ScalarKind::UInt8.size_of(), 1);
        assert_eq!(ScalarKind::Complex128.size_of(), 16);
        assert_eq!(ScalarKind::Rgb24.size_of(), 3);
        assert_eq!(ScalarKind::Float128.size_of(), 16);
        for k in ScalarKind::ALL {
            assert!(k.size_of() >= 1);
        }
    }

    #[test]
    fn unrepresentable_kinds()
    {
        assert!(!ScalarKind::Float128.representable());
        assert!(!ScalarKind::Complex256.representable());
        assert!(ScalarKind::Float64.representable());
    }

    #[test]
    fn int_precision_survives()
    {
        let big: i64 = (1 << 60) + 3;
        assert_eq!(i64::from_sample(big.into_sample()), big);
        let ubig: u64 = u64::MAX - 7;
        assert_eq!(u64::from_sample(ubig.into_sample()), ubig);
    }

    #[test]
    fn real_to_int_truncates_toward_zero()
    {
        assert_eq!(i32::from_sample(Sample::Real(2.9)), 2);
        assert_eq!(i32::from_sample(Sample::Real(-2.9)), -2);
        assert_eq!(u8::from_sample(Sample::Real(-1.5)), 0);
    }

    #[test]
    fn complex_to_real_takes_real_part()
    {
        let c = Complex64::new(3.25, -8.5);
        assert_eq!(f64::from_sample(Sample::Complex(c)), 3.25);
        assert_eq!(i16::from_sample(Sample::Complex(c)), 3);
    }

    #[test]
    fn color_casts_are_componentwise()
    {
        let g = Rgb::from_sample(Sample::Real(300.0));
        assert_eq!(g, Rgb([255, 255, 255]));
        let v = f64::from_sample(Rgb([10, 20, 30]).into_sample());
        assert_eq!(v, 20.);
        let a = Rgba::from_sample(Rgba([1, 2, 3, 4]).into_sample());
        assert_eq!(a, Rgba([1, 2, 3, 4]));
    }
}
