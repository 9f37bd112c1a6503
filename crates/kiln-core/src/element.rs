//! Typed element access and runtime dtype dispatch.

use std::fmt;

use half::{bf16, f16};

use crate::DType;

/// A plain-old-data scalar that can live in tensor storage.
///
/// `Bool` tensors are accessed through the `u8` implementation.
pub trait Element: bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The dtype this Rust type is stored as.
    const DTYPE: DType;

    fn zero() -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn to_i64(self) -> i64;
    fn from_i64(v: i64) -> Self;
}

macro_rules! impl_int_element {
    ($($t:ty => $dtype:ident),*) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn zero() -> Self {
                    0
                }
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $t
                }
                #[inline]
                fn to_i64(self) -> i64 {
                    self as i64
                }
                #[inline]
                fn from_i64(v: i64) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_int_element!(u8 => U8, i8 => I8, i32 => I32, i64 => I64);

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn zero() -> Self {
        0.0
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }
    #[inline]
    fn from_i64(v: i64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    #[inline]
    fn zero() -> Self {
        0.0
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }
    #[inline]
    fn from_i64(v: i64) -> Self {
        v as f64
    }
}

macro_rules! impl_half_element {
    ($($t:ty => $dtype:ident),*) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn zero() -> Self {
                    <$t>::ZERO
                }
                #[inline]
                fn to_f64(self) -> f64 {
                    <$t>::to_f64(self)
                }
                #[inline]
                fn from_f64(v: f64) -> Self {
                    <$t>::from_f64(v)
                }
                #[inline]
                fn to_i64(self) -> i64 {
                    <$t>::to_f64(self) as i64
                }
                #[inline]
                fn from_i64(v: i64) -> Self {
                    <$t>::from_f64(v as f64)
                }
            }
        )*
    };
}

impl_half_element!(f16 => F16, bf16 => BF16);

/// Convert one element between dtypes with the implicit-cast rules of
/// [`crate::Tensor::copy_from`].
///
/// Integral pairs go through `i64` so 64-bit values survive; anything
/// involving a float goes through `f64`. Casting to `Bool` yields 0 or 1.
#[inline]
pub fn cast_element<S: Element, D: Element>(v: S, src: DType, dst: DType) -> D {
    if dst == DType::Bool {
        let truthy = if src.is_float() { v.to_f64() != 0.0 } else { v.to_i64() != 0 };
        return D::from_i64(truthy as i64);
    }
    if src.is_float() || dst.is_float() {
        D::from_f64(v.to_f64())
    } else {
        D::from_i64(v.to_i64())
    }
}

/// Run `$body` with `$T` bound to the Rust element type of `$dtype`.
///
/// ```
/// use kiln_core::{dispatch_dtype, DType};
///
/// let size = dispatch_dtype!(DType::BF16, T => std::mem::size_of::<T>());
/// assert_eq!(size, 2);
/// ```
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::DType::Bool | $crate::DType::U8 => {
                #[allow(dead_code)]
                type $T = u8;
                $body
            }
            $crate::DType::I8 => {
                #[allow(dead_code)]
                type $T = i8;
                $body
            }
            $crate::DType::I32 => {
                #[allow(dead_code)]
                type $T = i32;
                $body
            }
            $crate::DType::I64 => {
                #[allow(dead_code)]
                type $T = i64;
                $body
            }
            $crate::DType::F16 => {
                #[allow(dead_code)]
                type $T = $crate::element::F16;
                $body
            }
            $crate::DType::BF16 => {
                #[allow(dead_code)]
                type $T = $crate::element::BF16;
                $body
            }
            $crate::DType::F32 => {
                #[allow(dead_code)]
                type $T = f32;
                $body
            }
            $crate::DType::F64 => {
                #[allow(dead_code)]
                type $T = f64;
                $body
            }
        }
    };
}

/// Re-exported so `dispatch_dtype!` expands without callers depending on `half`.
pub type F16 = f16;
/// Re-exported so `dispatch_dtype!` expands without callers depending on `half`.
pub type BF16 = bf16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_int_keeps_precision() {
        let big = (1i64 << 53) + 1;
        let out: i64 = cast_element(big, DType::I64, DType::I64);
        assert_eq!(out, big);
    }

    #[test]
    fn test_cast_to_bool() {
        let out: u8 = cast_element(-3.5f32, DType::F32, DType::Bool);
        assert_eq!(out, 1);
        let out: u8 = cast_element(0i32, DType::I32, DType::Bool);
        assert_eq!(out, 0);
    }

    #[test]
    fn test_cast_half() {
        let out: f16 = cast_element(1.5f64, DType::F64, DType::F16);
        assert_eq!(out.to_f64(), 1.5);
        let back: i32 = cast_element(out, DType::F16, DType::I32);
        assert_eq!(back, 1);
    }

    #[test]
    fn test_dispatch_sizes() {
        for dtype in [DType::Bool, DType::I32, DType::F16, DType::F64] {
            let size = dispatch_dtype!(dtype, T => std::mem::size_of::<T>());
            assert_eq!(size, dtype.element_size());
        }
    }
}
