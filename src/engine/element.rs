// Element types moved through bulk memory and scratchpad
use bytemuck::{Pod, Zeroable};
use num_complex::Complex64;
use std::fmt;
use std::ops::{Add, Mul};

use crate::error::PimError;

/// Runtime tag of an element type, as carried in the argument block header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I32 = 0,
    U32 = 1,
    I64 = 2,
    U64 = 3,
    F32 = 4,
    F64 = 5,
    C64 = 6,
}

impl ElementType {
    pub const fn size(self) -> usize {
        match self {
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
            ElementType::C64 => 16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::I32 => "i32",
            ElementType::U32 => "u32",
            ElementType::I64 => "i64",
            ElementType::U64 => "u64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::C64 => "c64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for ElementType {
    type Error = PimError;

    fn try_from(tag: u16) -> Result<Self, PimError> {
        Ok(match tag {
            0 => ElementType::I32,
            1 => ElementType::U32,
            2 => ElementType::I64,
            3 => ElementType::U64,
            4 => ElementType::F32,
            5 => ElementType::F64,
            6 => ElementType::C64,
            other => return Err(PimError::UnknownElementType(other)),
        })
    }
}

/// A plain-old-data value that kernels can stage and compute on.
pub trait Element:
    Pod + PartialEq + fmt::Debug + Send + Sync + Add<Output = Self> + Mul<Output = Self>
{
    const DTYPE: ElementType;

    fn zero() -> Self {
        Self::zeroed()
    }

    /// `self + rhs`; integers wrap on overflow in every build profile.
    fn wrapping_add(self, rhs: Self) -> Self {
        self + rhs
    }

    /// `self * rhs`; integers wrap on overflow in every build profile.
    fn wrapping_mul(self, rhs: Self) -> Self {
        self * rhs
    }
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: ElementType = ElementType::$tag;
            }
        )*
    };
}

macro_rules! impl_integer_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: ElementType = ElementType::$tag;

                fn wrapping_add(self, rhs: Self) -> Self {
                    <$ty>::wrapping_add(self, rhs)
                }

                fn wrapping_mul(self, rhs: Self) -> Self {
                    <$ty>::wrapping_mul(self, rhs)
                }
            }
        )*
    };
}

impl_integer_element!(i32 => I32, u32 => U32, i64 => I64, u64 => U64);
impl_element!(f32 => F32, f64 => F64, Complex64 => C64);

/// Integer elements that can be binned by the histogram kernel.
pub trait BinKey: Element {
    fn as_key(self) -> u64;

    /// `(value * bins) >> depth`, clamped into `0..bins`.
    fn bin_index(self, bins: u32, depth: u32) -> usize {
        let raw = (u128::from(self.as_key()) * u128::from(bins)) >> depth;
        raw.min(u128::from(bins.saturating_sub(1))) as usize
    }
}

impl BinKey for u32 {
    fn as_key(self) -> u64 {
        u64::from(self)
    }
}

impl BinKey for u64 {
    fn as_key(self) -> u64 {
        self
    }
}

impl BinKey for i32 {
    fn as_key(self) -> u64 {
        // negative inputs land in bin 0
        self.max(0) as u64
    }
}

/// Untyped 16-byte parameter slot: wide enough for every [`Element`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Scalar {
    bytes: [u8; 16],
}

impl Scalar {
    pub fn from_value<T: Element>(value: T) -> Self {
        let mut scalar = Self::default();
        let raw = bytemuck::bytes_of(&value);
        scalar.bytes[..raw.len()].copy_from_slice(raw);
        scalar
    }

    pub fn get<T: Element>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.bytes[..std::mem::size_of::<T>()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for tag in 0..7u16 {
            let dtype = ElementType::try_from(tag).unwrap();
            assert_eq!(dtype as u16, tag);
        }
        assert!(matches!(
            ElementType::try_from(7),
            Err(PimError::UnknownElementType(7))
        ));
    }

    #[test]
    fn sizes_match_rust_types() {
        assert_eq!(ElementType::F64.size(), std::mem::size_of::<f64>());
        assert_eq!(ElementType::C64.size(), std::mem::size_of::<Complex64>());
        assert_eq!(ElementType::I32.size(), std::mem::size_of::<i32>());
    }

    #[test]
    fn scalar_holds_every_element() {
        assert_eq!(Scalar::from_value(2.5f64).get::<f64>(), 2.5);
        assert_eq!(Scalar::from_value(-7i32).get::<i32>(), -7);
        let c = Complex64::new(1.0, -3.0);
        assert_eq!(Scalar::from_value(c).get::<Complex64>(), c);
    }

    fn axpy_step<T: Element>(alpha: T, x: T, y: T) -> T {
        alpha.wrapping_mul(x).wrapping_add(y)
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(axpy_step(i32::MAX, 2, 3), 1);
        assert_eq!(axpy_step(u64::MAX, 1, 1), 0);
        assert_eq!(axpy_step(2.5f64, 2.0, 1.0), 6.0);
        let c = axpy_step(Complex64::new(0.0, 1.0), Complex64::new(2.0, 0.0), Complex64::new(1.0, 0.0));
        assert_eq!(c, Complex64::new(1.0, 2.0));
    }

    #[test]
    fn bin_index_maps_and_clamps() {
        // depth 4: values 0..16, 4 bins of width 4
        assert_eq!(0u32.bin_index(4, 4), 0);
        assert_eq!(5u32.bin_index(4, 4), 1);
        assert_eq!(15u32.bin_index(4, 4), 3);
        assert_eq!(99u32.bin_index(4, 4), 3);
        assert_eq!((-3i32).bin_index(4, 4), 0);
    }
}
