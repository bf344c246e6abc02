// Kernel Argument Block
// Byte-exact, versioned launch arguments shared by every lane of a node
use bytemuck::{Pod, Zeroable};
use num_complex::Complex64;
use std::mem::{align_of, size_of};

use crate::engine::accessor::AffineAccessor;
use crate::engine::element::{Element, ElementType, Scalar};
use crate::engine::geometry::{Coord, Point, Rect, MAX_DIM};
use crate::error::{PimError, Result};

/// Size in bytes of every argument block, on the host and on the node.
pub const ARG_BLOCK_SIZE: usize = 384;
/// "PIMA", little-endian.
pub const ARG_MAGIC: u32 = 0x414D_4950;
pub const ARG_VERSION: u16 = 1;

const RECT_SLOTS: usize = 4;
const ACCESSOR_SLOTS: usize = 4;
const PARAM_SLOTS: usize = 4;

/// Which kernel of the closed kernel table a launch runs.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Axpy = 1,
    Matmul = 2,
    Histogram = 3,
}

impl TryFrom<u16> for KernelKind {
    type Error = PimError;

    fn try_from(tag: u16) -> Result<Self> {
        match tag {
            1 => Ok(KernelKind::Axpy),
            2 => Ok(KernelKind::Matmul),
            3 => Ok(KernelKind::Histogram),
            other => Err(PimError::UnknownKernel(other)),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ArgHeader {
    pub magic: u32,
    pub version: u16,
    pub kernel: u16,
    pub dtype: u16,
    _pad: [u16; 3],
}

/// A rectangle of up to `MAX_DIM` dimensions; `dim == 0` marks an unused slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RectDesc {
    pub lo: [Coord; MAX_DIM],
    pub hi: [Coord; MAX_DIM],
    pub dim: u32,
    _pad: u32,
}

impl RectDesc {
    pub fn from_rect<const N: usize>(rect: &Rect<N>) -> Self {
        let mut desc = Self::zeroed();
        desc.lo[..N].copy_from_slice(&rect.lo.values);
        desc.hi[..N].copy_from_slice(&rect.hi.values);
        desc.dim = N as u32;
        desc
    }

    pub fn rect<const N: usize>(&self) -> Result<Rect<N>> {
        if self.dim as usize != N || N > MAX_DIM {
            return Err(PimError::InvalidRegion(format!(
                "rect slot holds a {}-D rect, kernel expects {N}-D",
                self.dim
            )));
        }
        let mut lo = Point::<N>::zeroes();
        let mut hi = Point::<N>::zeroes();
        lo.values.copy_from_slice(&self.lo[..N]);
        hi.values.copy_from_slice(&self.hi[..N]);
        Ok(Rect::new(lo, hi))
    }
}

/// An untyped accessor: base, strides and the element size it was built for.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawAccessor {
    pub base: i64,
    pub strides: [i64; MAX_DIM],
    pub elem_size: u32,
    pub dim: u32,
}

impl RawAccessor {
    pub fn from_typed<T: Element, const N: usize>(acc: &AffineAccessor<T, N>) -> Self {
        let mut raw = Self::zeroed();
        raw.base = acc.base();
        raw.strides[..N].copy_from_slice(&acc.strides());
        raw.elem_size = size_of::<T>() as u32;
        raw.dim = N as u32;
        raw
    }

    pub fn typed<T: Element, const N: usize>(&self) -> Result<AffineAccessor<T, N>> {
        if self.elem_size as usize != size_of::<T>() || self.dim as usize != N {
            return Err(PimError::ElementMismatch(format!(
                "accessor slot is {}-D over {}-byte elements, kernel expects {N}-D {}",
                self.dim,
                self.elem_size,
                T::DTYPE
            )));
        }
        let mut strides = [0i64; N];
        strides.copy_from_slice(&self.strides[..N]);
        Ok(AffineAccessor::new(self.base, strides))
    }
}

/// The wire form of one launch: exactly [`ARG_BLOCK_SIZE`] bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelArgBlock {
    pub header: ArgHeader,
    pub rects: [RectDesc; RECT_SLOTS],
    pub accessors: [RawAccessor; ACCESSOR_SLOTS],
    pub params: [u64; PARAM_SLOTS],
    pub scalar: Scalar,
    _reserved: [u8; 32],
}

const _: () = assert!(size_of::<KernelArgBlock>() == ARG_BLOCK_SIZE);
const _: () = assert!(align_of::<KernelArgBlock>() == 8);
const _: () = assert!(ARG_BLOCK_SIZE % 8 == 0);

impl KernelArgBlock {
    fn with_header(kind: KernelKind, dtype: ElementType) -> Self {
        let mut block = Self::zeroed();
        block.header.magic = ARG_MAGIC;
        block.header.version = ARG_VERSION;
        block.header.kernel = kind as u16;
        block.header.dtype = dtype as u16;
        block
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }

    /// Parse a transferred block, checking size, magic and schema version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ARG_BLOCK_SIZE {
            return Err(PimError::ArgBlockSize {
                expected: ARG_BLOCK_SIZE,
                got: bytes.len(),
            });
        }
        let block: Self = bytemuck::pod_read_unaligned(bytes);
        if block.header.magic != ARG_MAGIC {
            return Err(PimError::ArgBlockMagic(block.header.magic));
        }
        if block.header.version != ARG_VERSION {
            return Err(PimError::ArgBlockVersion {
                expected: ARG_VERSION,
                got: block.header.version,
            });
        }
        Ok(block)
    }

    pub fn kind(&self) -> Result<KernelKind> {
        KernelKind::try_from(self.header.kernel)
    }

    pub fn decode(&self) -> Result<KernelArgs> {
        let kind = self.kind()?;
        let dtype = ElementType::try_from(self.header.dtype)?;
        let unsupported = || {
            PimError::ElementMismatch(format!("{kind:?} kernel has no {dtype} variant"))
        };
        Ok(match kind {
            KernelKind::Axpy => KernelArgs::Axpy(match dtype {
                ElementType::I32 => AxpyArgs::<i32>::decode(self)?.into(),
                ElementType::U32 => AxpyArgs::<u32>::decode(self)?.into(),
                ElementType::I64 => AxpyArgs::<i64>::decode(self)?.into(),
                ElementType::U64 => AxpyArgs::<u64>::decode(self)?.into(),
                ElementType::F32 => AxpyArgs::<f32>::decode(self)?.into(),
                ElementType::F64 => AxpyArgs::<f64>::decode(self)?.into(),
                ElementType::C64 => AxpyArgs::<Complex64>::decode(self)?.into(),
            }),
            KernelKind::Matmul => KernelArgs::Matmul(match dtype {
                ElementType::I32 => MatmulArgs::<i32>::decode(self)?.into(),
                ElementType::I64 => MatmulArgs::<i64>::decode(self)?.into(),
                ElementType::F32 => MatmulArgs::<f32>::decode(self)?.into(),
                ElementType::F64 => MatmulArgs::<f64>::decode(self)?.into(),
                _ => return Err(unsupported()),
            }),
            KernelKind::Histogram => KernelArgs::Histogram(match dtype {
                ElementType::U32 => HistogramArgs::<u32>::decode(self)?.into(),
                ElementType::I32 => HistogramArgs::<i32>::decode(self)?.into(),
                ElementType::U64 => HistogramArgs::<u64>::decode(self)?.into(),
                _ => return Err(unsupported()),
            }),
        })
    }
}

/// `z = alpha * x + y` over `rect`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxpyArgs<T> {
    pub rect: Rect<1>,
    pub x: AffineAccessor<T, 1>,
    pub y: AffineAccessor<T, 1>,
    pub z: AffineAccessor<T, 1>,
    pub alpha: T,
}

impl<T: Element> AxpyArgs<T> {
    pub fn encode(&self) -> KernelArgBlock {
        let mut block = KernelArgBlock::with_header(KernelKind::Axpy, T::DTYPE);
        block.rects[0] = RectDesc::from_rect(&self.rect);
        block.accessors[0] = RawAccessor::from_typed(&self.x);
        block.accessors[1] = RawAccessor::from_typed(&self.y);
        block.accessors[2] = RawAccessor::from_typed(&self.z);
        block.scalar = Scalar::from_value(self.alpha);
        block
    }

    fn decode(block: &KernelArgBlock) -> Result<Self> {
        Ok(Self {
            rect: block.rects[0].rect()?,
            x: block.accessors[0].typed()?,
            y: block.accessors[1].typed()?,
            z: block.accessors[2].typed()?,
            alpha: block.scalar.get(),
        })
    }
}

/// One tile of `C = A × B`, with `A` row-major `[M][K]` and `B` stored
/// transposed as `[N][K]`.
///
/// `rect_a` and `rect_b` are the rows of `A` and `Bᵀ` the tile references;
/// their second axis is the shared `K` dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatmulArgs<T> {
    pub tile: Rect<2>,
    pub rect_a: Rect<2>,
    pub rect_b: Rect<2>,
    pub a: AffineAccessor<T, 2>,
    pub b_t: AffineAccessor<T, 2>,
    pub c: AffineAccessor<T, 2>,
}

impl<T: Element> MatmulArgs<T> {
    /// Length of every dot product.
    pub fn inner(&self) -> u64 {
        self.rect_a.extent(1)
    }

    pub fn encode(&self) -> KernelArgBlock {
        let mut block = KernelArgBlock::with_header(KernelKind::Matmul, T::DTYPE);
        block.rects[0] = RectDesc::from_rect(&self.tile);
        block.rects[1] = RectDesc::from_rect(&self.rect_a);
        block.rects[2] = RectDesc::from_rect(&self.rect_b);
        block.accessors[0] = RawAccessor::from_typed(&self.a);
        block.accessors[1] = RawAccessor::from_typed(&self.b_t);
        block.accessors[2] = RawAccessor::from_typed(&self.c);
        block
    }

    fn decode(block: &KernelArgBlock) -> Result<Self> {
        let args = Self {
            tile: block.rects[0].rect()?,
            rect_a: block.rects[1].rect()?,
            rect_b: block.rects[2].rect()?,
            a: block.accessors[0].typed()?,
            b_t: block.accessors[1].typed()?,
            c: block.accessors[2].typed()?,
        };
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rect_a.extent(1) != self.rect_b.extent(1) {
            return Err(PimError::InvalidRegion(format!(
                "inner dimensions differ: A rows {} vs Bᵀ rows {}",
                self.rect_a, self.rect_b
            )));
        }
        let rows = Rect::span(self.tile.lo[0], self.tile.hi[0]);
        let cols = Rect::span(self.tile.lo[1], self.tile.hi[1]);
        let a_rows = Rect::span(self.rect_a.lo[0], self.rect_a.hi[0]);
        let b_rows = Rect::span(self.rect_b.lo[0], self.rect_b.hi[0]);
        if !self.tile.is_empty() && !(a_rows.contains_rect(&rows) && b_rows.contains_rect(&cols)) {
            return Err(PimError::InvalidRegion(format!(
                "tile {} references rows outside A {} or Bᵀ {}",
                self.tile, self.rect_a, self.rect_b
            )));
        }
        Ok(())
    }
}

/// Per-node histogram of `rect`, written to `output` at `output_rect`.
///
/// `partials` is a `[lanes][bins]` scratch area in bulk memory, one row per
/// lane, used to combine the lanes' private histograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramArgs<T> {
    pub rect: Rect<1>,
    pub input: AffineAccessor<T, 1>,
    pub partials_rect: Rect<2>,
    pub partials: AffineAccessor<u32, 2>,
    pub output_rect: Rect<1>,
    pub output: AffineAccessor<u32, 1>,
    pub bins: u32,
    pub depth: u32,
}

impl<T: Element> HistogramArgs<T> {
    pub fn encode(&self) -> KernelArgBlock {
        let mut block = KernelArgBlock::with_header(KernelKind::Histogram, T::DTYPE);
        block.rects[0] = RectDesc::from_rect(&self.rect);
        block.rects[1] = RectDesc::from_rect(&self.partials_rect);
        block.rects[2] = RectDesc::from_rect(&self.output_rect);
        block.accessors[0] = RawAccessor::from_typed(&self.input);
        block.accessors[1] = RawAccessor::from_typed(&self.partials);
        block.accessors[2] = RawAccessor::from_typed(&self.output);
        block.params[0] = u64::from(self.bins);
        block.params[1] = u64::from(self.depth);
        block
    }

    fn decode(block: &KernelArgBlock) -> Result<Self> {
        let narrow = |v: u64, what: &str| {
            u32::try_from(v)
                .map_err(|_| PimError::InvalidConfig(format!("histogram {what} {v} out of range")))
        };
        let args = Self {
            rect: block.rects[0].rect()?,
            partials_rect: block.rects[1].rect()?,
            output_rect: block.rects[2].rect()?,
            input: block.accessors[0].typed()?,
            partials: block.accessors[1].typed()?,
            output: block.accessors[2].typed()?,
            bins: narrow(block.params[0], "bins")?,
            depth: narrow(block.params[1], "depth")?,
        };
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bins == 0 || self.depth >= 64 {
            return Err(PimError::InvalidConfig(format!(
                "histogram needs bins >= 1 and depth < 64, got bins={} depth={}",
                self.bins, self.depth
            )));
        }
        if self.output_rect.volume() != u64::from(self.bins)
            || self.partials_rect.extent(1) != u64::from(self.bins)
        {
            return Err(PimError::InvalidRegion(format!(
                "{} bins do not match output {} / partials {}",
                self.bins, self.output_rect, self.partials_rect
            )));
        }
        Ok(())
    }
}

macro_rules! typed_args {
    ($name:ident, $args:ident, [$($variant:ident => $ty:ty),* $(,)?]) => {
        /// Arguments of one kernel for every element type it supports.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum $name {
            $($variant($args<$ty>),)*
        }

        $(
            impl From<$args<$ty>> for $name {
                fn from(args: $args<$ty>) -> Self {
                    $name::$variant(args)
                }
            }
        )*

        impl $name {
            pub fn dtype(&self) -> ElementType {
                match self {
                    $($name::$variant(_) => <$ty as Element>::DTYPE,)*
                }
            }

            pub fn encode(&self) -> KernelArgBlock {
                match self {
                    $($name::$variant(args) => args.encode(),)*
                }
            }
        }
    };
}

typed_args!(AnyAxpyArgs, AxpyArgs, [
    I32 => i32,
    U32 => u32,
    I64 => i64,
    U64 => u64,
    F32 => f32,
    F64 => f64,
    C64 => Complex64,
]);
typed_args!(AnyMatmulArgs, MatmulArgs, [I32 => i32, I64 => i64, F32 => f32, F64 => f64]);
typed_args!(AnyHistogramArgs, HistogramArgs, [U32 => u32, I32 => i32, U64 => u64]);

/// Typed launch arguments: one variant per kernel of the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArgs {
    Axpy(AnyAxpyArgs),
    Matmul(AnyMatmulArgs),
    Histogram(AnyHistogramArgs),
}

impl KernelArgs {
    pub fn kind(&self) -> KernelKind {
        match self {
            KernelArgs::Axpy(_) => KernelKind::Axpy,
            KernelArgs::Matmul(_) => KernelKind::Matmul,
            KernelArgs::Histogram(_) => KernelKind::Histogram,
        }
    }

    pub fn dtype(&self) -> ElementType {
        match self {
            KernelArgs::Axpy(args) => args.dtype(),
            KernelArgs::Matmul(args) => args.dtype(),
            KernelArgs::Histogram(args) => args.dtype(),
        }
    }

    pub fn encode(&self) -> KernelArgBlock {
        match self {
            KernelArgs::Axpy(args) => args.encode(),
            KernelArgs::Matmul(args) => args.encode(),
            KernelArgs::Histogram(args) => args.encode(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().to_bytes()
    }
}

impl<T> From<AxpyArgs<T>> for KernelArgs
where
    AnyAxpyArgs: From<AxpyArgs<T>>,
{
    fn from(args: AxpyArgs<T>) -> Self {
        KernelArgs::Axpy(args.into())
    }
}

impl<T> From<MatmulArgs<T>> for KernelArgs
where
    AnyMatmulArgs: From<MatmulArgs<T>>,
{
    fn from(args: MatmulArgs<T>) -> Self {
        KernelArgs::Matmul(args.into())
    }
}

impl<T> From<HistogramArgs<T>> for KernelArgs
where
    AnyHistogramArgs: From<HistogramArgs<T>>,
{
    fn from(args: HistogramArgs<T>) -> Self {
        KernelArgs::Histogram(args.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axpy_f64() -> AxpyArgs<f64> {
        let rect = Rect::span(8, 15);
        AxpyArgs {
            rect,
            x: AffineAccessor::dense_at(0, rect),
            y: AffineAccessor::dense_at(64, rect),
            z: AffineAccessor::dense_at(128, rect),
            alpha: 2.0,
        }
    }

    #[test]
    fn block_layout_is_fixed() {
        assert_eq!(size_of::<ArgHeader>(), 16);
        assert_eq!(size_of::<RectDesc>(), 40);
        assert_eq!(size_of::<RawAccessor>(), 32);
        assert_eq!(axpy_f64().encode().to_bytes().len(), ARG_BLOCK_SIZE);
    }

    #[test]
    fn axpy_survives_the_wire() {
        let args = axpy_f64();
        let bytes = KernelArgs::from(args).to_bytes();
        let decoded = KernelArgBlock::from_bytes(&bytes).unwrap().decode().unwrap();
        match decoded {
            KernelArgs::Axpy(AnyAxpyArgs::F64(got)) => {
                assert_eq!(got.rect, args.rect);
                assert_eq!(got.z, args.z);
                assert_eq!(got.alpha, 2.0);
            }
            other => panic!("decoded to {other:?}"),
        }
    }

    #[test]
    fn complex_alpha_is_carried_whole() {
        let rect = Rect::span(0, 3);
        let acc = AffineAccessor::<Complex64, 1>::dense(rect);
        let args = AxpyArgs {
            rect,
            x: acc,
            y: acc,
            z: acc,
            alpha: Complex64::new(0.5, -1.5),
        };
        let block = KernelArgBlock::from_bytes(&args.encode().to_bytes()).unwrap();
        assert_eq!(block.decode().unwrap().dtype(), ElementType::C64);
        assert_eq!(block.scalar.get::<Complex64>(), Complex64::new(0.5, -1.5));
    }

    #[test]
    fn wrong_size_rejected() {
        let err = KernelArgBlock::from_bytes(&[0u8; ARG_BLOCK_SIZE - 8]).unwrap_err();
        assert!(matches!(err, PimError::ArgBlockSize { got: 376, .. }));
    }

    #[test]
    fn bad_magic_and_version_rejected() {
        let mut block = axpy_f64().encode();
        block.header.magic = 0xdead_beef;
        assert!(matches!(
            KernelArgBlock::from_bytes(&block.to_bytes()),
            Err(PimError::ArgBlockMagic(0xdead_beef))
        ));
        let mut block = axpy_f64().encode();
        block.header.version = 9;
        assert!(matches!(
            KernelArgBlock::from_bytes(&block.to_bytes()),
            Err(PimError::ArgBlockVersion { got: 9, .. })
        ));
    }

    #[test]
    fn unknown_selector_rejected() {
        let mut block = axpy_f64().encode();
        block.header.kernel = 42;
        let err = KernelArgBlock::from_bytes(&block.to_bytes())
            .unwrap()
            .decode()
            .unwrap_err();
        assert!(matches!(err, PimError::UnknownKernel(42)));
    }

    #[test]
    fn element_size_mismatch_rejected() {
        let mut block = axpy_f64().encode();
        block.header.dtype = ElementType::F32 as u16;
        assert!(matches!(block.decode(), Err(PimError::ElementMismatch(_))));
    }

    #[test]
    fn matmul_without_complex_variant() {
        let tile = Rect::new(Point::new([0, 0]), Point::new([1, 1]));
        let acc = AffineAccessor::<f64, 2>::dense(tile);
        let mut block = MatmulArgs {
            tile,
            rect_a: tile,
            rect_b: tile,
            a: acc,
            b_t: acc,
            c: acc,
        }
        .encode();
        assert!(block.decode().is_ok());
        block.header.dtype = ElementType::C64 as u16;
        assert!(matches!(block.decode(), Err(PimError::ElementMismatch(_))));
    }

    #[test]
    fn histogram_parameters_checked() {
        let rect = Rect::span(0, 15);
        let partials_rect = Rect::new(Point::new([0, 0]), Point::new([3, 3]));
        let args = HistogramArgs {
            rect,
            input: AffineAccessor::<u32, 1>::dense(rect),
            partials_rect,
            partials: AffineAccessor::dense_at(64, partials_rect),
            output_rect: Rect::span(0, 3),
            output: AffineAccessor::dense_at(128, Rect::span(0, 3)),
            bins: 4,
            depth: 4,
        };
        let block = args.encode();
        assert!(matches!(
            block.decode().unwrap(),
            KernelArgs::Histogram(AnyHistogramArgs::U32(_))
        ));
        let mut bad = block;
        bad.params[0] = 0;
        assert!(bad.decode().unwrap_err().is_configuration());
    }
}
