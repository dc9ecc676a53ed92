//! The taint algebra: operators that stay inside the tainted world.
//!
//! Arithmetic on tainted scalars mirrors what the foreign code itself could
//! compute, so none of it can fail and none of it launders taint:
//!
//! - integer `+ - *` and shifts wrap (two's complement);
//! - integer `/ %` are total: a zero divisor yields 0, and the signed
//!   `MIN / -1` case wraps;
//! - floats follow IEEE 754;
//! - comparisons return `Tainted<bool, B>`, never `bool`. There is no
//!   `PartialEq`/`PartialOrd` on tainted values, so the host cannot branch
//!   on guest data without an explicit verification or escape hatch:
//!
//! ```compile_fail
//! use taintbox::Tainted;
//! use taintbox::runtime::direct::DirectBackend;
//!
//! let a = Tainted::<i32, DirectBackend>::new(1);
//! if a.cmp_lt(10) { } // Tainted<bool, _> is not a branch condition
//! ```
//!
//! Pointer arithmetic is the one fallible corner: it consults the sandbox
//! for membership, and steps in strides of the element's in-sandbox size.

use core::mem::{align_of, size_of};
use core::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Not, Rem, Shl, Shr, Sub};

use taintbox_runtime::SandboxBackend;

use crate::errors::{Result, TaintError};
use crate::repr::{SandboxRepr, TaggedPtr};
use crate::sandbox::Sandbox;
use crate::tainted::Tainted;
use crate::volatile::TaintedVolatile;

// ==================================================================
// Scalar arithmetic
// ==================================================================

/// One binary operator for one scalar type, in the three operand shapes:
/// tainted ⊕ tainted, tainted ⊕ plain, plain ⊕ tainted. The plain-operand
/// forms must be spelled per concrete type; the orphan rules forbid a
/// generic left scalar.
macro_rules! tainted_binop {
    ($t:ty, $trait:ident, $method:ident, |$a:ident, $b:ident| $body:expr) => {
        impl<B: SandboxBackend> $trait for Tainted<$t, B> {
            type Output = Tainted<$t, B>;

            #[inline]
            fn $method(self, rhs: Self) -> Self::Output {
                let $a = self.storage;
                let $b = rhs.storage;
                Tainted::from_storage($body)
            }
        }

        impl<B: SandboxBackend> $trait<$t> for Tainted<$t, B> {
            type Output = Tainted<$t, B>;

            #[inline]
            fn $method(self, rhs: $t) -> Self::Output {
                let $a = self.storage;
                let $b = rhs;
                Tainted::from_storage($body)
            }
        }

        impl<B: SandboxBackend> $trait<Tainted<$t, B>> for $t {
            type Output = Tainted<$t, B>;

            #[inline]
            fn $method(self, rhs: Tainted<$t, B>) -> Self::Output {
                let $a = self;
                let $b = rhs.storage;
                Tainted::from_storage($body)
            }
        }
    };
}

macro_rules! tainted_int_ops {
    ($($t:ty),+ $(,)?) => {$(
        tainted_binop!($t, Add, add, |a, b| a.wrapping_add(b));
        tainted_binop!($t, Sub, sub, |a, b| a.wrapping_sub(b));
        tainted_binop!($t, Mul, mul, |a, b| a.wrapping_mul(b));
        tainted_binop!($t, Div, div, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) });
        tainted_binop!($t, Rem, rem, |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) });
        tainted_binop!($t, BitAnd, bitand, |a, b| a & b);
        tainted_binop!($t, BitOr, bitor, |a, b| a | b);
        tainted_binop!($t, BitXor, bitxor, |a, b| a ^ b);
        tainted_binop!($t, Shl, shl, |a, b| a.wrapping_shl(b as u32));
        tainted_binop!($t, Shr, shr, |a, b| a.wrapping_shr(b as u32));

        impl<B: SandboxBackend> Not for Tainted<$t, B> {
            type Output = Tainted<$t, B>;

            #[inline]
            fn not(self) -> Self::Output {
                Tainted::from_storage(!self.storage)
            }
        }
    )+};
}

macro_rules! tainted_neg {
    ($($t:ty),+ $(,)?) => {$(
        impl<B: SandboxBackend> Neg for Tainted<$t, B> {
            type Output = Tainted<$t, B>;

            #[inline]
            fn neg(self) -> Self::Output {
                Tainted::from_storage(self.storage.wrapping_neg())
            }
        }
    )+};
}

macro_rules! tainted_float_ops {
    ($($t:ty),+ $(,)?) => {$(
        tainted_binop!($t, Add, add, |a, b| a + b);
        tainted_binop!($t, Sub, sub, |a, b| a - b);
        tainted_binop!($t, Mul, mul, |a, b| a * b);
        tainted_binop!($t, Div, div, |a, b| a / b);
        tainted_binop!($t, Rem, rem, |a, b| a % b);

        impl<B: SandboxBackend> Neg for Tainted<$t, B> {
            type Output = Tainted<$t, B>;

            #[inline]
            fn neg(self) -> Self::Output {
                Tainted::from_storage(-self.storage)
            }
        }
    )+};
}

tainted_int_ops!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
tainted_neg!(i8, i16, i32, i64, isize);
tainted_float_ops!(f32, f64);

impl<B: SandboxBackend> Not for Tainted<bool, B> {
    type Output = Tainted<bool, B>;

    #[inline]
    fn not(self) -> Self::Output {
        Tainted::from_storage(!self.storage)
    }
}

// ==================================================================
// Comparisons
// ==================================================================

/// Right-hand side of a tainted comparison: plain or tainted, same scalar
/// type, same backend.
pub trait TaintedOperand<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    fn into_value(self) -> T;
}

impl<T, B> TaintedOperand<T, B> for T
where
    T: SandboxRepr<B, Storage = T>,
    B: SandboxBackend,
{
    #[inline]
    fn into_value(self) -> T {
        self
    }
}

impl<T, B> TaintedOperand<T, B> for Tainted<T, B>
where
    T: SandboxRepr<B, Storage = T>,
    B: SandboxBackend,
{
    #[inline]
    fn into_value(self) -> T {
        self.storage
    }
}

impl<T, B> Tainted<T, B>
where
    T: SandboxRepr<B, Storage = T> + PartialOrd,
    B: SandboxBackend,
{
    /// `self == rhs`, still tainted.
    pub fn cmp_eq(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage == rhs.into_value())
    }

    /// `self != rhs`, still tainted.
    pub fn cmp_ne(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage != rhs.into_value())
    }

    /// `self < rhs`, still tainted.
    pub fn cmp_lt(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage < rhs.into_value())
    }

    /// `self <= rhs`, still tainted.
    pub fn cmp_le(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage <= rhs.into_value())
    }

    /// `self > rhs`, still tainted.
    pub fn cmp_gt(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage > rhs.into_value())
    }

    /// `self >= rhs`, still tainted.
    pub fn cmp_ge(self, rhs: impl TaintedOperand<T, B>) -> Tainted<bool, B> {
        Tainted::from_storage(self.storage >= rhs.into_value())
    }
}

// ==================================================================
// Pointer arithmetic
// ==================================================================

/// Element count for pointer arithmetic: plain or tainted.
pub trait PointerCount<B: SandboxBackend> {
    fn into_count(self) -> usize;
}

impl<B: SandboxBackend> PointerCount<B> for usize {
    #[inline]
    fn into_count(self) -> usize {
        self
    }
}

impl<B: SandboxBackend> PointerCount<B> for Tainted<usize, B> {
    #[inline]
    fn into_count(self) -> usize {
        self.storage
    }
}

impl<T, B> Tainted<*mut T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// Step `count` elements forward.
    ///
    /// The stride is the element's in-sandbox size. Fails with `Null` on the
    /// null pointer, `Overflow` if the offset computation wraps, `Bounds` if
    /// the resulting address leaves `sandbox`'s arena, and `CrossSandbox`
    /// for a pointer belonging to another instance.
    pub fn add(&self, count: impl PointerCount<B>, sandbox: &Sandbox<B>) -> Result<Self> {
        self.offset(count.into_count(), true, sandbox)
    }

    /// Step `count` elements backward. Same failure modes as [`Self::add`].
    pub fn sub(&self, count: impl PointerCount<B>, sandbox: &Sandbox<B>) -> Result<Self> {
        self.offset(count.into_count(), false, sandbox)
    }

    fn offset(&self, count: usize, forward: bool, sandbox: &Sandbox<B>) -> Result<Self> {
        sandbox.check_usable()?;
        if self.storage.is_null() {
            return Err(TaintError::Null);
        }
        sandbox.check_origin(self.storage.origin())?;
        let bytes = count
            .checked_mul(size_of::<T::Repr>())
            .ok_or(TaintError::Overflow)?;
        let base = sandbox.translate_in(self.storage.repr()) as usize;
        let target = if forward {
            base.checked_add(bytes)
        } else {
            base.checked_sub(bytes)
        }
        .ok_or(TaintError::Overflow)?;
        sandbox.check_range(target as *const u8, 1, "pointer arithmetic")?;
        let repr = sandbox.translate_out(target as *mut u8);
        Ok(Tainted::from_storage(TaggedPtr::new(
            repr,
            self.storage.origin(),
        )))
    }

    /// Dereference into a checked lvalue view.
    ///
    /// This is where the sandbox earns its keep: the pointer must be
    /// non-null, belong to `sandbox`, land every byte of the object inside
    /// the arena, and be aligned for the element type. The returned view
    /// re-checks membership on each access, so a view kept across a
    /// `free_in_sandbox` fails instead of reading dead memory.
    pub fn deref<'s>(&self, sandbox: &'s Sandbox<B>) -> Result<TaintedVolatile<'s, T, B>> {
        sandbox.check_usable()?;
        if self.storage.is_null() {
            return Err(TaintError::Null);
        }
        sandbox.check_origin(self.storage.origin())?;
        let host = sandbox.translate_in(self.storage.repr());
        sandbox.check_range(host, size_of::<T::Repr>().max(1), "dereference")?;
        if host as usize % align_of::<T::Repr>() != 0 {
            return Err(TaintError::Bounds {
                addr: host as usize,
                context: "pointer is misaligned for the element type",
            });
        }
        Ok(TaintedVolatile::new(
            host.cast::<T::Repr>(),
            self.storage.origin(),
            sandbox,
        ))
    }

    /// `*(self + i)`: step and dereference in one checked operation.
    pub fn index<'s>(&self, i: usize, sandbox: &'s Sandbox<B>) -> Result<TaintedVolatile<'s, T, B>> {
        self.add(i, sandbox)?.deref(sandbox)
    }
}

// ==================================================================
// Host-held arrays
// ==================================================================

impl<T, B, const N: usize> Tainted<[T; N], B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// One element of a tainted array already copied host-side.
    pub fn index(&self, i: usize) -> Result<Tainted<T, B>> {
        if i >= N {
            return Err(TaintError::Index { index: i, len: N });
        }
        Ok(Tainted::from_storage(self.storage[i]))
    }
}
