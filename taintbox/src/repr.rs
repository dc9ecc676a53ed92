//! The representation map: how host types look inside a sandbox.
//!
//! Every type that can live in tainted form implements [`SandboxRepr`],
//! which fixes two associated types per backend:
//!
//! - `Repr`: the bytes as they exist inside the arena (width-normalized
//!   scalars, narrow pointer representations, element-wise aggregates);
//! - `Storage`: what a host-held `Tainted` carries (the host form, plus a
//!   sandbox-identity tag for anything pointer-shaped).
//!
//! Two refinements narrow the map: [`HostCopy`] for types whose storage can
//! be copied back into a plain host value, and [`AbiPassable`] for the
//! closed set of types that may cross the call ABI by value.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use taintbox_runtime::{AbiValue, SandboxBackend, SandboxInt, SandboxPtr};

use crate::errors::{Result, TaintError};

// ==================================================================
// Sandbox identity
// ==================================================================

/// Process-unique identity of one sandbox instance.
///
/// Two instances of the same backend type give their values the same Rust
/// types, so mixing them cannot be a type error; this tag is what catches it
/// at runtime instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(u64);

impl SandboxId {
    /// Tag of host-constructed values and null pointers: compatible with
    /// every instance.
    pub const NONE: Self = SandboxId(0);

    /// Tag of aggregates whose parts disagree: compatible with no instance.
    pub const MIXED: Self = SandboxId(u64::MAX);

    /// Mint a fresh identity. Never reused for the life of the process.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SandboxId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Combine the origins of two values feeding one result.
    pub fn join(self, other: Self) -> Self {
        if self == other || other == Self::NONE {
            self
        } else if self == Self::NONE {
            other
        } else {
            Self::MIXED
        }
    }

    /// The numeric form, for log fields.
    pub fn raw(self) -> u64 {
        self.0
    }
}

// ==================================================================
// Pointer-shaped storage
// ==================================================================

/// Storage of a tainted pointer: the in-sandbox representation plus the
/// identity of the instance whose arena it came from.
pub struct TaggedPtr<B: SandboxBackend> {
    repr: B::PointerType,
    origin: SandboxId,
}

impl<B: SandboxBackend> TaggedPtr<B> {
    pub(crate) fn new(repr: B::PointerType, origin: SandboxId) -> Self {
        Self { repr, origin }
    }

    pub(crate) fn null() -> Self {
        Self {
            repr: <B::PointerType as SandboxPtr>::NULL,
            origin: SandboxId::NONE,
        }
    }

    #[inline]
    pub(crate) fn repr(&self) -> B::PointerType {
        self.repr
    }

    #[inline]
    pub(crate) fn origin(&self) -> SandboxId {
        self.origin
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        self.repr.is_null()
    }
}

impl<B: SandboxBackend> Clone for TaggedPtr<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: SandboxBackend> Copy for TaggedPtr<B> {}

impl<B: SandboxBackend> PartialEq for TaggedPtr<B> {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr && self.origin == other.origin
    }
}

impl<B: SandboxBackend> Eq for TaggedPtr<B> {}

impl<B: SandboxBackend> fmt::Debug for TaggedPtr<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPtr")
            .field("repr", &self.repr)
            .field("origin", &self.origin)
            .finish()
    }
}

// ==================================================================
// The representation map
// ==================================================================

/// Maps a host type onto its form inside sandboxes of backend `B`.
///
/// Implemented for the fixed-width scalars, `bool`, the C width newtypes,
/// `usize`/`isize`, `*mut T`, `[T; N]`, `()`, and records declared through
/// [`tainted_record!`](crate::tainted_record). Host-only types (references,
/// `String`, `Vec`, ...) deliberately have no implementation:
///
/// ```compile_fail
/// use taintbox::Tainted;
/// use taintbox::runtime::direct::DirectBackend;
///
/// // String has no in-sandbox representation.
/// let t = Tainted::<String, DirectBackend>::new(String::new());
/// ```
pub trait SandboxRepr<B: SandboxBackend>: Sized {
    /// The in-sandbox form.
    type Repr: Copy;

    /// What a host-held `Tainted` carries.
    type Storage: Copy;

    /// Lower host-held storage to the in-sandbox form.
    fn to_repr(storage: Self::Storage) -> Self::Repr;

    /// Raise an in-sandbox value that was read out of `origin`'s arena.
    fn from_repr(repr: Self::Repr, origin: SandboxId) -> Self::Storage;

    /// The instance the storage's pointers belong to; `NONE` for anything
    /// without pointers.
    fn origin(storage: &Self::Storage) -> SandboxId;
}

/// Types whose tainted storage can be copied back into a plain host value:
/// scalars and pointer-free aggregates. Pointers are excluded; they only
/// leave the tainted world through the explicit pointer escape hatches.
pub trait HostCopy<B: SandboxBackend>: SandboxRepr<B> {
    /// Copy the storage out into a fresh host value.
    fn to_host(storage: Self::Storage) -> Self;

    /// Copy a host value into tainted storage.
    fn from_host(value: Self) -> Self::Storage;
}

mod sealed {
    pub trait Sealed {}
}

/// The closed set of types that may cross the sandbox call ABI by value:
/// scalars, the C width newtypes, `usize`/`isize`, pointers, and `()`.
/// Aggregates must travel through sandbox memory instead.
pub trait AbiPassable<B: SandboxBackend>: SandboxRepr<B> + sealed::Sealed {
    /// Lower storage into its ABI slot.
    fn to_abi(storage: Self::Storage) -> AbiValue<B::PointerType>;

    /// Raise an ABI value handed back by the guest.
    fn from_abi(value: AbiValue<B::PointerType>, origin: SandboxId) -> Result<Self::Storage>;
}

fn abi_mismatch<T>(expected: &'static str) -> Result<T> {
    Err(TaintError::SandboxFault {
        reason: format!("guest produced a mismatched ABI value, expected {expected}"),
    })
}

// ==================================================================
// Scalars
// ==================================================================

macro_rules! identity_repr {
    ($($t:ty),+ $(,)?) => {$(
        impl<B: SandboxBackend> SandboxRepr<B> for $t {
            type Repr = $t;
            type Storage = $t;

            #[inline]
            fn to_repr(storage: $t) -> $t {
                storage
            }

            #[inline]
            fn from_repr(repr: $t, _origin: SandboxId) -> $t {
                repr
            }

            #[inline]
            fn origin(_storage: &$t) -> SandboxId {
                SandboxId::NONE
            }
        }

        impl<B: SandboxBackend> HostCopy<B> for $t {
            #[inline]
            fn to_host(storage: $t) -> $t {
                storage
            }

            #[inline]
            fn from_host(value: $t) -> $t {
                value
            }
        }

        impl sealed::Sealed for $t {}
    )+};
}

identity_repr!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

// `bool` does not get the identity treatment: the guest can leave any byte
// under a flag, and a typed read of 2 as Rust `bool` is undefined. The
// arena form is a byte, raised with `!= 0` like the ABI path below.
impl<B: SandboxBackend> SandboxRepr<B> for bool {
    type Repr = u8;
    type Storage = bool;

    #[inline]
    fn to_repr(storage: bool) -> u8 {
        storage as u8
    }

    #[inline]
    fn from_repr(repr: u8, _origin: SandboxId) -> bool {
        repr != 0
    }

    #[inline]
    fn origin(_storage: &bool) -> SandboxId {
        SandboxId::NONE
    }
}

impl<B: SandboxBackend> HostCopy<B> for bool {
    #[inline]
    fn to_host(storage: bool) -> bool {
        storage
    }

    #[inline]
    fn from_host(value: bool) -> bool {
        value
    }
}

impl sealed::Sealed for bool {}

macro_rules! abi_scalar {
    ($($t:ty => $slot:ident as $carrier:ty),+ $(,)?) => {$(
        impl<B: SandboxBackend> AbiPassable<B> for $t {
            #[inline]
            fn to_abi(storage: $t) -> AbiValue<B::PointerType> {
                AbiValue::$slot(storage as $carrier)
            }

            #[inline]
            fn from_abi(value: AbiValue<B::PointerType>, _origin: SandboxId) -> Result<$t> {
                match value {
                    AbiValue::$slot(v) => Ok(v as $t),
                    _ => abi_mismatch(stringify!($t)),
                }
            }
        }
    )+};
}

abi_scalar! {
    i8 => I32 as i32,
    i16 => I32 as i32,
    i32 => I32 as i32,
    u8 => I32 as i32,
    u16 => I32 as i32,
    u32 => I32 as i32,
    i64 => I64 as i64,
    u64 => I64 as i64,
    f32 => F32 as f32,
    f64 => F64 as f64,
}

impl<B: SandboxBackend> AbiPassable<B> for bool {
    #[inline]
    fn to_abi(storage: bool) -> AbiValue<B::PointerType> {
        AbiValue::I32(storage as i32)
    }

    #[inline]
    fn from_abi(value: AbiValue<B::PointerType>, _origin: SandboxId) -> Result<bool> {
        match value {
            AbiValue::I32(v) => Ok(v != 0),
            _ => abi_mismatch("bool"),
        }
    }
}

// ==================================================================
// Pointer-width integers
// ==================================================================

macro_rules! pointer_width_repr {
    ($($t:ty),+ $(,)?) => {$(
        impl<B: SandboxBackend> SandboxRepr<B> for $t {
            type Repr = B::PointerType;
            type Storage = $t;

            #[inline]
            fn to_repr(storage: $t) -> B::PointerType {
                <B::PointerType as SandboxPtr>::from_usize(storage as usize)
            }

            #[inline]
            fn from_repr(repr: B::PointerType, _origin: SandboxId) -> $t {
                repr.to_usize() as $t
            }

            #[inline]
            fn origin(_storage: &$t) -> SandboxId {
                SandboxId::NONE
            }
        }

        impl<B: SandboxBackend> HostCopy<B> for $t {
            #[inline]
            fn to_host(storage: $t) -> $t {
                storage
            }

            #[inline]
            fn from_host(value: $t) -> $t {
                value
            }
        }

        impl sealed::Sealed for $t {}

        impl<B: SandboxBackend> AbiPassable<B> for $t {
            #[inline]
            fn to_abi(storage: $t) -> AbiValue<B::PointerType> {
                AbiValue::Ptr(<B::PointerType as SandboxPtr>::from_usize(storage as usize))
            }

            #[inline]
            fn from_abi(value: AbiValue<B::PointerType>, _origin: SandboxId) -> Result<$t> {
                match value {
                    AbiValue::Ptr(p) => Ok(p.to_usize() as $t),
                    _ => abi_mismatch(stringify!($t)),
                }
            }
        }
    )+};
}

pointer_width_repr!(usize, isize);

// ==================================================================
// C width newtypes
// ==================================================================

macro_rules! c_width_repr {
    ($($(#[$meta:meta])* $name:ident : $width:ident as $carrier:ty),+ $(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $carrier);

        impl<B: SandboxBackend> SandboxRepr<B> for $name {
            type Repr = B::$width;
            type Storage = $name;

            #[inline]
            fn to_repr(storage: $name) -> B::$width {
                <B::$width as SandboxInt>::from_host_i64(storage.0 as i64)
            }

            #[inline]
            fn from_repr(repr: B::$width, _origin: SandboxId) -> $name {
                $name(repr.to_host_i64() as $carrier)
            }

            #[inline]
            fn origin(_storage: &$name) -> SandboxId {
                SandboxId::NONE
            }
        }

        impl<B: SandboxBackend> HostCopy<B> for $name {
            #[inline]
            fn to_host(storage: $name) -> $name {
                storage
            }

            #[inline]
            fn from_host(value: $name) -> $name {
                value
            }
        }

        impl sealed::Sealed for $name {}

        impl<B: SandboxBackend> AbiPassable<B> for $name {
            #[inline]
            fn to_abi(storage: $name) -> AbiValue<B::PointerType> {
                <B::$width as SandboxInt>::from_host_i64(storage.0 as i64).to_abi()
            }

            #[inline]
            fn from_abi(value: AbiValue<B::PointerType>, _origin: SandboxId) -> Result<$name> {
                match <B::$width as SandboxInt>::from_abi(value) {
                    Some(v) => Ok($name(v.to_host_i64() as $carrier)),
                    None => abi_mismatch(stringify!($name)),
                }
            }
        }
    )+};
}

c_width_repr! {
    /// The guest ABI's `int`. Held host-side as `i32`; its in-sandbox width
    /// is whatever the backend declares.
    CInt: IntType as i32,
    /// The guest ABI's `long`. Held host-side as `i64`; narrowed to the
    /// backend's width at the boundary.
    CLong: LongType as i64,
    /// The guest ABI's `long long`. Held host-side as `i64`.
    CLongLong: LongLongType as i64,
}

// ==================================================================
// Pointers
// ==================================================================

impl<B, T> SandboxRepr<B> for *mut T
where
    B: SandboxBackend,
    T: SandboxRepr<B>,
{
    type Repr = B::PointerType;
    type Storage = TaggedPtr<B>;

    #[inline]
    fn to_repr(storage: TaggedPtr<B>) -> B::PointerType {
        storage.repr()
    }

    #[inline]
    fn from_repr(repr: B::PointerType, origin: SandboxId) -> TaggedPtr<B> {
        // Null carries no origin so it stays usable with any instance.
        if repr.is_null() {
            TaggedPtr::null()
        } else {
            TaggedPtr::new(repr, origin)
        }
    }

    #[inline]
    fn origin(storage: &TaggedPtr<B>) -> SandboxId {
        storage.origin()
    }
}

impl<T> sealed::Sealed for *mut T {}

impl<B, T> AbiPassable<B> for *mut T
where
    B: SandboxBackend,
    T: SandboxRepr<B>,
{
    #[inline]
    fn to_abi(storage: TaggedPtr<B>) -> AbiValue<B::PointerType> {
        AbiValue::Ptr(storage.repr())
    }

    #[inline]
    fn from_abi(value: AbiValue<B::PointerType>, origin: SandboxId) -> Result<TaggedPtr<B>> {
        match value {
            AbiValue::Ptr(p) => Ok(<*mut T as SandboxRepr<B>>::from_repr(p, origin)),
            _ => abi_mismatch("pointer"),
        }
    }
}

// ==================================================================
// Arrays and unit
// ==================================================================

impl<B, T, const N: usize> SandboxRepr<B> for [T; N]
where
    B: SandboxBackend,
    T: SandboxRepr<B>,
{
    type Repr = [T::Repr; N];
    type Storage = [T::Storage; N];

    #[inline]
    fn to_repr(storage: Self::Storage) -> Self::Repr {
        storage.map(T::to_repr)
    }

    #[inline]
    fn from_repr(repr: Self::Repr, origin: SandboxId) -> Self::Storage {
        repr.map(|r| T::from_repr(r, origin))
    }

    fn origin(storage: &Self::Storage) -> SandboxId {
        storage
            .iter()
            .fold(SandboxId::NONE, |acc, s| acc.join(T::origin(s)))
    }
}

impl<B, T, const N: usize> HostCopy<B> for [T; N]
where
    B: SandboxBackend,
    T: HostCopy<B>,
{
    #[inline]
    fn to_host(storage: Self::Storage) -> [T; N] {
        storage.map(T::to_host)
    }

    #[inline]
    fn from_host(value: [T; N]) -> Self::Storage {
        value.map(T::from_host)
    }
}

impl<B: SandboxBackend> SandboxRepr<B> for () {
    type Repr = ();
    type Storage = ();

    #[inline]
    fn to_repr(_storage: ()) {}

    #[inline]
    fn from_repr(_repr: (), _origin: SandboxId) {}

    #[inline]
    fn origin(_storage: &()) -> SandboxId {
        SandboxId::NONE
    }
}

impl<B: SandboxBackend> HostCopy<B> for () {
    #[inline]
    fn to_host(_storage: ()) {}

    #[inline]
    fn from_host(_value: ()) {}
}

impl sealed::Sealed for () {}

impl<B: SandboxBackend> AbiPassable<B> for () {
    #[inline]
    fn to_abi(_storage: ()) -> AbiValue<B::PointerType> {
        AbiValue::Void
    }

    #[inline]
    fn from_abi(value: AbiValue<B::PointerType>, _origin: SandboxId) -> Result<()> {
        match value {
            AbiValue::Void => Ok(()),
            _ => abi_mismatch("void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;
    use taintbox_runtime::direct::DirectBackend;
    use taintbox_runtime::offset::OffsetBackend;

    type Off = OffsetBackend<256>;

    #[test]
    fn widths_follow_the_backend() {
        // ILP32 guest: int and long are 4 bytes, pointers are 4 bytes.
        assert_eq!(size_of::<<CInt as SandboxRepr<Off>>::Repr>(), 4);
        assert_eq!(size_of::<<CLong as SandboxRepr<Off>>::Repr>(), 4);
        assert_eq!(size_of::<<CLongLong as SandboxRepr<Off>>::Repr>(), 8);
        assert_eq!(size_of::<<usize as SandboxRepr<Off>>::Repr>(), 4);
        assert_eq!(size_of::<<*mut i32 as SandboxRepr<Off>>::Repr>(), 4);
        // LP64 guest: long widens to 8 bytes, pointers are host width.
        assert_eq!(size_of::<<CLong as SandboxRepr<DirectBackend>>::Repr>(), 8);
        assert_eq!(
            size_of::<<*mut i32 as SandboxRepr<DirectBackend>>::Repr>(),
            size_of::<usize>()
        );
    }

    #[test]
    fn c_long_narrows_per_backend() {
        let wide = CLong(0x1_2345_6789);
        assert_eq!(<CLong as SandboxRepr<Off>>::to_repr(wide), 0x2345_6789);
        assert_eq!(
            <CLong as SandboxRepr<DirectBackend>>::to_repr(wide),
            0x1_2345_6789
        );
        // Raising sign-extends from the narrowed form.
        let neg = <CLong as SandboxRepr<Off>>::from_repr(-5, SandboxId::NONE);
        assert_eq!(neg, CLong(-5));
    }

    #[test]
    fn bool_stores_as_a_byte_and_raises_any_nonzero() {
        assert_eq!(<bool as SandboxRepr<Off>>::to_repr(true), 1);
        assert_eq!(<bool as SandboxRepr<Off>>::to_repr(false), 0);
        assert!(!<bool as SandboxRepr<Off>>::from_repr(0, SandboxId::NONE));
        assert!(<bool as SandboxRepr<Off>>::from_repr(1, SandboxId::NONE));
        // Arena bytes are guest-controlled; anything nonzero is just true.
        assert!(<bool as SandboxRepr<Off>>::from_repr(2, SandboxId::NONE));
        assert_eq!(size_of::<<bool as SandboxRepr<Off>>::Repr>(), 1);
    }

    #[test]
    fn join_tracks_mixing() {
        let a = SandboxId::next();
        let b = SandboxId::next();
        assert_eq!(SandboxId::NONE.join(a), a);
        assert_eq!(a.join(SandboxId::NONE), a);
        assert_eq!(a.join(a), a);
        assert_eq!(a.join(b), SandboxId::MIXED);
        assert_eq!(SandboxId::MIXED.join(a), SandboxId::MIXED);
    }

    #[test]
    fn array_storage_is_element_wise() {
        let storage = <[u16; 3] as HostCopy<Off>>::from_host([1, 2, 3]);
        assert_eq!(<[u16; 3] as HostCopy<Off>>::to_host(storage), [1, 2, 3]);
        assert_eq!(<[u16; 3] as SandboxRepr<Off>>::origin(&storage), SandboxId::NONE);
    }

    #[test]
    fn null_pointer_repr_raises_without_origin() {
        let id = SandboxId::next();
        let tagged = <*mut i32 as SandboxRepr<Off>>::from_repr(0, id);
        assert!(tagged.is_null());
        assert_eq!(tagged.origin(), SandboxId::NONE);
        let tagged = <*mut i32 as SandboxRepr<Off>>::from_repr(0x20, id);
        assert_eq!(tagged.origin(), id);
    }
}
