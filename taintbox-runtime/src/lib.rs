//! Backend contract for taintbox sandboxes, plus the reference backends.
//!
//! A backend owns one region of memory (the arena) that untrusted code is
//! confined to, and knows how to translate pointers between the host's view
//! and the sandbox's view. Everything the host-facing facade does eventually
//! bottoms out in one of the operations defined here.
//!
//! Two reference backends live in this crate:
//! - [`offset::OffsetBackend`]: narrow 32-bit pointers into a base-aligned
//!   arena, base-plus-offset translation (the wasm-style layout).
//! - [`direct::DirectBackend`]: host-width pointers, pass-through
//!   translation (the in-process layout).

pub mod direct;
pub mod offset;

use std::fmt;

use thiserror::Error;

// ==================================================================
// Errors and configuration
// ==================================================================

/// Failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The arena cannot serve the requested allocation.
    #[error("sandbox arena out of memory")]
    OutOfMemory,
    /// The sandboxed computation trapped or otherwise failed.
    #[error("sandboxed computation faulted: {reason}")]
    Fault { reason: String },
    /// A value crossing the call ABI did not have the shape the other side
    /// expected.
    #[error("guest ABI mismatch: expected {expected}")]
    BadAbi { expected: &'static str },
}

/// Options applied when a sandbox instance is created.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Number of host callback slots the instance exposes to the guest.
    pub max_callbacks: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { max_callbacks: 8 }
    }
}

// ==================================================================
// Width types
// ==================================================================

/// A fixed-width integer as the sandbox sees it.
///
/// Backends pick the width of each C integer class through these; hosts
/// always traffic in the widest host-side carrier and convert at the
/// boundary.
pub trait SandboxInt: Copy + fmt::Debug + PartialEq + Send + 'static {
    /// Narrow a host `i64` to this width (two's-complement truncation).
    fn from_host_i64(v: i64) -> Self;

    /// Widen back to a host `i64`, sign-extending.
    fn to_host_i64(self) -> i64;

    /// Place this width in its ABI slot.
    fn to_abi<P>(self) -> AbiValue<P>;

    /// Take this width out of its ABI slot.
    fn from_abi<P>(value: AbiValue<P>) -> Option<Self>;
}

impl SandboxInt for i32 {
    #[inline]
    fn from_host_i64(v: i64) -> Self {
        v as i32
    }

    #[inline]
    fn to_host_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn to_abi<P>(self) -> AbiValue<P> {
        AbiValue::I32(self)
    }

    #[inline]
    fn from_abi<P>(value: AbiValue<P>) -> Option<Self> {
        match value {
            AbiValue::I32(v) => Some(v),
            _ => None,
        }
    }
}

impl SandboxInt for i64 {
    #[inline]
    fn from_host_i64(v: i64) -> Self {
        v
    }

    #[inline]
    fn to_host_i64(self) -> i64 {
        self
    }

    #[inline]
    fn to_abi<P>(self) -> AbiValue<P> {
        AbiValue::I64(self)
    }

    #[inline]
    fn from_abi<P>(value: AbiValue<P>) -> Option<Self> {
        match value {
            AbiValue::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// An in-sandbox pointer representation.
///
/// This is the value that travels through sandbox memory and the call ABI,
/// not a host pointer. It may be narrower than the host's pointers.
pub trait SandboxPtr: Copy + fmt::Debug + PartialEq + Eq + Send + 'static {
    /// The representation of the null pointer.
    const NULL: Self;

    fn is_null(self) -> bool;

    /// The numeric value of the representation (an offset or an address).
    fn to_usize(self) -> usize;

    /// Rebuild a representation from its numeric value, truncating.
    fn from_usize(v: usize) -> Self;
}

impl SandboxPtr for u32 {
    const NULL: Self = 0;

    #[inline]
    fn is_null(self) -> bool {
        self == 0
    }

    #[inline]
    fn to_usize(self) -> usize {
        self as usize
    }

    #[inline]
    fn from_usize(v: usize) -> Self {
        v as u32
    }
}

impl SandboxPtr for usize {
    const NULL: Self = 0;

    #[inline]
    fn is_null(self) -> bool {
        self == 0
    }

    #[inline]
    fn to_usize(self) -> usize {
        self
    }

    #[inline]
    fn from_usize(v: usize) -> Self {
        v
    }
}

// ==================================================================
// Call ABI
// ==================================================================

/// A single value crossing the sandbox call ABI, in either direction.
///
/// `P` is the backend's pointer representation. Narrow integers widen into
/// the `I32` slot; `usize`-shaped values ride in the `Ptr` slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiValue<P> {
    Void,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(P),
}

/// Resolves guest pointers to host memory for the duration of one
/// invocation.
pub trait GuestMemory<P> {
    /// Translate `p` and check that `len` bytes starting there are inside
    /// guest-accessible memory.
    fn resolve(&self, p: P, len: usize) -> Result<*mut u8, BackendError>;
}

/// Host-side dispatcher the guest reaches registered callbacks through.
pub trait HostDispatch<P> {
    /// Invoke host callback slot `slot` with the given arguments.
    fn dispatch(&mut self, slot: u32, args: &[AbiValue<P>]) -> Result<AbiValue<P>, BackendError>;
}

/// Execution context handed to a guest function by the reference backends.
///
/// The guest's entire world: its arguments, its arena, and the dispatcher
/// for calling back into the host.
pub struct GuestContext<'a, P> {
    args: &'a [AbiValue<P>],
    memory: &'a dyn GuestMemory<P>,
    host: &'a mut dyn HostDispatch<P>,
}

impl<'a, P: SandboxPtr> GuestContext<'a, P> {
    pub fn new(
        args: &'a [AbiValue<P>],
        memory: &'a dyn GuestMemory<P>,
        host: &'a mut dyn HostDispatch<P>,
    ) -> Self {
        Self { args, memory, host }
    }

    /// All arguments, in call order.
    pub fn args(&self) -> &[AbiValue<P>] {
        self.args
    }

    /// The argument at `idx`.
    pub fn arg(&self, idx: usize) -> Result<AbiValue<P>, BackendError> {
        self.args.get(idx).copied().ok_or(BackendError::BadAbi {
            expected: "missing guest argument",
        })
    }

    /// Copy `buf.len()` bytes out of guest memory at `p`.
    pub fn read_bytes(&self, p: P, buf: &mut [u8]) -> Result<(), BackendError> {
        let src = self.memory.resolve(p, buf.len())?;
        // SAFETY: resolve checked the whole range is inside the arena.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `bytes` into guest memory at `p`.
    pub fn write_bytes(&mut self, p: P, bytes: &[u8]) -> Result<(), BackendError> {
        let dst = self.memory.resolve(p, bytes.len())?;
        // SAFETY: resolve checked the whole range is inside the arena.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        Ok(())
    }

    pub fn read_u8(&self, p: P) -> Result<u8, BackendError> {
        let mut buf = [0u8; 1];
        self.read_bytes(p, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&mut self, p: P, v: u8) -> Result<(), BackendError> {
        self.write_bytes(p, &[v])
    }

    pub fn read_i32(&self, p: P) -> Result<i32, BackendError> {
        let mut buf = [0u8; 4];
        self.read_bytes(p, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn write_i32(&mut self, p: P, v: i32) -> Result<(), BackendError> {
        self.write_bytes(p, &v.to_ne_bytes())
    }

    pub fn read_i64(&self, p: P) -> Result<i64, BackendError> {
        let mut buf = [0u8; 8];
        self.read_bytes(p, &mut buf)?;
        Ok(i64::from_ne_bytes(buf))
    }

    pub fn write_i64(&mut self, p: P, v: i64) -> Result<(), BackendError> {
        self.write_bytes(p, &v.to_ne_bytes())
    }

    /// Call back into the host through callback slot `slot`.
    pub fn call_host(
        &mut self,
        slot: u32,
        args: &[AbiValue<P>],
    ) -> Result<AbiValue<P>, BackendError> {
        self.host.dispatch(slot, args)
    }
}

/// A guest entry point as the reference backends execute it.
///
/// Real foreign code would sit behind a compiled-module ABI. The reference
/// backends run plain functions instead, confined to the same contract: they
/// can only touch arena memory through the context, and only reach the host
/// through the dispatcher.
pub type GuestFn<P> = fn(&mut GuestContext<'_, P>) -> Result<AbiValue<P>, BackendError>;

// ==================================================================
// Backend contract
// ==================================================================

/// Contract a sandbox plug-in satisfies.
///
/// One implementor models one isolation mechanism; one value of the
/// implementor owns one arena. The facade in the `taintbox` crate drives all
/// of this; host code normally never touches a backend directly.
pub trait SandboxBackend: Sized {
    /// Width of C `int` inside the sandbox.
    type IntType: SandboxInt;
    /// Width of C `long` inside the sandbox.
    type LongType: SandboxInt;
    /// Width of C `long long` inside the sandbox.
    type LongLongType: SandboxInt;
    /// The in-sandbox pointer representation.
    type PointerType: SandboxPtr;
    /// Identifies a callable guest function.
    type FuncRef: Copy;

    /// Establish the arena.
    fn create(config: &SandboxConfig) -> Result<Self, BackendError>;

    /// Tear the arena down.
    ///
    /// Idempotent; the facade runs it from `Drop` so release is guaranteed
    /// even on early exit.
    fn destroy(&mut self);

    /// Allocate `bytes` inside the arena.
    ///
    /// Returns the null representation when the arena is exhausted, the C
    /// `malloc` convention.
    fn malloc_in_sandbox(&mut self, bytes: usize) -> Self::PointerType;

    /// Release an allocation made by [`Self::malloc_in_sandbox`].
    ///
    /// # Panics
    ///
    /// Panics on double-free and on pointers this allocator never produced.
    fn free_in_sandbox(&mut self, p: Self::PointerType);

    /// Translate an in-sandbox pointer to a host pointer.
    ///
    /// Pure address arithmetic; callers check membership separately.
    fn unsandbox_ptr(&self, p: Self::PointerType) -> *mut u8;

    /// Translate a host pointer into the in-sandbox representation.
    ///
    /// Pure address arithmetic; callers check membership separately.
    fn sandbox_ptr(&self, host: *mut u8) -> Self::PointerType;

    /// Instance-free form of [`Self::unsandbox_ptr`]: recover the arena from
    /// `example`, a host pointer known to lie inside it.
    fn unsandbox_ptr_with_example(p: Self::PointerType, example: *mut u8) -> *mut u8;

    /// Instance-free form of [`Self::sandbox_ptr`].
    fn sandbox_ptr_with_example(host: *mut u8, example: *mut u8) -> Self::PointerType;

    /// Whether two host pointers fall inside the same arena of this backend
    /// type.
    fn is_in_same_sandbox(p: *const u8, q: *const u8) -> bool;

    /// Whether `p` points into this instance's arena.
    fn is_pointer_in_sandbox_memory(&self, p: *const u8) -> bool;

    /// Whether all `len` bytes starting at `p` lie inside this instance's
    /// arena, with nothing foreign in between.
    ///
    /// A backend whose memory is a set of disjoint blocks must contain the
    /// whole range in one block; endpoint membership alone would admit
    /// ranges that bridge two blocks.
    fn is_range_in_sandbox_memory(&self, p: *const u8, len: usize) -> bool;

    /// Run a guest function to completion.
    ///
    /// `host` receives any callback the guest makes. An `Err` means the
    /// computation trapped; the facade treats the instance as poisoned from
    /// then on.
    fn invoke(
        &mut self,
        func: Self::FuncRef,
        args: &[AbiValue<Self::PointerType>],
        host: &mut dyn HostDispatch<Self::PointerType>,
    ) -> Result<AbiValue<Self::PointerType>, BackendError>;
}
