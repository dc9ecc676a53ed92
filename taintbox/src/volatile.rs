//! Lvalue views into sandbox memory.
//!
//! A [`TaintedVolatile`] is a checked location, not a value: it is produced
//! by dereferencing a tainted pointer, and every `read` goes back to the
//! arena bytes. The guest owns that memory and may rewrite it at any moment,
//! so nothing read earlier is ever assumed to still be there.

use core::fmt;
use core::mem::size_of;

use taintbox_runtime::SandboxBackend;

use crate::errors::{Result, TaintError};
use crate::repr::{HostCopy, SandboxId, SandboxRepr};
use crate::sandbox::Sandbox;
use crate::tainted::Tainted;
use crate::verified::Verified;

/// A location inside a sandbox arena, viewed as a `T`.
///
/// Created by `Tainted::<*mut T, B>::deref`, which is where the null,
/// same-instance, bounds, and alignment checks happen. A view holds no claim
/// on the location: membership is re-checked on every access, so memory the
/// backend has stopped owning fails with [`TaintError::Bounds`] instead of
/// being touched. Reads are volatile: the value is fetched from the arena on
/// every call and is never cached.
pub struct TaintedVolatile<'s, T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    host: *mut T::Repr,
    origin: SandboxId,
    sandbox: &'s Sandbox<B>,
}

impl<T, B> Clone for TaintedVolatile<'_, T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, B> Copy for TaintedVolatile<'_, T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
}

impl<T, B> fmt::Debug for TaintedVolatile<'_, T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaintedVolatile")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<'s, T, B> TaintedVolatile<'s, T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// Invariant: the caller has checked that `[host, host + size_of::<T::Repr>())`
    /// lies inside the arena of `sandbox` and that `host` is aligned.
    pub(crate) fn new(host: *mut T::Repr, origin: SandboxId, sandbox: &'s Sandbox<B>) -> Self {
        Self {
            host,
            origin,
            sandbox,
        }
    }

    /// Every access re-proves the location is still arena memory, so a
    /// `free_in_sandbox` between deref and use surfaces as
    /// [`TaintError::Bounds`] here instead of reaching a dead block.
    fn check_location(&self) -> Result<()> {
        self.sandbox.check_usable()?;
        self.sandbox.check_range(
            self.host.cast::<u8>(),
            size_of::<T::Repr>().max(1),
            "volatile access",
        )
    }

    /// Volatile-read the current value of the location.
    ///
    /// Each call re-reads the arena; two reads may disagree if the guest
    /// wrote in between, and nothing the compiler does can fold them.
    pub fn read(&self) -> Result<Tainted<T, B>> {
        self.check_location()?;
        // SAFETY: the range was just re-checked to be memory the backend
        // currently owns; alignment was checked at construction and is
        // preserved by projection.
        let repr = unsafe { self.host.read_volatile() };
        Ok(Tainted::from_storage(T::from_repr(repr, self.origin)))
    }

    /// Volatile-write `src` into the location.
    ///
    /// Accepts tainted values of the same backend, verified values, and
    /// plain host-copyable values. Host pointers are not writable into
    /// sandbox memory at all:
    ///
    /// ```compile_fail
    /// use taintbox::{Sandbox, SandboxConfig};
    /// use taintbox::runtime::direct::DirectBackend;
    ///
    /// let sb = Sandbox::<DirectBackend>::create(SandboxConfig::default()).unwrap();
    /// let p = sb.malloc_in_sandbox::<*mut i32>().unwrap();
    /// let mut x = 5i32;
    /// // *mut i32 is not a VolatileSource: the guest must never see raw
    /// // host addresses.
    /// p.deref(&sb).unwrap().write(&mut x as *mut i32).unwrap();
    /// ```
    pub fn write<V>(&self, src: V) -> Result<()>
    where
        V: VolatileSource<T, B>,
    {
        self.check_location()?;
        let src_origin = src.origin();
        if src_origin != SandboxId::NONE && src_origin != self.sandbox.id() {
            return Err(TaintError::CrossSandbox);
        }
        // SAFETY: as in `read`: the range was just re-checked and the
        // location is aligned.
        unsafe { self.host.write_volatile(src.into_repr()) };
        Ok(())
    }

    /// Snapshot the location and run `verifier` on the copy.
    pub fn copy_and_verify<U, F>(&self, verifier: F) -> Result<Verified<U>>
    where
        T: HostCopy<B>,
        F: FnOnce(T) -> Result<U, String>,
    {
        self.read()?.copy_and_verify(verifier)
    }

    /// Reinterpret a field of the viewed object as its own view. Macro
    /// plumbing; `byte_offset` must come from `offset_of!` on the repr
    /// struct so the projected range stays inside the parent object.
    #[doc(hidden)]
    pub fn project<F>(&self, byte_offset: usize) -> TaintedVolatile<'s, F, B>
    where
        F: SandboxRepr<B>,
    {
        debug_assert!(byte_offset + size_of::<F::Repr>() <= size_of::<T::Repr>());
        TaintedVolatile {
            host: self.host.cast::<u8>().wrapping_add(byte_offset).cast::<F::Repr>(),
            origin: self.origin,
            sandbox: self.sandbox,
        }
    }
}

impl<'s, T, B, const N: usize> TaintedVolatile<'s, [T; N], B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// View one element of an in-sandbox array.
    ///
    /// The element count is part of the type, so this is a host-side check:
    /// `i >= N` is [`TaintError::Index`], with no arena access involved.
    pub fn index(&self, i: usize) -> Result<TaintedVolatile<'s, T, B>> {
        if i >= N {
            return Err(TaintError::Index { index: i, len: N });
        }
        Ok(self.project::<T>(i * size_of::<T::Repr>()))
    }
}

/// What may be stored through a [`TaintedVolatile`].
///
/// The type parameter ties the source to the destination's element type;
/// the `origin` is checked against the destination's instance at write
/// time, which is what rejects pointers smuggled between sandboxes.
pub trait VolatileSource<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// The instance this value claims to belong to.
    fn origin(&self) -> SandboxId;

    /// Lower into the in-sandbox form.
    fn into_repr(self) -> T::Repr;
}

impl<T, B> VolatileSource<T, B> for T
where
    T: HostCopy<B>,
    B: SandboxBackend,
{
    fn origin(&self) -> SandboxId {
        SandboxId::NONE
    }

    fn into_repr(self) -> T::Repr {
        T::to_repr(T::from_host(self))
    }
}

impl<T, B> VolatileSource<T, B> for Tainted<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    fn origin(&self) -> SandboxId {
        T::origin(&self.storage)
    }

    fn into_repr(self) -> T::Repr {
        T::to_repr(self.storage)
    }
}

impl<T, B> VolatileSource<T, B> for Verified<T>
where
    T: HostCopy<B>,
    B: SandboxBackend,
{
    fn origin(&self) -> SandboxId {
        SandboxId::NONE
    }

    fn into_repr(self) -> T::Repr {
        T::to_repr(T::from_host(self.into_inner()))
    }
}
