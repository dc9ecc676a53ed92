//! The host-held wrapper for values of sandbox provenance.

use core::ffi::c_char;
use core::fmt;
use core::mem::{align_of, size_of};

use taintbox_runtime::SandboxBackend;

use crate::errors::{Result, TaintError};
use crate::repr::{HostCopy, SandboxRepr, TaggedPtr};
use crate::sandbox::Sandbox;
use crate::verified::Verified;

/// A value that originated inside a sandbox of backend `B` and has not been
/// verified.
///
/// Tainted values can be stored, copied, and combined with the taint
/// arithmetic in this crate, but the host cannot branch on one or read it
/// directly: the only ways out are the `copy_and_verify` family and the
/// `UNSAFE_` escape hatches. The backend parameter makes values from
/// different backend types unmixable:
///
/// ```compile_fail
/// use taintbox::Tainted;
/// use taintbox::runtime::{direct::DirectBackend, offset::OffsetBackend};
///
/// let a = Tainted::<i32, OffsetBackend<4096>>::new(1);
/// let b = Tainted::<i32, DirectBackend>::new(2);
/// let _ = a + b; // no `Add` across backend types
/// ```
pub struct Tainted<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    pub(crate) storage: T::Storage,
}

impl<T, B> Clone for Tainted<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, B> Copy for Tainted<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
}

impl<T, B> fmt::Debug for Tainted<T, B>
where
    T: SandboxRepr<B>,
    T::Storage: fmt::Debug,
    B: SandboxBackend,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Untrusted data is not hidden, just marked.
        f.debug_tuple("Tainted").field(&self.storage).finish()
    }
}

impl<T, B> Tainted<T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// Build a tainted value directly from storage. Macro plumbing; host
    /// code uses [`Tainted::new`] or gets values from a sandbox.
    #[doc(hidden)]
    #[inline]
    pub fn from_storage(storage: T::Storage) -> Self {
        Self { storage }
    }

    /// The raw storage. Macro plumbing.
    #[doc(hidden)]
    #[inline]
    pub fn storage(&self) -> &T::Storage {
        &self.storage
    }
}

impl<T, B> Tainted<T, B>
where
    T: HostCopy<B>,
    B: SandboxBackend,
{
    /// Taint a host value.
    ///
    /// Always safe: this only adds the restriction, never removes it.
    pub fn new(value: T) -> Self {
        Self {
            storage: T::from_host(value),
        }
    }

    /// Copy the value out **without any verification**.
    ///
    /// The name is deliberately loud. Every use is an assertion that the
    /// host is safe against arbitrary values here; prefer
    /// [`Tainted::copy_and_verify`].
    #[allow(non_snake_case)]
    pub fn UNSAFE_unverified(self) -> T {
        T::to_host(self.storage)
    }

    /// The width-normalized in-sandbox form, **without any verification**.
    #[allow(non_snake_case)]
    pub fn UNSAFE_sandboxed(self) -> T::Repr {
        T::to_repr(self.storage)
    }

    /// Copy the value to host memory and run `verifier` on the copy.
    ///
    /// The verifier sees a snapshot: whatever the guest does to its memory
    /// afterwards cannot change what was verified. A rejection surfaces as
    /// [`TaintError::VerificationRejected`].
    pub fn copy_and_verify<U, F>(self, verifier: F) -> Result<Verified<U>>
    where
        F: FnOnce(T) -> Result<U, String>,
    {
        verifier(T::to_host(self.storage))
            .map(Verified::new)
            .map_err(|reason| TaintError::VerificationRejected { reason })
    }
}

impl<T, B> From<T> for Tainted<T, B>
where
    T: HostCopy<B>,
    B: SandboxBackend,
{
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

// ==================================================================
// Pointer eliminations
// ==================================================================

impl<T, B> Tainted<*mut T, B>
where
    T: SandboxRepr<B>,
    B: SandboxBackend,
{
    /// The null tainted pointer. Usable with any instance of `B`.
    pub fn null() -> Self {
        Self {
            storage: TaggedPtr::null(),
        }
    }

    /// Whether the pointer is null. Nullness is not a secret: C APIs
    /// signal failure through it, so the host may branch on this.
    pub fn is_null(&self) -> bool {
        self.storage.is_null()
    }

    /// Translate to a host pointer **without taking ownership or checking
    /// the pointee**.
    ///
    /// The translation itself is still confined: a non-null pointer whose
    /// target lies outside `sandbox`'s arena is a [`TaintError::Bounds`]
    /// error, and null translates to the host null pointer. What the caller
    /// does with the raw pointer afterwards is on the caller.
    #[allow(non_snake_case)]
    pub fn UNSAFE_unverified_ptr(&self, sandbox: &Sandbox<B>) -> Result<*mut T> {
        sandbox.check_usable()?;
        if self.storage.is_null() {
            return Ok(core::ptr::null_mut());
        }
        sandbox.check_origin(self.storage.origin())?;
        let host = sandbox.translate_in(self.storage.repr());
        sandbox.check_range(
            host,
            size_of::<T::Repr>().max(1),
            "unverified pointer translation",
        )?;
        Ok(host.cast::<T>())
    }

    /// The raw in-sandbox representation, **without any checks**.
    #[allow(non_snake_case)]
    pub fn UNSAFE_sandboxed_ptr(&self) -> B::PointerType {
        self.storage.repr()
    }

    /// Volatile-copy `count` elements starting at this pointer into host
    /// memory and run `verifier` on the snapshot.
    ///
    /// The whole range is bounds-checked against the arena before any byte
    /// is read.
    pub fn copy_and_verify_range<U, F>(
        &self,
        sandbox: &Sandbox<B>,
        count: usize,
        verifier: F,
    ) -> Result<Verified<U>>
    where
        T: HostCopy<B>,
        F: FnOnce(Vec<T>) -> Result<U, String>,
    {
        sandbox.check_usable()?;
        if self.storage.is_null() {
            return Err(TaintError::Null);
        }
        sandbox.check_origin(self.storage.origin())?;
        let stride = size_of::<T::Repr>();
        let total = count.checked_mul(stride).ok_or(TaintError::Overflow)?;
        let start = sandbox.translate_in(self.storage.repr());
        if total > 0 {
            sandbox.check_range(start, total, "range copy")?;
        }
        if start as usize % align_of::<T::Repr>() != 0 {
            return Err(TaintError::Bounds {
                addr: start as usize,
                context: "pointer is misaligned for the element type",
            });
        }
        let mut snapshot = Vec::with_capacity(count);
        for k in 0..count {
            // SAFETY: the whole [start, start + total) range was just
            // checked to lie inside the arena, and start is aligned.
            let repr = unsafe { start.cast::<T::Repr>().add(k).read_volatile() };
            snapshot.push(T::to_host(T::from_repr(repr, self.storage.origin())));
        }
        verifier(snapshot)
            .map(Verified::new)
            .map_err(|reason| TaintError::VerificationRejected { reason })
    }
}

impl<B> Tainted<*mut c_char, B>
where
    B: SandboxBackend,
{
    /// Walk a guest C string, copy it to host memory, and run `verifier` on
    /// the lossily-decoded snapshot.
    ///
    /// The walk stops at the first NUL byte. A string that runs off the end
    /// of the arena without terminating is a [`TaintError::Bounds`] error;
    /// the arena boundary is what makes the walk total.
    pub fn copy_and_verify_string<U, F>(&self, sandbox: &Sandbox<B>, verifier: F) -> Result<Verified<U>>
    where
        F: FnOnce(String) -> Result<U, String>,
    {
        sandbox.check_usable()?;
        if self.storage.is_null() {
            return Err(TaintError::Null);
        }
        sandbox.check_origin(self.storage.origin())?;
        let start = sandbox.translate_in(self.storage.repr());
        let mut bytes = Vec::new();
        let mut cursor = start;
        loop {
            sandbox.check_range(cursor, 1, "string walk")?;
            // SAFETY: the cursor byte was just checked to be in the arena.
            let byte = unsafe { cursor.read_volatile() };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.wrapping_add(1);
        }
        let snapshot = String::from_utf8_lossy(&bytes).into_owned();
        verifier(snapshot)
            .map(Verified::new)
            .map_err(|reason| TaintError::VerificationRejected { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SandboxConfig;
    use taintbox_runtime::offset::OffsetBackend;

    type Sbx = OffsetBackend<256>;

    fn sandbox() -> Sandbox<Sbx> {
        Sandbox::create(SandboxConfig::default()).expect("sandbox creation failed")
    }

    #[test]
    fn verification_passes_a_snapshot_through() {
        let t = Tainted::<i32, Sbx>::new(42);
        let v = t
            .copy_and_verify(|x| if x < 100 { Ok(x) } else { Err("too big".to_owned()) })
            .unwrap();
        assert_eq!(*v, 42);
        assert_eq!(v.into_inner(), 42);
    }

    #[test]
    fn verification_rejection_carries_the_reason() {
        let t = Tainted::<i32, Sbx>::new(200);
        let err = t
            .copy_and_verify(|x| if x < 100 { Ok(x) } else { Err("too big".to_owned()) })
            .unwrap_err();
        assert_eq!(
            err,
            TaintError::VerificationRejected {
                reason: "too big".to_owned()
            }
        );
    }

    #[test]
    fn unsafe_hatches_copy_without_checks() {
        let t = Tainted::<u16, Sbx>::new(7);
        assert_eq!(t.UNSAFE_unverified(), 7);
        assert_eq!(t.UNSAFE_sandboxed(), 7);
        let arr = Tainted::<[u8; 3], Sbx>::new([1, 2, 3]);
        assert_eq!(arr.UNSAFE_unverified(), [1, 2, 3]);
    }

    #[test]
    fn null_pointer_translates_to_host_null() {
        let sb = sandbox();
        let p = Tainted::<*mut i32, Sbx>::null();
        assert!(p.is_null());
        assert_eq!(p.UNSAFE_unverified_ptr(&sb).unwrap(), core::ptr::null_mut());
    }

    #[test]
    fn unverified_ptr_translation_is_confined() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox::<i32>().unwrap();
        let host = p.UNSAFE_unverified_ptr(&sb).unwrap();
        assert!(!host.is_null());
        // The raw representation round-trips through the translation.
        let back = sb.import_host_ptr(host).unwrap();
        assert_eq!(back.UNSAFE_sandboxed_ptr(), p.UNSAFE_sandboxed_ptr());
    }

    #[test]
    fn range_copy_snapshots_elements() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<u8>(4).unwrap();
        for (i, b) in [10u8, 20, 30, 40].into_iter().enumerate() {
            p.index(i, &sb).unwrap().write(b).unwrap();
        }
        let v = p
            .copy_and_verify_range(&sb, 4, |bytes| {
                if bytes == [10, 20, 30, 40] {
                    Ok(bytes)
                } else {
                    Err("unexpected".to_owned())
                }
            })
            .unwrap();
        assert_eq!(*v, vec![10, 20, 30, 40]);
    }

    #[test]
    fn range_copy_of_null_is_a_null_error() {
        let sb = sandbox();
        let p = Tainted::<*mut u8, Sbx>::null();
        let err = p.copy_and_verify_range(&sb, 1, |b| Ok(b)).unwrap_err();
        assert_eq!(err, TaintError::Null);
    }

    #[test]
    fn oversized_range_copy_is_out_of_bounds() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<u8>(4).unwrap();
        let err = p.copy_and_verify_range(&sb, 512, |b| Ok(b)).unwrap_err();
        assert!(matches!(err, TaintError::Bounds { .. }));
    }

    #[test]
    fn huge_range_copy_overflows_before_reading() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<u64>(2).unwrap();
        let err = p
            .copy_and_verify_range(&sb, usize::MAX / 2, |b| Ok(b))
            .unwrap_err();
        assert_eq!(err, TaintError::Overflow);
    }

    #[test]
    fn string_walk_stops_at_nul() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<c_char>(8).unwrap();
        for (i, b) in b"hello\0".iter().enumerate() {
            p.index(i, &sb).unwrap().write(*b as c_char).unwrap();
        }
        let v = p
            .copy_and_verify_string(&sb, |s| {
                if s == "hello" {
                    Ok(s.len())
                } else {
                    Err(format!("unexpected string {s:?}"))
                }
            })
            .unwrap();
        assert_eq!(*v, 5);
    }

    #[test]
    fn unterminated_string_is_out_of_bounds() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<c_char>(8).unwrap();
        // Fill every arena byte from the string start to the end, no NUL.
        // Writes stay inside the arena, so each volatile store is allowed
        // even past the logical allocation.
        let start = p.UNSAFE_sandboxed_ptr() as usize;
        for i in 0..(256 - start) {
            p.index(i, &sb).unwrap().write(1 as c_char).unwrap();
        }
        let err = p.copy_and_verify_string(&sb, Ok).unwrap_err();
        assert!(matches!(
            err,
            TaintError::Bounds {
                context: "string walk",
                ..
            }
        ));
    }

    #[test]
    fn string_with_invalid_utf8_is_replaced_not_rejected() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<c_char>(4).unwrap();
        for (i, b) in [0xffu8, 0xfe, 0].into_iter().enumerate() {
            p.index(i, &sb).unwrap().write(b as c_char).unwrap();
        }
        let v = p.copy_and_verify_string(&sb, Ok).unwrap();
        assert_eq!(&*v, "\u{fffd}\u{fffd}");
    }
}
