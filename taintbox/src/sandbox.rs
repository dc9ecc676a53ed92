//! The per-instance facade: lifecycle, memory, calls, callbacks.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;

use taintbox_runtime::{
    AbiValue, BackendError, HostDispatch, SandboxBackend, SandboxConfig, SandboxPtr,
};

use crate::errors::{Result, TaintError};
use crate::repr::{AbiPassable, CInt, CLong, CLongLong, HostCopy, SandboxId, SandboxRepr, TaggedPtr};
use crate::tainted::Tainted;
use crate::verified::Verified;

type CallbackFn<B> = Box<dyn FnMut(CallbackArgs<'_, B>) -> Result<CallbackRet<B>> + Send>;

/// One live sandbox instance.
///
/// Everything the host does to the instance goes through `&self`; interior
/// mutability keeps the borrow story out of the caller's way while still
/// panicking on genuine re-entrance (a callback that calls back into its own
/// instance's `invoke_sandboxed`).
///
/// A fault inside the guest poisons the instance: every later operation
/// returns [`TaintError::SandboxFault`] until the instance is dropped. The
/// arena itself is released on drop, fault or no fault.
pub struct Sandbox<B: SandboxBackend> {
    backend: RefCell<B>,
    callbacks: RefCell<Vec<Option<CallbackFn<B>>>>,
    id: SandboxId,
    faulted: Cell<bool>,
}

impl<B: SandboxBackend> fmt::Debug for Sandbox<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("faulted", &self.faulted.get())
            .finish_non_exhaustive()
    }
}

impl<B: SandboxBackend> Sandbox<B> {
    /// Create an instance with its own arena and callback table.
    pub fn create(config: SandboxConfig) -> Result<Self> {
        let backend = B::create(&config).map_err(|e| TaintError::SandboxFault {
            reason: e.to_string(),
        })?;
        let mut callbacks = Vec::new();
        callbacks.resize_with(config.max_callbacks, || None);
        let id = SandboxId::next();
        tracing::debug!(sandbox = id.raw(), "sandbox created");
        Ok(Self {
            backend: RefCell::new(backend),
            callbacks: RefCell::new(callbacks),
            id,
            faulted: Cell::new(false),
        })
    }

    /// Tear the instance down now instead of at end of scope.
    ///
    /// Dropping does the same work; this form just makes the point in the
    /// source where the arena dies explicit.
    pub fn destroy(self) {}

    /// This instance's process-unique identity.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Whether a guest fault has poisoned the instance.
    pub fn is_faulted(&self) -> bool {
        self.faulted.get()
    }

    // ==================================================================
    // Sandbox memory
    // ==================================================================

    /// Allocate space for one `T` inside the arena.
    ///
    /// Exhaustion follows the C convention: the result is the null tainted
    /// pointer, not an error.
    pub fn malloc_in_sandbox<T: SandboxRepr<B>>(&self) -> Result<Tainted<*mut T, B>> {
        self.malloc_in_sandbox_n::<T>(1)
    }

    /// Allocate space for `count` contiguous `T`s inside the arena.
    pub fn malloc_in_sandbox_n<T: SandboxRepr<B>>(&self, count: usize) -> Result<Tainted<*mut T, B>> {
        self.check_usable()?;
        let bytes = size_of::<T::Repr>()
            .checked_mul(count)
            .ok_or(TaintError::Overflow)?;
        let repr = self.backend.borrow_mut().malloc_in_sandbox(bytes);
        if repr.is_null() {
            return Ok(Tainted::null());
        }
        Ok(Tainted::from_storage(TaggedPtr::new(repr, self.id)))
    }

    /// Release an arena allocation.
    ///
    /// Freeing the null pointer is a no-op, as in C. Freeing a pointer that
    /// belongs to another instance is [`TaintError::CrossSandbox`]. Views of
    /// the allocation may outlive the free; each later access re-checks
    /// membership, so it either lands in memory the arena still owns or
    /// fails with [`TaintError::Bounds`].
    ///
    /// # Panics
    ///
    /// Panics on double-free and on pointers the arena allocator never
    /// produced, like the backing allocator would.
    pub fn free_in_sandbox<T: SandboxRepr<B>>(&self, p: Tainted<*mut T, B>) -> Result<()> {
        self.check_usable()?;
        if p.storage.is_null() {
            return Ok(());
        }
        self.check_origin(p.storage.origin())?;
        self.backend.borrow_mut().free_in_sandbox(p.storage.repr());
        Ok(())
    }

    /// Bring a host pointer that already points into this instance's arena
    /// back into the tainted world.
    ///
    /// This is the inverse of [`Tainted::UNSAFE_unverified_ptr`]: a foreign
    /// API handed the raw pointer around and the host wants taint tracking
    /// back. Null imports as the null tainted pointer; anything outside the
    /// arena is [`TaintError::Bounds`].
    pub fn import_host_ptr<T: SandboxRepr<B>>(&self, host: *mut T) -> Result<Tainted<*mut T, B>> {
        self.check_usable()?;
        if host.is_null() {
            return Ok(Tainted::null());
        }
        let raw = host.cast::<u8>();
        self.check_range(raw, size_of::<T::Repr>().max(1), "host pointer import")?;
        let repr = self.backend.borrow().sandbox_ptr(raw);
        Ok(Tainted::from_storage(TaggedPtr::new(repr, self.id)))
    }

    // ==================================================================
    // Invocation
    // ==================================================================

    /// Run a guest function.
    ///
    /// Arguments are a tuple of up to four [`InvokeArg`] values: plain
    /// scalars, `Tainted` values of this instance, `Verified` values, and
    /// callback handles. The return value comes back tainted.
    ///
    /// A guest fault poisons the instance and surfaces as
    /// [`TaintError::SandboxFault`]; so does a return value that does not
    /// match `R`'s ABI slot, though that one leaves the instance usable.
    ///
    /// # Panics
    ///
    /// Panics if called from inside one of this instance's own callbacks;
    /// the reference backends are single-threaded and re-entrant invocation
    /// would alias the arena borrow.
    pub fn invoke_sandboxed<R, A>(&self, func: B::FuncRef, args: A) -> Result<Tainted<R, B>>
    where
        R: AbiPassable<B>,
        A: InvokeArgs<B>,
    {
        self.check_usable()?;
        let abi_args = args.marshal(self)?;
        let mut backend = self.backend.borrow_mut();
        let mut slots = self.callbacks.borrow_mut();
        let mut dispatch = FacadeDispatch {
            id: self.id,
            slots: &mut slots,
        };
        match backend.invoke(func, &abi_args, &mut dispatch) {
            Ok(value) => Ok(Tainted::from_storage(R::from_abi(value, self.id)?)),
            Err(BackendError::Fault { reason }) => {
                self.faulted.set(true);
                tracing::warn!(
                    sandbox = self.id.raw(),
                    %reason,
                    "guest fault; instance poisoned"
                );
                Err(TaintError::SandboxFault { reason })
            }
            Err(e) => Err(TaintError::SandboxFault {
                reason: e.to_string(),
            }),
        }
    }

    // ==================================================================
    // Callbacks
    // ==================================================================

    /// Expose a host function to the guest.
    ///
    /// The callback receives its arguments tainted and must return through
    /// [`CallbackRet`], so data flowing guest → host → guest never sheds its
    /// taint on the way. Errors returned by the callback become guest-visible
    /// faults.
    ///
    /// # Panics
    ///
    /// Panics when every slot configured via
    /// [`SandboxConfig::max_callbacks`] is taken.
    pub fn register_callback<F>(&self, callback: F) -> CallbackHandle<B>
    where
        F: FnMut(CallbackArgs<'_, B>) -> Result<CallbackRet<B>> + Send + 'static,
    {
        let mut slots = self.callbacks.borrow_mut();
        let slot = slots
            .iter()
            .position(Option::is_none)
            .expect("callback slots exhausted");
        slots[slot] = Some(Box::new(callback));
        tracing::debug!(sandbox = self.id.raw(), slot, "callback registered");
        CallbackHandle {
            slot: slot as u32,
            origin: self.id,
            _backend: PhantomData,
        }
    }

    /// Revoke a callback registration.
    ///
    /// The slot is dead immediately: a guest that still holds the handle's
    /// slot number and calls it faults.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already unregistered.
    pub fn unregister_callback(&self, handle: CallbackHandle<B>) -> Result<()> {
        self.check_origin(handle.origin)?;
        let mut slots = self.callbacks.borrow_mut();
        drop(
            slots[handle.slot as usize]
                .take()
                .expect("callback slot already empty"),
        );
        tracing::debug!(
            sandbox = self.id.raw(),
            slot = handle.slot,
            "callback unregistered"
        );
        Ok(())
    }

    // ==================================================================
    // Internal checks
    // ==================================================================

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.faulted.get() {
            return Err(TaintError::SandboxFault {
                reason: "sandbox instance is poisoned by an earlier fault".to_owned(),
            });
        }
        Ok(())
    }

    /// A value is usable with this instance iff it carries no origin (plain
    /// host data, null pointers) or exactly this instance's.
    pub(crate) fn check_origin(&self, origin: SandboxId) -> Result<()> {
        if origin == SandboxId::NONE || origin == self.id {
            Ok(())
        } else {
            Err(TaintError::CrossSandbox)
        }
    }

    /// Check that all `len` bytes starting at host pointer `start` lie
    /// inside the arena. The backend answers for the whole range, so a
    /// block-table arena rejects spans that bridge two allocations.
    pub(crate) fn check_range(&self, start: *const u8, len: usize, context: &'static str) -> Result<()> {
        let first = start as usize;
        if first.checked_add(len.saturating_sub(1)).is_none() {
            return Err(TaintError::Overflow);
        }
        if self.backend.borrow().is_range_in_sandbox_memory(start, len) {
            Ok(())
        } else {
            Err(TaintError::Bounds {
                addr: first,
                context,
            })
        }
    }

    pub(crate) fn translate_in(&self, repr: B::PointerType) -> *mut u8 {
        self.backend.borrow().unsandbox_ptr(repr)
    }

    pub(crate) fn translate_out(&self, host: *mut u8) -> B::PointerType {
        self.backend.borrow().sandbox_ptr(host)
    }
}

impl<B: SandboxBackend> Drop for Sandbox<B> {
    fn drop(&mut self) {
        self.backend.get_mut().destroy();
        tracing::debug!(sandbox = self.id.raw(), "sandbox destroyed");
    }
}

// ==================================================================
// Callback plumbing
// ==================================================================

/// Arguments the guest passed to a host callback, still tainted.
pub struct CallbackArgs<'a, B: SandboxBackend> {
    origin: SandboxId,
    values: &'a [AbiValue<B::PointerType>],
}

impl<'a, B: SandboxBackend> CallbackArgs<'a, B> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The argument at `idx` as a tainted `T`.
    ///
    /// A missing argument or one in the wrong ABI slot is a fault the guest
    /// caused; both surface as [`TaintError::SandboxFault`].
    pub fn get<T: AbiPassable<B>>(&self, idx: usize) -> Result<Tainted<T, B>> {
        let value = self
            .values
            .get(idx)
            .copied()
            .ok_or(TaintError::SandboxFault {
                reason: format!(
                    "guest passed {} callback arguments, argument {idx} is missing",
                    self.values.len()
                ),
            })?;
        Ok(Tainted::from_storage(T::from_abi(value, self.origin)?))
    }
}

/// What a host callback hands back to the guest.
///
/// Constructed through [`CallbackRet::void`], [`CallbackRet::scalar`],
/// [`CallbackRet::tainted`], or [`CallbackRet::verified`]; the origin rides
/// along and is checked at dispatch, so a callback cannot smuggle another
/// instance's pointer into this guest.
pub struct CallbackRet<B: SandboxBackend> {
    value: AbiValue<B::PointerType>,
    origin: SandboxId,
}

impl<B: SandboxBackend> CallbackRet<B> {
    /// Return nothing.
    pub fn void() -> Self {
        Self {
            value: AbiValue::Void,
            origin: SandboxId::NONE,
        }
    }

    /// Return a plain host scalar.
    pub fn scalar<T>(value: T) -> Self
    where
        T: AbiPassable<B> + HostCopy<B>,
    {
        Self {
            value: T::to_abi(T::from_host(value)),
            origin: SandboxId::NONE,
        }
    }

    /// Hand a tainted value straight back to the guest.
    pub fn tainted<T: AbiPassable<B>>(value: Tainted<T, B>) -> Self {
        Self {
            origin: T::origin(&value.storage),
            value: T::to_abi(value.storage),
        }
    }

    /// Return a value that went through verification.
    pub fn verified<T>(value: Verified<T>) -> Self
    where
        T: AbiPassable<B> + HostCopy<B>,
    {
        Self::scalar(value.into_inner())
    }
}

/// Capability to unregister one callback. Tied to the registering instance.
pub struct CallbackHandle<B: SandboxBackend> {
    slot: u32,
    origin: SandboxId,
    _backend: PhantomData<fn() -> B>,
}

impl<B: SandboxBackend> Clone for CallbackHandle<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: SandboxBackend> Copy for CallbackHandle<B> {}

impl<B: SandboxBackend> fmt::Debug for CallbackHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("slot", &self.slot)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Adapter the backend dispatches guest `call_host`s through.
struct FacadeDispatch<'a, B: SandboxBackend> {
    id: SandboxId,
    slots: &'a mut Vec<Option<CallbackFn<B>>>,
}

impl<'a, B: SandboxBackend> HostDispatch<B::PointerType> for FacadeDispatch<'a, B> {
    fn dispatch(
        &mut self,
        slot: u32,
        args: &[AbiValue<B::PointerType>],
    ) -> Result<AbiValue<B::PointerType>, BackendError> {
        let callback = self
            .slots
            .get_mut(slot as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| BackendError::Fault {
                reason: format!("guest called dead callback slot {slot}"),
            })?;
        let ret = callback(CallbackArgs {
            origin: self.id,
            values: args,
        })
        .map_err(|e| BackendError::Fault {
            reason: format!("host callback failed: {e}"),
        })?;
        if ret.origin != SandboxId::NONE && ret.origin != self.id {
            return Err(BackendError::Fault {
                reason: "callback returned a value owned by another sandbox".to_owned(),
            });
        }
        Ok(ret.value)
    }
}

// ==================================================================
// Argument marshaling
// ==================================================================

/// One value crossing into a guest call.
pub trait InvokeArg<B: SandboxBackend> {
    fn marshal(self, sandbox: &Sandbox<B>) -> Result<AbiValue<B::PointerType>>;
}

impl<T, B> InvokeArg<B> for Tainted<T, B>
where
    T: AbiPassable<B>,
    B: SandboxBackend,
{
    fn marshal(self, sandbox: &Sandbox<B>) -> Result<AbiValue<B::PointerType>> {
        sandbox.check_origin(T::origin(&self.storage))?;
        Ok(T::to_abi(self.storage))
    }
}

impl<T, B> InvokeArg<B> for Verified<T>
where
    T: AbiPassable<B> + HostCopy<B>,
    B: SandboxBackend,
{
    fn marshal(self, _sandbox: &Sandbox<B>) -> Result<AbiValue<B::PointerType>> {
        Ok(T::to_abi(T::from_host(self.into_inner())))
    }
}

impl<B: SandboxBackend> InvokeArg<B> for CallbackHandle<B> {
    fn marshal(self, sandbox: &Sandbox<B>) -> Result<AbiValue<B::PointerType>> {
        sandbox.check_origin(self.origin)?;
        Ok(AbiValue::I32(self.slot as i32))
    }
}

macro_rules! invoke_scalar {
    ($($t:ty),+ $(,)?) => {$(
        impl<B: SandboxBackend> InvokeArg<B> for $t {
            fn marshal(self, _sandbox: &Sandbox<B>) -> Result<AbiValue<B::PointerType>> {
                Ok(<$t as AbiPassable<B>>::to_abi(<$t as HostCopy<B>>::from_host(self)))
            }
        }
    )+};
}

invoke_scalar!(
    i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, usize, isize, CInt, CLong, CLongLong,
);

/// A full argument tuple, marshaled left to right.
pub trait InvokeArgs<B: SandboxBackend> {
    fn marshal(self, sandbox: &Sandbox<B>) -> Result<Vec<AbiValue<B::PointerType>>>;
}

impl<B: SandboxBackend> InvokeArgs<B> for () {
    fn marshal(self, _sandbox: &Sandbox<B>) -> Result<Vec<AbiValue<B::PointerType>>> {
        Ok(Vec::new())
    }
}

macro_rules! invoke_args_tuple {
    ($($arg:ident : $idx:tt),+) => {
        impl<B, $($arg),+> InvokeArgs<B> for ($($arg,)+)
        where
            B: SandboxBackend,
            $($arg: InvokeArg<B>,)+
        {
            fn marshal(self, sandbox: &Sandbox<B>) -> Result<Vec<AbiValue<B::PointerType>>> {
                Ok(vec![$(self.$idx.marshal(sandbox)?),+])
            }
        }
    };
}

invoke_args_tuple!(A0: 0);
invoke_args_tuple!(A0: 0, A1: 1);
invoke_args_tuple!(A0: 0, A1: 1, A2: 2);
invoke_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3);

#[cfg(test)]
mod tests {
    use super::*;
    use taintbox_runtime::offset::OffsetBackend;
    use taintbox_runtime::{GuestContext, GuestFn};

    type Sbx = OffsetBackend<256>;
    type GuestResult = Result<AbiValue<u32>, BackendError>;

    fn sandbox() -> Sandbox<Sbx> {
        Sandbox::create(SandboxConfig::default()).expect("sandbox creation failed")
    }

    // --- lifecycle tests ---

    #[test]
    fn create_allocate_destroy() {
        let sb = sandbox();
        assert!(!sb.is_faulted());
        let p = sb.malloc_in_sandbox::<i64>().unwrap();
        assert!(!p.is_null());
        sb.destroy();
    }

    #[test]
    fn exhausted_arena_mallocs_null() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox_n::<u8>(1024).unwrap();
        assert!(p.is_null());
        // The instance itself is fine afterwards.
        assert!(!sb.is_faulted());
        assert!(!sb.malloc_in_sandbox::<u8>().unwrap().is_null());
    }

    #[test]
    fn oversized_element_count_overflows() {
        let sb = sandbox();
        let err = sb.malloc_in_sandbox_n::<u64>(usize::MAX).unwrap_err();
        assert_eq!(err, TaintError::Overflow);
    }

    // --- free tests ---

    #[test]
    fn freeing_null_is_a_noop() {
        let sb = sandbox();
        sb.free_in_sandbox(Tainted::<*mut i32, Sbx>::null()).unwrap();
    }

    #[test]
    #[should_panic(expected = "double-free")]
    fn double_free_panics() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox::<i32>().unwrap();
        sb.free_in_sandbox(p).unwrap();
        let _ = sb.free_in_sandbox(p);
    }

    #[test]
    fn freeing_through_the_wrong_instance_is_rejected() {
        let sb1 = sandbox();
        let sb2 = sandbox();
        let p = sb1.malloc_in_sandbox::<i32>().unwrap();
        assert_eq!(sb2.free_in_sandbox(p).unwrap_err(), TaintError::CrossSandbox);
        // Still allocated and freeable where it belongs.
        sb1.free_in_sandbox(p).unwrap();
    }

    // --- import tests ---

    #[test]
    fn importing_a_pointer_from_outside_the_arena_is_rejected() {
        let sb = sandbox();
        let mut host_value = 3i32;
        let err = sb.import_host_ptr(&mut host_value as *mut i32).unwrap_err();
        assert!(matches!(
            err,
            TaintError::Bounds {
                context: "host pointer import",
                ..
            }
        ));
        assert!(sb.import_host_ptr(core::ptr::null_mut::<i32>()).unwrap().is_null());
    }

    // --- invocation tests ---

    fn add_guest(cx: &mut GuestContext<'_, u32>) -> GuestResult {
        let (AbiValue::I32(a), AbiValue::I32(b)) = (cx.arg(0)?, cx.arg(1)?) else {
            return Err(BackendError::BadAbi { expected: "two i32 arguments" });
        };
        Ok(AbiValue::I32(a.wrapping_add(b)))
    }

    fn bump_cell(cx: &mut GuestContext<'_, u32>) -> GuestResult {
        let AbiValue::Ptr(p) = cx.arg(0)? else {
            return Err(BackendError::BadAbi { expected: "pointer argument" });
        };
        let v = cx.read_i32(p)?;
        cx.write_i32(p, v.wrapping_add(1))?;
        Ok(AbiValue::Void)
    }

    fn scribble_on_flag(cx: &mut GuestContext<'_, u32>) -> GuestResult {
        let AbiValue::Ptr(p) = cx.arg(0)? else {
            return Err(BackendError::BadAbi { expected: "pointer argument" });
        };
        cx.write_u8(p, 2)?;
        Ok(AbiValue::Void)
    }

    fn trap_guest(_cx: &mut GuestContext<'_, u32>) -> GuestResult {
        Err(BackendError::Fault {
            reason: "simulated trap".to_owned(),
        })
    }

    #[test]
    fn invocation_marshals_arguments_and_taints_the_return() {
        let sb = sandbox();
        let r: Tainted<i32, Sbx> = sb
            .invoke_sandboxed(add_guest as GuestFn<u32>, (Tainted::<i32, Sbx>::new(40), 2i32))
            .unwrap();
        assert_eq!(r.UNSAFE_unverified(), 42);
    }

    #[test]
    fn guest_writes_are_visible_through_existing_views() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox::<i32>().unwrap();
        let view = p.deref(&sb).unwrap();
        view.write(5).unwrap();
        let _: Tainted<(), Sbx> = sb.invoke_sandboxed(bump_cell as GuestFn<u32>, (p,)).unwrap();
        // The view re-reads the arena, so the guest's store is observed.
        assert_eq!(view.read().unwrap().UNSAFE_unverified(), 6);
    }

    #[test]
    fn guest_scribbled_flags_raise_as_plain_truth() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox::<bool>().unwrap();
        let _: Tainted<(), Sbx> = sb
            .invoke_sandboxed(scribble_on_flag as GuestFn<u32>, (p,))
            .unwrap();
        // 2 is not a valid `bool` bit pattern; the byte-backed repr raises
        // it as plain `true` instead of trusting the guest's byte.
        assert!(p.deref(&sb).unwrap().read().unwrap().UNSAFE_unverified());
        let v = p
            .deref(&sb)
            .unwrap()
            .copy_and_verify(|flag| Ok::<_, String>(flag))
            .unwrap();
        assert!(*v);
    }

    #[test]
    fn arguments_from_another_instance_never_reach_the_guest() {
        let sb1 = sandbox();
        let sb2 = sandbox();
        let foreign = sb2.malloc_in_sandbox::<i32>().unwrap();
        let err = sb1
            .invoke_sandboxed::<(), _>(bump_cell as GuestFn<u32>, (foreign,))
            .unwrap_err();
        assert_eq!(err, TaintError::CrossSandbox);
        // Rejected at marshal time, before the guest ran.
        assert!(!sb1.is_faulted());
    }

    #[test]
    fn mismatched_return_slot_errors_without_poisoning() {
        let sb = sandbox();
        let err = sb
            .invoke_sandboxed::<i64, _>(add_guest as GuestFn<u32>, (1i32, 2i32))
            .unwrap_err();
        assert!(matches!(err, TaintError::SandboxFault { .. }));
        assert!(!sb.is_faulted());
    }

    // --- fault poisoning tests ---

    #[test]
    fn a_fault_poisons_every_later_operation() {
        let sb = sandbox();
        let p = sb.malloc_in_sandbox::<i32>().unwrap();
        let err = sb
            .invoke_sandboxed::<(), _>(trap_guest as GuestFn<u32>, ())
            .unwrap_err();
        assert_eq!(
            err,
            TaintError::SandboxFault {
                reason: "simulated trap".to_owned()
            }
        );
        assert!(sb.is_faulted());
        assert!(matches!(
            sb.malloc_in_sandbox::<i32>().unwrap_err(),
            TaintError::SandboxFault { .. }
        ));
        assert!(matches!(
            sb.free_in_sandbox(p).unwrap_err(),
            TaintError::SandboxFault { .. }
        ));
        assert!(matches!(
            p.deref(&sb).unwrap_err(),
            TaintError::SandboxFault { .. }
        ));
        assert!(matches!(
            sb.invoke_sandboxed::<(), _>(trap_guest as GuestFn<u32>, ())
                .unwrap_err(),
            TaintError::SandboxFault { .. }
        ));
    }

    // --- callback tests ---

    fn call_slot_then_add_two(cx: &mut GuestContext<'_, u32>) -> GuestResult {
        let (AbiValue::I32(slot), x) = (cx.arg(0)?, cx.arg(1)?) else {
            return Err(BackendError::BadAbi { expected: "slot then value" });
        };
        let AbiValue::I32(doubled) = cx.call_host(slot as u32, &[x])? else {
            return Err(BackendError::BadAbi { expected: "i32 from callback" });
        };
        Ok(AbiValue::I32(doubled.wrapping_add(2)))
    }

    fn call_slot_zero(cx: &mut GuestContext<'_, u32>) -> GuestResult {
        cx.call_host(0, &[])
    }

    #[test]
    fn callbacks_round_trip_guest_host_guest() {
        let sb = sandbox();
        let handle = sb.register_callback(|args: CallbackArgs<'_, Sbx>| {
            let x = args.get::<i32>(0)?;
            Ok(CallbackRet::scalar(x.UNSAFE_unverified().wrapping_mul(2)))
        });
        let r: Tainted<i32, Sbx> = sb
            .invoke_sandboxed(call_slot_then_add_two as GuestFn<u32>, (handle, 20i32))
            .unwrap();
        assert_eq!(r.UNSAFE_unverified(), 42);
        sb.unregister_callback(handle).unwrap();
    }

    #[test]
    fn calling_a_dead_slot_faults_the_guest() {
        let sb = sandbox();
        let handle = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
        sb.unregister_callback(handle).unwrap();
        let err = sb
            .invoke_sandboxed::<(), _>(call_slot_zero as GuestFn<u32>, ())
            .unwrap_err();
        assert!(matches!(err, TaintError::SandboxFault { .. }));
        assert!(sb.is_faulted());
    }

    #[test]
    fn callback_errors_surface_as_guest_faults() {
        let sb = sandbox();
        let _handle = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| {
            Err(TaintError::VerificationRejected {
                reason: "host said no".to_owned(),
            })
        });
        let err = sb
            .invoke_sandboxed::<(), _>(call_slot_zero as GuestFn<u32>, ())
            .unwrap_err();
        let TaintError::SandboxFault { reason } = err else {
            panic!("expected a fault, got {err:?}");
        };
        assert!(reason.contains("host callback failed"));
        assert!(sb.is_faulted());
    }

    #[test]
    fn callbacks_cannot_leak_foreign_pointers_into_the_guest() {
        let sb1 = sandbox();
        let sb2 = sandbox();
        let foreign = sb2.malloc_in_sandbox::<i32>().unwrap();
        let _handle = sb1.register_callback(move |_args: CallbackArgs<'_, Sbx>| {
            Ok(CallbackRet::tainted(foreign))
        });
        let err = sb1
            .invoke_sandboxed::<*mut i32, _>(call_slot_zero as GuestFn<u32>, ())
            .unwrap_err();
        let TaintError::SandboxFault { reason } = err else {
            panic!("expected a fault, got {err:?}");
        };
        assert!(reason.contains("another sandbox"));
    }

    #[test]
    #[should_panic(expected = "callback slot already empty")]
    fn unregistering_twice_panics() {
        let sb = sandbox();
        let handle = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
        sb.unregister_callback(handle).unwrap();
        let _ = sb.unregister_callback(handle);
    }

    #[test]
    #[should_panic(expected = "callback slots exhausted")]
    fn registering_past_capacity_panics() {
        let sb: Sandbox<Sbx> =
            Sandbox::create(SandboxConfig { max_callbacks: 1 }).expect("sandbox creation failed");
        let _a = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
        let _b = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
    }

    #[test]
    fn unregistering_through_the_wrong_instance_is_rejected() {
        let sb1 = sandbox();
        let sb2 = sandbox();
        let handle = sb1.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
        assert_eq!(
            sb2.unregister_callback(handle).unwrap_err(),
            TaintError::CrossSandbox
        );
        sb1.unregister_callback(handle).unwrap();
    }

    // --- pass-through backend tests ---

    #[test]
    fn the_facade_is_backend_agnostic() {
        use taintbox_runtime::direct::DirectBackend;

        let sb: Sandbox<DirectBackend> =
            Sandbox::create(SandboxConfig::default()).expect("sandbox creation failed");
        let p = sb.malloc_in_sandbox_n::<i32>(2).unwrap();
        p.index(1, &sb).unwrap().write(9i32).unwrap();
        assert_eq!(
            p.index(1, &sb).unwrap().read().unwrap().UNSAFE_unverified(),
            9
        );
        let sum = (p.index(1, &sb).unwrap().read().unwrap() + 33).UNSAFE_unverified();
        assert_eq!(sum, 42);
        // Membership is the live-block table here, not an arena mask: one
        // past the allocation is already outside sandbox memory.
        assert!(matches!(
            p.add(2, &sb).unwrap_err(),
            TaintError::Bounds { .. }
        ));
        sb.free_in_sandbox(p).unwrap();
    }

    #[test]
    fn range_copies_never_bridge_allocations() {
        use taintbox_runtime::direct::DirectBackend;

        let sb: Sandbox<DirectBackend> =
            Sandbox::create(SandboxConfig::default()).expect("sandbox creation failed");
        let p = sb.malloc_in_sandbox_n::<i32>(4).unwrap();
        // Keep more live sandbox memory around; the copy still must not
        // run past its own allocation.
        let _other = sb.malloc_in_sandbox_n::<i32>(4).unwrap();
        let v = p
            .copy_and_verify_range(&sb, 4, |xs| Ok::<_, String>(xs.len()))
            .unwrap();
        assert_eq!(*v, 4);
        let err = p
            .copy_and_verify_range(&sb, 5, |xs| Ok::<_, String>(xs.len()))
            .unwrap_err();
        assert!(matches!(
            err,
            TaintError::Bounds {
                context: "range copy",
                ..
            }
        ));
    }

    #[test]
    fn verified_values_and_slots_reuse() {
        let sb = sandbox();
        // A freed slot is reused by the next registration.
        let first = sb.register_callback(|_args: CallbackArgs<'_, Sbx>| Ok(CallbackRet::void()));
        sb.unregister_callback(first).unwrap();
        let second = sb.register_callback(|args: CallbackArgs<'_, Sbx>| {
            let x = args.get::<i32>(0)?;
            x.copy_and_verify(|v| {
                if v >= 0 {
                    Ok(v)
                } else {
                    Err("negative".to_owned())
                }
            })
            .map(CallbackRet::verified)
        });
        let r: Tainted<i32, Sbx> = sb
            .invoke_sandboxed(call_slot_then_add_two as GuestFn<u32>, (second, 4i32))
            .unwrap();
        // The verifying callback passes the value through unchanged.
        assert_eq!(r.UNSAFE_unverified(), 6);
    }
}
