//! Reference backend with narrow pointers and base-plus-offset translation.
//!
//! The arena is a single allocation of `ARENA_SIZE` bytes, aligned to its own
//! size. That alignment is what makes the cheap translations possible: the
//! arena base can be recovered from any host pointer into it by masking off
//! the low bits, so membership and same-arena checks are mask comparisons
//! rather than table lookups.

use std::alloc::{self, Layout};

use crate::{
    AbiValue, BackendError, GuestContext, GuestFn, GuestMemory, HostDispatch, SandboxBackend,
    SandboxConfig, SandboxPtr,
};

/// One allocator block, identified by its arena offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    offset: u32,
    size: usize,
}

/// Backend modelling an isolation mechanism with a 32-bit guest address
/// space, such as a wasm module instance.
///
/// - Pointers are `u32` offsets from the arena base; `int` and `long` are
///   32-bit, `long long` is 64-bit (an ILP32 guest).
/// - `ARENA_SIZE` must be a power of two, at most `u32::MAX + 1`; this is
///   checked at compile time when the backend is first used.
/// - Offset 0 is reserved so it can serve as the null representation.
pub struct OffsetBackend<const ARENA_SIZE: usize> {
    base: *mut u8,
    next: usize,
    live: Vec<Block>,
    free_list: Vec<Block>,
}

// SAFETY: the backend exclusively owns its arena allocation; moving it to
// another thread moves that ownership with it.
unsafe impl<const ARENA_SIZE: usize> Send for OffsetBackend<ARENA_SIZE> {}

impl<const ARENA_SIZE: usize> OffsetBackend<ARENA_SIZE> {
    const VALID_ARENA: () = assert!(
        ARENA_SIZE.is_power_of_two() && ARENA_SIZE - 1 <= u32::MAX as usize,
        "arena size must be a power of two addressable by 32-bit offsets"
    );

    /// Clears the low bits that address within one arena.
    const BASE_MASK: usize = !(ARENA_SIZE - 1);

    /// First offset handed out; 0 stays reserved for null.
    const FIRST_OFFSET: usize = 8;

    fn arena_layout() -> Layout {
        // SAFETY: VALID_ARENA guarantees a nonzero power-of-two size, which
        // is also a legal alignment, and the rounded size cannot overflow.
        unsafe { Layout::from_size_align_unchecked(ARENA_SIZE, ARENA_SIZE) }
    }

    /// The arena base address. Test hook; host code goes through the
    /// translation operations.
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl<const ARENA_SIZE: usize> SandboxBackend for OffsetBackend<ARENA_SIZE> {
    type IntType = i32;
    type LongType = i32;
    type LongLongType = i64;
    type PointerType = u32;
    type FuncRef = GuestFn<u32>;

    fn create(_config: &SandboxConfig) -> Result<Self, BackendError> {
        let () = Self::VALID_ARENA;
        // Zeroed so that tainted reads of never-written arena bytes see
        // defined values rather than uninitialized memory.
        // SAFETY: arena_layout has nonzero size.
        let base = unsafe { alloc::alloc_zeroed(Self::arena_layout()) };
        if base.is_null() {
            return Err(BackendError::OutOfMemory);
        }
        debug_assert_eq!(base as usize & !Self::BASE_MASK, 0);
        Ok(Self {
            base,
            next: Self::FIRST_OFFSET,
            live: Vec::new(),
            free_list: Vec::new(),
        })
    }

    fn destroy(&mut self) {
        if self.base.is_null() {
            return;
        }
        // SAFETY: base came from alloc_zeroed with the same layout and is
        // nulled right after, so this runs at most once.
        unsafe { alloc::dealloc(self.base, Self::arena_layout()) };
        self.base = std::ptr::null_mut();
        self.live.clear();
        self.free_list.clear();
    }

    fn malloc_in_sandbox(&mut self, bytes: usize) -> u32 {
        // Blocks stay 8-aligned; zero-size requests get a distinct block.
        let size = match bytes.max(1).checked_next_multiple_of(8) {
            Some(size) => size,
            None => return u32::NULL,
        };
        if let Some(i) = self.free_list.iter().position(|b| b.size == size) {
            let block = self.free_list.swap_remove(i);
            self.live.push(block);
            return block.offset;
        }
        let offset = self.next;
        match offset.checked_add(size) {
            Some(end) if end <= ARENA_SIZE => {
                self.next = end;
                let block = Block {
                    offset: offset as u32,
                    size,
                };
                self.live.push(block);
                block.offset
            }
            _ => u32::NULL,
        }
    }

    fn free_in_sandbox(&mut self, p: u32) {
        let i = self
            .live
            .iter()
            .position(|b| b.offset == p)
            .expect("double-free or foreign pointer in free_in_sandbox");
        let block = self.live.swap_remove(i);
        self.free_list.push(block);
    }

    #[inline]
    fn unsandbox_ptr(&self, p: u32) -> *mut u8 {
        self.base.wrapping_add(p as usize)
    }

    #[inline]
    fn sandbox_ptr(&self, host: *mut u8) -> u32 {
        (host as usize).wrapping_sub(self.base as usize) as u32
    }

    #[inline]
    fn unsandbox_ptr_with_example(p: u32, example: *mut u8) -> *mut u8 {
        let base = example as usize & Self::BASE_MASK;
        (base.wrapping_add(p as usize)) as *mut u8
    }

    #[inline]
    fn sandbox_ptr_with_example(host: *mut u8, example: *mut u8) -> u32 {
        let base = example as usize & Self::BASE_MASK;
        (host as usize).wrapping_sub(base) as u32
    }

    #[inline]
    fn is_in_same_sandbox(p: *const u8, q: *const u8) -> bool {
        (p as usize & Self::BASE_MASK) == (q as usize & Self::BASE_MASK)
    }

    #[inline]
    fn is_pointer_in_sandbox_memory(&self, p: *const u8) -> bool {
        !self.base.is_null() && (p as usize & Self::BASE_MASK) == self.base as usize
    }

    #[inline]
    fn is_range_in_sandbox_memory(&self, p: *const u8, len: usize) -> bool {
        let start = p as usize;
        let Some(last) = start.checked_add(len.saturating_sub(1)) else {
            return false;
        };
        // One contiguous arena: both endpoints masking to the base covers
        // every byte in between.
        !self.base.is_null()
            && (start & Self::BASE_MASK) == self.base as usize
            && (last & Self::BASE_MASK) == self.base as usize
    }

    fn invoke(
        &mut self,
        func: Self::FuncRef,
        args: &[AbiValue<u32>],
        host: &mut dyn HostDispatch<u32>,
    ) -> Result<AbiValue<u32>, BackendError> {
        let memory = OffsetMemory::<ARENA_SIZE> { base: self.base };
        let mut ctx = GuestContext::new(args, &memory, host);
        func(&mut ctx)
    }
}

impl<const ARENA_SIZE: usize> Drop for OffsetBackend<ARENA_SIZE> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Guest view of the arena during one invocation.
struct OffsetMemory<const ARENA_SIZE: usize> {
    base: *mut u8,
}

impl<const ARENA_SIZE: usize> GuestMemory<u32> for OffsetMemory<ARENA_SIZE> {
    fn resolve(&self, p: u32, len: usize) -> Result<*mut u8, BackendError> {
        let offset = p as usize;
        match offset.checked_add(len) {
            Some(end) if end <= ARENA_SIZE => Ok(self.base.wrapping_add(offset)),
            _ => Err(BackendError::Fault {
                reason: format!("guest access escapes arena: offset {offset} len {len}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests;
