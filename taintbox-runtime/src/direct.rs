//! Reference backend with host-width pointers and pass-through translation.
//!
//! Models an isolation mechanism that shares the host address space, such as
//! an in-process SFI toolchain. The sandbox pointer representation IS the
//! host address, so translation is the identity and the arena is whatever
//! set of blocks the allocator currently has live.

use std::alloc::{self, Layout};

use crate::{
    AbiValue, BackendError, GuestContext, GuestFn, GuestMemory, HostDispatch, SandboxBackend,
    SandboxConfig,
};

/// One live host-heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    addr: usize,
    size: usize,
}

impl Block {
    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.addr + self.size
    }

    #[inline]
    fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.addr && addr.saturating_add(len) <= self.addr + self.size
    }
}

/// Backend whose guest runs in the host address space.
///
/// - Pointers are `usize` host addresses; `int` is 32-bit, `long` and
///   `long long` are 64-bit (an LP64 guest).
/// - Sandbox memory is the set of live allocations, so membership is a
///   table lookup instead of a mask comparison, and any two pointers are
///   trivially "in the same sandbox".
pub struct DirectBackend {
    blocks: Vec<Block>,
}

impl DirectBackend {
    const BLOCK_ALIGN: usize = 8;

    fn block_layout(size: usize) -> Layout {
        // SAFETY: size is nonzero, 8 is a power of two, and rounding a
        // rounded-to-8 size cannot overflow.
        unsafe { Layout::from_size_align_unchecked(size, Self::BLOCK_ALIGN) }
    }
}

impl SandboxBackend for DirectBackend {
    type IntType = i32;
    type LongType = i64;
    type LongLongType = i64;
    type PointerType = usize;
    type FuncRef = GuestFn<usize>;

    fn create(_config: &SandboxConfig) -> Result<Self, BackendError> {
        Ok(Self { blocks: Vec::new() })
    }

    fn destroy(&mut self) {
        for block in self.blocks.drain(..) {
            // SAFETY: every entry came from alloc_zeroed with this layout
            // and drain removes it, so each is deallocated exactly once.
            unsafe { alloc::dealloc(block.addr as *mut u8, Self::block_layout(block.size)) };
        }
    }

    fn malloc_in_sandbox(&mut self, bytes: usize) -> usize {
        let size = match bytes.max(1).checked_next_multiple_of(Self::BLOCK_ALIGN) {
            Some(size) => size,
            None => return 0,
        };
        // Zeroed for the same reason as the offset arena: tainted reads of
        // fresh memory must see defined bytes.
        // SAFETY: block_layout has nonzero size.
        let ptr = unsafe { alloc::alloc_zeroed(Self::block_layout(size)) };
        if ptr.is_null() {
            return 0;
        }
        self.blocks.push(Block {
            addr: ptr as usize,
            size,
        });
        ptr as usize
    }

    fn free_in_sandbox(&mut self, p: usize) {
        let i = self
            .blocks
            .iter()
            .position(|b| b.addr == p)
            .expect("double-free or foreign pointer in free_in_sandbox");
        let block = self.blocks.swap_remove(i);
        // SAFETY: the block was live until this call removed it.
        unsafe { alloc::dealloc(block.addr as *mut u8, Self::block_layout(block.size)) };
    }

    #[inline]
    fn unsandbox_ptr(&self, p: usize) -> *mut u8 {
        p as *mut u8
    }

    #[inline]
    fn sandbox_ptr(&self, host: *mut u8) -> usize {
        host as usize
    }

    #[inline]
    fn unsandbox_ptr_with_example(p: usize, _example: *mut u8) -> *mut u8 {
        p as *mut u8
    }

    #[inline]
    fn sandbox_ptr_with_example(host: *mut u8, _example: *mut u8) -> usize {
        host as usize
    }

    /// Vacuously true: there is only one address space.
    #[inline]
    fn is_in_same_sandbox(_p: *const u8, _q: *const u8) -> bool {
        true
    }

    #[inline]
    fn is_pointer_in_sandbox_memory(&self, p: *const u8) -> bool {
        let addr = p as usize;
        self.blocks.iter().any(|b| b.contains(addr))
    }

    #[inline]
    fn is_range_in_sandbox_memory(&self, p: *const u8, len: usize) -> bool {
        let addr = p as usize;
        // Blocks are disjoint heap allocations, so a whole range is only
        // sandbox memory when one block contains it end to end.
        self.blocks
            .iter()
            .any(|b| b.contains_range(addr, len.max(1)))
    }

    fn invoke(
        &mut self,
        func: Self::FuncRef,
        args: &[AbiValue<usize>],
        host: &mut dyn HostDispatch<usize>,
    ) -> Result<AbiValue<usize>, BackendError> {
        let memory = DirectMemory {
            blocks: &self.blocks,
        };
        let mut ctx = GuestContext::new(args, &memory, host);
        func(&mut ctx)
    }
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Guest view of the live-allocation table during one invocation.
struct DirectMemory<'a> {
    blocks: &'a [Block],
}

impl GuestMemory<usize> for DirectMemory<'_> {
    fn resolve(&self, p: usize, len: usize) -> Result<*mut u8, BackendError> {
        if p == 0 {
            return Err(BackendError::Fault {
                reason: "guest access through null pointer".to_owned(),
            });
        }
        if self.blocks.iter().any(|b| b.contains_range(p, len)) {
            Ok(p as *mut u8)
        } else {
            Err(BackendError::Fault {
                reason: format!("guest access escapes sandbox memory: addr {p:#x} len {len}"),
            })
        }
    }
}
