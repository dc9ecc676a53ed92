use super::*;

type Arena256 = OffsetBackend<256>;

fn backend() -> Arena256 {
    Arena256::create(&SandboxConfig::default()).expect("arena creation failed")
}

// --- arena layout tests ---

#[test]
fn arena_base_is_size_aligned() {
    let sb = backend();
    assert_eq!(sb.base() as usize % 256, 0);
}

#[test]
fn malloc_returns_aligned_in_bounds_offsets() {
    let mut sb = backend();
    let a = sb.malloc_in_sandbox(12);
    let b = sb.malloc_in_sandbox(4);
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_eq!(a % 8, 0);
    assert_eq!(b % 8, 0);
    // Disjoint: a occupies 16 rounded bytes before b.
    assert!(a as usize + 16 <= b as usize);
    assert!((b as usize) < 256);
}

#[test]
fn zero_size_malloc_gets_distinct_block() {
    let mut sb = backend();
    let a = sb.malloc_in_sandbox(0);
    let b = sb.malloc_in_sandbox(0);
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
}

#[test]
fn malloc_returns_null_on_exhaustion() {
    let mut sb = backend();
    assert_ne!(sb.malloc_in_sandbox(100), 0);
    assert_ne!(sb.malloc_in_sandbox(100), 0);
    // 8 reserved + 104 + 104 leaves less than 104 bytes.
    assert_eq!(sb.malloc_in_sandbox(100), 0);
    // Small requests still fit in the remainder.
    assert_ne!(sb.malloc_in_sandbox(8), 0);
}

#[test]
fn free_list_reuses_exact_size_blocks_only() {
    let mut sb = backend();
    let a = sb.malloc_in_sandbox(24);
    let _b = sb.malloc_in_sandbox(24);
    sb.free_in_sandbox(a);
    // 20 rounds to the same 24-byte class and reuses a's block.
    assert_eq!(sb.malloc_in_sandbox(20), a);
    // A different size class bumps fresh memory instead.
    let c = sb.malloc_in_sandbox(40);
    assert_ne!(c, a);
}

#[test]
#[should_panic(expected = "double-free")]
fn double_free_panics() {
    let mut sb = backend();
    let a = sb.malloc_in_sandbox(8);
    sb.free_in_sandbox(a);
    sb.free_in_sandbox(a);
}

#[test]
#[should_panic(expected = "double-free")]
fn freeing_foreign_offset_panics() {
    let mut sb = backend();
    let _ = sb.malloc_in_sandbox(8);
    sb.free_in_sandbox(0x30);
}

// --- translation tests ---

#[test]
fn translation_round_trips() {
    let sb = backend();
    let host = sb.unsandbox_ptr(0x44);
    assert_eq!(host as usize, sb.base() as usize + 0x44);
    assert_eq!(sb.sandbox_ptr(host), 0x44);
}

#[test]
fn example_translation_matches_instance_translation() {
    let mut sb = backend();
    let p = sb.malloc_in_sandbox(16);
    let host = sb.unsandbox_ptr(p);
    // Any pointer into the arena works as the example, not just the base.
    let example = sb.unsandbox_ptr(p + 5);
    assert_eq!(Arena256::unsandbox_ptr_with_example(p, example), host);
    assert_eq!(Arena256::sandbox_ptr_with_example(host, example), p);
}

#[test]
fn same_sandbox_is_mask_equality() {
    let mut first = backend();
    let mut second = backend();
    let p_off = first.malloc_in_sandbox(8);
    let p = first.unsandbox_ptr(p_off);
    let q_off = first.malloc_in_sandbox(8);
    let q = first.unsandbox_ptr(q_off);
    let r_off = second.malloc_in_sandbox(8);
    let r = second.unsandbox_ptr(r_off);
    assert!(Arena256::is_in_same_sandbox(p, q));
    assert!(!Arena256::is_in_same_sandbox(p, r));
}

#[test]
fn membership_covers_exactly_the_arena() {
    let sb = backend();
    let base = sb.base();
    assert!(!sb.is_pointer_in_sandbox_memory(base.wrapping_sub(1)));
    assert!(sb.is_pointer_in_sandbox_memory(base));
    assert!(sb.is_pointer_in_sandbox_memory(base.wrapping_add(255)));
    assert!(!sb.is_pointer_in_sandbox_memory(base.wrapping_add(256)));
}

#[test]
fn range_membership_is_exact_for_the_contiguous_arena() {
    let sb = backend();
    let base = sb.base();
    assert!(sb.is_range_in_sandbox_memory(base, 256));
    assert!(sb.is_range_in_sandbox_memory(base.wrapping_add(255), 1));
    assert!(!sb.is_range_in_sandbox_memory(base, 257));
    assert!(!sb.is_range_in_sandbox_memory(base.wrapping_sub(1), 2));
    // Zero length degenerates to the pointer itself.
    assert!(sb.is_range_in_sandbox_memory(base, 0));
}

#[test]
fn destroyed_arena_has_no_members() {
    let mut sb = backend();
    let inside = sb.base();
    sb.destroy();
    assert!(!sb.is_pointer_in_sandbox_memory(inside));
    // Idempotent.
    sb.destroy();
}

// --- invoke tests ---

struct NoHost;

impl HostDispatch<u32> for NoHost {
    fn dispatch(&mut self, slot: u32, _args: &[AbiValue<u32>]) -> Result<AbiValue<u32>, BackendError> {
        Err(BackendError::Fault {
            reason: format!("guest called unknown slot {slot}"),
        })
    }
}

struct Doubler;

impl HostDispatch<u32> for Doubler {
    fn dispatch(&mut self, slot: u32, args: &[AbiValue<u32>]) -> Result<AbiValue<u32>, BackendError> {
        match (slot, args) {
            (7, [AbiValue::I32(v)]) => Ok(AbiValue::I32(v * 2)),
            _ => Err(BackendError::Fault {
                reason: format!("unexpected dispatch to slot {slot}"),
            }),
        }
    }
}

fn echo(ctx: &mut GuestContext<'_, u32>) -> Result<AbiValue<u32>, BackendError> {
    ctx.arg(0)
}

fn store_then_load(ctx: &mut GuestContext<'_, u32>) -> Result<AbiValue<u32>, BackendError> {
    let AbiValue::Ptr(p) = ctx.arg(0)? else {
        return Err(BackendError::BadAbi {
            expected: "pointer argument",
        });
    };
    ctx.write_i32(p, 0x5151)?;
    Ok(AbiValue::I32(ctx.read_i32(p)?))
}

fn read_past_arena_end(ctx: &mut GuestContext<'_, u32>) -> Result<AbiValue<u32>, BackendError> {
    ctx.read_i32(254).map(AbiValue::I32)
}

fn double_via_host(ctx: &mut GuestContext<'_, u32>) -> Result<AbiValue<u32>, BackendError> {
    let v = ctx.arg(0)?;
    ctx.call_host(7, &[v])
}

#[test]
fn invoke_echoes_argument() {
    let mut sb = backend();
    let out = sb.invoke(echo, &[AbiValue::I32(9)], &mut NoHost);
    assert_eq!(out, Ok(AbiValue::I32(9)));
}

#[test]
fn invoke_with_missing_argument_is_bad_abi() {
    let mut sb = backend();
    let out = sb.invoke(echo, &[], &mut NoHost);
    assert!(matches!(out, Err(BackendError::BadAbi { .. })));
}

#[test]
fn guest_reads_and_writes_arena_memory() {
    let mut sb = backend();
    let p = sb.malloc_in_sandbox(4);
    let out = sb.invoke(store_then_load, &[AbiValue::Ptr(p)], &mut NoHost);
    assert_eq!(out, Ok(AbiValue::I32(0x5151)));
    // The write went through the real arena bytes.
    let host = sb.unsandbox_ptr(p);
    let mut buf = [0u8; 4];
    // SAFETY: p is a live 4-byte block inside the arena.
    unsafe { std::ptr::copy_nonoverlapping(host, buf.as_mut_ptr(), 4) };
    assert_eq!(i32::from_ne_bytes(buf), 0x5151);
}

#[test]
fn guest_access_beyond_arena_faults() {
    let mut sb = backend();
    let out = sb.invoke(read_past_arena_end, &[], &mut NoHost);
    assert!(matches!(out, Err(BackendError::Fault { .. })));
}

#[test]
fn guest_reaches_host_through_dispatcher() {
    let mut sb = backend();
    let out = sb.invoke(double_via_host, &[AbiValue::I32(21)], &mut Doubler);
    assert_eq!(out, Ok(AbiValue::I32(42)));
}
