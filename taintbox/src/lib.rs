//! # taintbox
//!
//! Tainted values for data crossing a sandbox boundary.
//!
//! Foreign code running in a sandbox cannot corrupt the host directly, but
//! everything it returns is attacker-controlled. This crate makes that fact
//! a type: data of sandbox provenance is [`Tainted`], the host cannot branch
//! on it or index with it, and the only exits are explicit verification
//! ([`Tainted::copy_and_verify`] and friends, producing [`Verified`]) or the
//! loudly named `UNSAFE_` escape hatches.
//!
//! ## Shape of the crate
//!
//! 1. **Facade** - [`Sandbox`] owns one instance: lifecycle, arena memory,
//!    guest calls, host callbacks
//! 2. **Taint algebra** - arithmetic and comparisons that stay tainted,
//!    checked pointer arithmetic, [`TaintedVolatile`] views into the arena
//! 3. **Backends** - the [`runtime`] crate defines the plug-in contract and
//!    two reference arenas
//!
//! ```
//! use taintbox::runtime::offset::OffsetBackend;
//! use taintbox::{Sandbox, SandboxConfig, TaintError};
//!
//! fn main() -> Result<(), TaintError> {
//!     let sb: Sandbox<OffsetBackend<4096>> = Sandbox::create(SandboxConfig::default())?;
//!     let p = sb.malloc_in_sandbox::<i32>()?;
//!     p.deref(&sb)?.write(41)?;
//!     // Still tainted after arithmetic; only verification copies it out.
//!     let answer = (p.deref(&sb)?.read()? + 1).copy_and_verify(|v| {
//!         if v == 42 {
//!             Ok(v)
//!         } else {
//!             Err(format!("unexpected value {v}"))
//!         }
//!     })?;
//!     assert_eq!(*answer, 42);
//!     sb.free_in_sandbox(p)?;
//!     Ok(())
//! }
//! ```

// Important rule: we do not declare all modules as pub, we will be very intentional
// about what our public interface is.
mod errors;
mod ops;
mod record;
mod repr;
mod sandbox;
mod tainted;
mod verified;
mod volatile;

// Re-export taintbox-runtime
pub use taintbox_runtime as runtime;

pub use errors::{Result, TaintError};
pub use ops::{PointerCount, TaintedOperand};
pub use repr::{AbiPassable, CInt, CLong, CLongLong, HostCopy, SandboxId, SandboxRepr, TaggedPtr};
pub use runtime::SandboxConfig;
pub use sandbox::{CallbackArgs, CallbackHandle, CallbackRet, InvokeArg, InvokeArgs, Sandbox};
pub use tainted::Tainted;
pub use verified::Verified;
pub use volatile::{TaintedVolatile, VolatileSource};
