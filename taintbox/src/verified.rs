use core::ops::Deref;

/// A value that passed an explicit verifier.
///
/// This is the only trusted product of the tainted world: it is constructed
/// exclusively by the `copy_and_verify` family, always from a host-side
/// snapshot, so later writes by the guest cannot retroactively change what
/// was verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified<T>(T);

impl<T> Verified<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(value)
    }

    /// Unwrap the verified value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Verified<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
