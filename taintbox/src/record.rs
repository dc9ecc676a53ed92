//! Record declaration: C-layout structs that can live in sandbox memory.

/// Declare a record type that foreign code and the host share.
///
/// One invocation produces four items: the named host struct, a `#[repr(C)]`
/// *repr* struct whose fields have each type's in-sandbox form (this is the
/// layout the guest sees, so it must match the guest compiler's layout for
/// the same C struct), a *storage* struct carried by `Tainted` values of the
/// record, and a *fields* trait whose methods project one field at a time.
///
/// The fields trait is implemented for both `Tainted<R, B>` (host-held copy,
/// projecting to `Tainted` fields) and `TaintedVolatile<'_, R, B>` (in-arena
/// view, projecting to nested views). A record is host-copyable exactly when
/// every field is; a record with a pointer field can still be read and
/// written wholesale, but only its non-pointer fields can leave the tainted
/// world.
///
/// ```
/// use taintbox::runtime::offset::OffsetBackend;
/// use taintbox::{tainted_record, Sandbox, SandboxConfig, TaintError};
///
/// tainted_record! {
///     /// A length-prefixed message header.
///     pub struct Header {
///         pub magic: u32,
///         pub len: u32,
///     }
///     repr HeaderRepr;
///     storage HeaderStorage;
///     fields HeaderFields;
/// }
///
/// fn main() -> Result<(), TaintError> {
///     let sb: Sandbox<OffsetBackend<4096>> = Sandbox::create(SandboxConfig::default())?;
///     let p = sb.malloc_in_sandbox::<Header>()?;
///     let view = p.deref(&sb)?;
///     view.magic().write(0x7461_696e_u32)?;
///     view.len().write(12_u32)?;
///     let len = view.len().copy_and_verify(|n| {
///         if n <= 4096 {
///             Ok(n)
///         } else {
///             Err("length out of range".to_owned())
///         }
///     })?;
///     assert_eq!(*len, 12);
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! tainted_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty),+ $(,)?
        }
        repr $repr:ident;
        storage $storage:ident;
        fields $fields_trait:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq)]
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: $fty,)+
        }

        /// In-sandbox form. The guest sees exactly this layout.
        #[repr(C)]
        $vis struct $repr<B: $crate::runtime::SandboxBackend> {
            $($fvis $field: <$fty as $crate::SandboxRepr<B>>::Repr,)+
        }

        impl<B: $crate::runtime::SandboxBackend> ::core::clone::Clone for $repr<B> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<B: $crate::runtime::SandboxBackend> ::core::marker::Copy for $repr<B> {}

        /// What a host-held `Tainted` of this record carries.
        $vis struct $storage<B: $crate::runtime::SandboxBackend> {
            $($fvis $field: <$fty as $crate::SandboxRepr<B>>::Storage,)+
        }

        impl<B: $crate::runtime::SandboxBackend> ::core::clone::Clone for $storage<B> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<B: $crate::runtime::SandboxBackend> ::core::marker::Copy for $storage<B> {}

        impl<B: $crate::runtime::SandboxBackend> ::core::fmt::Debug for $storage<B>
        where
            $(<$fty as $crate::SandboxRepr<B>>::Storage: ::core::fmt::Debug,)+
        {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_struct(::core::stringify!($storage))
                    $(.field(::core::stringify!($field), &self.$field))+
                    .finish()
            }
        }

        impl<B: $crate::runtime::SandboxBackend> $crate::SandboxRepr<B> for $name {
            type Repr = $repr<B>;
            type Storage = $storage<B>;

            fn to_repr(storage: Self::Storage) -> Self::Repr {
                $repr {
                    $($field: <$fty as $crate::SandboxRepr<B>>::to_repr(storage.$field),)+
                }
            }

            fn from_repr(repr: Self::Repr, origin: $crate::SandboxId) -> Self::Storage {
                $storage {
                    $($field: <$fty as $crate::SandboxRepr<B>>::from_repr(repr.$field, origin),)+
                }
            }

            fn origin(storage: &Self::Storage) -> $crate::SandboxId {
                let origin = $crate::SandboxId::NONE;
                $(
                    let origin =
                        origin.join(<$fty as $crate::SandboxRepr<B>>::origin(&storage.$field));
                )+
                origin
            }
        }

        impl<B: $crate::runtime::SandboxBackend> $crate::HostCopy<B> for $name
        where
            $($fty: $crate::HostCopy<B>,)+
        {
            fn to_host(storage: Self::Storage) -> Self {
                $name {
                    $($field: <$fty as $crate::HostCopy<B>>::to_host(storage.$field),)+
                }
            }

            fn from_host(value: Self) -> Self::Storage {
                $storage {
                    $($field: <$fty as $crate::HostCopy<B>>::from_host(value.$field),)+
                }
            }
        }

        /// Per-field projection out of a tainted record.
        $vis trait $fields_trait<B: $crate::runtime::SandboxBackend> {
            /// The tainted form one field projects to.
            type Out<F: $crate::SandboxRepr<B>>;

            $(fn $field(&self) -> Self::Out<$fty>;)+
        }

        impl<B: $crate::runtime::SandboxBackend> $fields_trait<B> for $crate::Tainted<$name, B> {
            type Out<F: $crate::SandboxRepr<B>> = $crate::Tainted<F, B>;

            $(
                fn $field(&self) -> $crate::Tainted<$fty, B> {
                    $crate::Tainted::from_storage(self.storage().$field)
                }
            )+
        }

        impl<'s, B: $crate::runtime::SandboxBackend> $fields_trait<B>
            for $crate::TaintedVolatile<'s, $name, B>
        {
            type Out<F: $crate::SandboxRepr<B>> = $crate::TaintedVolatile<'s, F, B>;

            $(
                fn $field(&self) -> $crate::TaintedVolatile<'s, $fty, B> {
                    self.project::<$fty>(::core::mem::offset_of!($repr<B>, $field))
                }
            )+
        }
    };
}
