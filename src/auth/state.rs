//! Authentication state trait and macro.

use crate::auth::TokenResolver;

/// Trait for state types that can resolve request credentials.
pub trait HasAuthBackend {
    fn resolver(&self) -> &TokenResolver;
}

/// Macro to implement `HasAuthBackend` for state structs with the standard field.
///
/// The struct must have a `resolver: Arc<TokenResolver>` field.
///
/// # Example
/// ```ignore
/// use crate::impl_has_auth_backend;
///
/// #[derive(Clone)]
/// pub struct MyState {
///     pub resolver: Arc<TokenResolver>,
///     // ... other fields
/// }
///
/// impl_has_auth_backend!(MyState);
/// ```
#[macro_export]
macro_rules! impl_has_auth_backend {
    ($state_type:ty) => {
        impl $crate::auth::HasAuthBackend for $state_type {
            fn resolver(&self) -> &$crate::auth::TokenResolver {
                &self.resolver
            }
        }
    };
}
