use std::{any::Any, sync::Arc};

/// Safe runtime narrowing of a payload to a more specific type.
///
/// `of_type::<U>()` delivers a value exactly when `narrow` returns `Some`.
/// For open hierarchies carried as [`AnyArgs`](super::AnyArgs) this is an
/// `Arc::downcast`; closed hierarchies (enums) implement it per variant, so a
/// value whose variant belongs to the requested family is delivered even
/// though its own type is wider.
///
/// ```rust
/// use mvvm_rx::event::Narrow;
///
/// #[derive(Clone, Debug, PartialEq)]
/// enum Lifecycle {
///   Activated(u32),
///   Deactivated,
/// }
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Activated(u32);
///
/// impl Narrow<Activated> for Lifecycle {
///   fn narrow(&self) -> Option<Activated> {
///     match self {
///       Lifecycle::Activated(n) => Some(Activated(*n)),
///       _ => None,
///     }
///   }
/// }
///
/// assert_eq!(Lifecycle::Activated(3).narrow(), Some(Activated(3)));
/// assert_eq!(Narrow::<Activated>::narrow(&Lifecycle::Deactivated), None);
/// ```
pub trait Narrow<U> {
  fn narrow(&self) -> Option<U>;
}

impl<U: Any + Send + Sync> Narrow<Arc<U>> for Arc<dyn Any + Send + Sync> {
  #[inline]
  fn narrow(&self) -> Option<Arc<U>> { self.clone().downcast::<U>().ok() }
}

impl<U, T: Narrow<U>> Narrow<Option<U>> for Option<T> {
  /// `None` passes through as `Some(None)`; a present value must narrow.
  fn narrow(&self) -> Option<Option<U>> {
    match self {
      Some(v) => v.narrow().map(Some),
      None => Some(None),
    }
  }
}
