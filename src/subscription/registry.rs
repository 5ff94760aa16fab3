use smallvec::SmallVec;

use super::Disposable;

/// Insertion-ordered container handing out stable ids.
///
/// Used for every callback list in the crate: event-source registrations,
/// cancellation callbacks and child scopes, tracked observers. Ids are never
/// reused, so a stale id can only miss, never remove a newer entry.
///
/// ```rust
/// use mvvm_rx::subscription::Registry;
///
/// let mut callbacks: Registry<&str> = Registry::default();
/// let first = callbacks.add("first");
/// callbacks.add("second");
/// assert_eq!(callbacks.iter().copied().collect::<Vec<_>>(), ["first", "second"]);
///
/// assert_eq!(callbacks.remove(first), Some("first"));
/// assert_eq!(callbacks.remove(first), None);
/// assert_eq!(callbacks.len(), 1);
/// ```
pub struct Registry<U> {
  next_id: usize,
  items: SmallVec<[(usize, U); 2]>,
}

impl<U> Default for Registry<U> {
  fn default() -> Self { Self { next_id: 0, items: SmallVec::new() } }
}

impl<U> Registry<U> {
  #[inline]
  pub fn new() -> Self { Self::default() }

  /// Add an item at the end and return its id.
  #[inline]
  pub fn add(&mut self, item: U) -> usize {
    let id = self.next_id;
    self.next_id += 1;
    self.items.push((id, item));
    id
  }

  /// Remove an item by id, keeping the order of the rest.
  pub fn remove(&mut self, id: usize) -> Option<U> {
    self.items.iter().position(|(i, _)| *i == id).map(|pos| self.items.remove(pos).1)
  }

  #[inline]
  pub fn contains(&self, id: usize) -> bool { self.items.iter().any(|(i, _)| *i == id) }

  #[inline]
  pub fn len(&self) -> usize { self.items.len() }

  #[inline]
  pub fn is_empty(&self) -> bool { self.items.is_empty() }

  /// Drain all items in insertion order.
  #[inline]
  pub fn drain(&mut self) -> impl Iterator<Item = U> + '_ {
    self.items.drain(..).map(|(_, item)| item)
  }

  #[inline]
  pub fn iter(&self) -> impl Iterator<Item = &U> { self.items.iter().map(|(_, item)| item) }

  /// Keep only the items matching `keep`.
  #[inline]
  pub fn retain(&mut self, mut keep: impl FnMut(&U) -> bool) { self.items.retain(|(_, u)| keep(u)) }
}

impl<U: Clone> Registry<U> {
  /// Clone every item out, so the caller can release its lock before using
  /// them.
  pub fn snapshot(&self) -> SmallVec<[U; 4]> { self.iter().cloned().collect() }
}

impl<U: Disposable> Registry<U> {
  /// Dispose every item and clear the container.
  pub fn dispose_all(&mut self) {
    for item in self.drain() {
      item.dispose();
    }
  }

  /// Forget items that were disposed elsewhere.
  pub fn purge_disposed(&mut self) { self.retain(|item| !item.is_disposed()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_are_not_reused() {
    let mut reg = Registry::new();
    let a = reg.add(1);
    assert_eq!(reg.remove(a), Some(1));
    let b = reg.add(2);
    assert_ne!(a, b);
    assert!(!reg.contains(a));
    assert!(reg.contains(b));
  }

  #[test]
  fn removal_keeps_order() {
    let mut reg = Registry::new();
    reg.add('a');
    let b = reg.add('b');
    reg.add('c');
    reg.remove(b);
    assert_eq!(reg.snapshot().as_slice(), &['a', 'c']);
    assert_eq!(reg.drain().collect::<Vec<_>>(), vec!['a', 'c']);
    assert!(reg.is_empty());
  }
}
