//! Collaborators used by view-model style owners.
//!
//! [`EventObserver`] keeps track of observer chains on behalf of an owner and
//! detaches all of them when the owner's scope ends. [`ActionBuffer`]
//! implements keyed debounce: a pending action is replaced by the next one
//! submitted under the same key and only fires once its key has been quiet
//! for the requested delay.

mod action_buffer;
mod event_observer;

pub use action_buffer::ActionBuffer;
pub use event_observer::EventObserver;
