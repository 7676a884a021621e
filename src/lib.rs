//! Runtime-checked non-owning references.
//!
//! Sometimes a value is owned by one part of a program and referred to by other, loosely-coupled
//! parts: callback registries, service locators, observer lists. The borrow checker cannot prove
//! that those referrers are gone by the time the owner goes away, and reaching for `Rc` would
//! change who owns the value. This crate keeps the single owner and checks the lifetime boundary
//! at runtime instead.
//!
//! ```
//! use referable::{Referable, WeakRef};
//!
//! #[derive(Debug)]
//! struct Config {
//!     name: &'static str,
//!     retries: u32,
//! }
//!
//! let config = Referable::<Config>::new(Config { name: "primary", retries: 3 });
//!
//! // A reference to the whole value...
//! let whole: WeakRef<Config> = config.weak_ref();
//!
//! // ...and one to a single field. Both count against `config`.
//! let retries: WeakRef<u32> = config.project(|c| &c.retries);
//!
//! assert_eq!(whole.name, "primary");
//! assert_eq!(*retries, 3);
//!
//! // References must be gone before their owner is dropped.
//! drop((whole, retries));
//! drop(config);
//! ```
//!
//! # Owners and references
//!
//! There are two kinds of owner:
//!
//! - [`Referable<T>`] boxes a value of type `T` alongside its bookkeeping. The box can be moved
//!   freely while references to it exist since the value lives on the heap.
//! - Any type embedding a [`RefAnchor`] and implementing [`SelfReferencing`] (most easily through
//!   [`self_referencing!`]) can hand out references to itself. Such values must be [pinned] before
//!   references to them can be created.
//!
//! References are [`WeakRef<T>`]s. They can be empty, cloned, moved, [projected](WeakRef::map) to
//! a part of their target and dereferenced without any liveness check. They never keep their
//! target alive.
//!
//! # Detecting dangling references
//!
//! Every owner carries a [`Registry`] with which each of its bound references registers itself.
//! When an owner is dropped while its registry still reports outstanding references, a
//! [`DanglingRefError`] is passed to the process-wide [failure handler](set_failure_handler)
//! exactly once. The default handler panics.
//!
//! A [`Referable`] reporting a violation leaks its allocation so that its surviving references
//! keep pointing at a valid value. A [`SelfReferencing`] value cannot do the same: its anchor only
//! leaks its registry, so surviving references may still be dropped but never dereferenced.
//!
//! # Strategies
//!
//! Three [`Registry`] implementations are available. Every type in this crate is generic over its
//! registry, which defaults to the build-wide [`ActiveRegistry`].
//!
//! | Strategy      | Cost per reference                  | Diagnostics                        |
//! |---------------|-------------------------------------|------------------------------------|
//! | [`Tracked`]   | one allocation and a mutex splice   | creation site of every reference   |
//! | [`Counted`]   | one atomic increment                | number of references               |
//! | [`Untracked`] | nothing                             | none, violations go undetected     |
//!
//! [`ActiveRegistry`] is selected with the `tracked`, `counted` and `untracked` cargo features.
//! When several are enabled the most diagnostic one wins. When none is, builds with
//! `debug_assertions` use [`Tracked`] and other builds use [`Counted`].
//!
//! [`Untracked`] gives up every guarantee this crate makes. It is meant for release builds of
//! programs which were already validated under one of the other strategies.
//!
//! [pinned]: std::pin

mod anchor;
pub use self::anchor::*;

mod failure;
pub use self::failure::*;

mod referable;
pub use self::referable::*;

pub mod registry;
pub use self::registry::{
    ActiveRegistry, Counted, DebugTag, Registry, Tracked, TrackedNode, Untracked,
};

mod weak_ref;
pub use self::weak_ref::*;

#[cfg(test)]
mod tests;
