use std::{borrow::Cow, fmt, mem, ops::Deref, pin::Pin, ptr::NonNull};

use derive_where::derive_where;

use crate::{ActiveRegistry, DebugTag, Referable, Registry, SelfReferencing};

// === WeakRef === //

/// A non-owning reference to a value held by a [`Referable`] or by a [`SelfReferencing`] value.
///
/// A `WeakRef` never keeps its referent alive. Instead, every bound `WeakRef` is registered with its
/// owner's [`Registry`] and the owner checks that registry when it is dropped. Dropping an owner
/// while `WeakRef`s to it are still alive is a bug which gets reported through the
/// [failure handler](crate::set_failure_handler).
///
/// Dereferencing performs no liveness check. Under the [`Counted`](crate::Counted) and
/// [`Tracked`](crate::Tracked) strategies, the value behind a [`Referable`] remains valid until the
/// last reference to it is dropped, even after a reported violation. This is not true for
/// [`SelfReferencing`] values nor for anything under the [`Untracked`](crate::Untracked) strategy.
///
/// A `WeakRef` may point to any part of its owner's value (see [`WeakRef::project`] and
/// [`WeakRef::map`]) while still counting against that owner.
pub struct WeakRef<T: ?Sized, R: Registry = ActiveRegistry> {
    binding: Option<Binding<T, R>>,
}

#[derive_where(Debug)]
struct Binding<T: ?Sized, R: Registry> {
    target: NonNull<T>,
    registry: NonNull<R>,
    node: R::Node,
}

// SAFETY: a `WeakRef` only ever hands out shared references to its target, just like `&T` would.
// Registries are always `Send` and `Sync` and so are their nodes.
unsafe impl<T: ?Sized + Sync, R: Registry> Send for WeakRef<T, R> {}

// SAFETY: see above.
unsafe impl<T: ?Sized + Sync, R: Registry> Sync for WeakRef<T, R> {}

impl<T: ?Sized, R: Registry> fmt::Debug for WeakRef<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            Some(binding) => f.debug_tuple("WeakRef").field(binding).finish(),
            None => f.write_str("WeakRef(<empty>)"),
        }
    }
}

impl<T: ?Sized, R: Registry> Default for WeakRef<T, R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized, R: Registry> Clone for WeakRef<T, R> {
    #[track_caller]
    fn clone(&self) -> Self {
        match &self.binding {
            // SAFETY: `self` is registered with this registry and so it is still alive.
            Some(binding) => unsafe {
                Self::bind(binding.target, binding.registry.as_ref(), DebugTag::caller())
            },
            None => Self::empty(),
        }
    }
}

impl<T: ?Sized, R: Registry> Drop for WeakRef<T, R> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized, R: Registry> Deref for WeakRef<T, R> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &Self::Target {
        match self.get() {
            Some(target) => target,
            None => panic!("attempted to dereference an empty `WeakRef`"),
        }
    }
}

impl<T, R: Registry> WeakRef<T, R> {
    /// Creates a reference to the value owned by `owner`.
    #[track_caller]
    pub fn new(owner: &Referable<T, R>) -> Self {
        Self::project(owner, |v| v)
    }

    /// Creates a reference to a value which embeds its own [`RefAnchor`](crate::RefAnchor).
    ///
    /// The value must be pinned so that it cannot move out from under the reference.
    #[track_caller]
    pub fn from_pinned(owner: Pin<&T>) -> Self
    where
        T: SelfReferencing<Registry = R>,
    {
        Self::project_pinned(owner, |v| v)
    }
}

impl<T: ?Sized, R: Registry> WeakRef<T, R> {
    /// Creates a reference which refers to nothing and counts against nothing.
    pub const fn empty() -> Self {
        Self { binding: None }
    }

    /// Registers a new reference to `target` with `registry`.
    ///
    /// ## Safety
    ///
    /// `target` must be owned by the owner of `registry`.
    ///
    #[track_caller]
    unsafe fn bind(target: NonNull<T>, registry: &R, tag: DebugTag) -> Self {
        let node = registry.register(tag);

        Self {
            binding: Some(Binding {
                target,
                registry: NonNull::from(registry),
                node,
            }),
        }
    }

    /// Creates a reference to the part of `owner`'s value selected by `f`. The reference counts
    /// against `owner`.
    #[track_caller]
    pub fn project<U>(owner: &Referable<U, R>, f: impl FnOnce(&U) -> &T) -> Self {
        let target = NonNull::from(f(&**owner));

        // SAFETY: `f` can only return references derived from the value it was given or references
        // which outlive it.
        unsafe { Self::bind(target, owner.registry(), DebugTag::caller()) }
    }

    /// Creates a reference to the part of a pinned [`SelfReferencing`] value selected by `f`. The
    /// reference counts against `owner`.
    #[track_caller]
    pub fn project_pinned<S>(owner: Pin<&S>, f: impl FnOnce(&S) -> &T) -> Self
    where
        S: ?Sized + SelfReferencing<Registry = R>,
    {
        let owner = owner.get_ref();
        let anchor = owner.ref_anchor();

        anchor.note_owner_type::<S>();
        let target = NonNull::from(f(owner));

        // SAFETY: see `project`. The anchor is a field of `owner` by the contract of
        // `SelfReferencing` and `owner` is pinned so neither will move before they are dropped.
        unsafe { Self::bind(target, anchor.registry(), DebugTag::caller()) }
    }

    /// Converts this reference into a reference to some part of its target. The registration is
    /// carried over to the new reference as-is.
    ///
    /// This is also how references are converted to references of a supertype, e.g. with
    /// `weak.map(|v| v as &dyn Trait)`. Mapping an empty reference yields an empty reference.
    pub fn map<U: ?Sized>(mut self, f: impl FnOnce(&T) -> &U) -> WeakRef<U, R> {
        let Some(target) = self.get().map(|v| NonNull::from(f(v))) else {
            return WeakRef::empty();
        };

        let Some(Binding { registry, node, .. }) = self.binding.take() else {
            unreachable!();
        };

        WeakRef {
            binding: Some(Binding {
                target,
                registry,
                node,
            }),
        }
    }

    /// Attaches a human-readable label to this reference. It shows up next to the reference's
    /// creation site in [`Tracked`](crate::Tracked) diagnostics and is ignored by other strategies.
    pub fn with_label(self, label: impl Into<Cow<'static, str>>) -> Self {
        if let Some(binding) = &self.binding {
            // SAFETY: the node is registered with this registry, which is still alive since the
            // node is.
            unsafe { binding.registry.as_ref().relabel(&binding.node, label.into()) };
        }

        self
    }

    /// Moves the registration out of `self`, leaving it empty.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Unbinds this reference, deregistering it from its owner.
    pub fn reset(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };

        // SAFETY: the node was registered with this registry by `bind`. The registry is still
        // alive: either its owner is too or the owner leaked it when reporting a violation.
        unsafe { binding.registry.as_ref().deregister(binding.node) };
    }

    /// Returns whether this reference is unbound.
    pub fn is_empty(&self) -> bool {
        self.binding.is_none()
    }

    /// Borrows the target, returning `None` if the reference is empty.
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a bound reference keeps its owner's registry non-empty, which the owner checks
        // before releasing the target.
        self.binding
            .as_ref()
            .map(|binding| unsafe { binding.target.as_ref() })
    }

    /// The address of the target without borrowing it, returning `None` if the reference is empty.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.binding.as_ref().map(|binding| binding.target)
    }

    /// Returns whether both references point to the same address. Two empty references are equal.
    pub fn ptr_eq<U: ?Sized>(&self, other: &WeakRef<U, R>) -> bool {
        self.as_ptr().map(NonNull::cast::<()>) == other.as_ptr().map(NonNull::cast::<()>)
    }
}
