use std::{
    any::type_name,
    fmt, hash,
    marker::PhantomPinned,
    pin::Pin,
    ptr::NonNull,
    sync::OnceLock,
};

use crate::{ActiveRegistry, DebugTag, Registry, WeakRef, failure::report_violation};

// === RefAnchor === //

/// A [`Registry`] embedded directly in a value, allowing it to hand out [`WeakRef`]s to itself
/// without being wrapped in a [`Referable`](crate::Referable).
///
/// Add a `RefAnchor` field to your type and implement [`SelfReferencing`] for it, usually through
/// the [`self_referencing!`](crate::self_referencing) macro. Anchors are `!Unpin`: a value
/// embedding one has to be pinned before references to it can be created.
///
/// Cloning an anchor, or a value containing one, produces a fresh anchor with no outstanding
/// references. Anchors compare equal to one another and contribute nothing to hashes so that
/// containing types can keep deriving those traits.
///
/// The registry itself lives in a separate heap allocation. An anchor dropped while still
/// referenced reports the violation and leaks that allocation so surviving references can still
/// deregister. Their targets are gone however: dereferencing them is undefined behavior.
pub struct RefAnchor<R: Registry = ActiveRegistry> {
    registry: NonNull<R>,
    owner_type: OnceLock<&'static str>,
    _pinned: PhantomPinned,
}

// SAFETY: the anchor owns its registry exactly like a `Box` would and registries are always `Send`
// and `Sync`.
unsafe impl<R: Registry> Send for RefAnchor<R> {}

// SAFETY: see above.
unsafe impl<R: Registry> Sync for RefAnchor<R> {}

impl<R: Registry> fmt::Debug for RefAnchor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefAnchor")
            .field("outstanding_refs", &self.outstanding_refs())
            .finish_non_exhaustive()
    }
}

impl<R: Registry> Default for RefAnchor<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Registry> Clone for RefAnchor<R> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<R: Registry> Eq for RefAnchor<R> {}

impl<R: Registry> PartialEq for RefAnchor<R> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<R: Registry> hash::Hash for RefAnchor<R> {
    fn hash<H: hash::Hasher>(&self, _state: &mut H) {}
}

impl<R: Registry> RefAnchor<R> {
    pub fn new() -> Self {
        Self {
            registry: NonNull::from(Box::leak(Box::new(R::default()))),
            owner_type: OnceLock::new(),
            _pinned: PhantomPinned,
        }
    }

    pub(crate) fn registry(&self) -> &R {
        // SAFETY: the registry is only freed by `drop`.
        unsafe { self.registry.as_ref() }
    }

    /// Remembers the type of the value embedding this anchor for diagnostics.
    pub(crate) fn note_owner_type<S: ?Sized>(&self) {
        self.owner_type.get_or_init(type_name::<S>);
    }

    /// The number of [`WeakRef`]s currently bound to the value embedding this anchor.
    pub fn outstanding_refs(&self) -> usize {
        self.registry().outstanding()
    }

    /// Where each outstanding [`WeakRef`] was created, most recent first, if the active strategy
    /// records it.
    pub fn outstanding_tags(&self) -> Option<Vec<DebugTag>> {
        self.registry().outstanding_tags()
    }
}

impl<R: Registry> Drop for RefAnchor<R> {
    fn drop(&mut self) {
        if self.outstanding_refs() == 0 {
            // SAFETY: the registry was allocated by `Box` in `new` and nothing refers to it anymore.
            drop(unsafe { Box::from_raw(self.registry.as_ptr()) });
            return;
        }

        let owner_type = self
            .owner_type
            .get()
            .copied()
            .unwrap_or_else(type_name::<Self>);

        // The registry is leaked: surviving references still deregister from it when dropped.
        report_violation(self.registry(), owner_type);
    }
}

// === SelfReferencing === //

/// A value which embeds a [`RefAnchor`] and can therefore hand out [`WeakRef`]s to itself.
///
/// ## Safety
///
/// [`ref_anchor`](SelfReferencing::ref_anchor) must return a reference to a field of `self`,
/// always the same one. The [`self_referencing!`](crate::self_referencing) macro implements this
/// trait correctly.
///
pub unsafe trait SelfReferencing {
    type Registry: Registry;

    fn ref_anchor(&self) -> &RefAnchor<Self::Registry>;

    /// Creates a [`WeakRef`] to `self`.
    #[track_caller]
    fn ref_from_this(self: Pin<&Self>) -> WeakRef<Self, Self::Registry> {
        WeakRef::project_pinned(self, |v| v)
    }

    /// The number of [`WeakRef`]s currently bound to `self`, projections included.
    fn outstanding_refs(&self) -> usize {
        self.ref_anchor().outstanding_refs()
    }
}

// === Macros === //

#[doc(hidden)]
pub mod anchor_internals {
    pub use crate::{ActiveRegistry, RefAnchor, SelfReferencing};

    pub type RegistryOrActive<R = ActiveRegistry> = R;
}

/// Implements [`SelfReferencing`] for a type by naming its [`RefAnchor`] field.
///
/// ```
/// use std::pin::pin;
///
/// use referable::{Counted, RefAnchor, SelfReferencing as _, self_referencing};
///
/// struct Button {
///     label: String,
///     anchor: RefAnchor<Counted>,
/// }
///
/// self_referencing!(Button => anchor: Counted);
///
/// let button = pin!(Button { label: "OK".to_string(), anchor: RefAnchor::new() });
/// let handle = button.as_ref().ref_from_this();
///
/// assert_eq!(handle.label, "OK");
/// assert_eq!(button.outstanding_refs(), 1);
/// ```
///
/// When the registry type is omitted, the anchor must use the build's
/// [`ActiveRegistry`](crate::ActiveRegistry).
#[macro_export]
macro_rules! self_referencing {
    ( $( $ty:ty => $field:ident $(: $registry:ty)? ),*$(,)? ) => {$(
        // SAFETY: the anchor is a field of the value so it lives, moves and gets pinned along with
        // it.
        unsafe impl $crate::anchor_internals::SelfReferencing for $ty {
            type Registry = $crate::anchor_internals::RegistryOrActive<$($registry)?>;

            fn ref_anchor(&self) -> &$crate::anchor_internals::RefAnchor<Self::Registry> {
                &self.$field
            }
        }
    )*};
}
