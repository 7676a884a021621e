use std::{any::type_name, fmt, marker::PhantomData, mem::ManuallyDrop, ops::Deref, ptr::NonNull};

use crate::{ActiveRegistry, DebugTag, Registry, WeakRef, failure::report_violation};

// === Referable === //

/// An owning box whose value can be referred to by [`WeakRef`]s.
///
/// The value and its [`Registry`] live together in a single heap allocation, so moving the
/// `Referable` itself never invalidates the references taken against it. Dropping a `Referable`
/// while references to it are still alive reports a [`DanglingRefError`](crate::DanglingRefError)
/// through the process-wide [failure handler](crate::set_failure_handler). The allocation is then
/// leaked rather than freed so that the surviving references keep pointing to a valid value.
///
/// ```
/// use referable::{Counted, Referable, WeakRef};
///
/// let owner = Referable::<u32, Counted>::new(1);
/// let handle = WeakRef::new(&owner);
///
/// assert_eq!(*handle, 1);
/// assert_eq!(owner.outstanding_refs(), 1);
///
/// drop(handle);
/// assert_eq!(Referable::try_unwrap(owner).ok(), Some(1));
/// ```
pub struct Referable<T, R: Registry = ActiveRegistry> {
    slot: NonNull<Slot<T, R>>,
    _ty: PhantomData<Slot<T, R>>,
}

struct Slot<T, R> {
    registry: R,
    value: T,
}

// SAFETY: a `Referable` owns its slot exactly like a `Box` would. Registries are always `Send` and
// `Sync`.
unsafe impl<T: Send, R: Registry> Send for Referable<T, R> {}

// SAFETY: see above.
unsafe impl<T: Sync, R: Registry> Sync for Referable<T, R> {}

impl<T: fmt::Debug, R: Registry> fmt::Debug for Referable<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Referable")
            .field("value", &**self)
            .field("outstanding_refs", &self.outstanding_refs())
            .finish()
    }
}

impl<T: Default, R: Registry> Default for Referable<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, R: Registry> From<T> for Referable<T, R> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Clone, R: Registry> Clone for Referable<T, R> {
    /// Copies the value into a new owner. References to `self` are not carried over: the copy
    /// starts out unreferenced.
    fn clone(&self) -> Self {
        Self::new((**self).clone())
    }
}

impl<T, R: Registry> Deref for Referable<T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.slot().value
    }
}

impl<T, R: Registry> Referable<T, R> {
    pub fn new(value: T) -> Self {
        let slot = Box::new(Slot {
            registry: R::default(),
            value,
        });

        Self {
            slot: NonNull::from(Box::leak(slot)),
            _ty: PhantomData,
        }
    }

    fn slot(&self) -> &Slot<T, R> {
        // SAFETY: the slot is only freed by `drop` and `try_unwrap`, both of which consume `self`.
        unsafe { self.slot.as_ref() }
    }

    pub(crate) fn registry(&self) -> &R {
        &self.slot().registry
    }

    /// Borrows the value mutably if, and only if, no [`WeakRef`] is currently observing it.
    ///
    /// Under the [`Untracked`](crate::Untracked) strategy this always succeeds.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.outstanding_refs() != 0 {
            return None;
        }

        // SAFETY: we have exclusive access to the owner and nothing else refers to the value.
        Some(unsafe { &mut self.slot.as_mut().value })
    }

    /// Moves the value out of its owner, failing if any [`WeakRef`] still refers to it.
    pub fn try_unwrap(me: Self) -> Result<T, Self> {
        if me.outstanding_refs() != 0 {
            return Err(me);
        }

        let me = ManuallyDrop::new(me);

        // SAFETY: the slot was allocated by `Box` in `new` and `me` will never touch it again.
        let slot = unsafe { Box::from_raw(me.slot.as_ptr()) };

        Ok(slot.value)
    }

    /// The number of [`WeakRef`]s currently bound to this owner, projections included.
    pub fn outstanding_refs(&self) -> usize {
        self.registry().outstanding()
    }

    /// Where each outstanding [`WeakRef`] was created, most recent first, if the active strategy
    /// records it.
    pub fn outstanding_tags(&self) -> Option<Vec<DebugTag>> {
        self.registry().outstanding_tags()
    }

    /// Creates a [`WeakRef`] to the owned value.
    #[track_caller]
    pub fn weak_ref(&self) -> WeakRef<T, R> {
        WeakRef::new(self)
    }

    /// Creates a [`WeakRef`] to some part of the owned value. The reference counts against this
    /// owner.
    #[track_caller]
    pub fn project<U: ?Sized>(&self, f: impl FnOnce(&T) -> &U) -> WeakRef<U, R> {
        WeakRef::project(self, f)
    }
}

impl<T, R: Registry> Drop for Referable<T, R> {
    fn drop(&mut self) {
        if self.outstanding_refs() != 0 {
            // The slot is leaked: outstanding references may still dereference the value and must
            // be able to deregister themselves once they are dropped.
            report_violation(self.registry(), type_name::<T>());
            return;
        }

        // SAFETY: the slot was allocated by `Box` in `new` and nothing refers to it anymore.
        drop(unsafe { Box::from_raw(self.slot.as_ptr()) });
    }
}
