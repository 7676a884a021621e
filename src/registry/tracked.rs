use std::{
    borrow::Cow,
    fmt,
    ptr::NonNull,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{DebugTag, Registry, sealed};

// === Tracked === //

/// A [`Registry`] which keeps an intrusive list of every outstanding reference.
///
/// Each bound reference owns one heap-allocated list node recording its [`DebugTag`]. Registering
/// and deregistering splice that node in and out of the list under a mutex in constant time. When
/// an owner is dropped while still referenced, the violation lists every offending reference.
#[derive(Default)]
pub struct Tracked {
    list: Mutex<NodeList>,
}

#[derive(Default)]
struct NodeList {
    /// The most recently registered node.
    head: Option<NonNull<ListNode>>,

    /// The number of nodes reachable from `head`.
    len: usize,
}

// SAFETY: the nodes reachable from a `NodeList` are only ever read or written while the `Mutex`
// wrapping that list is held.
unsafe impl Send for NodeList {}

struct ListNode {
    prev: Option<NonNull<ListNode>>,
    next: Option<NonNull<ListNode>>,
    tag: DebugTag,
}

impl fmt::Debug for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl Tracked {
    fn lock(&self) -> MutexGuard<'_, NodeList> {
        // No code panics while holding this lock so a poisoned list is still consistent.
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl sealed::Sealed for Tracked {}

impl Registry for Tracked {
    type Node = TrackedNode;

    const NAME: &'static str = "tracked";

    fn register(&self, tag: DebugTag) -> Self::Node {
        log::trace!("registering weak reference created at {tag}");

        let node = NonNull::from(Box::leak(Box::new(ListNode {
            prev: None,
            next: None,
            tag,
        })));

        let mut list = self.lock();

        // SAFETY: `node` was just allocated and every other node in the list is only accessed
        // while the lock is held, which it is.
        unsafe {
            (*node.as_ptr()).next = list.head;

            if let Some(head) = list.head {
                (*head.as_ptr()).prev = Some(node);
            }
        }

        list.head = Some(node);
        list.len += 1;

        TrackedNode(node)
    }

    unsafe fn deregister(&self, node: Self::Node) {
        let node = node.0;

        {
            let mut list = self.lock();

            // SAFETY: the caller guarantees that `node` is linked into this list. We hold the
            // lock, so we may rewrite it and its neighbors.
            unsafe {
                let prev = (*node.as_ptr()).prev;
                let next = (*node.as_ptr()).next;

                match prev {
                    Some(prev) => (*prev.as_ptr()).next = next,
                    None => list.head = next,
                }

                if let Some(next) = next {
                    (*next.as_ptr()).prev = prev;
                }
            }

            list.len -= 1;
        }

        log::trace!(
            "deregistered weak reference created at {}",
            // SAFETY: the node is unlinked so nobody else can observe it anymore.
            unsafe { &(*node.as_ptr()).tag },
        );

        // SAFETY: the node was allocated by `Box` in `register` and is now unreachable from the
        // list. The `TrackedNode` owning it was consumed by this call.
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    unsafe fn relabel(&self, node: &Self::Node, label: Cow<'static, str>) {
        let _list = self.lock();

        // SAFETY: the caller guarantees that `node` is still linked into this list and other
        // threads only read its tag while holding the lock.
        unsafe { (*node.0.as_ptr()).tag.label = Some(label) };
    }

    fn outstanding(&self) -> usize {
        self.lock().len
    }

    fn outstanding_tags(&self) -> Option<Vec<DebugTag>> {
        let list = self.lock();
        let mut tags = Vec::with_capacity(list.len);
        let mut cursor = list.head;

        while let Some(node) = cursor {
            // SAFETY: linked nodes stay allocated while linked and we hold the lock.
            let node = unsafe { node.as_ref() };

            tags.push(node.tag.clone());
            cursor = node.next;
        }

        Some(tags)
    }
}

// === TrackedNode === //

/// The list node a [`WeakRef`](crate::WeakRef) owns while registered with a [`Tracked`] registry.
pub struct TrackedNode(NonNull<ListNode>);

// SAFETY: the pointee is only accessed by the `Tracked` registry the node was registered with and
// only while that registry's lock is held.
unsafe impl Send for TrackedNode {}

// SAFETY: see above. `TrackedNode` exposes no access to its pointee.
unsafe impl Sync for TrackedNode {}

impl fmt::Debug for TrackedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedNode").field(&self.0).finish()
    }
}
