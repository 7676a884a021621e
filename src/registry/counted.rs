use std::{
    borrow::Cow,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use super::{DebugTag, Registry, sealed};

// === Counted === //

/// A [`Registry`] which counts outstanding references with a single atomic integer.
///
/// Violations report how many references were outstanding but not where they came from. Use
/// [`Tracked`](super::Tracked) to find out.
#[derive(Debug, Default)]
pub struct Counted {
    refs: AtomicUsize,
}

impl sealed::Sealed for Counted {}

impl Registry for Counted {
    type Node = ();

    const NAME: &'static str = "counted";

    fn register(&self, tag: DebugTag) -> Self::Node {
        _ = tag;

        // New references are only ever derived from an owner or an existing reference, both of
        // which already keep the referent alive.
        self.refs.fetch_add(1, Relaxed);
    }

    unsafe fn deregister(&self, node: Self::Node) {
        _ = node;

        // Pairs with the `Acquire` load in `outstanding` so that an owner observing a zero count
        // also observes every access made through the reference being released here.
        let prev = self.refs.fetch_sub(1, Release);
        debug_assert_ne!(prev, 0, "deregistered more references than were registered");
    }

    unsafe fn relabel(&self, node: &Self::Node, label: Cow<'static, str>) {
        _ = (node, label);
    }

    fn outstanding(&self) -> usize {
        self.refs.load(Acquire)
    }

    fn outstanding_tags(&self) -> Option<Vec<DebugTag>> {
        None
    }
}
