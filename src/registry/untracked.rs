use std::borrow::Cow;

use super::{DebugTag, Registry, sealed};

// === Untracked === //

/// A [`Registry`] which does no bookkeeping whatsoever.
///
/// Handles bound under this strategy cost exactly as much as a raw pointer, but owners never detect
/// that they are being dropped while still referenced. Dereferencing a handle whose owner is gone
/// is then undefined behavior. Only use this strategy for binaries which have already been
/// exercised under [`Counted`](super::Counted) or [`Tracked`](super::Tracked).
#[derive(Debug, Default, Copy, Clone)]
pub struct Untracked;

impl sealed::Sealed for Untracked {}

impl Registry for Untracked {
    type Node = ();

    const NAME: &'static str = "untracked";

    fn register(&self, tag: DebugTag) -> Self::Node {
        _ = tag;
    }

    unsafe fn deregister(&self, node: Self::Node) {
        _ = node;
    }

    unsafe fn relabel(&self, node: &Self::Node, label: Cow<'static, str>) {
        _ = (node, label);
    }

    fn outstanding(&self) -> usize {
        0
    }

    fn outstanding_tags(&self) -> Option<Vec<DebugTag>> {
        None
    }
}
