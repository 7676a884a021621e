use std::{borrow::Cow, fmt, panic::Location};

mod counted;
pub use self::counted::*;

mod tracked;
pub use self::tracked::*;

mod untracked;
pub use self::untracked::*;

// === ActiveRegistry === //

cfg_if::cfg_if! {
    if #[cfg(feature = "tracked")] {
        /// The [`Registry`] strategy selected for this build.
        ///
        /// Chosen through the `tracked`, `counted` and `untracked` cargo features. Because
        /// features unify additively, the most diagnostic strategy enabled anywhere in the
        /// dependency graph wins. With no feature enabled, builds with `debug_assertions` use
        /// [`Tracked`] and all other builds use [`Counted`].
        pub type ActiveRegistry = Tracked;
    } else if #[cfg(feature = "counted")] {
        /// The [`Registry`] strategy selected for this build.
        ///
        /// See the crate-level documentation for how the strategy is chosen.
        pub type ActiveRegistry = Counted;
    } else if #[cfg(feature = "untracked")] {
        /// The [`Registry`] strategy selected for this build.
        ///
        /// See the crate-level documentation for how the strategy is chosen.
        pub type ActiveRegistry = Untracked;
    } else if #[cfg(debug_assertions)] {
        /// The [`Registry`] strategy selected for this build.
        ///
        /// See the crate-level documentation for how the strategy is chosen.
        pub type ActiveRegistry = Tracked;
    } else {
        /// The [`Registry`] strategy selected for this build.
        ///
        /// See the crate-level documentation for how the strategy is chosen.
        pub type ActiveRegistry = Counted;
    }
}

// === Registry === //

mod sealed {
    pub trait Sealed {}
}

/// Per-owner bookkeeping of the [`WeakRef`](crate::WeakRef)s currently bound to that owner.
///
/// This trait is sealed. Its three implementations trade diagnostics for speed:
///
/// - [`Untracked`] does no bookkeeping at all and never reports a violation.
/// - [`Counted`] keeps an atomic count of outstanding references.
/// - [`Tracked`] keeps a list of every outstanding reference alongside the [`DebugTag`] recorded
///   when it was created.
///
pub trait Registry: 'static + Send + Sync + Default + fmt::Debug + sealed::Sealed {
    /// The bookkeeping a single bound reference carries around with it.
    type Node: fmt::Debug + Send + Sync;

    /// A short name for the strategy, used in diagnostics.
    const NAME: &'static str;

    /// Records a new outstanding reference.
    fn register(&self, tag: DebugTag) -> Self::Node;

    /// Forgets an outstanding reference.
    ///
    /// ## Safety
    ///
    /// `node` must have been returned by [`register`](Registry::register) on this same registry.
    ///
    unsafe fn deregister(&self, node: Self::Node);

    /// Replaces the label of an outstanding reference's [`DebugTag`].
    ///
    /// ## Safety
    ///
    /// `node` must have been returned by [`register`](Registry::register) on this same registry
    /// and must not have been deregistered yet.
    ///
    unsafe fn relabel(&self, node: &Self::Node, label: Cow<'static, str>);

    /// The number of outstanding references.
    fn outstanding(&self) -> usize;

    /// The tags of every outstanding reference, most recently registered first, or `None` if the
    /// strategy does not retain them.
    fn outstanding_tags(&self) -> Option<Vec<DebugTag>>;
}

// === DebugTag === //

/// Creation metadata attached to a reference: where it was created and, optionally, a label.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DebugTag {
    location: &'static Location<'static>,
    label: Option<Cow<'static, str>>,
}

impl fmt::Display for DebugTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{label} ({})", self.location),
            None => self.location.fmt(f),
        }
    }
}

impl DebugTag {
    /// A tag pointing at the caller's source location.
    #[track_caller]
    pub fn caller() -> Self {
        Self {
            location: Location::caller(),
            label: None,
        }
    }

    /// Attaches a human-readable label, replacing any previous one.
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The source location the reference was created at.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// The label attached with [`with_label`](DebugTag::with_label), if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
