use std::{
    fmt::Write as _,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::{DebugTag, Registry};

// === DanglingRefError === //

/// Reported when an owner is dropped while [`WeakRef`](crate::WeakRef)s to it are still alive.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error(
    "value of type `{type_name}` was dropped while {outstanding} weak reference(s) to it were still alive{}",
    format_references(.references)
)]
pub struct DanglingRefError {
    /// The type name of the dropped owner's value.
    pub type_name: &'static str,

    /// The number of references outstanding at the time of the drop.
    pub outstanding: usize,

    /// Where each outstanding reference was created, most recent first. This is only populated
    /// under the [`Tracked`](crate::Tracked) strategy.
    pub references: Vec<DebugTag>,
}

fn format_references(references: &[DebugTag]) -> String {
    let mut out = String::new();

    for (i, tag) in references.iter().enumerate() {
        let sep = if i == 0 { "; created at: " } else { ", " };
        _ = write!(out, "{sep}{tag}");
    }

    out
}

// === FailureHandler === //

/// A callback invoked whenever a [`DanglingRefError`] is detected.
pub type FailureHandler = Arc<dyn Fn(&DanglingRefError) + Send + Sync>;

static FAILURE_HANDLER: LazyLock<Mutex<FailureHandler>> = LazyLock::new(|| {
    let handler: FailureHandler = Arc::new(default_failure_handler);
    Mutex::new(handler)
});

fn handler_slot() -> MutexGuard<'static, FailureHandler> {
    // Handlers are never invoked while the slot is locked so poisoning cannot leave it torn.
    FAILURE_HANDLER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// The handler installed at startup. It panics with a clone of the [`DanglingRefError`] as the
/// payload, which [`catch_unwind`](std::panic::catch_unwind) callers can downcast to recover it.
/// This aborts the process if the program is built with `panic = "abort"` or is already unwinding.
pub fn default_failure_handler(err: &DanglingRefError) {
    std::panic::panic_any(err.clone());
}

/// Installs `handler` as the process-wide failure handler.
///
/// The new handler is used for every violation detected after this call returns. A violation
/// already being reported on another thread keeps using the handler it started with.
pub fn set_failure_handler(handler: impl Fn(&DanglingRefError) + Send + Sync + 'static) {
    _ = replace_failure_handler(handler);
}

/// Installs `handler` as the process-wide failure handler, returning the previous one.
pub fn replace_failure_handler(
    handler: impl Fn(&DanglingRefError) + Send + Sync + 'static,
) -> FailureHandler {
    replace_failure_handler_arc(Arc::new(handler))
}

fn replace_failure_handler_arc(handler: FailureHandler) -> FailureHandler {
    log::debug!("replacing dangling reference failure handler");

    std::mem::replace(&mut *handler_slot(), handler)
}

/// Fetches the current process-wide failure handler.
pub fn get_failure_handler() -> FailureHandler {
    handler_slot().clone()
}

/// Restores the [`default_failure_handler`].
pub fn reset_failure_handler() {
    set_failure_handler(default_failure_handler);
}

/// Installs `handler` until the returned guard is dropped, at which point the handler which was
/// active before the call is restored.
///
/// The handler is still process-wide while installed. Violations on other threads see it too.
#[must_use]
pub fn scoped_failure_handler(
    handler: impl Fn(&DanglingRefError) + Send + Sync + 'static,
) -> impl Sized {
    let prev = replace_failure_handler(handler);

    scopeguard::guard(prev, |prev| {
        _ = replace_failure_handler_arc(prev);
    })
}

// === Reporting === //

/// Reports a violation for an owner of a `type_name` value whose `registry` still has outstanding
/// references. The handler is invoked exactly once.
pub(crate) fn report_violation<R: Registry>(registry: &R, type_name: &'static str) {
    let err = DanglingRefError {
        type_name,
        outstanding: registry.outstanding(),
        references: registry.outstanding_tags().unwrap_or_default(),
    };

    log::error!("{err} ({} registry)", R::NAME);

    // Clone the handler out of the slot so that it may replace itself without deadlocking.
    let handler = get_failure_handler();
    handler(&err);
}
