use std::{
    fmt, mem, panic,
    pin::pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering::*},
    },
    thread,
};

use derive_where::derive_where;

use crate::{
    Counted, DanglingRefError, DebugTag, RefAnchor, Referable, Registry, SelfReferencing, Tracked,
    Untracked, WeakRef, get_failure_handler, reset_failure_handler, scoped_failure_handler,
    self_referencing, set_failure_handler,
};

// === Helpers === //

/// Serializes every test which installs a failure handler or causes a violation.
static HANDLER_LOCK: Mutex<()> = Mutex::new(());

fn lock_handler() -> MutexGuard<'static, ()> {
    _ = env_logger::builder().is_test(true).try_init();

    HANDLER_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn capture_violations<O>(f: impl FnOnce() -> O) -> (O, Vec<DanglingRefError>) {
    let _lock = lock_handler();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let output = {
        let seen = seen.clone();
        let _handler = scoped_failure_handler(move |err| {
            seen.lock().unwrap().push(err.clone());
        });

        f()
    };

    let seen = mem::take(&mut *seen.lock().unwrap());
    (output, seen)
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    a: i32,
    b: f32,
}

#[derive_where(Clone)]
struct Widget<R: Registry> {
    i: i32,
    anchor: RefAnchor<R>,
}

// SAFETY: `anchor` is a field of `Widget`.
unsafe impl<R: Registry> SelfReferencing for Widget<R> {
    type Registry = R;

    fn ref_anchor(&self) -> &RefAnchor<R> {
        &self.anchor
    }
}

impl<R: Registry> Widget<R> {
    fn new(i: i32) -> Self {
        Self {
            i,
            anchor: RefAnchor::new(),
        }
    }
}

// === Tracking strategies === //

fn fresh_owner_is_unreferenced<R: Registry>() {
    let owner = Referable::<i32, R>::new(1);
    assert_eq!(owner.outstanding_refs(), 0);

    let owner = Referable::<String, R>::default();
    assert_eq!(owner.outstanding_refs(), 0);
    assert_eq!(*owner, "");
}

fn handle_derefs_to_value<R: Registry>() {
    let owner = Referable::<i32, R>::new(1);
    let handle = WeakRef::new(&owner);

    assert_eq!(*handle, 1);
    assert_eq!(owner.outstanding_refs(), 1);

    drop(handle);
    assert_eq!(owner.outstanding_refs(), 0);
}

fn handles_count_up_and_down<R: Registry>() {
    let owner = Referable::<u64, R>::new(7);
    let mut handles = (0..10).map(|_| owner.weak_ref()).collect::<Vec<_>>();

    assert_eq!(owner.outstanding_refs(), 10);

    while let Some(handle) = handles.pop() {
        assert_eq!(*handle, 7);
        drop(handle);
        assert_eq!(owner.outstanding_refs(), handles.len());
    }
}

fn projection_counts_against_owner<R: Registry>() {
    let owner = Referable::<Record, R>::new(Record { a: 2, b: 5.0 });

    let whole = owner.weak_ref();
    let a = owner.project(|r| &r.a);

    assert_eq!(owner.outstanding_refs(), 2);
    assert_eq!(*a, 2);
    assert_eq!(whole.b, 5.0);

    let b = whole.clone().map(|r| &r.b);
    assert_eq!(*b, 5.0);
    assert_eq!(owner.outstanding_refs(), 3);

    drop((whole, a, b));
    assert_eq!(owner.outstanding_refs(), 0);
}

fn clone_and_drop_adjust_count<R: Registry>() {
    let owner = Referable::<i32, R>::new(1);

    let h1 = owner.weak_ref();
    let h2 = h1.clone();

    assert_eq!(owner.outstanding_refs(), 2);
    assert!(h1.ptr_eq(&h2));
    assert_eq!(*h1, 1);

    drop(h1);
    assert_eq!(owner.outstanding_refs(), 1);

    drop(h2);
    assert_eq!(owner.outstanding_refs(), 0);
}

fn dropping_referenced_owner_reports_once<R: Registry>() {
    let (handles, violations) = capture_violations(|| {
        let owner = Referable::<i32, R>::new(1);
        let handles = (0..3).map(|_| owner.weak_ref()).collect::<Vec<_>>();

        drop(owner);
        handles
    });

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].outstanding, 3);
    assert_eq!(violations[0].type_name, "i32");

    // The owner leaked its value so the survivors still see it.
    assert!(handles.iter().all(|h| **h == 1));
}

fn self_referencing_value_hands_out_refs<R: Registry>() {
    let widget = pin!(Widget::<R>::new(5));

    let handle = widget.as_ref().ref_from_this();
    assert_eq!(handle.i, 5);
    assert_eq!(widget.outstanding_refs(), 1);

    let field = WeakRef::project_pinned(widget.as_ref(), |w| &w.i);
    assert_eq!(*field, 5);
    assert_eq!(widget.outstanding_refs(), 2);

    drop(handle);
    drop(field);
    assert_eq!(widget.outstanding_refs(), 0);
}

fn cloned_self_referencing_value_starts_fresh<R: Registry>() {
    let widget = pin!(Widget::<R>::new(3));
    let handle = WeakRef::from_pinned(widget.as_ref());

    let copy = (*widget).clone();
    assert_eq!(copy.i, 3);
    assert_eq!(copy.outstanding_refs(), 0);
    assert_eq!(widget.outstanding_refs(), 1);

    drop(handle);
}

fn dropping_referenced_anchor_reports<R: Registry>() {
    let (handle, violations) = capture_violations(|| {
        let widget = Box::pin(Widget::<R>::new(1));
        let handle = widget.as_ref().ref_from_this();

        drop(widget);
        handle
    });

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].outstanding, 1);
    assert!(violations[0].type_name.contains("Widget"));

    // Memory reusing the widget's allocation must survive the last reference going away.
    let filler = vec![0xAAu8; mem::size_of::<Widget<R>>()];
    drop(handle);
    assert!(filler.iter().all(|&byte| byte == 0xAA));
}

fn take_transfers_registration<R: Registry>() {
    let owner = Referable::<i32, R>::new(1);

    let mut h1 = owner.weak_ref();
    let before = owner.outstanding_refs();

    let h2 = h1.take();
    assert!(h1.is_empty());
    assert!(!h2.is_empty());
    assert_eq!(owner.outstanding_refs(), before);

    let h3 = h2;
    assert_eq!(*h3, 1);
    assert_eq!(owner.outstanding_refs(), before);

    drop(h1);
    assert_eq!(owner.outstanding_refs(), before);
}

fn reset_and_reassignment<R: Registry>() {
    let first = Referable::<i32, R>::new(1);
    let second = Referable::<i32, R>::new(2);

    let mut handle = first.weak_ref();
    handle.reset();
    assert!(handle.is_empty());
    assert!(handle.get().is_none());
    assert_eq!(first.outstanding_refs(), 0);

    handle = second.weak_ref();
    assert_eq!(second.outstanding_refs(), 1);

    handle = first.weak_ref();
    assert_eq!(*handle, 1);
    assert_eq!(first.outstanding_refs(), 1);
    assert_eq!(second.outstanding_refs(), 0);

    let mut other = second.weak_ref();
    other.clone_from(&handle);
    assert_eq!(*other, 1);
    assert_eq!(first.outstanding_refs(), 2);
    assert_eq!(second.outstanding_refs(), 0);
}

fn empty_handles_are_inert<R: Registry>() {
    let empty = WeakRef::<i32, R>::empty();

    assert!(empty.is_empty());
    assert!(empty.get().is_none());
    assert!(empty.as_ptr().is_none());
    assert!(empty.clone().is_empty());
    assert!(empty.ptr_eq(&WeakRef::<i32, R>::default()));
    assert!(empty.map(|v| v).is_empty());
}

fn owner_access_requires_no_refs<R: Registry>() {
    let mut owner = Referable::<Vec<u32>, R>::new(vec![1]);

    owner.get_mut().unwrap().push(2);

    let handle = owner.weak_ref();
    assert!(owner.get_mut().is_none());

    let owner = Referable::try_unwrap(owner).unwrap_err();
    assert_eq!(*handle, [1, 2]);

    drop(handle);
    assert_eq!(Referable::try_unwrap(owner).unwrap(), [1, 2]);
}

fn cloned_owner_starts_unreferenced<R: Registry>() {
    let owner = Referable::<Record, R>::new(Record { a: 1, b: 2.0 });
    let handle = owner.weak_ref();

    let copy = owner.clone();
    assert_eq!(*copy, *owner);
    assert_eq!(copy.outstanding_refs(), 0);
    assert_eq!(owner.outstanding_refs(), 1);

    drop(handle);
}

fn handles_convert_to_trait_objects<R: Registry>() {
    let owner = Referable::<i32, R>::new(42);
    let handle: WeakRef<dyn fmt::Debug, R> = owner.weak_ref().map(|v| v as &dyn fmt::Debug);

    assert_eq!(format!("{:?}", &*handle), "42");
    assert_eq!(owner.outstanding_refs(), 1);
}

fn concurrent_clones_balance<R: Registry>() {
    let owner = Referable::<Vec<u32>, R>::new(vec![1, 2, 3]);
    let handle = owner.weak_ref();

    thread::scope(|s| {
        for _ in 0..8 {
            let mine = handle.clone();

            s.spawn(move || {
                for _ in 0..1000 {
                    let copy = mine.clone();
                    assert_eq!(copy.len(), 3);
                }
            });
        }
    });

    assert_eq!(owner.outstanding_refs(), 1);
}

macro_rules! tracking_tests {
    ($($module:ident: $registry:ty),*$(,)?) => {$(
        mod $module {
            use super::*;

            type R = $registry;

            #[test]
            fn fresh_owner_is_unreferenced() {
                super::fresh_owner_is_unreferenced::<R>();
            }

            #[test]
            fn handle_derefs_to_value() {
                super::handle_derefs_to_value::<R>();
            }

            #[test]
            fn handles_count_up_and_down() {
                super::handles_count_up_and_down::<R>();
            }

            #[test]
            fn projection_counts_against_owner() {
                super::projection_counts_against_owner::<R>();
            }

            #[test]
            fn clone_and_drop_adjust_count() {
                super::clone_and_drop_adjust_count::<R>();
            }

            #[test]
            fn dropping_referenced_owner_reports_once() {
                super::dropping_referenced_owner_reports_once::<R>();
            }

            #[test]
            fn self_referencing_value_hands_out_refs() {
                super::self_referencing_value_hands_out_refs::<R>();
            }

            #[test]
            fn cloned_self_referencing_value_starts_fresh() {
                super::cloned_self_referencing_value_starts_fresh::<R>();
            }

            #[test]
            fn dropping_referenced_anchor_reports() {
                super::dropping_referenced_anchor_reports::<R>();
            }

            #[test]
            fn take_transfers_registration() {
                super::take_transfers_registration::<R>();
            }

            #[test]
            fn reset_and_reassignment() {
                super::reset_and_reassignment::<R>();
            }

            #[test]
            fn empty_handles_are_inert() {
                super::empty_handles_are_inert::<R>();
            }

            #[test]
            fn owner_access_requires_no_refs() {
                super::owner_access_requires_no_refs::<R>();
            }

            #[test]
            fn cloned_owner_starts_unreferenced() {
                super::cloned_owner_starts_unreferenced::<R>();
            }

            #[test]
            fn handles_convert_to_trait_objects() {
                super::handles_convert_to_trait_objects::<R>();
            }

            #[test]
            fn concurrent_clones_balance() {
                super::concurrent_clones_balance::<R>();
            }
        }
    )*};
}

tracking_tests!(counted: Counted, tracked: Tracked);

// === Tracked === //

#[test]
fn tracked_tags_name_live_refs() {
    let owner = Referable::<i32, Tracked>::new(0);

    let (a, line_a) = (owner.weak_ref(), line!());
    let (b, line_b) = (a.clone(), line!());
    let c = owner.weak_ref().with_label("c");

    let tags = owner.outstanding_tags().unwrap();
    assert_eq!(tags.len(), 3);
    assert_eq!(tags[0].label(), Some("c"));
    assert_eq!(tags[1].location().line(), line_b);
    assert_eq!(tags[2].location().line(), line_a);
    assert!(tags.iter().all(|tag| tag.location().file() == file!()));

    drop(b);

    let lines = owner
        .outstanding_tags()
        .unwrap()
        .iter()
        .map(|tag| tag.location().line())
        .collect::<Vec<_>>();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], line_a);

    drop((a, c));
    assert_eq!(owner.outstanding_tags(), Some(Vec::new()));
}

#[test]
fn tracked_registry_unlinks_from_the_middle() {
    let registry = Tracked::default();

    let first = registry.register(DebugTag::caller().with_label("first"));
    let second = registry.register(DebugTag::caller().with_label("second"));
    let third = registry.register(DebugTag::caller().with_label("third"));

    let labels = |registry: &Tracked| {
        registry
            .outstanding_tags()
            .unwrap()
            .iter()
            .map(|tag| tag.label().unwrap().to_string())
            .collect::<Vec<_>>()
    };

    assert_eq!(labels(&registry), ["third", "second", "first"]);

    // SAFETY: every node was registered with `registry`.
    unsafe { registry.deregister(second) };
    assert_eq!(labels(&registry), ["third", "first"]);
    assert_eq!(registry.outstanding(), 2);

    // SAFETY: see above.
    unsafe { registry.deregister(third) };
    assert_eq!(labels(&registry), ["first"]);

    // SAFETY: see above.
    unsafe { registry.deregister(first) };
    assert_eq!(registry.outstanding(), 0);
    assert_eq!(registry.outstanding_tags(), Some(Vec::new()));
}

#[test]
fn tracked_violation_lists_references() {
    let (handle, violations) = capture_violations(|| {
        let owner = Referable::<i32, Tracked>::new(1);
        let handle = owner.weak_ref().with_label("observer");

        drop(owner);
        handle
    });

    assert_eq!(violations.len(), 1);

    let err = &violations[0];
    assert_eq!(err.references.len(), 1);
    assert_eq!(err.references[0].label(), Some("observer"));

    let message = err.to_string();
    assert!(message.contains("1 weak reference(s)"));
    assert!(message.contains("observer"));

    drop(handle);
}

#[test]
fn counted_violation_has_no_references() {
    let (handle, violations) = capture_violations(|| {
        let owner = Referable::<i32, Counted>::new(1);
        let handle = owner.weak_ref().with_label("ignored");

        assert_eq!(owner.outstanding_tags(), None);

        drop(owner);
        handle
    });

    assert_eq!(violations.len(), 1);
    assert!(violations[0].references.is_empty());

    drop(handle);
}

// === Untracked === //

#[test]
fn untracked_never_reports() {
    let (handle, violations) = capture_violations(|| {
        let owner = Referable::<i32, Untracked>::new(1);
        let handle = owner.weak_ref();

        assert_eq!(*handle, 1);
        assert_eq!(owner.outstanding_refs(), 0);
        assert_eq!(owner.outstanding_tags(), None);

        drop(owner);
        handle
    });

    assert!(violations.is_empty());

    // The target is gone. Never dereference it.
    mem::forget(handle);
}

#[test]
fn untracked_anchor_never_reports() {
    let ((), violations) = capture_violations(|| {
        let widget = Box::pin(Widget::<Untracked>::new(1));
        let handle = widget.as_ref().ref_from_this();

        assert_eq!(widget.outstanding_refs(), 0);

        drop(widget);
        drop(handle);
    });

    assert!(violations.is_empty());
}

// === Macros === //

struct Gadget {
    name: &'static str,
    anchor: RefAnchor<Tracked>,
}

self_referencing!(Gadget => anchor: Tracked);

#[test]
fn macro_implements_self_referencing() {
    let gadget = pin!(Gadget {
        name: "gizmo",
        anchor: RefAnchor::new(),
    });

    let (handle, line) = (gadget.as_ref().ref_from_this(), line!());
    assert_eq!(handle.name, "gizmo");

    let tags = gadget.anchor.outstanding_tags().unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].location().line(), line);

    drop(handle);
    assert_eq!(gadget.outstanding_refs(), 0);
}

#[test]
#[should_panic(expected = "attempted to dereference an empty `WeakRef`")]
fn dereferencing_empty_handle_panics() {
    let handle = WeakRef::<i32, Counted>::empty();
    _ = *handle;
}

// === Failure handler === //

#[test]
fn default_handler_panics_with_diagnostic() {
    let _lock = lock_handler();
    reset_failure_handler();

    let result = panic::catch_unwind(|| {
        let owner = Referable::<i32, Counted>::new(1);
        let handle = owner.weak_ref();

        drop(owner);
        handle
    });

    let payload = result.unwrap_err();
    let err = payload.downcast_ref::<DanglingRefError>().unwrap();

    assert_eq!(err.type_name, "i32");
    assert_eq!(err.outstanding, 1);
    assert!(err.references.is_empty());
}

#[test]
fn default_handler_unwinds_past_anchor_refs() {
    let _lock = lock_handler();
    reset_failure_handler();

    let result = panic::catch_unwind(|| {
        let widget = Box::pin(Widget::<Tracked>::new(1));
        let _handle = widget.as_ref().ref_from_this().with_label("survivor");

        // Unwinding drops `_handle` after the widget is gone.
        drop(widget);
    });

    let payload = result.unwrap_err();
    let err = payload.downcast_ref::<DanglingRefError>().unwrap();

    assert!(err.type_name.contains("Widget"));
    assert_eq!(err.references.len(), 1);
    assert_eq!(err.references[0].label(), Some("survivor"));
}

#[test]
fn scoped_handler_restores_previous() {
    let _lock = lock_handler();

    let before = get_failure_handler();
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = calls.clone();
        let _guard = scoped_failure_handler(move |_| {
            calls.fetch_add(1, Relaxed);
        });

        let current = get_failure_handler();
        assert!(!Arc::ptr_eq(&before, &current));

        current(&DanglingRefError {
            type_name: "u8",
            outstanding: 1,
            references: Vec::new(),
        });
    }

    assert_eq!(calls.load(Relaxed), 1);
    assert!(Arc::ptr_eq(&before, &get_failure_handler()));
}

#[test]
fn handler_may_replace_itself() {
    let _lock = lock_handler();

    let before = get_failure_handler();
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = calls.clone();
        let _guard = scoped_failure_handler(move |_| {
            let calls = calls.clone();
            calls.fetch_add(1, Relaxed);

            set_failure_handler(move |_| {
                calls.fetch_add(10, Relaxed);
            });
        });

        for _ in 0..2 {
            let owner = Referable::<i32, Counted>::new(1);
            let handle = owner.weak_ref();

            drop(owner);
            drop(handle);
        }
    }

    assert_eq!(calls.load(Relaxed), 11);
    assert!(Arc::ptr_eq(&before, &get_failure_handler()));
}

#[test]
fn error_lists_references_in_order() {
    let first = DebugTag::caller().with_label("first");
    let second = DebugTag::caller();

    let err = DanglingRefError {
        type_name: "alloc::string::String",
        outstanding: 2,
        references: vec![first.clone(), second.clone()],
    };

    assert_eq!(
        err.to_string(),
        format!(
            "value of type `alloc::string::String` was dropped while 2 weak reference(s) to it \
             were still alive; created at: first ({}), {}",
            first.location(),
            second.location(),
        ),
    );
}
