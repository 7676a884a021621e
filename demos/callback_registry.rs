use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering::Relaxed},
    },
};

use referable::{
    RefAnchor, Referable, SelfReferencing as _, WeakRef, self_referencing, set_failure_handler,
};

// === Bus === //

pub trait Listener: Sync {
    fn on_event(&self, event: &str);
}

#[derive(Default)]
pub struct EventBus {
    listeners: Vec<WeakRef<dyn Listener>>,
}

impl EventBus {
    pub fn subscribe(&mut self, listener: WeakRef<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn unsubscribe_all(&mut self) {
        self.listeners.clear();
    }

    pub fn emit(&self, event: &str) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

// === Listeners === //

pub struct Logger {
    prefix: &'static str,
}

impl Listener for Logger {
    fn on_event(&self, event: &str) {
        log::info!("{}: {event}", self.prefix);
    }
}

pub struct Tally {
    seen: AtomicU32,
    anchor: RefAnchor,
}

self_referencing!(Tally => anchor);

impl Listener for Tally {
    fn on_event(&self, _event: &str) {
        self.seen.fetch_add(1, Relaxed);
    }
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // Count violations instead of panicking.
    let violations = Arc::new(AtomicU32::new(0));
    set_failure_handler({
        let violations = violations.clone();
        move |err| {
            violations.fetch_add(1, Relaxed);
            log::warn!("listener outlived its owner: {err}");
        }
    });

    let mut bus = EventBus::default();

    let logger = Referable::new(Logger { prefix: "logger" });
    bus.subscribe(
        logger
            .weak_ref()
            .map(|l| l as &dyn Listener)
            .with_label("logger subscription"),
    );

    let tally = pin!(Tally {
        seen: AtomicU32::new(0),
        anchor: RefAnchor::new(),
    });
    bus.subscribe(tally.as_ref().ref_from_this().map(|t| t as &dyn Listener));

    bus.emit("started");
    bus.emit("working");

    log::info!(
        "tally saw {} event(s), logger has {} outstanding reference(s)",
        tally.seen.load(Relaxed),
        logger.outstanding_refs(),
    );

    // The bus still refers to the logger. The handler above reports this.
    drop(logger);
    bus.unsubscribe_all();

    log::info!("{} violation(s) reported", violations.load(Relaxed));
}
