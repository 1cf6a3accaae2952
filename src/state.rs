//! The shared system state: the single struct that owns every resource
//! the dispatcher, waveform pump, and current monitor threads touch.
//!
//! Per the design notes, global mutable state is confined to this one
//! struct rather than spread across process-wide statics. Each
//! long-lived background task gets a clone of the `Arc`-wrapped pieces
//! it needs at spawn time; the dispatcher keeps the only
//! non-`Arc` handle (the `JoinHandle`s), which is what lets it tear
//! threads down on mode exit or shutdown.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Mutex,
};

use crate::{
    config::Configuration,
    gpio::{CurrentSensor, PulseSink},
    packet::SpeedSteps,
    queue::CommandQueue,
    roster::Roster,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    OpsRunning = 1,
    Programming = 2,
}

/// Cloned into the pump and monitor threads; read and written under
/// ordinary `Acquire`/`Release` atomics rather than a mutex since each
/// flag is independent and there's no multi-field invariant to protect.
pub struct ModeFlags {
    running: AtomicBool,
    programming: AtomicBool,
    overload_trip: AtomicBool,
    steps: AtomicU8,
}

impl ModeFlags {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            programming: AtomicBool::new(false),
            overload_trip: AtomicBool::new(false),
            steps: AtomicU8::new(SpeedSteps::Step28.into()),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::Release)
    }

    pub fn programming(&self) -> bool {
        self.programming.load(Ordering::Acquire)
    }

    pub fn set_programming(&self, val: bool) {
        self.programming.store(val, Ordering::Release)
    }

    pub fn overload_tripped(&self) -> bool {
        self.overload_trip.load(Ordering::Acquire)
    }

    pub fn trip_overload(&self) {
        self.overload_trip.store(true, Ordering::Release)
    }

    pub fn clear_overload(&self) {
        self.overload_trip.store(false, Ordering::Release)
    }

    pub fn mode(&self) -> Mode {
        if self.overload_trip.load(Ordering::Acquire) {
            return Mode::Idle;
        }
        if self.programming() {
            Mode::Programming
        } else if self.running() {
            Mode::OpsRunning
        } else {
            Mode::Idle
        }
    }

    pub fn speed_steps(&self) -> SpeedSteps {
        SpeedSteps::try_from(self.steps.load(Ordering::Acquire)).unwrap_or(SpeedSteps::Step28)
    }

    pub fn set_speed_steps(&self, steps: SpeedSteps) {
        self.steps.store(steps.into(), Ordering::Release)
    }
}

/// The current monitor's sample cadence, in milliseconds. Shared
/// between the monitor (which reads it each loop) and the service mode
/// engine (which raises it for the duration of a CV probe).
pub struct Cadence {
    millis: Mutex<f32>,
}

impl Cadence {
    fn new(default_ms: f32) -> Self {
        Self { millis: Mutex::new(default_ms) }
    }

    pub fn get(&self) -> f32 {
        *self.millis.lock().unwrap()
    }

    pub fn set(&self, ms: f32) {
        *self.millis.lock().unwrap() = ms;
    }
}

/// Latest voltage/current reading published by the current monitor.
#[derive(Default)]
pub struct LastReading {
    inner: Mutex<(f32, f32)>,
}

impl LastReading {
    pub fn get(&self) -> (f32, f32) {
        *self.inner.lock().unwrap()
    }

    pub fn set(&self, voltage_mv: f32, current_ma: f32) {
        *self.inner.lock().unwrap() = (voltage_mv, current_ma);
    }
}

pub const SLOW_CADENCE_MS: f32 = 500.0;
pub const FAST_CADENCE_MS: f32 = 1.0;

pub struct SystemState {
    pub config: Configuration,
    pub queue: Arc<CommandQueue>,
    pub roster: Arc<Roster>,
    pub main_sink: Arc<dyn PulseSink>,
    pub prog_sink: Arc<dyn PulseSink>,
    pub sensor: Arc<dyn CurrentSensor>,
    pub mode: Arc<ModeFlags>,
    pub cadence: Arc<Cadence>,
    pub reading: Arc<LastReading>,

    pub pump: Mutex<Option<crate::pump::PumpHandle>>,
    pub monitor: Mutex<Option<crate::monitor::MonitorHandle>>,
}

impl SystemState {
    pub fn new(
        config: Configuration,
        main_sink: Arc<dyn PulseSink>,
        prog_sink: Arc<dyn PulseSink>,
        sensor: Arc<dyn CurrentSensor>,
    ) -> Self {
        Self {
            config,
            queue: Arc::new(CommandQueue::new()),
            roster: Arc::new(Roster::new()),
            main_sink,
            prog_sink,
            sensor,
            mode: Arc::new(ModeFlags::new()),
            cadence: Arc::new(Cadence::new(SLOW_CADENCE_MS)),
            reading: Arc::new(LastReading::default()),
            pump: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }
}
