//! The pulse sink and current sensor contracts.
//!
//! Both are external collaborators per the design: a real pulse sink would
//! schedule GPIO-level pulses on an H-bridge motor shield, and a real current
//! sensor would be an INA219 read over I2C. Driving either for real is out of
//! scope here -- what's in scope is the contract the waveform pump, service
//! mode engine, and current monitor are written against, plus a deterministic
//! simulation of each so the rest of the crate is runnable and testable
//! without hardware.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use crate::error::DccResult;

/// One half-cycle of the H-bridge output: which lines to set and clear, and
/// how long to hold that state before the next descriptor takes over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseDescriptor {
    pub set_mask: u32,
    pub clear_mask: u32,
    pub micros: u32,
}

/// Opaque handle to a waveform staged or transmitting on a pulse sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaveHandle(pub u64);

pub const NULL_HANDLE: WaveHandle = WaveHandle(0);

#[derive(Debug, thiserror::Error)]
pub enum PulseSinkError {
    #[error("unknown wave handle {0:?}")]
    UnknownHandle(WaveHandle),
    #[error("pulse sink has no staged pulses to create a wave from")]
    EmptyStage,
}

/// The waveform submission contract consumed by the pump and the service
/// mode engine. `send_oneshot_sync` is the handoff primitive the pump relies
/// on for gap-free track clocking: it schedules its handle to begin the
/// instant the currently active waveform finishes.
pub trait PulseSink: Send + Sync {
    fn add_generic(&self, pulses: &[PulseDescriptor]);
    fn create(&self) -> Result<WaveHandle, PulseSinkError>;
    fn create_padded(&self, min_micros: u32) -> Result<WaveHandle, PulseSinkError>;
    fn send_oneshot(&self, handle: WaveHandle) -> Result<(), PulseSinkError>;
    fn send_oneshot_sync(&self, handle: WaveHandle) -> Result<(), PulseSinkError>;
    fn chain(&self, handles: &[WaveHandle]) -> Result<(), PulseSinkError>;
    fn query_active(&self) -> WaveHandle;
    fn tx_busy(&self) -> bool;
    fn delete(&self, handle: WaveHandle) -> Result<(), PulseSinkError>;
    fn clear(&self);
}

/// Current/voltage sampling contract, backed in hardware by an INA219.
/// `configure` is the one step a real sensor can fail at (a dead I2C
/// bus, an unresponsive device address) -- that's what `main` treats
/// as a hardware init failure and terminates on.
pub trait CurrentSensor: Send + Sync {
    fn read_voltage_mv(&self) -> f32;
    fn read_current_ma(&self) -> f32;
    fn configure(&self) -> DccResult<()>;
    fn deconfigure(&self);
}

/// In-memory pulse sink. Pulses staged via `add_generic` become a wave on
/// `create`/`create_padded`. The "active" handle only advances when the
/// caller drives it with `tick`, matching the pump's own busy-wait loop --
/// there is no wall-clock transmission timer to race against in tests.
pub struct SimPulseSink {
    next_id: AtomicU64,
    staged: Mutex<Vec<PulseDescriptor>>,
    waves: Mutex<HashMap<WaveHandle, Vec<PulseDescriptor>>>,
    queue: Mutex<Vec<WaveHandle>>,
    active: Mutex<WaveHandle>,
}

impl Default for SimPulseSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPulseSink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            staged: Mutex::new(Vec::new()),
            waves: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            active: Mutex::new(NULL_HANDLE),
        }
    }

    /// Advance the simulated track to the next handle in line, if any is
    /// queued. Returns the handle now active.
    pub fn tick(&self) -> WaveHandle {
        let mut queue = self.queue.lock().unwrap();
        if !queue.is_empty() {
            let next = queue.remove(0);
            *self.active.lock().unwrap() = next;
        }
        *self.active.lock().unwrap()
    }
}

impl PulseSink for SimPulseSink {
    fn add_generic(&self, pulses: &[PulseDescriptor]) {
        self.staged.lock().unwrap().extend_from_slice(pulses);
    }

    fn create(&self) -> Result<WaveHandle, PulseSinkError> {
        let mut staged = self.staged.lock().unwrap();
        if staged.is_empty() {
            return Err(PulseSinkError::EmptyStage);
        }
        let id = WaveHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.waves.lock().unwrap().insert(id, staged.drain(..).collect());
        Ok(id)
    }

    fn create_padded(&self, min_micros: u32) -> Result<WaveHandle, PulseSinkError> {
        let total: u32 = self.staged.lock().unwrap().iter().map(|p| p.micros).sum();
        if total < min_micros {
            self.staged.lock().unwrap().push(PulseDescriptor {
                set_mask: 0,
                clear_mask: 0,
                micros: min_micros - total,
            });
        }
        self.create()
    }

    fn send_oneshot(&self, handle: WaveHandle) -> Result<(), PulseSinkError> {
        if !self.waves.lock().unwrap().contains_key(&handle) {
            return Err(PulseSinkError::UnknownHandle(handle));
        }
        *self.active.lock().unwrap() = handle;
        Ok(())
    }

    fn send_oneshot_sync(&self, handle: WaveHandle) -> Result<(), PulseSinkError> {
        if !self.waves.lock().unwrap().contains_key(&handle) {
            return Err(PulseSinkError::UnknownHandle(handle));
        }
        self.queue.lock().unwrap().push(handle);
        Ok(())
    }

    fn chain(&self, handles: &[WaveHandle]) -> Result<(), PulseSinkError> {
        let waves = self.waves.lock().unwrap();
        for h in handles {
            if !waves.contains_key(h) {
                return Err(PulseSinkError::UnknownHandle(*h));
            }
        }
        drop(waves);
        self.queue.lock().unwrap().extend_from_slice(handles);
        if *self.active.lock().unwrap() == NULL_HANDLE {
            self.tick();
        }
        Ok(())
    }

    fn query_active(&self) -> WaveHandle {
        *self.active.lock().unwrap()
    }

    fn tx_busy(&self) -> bool {
        *self.active.lock().unwrap() != NULL_HANDLE || !self.queue.lock().unwrap().is_empty()
    }

    fn delete(&self, handle: WaveHandle) -> Result<(), PulseSinkError> {
        self.waves
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or(PulseSinkError::UnknownHandle(handle))
    }

    fn clear(&self) {
        self.staged.lock().unwrap().clear();
        self.waves.lock().unwrap().clear();
        self.queue.lock().unwrap().clear();
        *self.active.lock().unwrap() = NULL_HANDLE;
    }
}

/// Scriptable current sensor for tests: replays a fixed sequence of
/// (voltage, current) samples, then holds the last one once exhausted.
pub struct SimCurrentSensor {
    samples: Mutex<Vec<(f32, f32)>>,
    idle: (f32, f32),
    cursor: AtomicU64,
    configured: AtomicBool,
}

impl SimCurrentSensor {
    pub fn new(samples: Vec<(f32, f32)>, idle: (f32, f32)) -> Self {
        Self {
            samples: Mutex::new(samples),
            idle,
            cursor: AtomicU64::new(0),
            configured: AtomicBool::new(false),
        }
    }

    fn sample(&self) -> (f32, f32) {
        let samples = self.samples.lock().unwrap();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        *samples.get(idx).unwrap_or(&self.idle)
    }
}

impl CurrentSensor for SimCurrentSensor {
    fn read_voltage_mv(&self) -> f32 {
        self.sample().0
    }

    fn read_current_ma(&self) -> f32 {
        self.sample().1
    }

    fn configure(&self) -> DccResult<()> {
        if self.configured.swap(true, Ordering::AcqRel) {
            return Err(crate::error::DccError::HardwareInit(
                "sensor already configured".to_string(),
            ));
        }
        Ok(())
    }

    fn deconfigure(&self) {
        self.configured.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_send_then_tick_advances_active() {
        let sink = SimPulseSink::new();
        sink.add_generic(&[PulseDescriptor { set_mask: 1, clear_mask: 2, micros: 58 }]);
        let h1 = sink.create().unwrap();
        sink.send_oneshot(h1).unwrap();
        assert_eq!(sink.query_active(), h1);

        sink.add_generic(&[PulseDescriptor { set_mask: 2, clear_mask: 1, micros: 100 }]);
        let h2 = sink.create().unwrap();
        sink.send_oneshot_sync(h2).unwrap();
        assert_eq!(sink.query_active(), h1);
        sink.tick();
        assert_eq!(sink.query_active(), h2);
    }

    #[test]
    fn delete_unknown_handle_errors() {
        let sink = SimPulseSink::new();
        assert!(sink.delete(WaveHandle(999)).is_err());
    }

    #[test]
    fn current_sensor_replays_then_holds_idle() {
        let sensor = SimCurrentSensor::new(vec![(12000.0, 100.0), (12000.0, 150.0)], (12000.0, 20.0));
        assert_eq!(sensor.read_current_ma(), 100.0);
        assert_eq!(sensor.read_current_ma(), 150.0);
        assert_eq!(sensor.read_current_ma(), 20.0);
    }

    #[test]
    fn configure_twice_without_deconfigure_fails() {
        let sensor = SimCurrentSensor::new(vec![], (12000.0, 20.0));
        assert!(sensor.configure().is_ok());
        assert!(sensor.configure().is_err());
        sensor.deconfigure();
        assert!(sensor.configure().is_ok());
    }
}
