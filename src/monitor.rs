//! The current monitor: a background sampler that republishes
//! voltage/current, watches for overload, and (when enabled) mirrors
//! every sample to the UDP log stream.
//!
//! Cadence is adaptive: a slow idle rate most of the time, and a fast
//! 1 ms rate while the service mode engine is walking CV bits. The
//! sleep between samples subtracts the time the sample itself took, so
//! a slow `read_current_ma()` doesn't silently stretch the cadence.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{state::SystemState, udplog::UdpLog};

/// Consecutive over-threshold samples required to declare overload,
/// matching the original's three-strikes check.
const OVERLOAD_STRIKES: u32 = 3;

/// Floor on the adaptive sleep, so a near-zero read latency never spins
/// the thread.
const CADENCE_FLOOR_MS: f32 = 2.0;

pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.join.join();
    }
}

pub fn spawn(state: Arc<SystemState>, udplog: Option<Arc<UdpLog>>) -> MonitorHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();

    let join = std::thread::Builder::new()
        .name("dcc-current-monitor".into())
        .spawn(move || run(state, stop_clone, udplog))
        .expect("failed to spawn current monitor thread");

    MonitorHandle { stop, join }
}

fn run(state: Arc<SystemState>, stop: Arc<AtomicBool>, udplog: Option<Arc<UdpLog>>) {
    let mut strikes = 0u32;

    while !stop.load(Ordering::Acquire) {
        let tick_start = Instant::now();

        let voltage_mv = state.sensor.read_voltage_mv();
        let current_ma = state.sensor.read_current_ma();
        state.reading.set(voltage_mv, current_ma);

        if let Some(log) = &udplog {
            log.send_current(current_ma);
        }

        if current_ma > state.config.overloadthreshold {
            strikes += 1;
        } else {
            strikes = 0;
        }

        if strikes >= OVERLOAD_STRIKES && !state.mode.overload_tripped() {
            log::error!("track current {current_ma:.1} mA exceeded overload threshold; tripping");
            state.mode.trip_overload();
            state.mode.set_running(false);
            state.mode.set_programming(false);
            if let Some(log) = &udplog {
                log.send_event("overload trip");
            }
        }

        let cadence_ms = state.cadence.get();
        let elapsed_ms = tick_start.elapsed().as_secs_f32() * 1000.0;
        let sleep_ms = (cadence_ms - elapsed_ms).max(CADENCE_FLOOR_MS);
        std::thread::sleep(Duration::from_secs_f32(sleep_ms / 1000.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        gpio::{SimCurrentSensor, SimPulseSink},
    };

    fn test_state(samples: Vec<(f32, f32)>, threshold: f32) -> Arc<SystemState> {
        let mut config = Configuration::default();
        config.overloadthreshold = threshold;
        Arc::new(SystemState::new(
            config,
            Arc::new(SimPulseSink::new()),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimCurrentSensor::new(samples, (12000.0, 20.0))),
        ))
    }

    #[test]
    fn three_consecutive_overloads_trip() {
        let state = test_state(vec![(12000.0, 5000.0); 10], 3000.0);
        state.cadence.set(1.0);
        state.mode.set_running(true);
        let handle = spawn(state.clone(), None);
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert!(state.mode.overload_tripped());
        assert!(!state.mode.running());
    }

    #[test]
    fn normal_current_never_trips() {
        let state = test_state(vec![(12000.0, 100.0); 50], 3000.0);
        state.cadence.set(1.0);
        let handle = spawn(state.clone(), None);
        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
        assert!(!state.mode.overload_tripped());
    }
}
