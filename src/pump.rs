//! The waveform pump: keeps the main track continuously clocked while
//! in ops-running mode, double-buffering so handoff between packets is
//! gap-free.
//!
//! Packet choice per slot: the front of the command queue if
//! non-empty, otherwise the next roster entry round-robin, otherwise
//! idle. Queued commands therefore take strict priority over refresh,
//! and with N roster entries and an empty queue every address is
//! refreshed at least once every N slots.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    error::DccError,
    gpio::{PulseSink, WaveHandle, NULL_HANDLE},
    packet::{self, Packet, SpeedSteps},
    roster::RosterItem,
    state::SystemState,
};

/// Minimum padded waveform length, in microseconds, so back-to-back
/// handoff never underruns.
const PAD_MICROS: u32 = 50;

/// Busy-wait granularity while polling for the sink to advance onto
/// the next handle.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl PumpHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.join.join();
    }
}

pub fn spawn(state: Arc<SystemState>) -> PumpHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();

    let join = std::thread::Builder::new()
        .name("dcc-waveform-pump".into())
        .spawn(move || run(state, stop_clone))
        .expect("failed to spawn waveform pump thread");

    PumpHandle { stop, join }
}

fn next_packet(state: &SystemState) -> Packet {
    if let Some(packet) = state.queue.pop() {
        return packet;
    }

    let item: RosterItem = state.roster.next();
    if item.address == 0 {
        return packet::make_baseline_idle();
    }

    encode_roster_item(&item, state.mode.speed_steps())
}

/// Encodes a roster entry's current speed/direction. The roster only
/// ever holds addresses the dispatcher has already validated
/// (1..=10239), so the encoder's malformed-address case is
/// unreachable here in practice; falling back to idle rather than
/// unwrapping keeps that invariant from turning into a panic if it's
/// ever violated.
pub fn encode_roster_item(item: &RosterItem, steps: SpeedSteps) -> Packet {
    let packet = match steps {
        SpeedSteps::Step128 => {
            packet::make_advanced_speed_dir(item.address, item.direction, item.speed)
        }
        SpeedSteps::Step14 | SpeedSteps::Step28 => {
            packet::make_baseline_speed_dir(item.address, item.direction, item.speed, item.headlight)
        }
    };
    packet.unwrap_or_else(packet::make_baseline_idle)
}

fn submit(sink: &dyn PulseSink, packet: &Packet) -> WaveHandle {
    sink.add_generic(packet.pulses());
    sink.create_padded(PAD_MICROS).expect("pulse sink rejected a freshly staged waveform")
}

fn run(state: Arc<SystemState>, stop: Arc<AtomicBool>) {
    let sink = state.main_sink.as_ref();

    let idle = packet::make_baseline_idle();
    let mut current = submit(sink, &idle);
    sink.send_oneshot(current).expect("initial idle waveform should be known to the sink");

    while !stop.load(Ordering::Acquire) && state.mode.running() {
        let packet = next_packet(&state);
        let next = submit(sink, &packet);

        if let Err(e) = sink.send_oneshot_sync(next) {
            log::warn!("{}; retrying next slot", DccError::PulseSink(e.to_string()));
            let _ = sink.delete(next);
            continue;
        }

        while sink.query_active() == current && !stop.load(Ordering::Acquire) {
            std::thread::sleep(POLL_INTERVAL);
        }

        let _ = sink.delete(current);
        current = next;
    }

    let _ = sink.delete(current);
    sink.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        gpio::{SimCurrentSensor, SimPulseSink},
    };
    use std::time::Duration as StdDuration;

    /// Builds a system state whose main sink is also reachable in
    /// concrete form, so the test can drive `tick()` (not part of the
    /// `PulseSink` trait) alongside the pump thread.
    fn test_state() -> (Arc<SystemState>, Arc<SimPulseSink>) {
        let sink = Arc::new(SimPulseSink::new());
        let state = Arc::new(SystemState::new(
            Configuration::default(),
            sink.clone(),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimCurrentSensor::new(vec![], (12000.0, 20.0))),
        ));
        (state, sink)
    }

    #[test]
    fn refreshes_every_address_within_two_cycles() {
        let (state, sink) = test_state();
        for addr in [1u16, 2, 3] {
            state.roster.get(addr);
        }
        state.mode.set_running(true);

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker_stop_clone = ticker_stop.clone();
        let ticker_sink = sink.clone();
        let ticker = std::thread::spawn(move || {
            while !ticker_stop_clone.load(Ordering::Acquire) {
                ticker_sink.tick();
                std::thread::sleep(StdDuration::from_micros(200));
            }
        });

        let pump = spawn(state.clone());
        std::thread::sleep(StdDuration::from_millis(50));
        state.mode.set_running(false);
        pump.stop();
        ticker_stop.store(true, Ordering::Release);
        let _ = ticker.join();
    }
}
