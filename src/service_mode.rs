//! Service-mode CV read/write on the programming track, per S-9.2.3.
//!
//! Reading a CV never asks the decoder to report a byte directly --
//! DCC has no return channel outside of current draw. Instead we probe
//! each bit (and then the whole byte) and watch for the decoder's
//! acknowledgment: a current spike held for several milliseconds.
//! "Quiescent" current is established from the power-up chain before
//! any probing starts, so later acknowledgments are judged relative to
//! this decoder's own baseline rather than a fixed absolute.

use std::sync::Arc;

use crate::{
    gpio::{PulseSink, WaveHandle},
    packet::{self, Packet},
    state::{Cadence, SystemState, FAST_CADENCE_MS, SLOW_CADENCE_MS},
};

/// Resets issued before the first probe, to let the decoder settle
/// onto the programming track.
const POWER_UP_RESETS: usize = 20;

/// Reset/probe framing for a single bit or byte probe:
/// 3 resets, 5 probes, 6 trailing resets (the trailing resets cover the
/// decoder's ~6 ms acknowledgment window per S-9.2.3).
const PROBE_LEADING_RESETS: usize = 3;
const PROBE_REPEATS: usize = 5;
const PROBE_TRAILING_RESETS: usize = 6;

const BIT_VERIFY_ATTEMPTS: usize = 3;

pub struct ServiceModeEngine {
    state: Arc<SystemState>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvReadResult {
    pub value: Option<u8>,
}

impl ServiceModeEngine {
    pub fn new(state: Arc<SystemState>) -> Self {
        Self { state }
    }

    fn sink(&self) -> &dyn PulseSink {
        self.state.prog_sink.as_ref()
    }

    fn cadence(&self) -> &Cadence {
        &self.state.cadence
    }

    /// Transmits `chain` packets back to back over the programming
    /// track, sampling current at the monitor's current cadence
    /// throughout, and returns the samples collected.
    fn transmit_chain_sampling(&self, chain: &[Packet]) -> Vec<f32> {
        let sink = self.sink();
        let handles: Vec<WaveHandle> = chain
            .iter()
            .map(|p| {
                sink.add_generic(p.pulses());
                sink.create().expect("service mode packet failed to stage")
            })
            .collect();

        sink.chain(&handles).expect("service mode chain rejected by sink");

        let mut samples = Vec::new();
        let poll_ms = self.cadence().get().max(1.0);
        while sink.tx_busy() {
            samples.push(self.state.sensor.read_current_ma());
            std::thread::sleep(std::time::Duration::from_secs_f32(poll_ms / 1000.0));
        }

        for h in handles {
            let _ = sink.delete(h);
        }

        samples
    }

    fn power_up(&self) -> f32 {
        let chain: Vec<Packet> = std::iter::repeat_with(packet::make_baseline_reset)
            .take(POWER_UP_RESETS)
            .collect();

        let samples = self.transmit_chain_sampling(&chain);
        let tail_len = self.state.config.samplecount.min(samples.len());
        let tail = &samples[samples.len().saturating_sub(tail_len)..];
        tail.iter().cloned().fold(0.0_f32, f32::max)
    }

    fn probe_chain(&self, probe: Packet) -> Vec<f32> {
        let mut chain = Vec::with_capacity(PROBE_LEADING_RESETS + PROBE_REPEATS + PROBE_TRAILING_RESETS);
        for _ in 0..PROBE_LEADING_RESETS {
            chain.push(packet::make_baseline_reset());
        }
        for _ in 0..PROBE_REPEATS {
            chain.push(probe.clone());
        }
        for _ in 0..PROBE_TRAILING_RESETS {
            chain.push(packet::make_baseline_reset());
        }
        self.transmit_chain_sampling(&chain)
    }

    fn write_chain(&self, write: Packet) {
        let mut chain = Vec::with_capacity(PROBE_LEADING_RESETS + PROBE_REPEATS + PROBE_TRAILING_RESETS + 1);
        for _ in 0..PROBE_LEADING_RESETS {
            chain.push(packet::make_baseline_reset());
        }
        for _ in 0..PROBE_REPEATS {
            chain.push(write.clone());
        }
        for _ in 0..PROBE_TRAILING_RESETS {
            chain.push(packet::make_baseline_reset());
        }
        let _ = self.transmit_chain_sampling(&chain);
    }

    fn acked(&self, samples: &[f32], quiescent: f32) -> bool {
        let ack_limit = self.state.config.acklimit;
        let ack_min = self.state.config.ackmin;
        let tail_len = self.state.config.samplecount.min(samples.len());
        let tail = &samples[samples.len().saturating_sub(tail_len)..];
        let over = tail.iter().filter(|c| **c > quiescent + ack_limit).count();
        over >= ack_min
    }

    /// Blind service-mode write (no acknowledgment interpreted): used
    /// by the dispatcher's `W` command.
    pub fn write_cv(&self, cv: u16, value: u8) {
        self.cadence().set(FAST_CADENCE_MS);
        let write = packet::make_service_write_byte(cv, value);
        self.write_chain(write);
        self.cadence().set(SLOW_CADENCE_MS);
    }

    /// Full CV read: power-up, bit-verify walk, byte-verify
    /// confirmation, up to [`BIT_VERIFY_ATTEMPTS`] tries.
    pub fn read_cv(&self, cv: u16) -> CvReadResult {
        self.cadence().set(FAST_CADENCE_MS);

        let quiescent = self.power_up();

        let mut result = None;
        for _ in 0..BIT_VERIFY_ATTEMPTS {
            if let Some(value) = self.bit_verify_walk(cv, quiescent) {
                let verify = packet::make_service_verify_byte(cv, value);
                let samples = self.probe_chain(verify);
                if self.acked(&samples, quiescent) {
                    result = Some(value);
                    break;
                }
            }
        }

        self.cadence().set(SLOW_CADENCE_MS);
        CvReadResult { value: result }
    }

    /// Walks all 8 bits of a CV via bit-verify probes, assembling a
    /// candidate byte. Bit 0 (the MSB, per S-9.2.3 bit-position
    /// ordering used here) tries both polarities; if neither acks the
    /// attempt is abandoned.
    fn bit_verify_walk(&self, cv: u16, quiescent: f32) -> Option<u8> {
        let mut value = 0u8;

        let bit0_probe_high = packet::make_service_verify_bit(cv, 0, true);
        if self.acked(&self.probe_chain(bit0_probe_high), quiescent) {
            value |= 1 << 0;
        } else {
            let bit0_probe_low = packet::make_service_verify_bit(cv, 0, false);
            if !self.acked(&self.probe_chain(bit0_probe_low), quiescent) {
                return None;
            }
        }

        for bit in 1..8u8 {
            let probe = packet::make_service_verify_bit(cv, bit, true);
            if self.acked(&self.probe_chain(probe), quiescent) {
                value |= 1 << bit;
            }
        }

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        gpio::{SimCurrentSensor, SimPulseSink},
    };

    fn engine_with_samples(samples: Vec<(f32, f32)>) -> ServiceModeEngine {
        let state = Arc::new(SystemState::new(
            Configuration::default(),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimCurrentSensor::new(samples, (12000.0, 20.0))),
        ));
        ServiceModeEngine::new(state)
    }

    #[test]
    fn ack_detected_from_sustained_current_burst() {
        let engine = engine_with_samples(vec![]);
        let quiescent = 80.0;
        let mut samples = vec![90.0; 20];
        for s in samples.iter_mut().rev().take(6) {
            *s = 150.0;
        }
        assert!(engine.acked(&samples, quiescent));
    }

    #[test]
    fn no_burst_does_not_ack() {
        let engine = engine_with_samples(vec![]);
        let samples = vec![90.0; 20];
        assert!(!engine.acked(&samples, 80.0));
    }

    #[test]
    fn service_mode_packets_are_well_formed() {
        let write = packet::make_service_write_byte(29, 6);
        assert!(write.bitstring().starts_with(&"1".repeat(20)));
        let verify = packet::make_service_verify_byte(29, 6);
        assert!(verify.bitstring().starts_with(&"1".repeat(20)));
        let bit = packet::make_service_verify_bit(29, 3, true);
        assert!(bit.bitstring().starts_with(&"1".repeat(20)));
    }
}
