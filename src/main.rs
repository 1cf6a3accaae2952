//! `wavedcc`: a DCC command station driving an H-bridge motor shield
//! from SBC GPIO pins.
//!
//! This binary wires together the pieces documented in the library
//! modules: load config, stand up the pulse sink and current sensor
//! backends, start the current monitor, and run a line-oriented REPL
//! over stdin until `exit`, EOF, or a signal tells it to stop.

mod config;
mod dispatcher;
mod error;
mod gpio;
mod monitor;
mod packet;
mod pump;
mod queue;
mod roster;
mod service_mode;
mod state;
mod udplog;

use std::{
    io::{self, BufRead, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use cfg_if::cfg_if;

use crate::{
    config::Configuration,
    dispatcher::Dispatcher,
    error::DccResult,
    gpio::{CurrentSensor, PulseSink, SimCurrentSensor, SimPulseSink},
    state::SystemState,
    udplog::UdpLog,
};

cfg_if! {
    if #[cfg(feature = "hardware")] {
        compile_error!(
            "the `hardware` feature is reserved for a real GPIO/INA219 backend; \
             driving GPIO and I2C directly is out of scope for this crate"
        );
    } else {
        fn build_pulse_sink() -> Arc<dyn PulseSink> {
            Arc::new(SimPulseSink::new())
        }

        fn build_current_sensor() -> Arc<dyn CurrentSensor> {
            Arc::new(SimCurrentSensor::new(Vec::new(), (12000.0, 20.0)))
        }
    }
}

fn main() -> DccResult<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Configuration::load()?;
    log::info!("wavedcc starting up");

    let main_sink = build_pulse_sink();
    let prog_sink = build_pulse_sink();
    let sensor = build_current_sensor();
    sensor.configure()?;

    let udplog = if config.logging {
        match UdpLog::bind(&config.host, config.port) {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                log::warn!("could not bind UDP log socket: {e}");
                None
            }
        }
    } else {
        None
    };

    let state = Arc::new(SystemState::new(config, main_sink, prog_sink, sensor));
    let monitor_handle = monitor::spawn(state.clone(), udplog.clone());
    *state.monitor.lock().unwrap() = Some(monitor_handle);

    install_signal_handler(state.clone());

    let dispatcher = Dispatcher::new(state.clone(), udplog);
    run_repl(&dispatcher);

    shutdown(&state);
    Ok(())
}

fn run_repl(dispatcher: &Dispatcher) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" {
            break;
        }

        let reply = dispatcher.dispatch(trimmed);
        if !reply.is_empty() {
            let _ = writeln!(stdout, "{reply}");
            let _ = stdout.flush();
        }
    }
}

/// Installs a handler that drives the same shutdown path as a clean
/// REPL exit when SIGINT or SIGTERM arrives -- an operator hitting
/// Ctrl-C should de-energize the track, not leave motors driven.
fn install_signal_handler(state: Arc<SystemState>) {
    let triggered = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let triggered = triggered.clone();
        if let Err(e) = unsafe {
            signal_hook::low_level::register(sig, move || {
                triggered.store(true, Ordering::Release);
            })
        } {
            log::warn!("failed to register signal handler: {e}");
        }
    }

    std::thread::spawn(move || loop {
        if triggered.load(Ordering::Acquire) {
            shutdown(&state);
            std::process::exit(1);
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
}

fn shutdown(state: &Arc<SystemState>) {
    log::info!("shutting down");
    state.mode.set_running(false);
    state.mode.set_programming(false);

    if let Some(handle) = state.pump.lock().unwrap().take() {
        handle.stop();
    }
    if let Some(handle) = state.monitor.lock().unwrap().take() {
        handle.stop();
    }

    state.main_sink.clear();
    state.prog_sink.clear();
    state.sensor.deconfigure();
}
