//! The command dispatcher: parses line-oriented text commands and
//! routes them to the roster, queue, and service mode engine. This is
//! the sole mutator of mode state -- every `running`/`programming`
//! transition, and every pump/monitor spawn or join, happens here so
//! the transitions stay race-free.
//!
//! The dispatcher never returns an error to its caller. Failures
//! internally are turned into one of the reply strings below, per the
//! propagation policy: a human (or a thin client speaking this same
//! line protocol) always gets a response, never a crash.

use std::sync::Arc;

use crate::{
    error::DccError,
    packet,
    packet::{BaseStop, SpeedSteps},
    pump,
    roster::RosterItem,
    service_mode::ServiceModeEngine,
    state::{Mode, SystemState},
    udplog::UdpLog,
};

const DCC_EX_COMPAT: &str = "<iDCC-EX V-0.0.0 / MEGA / STANDARD_MOTOR_SHIELD G-75ab2ab>";

/// Highest locomotive address the packet encoder's 2-byte extended
/// addressing can carry (S-9.2.1).
const MAX_ADDRESS: u16 = 10239;

/// Highest CV number the service-mode/ops-mode encoders' 10-bit
/// CV-1 field can carry.
const MAX_CV: u16 = 1024;

fn err_reply(e: DccError) -> String {
    format!("<Error: {e}>")
}

/// `0` is reserved internally as the roster's "no entry" sentinel
/// (see `roster::RosterItem::sentinel`), so it's rejected here as a
/// malformed address alongside anything the encoder's extended
/// addressing can't carry.
fn validate_address(address: u16) -> Result<(), DccError> {
    if address == 0 || address > MAX_ADDRESS {
        Err(DccError::MalformedCommand)
    } else {
        Ok(())
    }
}

fn validate_cv(cv: u16) -> Result<(), DccError> {
    if cv == 0 || cv > MAX_CV {
        Err(DccError::MalformedCommand)
    } else {
        Ok(())
    }
}

pub struct Dispatcher {
    state: Arc<SystemState>,
    udplog: Option<Arc<UdpLog>>,
}

impl Dispatcher {
    pub fn new(state: Arc<SystemState>, udplog: Option<Arc<UdpLog>>) -> Self {
        Self { state, udplog }
    }

    /// Processes one input line and returns the reply to print, or an
    /// empty string for commands that have none.
    pub fn dispatch(&self, line: &str) -> String {
        let trimmed = line.trim().trim_start_matches('<').trim_end_matches('>').trim();
        if trimmed.is_empty() {
            return String::new();
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        match tokens[0] {
            "1" => self.enter_mode(&tokens[1..]),
            "0" => self.exit_mode(&tokens[1..]),
            "t" => self.throttle(&tokens[1..]),
            "f" => self.raw_function_byte(&tokens[1..]),
            "F" => self.function_bit(&tokens[1..]),
            "w" => self.ops_cv_write(&tokens[1..]),
            "W" => self.service_cv_write(&tokens[1..]),
            "R" => self.service_cv_read(&tokens[1..]),
            "D" => self.direction_mode(&tokens[1..]),
            "-" => self.forget(&tokens[1..]),
            "l" => self.list_roster(),
            "s" => self.status(),
            "sp" => self.power_status(),
            "c" => self.current_status(),
            "ws" => self.diagnostics(),
            "test" => self.test_packet(),
            "T" | "Z" | "S" => "<X>".to_string(),
            "#" => "<# 1000d>".to_string(),
            _ => err_reply(DccError::MalformedCommand),
        }
    }

    fn log_event(&self, message: &str) {
        log::info!("{message}");
        if let Some(log) = &self.udplog {
            log.send_event(message);
        }
    }

    fn enter_mode(&self, args: &[&str]) -> String {
        let which = args.first().copied().unwrap_or("MAIN");

        if self.state.mode.overload_tripped() {
            return err_reply(DccError::Overload);
        }

        match which {
            "MAIN" => {
                if self.state.mode.programming() {
                    return err_reply(DccError::ModeConflict("programming mode active."));
                }
                if self.state.mode.running() {
                    return "<p1 MAIN>".to_string();
                }

                let cadence_ms = self.state.cadence.get();
                std::thread::sleep(std::time::Duration::from_secs_f32(cadence_ms / 1000.0));

                self.state.mode.set_running(true);
                let handle = pump::spawn(self.state.clone());
                *self.state.pump.lock().unwrap() = Some(handle);

                self.log_event("ops mode power on");
                "<p1 MAIN>".to_string()
            }
            "PROG" => {
                if self.state.mode.running() {
                    return err_reply(DccError::ModeConflict("ops mode active."));
                }
                self.state.mode.set_programming(true);
                self.log_event("programming mode power on");
                "<p1 PROG>".to_string()
            }
            _ => err_reply(DccError::MalformedCommand),
        }
    }

    fn exit_mode(&self, args: &[&str]) -> String {
        let which = args.first().copied().unwrap_or("MAIN");

        match which {
            "MAIN" => {
                self.state.mode.set_running(false);
                if let Some(handle) = self.state.pump.lock().unwrap().take() {
                    handle.stop();
                }
                if self.state.config.uptimelogging {
                    match self.state.roster.write_and_reset_uptimes(&self.state.config.uptimefilepath) {
                        Ok(path) => log::info!("uptime journal written to {}", path.display()),
                        Err(e) => log::warn!("failed to write uptime journal: {e}"),
                    }
                }
                self.log_event("ops mode power off");
                "<p0 MAIN>".to_string()
            }
            "PROG" => {
                self.state.mode.set_programming(false);
                self.log_event("programming mode power off");
                "<p0 PROG>".to_string()
            }
            _ => err_reply(DccError::MalformedCommand),
        }
    }

    fn throttle(&self, args: &[&str]) -> String {
        // Accept both `t addr spd dir` and `t 1 addr spd dir` (the
        // leading register number JMRI-style throttles send).
        let args: &[&str] = if args.len() == 4 { &args[1..] } else { args };
        if args.len() != 3 {
            return err_reply(DccError::MalformedCommand);
        }

        let (Ok(address), Ok(speed), Ok(direction)) =
            (args[0].parse::<u16>(), args[1].parse::<u8>(), args[2].parse::<u8>())
        else {
            return err_reply(DccError::MalformedCommand);
        };
        if let Err(e) = validate_address(address) {
            return err_reply(e);
        }
        let direction = direction != 0;

        self.state.roster.update_speed(address, speed, direction);
        let item = self.state.roster.get(address);
        let packet = pump::encode_roster_item(&item, self.state.mode.speed_steps());
        self.state.queue.push(packet);

        format!("<T 1 {speed} {}>", direction as u8)
    }

    fn raw_function_byte(&self, args: &[&str]) -> String {
        let [addr, byte] = args else {
            return err_reply(DccError::MalformedCommand);
        };
        let (Ok(address), Ok(value)) = (addr.parse::<u16>(), byte.parse::<u8>()) else {
            return err_reply(DccError::MalformedCommand);
        };
        if let Err(e) = validate_address(address) {
            return err_reply(e);
        }

        self.state.roster.set_function_byte(address, 1, value);
        let packet = packet::make_function_group_raw(address, value)
            .expect("address already validated above");
        self.state.queue.push(packet);
        String::new()
    }

    fn function_bit(&self, args: &[&str]) -> String {
        let [addr, func, val] = args else {
            return err_reply(DccError::MalformedCommand);
        };
        let (Ok(address), Ok(func), Ok(val)) =
            (addr.parse::<u16>(), func.parse::<u8>(), val.parse::<u8>())
        else {
            return err_reply(DccError::MalformedCommand);
        };
        if let Err(e) = validate_address(address) {
            return err_reply(e);
        }
        if func > 12 {
            return err_reply(DccError::MalformedCommand);
        }
        let on = val != 0;

        match func {
            0 => {
                self.state.roster.set_headlight(address, on);
                self.state.roster.set_function_bit(address, 1, 4, on);
            }
            1..=4 => self.state.roster.set_function_bit(address, 1, func - 1, on),
            5..=8 => self.state.roster.set_function_bit(address, 2, func - 5, on),
            _ => self.state.roster.set_function_bit(address, 3, func - 9, on),
        }

        let item = self.state.roster.get(address);
        let group = match func {
            0..=4 => 1,
            5..=8 => 2,
            _ => 3,
        };
        let value = match group {
            1 => item.fgroup1,
            2 => item.fgroup2,
            _ => item.fgroup3,
        };
        let packet = packet::make_function_group_raw(address, value)
            .expect("address already validated above");
        self.state.queue.push(packet);
        String::new()
    }

    fn ops_cv_write(&self, args: &[&str]) -> String {
        let [addr, cv, val] = args else {
            return err_reply(DccError::MalformedCommand);
        };
        let (Ok(address), Ok(cv), Ok(value)) =
            (addr.parse::<u16>(), cv.parse::<u16>(), val.parse::<u8>())
        else {
            return err_reply(DccError::MalformedCommand);
        };
        if let Err(e) = validate_address(address) {
            return err_reply(e);
        }
        if let Err(e) = validate_cv(cv) {
            return err_reply(e);
        }

        // Enqueued several times: ops-mode CV writes have no
        // acknowledgment, so redundancy is the only defense against a
        // dropped packet.
        for _ in 0..4 {
            let packet = packet::make_write_cv_to_address(address, cv, value)
                .expect("address already validated above");
            self.state.queue.push(packet);
        }

        format!("<W {address} {cv} {value}>")
    }

    fn service_cv_write(&self, args: &[&str]) -> String {
        if !self.state.mode.programming() {
            return err_reply(DccError::ModeConflict("not in programming mode."));
        }

        let (cv, value) = match args {
            [cv, val] => match (cv.parse::<u16>(), val.parse::<u8>()) {
                (Ok(cv), Ok(val)) => (cv, val),
                _ => return err_reply(DccError::MalformedCommand),
            },
            // Short form: `W addr` sets CV 1 (the primary address CV).
            [addr] => match addr.parse::<u8>() {
                Ok(addr) => (1u16, addr),
                Err(_) => return err_reply(DccError::MalformedCommand),
            },
            _ => return err_reply(DccError::MalformedCommand),
        };
        if let Err(e) = validate_cv(cv) {
            return err_reply(e);
        }

        let engine = ServiceModeEngine::new(self.state.clone());
        engine.write_cv(cv, value);
        format!("<W {cv} {value}>")
    }

    fn service_cv_read(&self, args: &[&str]) -> String {
        if !self.state.mode.programming() {
            return err_reply(DccError::ModeConflict("not in programming mode."));
        }

        let cv: u16 = match args.first().and_then(|a| a.parse().ok()) {
            Some(cv) => cv,
            None => return err_reply(DccError::MalformedCommand),
        };
        if let Err(e) = validate_cv(cv) {
            return err_reply(e);
        }

        let engine = ServiceModeEngine::new(self.state.clone());
        let result = engine.read_cv(cv);
        let value = result.value.map(i32::from).unwrap_or(-1);

        match (args.get(1), args.get(2)) {
            (Some(cb), Some(cbsub)) => format!("<r {cb}|{cbsub}|{cv} {value}>"),
            _ => format!("<r CV{cv}={value}>"),
        }
    }

    fn direction_mode(&self, args: &[&str]) -> String {
        match args.first().copied() {
            Some("CABS") => self.list_roster(),
            Some("SPEED28") => {
                self.state.mode.set_speed_steps(SpeedSteps::Step28);
                String::new()
            }
            Some("SPEED128") => {
                self.state.mode.set_speed_steps(SpeedSteps::Step128);
                String::new()
            }
            _ => err_reply(DccError::MalformedCommand),
        }
    }

    fn forget(&self, args: &[&str]) -> String {
        match args.first().and_then(|a| a.parse::<u16>().ok()) {
            Some(address) => self.state.roster.forget(address),
            None => self.state.roster.forget_all(),
        }
        String::new()
    }

    fn list_roster(&self) -> String {
        let mut items: Vec<RosterItem> = self.state.roster.list();
        items.sort_by_key(|i| i.address);
        items
            .iter()
            .map(|i| format!("{}:{} {}", i.address, i.speed, i.direction as u8))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn status(&self) -> String {
        let p = match self.state.mode.mode() {
            Mode::Idle => "<p0>",
            Mode::OpsRunning => "<p1 MAIN>",
            Mode::Programming => "<p1 PROG>",
        };
        format!("{p}{DCC_EX_COMPAT}")
    }

    fn power_status(&self) -> String {
        match self.state.mode.mode() {
            Mode::Idle => "<sp0>".to_string(),
            Mode::OpsRunning => "<sp1 MAIN>".to_string(),
            Mode::Programming => "<sp1 PROG>".to_string(),
        }
    }

    fn current_status(&self) -> String {
        let (_, current_ma) = self.state.reading.get();
        let overload = self.state.mode.overload_tripped();
        let tag = if overload { " OVERLOAD" } else { "" };
        format!(
            "<c \"CurrentMAIN\" C Milli 0 2000 1 {}{}>",
            current_ma as i32, tag
        )
    }

    fn diagnostics(&self) -> String {
        format!(
            "queue_len={} roster_len={} mode={:?} cadence_ms={}",
            self.state.queue.len(),
            self.state.roster.len(),
            self.state.mode.mode(),
            self.state.cadence.get()
        )
    }

    fn test_packet(&self) -> String {
        let packet = packet::make_baseline_speed_dir(3, true, 14, true).expect("address 3 is valid");
        self.state.queue.push(packet);
        String::new()
    }
}

/// Broadcast-stop convenience, exposed for completeness with the
/// packet encoder's `makeBaselineBroadcastStopPacket` though not wired
/// to a dedicated dispatcher command -- no command in the external
/// surface emits it today.
#[allow(dead_code)]
pub fn broadcast_stop_packet(kind: BaseStop) -> packet::Packet {
    packet::make_baseline_broadcast_stop(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        gpio::{SimCurrentSensor, SimPulseSink},
        state::SystemState,
    };

    fn dispatcher() -> Dispatcher {
        let state = Arc::new(SystemState::new(
            Configuration::default(),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimPulseSink::new()),
            Arc::new(SimCurrentSensor::new(vec![], (12000.0, 20.0))),
        ));
        Dispatcher::new(state, None)
    }

    #[test]
    fn throttle_replies_and_updates_roster() {
        let d = dispatcher();
        let reply = d.dispatch("t 1 3 14 1");
        assert_eq!(reply, "<T 1 14 1>");
        let item = d.state.roster.get(3);
        assert_eq!(item.speed, 14);
        assert!(item.direction);
    }

    #[test]
    fn malformed_command_does_not_change_state() {
        let d = dispatcher();
        let reply = d.dispatch("t 1 2");
        assert_eq!(reply, "<Error: malformed command.>");
    }

    #[test]
    fn service_mode_commands_require_programming_mode() {
        let d = dispatcher();
        let reply = d.dispatch("R 29");
        assert!(reply.starts_with("<Error"));
    }

    #[test]
    fn enter_main_then_prog_is_rejected() {
        let d = dispatcher();
        assert_eq!(d.dispatch("1 MAIN"), "<p1 MAIN>");
        let reply = d.dispatch("1 PROG");
        assert!(reply.starts_with("<Error"));
        d.dispatch("0 MAIN");
    }

    #[test]
    fn overload_blocks_power_on() {
        let d = dispatcher();
        d.state.mode.trip_overload();
        let reply = d.dispatch("1 MAIN");
        assert!(reply.starts_with("<Error"));
    }

    #[test]
    fn throttle_rejects_address_zero_without_touching_roster() {
        let d = dispatcher();
        let reply = d.dispatch("t 0 50 1");
        assert_eq!(reply, "<Error: malformed command.>");
        assert_eq!(d.state.roster.len(), 0);
    }

    #[test]
    fn throttle_rejects_address_above_extended_range() {
        let d = dispatcher();
        let reply = d.dispatch("t 10240 50 1");
        assert_eq!(reply, "<Error: malformed command.>");
        assert_eq!(d.state.roster.len(), 0);
    }

    #[test]
    fn raw_function_byte_and_function_bit_reject_address_zero() {
        let d = dispatcher();
        assert_eq!(d.dispatch("f 0 5"), "<Error: malformed command.>");
        assert_eq!(d.dispatch("F 0 1 1"), "<Error: malformed command.>");
    }

    #[test]
    fn ops_cv_write_rejects_address_zero_and_cv_zero() {
        let d = dispatcher();
        assert_eq!(d.dispatch("w 0 1 6"), "<Error: malformed command.>");
        assert_eq!(d.dispatch("w 3 0 6"), "<Error: malformed command.>");
        assert_eq!(d.state.queue.len(), 0);
    }

    #[test]
    fn service_cv_read_and_write_reject_cv_zero() {
        let d = dispatcher();
        d.dispatch("1 PROG");
        assert_eq!(d.dispatch("R 0"), "<Error: malformed command.>");
        assert_eq!(d.dispatch("W 0 6"), "<Error: malformed command.>");
    }
}
