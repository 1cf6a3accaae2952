//! The UDP log stream: a best-effort mirror of track current and
//! notable events to an external listener (e.g. a live plotting
//! tool), independent of the `log` crate's diagnostics channel.
//!
//! Wire format is a single ASCII line per datagram:
//! `<sec>_<usec>: <message>`, where `sec`/`usec` are the sender's
//! wall-clock time at send. A send failure (nothing bound on the
//! other end) is swallowed -- this stream is never a correctness
//! dependency.

use std::net::UdpSocket;

use std::time::{SystemTime, UNIX_EPOCH};

pub struct UdpLog {
    socket: UdpSocket,
    target: String,
}

impl UdpLog {
    pub fn bind(host: &str, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket, target: format!("{host}:{port}") })
    }

    fn send_line(&self, message: &str) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let line = format!("{}_{}: {}", now.as_secs(), now.subsec_micros(), message);
        if let Err(e) = self.socket.send_to(line.as_bytes(), &self.target) {
            log::debug!("udp log send to {} failed: {e}", self.target);
        }
    }

    pub fn send_current(&self, current_ma: f32) {
        self.send_line(&format!("current={current_ma:.2}"));
    }

    pub fn send_event(&self, message: &str) {
        self.send_line(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_send_does_not_panic_without_a_listener() {
        let log = UdpLog::bind("127.0.0.1", 9035).unwrap();
        log.send_current(123.45);
        log.send_event("test event");
    }
}
