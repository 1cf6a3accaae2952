//! The command queue: a mutex-guarded FIFO of packets awaiting
//! transmission by the waveform pump. Mirrors the original's
//! `std::deque` + mutex pair -- push at the front, pop from the back.

use std::{collections::VecDeque, sync::Mutex};

use crate::packet::Packet;

#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<Packet>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, packet: Packet) {
        self.inner.lock().unwrap().push_front(packet);
    }

    pub fn pop(&self) -> Option<Packet> {
        self.inner.lock().unwrap().pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::make_baseline_idle;

    #[test]
    fn fifo_order_is_preserved() {
        let q = CommandQueue::new();
        q.push(make_baseline_idle());
        q.push(make_baseline_idle());
        assert_eq!(q.len(), 2);
        assert!(q.pop().is_some());
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }
}
