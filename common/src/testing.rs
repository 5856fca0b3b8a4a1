//! In-memory transport and sink doubles shared by the unit tests.
//!
//! Both are cheap handles over shared state so a test can keep one clone while the engine owns
//! the other.

use std::{
    cell::{Ref, RefCell, RefMut},
    rc::Rc,
};

use crate::{
    checksum::{Checksum, ChecksumTracker},
    sink::UpdateSink,
    transport::Transport,
};

pub fn checksum_of(bytes: &[u8]) -> Checksum {
    let mut tracker = ChecksumTracker::new();
    tracker.update(bytes);
    let hex = format!("{:x}", tracker.digest());
    Checksum::parse(hex.as_bytes()).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Begin(u64),
    SetChecksum(Checksum),
    Write(usize),
    Finish(bool),
    Abort,
}

#[derive(Debug)]
pub struct SinkState {
    pub calls: Vec<SinkCall>,
    pub data: Vec<u8>,
    pub capacity: u64,
    pub write_limit: Option<usize>,
    size: Option<u64>,
    expected: Option<Checksum>,
}

impl SinkState {
    pub fn aborts(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| **call == SinkCall::Abort)
            .count()
    }

    pub fn begins(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, SinkCall::Begin(_)))
            .count()
    }

    pub fn written(&self) -> usize {
        self.calls
            .iter()
            .map(|call| match call {
                SinkCall::Write(len) => *len,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSink(Rc<RefCell<SinkState>>);

impl RecordingSink {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SinkState {
            calls: Vec::new(),
            data: Vec::new(),
            capacity: u64::MAX,
            write_limit: None,
            size: None,
            expected: None,
        })))
    }

    pub fn state(&self) -> Ref<'_, SinkState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, SinkState> {
        self.0.borrow_mut()
    }
}

impl UpdateSink for RecordingSink {
    fn begin(&mut self, size: u64) -> bool {
        let mut state = self.state_mut();
        state.calls.push(SinkCall::Begin(size));
        if size > state.capacity {
            return false;
        }
        state.size = Some(size);
        true
    }

    fn set_checksum(&mut self, expected: &Checksum) {
        let mut state = self.state_mut();
        state.calls.push(SinkCall::SetChecksum(*expected));
        state.expected = Some(*expected);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut state = self.state_mut();
        let len = state
            .write_limit
            .map_or(bytes.len(), |limit| limit.min(bytes.len()));
        state.data.extend_from_slice(&bytes[..len]);
        state.calls.push(SinkCall::Write(len));
        len
    }

    fn is_finished(&self) -> bool {
        let state = self.state();
        state.size == Some(state.data.len() as u64)
    }

    fn finish(&mut self) -> bool {
        let finished = self.is_finished();
        let mut state = self.state_mut();
        let ok = finished
            && state
                .expected
                .is_some_and(|expected| expected == checksum_of(&state.data));
        state.calls.push(SinkCall::Finish(ok));
        ok
    }

    fn abort(&mut self) {
        let mut state = self.state_mut();
        state.calls.push(SinkCall::Abort);
        state.size = None;
    }
}

#[derive(Debug)]
pub struct TransportState {
    pub connected_to: Option<(String, u16)>,
    pub sent: Vec<u8>,
    pub stops: usize,
    pub accept_connect: bool,
    pub space: usize,
    pub write_limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RecordingTransport(Rc<RefCell<TransportState>>);

impl RecordingTransport {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(TransportState {
            connected_to: None,
            sent: Vec::new(),
            stops: 0,
            accept_connect: true,
            space: 5_744,
            write_limit: None,
        })))
    }

    pub fn state(&self) -> Ref<'_, TransportState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, TransportState> {
        self.0.borrow_mut()
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        let mut state = self.state_mut();
        state.connected_to = Some((host.to_string(), port));
        state.accept_connect
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut state = self.state_mut();
        let len = state
            .write_limit
            .map_or(bytes.len(), |limit| limit.min(bytes.len()));
        state.sent.extend_from_slice(&bytes[..len]);
        len
    }

    fn space(&self) -> usize {
        self.state().space
    }

    fn stop(&mut self) {
        self.state_mut().stops += 1;
    }
}
