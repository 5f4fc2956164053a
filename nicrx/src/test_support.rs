//! Recording provider bundle for unit tests.
//!
//! Every delay is zero. Ticks and memory callbacks are queued instead of
//! being run, and [`drive`] replays them until nothing is left.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::ReceiveResult;
use crate::packet::{Packet, Response};
use crate::providers::{
    Completion, EngineClock, HostInterface, HostMemoryModel, NeedReceive, NetworkLink,
    NicProviders, Telemetry, TelemetrySample, Transmit,
};
use crate::scheduler::ReceiveScheduler;
use crate::stream::MemoryToken;

#[derive(Debug, Default)]
struct RecordingState {
    inbound: VecDeque<Packet>,
    notify_armed: bool,
    ticks_pending: usize,
    ticks_total: usize,
    callbacks: VecDeque<MemoryToken>,
    completions: Vec<Completion>,
    needs: Vec<NeedReceive>,
    responses: Vec<Response>,
    samples: Vec<TelemetrySample>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingProviders {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingProviders {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_inbound(&self, packet: Packet) {
        self.state.borrow_mut().inbound.push_back(packet);
    }

    pub(crate) fn inbound_len(&self) -> usize {
        self.state.borrow().inbound.len()
    }

    pub(crate) fn notify_armed(&self) -> bool {
        self.state.borrow().notify_armed
    }

    pub(crate) fn scheduled_ticks(&self) -> usize {
        self.state.borrow().ticks_total
    }

    pub(crate) fn completions(&self) -> Vec<Completion> {
        self.state.borrow().completions.clone()
    }

    pub(crate) fn needs(&self) -> Vec<NeedReceive> {
        self.state.borrow().needs.clone()
    }

    pub(crate) fn responses(&self) -> Vec<Response> {
        self.state.borrow().responses.clone()
    }

    pub(crate) fn samples(&self) -> Vec<TelemetrySample> {
        self.state.borrow().samples.clone()
    }

    fn pop_callback(&self) -> Option<MemoryToken> {
        self.state.borrow_mut().callbacks.pop_front()
    }

    fn take_tick(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.ticks_pending == 0 {
            return false;
        }
        state.ticks_pending -= 1;
        true
    }
}

impl NetworkLink for RecordingProviders {
    fn receive(&self, _vc: usize) -> Option<Packet> {
        self.state.borrow_mut().inbound.pop_front()
    }

    fn request_to_receive(&self, _vc: usize) -> bool {
        !self.state.borrow().inbound.is_empty()
    }

    fn set_notify(&self, _vc: usize) {
        self.state.borrow_mut().notify_armed = true;
    }
}

impl EngineClock for RecordingProviders {
    fn schedule_tick(&self, _delay: Duration) {
        let mut state = self.state.borrow_mut();
        state.ticks_pending += 1;
        state.ticks_total += 1;
    }

    fn schedule_callback(&self, _delay: Duration, token: MemoryToken) {
        self.state.borrow_mut().callbacks.push_back(token);
    }
}

impl HostMemoryModel for RecordingProviders {
    fn host_read_delay(&self, _bytes: usize) -> Duration {
        Duration::ZERO
    }

    fn host_write_delay(&self, _bytes: usize) -> Duration {
        Duration::ZERO
    }

    fn nic_access_delay(&self, _bytes: usize) -> Duration {
        Duration::ZERO
    }
}

impl HostInterface for RecordingProviders {
    fn need_receive(&self, notice: NeedReceive) {
        self.state.borrow_mut().needs.push(notice);
    }

    fn complete(&self, completion: Completion) {
        self.state.borrow_mut().completions.push(completion);
    }
}

impl Transmit for RecordingProviders {
    fn send(&self, response: Response) {
        self.state.borrow_mut().responses.push(response);
    }
}

impl Telemetry for RecordingProviders {
    fn record(&self, sample: TelemetrySample) {
        self.state.borrow_mut().samples.push(sample);
    }
}

impl NicProviders for RecordingProviders {
    type Link = Self;
    type Clock = Self;
    type Memory = Self;
    type Host = Self;
    type Transmit = Self;
    type Telemetry = Self;

    fn link(&self) -> &Self {
        self
    }

    fn clock(&self) -> &Self {
        self
    }

    fn memory(&self) -> &Self {
        self
    }

    fn host(&self) -> &Self {
        self
    }

    fn transmit(&self) -> &Self {
        self
    }

    fn telemetry(&self) -> &Self {
        self
    }
}

/// Run one pass, then replay callbacks and scheduled passes until quiet.
pub(crate) fn drive(
    engine: &mut ReceiveScheduler<RecordingProviders>,
    providers: &RecordingProviders,
) -> ReceiveResult<()> {
    engine.tick()?;
    loop {
        if let Some(token) = providers.pop_callback() {
            engine.on_memory_complete(token)?;
        } else if providers.take_tick() {
            engine.tick()?;
        } else {
            return Ok(());
        }
    }
}
