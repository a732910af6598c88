//! Deterministic stand-ins for the engine and the scheduler.
//!
//! [`ScriptedEngine`] plays back watch/timer requests and completions queued by a test, and
//! [`ManualScheduler`] records every registration and fires events only when asked. Both are
//! cheap clones over shared state so a test can keep one copy while the multiplexer owns the
//! other.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::engine::{
    Bridge, Completion, Engine, MultiOption, OptionValue, Ready, Rejected, Socket, SocketEvents,
    TransferId,
};
use crate::error::{Error, Result};
use crate::scheduler::{Callback, Scheduler, TimerId};

/// A request the scripted engine makes of its bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Watch(RawFd, SocketEvents),
    Timer(Option<Duration>),
}

/// What the scripted engine does on its next [`step`](Engine::step).
#[derive(Debug, Clone, Default)]
pub struct Step {
    requests: Vec<Request>,
    completions: Vec<Completion>,
}

impl Step {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn complete(mut self, id: TransferId) -> Self {
        self.completions.push(Completion::success(id));
        self
    }

    pub fn fail(mut self, id: TransferId, code: i32, message: &str) -> Self {
        self.completions.push(Completion::failure(id, code, message));
        self
    }
}

/// A call received by the scripted engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Add(TransferId),
    Remove(TransferId),
    Step(Socket, Ready),
    SetOption(MultiOption),
}

#[derive(Debug, Default)]
struct Script {
    stored: HashMap<TransferId, String>,
    running: BTreeSet<TransferId>,
    completions: VecDeque<Completion>,
    on_add: VecDeque<Vec<Request>>,
    on_remove: VecDeque<Vec<Request>>,
    steps: VecDeque<Step>,
    reject_next_add: Option<(i32, String)>,
    calls: Vec<EngineCall>,
}

/// An [`Engine`] whose behaviour is queued up front by the test.
///
/// Native transfers are plain labels. Without a queued [`Step`], stepping changes nothing and
/// reports the current running count.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Rc<RefCell<Script>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests issued during the next `add_transfer`.
    pub fn on_add(&self, requests: Vec<Request>) {
        self.script.borrow_mut().on_add.push_back(requests);
    }

    /// Requests issued during the next `remove_transfer`.
    pub fn on_remove(&self, requests: Vec<Request>) {
        self.script.borrow_mut().on_remove.push_back(requests);
    }

    pub fn on_step(&self, step: Step) {
        self.script.borrow_mut().steps.push_back(step);
    }

    pub fn reject_next_add(&self, code: i32, message: &str) {
        self.script.borrow_mut().reject_next_add = Some((code, message.to_owned()));
    }

    /// Number of transfers that are added and not yet finished.
    pub fn running(&self) -> usize {
        self.script.borrow().running.len()
    }

    /// Number of transfers the engine currently holds, finished or not.
    pub fn stored(&self) -> usize {
        self.script.borrow().stored.len()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.script.borrow().calls.clone()
    }

    fn apply(requests: Vec<Request>, bridge: &mut dyn Bridge) -> Result<()> {
        for request in requests {
            match request {
                Request::Watch(fd, events) => bridge.watch_socket(fd, events)?,
                Request::Timer(timeout) => bridge.arm_timer(timeout)?,
            }
        }
        Ok(())
    }
}

impl Engine for ScriptedEngine {
    type Transfer = String;

    fn add_transfer(
        &mut self,
        id: TransferId,
        transfer: String,
        bridge: &mut dyn Bridge,
    ) -> std::result::Result<(), Rejected<String>> {
        let requests = {
            let mut script = self.script.borrow_mut();
            script.calls.push(EngineCall::Add(id));
            if let Some((code, message)) = script.reject_next_add.take() {
                return Err(Rejected::new(transfer, Error::engine(code, message)));
            }
            script.stored.insert(id, transfer);
            script.running.insert(id);
            script.on_add.pop_front().unwrap_or_default()
        };

        if let Err(error) = Self::apply(requests, bridge) {
            let mut script = self.script.borrow_mut();
            script.running.remove(&id);
            let transfer = script.stored.remove(&id).unwrap_or_default();
            return Err(Rejected::new(transfer, error));
        }
        Ok(())
    }

    fn remove_transfer(&mut self, id: TransferId, bridge: &mut dyn Bridge) -> Result<String> {
        let (transfer, requests) = {
            let mut script = self.script.borrow_mut();
            script.calls.push(EngineCall::Remove(id));
            let transfer = script
                .stored
                .remove(&id)
                .ok_or_else(|| Error::engine(-1, format!("unknown transfer {id}")))?;
            script.running.remove(&id);
            (transfer, script.on_remove.pop_front().unwrap_or_default())
        };

        Self::apply(requests, bridge)?;
        Ok(transfer)
    }

    fn step(&mut self, socket: Socket, ready: Ready, bridge: &mut dyn Bridge) -> Result<usize> {
        let step = {
            let mut script = self.script.borrow_mut();
            script.calls.push(EngineCall::Step(socket, ready));
            script.steps.pop_front().unwrap_or_default()
        };

        Self::apply(step.requests, bridge)?;

        let mut script = self.script.borrow_mut();
        for completion in step.completions {
            if script.running.remove(&completion.id) {
                script.completions.push_back(completion);
            }
        }
        Ok(script.running.len())
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.script.borrow_mut().completions.pop_front()
    }

    fn set_option(&mut self, option: MultiOption, _value: OptionValue) -> Result<()> {
        self.script
            .borrow_mut()
            .calls
            .push(EngineCall::SetOption(option));
        Ok(())
    }

    fn version(&self) -> String {
        "scripted/1.0".to_owned()
    }
}

/// A call received by the manual scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCall {
    OnReadable(RawFd),
    OnWritable(RawFd),
    RemoveReadable(RawFd),
    RemoveWritable(RawFd),
    ArmTimer(TimerId, Duration),
    CancelTimer(TimerId),
}

#[derive(Default)]
struct ManualState {
    readers: HashMap<RawFd, Callback>,
    writers: HashMap<RawFd, Callback>,
    timers: BTreeMap<TimerId, (Duration, Callback)>,
    next_timer: u64,
    fail_registrations: bool,
    calls: Vec<SchedulerCall>,
}

/// A [`Scheduler`] that never runs anything on its own.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Rc<RefCell<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent reader/writer registrations fail.
    pub fn fail_registrations(&self, fail: bool) {
        self.state.borrow_mut().fail_registrations = fail;
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn is_reading(&self, fd: RawFd) -> bool {
        self.state.borrow().readers.contains_key(&fd)
    }

    pub fn is_writing(&self, fd: RawFd) -> bool {
        self.state.borrow().writers.contains_key(&fd)
    }

    pub fn armed_timers(&self) -> Vec<(TimerId, Duration)> {
        self.state
            .borrow()
            .timers
            .iter()
            .map(|(id, (delay, _))| (*id, *delay))
            .collect()
    }

    /// Invokes the reader registered for `fd`. Returns `false` if there is none.
    pub fn fire_readable(&self, fd: RawFd) -> bool {
        let callback = self.state.borrow().readers.get(&fd).cloned();
        Self::run(callback)
    }

    /// Invokes the writer registered for `fd`. Returns `false` if there is none.
    pub fn fire_writable(&self, fd: RawFd) -> bool {
        let callback = self.state.borrow().writers.get(&fd).cloned();
        Self::run(callback)
    }

    /// Fires the earliest armed timer. Returns `false` if none is armed.
    pub fn fire_timer(&self) -> bool {
        let callback = {
            let mut state = self.state.borrow_mut();
            let first = state.timers.keys().next().copied();
            first.and_then(|id| state.timers.remove(&id)).map(|(_, cb)| cb)
        };
        Self::run(callback)
    }

    fn run(callback: Option<Callback>) -> bool {
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn register(&self, fd: RawFd, callback: Callback, writer: bool) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_registrations {
            return Err(io::Error::other("registration refused"));
        }
        if writer {
            state.calls.push(SchedulerCall::OnWritable(fd));
            state.writers.insert(fd, callback);
        } else {
            state.calls.push(SchedulerCall::OnReadable(fd));
            state.readers.insert(fd, callback);
        }
        Ok(())
    }
}

impl Scheduler for ManualScheduler {
    fn on_readable(&self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.register(fd, callback, false)
    }

    fn on_writable(&self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.register(fd, callback, true)
    }

    fn remove_readable(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(SchedulerCall::RemoveReadable(fd));
        state.readers.remove(&fd);
        Ok(())
    }

    fn remove_writable(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(SchedulerCall::RemoveWritable(fd));
        state.writers.remove(&fd);
        Ok(())
    }

    fn arm_timer(&self, delay: Duration, callback: Callback) -> TimerId {
        let mut state = self.state.borrow_mut();
        state.next_timer += 1;
        let id = TimerId(state.next_timer);
        state.calls.push(SchedulerCall::ArmTimer(id, delay));
        state.timers.insert(id, (delay, callback));
        id
    }

    fn cancel_timer(&self, timer: TimerId) {
        let mut state = self.state.borrow_mut();
        state.calls.push(SchedulerCall::CancelTimer(timer));
        state.timers.remove(&timer);
    }
}
