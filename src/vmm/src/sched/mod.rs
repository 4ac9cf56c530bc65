// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-pCPU cooperative thread scheduler.
//!
//! A pCPU in this VMM is modeled as a single host OS thread; every vCPU (and
//! the lifecycle/ptdev worker threads) that is pinned to it is a
//! [`ThreadObject`] competing for that one logical "running" slot. Only one
//! `ThreadObject` may be `Running` on a given pCPU at a time; everyone else
//! is `Runnable` (waiting on the policy's run queue) or `Blocked` (parked,
//! waiting for `wake_thread`).
//!
//! `schedule()` never touches the CPU register file directly (there is none
//! to save here, KVM owns it) -- instead it parks/unparks the host threads
//! backing each `ThreadObject` with a condvar, which is the "cooperative
//! tasks + channels" substitute spec.md §9 explicitly allows in place of a
//! raw stack-pointer switch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub mod bvt;
pub mod iorr;

pub type PcpuId = u16;
pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Runnable,
    Running,
    Blocked,
}

/// Parameters passed to a policy's `init_data` when a thread is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedParams {
    /// Relative CPU share; only consulted by BVT.
    pub weight: u16,
}

/// Per-policy private bookkeeping, tagged by variant instead of an opaque
/// `void *data` the way the original C keeps a union.
#[derive(Debug, Clone)]
pub enum PolicyData {
    Bvt(bvt::BvtData),
    Iorr(iorr::IorrData),
    None,
}

/// Gate used to park/unpark the host thread backing a [`ThreadObject`].
/// Stands in for the register-context switch of a bare-metal scheduler.
struct ParkGate {
    may_run: Mutex<bool>,
    cv: Condvar,
}

impl ParkGate {
    fn new(may_run: bool) -> Self {
        ParkGate {
            may_run: Mutex::new(may_run),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut guard = self.may_run.lock().unwrap();
        while !*guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    fn release(&self) {
        *self.may_run.lock().unwrap() = true;
        self.cv.notify_one();
    }

    fn block(&self) {
        *self.may_run.lock().unwrap() = false;
    }
}

pub struct ThreadObject {
    pub id: ThreadId,
    pub pcpu_id: PcpuId,
    pub status: ThreadStatus,
    pub be_blocking: bool,
    pub is_idle: bool,
    pub data: PolicyData,
    gate: Arc<ParkGate>,
}

impl fmt::Debug for ThreadObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadObject")
            .field("id", &self.id)
            .field("pcpu_id", &self.pcpu_id)
            .field("status", &self.status)
            .field("is_idle", &self.is_idle)
            .finish()
    }
}

impl ThreadObject {
    fn new(id: ThreadId, pcpu_id: PcpuId, is_idle: bool) -> Self {
        ThreadObject {
            id,
            pcpu_id,
            status: ThreadStatus::Blocked,
            be_blocking: false,
            is_idle,
            data: PolicyData::None,
            gate: Arc::new(ParkGate::new(is_idle)),
        }
    }

    /// Blocks the calling host thread until this object is scheduled `Running`.
    /// Must only be called by the OS thread that backs this `ThreadObject`.
    pub fn park_until_running(&self) {
        self.gate.park();
    }
}

#[derive(Debug)]
pub enum SchedError {
    TimerInit,
    UnknownThread,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::TimerInit => write!(f, "failed to register schedule tick timer"),
            SchedError::UnknownThread => write!(f, "thread id not registered on this pcpu"),
        }
    }
}

impl std::error::Error for SchedError {}

/// Read/mutate surface a [`SchedulerPolicy`] is given while the schedule
/// lock is held; it never sees the lock or the raw thread table directly.
pub struct ScheduleState<'a> {
    threads: &'a mut HashMap<ThreadId, ThreadObject>,
    pub curr: Option<ThreadId>,
}

impl<'a> ScheduleState<'a> {
    pub fn get(&self, id: ThreadId) -> Option<&ThreadObject> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadObject> {
        self.threads.get_mut(&id)
    }

    pub fn is_idle(&self, id: ThreadId) -> bool {
        self.threads.get(&id).map(|t| t.is_idle).unwrap_or(false)
    }
}

pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;
    fn init(&mut self) -> Result<(), SchedError>;
    fn deinit(&mut self) {}
    fn init_data(&mut self, state: &mut ScheduleState, id: ThreadId, params: SchedParams);
    /// Choose the next thread to run. `idle_id` is returned when the run
    /// queue is empty.
    fn pick_next(&mut self, state: &mut ScheduleState, idle_id: ThreadId) -> ThreadId;
    fn sleep(&mut self, state: &mut ScheduleState, id: ThreadId);
    fn wake(&mut self, state: &mut ScheduleState, id: ThreadId);
    /// Called on every scheduler tick (1 MCU for BVT, 1 ms for I/O-RR).
    /// Returns true if a reschedule should be requested.
    fn tick(&mut self, state: &mut ScheduleState) -> bool;
    fn suspend(&mut self) {}
    fn resume(&mut self) -> Result<(), SchedError> {
        Ok(())
    }
}

const NEED_RESCHEDULE: u8 = 1;

pub struct ScheduleControl {
    pub pcpu_id: PcpuId,
    inner: Mutex<Inner>,
    flags: AtomicBool,
    next_id: Mutex<ThreadId>,
}

struct Inner {
    threads: HashMap<ThreadId, ThreadObject>,
    curr_obj: Option<ThreadId>,
    policy: Box<dyn SchedulerPolicy>,
    idle_id: ThreadId,
}

impl ScheduleControl {
    /// Creates the per-pCPU control block and its sentinel idle thread, then
    /// calls the policy's `init`. Mirrors `init_sched`.
    pub fn new(pcpu_id: PcpuId, mut policy: Box<dyn SchedulerPolicy>) -> Result<Arc<Self>, SchedError> {
        policy.init()?;

        let idle_id: ThreadId = (pcpu_id as u64) << 32;
        let mut threads = HashMap::new();
        let mut idle = ThreadObject::new(idle_id, pcpu_id, true);
        idle.status = ThreadStatus::Running;
        threads.insert(idle_id, idle);

        let ctl = ScheduleControl {
            pcpu_id,
            inner: Mutex::new(Inner {
                threads,
                curr_obj: Some(idle_id),
                policy,
                idle_id,
            }),
            flags: AtomicBool::new(false),
            next_id: Mutex::new(idle_id + 1),
        };

        Ok(Arc::new(ctl))
    }

    pub fn deinit(&self) {
        self.inner.lock().unwrap().policy.deinit();
    }

    pub fn suspend(&self) {
        self.inner.lock().unwrap().policy.suspend();
    }

    pub fn resume(&self) -> Result<(), SchedError> {
        self.inner.lock().unwrap().policy.resume()
    }

    pub fn alloc_thread_id(&self) -> ThreadId {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Registers a new thread, blocked until woken. Mirrors `init_thread_data`.
    pub fn init_thread_data(self: &Arc<Self>, id: ThreadId, params: SchedParams) {
        let mut inner = self.inner.lock().unwrap();
        let obj = ThreadObject::new(id, self.pcpu_id, false);
        inner.threads.insert(id, obj);
        let idle_id = inner.idle_id;
        let Inner { threads, policy, .. } = &mut *inner;
        let mut state = ScheduleState {
            threads,
            curr: None,
        };
        policy.init_data(&mut state, id, params);
        let _ = idle_id;
    }

    pub fn need_reschedule(&self) -> bool {
        self.flags.load(Ordering::SeqCst)
    }

    /// Mirrors `make_reschedule_request`; `kick` is invoked only when the
    /// caller is not the owner of this pCPU (the real IPI in bare-metal
    /// ACRN, a no-op here since `schedule()` is always called cooperatively
    /// by the owning host thread at its next safe point).
    pub fn make_reschedule_request(&self) {
        self.flags.store(true, Ordering::SeqCst);
    }

    fn clear_reschedule(&self) {
        self.flags.store(false, Ordering::SeqCst);
    }

    /// Core scheduling decision. Mirrors `schedule()`: picks next, updates
    /// statuses under the lock, then parks/releases host threads outside it.
    pub fn schedule(&self) {
        let (prev_gate, next_gate, did_switch) = {
            let mut inner = self.inner.lock().unwrap();
            let idle_id = inner.idle_id;
            let prev = inner.curr_obj;

            let Inner { threads, policy, .. } = &mut *inner;
            let mut state = ScheduleState { threads, curr: prev };
            let next = policy.pick_next(&mut state, idle_id);
            self.clear_reschedule();

            if prev == Some(next) {
                (None, None, false)
            } else {
                if let Some(prev_id) = prev {
                    if let Some(prev_obj) = inner.threads.get_mut(&prev_id) {
                        prev_obj.status = if prev_obj.be_blocking {
                            ThreadStatus::Blocked
                        } else {
                            ThreadStatus::Runnable
                        };
                        prev_obj.be_blocking = false;
                    }
                }
                let prev_gate = prev.and_then(|p| inner.threads.get(&p)).map(|t| t.gate.clone());
                let next_gate = inner.threads.get(&next).map(|t| t.gate.clone());
                if let Some(next_obj) = inner.threads.get_mut(&next) {
                    next_obj.status = ThreadStatus::Running;
                }
                inner.curr_obj = Some(next);
                (prev_gate, next_gate, true)
            }
        };

        if did_switch {
            if let Some(gate) = next_gate {
                gate.release();
            }
            if let Some(gate) = prev_gate {
                gate.block();
            }
        }
    }

    /// Mirrors `sleep_thread`.
    pub fn sleep_thread(&self, id: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        let idle_id = inner.idle_id;
        {
            let Inner { threads, policy, .. } = &mut *inner;
            let mut state = ScheduleState { threads, curr: Some(id) };
            policy.sleep(&mut state, id);
        }
        let running = inner.curr_obj == Some(id)
            && inner
                .threads
                .get(&id)
                .map(|t| t.status == ThreadStatus::Running)
                .unwrap_or(false);
        if running {
            drop(inner);
            self.make_reschedule_request();
            let mut inner = self.inner.lock().unwrap();
            if let Some(obj) = inner.threads.get_mut(&id) {
                obj.be_blocking = true;
            }
        } else if let Some(obj) = inner.threads.get_mut(&id) {
            obj.status = ThreadStatus::Blocked;
        }
        let _ = idle_id;
    }

    /// Mirrors `sleep_thread_sync`: spins until the thread is observed blocked.
    pub fn sleep_thread_sync(&self, id: ThreadId) {
        self.sleep_thread(id);
        loop {
            let blocked = self
                .inner
                .lock()
                .unwrap()
                .threads
                .get(&id)
                .map(|t| t.status == ThreadStatus::Blocked)
                .unwrap_or(true);
            if blocked {
                break;
            }
            std::thread::yield_now();
        }
    }

    /// Mirrors `wake_thread`: idempotent for an already-runnable thread.
    pub fn wake_thread(&self, id: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        let was_blocked = inner
            .threads
            .get(&id)
            .map(|t| t.status == ThreadStatus::Blocked || t.be_blocking)
            .unwrap_or(false);
        if was_blocked {
            {
                let Inner { threads, policy, .. } = &mut *inner;
                let mut state = ScheduleState { threads, curr: Some(id) };
                policy.wake(&mut state, id);
            }
            let now_blocked = inner
                .threads
                .get(&id)
                .map(|t| t.status == ThreadStatus::Blocked)
                .unwrap_or(false);
            if now_blocked {
                if let Some(obj) = inner.threads.get_mut(&id) {
                    obj.status = ThreadStatus::Runnable;
                }
                drop(inner);
                self.make_reschedule_request();
                return;
            }
            if let Some(obj) = inner.threads.get_mut(&id) {
                obj.be_blocking = false;
            }
        }
    }

    pub fn yield_current(&self) {
        self.make_reschedule_request();
    }

    /// Runs the scheduler tick handler, requesting a reschedule if the
    /// policy says so (run_countdown hit zero, or idle with runnable work
    /// pending).
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let need = {
            let Inner { threads, policy, curr_obj, .. } = &mut *inner;
            let mut state = ScheduleState { threads, curr: *curr_obj };
            policy.tick(&mut state)
        };
        drop(inner);
        if need {
            self.make_reschedule_request();
        }
    }

    pub fn status_of(&self, id: ThreadId) -> Option<ThreadStatus> {
        self.inner.lock().unwrap().threads.get(&id).map(|t| t.status)
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.inner.lock().unwrap().curr_obj
    }

    pub fn is_idle_thread(&self, id: ThreadId) -> bool {
        self.inner.lock().unwrap().idle_id == id
    }

    /// Transitions a freshly-created thread straight to `Running` on this
    /// pCPU and invokes `entry`. Mirrors `run_thread`.
    pub fn run_thread<F: FnOnce()>(&self, id: ThreadId, entry: F) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.curr_obj = Some(id);
            if let Some(obj) = inner.threads.get_mut(&id) {
                obj.status = ThreadStatus::Running;
            }
        }
        entry();
    }

    pub fn gate_of(&self, id: ThreadId) -> Option<Arc<ParkGate>> {
        self.inner.lock().unwrap().threads.get(&id).map(|t| t.gate.clone())
    }

    /// Parks the calling OS thread on `id`'s gate until the scheduler marks
    /// it `Running` again. Intended for a vCPU worker thread that blocks
    /// itself after `sleep_thread` returns: unlike `ThreadObject::park_until_running`,
    /// this can be called from outside the thread's own `ThreadObject` (the
    /// caller only has a `ThreadId`, e.g. inside `cpu::Vcpu::run`).
    pub fn wait_until_running(&self, id: ThreadId) {
        if let Some(gate) = self.gate_of(id) {
            gate.park();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPolicy;
    impl SchedulerPolicy for NoopPolicy {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn init(&mut self) -> Result<(), SchedError> {
            Ok(())
        }
        fn init_data(&mut self, _: &mut ScheduleState, _: ThreadId, _: SchedParams) {}
        fn pick_next(&mut self, state: &mut ScheduleState, idle_id: ThreadId) -> ThreadId {
            state.curr.unwrap_or(idle_id)
        }
        fn sleep(&mut self, _: &mut ScheduleState, _: ThreadId) {}
        fn wake(&mut self, _: &mut ScheduleState, _: ThreadId) {}
        fn tick(&mut self, _: &mut ScheduleState) -> bool {
            false
        }
    }

    #[test]
    fn idle_runs_when_runqueue_empty() {
        let ctl = ScheduleControl::new(0, Box::new(NoopPolicy)).unwrap();
        assert!(ctl.is_idle_thread(ctl.current().unwrap()));
    }

    #[test]
    fn sleep_then_wake_is_noop_on_runnable_thread() {
        let ctl = ScheduleControl::new(0, Box::new(NoopPolicy)).unwrap();
        let id = ctl.alloc_thread_id();
        ctl.init_thread_data(id, SchedParams::default());
        assert_eq!(ctl.status_of(id), Some(ThreadStatus::Blocked));
        ctl.wake_thread(id);
        // wake on a blocked (never-run) thread transitions it to runnable.
        assert_eq!(ctl.status_of(id), Some(ThreadStatus::Runnable));
    }
}
