// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Cooperative green-thread scheduler.
//!
//! Single operating-system thread; contexts yield at refuel
//! exhaustion, explicit `YIELD`, and blocking I/O. The scheduler
//! rotates a ready queue, parks I/O-blocked contexts in an fd wait set
//! woken via `poll(2)`, keeps timed sleepers in a deadline set, and
//! wakes a registered signal-runner context when a trapped signal
//! fires. Timeout and interrupt flags on a context inject the
//! prearranged exception at its next dispatch.
//!
//! Signal handlers only set atomic flags; all Scheme execution happens
//! at dispatch points.

#[cfg(test)]
mod sched_test;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::context::ContextStatus;
use crate::realm::{GlobalSlot, Realm};
use crate::types::CtxId;
use crate::value::Value;
use crate::vm::{self, RunOutcome};

/// A context parked on a file descriptor.
#[derive(Clone, Copy, Debug)]
struct FdWaiter {
    fd: i32,
    write: bool,
    ctx: CtxId,
}

/// A context parked until a deadline.
#[derive(Clone, Copy, Debug)]
struct Sleeper {
    deadline: Instant,
    ctx: CtxId,
}

/// Scheduler state: ready queue, wait sets, trapped signals.
pub struct Scheduler {
    ready: VecDeque<CtxId>,
    fd_waiters: Vec<FdWaiter>,
    sleepers: Vec<Sleeper>,
    signals: Vec<(i32, Arc<AtomicBool>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            fd_waiters: Vec::new(),
            sleepers: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Append a context to the ready queue.
    pub fn enqueue(&mut self, ctx: CtxId) {
        if !self.ready.contains(&ctx) {
            self.ready.push_back(ctx);
        }
    }

    /// Put a context at the front of the ready queue (signal wakeups).
    pub fn enqueue_front(&mut self, ctx: CtxId) {
        if !self.ready.contains(&ctx) {
            self.ready.push_front(ctx);
        }
    }

    /// Take the next runnable context.
    pub fn take_ready(&mut self) -> Option<CtxId> {
        self.ready.pop_front()
    }

    /// Park a context on a descriptor.
    pub fn block_on_fd(&mut self, ctx: CtxId, fd: i32, write: bool) {
        trace!(?ctx, fd, write, "context blocked on descriptor");
        self.fd_waiters.push(FdWaiter { fd, write, ctx });
    }

    /// Park a context until a deadline; the set stays deadline-sorted.
    pub fn sleep_until(&mut self, ctx: CtxId, deadline: Instant) {
        let at = self
            .sleepers
            .partition_point(|s| s.deadline <= deadline);
        self.sleepers.insert(at, Sleeper { deadline, ctx });
    }

    /// Whether any context is runnable or parked.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.ready.is_empty() || !self.fd_waiters.is_empty() || !self.sleepers.is_empty()
    }

    /// Trap a signal; receipt wakes the registered signal runner.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the handler cannot be installed.
    pub fn trap_signal(&mut self, signal: i32) -> std::io::Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal, Arc::clone(&flag))?;
        self.signals.push((signal, flag));
        Ok(())
    }

    /// Take one pending trapped signal, clearing its flag.
    pub fn take_signal(&mut self) -> Option<i32> {
        for (signal, flag) in &self.signals {
            if flag.swap(false, Ordering::Relaxed) {
                return Some(*signal);
            }
        }
        None
    }

    /// Move expired sleepers to the ready queue.
    fn wake_sleepers(&mut self, now: Instant) {
        while let Some(first) = self.sleepers.first() {
            if first.deadline > now {
                break;
            }
            let sleeper = self.sleepers.remove(0);
            self.ready.push_back(sleeper.ctx);
        }
    }

    /// Block in `poll(2)` until a parked descriptor is ready, a
    /// sleeper expires, or a signal interrupts the wait. Returns false
    /// when there is nothing to wait for.
    fn wait_for_events(&mut self) -> bool {
        if self.fd_waiters.is_empty() && self.sleepers.is_empty() {
            return false;
        }

        let now = Instant::now();
        let timeout_ms = self.sleepers.first().map_or(-1i32, |s| {
            let remaining = s.deadline.saturating_duration_since(now);
            i32::try_from(remaining.as_millis().min(i32::MAX as u128)).unwrap_or(i32::MAX)
        });

        if self.fd_waiters.is_empty() {
            // Pure sleep; no descriptors to watch.
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
        } else {
            let mut fds: Vec<libc::pollfd> = self
                .fd_waiters
                .iter()
                .map(|w| libc::pollfd {
                    fd: w.fd,
                    events: if w.write { libc::POLLOUT } else { libc::POLLIN },
                    revents: 0,
                })
                .collect();
            // SAFETY: fds points at a live, correctly sized pollfd
            // array for the duration of the call.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc > 0 {
                let mut i = 0;
                while i < self.fd_waiters.len() {
                    let revents = fds[i].revents;
                    if revents & (libc::POLLIN | libc::POLLOUT | libc::POLLERR | libc::POLLHUP)
                        != 0
                    {
                        let waiter = self.fd_waiters.remove(i);
                        fds.remove(i);
                        self.ready.push_back(waiter.ctx);
                    } else {
                        i += 1;
                    }
                }
            }
            // rc == 0 is a timeout; rc < 0 is EINTR or a real error,
            // both handled by re-entering the dispatch loop.
        }

        self.wake_sleepers(Instant::now());
        true
    }
}

/// Drive the scheduler until `main` completes, rotating every other
/// ready context cooperatively.
///
/// # Errors
///
/// Returns the uncaught exception that terminated `main`.
pub fn run(realm: &mut Realm, main: CtxId) -> Result<Value, Value> {
    realm.sched.enqueue(main);

    loop {
        // A trapped signal wakes the registered signal runner at the
        // head of the queue.
        if let Some(signal) = realm.sched.take_signal() {
            debug!(signal, "trapped signal");
            if let Value::Context(runner) = realm.global(GlobalSlot::SignalRunner) {
                realm.sched.enqueue_front(runner);
            }
        }

        let Some(ctx) = realm.sched.take_ready() else {
            if realm.sched.wait_for_events() {
                continue;
            }
            // Nothing runnable and nothing to wait for: main is
            // deadlocked.
            let exn = realm
                .make_exception_simple(main, "uncaught", "deadlock: all threads blocked")
                .unwrap_or(Value::Void);
            return Err(exn);
        };

        // Inject prearranged exceptions for flagged contexts before
        // dispatch.
        let injected = {
            let state = realm.ctx(ctx);
            if state.interruptp {
                Some("interrupt")
            } else if state.timeoutp {
                Some("timeout")
            } else {
                None
            }
        };
        let outcome = if let Some(kind) = injected {
            {
                let state = realm.ctx_mut(ctx);
                state.interruptp = false;
                state.timeoutp = false;
            }
            let exn = realm
                .make_exception_simple(ctx, kind, kind)
                .unwrap_or(Value::Void);
            vm::resume_with_raise(realm, ctx, exn)
        } else {
            vm::resume(realm, ctx)
        };

        match outcome {
            RunOutcome::Done(v) => {
                {
                    let state = realm.ctx_mut(ctx);
                    state.status = ContextStatus::Done;
                    state.result = v;
                }
                if ctx == main {
                    return Ok(v);
                }
            }
            RunOutcome::Errored(exn) => {
                {
                    let state = realm.ctx_mut(ctx);
                    state.status = ContextStatus::Failed;
                    state.errorp = true;
                    state.result = exn;
                }
                if ctx == main {
                    return Err(exn);
                }
            }
            RunOutcome::Yielded => {
                realm.ctx_mut(ctx).status = ContextStatus::Ready;
                realm.sched.enqueue(ctx);
            }
            RunOutcome::Blocked { fd, write } => {
                {
                    let state = realm.ctx_mut(ctx);
                    state.status = ContextStatus::Blocked;
                    state.waitp = true;
                }
                realm.sched.block_on_fd(ctx, fd, write);
            }
            RunOutcome::Sleeping { deadline } => {
                realm.ctx_mut(ctx).status = ContextStatus::Sleeping;
                realm.sched.sleep_until(ctx, deadline);
            }
        }
    }
}

/// Spawn a green thread that applies `procedure` to no arguments when
/// first scheduled.
///
/// # Errors
///
/// Returns an exception value when frame setup fails.
pub fn spawn(realm: &mut Realm, procedure: Value) -> Result<CtxId, Value> {
    let ctx = realm.contexts.create();
    vm::prepare(realm, ctx, procedure, &[])?;
    realm.sched.enqueue(ctx);
    Ok(ctx)
}
