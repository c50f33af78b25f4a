// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared timer thread for reliability engines.
//!
//! One `hdds-timer` thread serves every registered engine: it sleeps until
//! the earliest [`ReliabilityEngine::next_deadline`], then calls
//! [`ReliabilityEngine::process_timers`] on each engine that is due.
//!
//! ```text
//!  engine.write() ──arm heartbeat──> TimerHandle::wake() ──┐
//!                                                          v
//!  hdds-timer: recv_timeout(min(next deadline, idle tick)) ─> process_timers(now)
//! ```
//!
//! Engines are held weakly; a dropped engine silently leaves the schedule.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::ReliabilityEngine;
use crate::dds::{Error, Result};

/// Upper bound on a single sleep, so deadlines armed without a wake are
/// still honoured.
const IDLE_TICK: Duration = Duration::from_millis(100);
/// Floor on a sleep, against engines reporting an already elapsed deadline.
const MIN_SLEEP: Duration = Duration::from_micros(500);

enum TimerCommand {
    Register(Weak<dyn ReliabilityEngine>),
    Wake,
    Stop,
}

/// Cheap handle used by engines to wake the timer thread.
#[derive(Clone)]
pub struct TimerHandle {
    tx: Sender<TimerCommand>,
}

impl TimerHandle {
    /// Ask the timer thread to recompute its next wake-up.
    pub fn wake(&self) {
        let _ = self.tx.send(TimerCommand::Wake);
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

/// Timer thread owner. Dropping it stops and joins the thread.
pub struct TimedEventService {
    tx: Sender<TimerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimedEventService {
    /// Spawn the `hdds-timer` thread.
    pub fn start() -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("hdds-timer".to_string())
            .spawn(move || Self::run(rx))
            .map_err(|e| Error::InvalidState(format!("failed to spawn timer thread: {}", e)))?;
        log::debug!("[timer] started");
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Put an engine on the schedule and give it a wake handle.
    pub fn register(&self, engine: &Arc<dyn ReliabilityEngine>) {
        engine.attach_timer(self.handle());
        let _ = self.tx.send(TimerCommand::Register(Arc::downgrade(engine)));
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop and join the thread. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(TimerCommand::Stop);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::warn!("[timer] thread panicked");
            }
            log::debug!("[timer] stopped");
        }
    }

    fn run(rx: Receiver<TimerCommand>) {
        let mut engines: Vec<Weak<dyn ReliabilityEngine>> = Vec::new();
        loop {
            let next = Self::fire_due(&mut engines);
            let sleep = next
                .map_or(IDLE_TICK, |at| at.saturating_duration_since(Instant::now()))
                .clamp(MIN_SLEEP, IDLE_TICK);

            match rx.recv_timeout(sleep) {
                Ok(TimerCommand::Register(engine)) => engines.push(engine),
                Ok(TimerCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(TimerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            }
            // Coalesce bursts of wakes.
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    TimerCommand::Register(engine) => engines.push(engine),
                    TimerCommand::Wake => {}
                    TimerCommand::Stop => return,
                }
            }
        }
    }

    /// Fire every due engine; return the earliest remaining deadline.
    fn fire_due(engines: &mut Vec<Weak<dyn ReliabilityEngine>>) -> Option<Instant> {
        engines.retain(|engine| engine.strong_count() > 0);
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        for weak in engines.iter() {
            let Some(engine) = weak.upgrade() else {
                continue;
            };
            let mut deadline = engine.next_deadline();
            if deadline.is_some_and(|at| at <= now) {
                log::trace!("[timer] firing {}", engine.guid());
                engine.process_timers(now);
                deadline = engine.next_deadline();
            }
            if let Some(at) = deadline {
                next = Some(next.map_or(at, |cur| cur.min(at)));
            }
        }
        next
    }
}

impl Drop for TimedEventService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TimedEventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedEventService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::{GuidPrefix, GUID};
    use crate::reliability::messages::Submessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        period: Duration,
        next: Mutex<Instant>,
        fired: AtomicUsize,
    }

    impl ReliabilityEngine for Ticker {
        fn guid(&self) -> GUID {
            GUID::zero()
        }
        fn on_submessage(&self, _source_prefix: GuidPrefix, _submessage: &Submessage) {}
        fn process_timers(&self, now: Instant) {
            self.fired.fetch_add(1, Ordering::SeqCst);
            *self.next.lock() = now + self.period;
        }
        fn next_deadline(&self) -> Option<Instant> {
            Some(*self.next.lock())
        }
        fn attach_timer(&self, _handle: TimerHandle) {}
    }

    #[test]
    fn test_timer_fires_registered_engine() {
        let service = TimedEventService::start().expect("timer should start");
        let ticker = Arc::new(Ticker {
            period: Duration::from_millis(5),
            next: Mutex::new(Instant::now()),
            fired: AtomicUsize::new(0),
        });
        let engine: Arc<dyn ReliabilityEngine> = ticker.clone();
        service.register(&engine);

        let deadline = Instant::now() + Duration::from_secs(2);
        while ticker.fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ticker.fired.load(Ordering::SeqCst) >= 3);
        service.stop();
    }

    #[test]
    fn test_dropped_engine_leaves_schedule() {
        let service = TimedEventService::start().expect("timer should start");
        let engine: Arc<dyn ReliabilityEngine> = Arc::new(Ticker {
            period: Duration::from_millis(1),
            next: Mutex::new(Instant::now()),
            fired: AtomicUsize::new(0),
        });
        service.register(&engine);
        drop(engine);
        service.handle().wake();
        thread::sleep(Duration::from_millis(20));
        service.stop();
    }
}
