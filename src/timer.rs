//! Restartable one-shot timers used for auto-save and preview debouncing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Callback run once each time an armed timer elapses.
pub type ElapsedHandler = Arc<dyn Fn() + Send + Sync>;

/// A one-shot timer that can be armed, disarmed and re-armed.
pub trait Timer: Send + Sync {
    /// Arms the timer. Does nothing if it is already armed.
    fn start(&self);
    /// Disarms the timer. A pending elapse never fires.
    fn stop(&self);
    /// Disarms and re-arms, restarting the full interval.
    fn restart(&self) {
        self.stop();
        self.start();
    }
    fn interval(&self) -> Duration;
    /// Sets the interval used by the next arm.
    fn set_interval(&self, interval: Duration);
    fn is_started(&self) -> bool;
}

/// Creates timers for editor sessions. Each session owns its timers.
pub trait TimerFactory: Send + Sync {
    fn create(&self, interval: Duration, on_elapsed: ElapsedHandler) -> Box<dyn Timer>;
}

struct TimerState {
    interval: Duration,
    generation: u64,
    started: bool,
    task: Option<JoinHandle<()>>,
}

/// Timer backed by a tokio sleep task.
///
/// Each arm bumps a generation counter; an elapsed sleep whose generation is
/// no longer current is ignored, so a stop racing with the wake-up cannot
/// fire the callback.
pub struct TokioTimer {
    state: Arc<Mutex<TimerState>>,
    on_elapsed: ElapsedHandler,
    runtime: Handle,
}

impl TokioTimer {
    /// Must be called from within a tokio runtime.
    pub fn new(interval: Duration, on_elapsed: ElapsedHandler) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                interval,
                generation: 0,
                started: false,
                task: None,
            })),
            on_elapsed,
            runtime: Handle::current(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Timer for TokioTimer {
    fn start(&self) {
        let mut st = self.lock();
        if st.started {
            return;
        }
        st.generation += 1;
        st.started = true;

        let generation = st.generation;
        let interval = st.interval;
        let state = Arc::downgrade(&self.state);
        let on_elapsed = self.on_elapsed.clone();
        st.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                if st.generation != generation || !st.started {
                    return;
                }
                st.started = false;
                st.task = None;
            }
            on_elapsed();
        }));
    }

    fn stop(&self) {
        let mut st = self.lock();
        st.generation += 1;
        st.started = false;
        if let Some(task) = st.task.take() {
            task.abort();
        }
    }

    fn interval(&self) -> Duration {
        self.lock().interval
    }

    fn set_interval(&self, interval: Duration) {
        self.lock().interval = interval;
    }

    fn is_started(&self) -> bool {
        self.lock().started
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn create(&self, interval: Duration, on_elapsed: ElapsedHandler) -> Box<dyn Timer> {
        Box::new(TokioTimer::new(interval, on_elapsed))
    }
}
