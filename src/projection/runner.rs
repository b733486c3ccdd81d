//! Projection task runner
//!
//! Serializes projection work per runner: at most one task executes at a
//! time, and calls arriving during execution coalesce into a single
//! follow-up run.

use std::future::Future;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    queued: bool,
}

/// Coalescing single-flight runner.
#[derive(Debug, Default)]
pub struct ProjectionTaskRunner {
    state: Mutex<RunState>,
}

impl ProjectionTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task`, coalescing overlapping calls.
    ///
    /// If a run is already active, this marks one follow-up run and returns
    /// immediately; the active call re-runs the task once more after it
    /// finishes. Multiple queued calls collapse into that single follow-up.
    pub async fn run<F, Fut>(&self, task: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ()>,
    {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                state.queued = true;
                return;
            }
            state.running = true;
        }

        loop {
            task().await;

            let mut state = self.state.lock().unwrap();
            if state.queued {
                state.queued = false;
                // Keep running; another call arrived mid-flight.
            } else {
                state.running = false;
                break;
            }
        }
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}
