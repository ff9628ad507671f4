// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for frame loops
//!
//! Both sides of the preview pipeline run a loop on a dedicated thread: the
//! ports' capture loops and the render worker. This module gives them one
//! start/stop/join discipline built on a shared stop flag.

use crossbeam_channel::Receiver;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the loop callback to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Controller for a loop running in a separate thread
///
/// # Example
///
/// ```ignore
/// let mut controller = FrameLoopController::start("capture", || {
///     match capture_frame() {
///         Ok(frame) => {
///             deliver(frame);
///             LoopAction::Continue
///         }
///         Err(_) => LoopAction::Stop,
///     }
/// })?;
///
/// controller.stop();
/// ```
pub struct FrameLoopController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl FrameLoopController {
    /// Start a loop in a separate thread with its own stop signal
    ///
    /// The closure is called repeatedly until it returns `LoopAction::Stop`
    /// or [`stop`](Self::stop) is called. Fails if the OS refuses the thread.
    pub fn start<F>(name: &str, loop_fn: F) -> io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::start_with_signal(name, Arc::new(AtomicBool::new(false)), loop_fn)
    }

    /// Start a loop that observes an externally owned stop signal
    pub fn start_with_signal<F>(
        name: &str,
        stop_signal: Arc<AtomicBool>,
        mut loop_fn: F,
    ) -> io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting frame loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Frame loop thread started");
                run_loop(&name_clone, &stop_signal_clone, || loop_fn());
                info!(name = %name_clone, "Frame loop thread exiting");
            })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    /// Start a loop with initialization and teardown
    ///
    /// `init_fn` runs once on the new thread. Its outcome is sent on the
    /// returned receiver so the caller can wait for it; on failure the loop
    /// never runs. `finish_fn` receives the state after the loop exits,
    /// whichever side stopped it.
    pub fn start_with_init<S, E, I, F, T>(
        name: &str,
        stop_signal: Arc<AtomicBool>,
        init_fn: I,
        mut loop_fn: F,
        finish_fn: T,
    ) -> io::Result<(Self, Receiver<Result<(), E>>)>
    where
        S: 'static,
        E: Send + 'static,
        I: FnOnce() -> Result<S, E> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
        T: FnOnce(S) + Send + 'static,
    {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting frame loop with initialization");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Frame loop thread started, initializing");

                let mut state = match init_fn() {
                    Ok(state) => {
                        debug!(name = %name_clone, "Initialization successful");
                        let _ = init_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        warn!(name = %name_clone, "Initialization failed");
                        stop_signal_clone.store(true, Ordering::SeqCst);
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                run_loop(&name_clone, &stop_signal_clone, || loop_fn(&mut state));
                finish_fn(state);

                info!(name = %name_clone, "Frame loop thread exiting");
            })?;

        Ok((
            Self {
                thread_handle: Some(thread_handle),
                stop_signal,
                name: name.to_string(),
            },
            init_rx,
        ))
    }

    /// Check if the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Get a clone of the stop signal for external use
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Signal the loop to stop (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting frame loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread to finish
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the thread to finish without sending the stop signal
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Waiting for frame loop thread to finish");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Frame loop thread panicked: {:?}", e);
            } else {
                debug!(name = %self.name, "Frame loop thread finished");
            }
        }
    }
}

impl Drop for FrameLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "FrameLoopController dropped, stopping loop");
            self.stop();
        }
    }
}

fn run_loop(name: &str, stop_signal: &AtomicBool, mut iteration: impl FnMut() -> LoopAction) {
    loop {
        if stop_signal.load(Ordering::SeqCst) {
            debug!(name = %name, "Stop signal received");
            break;
        }

        if iteration() == LoopAction::Stop {
            debug!(name = %name, "Loop requested stop");
            stop_signal.store(true, Ordering::SeqCst);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_basic_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = FrameLoopController::start("test-loop", move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            if count >= 10 {
                LoopAction::Stop
            } else {
                LoopAction::Continue
            }
        })
        .unwrap();

        controller.join();

        assert_eq!(counter.load(Ordering::SeqCst), 11); // 0-10 inclusive
    }

    #[test]
    fn test_stop_signal() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = FrameLoopController::start("test-loop", move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            LoopAction::Continue
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));

        controller.stop();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_loop_stop_sets_shared_signal() {
        let signal = Arc::new(AtomicBool::new(false));
        let mut controller =
            FrameLoopController::start_with_signal("test-shared", Arc::clone(&signal), || {
                LoopAction::Stop
            })
            .unwrap();

        controller.join();
        assert!(signal.load(Ordering::SeqCst));
    }

    #[test]
    fn test_with_init_and_finish() {
        let result = Arc::new(AtomicU32::new(0));
        let result_clone = Arc::clone(&result);
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = Arc::clone(&finished);

        let (mut controller, init) = FrameLoopController::start_with_init(
            "test-init-loop",
            Arc::new(AtomicBool::new(false)),
            || Ok::<_, String>(42u32),
            move |state| {
                result_clone.store(*state, Ordering::SeqCst);
                LoopAction::Stop
            },
            move |_state| finished_clone.store(true, Ordering::SeqCst),
        )
        .unwrap();

        assert_eq!(init.recv().unwrap(), Ok(()));
        controller.join();
        assert_eq!(result.load(Ordering::SeqCst), 42);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_init_failure() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let (mut controller, init) = FrameLoopController::start_with_init(
            "test-fail-init",
            Arc::new(AtomicBool::new(false)),
            || Err::<(), _>("Init failed".to_string()),
            move |_: &mut ()| {
                ran_clone.store(true, Ordering::SeqCst);
                LoopAction::Stop
            },
            |_| {},
        )
        .unwrap();

        assert_eq!(init.recv().unwrap(), Err("Init failed".to_string()));
        controller.join();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(controller.stop_signal().load(Ordering::SeqCst));
    }

    #[test]
    fn test_is_running() {
        let controller = FrameLoopController::start("test-running", || {
            thread::sleep(Duration::from_millis(100));
            LoopAction::Continue
        })
        .unwrap();

        assert!(controller.is_running());

        // Drop will stop it
        drop(controller);
    }
}
