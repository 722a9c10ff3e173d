use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::analysis;
use super::decode::RawAudioBuffer;
use super::features::WorkerFeatureResult;
use crate::error::WorkerError;

/// Input for one worker run. Holds shared handles, never the only copy of
/// the decoded samples.
#[derive(Clone, Debug)]
pub struct WorkerRequest {
    pub left: Arc<[f32]>,
    pub right: Option<Arc<[f32]>>,
    pub sample_rate: u32,
}

impl WorkerRequest {
    pub fn from_buffer(buffer: &RawAudioBuffer) -> Self {
        let (left, right) = buffer.shared_channels();
        Self {
            left,
            right,
            sample_rate: buffer.sample_rate(),
        }
    }
}

/// Analysis run on the worker thread.
pub type Engine = fn(&WorkerRequest, &AtomicBool) -> Result<WorkerFeatureResult, WorkerError>;

/// The DSP engine the worker runs unless told otherwise.
pub fn run_analysis(request: &WorkerRequest, abort: &AtomicBool) -> Result<WorkerFeatureResult, WorkerError> {
    analysis::analyze(&request.left, request.right.as_deref(), request.sample_rate, abort)
}

/// A running analysis on its own thread, answered once over a channel.
pub struct WorkerHandle {
    rx: Receiver<Result<WorkerFeatureResult, WorkerError>>,
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(request: WorkerRequest) -> Result<Self, WorkerError> {
        Self::spawn_with(request, run_analysis)
    }

    /// Spawn a worker running `engine`. Panics inside it come back as
    /// `WorkerError::Compute`.
    pub fn spawn_with(request: WorkerRequest, engine: Engine) -> Result<Self, WorkerError> {
        let (tx, rx) = mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));
        let worker_abort = Arc::clone(&abort);

        let thread = thread::Builder::new()
            .name("dsp-worker".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine(&request, &worker_abort)));
                let response = outcome.unwrap_or_else(|payload| {
                    Err(WorkerError::Compute(format!("worker panicked: {}", panic_message(payload.as_ref()))))
                });
                // The receiver is gone if the caller already timed out
                let _ = tx.send(response);
            })
            .map_err(|e| WorkerError::Compute(format!("failed to spawn worker: {}", e)))?;

        log::debug!("Spawned DSP worker");

        Ok(Self {
            rx,
            abort,
            thread: Some(thread),
        })
    }

    /// Wait for the worker's answer. On timeout the worker is told to stop
    /// and left to exit on its own.
    pub fn wait(mut self, timeout: Duration) -> Result<WorkerFeatureResult, WorkerError> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                response
            }
            Err(RecvTimeoutError::Timeout) => {
                self.abort.store(true, Ordering::Relaxed);
                Err(WorkerError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::Disconnected),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_buffer(secs: f32, stereo: bool) -> RawAudioBuffer {
        let sr = 22050;
        let n = (secs * sr as f32) as usize;
        let tone: Vec<f32> = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sr as f32).sin())
            .collect();
        let channels = if stereo { vec![tone.clone(), tone] } else { vec![tone] };
        RawAudioBuffer::new(sr, channels).unwrap()
    }

    #[test]
    fn round_trip_leaves_buffer_readable() {
        let buffer = tone_buffer(2.0, true);
        let handle = WorkerHandle::spawn(WorkerRequest::from_buffer(&buffer)).unwrap();
        let result = handle.wait(Duration::from_secs(60)).unwrap();

        assert_eq!(result.stereo.correlation, 1.0);
        assert_eq!(buffer.frames(), 44100);
        assert!(buffer.left().iter().any(|s| *s != 0.0));
    }

    #[test]
    fn compute_errors_come_back_typed() {
        let request = WorkerRequest {
            left: Arc::from(vec![0.1f32; 1000]),
            right: Some(Arc::from(vec![0.1f32; 999])),
            sample_rate: 22050,
        };
        let err = WorkerHandle::spawn(request).unwrap().wait(Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, WorkerError::Compute(_)), "got {:?}", err);
    }

    fn exploding(_request: &WorkerRequest, _abort: &AtomicBool) -> Result<WorkerFeatureResult, WorkerError> {
        panic!("engine exploded")
    }

    fn exploding_formatted(request: &WorkerRequest, _abort: &AtomicBool) -> Result<WorkerFeatureResult, WorkerError> {
        panic!("bad frame at {} Hz", request.sample_rate)
    }

    #[test]
    fn engine_panic_comes_back_as_compute_error() {
        let buffer = tone_buffer(1.0, false);
        for (engine, expected) in [
            (exploding as Engine, "worker panicked: engine exploded"),
            (exploding_formatted as Engine, "worker panicked: bad frame at 22050 Hz"),
        ] {
            let err = WorkerHandle::spawn_with(WorkerRequest::from_buffer(&buffer), engine)
                .unwrap()
                .wait(Duration::from_secs(60))
                .unwrap_err();
            match err {
                WorkerError::Compute(msg) => assert_eq!(msg, expected),
                other => panic!("expected compute error, got {:?}", other),
            }
        }
    }

    #[test]
    fn timed_out_worker_lets_go_of_samples() {
        let buffer = tone_buffer(120.0, true);
        let left = buffer.shared_channels().0;
        let handle = WorkerHandle::spawn(WorkerRequest::from_buffer(&buffer)).unwrap();
        drop(buffer);

        assert!(matches!(handle.wait(Duration::ZERO), Err(WorkerError::Timeout(_))));

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while Arc::strong_count(&left) > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(Arc::strong_count(&left), 1);
    }

    #[test]
    fn zero_timeout_reports_timeout() {
        let buffer = tone_buffer(60.0, true);
        let handle = WorkerHandle::spawn(WorkerRequest::from_buffer(&buffer)).unwrap();
        let err = handle.wait(Duration::ZERO).unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)), "got {:?}", err);
    }
}
