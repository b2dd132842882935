//! Thread drivers for the inertial and optical pipelines.
//!
//! The sampling thread pulls IMU samples as fast as the source delivers
//! them; the video thread processes blob frames strictly in arrival order.
//! Neither blocks the other; consumers read the tracker's locked state and
//! the optical triple buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use hmd_tracking_imu::{CalibratedSampleSource, OrientationPositionTracker};
use hmd_tracking_led::Blob;

use crate::optical::{FrameReport, OpticalOutputs, OpticalTracker};

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
    #[error("video thread is no longer accepting frames")]
    Closed,
}

const SAMPLING_THREAD: &str = "imu-sampling";
const VIDEO_THREAD: &str = "optical-video";

/// Feeds a [`CalibratedSampleSource`] into a shared tracker on its own thread.
pub struct SamplingTask {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl SamplingTask {
    pub fn spawn(
        mut source: Box<dyn CalibratedSampleSource>,
        tracker: Arc<OrientationPositionTracker>,
    ) -> Result<Self, TaskError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(SAMPLING_THREAD.into())
            .spawn(move || {
                let mut count = 0u64;
                while !flag.load(Ordering::Acquire) {
                    let Some(sample) = source.next_sample() else {
                        break;
                    };
                    tracker.integrate_sample(&sample);
                    count += 1;
                }
                log::info!("sampling stopped after {count} samples");
                count
            })
            .map_err(|source| TaskError::Spawn {
                name: SAMPLING_THREAD,
                source,
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to stop after the sample it is integrating.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the thread has exited (stopped or source exhausted).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread and return the number of integrated samples.
    ///
    /// Does not request a stop; call [`stop`](Self::stop) first for an
    /// endless source.
    pub fn join(mut self) -> Result<u64, TaskError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| TaskError::Panicked(SAMPLING_THREAD)),
            None => Ok(0),
        }
    }
}

impl Drop for SamplingTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

/// Callback invoked on the video thread after every frame.
pub type FrameCallback = Box<dyn FnMut(&FrameReport) + Send>;

/// Runs an [`OpticalTracker`] on its own thread, fed through a bounded channel.
pub struct VideoTask {
    frames: Option<Sender<Vec<Blob>>>,
    outputs: Arc<OpticalOutputs>,
    handle: Option<JoinHandle<OpticalTracker>>,
}

impl VideoTask {
    /// Start the video thread. At most `queue` frames wait for processing;
    /// [`submit`](Self::submit) blocks beyond that.
    pub fn spawn(
        mut tracker: OpticalTracker,
        queue: usize,
        mut on_frame: Option<FrameCallback>,
    ) -> Result<Self, TaskError> {
        let (frames, receiver) = bounded::<Vec<Blob>>(queue.max(1));
        let outputs = tracker.outputs();
        let handle = thread::Builder::new()
            .name(VIDEO_THREAD.into())
            .spawn(move || {
                for blobs in receiver.iter() {
                    let report = tracker.process_frame(&blobs);
                    if let Some(callback) = on_frame.as_mut() {
                        callback(&report);
                    }
                }
                log::info!("video thread drained, {} frames seen", tracker.identifier().frame_index());
                tracker
            })
            .map_err(|source| TaskError::Spawn {
                name: VIDEO_THREAD,
                source,
            })?;
        Ok(Self {
            frames: Some(frames),
            outputs,
            handle: Some(handle),
        })
    }

    /// Queue one frame's blobs.
    pub fn submit(&self, blobs: Vec<Blob>) -> Result<(), TaskError> {
        self.frames
            .as_ref()
            .ok_or(TaskError::Closed)?
            .send(blobs)
            .map_err(|_| TaskError::Closed)
    }

    /// Extra producer handle, e.g. for a capture thread. The video thread
    /// only exits once every handle is dropped.
    pub fn sender(&self) -> Option<Sender<Vec<Blob>>> {
        self.frames.clone()
    }

    pub fn outputs(&self) -> Arc<OpticalOutputs> {
        Arc::clone(&self.outputs)
    }

    /// Close the queue, process what is left and hand the tracker back.
    pub fn finish(mut self) -> Result<OpticalTracker, TaskError> {
        self.frames = None;
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| TaskError::Panicked(VIDEO_THREAD)),
            None => Err(TaskError::Closed),
        }
    }
}

impl Drop for VideoTask {
    fn drop(&mut self) {
        self.frames = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmd_tracking_imu::{CalibratedSample, ImuCalibration, TrackerParams};
    use nalgebra::Vector3;

    /// Endless source of identical at-rest samples.
    struct Stationary {
        calibration: ImuCalibration,
        time_stamp: u32,
    }

    impl CalibratedSampleSource for Stationary {
        fn next_sample(&mut self) -> Option<CalibratedSample> {
            self.time_stamp = self.time_stamp.wrapping_add(1000);
            let sample = CalibratedSample::new(
                Vector3::new(0.0, 0.0, 9.81),
                Vector3::zeros(),
                Vector3::new(0.3, 0.0, -0.4),
                self.time_stamp,
            );
            thread::yield_now();
            Some(sample.with_warmup(self.time_stamp <= 20_000))
        }

        fn calibration(&self) -> &ImuCalibration {
            &self.calibration
        }
    }

    #[test]
    fn sampling_task_runs_until_stopped() {
        let tracker = Arc::new(OrientationPositionTracker::new(TrackerParams::default()));
        let source = Stationary {
            calibration: ImuCalibration::default(),
            time_stamp: 0,
        };
        let task = SamplingTask::spawn(Box::new(source), Arc::clone(&tracker)).expect("spawn");
        while !tracker.is_tracking() {
            thread::yield_now();
        }
        task.stop();
        let count = task.join().expect("join");
        assert!(count > 20);
        assert!(tracker.is_tracking());
        assert!(tracker.lock_new_state());
        assert!((tracker.get_locked_state().rotation.norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn video_task_processes_frames_in_order() {
        use crate::optical::OpticalTrackerParams;
        use hmd_tracking_core::CameraIntrinsics;
        use hmd_tracking_led::{Marker, MarkerModel};
        use nalgebra::{Point2, Point3};
        use std::sync::Mutex;

        let model = MarkerModel::new(vec![Marker {
            pattern: 0x155,
            position: Point3::origin(),
            direction: -Vector3::z(),
        }])
        .expect("model");
        let camera = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480]);
        let tracker = OpticalTracker::new(Arc::new(model), camera, OpticalTrackerParams::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: FrameCallback = Box::new(move |report| {
            if let Ok(mut frames) = sink.lock() {
                frames.push(report.frame_index);
            }
        });
        let task = VideoTask::spawn(tracker, 4, Some(callback)).expect("spawn");
        let outputs = task.outputs();
        for _ in 0..12 {
            task.submit(vec![Blob::disc(Point2::new(100.0, 100.0), 4)]).expect("submit");
        }
        let tracker = task.finish().expect("finish");

        assert_eq!(tracker.identifier().frame_index(), 12);
        assert_eq!(*seen.lock().expect("frames"), (0..12).collect::<Vec<u64>>());
        assert!(outputs.lock_new_blobs());
        assert_eq!(outputs.locked_blobs().len(), 1);
    }
}
