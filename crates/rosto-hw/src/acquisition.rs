//! Continuous frame acquisition on a dedicated thread.
//!
//! The thread owns the frame source for its whole life: it opens it, reads
//! frames in a blocking loop, and checks for a [`Signal`] after every frame.
//! On `Capture` the current frame is handed to the capture callback on the
//! same thread and the loop ends; on `Cancel` (or when the handle is dropped)
//! the loop ends without a capture. The source is dropped on every exit path,
//! including errors.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Anything that yields frames one blocking read at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Control messages polled by the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Capture,
    Cancel,
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("acquisition thread exited")]
    ChannelClosed,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(std::io::Error),
}

/// How an acquisition loop ended.
#[derive(Debug)]
pub enum AcquisitionOutcome<R> {
    /// A frame was captured; holds the capture callback's result.
    Captured(R),
    Cancelled,
}

type Completion<R> = oneshot::Receiver<Result<AcquisitionOutcome<R>, AcquisitionError>>;

/// Handle to a running acquisition thread.
///
/// Dropping the handle cancels the loop.
pub struct AcquisitionHandle<R> {
    signals: mpsc::Sender<Signal>,
    done: Completion<R>,
}

impl<R> AcquisitionHandle<R> {
    /// Ask for the next frame and wait for the capture callback's result.
    ///
    /// If the loop already ended (e.g. the camera failed), that error is
    /// returned instead.
    pub async fn capture(self) -> Result<AcquisitionOutcome<R>, AcquisitionError> {
        // A closed channel means the loop is gone; `done` says why.
        let _ = self.signals.send(Signal::Capture).await;
        self.done.await.map_err(|_| AcquisitionError::ChannelClosed)?
    }

    /// Stop the loop without capturing and wait for it to release the source.
    pub async fn cancel(self) -> Result<(), AcquisitionError> {
        let _ = self.signals.send(Signal::Cancel).await;
        self.done.await.map_err(|_| AcquisitionError::ChannelClosed)?.map(|_| ())
    }

    /// Blocking variant of [`capture`](Self::capture) for callers outside a
    /// tokio runtime.
    pub fn blocking_capture(self) -> Result<AcquisitionOutcome<R>, AcquisitionError> {
        let _ = self.signals.blocking_send(Signal::Capture);
        self.done.blocking_recv().map_err(|_| AcquisitionError::ChannelClosed)?
    }

    /// Blocking variant of [`cancel`](Self::cancel).
    pub fn blocking_cancel(self) -> Result<(), AcquisitionError> {
        let _ = self.signals.blocking_send(Signal::Cancel);
        self.done
            .blocking_recv()
            .map_err(|_| AcquisitionError::ChannelClosed)?
            .map(|_| ())
    }
}

/// Spawn the acquisition loop on a dedicated OS thread.
///
/// `open` runs on the new thread, so the source never crosses threads.
/// `on_capture` receives exactly one frame, synchronously, before the loop
/// terminates.
pub fn spawn_acquisition<S, O, F, R>(open: O, on_capture: F) -> Result<AcquisitionHandle<R>, AcquisitionError>
where
    S: FrameSource,
    O: FnOnce() -> Result<S, CameraError> + Send + 'static,
    F: FnOnce(Frame) -> R + Send + 'static,
    R: Send + 'static,
{
    let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(4);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rosto-acquisition".into())
        .spawn(move || {
            tracing::info!("acquisition thread started");
            let result = open()
                .map_err(AcquisitionError::from)
                .and_then(|mut source| run_loop(&mut source, &mut signal_rx, on_capture));
            if let Err(e) = &result {
                tracing::warn!(error = %e, "acquisition loop failed");
            }
            let _ = done_tx.send(result);
            tracing::info!("acquisition thread exiting");
        })
        .map_err(AcquisitionError::Spawn)?;

    Ok(AcquisitionHandle {
        signals: signal_tx,
        done: done_rx,
    })
}

fn run_loop<S, F, R>(
    source: &mut S,
    signals: &mut mpsc::Receiver<Signal>,
    on_capture: F,
) -> Result<AcquisitionOutcome<R>, AcquisitionError>
where
    S: FrameSource,
    F: FnOnce(Frame) -> R,
{
    let mut frames = 0u64;
    loop {
        let frame = source.next_frame()?;
        frames += 1;

        match signals.try_recv() {
            Ok(Signal::Capture) => {
                tracing::info!(frames, sequence = frame.sequence, "frame captured");
                return Ok(AcquisitionOutcome::Captured(on_capture(frame)));
            }
            Ok(Signal::Cancel) | Err(TryRecvError::Disconnected) => {
                tracing::info!(frames, "acquisition cancelled");
                return Ok(AcquisitionOutcome::Cancelled);
            }
            Err(TryRecvError::Empty) => {}
        }
    }
}
