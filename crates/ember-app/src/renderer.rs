//! Owner of the backend and scheduler; exposes the frame loop and shutdown.

use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::backend::FrameBackend;
use crate::error::{FrameError, Result};
use crate::resize::ResizeSignal;
use crate::scheduler::{FrameScheduler, FrameStats, TickOutcome};

/// How long the blocking loop sleeps between polls of a zero-sized surface.
const SUSPEND_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// A frame scheduler bound to the backend it drives.
pub struct Renderer<B: FrameBackend> {
    backend: B,
    scheduler: FrameScheduler,
    shut_down: bool,
}

impl<B: FrameBackend> Renderer<B> {
    /// Wrap `backend` and build its first swapchain.
    ///
    /// Configuration errors surface here rather than on the first frame. A
    /// zero-sized surface is not an error; the build is retried on the
    /// first tick.
    pub fn new(mut backend: B, resize: ResizeSignal) -> Result<Self> {
        let mut scheduler = FrameScheduler::new(backend.slot_count(), resize);
        if !scheduler.prepare(&mut backend)? {
            info!("Swapchain not ready yet, retrying on the first frame");
        }
        Ok(Self {
            backend,
            scheduler,
            shut_down: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stats(&self) -> FrameStats {
        self.scheduler.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Run one frame.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.shut_down {
            return Err(FrameError::ShutDown);
        }
        self.scheduler.tick(&mut self.backend)
    }

    /// Tick until `stop` returns true, then shut down.
    ///
    /// `stop` is checked between frames only. While the surface has zero
    /// extent the loop sleeps and polls. A fatal error shuts the renderer
    /// down and is returned unlogged; reporting it is up to the caller.
    pub fn run_frame_loop(&mut self, mut stop: impl FnMut(&FrameStats) -> bool) -> Result<()> {
        while !stop(&self.scheduler.stats()) {
            match self.tick() {
                Ok(TickOutcome::Suspended) => thread::sleep(SUSPEND_POLL_INTERVAL),
                Ok(_) => {}
                Err(e) => {
                    if let Err(shutdown_err) = self.shutdown() {
                        error!("Shutdown after failure also failed: {shutdown_err}");
                    }
                    return Err(e);
                }
            }
        }
        self.shutdown()
    }

    /// Wait for the device to go idle and release every owned GPU object.
    ///
    /// Calling this more than once is a no-op. Objects are released even
    /// when the idle wait fails; that failure is returned afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let idle = self.backend.wait_idle();
        self.backend.release();

        let stats = self.scheduler.stats();
        info!(
            "Renderer shut down after {} frames ({} skipped, {} dropped, {} swapchain rebuilds)",
            stats.presented, stats.skipped, stats.dropped, stats.rebuilds
        );
        idle.map_err(FrameError::from)
    }
}

impl<B: FrameBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Shutdown during drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, Inject, MockBackend};
    use ember_gpu::ErrorKind;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn new_builds_the_first_swapchain() {
        let renderer = Renderer::new(MockBackend::new(2, 3), ResizeSignal::new()).unwrap();
        assert_eq!(renderer.backend().builds(), 1);
        assert_eq!(renderer.backend().command_buffer_count(), 3);
    }

    #[test]
    fn frame_loop_runs_until_stopped_then_releases() {
        let mut renderer = Renderer::new(MockBackend::new(2, 3), ResizeSignal::new()).unwrap();

        renderer
            .run_frame_loop(|stats| stats.presented >= 10)
            .unwrap();

        assert_eq!(renderer.stats().presented, 10);
        assert!(renderer.is_shut_down());
        let backend = renderer.backend();
        assert_eq!(backend.releases, 1);
        assert!(backend.violations.is_empty(), "{:?}", backend.violations);

        // Idle wait comes right before release.
        let n = backend.calls.len();
        assert_eq!(&backend.calls[n - 2..], &[Call::WaitIdle, Call::Release]);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut renderer = Renderer::new(MockBackend::new(2, 3), ResizeSignal::new()).unwrap();
        renderer.tick().unwrap();

        renderer.shutdown().unwrap();
        renderer.shutdown().unwrap();
        assert!(renderer.tick().is_err());

        assert_eq!(renderer.backend().releases, 1);
    }

    #[test]
    fn tick_after_shutdown_is_rejected() {
        let mut renderer = Renderer::new(MockBackend::new(2, 3), ResizeSignal::new()).unwrap();
        renderer.shutdown().unwrap();

        assert!(matches!(renderer.tick(), Err(FrameError::ShutDown)));
    }

    #[test]
    fn fatal_error_shuts_down_and_propagates() {
        let mut backend = MockBackend::new(2, 3);
        backend.present_faults.insert(3, Inject::DeviceLost);
        let mut renderer = Renderer::new(backend, ResizeSignal::new()).unwrap();

        let err = renderer.run_frame_loop(|_| false).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceLost);
        assert!(renderer.is_shut_down());
        assert_eq!(renderer.backend().releases, 1);
        assert_eq!(renderer.stats().presented, 3);
    }

    #[test]
    fn startup_build_failure_surfaces() {
        let mut backend = MockBackend::new(2, 3);
        backend.fail_build = Some(Inject::DeviceLost);

        let result = Renderer::new(backend, ResizeSignal::new());

        assert!(matches!(result, Err(FrameError::Gpu(_))));
    }

    #[test]
    fn fatal_error_is_returned_not_logged() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let mut backend = MockBackend::new(2, 3);
        backend.present_faults.insert(1, Inject::DeviceLost);
        let err = tracing::subscriber::with_default(subscriber, || {
            let mut renderer = Renderer::new(backend, ResizeSignal::new()).unwrap();
            renderer.run_frame_loop(|_| false).unwrap_err()
        });

        let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(!log.contains("ERROR"), "{log}");
        assert!(!log.contains(&err.to_string()), "{log}");
        assert!(log.contains("Renderer shut down"), "{log}");
    }
}
