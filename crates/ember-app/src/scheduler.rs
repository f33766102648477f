//! The per-frame acquire, submit, present state machine.

use ember_gpu::swapchain::AcquireOutcome;
use ember_gpu::sync::FrameSlot;
use ember_gpu::{ErrorKind, GpuError};
use tracing::{debug, trace, warn};

use crate::backend::FrameBackend;
use crate::error::{FrameError, Result};
use crate::lifecycle::{RebuildOutcome, SwapchainLifecycle};
use crate::resize::ResizeSignal;

/// Where the scheduler is within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Submitting,
    Presenting,
    /// The swapchain must be rebuilt before the next frame can start.
    NeedsRebuild,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Frame `frame` was submitted and handed to the presentation engine.
    Presented { frame: u64, image_index: u32 },
    /// Frame `frame` was abandoned before submission; a rebuild follows.
    Skipped { frame: u64 },
    /// Frame `frame` was submitted but presentation failed; a rebuild
    /// follows.
    Dropped { frame: u64 },
    /// The surface has zero extent. No frame was started.
    Suspended,
}

/// Counters kept across the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    /// Frames abandoned before submission.
    pub skipped: u64,
    /// Frames submitted but never presented.
    pub dropped: u64,
    /// Swapchain rebuilds after the initial build.
    pub rebuilds: u64,
}

enum Readiness {
    Ready,
    Suspended,
    Retrying,
}

/// Drives one frame per [`tick`](Self::tick) over a [`FrameBackend`].
///
/// Frame `n` uses slot `n % slot_count`. The scheduler remembers which slot
/// last wrote each swapchain image and waits for that slot's fence before
/// the image is written again.
pub struct FrameScheduler {
    state: FrameState,
    frame_counter: u64,
    slot_count: usize,
    /// Slot whose submission last wrote each swapchain image.
    image_writers: Vec<Option<FrameSlot>>,
    lifecycle: SwapchainLifecycle,
    resize: ResizeSignal,
    exhaustion_retried: bool,
    stats: FrameStats,
}

impl FrameScheduler {
    /// Create a scheduler over `slot_count` frame slots. No swapchain exists
    /// yet, so the first tick builds one.
    pub fn new(slot_count: usize, resize: ResizeSignal) -> Self {
        Self {
            state: FrameState::NeedsRebuild,
            frame_counter: 0,
            slot_count: slot_count.max(1),
            image_writers: Vec::new(),
            lifecycle: SwapchainLifecycle::new(),
            resize,
            exhaustion_retried: false,
            stats: FrameStats::default(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Index of the next frame to run.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Force a rebuild before the next frame.
    pub fn request_rebuild(&mut self) {
        self.state = FrameState::NeedsRebuild;
    }

    /// Build the swapchain if one is needed. Returns `false` while the
    /// surface has zero extent.
    pub fn prepare<B: FrameBackend>(&mut self, backend: &mut B) -> Result<bool> {
        Ok(matches!(self.rebuild_if_needed(backend)?, Readiness::Ready))
    }

    /// Run one frame.
    ///
    /// Transient swapchain states are absorbed: they end the tick early or
    /// schedule a rebuild for the next one. Only errors that end the frame
    /// loop are returned.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn tick<B: FrameBackend>(&mut self, backend: &mut B) -> Result<TickOutcome> {
        match self.rebuild_if_needed(backend)? {
            Readiness::Ready => {}
            Readiness::Suspended => return Ok(TickOutcome::Suspended),
            Readiness::Retrying => {
                self.stats.skipped += 1;
                return Ok(TickOutcome::Skipped {
                    frame: self.frame_counter,
                });
            }
        }

        let frame = self.frame_counter;
        let slot = FrameSlot::for_frame(frame, self.slot_count);
        let outcome = self.run_frame(backend, frame, slot);

        // Aborted frames consume their number too.
        self.frame_counter = frame.wrapping_add(1);
        outcome
    }

    fn run_frame<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        frame: u64,
        slot: FrameSlot,
    ) -> Result<TickOutcome> {
        trace!(frame, slot = slot.index(), "frame start");

        // The slot's previous submission must be finished before its
        // semaphores and fence are reused.
        backend.wait_for_slot(slot)?;

        self.state = FrameState::Acquiring;
        let (image_index, suboptimal) = match backend.acquire_next_image(slot) {
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }) => (image_index, suboptimal),
            Ok(AcquireOutcome::OutOfDate) => {
                debug!("Swapchain out of date at acquire, frame {frame} skipped");
                self.state = FrameState::NeedsRebuild;
                self.stats.skipped += 1;
                return Ok(TickOutcome::Skipped { frame });
            }
            Err(e) => {
                self.absorb_exhaustion(e)?;
                self.stats.skipped += 1;
                return Ok(TickOutcome::Skipped { frame });
            }
        };

        let Some(writer) = self.image_writers.get(image_index as usize).copied() else {
            return Err(GpuError::InvalidState(format!(
                "acquired image {image_index} outside a swapchain of {} images",
                self.image_writers.len()
            ))
            .into());
        };
        // Another slot may still be rendering into this image.
        if let Some(writer) = writer.filter(|&writer| writer != slot) {
            trace!(
                image_index,
                writer = writer.index(),
                "waiting for previous writer"
            );
            backend.wait_for_slot(writer)?;
        }
        self.image_writers[image_index as usize] = Some(slot);

        // Reset only once the frame is certain to submit, so an aborted
        // frame leaves the fence signaled.
        backend.reset_slot(slot)?;

        self.state = FrameState::Submitting;
        // Not retried: a failed submit leaves the slot's fence unsignaled.
        backend.submit(slot, image_index)?;

        self.state = FrameState::Presenting;
        let presented = match backend.present(slot, image_index) {
            Ok(presented) => presented,
            Err(e) => {
                self.absorb_exhaustion(e)?;
                self.stats.dropped += 1;
                return Ok(TickOutcome::Dropped { frame });
            }
        };
        self.stats.presented += 1;
        self.exhaustion_retried = false;

        let resized = self.resize.take();
        if suboptimal || presented.needs_rebuild() || resized {
            debug!(
                suboptimal,
                ?presented,
                resized,
                "Swapchain rebuild scheduled after frame {frame}"
            );
            self.state = FrameState::NeedsRebuild;
        } else {
            self.state = FrameState::Idle;
        }

        Ok(TickOutcome::Presented { frame, image_index })
    }

    fn rebuild_if_needed<B: FrameBackend>(&mut self, backend: &mut B) -> Result<Readiness> {
        if self.state != FrameState::NeedsRebuild {
            return Ok(Readiness::Ready);
        }

        match self.lifecycle.rebuild(backend) {
            Ok(RebuildOutcome::Rebuilt { image_count }) => {
                self.image_writers = vec![None; image_count];
                self.stats.rebuilds = self.lifecycle.builds().saturating_sub(1);
                // The new swapchain already matches the surface.
                self.resize.take();
                self.state = FrameState::Idle;
                Ok(Readiness::Ready)
            }
            Ok(RebuildOutcome::Suspended) => Ok(Readiness::Suspended),
            Err(e) => {
                self.absorb_exhaustion(e)?;
                Ok(Readiness::Retrying)
            }
        }
    }

    /// Turn a first resource exhaustion into a rebuild; anything else, or a
    /// second exhaustion before a successful present, is returned.
    fn absorb_exhaustion(&mut self, err: GpuError) -> Result<()> {
        if err.kind() != ErrorKind::ResourceExhaustion {
            return Err(err.into());
        }
        if self.exhaustion_retried {
            return Err(FrameError::ExhaustionRetryFailed(err));
        }
        warn!("{err}; rebuilding swapchain and retrying once");
        self.exhaustion_retried = true;
        self.state = FrameState::NeedsRebuild;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, Inject, MockBackend};

    fn scheduler(backend: &MockBackend) -> (FrameScheduler, ResizeSignal) {
        let resize = ResizeSignal::new();
        let scheduler = FrameScheduler::new(backend.slot_count(), resize.clone());
        (scheduler, resize)
    }

    fn run(scheduler: &mut FrameScheduler, backend: &mut MockBackend, ticks: usize) {
        for _ in 0..ticks {
            scheduler.tick(backend).unwrap();
        }
    }

    #[test]
    fn slot_fence_observed_before_every_submission() {
        let mut backend = MockBackend::new(2, 3);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 20);

        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
        assert_eq!(backend.submits(), 20);

        // Every submit on a slot is preceded by a wait on that slot since
        // the slot's previous submit.
        let mut waited = vec![true; 2];
        for call in &backend.calls {
            match *call {
                Call::WaitSlot(slot) => waited[slot] = true,
                Call::Submit { slot, .. } => {
                    assert!(waited[slot]);
                    waited[slot] = false;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn frame_n_uses_slot_n_modulo_frames_in_flight() {
        let mut backend = MockBackend::new(3, 3);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 7);

        let slots: Vec<usize> = backend
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Submit { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn out_of_date_on_frame_five_skips_it_and_resumes_on_six() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(5, Inject::OutOfDate);
        let (mut scheduler, _) = scheduler(&backend);

        for frame in 0..5 {
            assert!(matches!(
                scheduler.tick(&mut backend).unwrap(),
                TickOutcome::Presented { frame: f, .. } if f == frame
            ));
        }
        let submits_before = backend.submits();
        let presents_before = backend.presents();

        assert_eq!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Skipped { frame: 5 }
        );
        assert_eq!(backend.submits(), submits_before);
        assert_eq!(backend.presents(), presents_before);
        assert_eq!(scheduler.state(), FrameState::NeedsRebuild);

        assert!(matches!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Presented { frame: 6, .. }
        ));
        assert_eq!(backend.builds(), 2);
        assert_eq!(scheduler.stats().rebuilds, 1);
        assert_eq!(scheduler.stats().skipped, 1);
        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
    }

    #[test]
    fn aborted_frame_does_not_reset_its_fence() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(1, Inject::OutOfDate);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 4);

        // Frame 1 (slot 1) aborted; its slot is reused by frame 3 without
        // an unsignaled fence in between.
        assert_eq!(backend.count(|c| *c == Call::ResetSlot(1)), 1);
        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
    }

    #[test]
    fn two_in_flight_three_images_never_reuse_pending_image() {
        let mut backend = MockBackend::new(2, 3);
        // Hand out an image the other slot may still be rendering into.
        backend.image_order = vec![0, 1, 1, 2, 2, 0, 0, 1];
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 10);

        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
        assert_eq!(backend.presents(), 10);
    }

    #[test]
    fn more_slots_than_images_waits_for_previous_writer() {
        let mut backend = MockBackend::new(3, 2);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 10);

        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
        let waits = backend.count(|c| matches!(c, Call::WaitSlot(_)));
        assert!(waits > 10, "expected writer waits beyond the slot waits");
    }

    #[test]
    fn suboptimal_acquire_presents_then_rebuilds() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(2, Inject::Suboptimal);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 3);

        assert_eq!(backend.presents(), 3);
        assert_eq!(scheduler.state(), FrameState::NeedsRebuild);
        scheduler.tick(&mut backend).unwrap();
        assert_eq!(backend.builds(), 2);
    }

    #[test]
    fn out_of_date_present_rebuilds_after_the_frame() {
        let mut backend = MockBackend::new(2, 3);
        backend.present_faults.insert(0, Inject::OutOfDate);
        let (mut scheduler, _) = scheduler(&backend);

        let outcome = scheduler.tick(&mut backend).unwrap();

        assert!(matches!(outcome, TickOutcome::Presented { frame: 0, .. }));
        assert_eq!(scheduler.state(), FrameState::NeedsRebuild);
        assert_eq!(backend.builds(), 1);

        scheduler.tick(&mut backend).unwrap();
        assert_eq!(backend.builds(), 2);
    }

    #[test]
    fn resize_flag_triggers_rebuild_after_present() {
        let mut backend = MockBackend::new(2, 3);
        let (mut scheduler, resize) = scheduler(&backend);
        run(&mut scheduler, &mut backend, 2);

        resize.notify();
        let outcome = scheduler.tick(&mut backend).unwrap();

        // The frame in progress still presents.
        assert!(matches!(outcome, TickOutcome::Presented { frame: 2, .. }));
        assert_eq!(scheduler.state(), FrameState::NeedsRebuild);
        assert!(!resize.is_pending());

        scheduler.tick(&mut backend).unwrap();
        assert_eq!(backend.builds(), 2);
        assert_eq!(scheduler.state(), FrameState::Idle);
    }

    #[test]
    fn zero_extent_suspends_until_surface_has_area() {
        let mut backend = MockBackend::new(2, 3);
        backend.push_extent(0, 0);
        backend.push_extent(0, 0);
        let (mut scheduler, _) = scheduler(&backend);

        assert_eq!(scheduler.tick(&mut backend).unwrap(), TickOutcome::Suspended);
        assert_eq!(scheduler.tick(&mut backend).unwrap(), TickOutcome::Suspended);
        assert_eq!(backend.count(|c| matches!(c, Call::Acquire(_))), 0);
        assert_eq!(scheduler.frame_counter(), 0);

        assert!(matches!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Presented { frame: 0, .. }
        ));
    }

    #[test]
    fn exhaustion_is_retried_once_after_rebuild() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(2, Inject::Exhaustion);
        let (mut scheduler, _) = scheduler(&backend);

        run(&mut scheduler, &mut backend, 2);
        assert_eq!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Skipped { frame: 2 }
        );
        assert!(matches!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Presented { frame: 3, .. }
        ));
        assert_eq!(backend.builds(), 2);
    }

    #[test]
    fn repeated_exhaustion_fails() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(0, Inject::Exhaustion);
        backend.acquire_faults.insert(1, Inject::Exhaustion);
        let (mut scheduler, _) = scheduler(&backend);

        scheduler.tick(&mut backend).unwrap();
        let err = scheduler.tick(&mut backend).unwrap_err();

        assert!(matches!(err, FrameError::ExhaustionRetryFailed(_)));
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    }

    #[test]
    fn exhaustion_during_rebuild_is_retried_once() {
        let mut backend = MockBackend::new(2, 3);
        backend.fail_build = Some(Inject::Exhaustion);
        let (mut scheduler, _) = scheduler(&backend);

        assert_eq!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Skipped { frame: 0 }
        );
        assert!(matches!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Presented { frame: 0, .. }
        ));
    }

    #[test]
    fn device_loss_propagates() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_faults.insert(1, Inject::DeviceLost);
        let (mut scheduler, _) = scheduler(&backend);

        scheduler.tick(&mut backend).unwrap();
        let err = scheduler.tick(&mut backend).unwrap_err();

        assert!(matches!(err, FrameError::Gpu(GpuError::DeviceLost { .. })));
        assert_eq!(err.kind(), ErrorKind::DeviceLost);
        assert!(err.to_string().contains("vkAcquireNextImageKHR"));
    }

    #[test]
    fn failed_submit_is_not_retried() {
        let mut backend = MockBackend::new(2, 3);
        backend.fail_submit = Some(Inject::Exhaustion);
        let (mut scheduler, _) = scheduler(&backend);

        let err = scheduler.tick(&mut backend).unwrap_err();

        assert!(matches!(err, FrameError::Gpu(_)));
    }

    #[test]
    fn present_exhaustion_drops_the_submitted_frame() {
        let mut backend = MockBackend::new(2, 3);
        backend.present_faults.insert(0, Inject::Exhaustion);
        let (mut scheduler, _) = scheduler(&backend);

        assert_eq!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Dropped { frame: 0 }
        );
        assert_eq!(backend.submits(), 1);
        assert_eq!(
            scheduler.stats(),
            FrameStats {
                presented: 0,
                skipped: 0,
                dropped: 1,
                rebuilds: 0,
            }
        );
        assert_eq!(scheduler.state(), FrameState::NeedsRebuild);

        assert!(matches!(
            scheduler.tick(&mut backend).unwrap(),
            TickOutcome::Presented { frame: 1, .. }
        ));
        assert_eq!(scheduler.stats().rebuilds, 1);
        assert!(backend.violations.is_empty(), "{:?}", backend.violations);
    }
}
