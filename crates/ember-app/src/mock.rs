//! In-memory [`FrameBackend`] that records every call and models fence and
//! image state, so scheduling rules can be checked without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use ash::vk;
use ember_gpu::swapchain::{AcquireOutcome, PresentOutcome};
use ember_gpu::sync::FrameSlot;
use ember_gpu::{GpuError, Result};

use crate::backend::FrameBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    WaitSlot(usize),
    ResetSlot(usize),
    Acquire(usize),
    Submit { slot: usize, image: u32 },
    Present { slot: usize, image: u32 },
    WaitIdle,
    Teardown,
    Build,
    Record,
    Release,
}

/// A fault to inject into one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inject {
    OutOfDate,
    Suboptimal,
    DeviceLost,
    Exhaustion,
}

impl Inject {
    fn error(self, op: &'static str) -> GpuError {
        match self {
            Self::DeviceLost => GpuError::vulkan(op, vk::Result::ERROR_DEVICE_LOST),
            Self::Exhaustion => GpuError::vulkan(op, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Self::OutOfDate | Self::Suboptimal => {
                GpuError::InvalidState(format!("{self:?} is not an error for {op}"))
            }
        }
    }
}

pub struct MockBackend {
    pub calls: Vec<Call>,
    pub violations: Vec<String>,
    /// Image count the next build produces.
    pub next_image_count: usize,
    /// Extents reported by successive `surface_extent` calls; 800x600 once
    /// drained.
    extents: RefCell<VecDeque<(u32, u32)>>,
    pub extent_queries: Cell<usize>,
    /// Image indices handed out by successive acquires, cycled. Round-robin
    /// when empty.
    pub image_order: Vec<u32>,
    /// Faults keyed by the zero-based acquire call number.
    pub acquire_faults: HashMap<usize, Inject>,
    /// Faults keyed by the zero-based present call number.
    pub present_faults: HashMap<usize, Inject>,
    /// One-shot fault for the next build.
    pub fail_build: Option<Inject>,
    /// One-shot fault for the next submit.
    pub fail_submit: Option<Inject>,
    /// Image views, framebuffers and the swapchain handle currently alive.
    pub live_objects: usize,
    pub releases: usize,
    slots: usize,
    image_count: usize,
    command_buffers: usize,
    acquires: usize,
    presents: usize,
    /// Whether each slot's latest submission has been observed complete.
    slot_complete: Vec<bool>,
    /// Slot whose submission last wrote each image.
    image_writer: Vec<Option<usize>>,
}

impl MockBackend {
    /// A backend with `slots` frame slots whose swapchain builds with
    /// `images` images.
    pub fn new(slots: usize, images: usize) -> Self {
        Self {
            calls: Vec::new(),
            violations: Vec::new(),
            next_image_count: images,
            extents: RefCell::new(VecDeque::new()),
            extent_queries: Cell::new(0),
            image_order: Vec::new(),
            acquire_faults: HashMap::new(),
            present_faults: HashMap::new(),
            fail_build: None,
            fail_submit: None,
            live_objects: 0,
            releases: 0,
            slots,
            image_count: 0,
            command_buffers: 0,
            acquires: 0,
            presents: 0,
            // Fences start signaled.
            slot_complete: vec![true; slots],
            image_writer: Vec::new(),
        }
    }

    /// Queue an extent for a later `surface_extent` call.
    pub fn push_extent(&self, width: u32, height: u32) {
        self.extents.borrow_mut().push_back((width, height));
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    pub fn submits(&self) -> usize {
        self.count(|call| matches!(call, Call::Submit { .. }))
    }

    pub fn presents(&self) -> usize {
        self.count(|call| matches!(call, Call::Present { .. }))
    }

    pub fn builds(&self) -> usize {
        self.count(|call| matches!(call, Call::Build))
    }

    fn any_pending(&self) -> bool {
        self.slot_complete.iter().any(|complete| !complete)
    }
}

impl FrameBackend for MockBackend {
    fn slot_count(&self) -> usize {
        self.slots
    }

    fn wait_for_slot(&mut self, slot: FrameSlot) -> Result<()> {
        let slot = slot.index();
        self.calls.push(Call::WaitSlot(slot));
        self.slot_complete[slot] = true;
        for writer in &mut self.image_writer {
            if *writer == Some(slot) {
                *writer = None;
            }
        }
        Ok(())
    }

    fn reset_slot(&mut self, slot: FrameSlot) -> Result<()> {
        self.calls.push(Call::ResetSlot(slot.index()));
        if !self.slot_complete[slot.index()] {
            self.violations
                .push(format!("fence of slot {} reset while pending", slot.index()));
        }
        Ok(())
    }

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn acquire_next_image(&mut self, slot: FrameSlot) -> Result<AcquireOutcome> {
        self.calls.push(Call::Acquire(slot.index()));
        let n = self.acquires;
        self.acquires += 1;

        let fault = self.acquire_faults.get(&n).copied();
        match fault {
            Some(Inject::OutOfDate) => return Ok(AcquireOutcome::OutOfDate),
            Some(fault @ (Inject::DeviceLost | Inject::Exhaustion)) => {
                return Err(fault.error("vkAcquireNextImageKHR"))
            }
            _ => {}
        }

        let raw = if self.image_order.is_empty() {
            n as u32
        } else {
            self.image_order[n % self.image_order.len()]
        };
        let image_index = raw % self.image_count as u32;

        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: fault == Some(Inject::Suboptimal),
        })
    }

    fn submit(&mut self, slot: FrameSlot, image_index: u32) -> Result<()> {
        let slot = slot.index();
        self.calls.push(Call::Submit {
            slot,
            image: image_index,
        });
        if let Some(fault) = self.fail_submit.take() {
            return Err(fault.error("vkQueueSubmit"));
        }

        if !self.slot_complete[slot] {
            self.violations.push(format!(
                "slot {slot} submitted before its fence was observed signaled"
            ));
        }
        let image = image_index as usize;
        if image >= self.command_buffers {
            self.violations
                .push(format!("no command buffer recorded for image {image}"));
        }
        if let Some(writer) = self.image_writer[image] {
            if !self.slot_complete[writer] {
                self.violations.push(format!(
                    "image {image} resubmitted while pending on slot {writer}"
                ));
            }
        }

        self.slot_complete[slot] = false;
        self.image_writer[image] = Some(slot);
        Ok(())
    }

    fn present(&mut self, slot: FrameSlot, image_index: u32) -> Result<PresentOutcome> {
        self.calls.push(Call::Present {
            slot: slot.index(),
            image: image_index,
        });
        let n = self.presents;
        self.presents += 1;

        match self.present_faults.get(&n).copied() {
            None => Ok(PresentOutcome::Presented),
            Some(Inject::OutOfDate) => Ok(PresentOutcome::OutOfDate),
            Some(Inject::Suboptimal) => Ok(PresentOutcome::Suboptimal),
            Some(fault) => Err(fault.error("vkQueuePresentKHR")),
        }
    }

    fn surface_extent(&self) -> Result<vk::Extent2D> {
        self.extent_queries.set(self.extent_queries.get() + 1);
        let (width, height) = self
            .extents
            .borrow_mut()
            .pop_front()
            .unwrap_or((800, 600));
        Ok(vk::Extent2D { width, height })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        self.slot_complete.fill(true);
        self.image_writer.fill(None);
        Ok(())
    }

    fn teardown_swapchain(&mut self) {
        self.calls.push(Call::Teardown);
        if self.live_objects > 0 && self.any_pending() {
            self.violations
                .push("swapchain destroyed while work is pending".to_string());
        }
        self.live_objects = 0;
        self.image_count = 0;
    }

    fn build_swapchain(&mut self, extent: vk::Extent2D) -> Result<usize> {
        self.calls.push(Call::Build);
        if let Some(fault) = self.fail_build.take() {
            return Err(fault.error("vkCreateSwapchainKHR"));
        }
        if self.live_objects != 0 {
            self.violations
                .push("swapchain built over a live resource set".to_string());
        }
        if extent.width == 0 || extent.height == 0 {
            self.violations.push("swapchain built with zero extent".to_string());
        }
        self.image_count = self.next_image_count;
        self.live_objects = 2 * self.image_count + 1;
        self.image_writer = vec![None; self.image_count];
        Ok(self.image_count)
    }

    fn record_commands(&mut self) -> Result<usize> {
        self.calls.push(Call::Record);
        if self.any_pending() {
            self.violations
                .push("command buffers re-recorded while pending".to_string());
        }
        self.command_buffers = self.image_count;
        Ok(self.command_buffers)
    }

    fn command_buffer_count(&self) -> usize {
        self.command_buffers
    }

    fn release(&mut self) {
        self.calls.push(Call::Release);
        self.releases += 1;
        self.live_objects = 0;
        self.image_count = 0;
        self.command_buffers = 0;
    }
}
