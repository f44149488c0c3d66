// Frame Synchronizer - the steady-state acquire -> submit -> present loop
//
// The state machine here knows nothing about Vulkan. It drives a
// `FrameDriver` (the GPU side) and polls `WindowEvents` (the window side),
// so the ordering rules can be checked without a GPU.
//
// FRAME TIMELINE (per iteration, single thread):
// ┌──────────────────────────────────────────────────────────────────────┐
// │ pump events ─> wait slot fence ─> acquire ─> wait image owner        │
// │             ─> submit (signals slot fence) ─> present ─> next slot   │
// └──────────────────────────────────────────────────────────────────────┘

use crate::error::RenderResult;

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    /// The image chain no longer matches the surface; nothing was signaled.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Valid,
    NeedsRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Acquiring,
    Submitting,
    Presenting,
}

/// What one call to `draw_frame` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// The chain had to be (or is waiting to be) rebuilt; no image was presented.
    Skipped,
}

/// GPU side of the frame loop.
///
/// `slot` is an index into the frames-in-flight ring, `image_index` an index
/// into the swapchain images (and therefore the recorded command buffers).
pub trait FrameDriver {
    fn frames_in_flight(&self) -> usize;

    fn image_count(&self) -> usize;

    /// Block until the work last submitted from `slot` has finished.
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()>;

    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire(&mut self, slot: usize) -> RenderResult<AcquireOutcome>;

    /// Submit the command buffer recorded for `image_index`: wait on the slot's
    /// image-available semaphore, signal the image's render-finished semaphore
    /// and the slot's fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()>;

    /// Present `image_index` once its render-finished semaphore fires.
    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;

    /// Recreate everything that depends on the image chain.
    /// Returns `NeedsRebuild` when the surface cannot be rebuilt yet (zero-sized).
    fn rebuild_swapchain(&mut self) -> RenderResult<SwapchainState>;

    /// Record the window's new drawable size for the next rebuild.
    fn resize(&mut self, width: u32, height: u32);

    /// Block until no queue has outstanding work.
    fn wait_idle(&mut self) -> RenderResult<()>;
}

/// Window side of the frame loop.
pub trait WindowEvents {
    /// Dispatch pending window events. Called once per iteration, before acquire.
    fn pump(&mut self);

    fn should_close(&self) -> bool;

    /// Whether the surface currently has no area to draw into.
    fn is_minimized(&self) -> bool {
        false
    }

    /// The latest size, once per resize since the last call.
    fn take_resized(&mut self) -> Option<(u32, u32)> {
        None
    }
}

pub struct FrameSynchronizer {
    frames_in_flight: usize,
    current_slot: usize,
    /// Which slot last submitted work against each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    state: SwapchainState,
    phase: FramePhase,
    frames_presented: u64,
}

impl FrameSynchronizer {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_slot: 0,
            images_in_flight: vec![None; image_count],
            state: SwapchainState::Valid,
            phase: FramePhase::Idle,
            frames_presented: 0,
        }
    }

    pub fn for_driver<D: FrameDriver>(driver: &D) -> Self {
        Self::new(driver.frames_in_flight(), driver.image_count())
    }

    #[cfg(test)]
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    #[cfg(test)]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    #[cfg(test)]
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn mark_needs_rebuild(&mut self) {
        self.state = SwapchainState::NeedsRebuild;
    }

    /// Run one Idle -> Acquiring -> Submitting -> Presenting -> Idle cycle.
    pub fn draw_frame<D: FrameDriver>(&mut self, driver: &mut D) -> RenderResult<FrameStatus> {
        if self.state == SwapchainState::NeedsRebuild && !self.rebuild(driver)? {
            return Ok(FrameStatus::Skipped);
        }

        let slot = self.current_slot;

        self.phase = FramePhase::Acquiring;
        driver.wait_for_slot(slot)?;
        let image_index = match driver.acquire(slot)? {
            AcquireOutcome::Ready { image_index, suboptimal } => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", image_index);
                    self.state = SwapchainState::NeedsRebuild;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.state = SwapchainState::NeedsRebuild;
                self.phase = FramePhase::Idle;
                return Ok(FrameStatus::Skipped);
            }
        };

        self.phase = FramePhase::Submitting;
        // A previous frame may still be rendering into this image from another slot.
        if let Some(owner) = self.images_in_flight.get(image_index as usize).copied().flatten() {
            if owner != slot {
                driver.wait_for_slot(owner)?;
            }
        }
        if let Some(entry) = self.images_in_flight.get_mut(image_index as usize) {
            *entry = Some(slot);
        }
        driver.submit(slot, image_index)?;

        self.phase = FramePhase::Presenting;
        match driver.present(slot, image_index)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::debug!("Swapchain needs rebuild after present");
                self.state = SwapchainState::NeedsRebuild;
            }
        }

        self.phase = FramePhase::Idle;
        self.current_slot = (self.current_slot + 1) % self.frames_in_flight;
        self.frames_presented += 1;

        Ok(FrameStatus::Presented { image_index })
    }

    /// Returns true once the chain is valid again.
    fn rebuild<D: FrameDriver>(&mut self, driver: &mut D) -> RenderResult<bool> {
        self.state = driver.rebuild_swapchain()?;
        if self.state == SwapchainState::NeedsRebuild {
            return Ok(false);
        }
        // The rebuild drained the device, so no image is owned by any slot.
        self.images_in_flight = vec![None; driver.image_count()];
        Ok(true)
    }

    /// Drive frames until the window asks to close, then drain the device.
    ///
    /// The idle wait runs even when a frame fails, so teardown never races
    /// in-flight GPU work.
    pub fn run<D, W>(&mut self, driver: &mut D, window: &mut W) -> RenderResult<()>
    where
        D: FrameDriver,
        W: WindowEvents,
    {
        let result = self.run_until_close(driver, window);
        if let Err(e) = &result {
            log::error!("Frame loop stopped while {:?}: {}", self.phase, e);
        }
        let idle = driver.wait_idle();
        result.and(idle)
    }

    fn run_until_close<D, W>(&mut self, driver: &mut D, window: &mut W) -> RenderResult<()>
    where
        D: FrameDriver,
        W: WindowEvents,
    {
        loop {
            window.pump();
            if window.should_close() {
                return Ok(());
            }
            if let Some((width, height)) = window.take_resized() {
                driver.resize(width, height);
                self.mark_needs_rebuild();
            }
            if window.is_minimized() {
                continue;
            }
            self.draw_frame(driver)?;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RenderError;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        WaitSlot(usize),
        Acquire(usize),
        Submit(usize, u32),
        Present(usize, u32),
        Rebuild,
        Resize(u32, u32),
        WaitIdle,
    }

    /// Records every driver call. Images are handed out round-robin unless
    /// a scripted outcome is queued.
    pub(crate) struct MockDriver {
        pub frames_in_flight: usize,
        pub image_count: usize,
        pub command_buffers: usize,
        pub calls: Vec<Call>,
        pub acquire_script: VecDeque<AcquireOutcome>,
        pub present_script: VecDeque<PresentOutcome>,
        pub rebuild_script: VecDeque<SwapchainState>,
        pub fail_submit: bool,
        next_image: u32,
    }

    impl MockDriver {
        pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
            Self {
                frames_in_flight,
                image_count,
                command_buffers: image_count,
                calls: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                rebuild_script: VecDeque::new(),
                fail_submit: false,
                next_image: 0,
            }
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(*c)).count()
        }
    }

    impl FrameDriver for MockDriver {
        fn frames_in_flight(&self) -> usize {
            self.frames_in_flight
        }

        fn image_count(&self) -> usize {
            self.image_count
        }

        fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.calls.push(Call::WaitSlot(slot));
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if let Some(outcome) = self.acquire_script.pop_front() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(AcquireOutcome::Ready { image_index, suboptimal: false })
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
            assert!((image_index as usize) < self.command_buffers);
            self.calls.push(Call::Submit(slot, image_index));
            if self.fail_submit {
                return Err(RenderError::QueueSubmit(vk::Result::ERROR_DEVICE_LOST));
            }
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild_swapchain(&mut self) -> RenderResult<SwapchainState> {
            self.calls.push(Call::Rebuild);
            self.next_image = 0;
            Ok(self.rebuild_script.pop_front().unwrap_or(SwapchainState::Valid))
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.calls.push(Call::Resize(width, height));
        }

        fn wait_idle(&mut self) -> RenderResult<()> {
            self.calls.push(Call::WaitIdle);
            Ok(())
        }
    }

    /// Closes after a fixed number of pumps.
    pub(crate) struct MockWindow {
        pub pumps: usize,
        pub close_after: usize,
        pub resize_at: Option<usize>,
        pub minimized_at: Option<usize>,
    }

    impl MockWindow {
        pub fn closing_after(close_after: usize) -> Self {
            Self { pumps: 0, close_after, resize_at: None, minimized_at: None }
        }
    }

    impl WindowEvents for MockWindow {
        fn pump(&mut self) {
            self.pumps += 1;
        }

        fn should_close(&self) -> bool {
            self.pumps > self.close_after
        }

        fn is_minimized(&self) -> bool {
            self.minimized_at == Some(self.pumps)
        }

        fn take_resized(&mut self) -> Option<(u32, u32)> {
            (self.resize_at == Some(self.pumps)).then_some((1024, 768))
        }
    }

    #[test]
    fn test_frame_runs_phases_in_order() {
        let mut driver = MockDriver::new(2, 3);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        let status = sync.draw_frame(&mut driver).unwrap();

        assert_eq!(status, FrameStatus::Presented { image_index: 0 });
        assert_eq!(
            driver.calls,
            vec![Call::WaitSlot(0), Call::Acquire(0), Call::Submit(0, 0), Call::Present(0, 0)]
        );
        assert_eq!(sync.phase(), FramePhase::Idle);
        assert_eq!(sync.current_slot(), 1);
    }

    #[test]
    fn test_slots_rotate_through_ring() {
        let mut driver = MockDriver::new(2, 3);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        for _ in 0..4 {
            sync.draw_frame(&mut driver).unwrap();
        }

        let acquires: Vec<_> = driver
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Acquire(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(acquires, vec![0, 1, 0, 1]);
        assert_eq!(sync.frames_presented(), 4);
    }

    #[test]
    fn test_no_idle_wait_inside_steady_state() {
        let mut driver = MockDriver::new(2, 2);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        for _ in 0..10 {
            sync.draw_frame(&mut driver).unwrap();
        }

        assert_eq!(driver.count(|c| *c == Call::WaitIdle), 0);
    }

    #[test]
    fn test_waits_for_slot_still_owning_image() {
        // Three slots, two images: the third frame reuses image 0, which slot 0 still owns.
        let mut driver = MockDriver::new(3, 2);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        sync.draw_frame(&mut driver).unwrap();
        sync.draw_frame(&mut driver).unwrap();
        driver.calls.clear();
        sync.draw_frame(&mut driver).unwrap();

        assert_eq!(
            driver.calls,
            vec![
                Call::WaitSlot(2),
                Call::Acquire(2),
                Call::WaitSlot(0),
                Call::Submit(2, 0),
                Call::Present(2, 0),
            ]
        );
    }

    #[test]
    fn test_out_of_date_acquire_skips_then_rebuilds() {
        let mut driver = MockDriver::new(2, 2);
        driver.acquire_script.push_back(AcquireOutcome::OutOfDate);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        assert_eq!(sync.draw_frame(&mut driver).unwrap(), FrameStatus::Skipped);
        assert_eq!(sync.state(), SwapchainState::NeedsRebuild);
        assert_eq!(driver.count(|c| matches!(c, Call::Submit(..))), 0);
        // The slot is not consumed by a skipped frame.
        assert_eq!(sync.current_slot(), 0);

        let status = sync.draw_frame(&mut driver).unwrap();
        assert_eq!(status, FrameStatus::Presented { image_index: 0 });
        assert_eq!(sync.state(), SwapchainState::Valid);
        assert_eq!(driver.count(|c| *c == Call::Rebuild), 1);
    }

    #[test]
    fn test_suboptimal_present_marks_rebuild() {
        let mut driver = MockDriver::new(2, 2);
        driver.present_script.push_back(PresentOutcome::Suboptimal);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        let status = sync.draw_frame(&mut driver).unwrap();

        assert_eq!(status, FrameStatus::Presented { image_index: 0 });
        assert_eq!(sync.state(), SwapchainState::NeedsRebuild);
    }

    #[test]
    fn test_suboptimal_acquire_still_presents() {
        let mut driver = MockDriver::new(1, 2);
        driver
            .acquire_script
            .push_back(AcquireOutcome::Ready { image_index: 1, suboptimal: true });
        let mut sync = FrameSynchronizer::for_driver(&driver);

        assert_eq!(sync.draw_frame(&mut driver).unwrap(), FrameStatus::Presented { image_index: 1 });
        assert_eq!(sync.state(), SwapchainState::NeedsRebuild);
    }

    #[test]
    fn test_deferred_rebuild_skips_frames() {
        let mut driver = MockDriver::new(2, 2);
        driver.rebuild_script.push_back(SwapchainState::NeedsRebuild);
        let mut sync = FrameSynchronizer::for_driver(&driver);
        sync.mark_needs_rebuild();

        assert_eq!(sync.draw_frame(&mut driver).unwrap(), FrameStatus::Skipped);
        assert_eq!(driver.calls, vec![Call::Rebuild]);

        assert!(matches!(sync.draw_frame(&mut driver).unwrap(), FrameStatus::Presented { .. }));
    }

    #[test]
    fn test_rebuild_resizes_image_tracking() {
        let mut driver = MockDriver::new(2, 2);
        let mut sync = FrameSynchronizer::for_driver(&driver);
        sync.draw_frame(&mut driver).unwrap();

        driver.image_count = 4;
        driver.command_buffers = 4;
        sync.mark_needs_rebuild();
        sync.draw_frame(&mut driver).unwrap();

        assert_eq!(sync.images_in_flight.len(), 4);
    }

    #[test]
    fn test_run_stops_on_close_and_waits_idle() {
        let mut driver = MockDriver::new(2, 2);
        let mut window = MockWindow::closing_after(5);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        sync.run(&mut driver, &mut window).unwrap();

        assert_eq!(sync.frames_presented(), 5);
        assert_eq!(driver.calls.last(), Some(&Call::WaitIdle));
        assert_eq!(driver.count(|c| *c == Call::WaitIdle), 1);
    }

    #[test]
    fn test_run_skips_minimized_and_rebuilds_on_resize() {
        let mut driver = MockDriver::new(2, 2);
        let mut window = MockWindow::closing_after(4);
        window.minimized_at = Some(2);
        window.resize_at = Some(3);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        sync.run(&mut driver, &mut window).unwrap();

        assert_eq!(sync.frames_presented(), 3);
        assert_eq!(driver.count(|c| *c == Call::Resize(1024, 768)), 1);
        assert_eq!(driver.count(|c| *c == Call::Rebuild), 1);
        let resize = driver.calls.iter().position(|c| matches!(c, Call::Resize(..)));
        let rebuild = driver.calls.iter().position(|c| *c == Call::Rebuild);
        assert!(resize < rebuild);
    }

    #[test]
    fn test_failed_submit_still_drains_device() {
        let mut driver = MockDriver::new(2, 2);
        driver.fail_submit = true;
        let mut window = MockWindow::closing_after(3);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        let err = sync.run(&mut driver, &mut window).unwrap_err();

        assert!(matches!(err, RenderError::QueueSubmit(_)));
        assert_eq!(driver.calls.last(), Some(&Call::WaitIdle));
    }
}
