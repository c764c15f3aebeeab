use std::cell::Cell;
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::copy_nonoverlapping as memcpy;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Result;
use log::*;
use vulkanalia::prelude::v1_0::*;

use crate::camera::{Camera, Spin, UniformBufferObject};
use crate::device::DeviceContext;
use crate::memory::Buffer;
use crate::owned::Owned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready(u32),
    OutOfDate,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// What one call to [`FrameLoop::render`] ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Recreated,
    /// The framebuffer has no area; nothing can be drawn until it grows.
    Stalled,
}

/// The GPU operations one frame is made of, addressed by frame slot.
pub trait FrameBackend {
    fn wait_for_slot(&mut self, frame: usize, timeout: u64) -> Result<FenceStatus>;
    /// Signals the slot's image-available semaphore once the image is ready.
    fn acquire_image(&mut self, frame: usize, timeout: u64) -> Result<AcquireStatus>;
    fn extent(&self) -> vk::Extent2D;
    fn write_uniforms(&mut self, frame: usize, ubo: &UniformBufferObject) -> Result<()>;
    fn record_commands(&mut self, frame: usize, image_index: u32) -> Result<()>;
    fn reset_fence(&mut self, frame: usize) -> Result<()>;
    fn submit(&mut self, frame: usize) -> Result<()>;
    fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentStatus>;
    fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<()>;
}

/// Raised by the window event handler, consumed by the frame loop.
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal(Rc<Cell<bool>>);

impl ResizeSignal {
    pub fn raise(&self) {
        self.0.set(true);
    }

    pub fn take(&self) -> bool {
        self.0.replace(false)
    }

    #[cfg(test)]
    pub fn is_raised(&self) -> bool {
        self.0.get()
    }
}

/// Drives wait, acquire, update, record, reset, submit, present and advance,
/// and decides when the swapchain has to be rebuilt.
#[derive(Debug)]
pub struct FrameLoop {
    frame: usize,
    frames_in_flight: usize,
    resized: ResizeSignal,
    pending_recreate: bool,
    spin: Spin,
    camera: Camera,
    start: Instant,
    timeout: u64,
}

impl FrameLoop {
    pub fn new(frames_in_flight: usize, resized: ResizeSignal, timeout: u64) -> Self {
        Self {
            frame: 0,
            frames_in_flight: frames_in_flight.max(1),
            resized,
            pending_recreate: false,
            spin: Spin::default(),
            camera: Camera::default(),
            start: Instant::now(),
            timeout,
        }
    }

    /// The slot the next frame will use.
    #[cfg(test)]
    pub fn frame(&self) -> usize {
        self.frame
    }

    #[cfg(test)]
    pub fn pending_recreate(&self) -> bool {
        self.pending_recreate
    }

    pub fn render<B: FrameBackend>(&mut self, backend: &mut B, framebuffer: vk::Extent2D) -> Result<FrameOutcome> {
        if self.pending_recreate {
            return self.recreate(backend, framebuffer);
        }

        let frame = self.frame;
        if backend.wait_for_slot(frame, self.timeout)? == FenceStatus::TimedOut {
            warn!("Timed out waiting for frame {} to retire.", frame);
            return self.recreate(backend, framebuffer);
        }

        let image_index = match backend.acquire_image(frame, self.timeout)? {
            AcquireStatus::Ready(index) => index,
            AcquireStatus::OutOfDate => return self.recreate(backend, framebuffer),
            AcquireStatus::TimedOut => {
                warn!("Timed out acquiring a swapchain image.");
                return self.recreate(backend, framebuffer);
            }
        };

        let elapsed = self.start.elapsed().as_secs_f32();
        let ubo = UniformBufferObject::at(elapsed, backend.extent(), &self.spin, &self.camera);
        backend.write_uniforms(frame, &ubo)?;
        backend.record_commands(frame, image_index)?;

        // Only here is the slot certain to be resubmitted.
        backend.reset_fence(frame)?;
        backend.submit(frame)?;
        let status = backend.present(frame, image_index)?;

        self.frame = (self.frame + 1) % self.frames_in_flight;

        let resized = self.resized.take();
        if resized || status != PresentStatus::Presented {
            trace!("Present returned {:?} (resized: {}).", status, resized);
            return self.recreate(backend, framebuffer);
        }
        Ok(FrameOutcome::Presented)
    }

    fn recreate<B: FrameBackend>(&mut self, backend: &mut B, framebuffer: vk::Extent2D) -> Result<FrameOutcome> {
        if framebuffer.width == 0 || framebuffer.height == 0 {
            self.pending_recreate = true;
            return Ok(FrameOutcome::Stalled);
        }
        backend.recreate_swapchain(framebuffer)?;
        self.pending_recreate = false;
        // The new chain already matches any resize reported until now.
        self.resized.take();
        Ok(FrameOutcome::Recreated)
    }
}

/// Everything one in-flight frame owns.
#[derive(Debug)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    uniforms: Buffer,
    mapped: *mut c_void,
    pub in_flight: Owned<vk::Fence>,
    pub render_finished: Owned<vk::Semaphore>,
    pub image_available: Owned<vk::Semaphore>,
}

impl FrameSlot {
    /// The fence starts signaled so the first wait returns at once.
    pub unsafe fn create(context: &Rc<DeviceContext>, command_pool: vk::CommandPool) -> Result<Self> {
        let device = context.device();

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let image_available = Owned::new(context, device.create_semaphore(&semaphore_info, None)?);
        let render_finished = Owned::new(context, device.create_semaphore(&semaphore_info, None)?);
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = Owned::new(context, device.create_fence(&fence_info, None)?);

        let size = size_of::<UniformBufferObject>() as vk::DeviceSize;
        let uniforms = Buffer::create(
            context,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;
        let mapped = device.map_memory(uniforms.memory.handle(), 0, size, vk::MemoryMapFlags::empty())?;

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = device.allocate_command_buffers(&info)?[0];

        Ok(Self { command_buffer, uniforms, mapped, in_flight, render_finished, image_available })
    }

    #[inline]
    pub fn uniform_buffer(&self) -> vk::Buffer {
        self.uniforms.handle()
    }

    /// Coherent memory, so no flush is needed.
    pub unsafe fn write_uniforms(&self, ubo: &UniformBufferObject) {
        memcpy(ubo, self.mapped.cast(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;

    const N: usize = 2;
    const TIMEOUT: u64 = 1_000_000_000;
    const WINDOW: vk::Extent2D = vk::Extent2D { width: 800, height: 600 };
    const MINIMIZED: vk::Extent2D = vk::Extent2D { width: 0, height: 0 };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Uniforms(usize),
        Record(usize, u32),
        Reset(usize),
        Submit(usize),
        Present(usize, u32),
        Recreate(vk::Extent2D),
    }

    /// Records a GPU timeline and panics on ordering violations.
    struct MockGpu {
        timeline: Vec<Event>,
        /// The fence of each slot: true once the GPU has finished its work.
        signaled: [bool; N],
        /// Whether the slot's fence was waited on since its last submission.
        waited: [bool; N],
        waits: VecDeque<FenceStatus>,
        acquires: VecDeque<AcquireStatus>,
        presents: VecDeque<PresentStatus>,
        next_image: u32,
        image_count: u32,
        extent: vk::Extent2D,
        fail_submit: bool,
    }

    impl MockGpu {
        fn new() -> Self {
            Self {
                timeline: Vec::new(),
                signaled: [true; N],
                waited: [false; N],
                waits: VecDeque::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                next_image: 0,
                image_count: 3,
                extent: WINDOW,
                fail_submit: false,
            }
        }

        fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
            self.timeline.iter().filter(|e| matches(e)).count()
        }
    }

    impl FrameBackend for MockGpu {
        fn wait_for_slot(&mut self, frame: usize, _timeout: u64) -> Result<FenceStatus> {
            self.timeline.push(Event::Wait(frame));
            let status = self.waits.pop_front().unwrap_or(FenceStatus::Signaled);
            if status == FenceStatus::Signaled {
                // The GPU retires the slot's work before the wait returns.
                self.signaled[frame] = true;
                self.waited[frame] = true;
            }
            Ok(status)
        }

        fn acquire_image(&mut self, frame: usize, _timeout: u64) -> Result<AcquireStatus> {
            self.timeline.push(Event::Acquire(frame));
            let status = self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireStatus::Ready(index)
            });
            Ok(status)
        }

        fn extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn write_uniforms(&mut self, frame: usize, _ubo: &UniformBufferObject) -> Result<()> {
            assert!(self.waited[frame], "uniforms of slot {} written while the GPU may read them", frame);
            self.timeline.push(Event::Uniforms(frame));
            Ok(())
        }

        fn record_commands(&mut self, frame: usize, image_index: u32) -> Result<()> {
            assert!(self.waited[frame], "command buffer of slot {} re-recorded while in flight", frame);
            self.timeline.push(Event::Record(frame, image_index));
            Ok(())
        }

        fn reset_fence(&mut self, frame: usize) -> Result<()> {
            assert!(self.signaled[frame], "reset of unsignaled fence {}", frame);
            self.timeline.push(Event::Reset(frame));
            self.signaled[frame] = false;
            Ok(())
        }

        fn submit(&mut self, frame: usize) -> Result<()> {
            assert_eq!(self.timeline.last(), Some(&Event::Reset(frame)), "fence not reset right before submit");
            assert!(self.waited[frame], "slot {} submitted without waiting on its fence", frame);
            if self.fail_submit {
                return Err(anyhow!("device lost"));
            }
            self.timeline.push(Event::Submit(frame));
            self.waited[frame] = false;
            Ok(())
        }

        fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentStatus> {
            assert_eq!(self.timeline.last(), Some(&Event::Submit(frame)));
            self.timeline.push(Event::Present(frame, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentStatus::Presented))
        }

        fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<()> {
            assert!(framebuffer.width > 0 && framebuffer.height > 0);
            self.timeline.push(Event::Recreate(framebuffer));
            // Recreation waits for the device to go idle.
            self.signaled = [true; N];
            self.extent = framebuffer;
            self.next_image = 0;
            Ok(())
        }
    }

    fn frame_loop() -> (FrameLoop, ResizeSignal) {
        let signal = ResizeSignal::default();
        (FrameLoop::new(N, signal.clone(), TIMEOUT), signal)
    }

    #[test]
    fn steady_state_alternates_slots() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        for _ in 0..4 {
            assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(frames.frame(), 0);
        assert_eq!(
            &gpu.timeline[..7],
            &[
                Event::Wait(0),
                Event::Acquire(0),
                Event::Uniforms(0),
                Event::Record(0, 0),
                Event::Reset(0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
        let submitted = gpu
            .timeline
            .iter()
            .filter_map(|e| match e {
                Event::Submit(frame) => Some(*frame),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(submitted, vec![0, 1, 0, 1]);
        assert_eq!(gpu.count(|e| matches!(e, Event::Recreate(_))), 0);
    }

    #[test]
    fn slot_fence_is_waited_before_reuse() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        for _ in 0..6 {
            frames.render(&mut gpu, WINDOW).unwrap();
        }
        for frame in 0..N {
            let mut waited = false;
            for event in &gpu.timeline {
                match *event {
                    Event::Wait(f) if f == frame => waited = true,
                    Event::Submit(f) if f == frame => {
                        assert!(waited, "slot {} reused without a wait", frame);
                        waited = false;
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn out_of_date_acquire_recreates_without_presenting() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(AcquireStatus::OutOfDate);

        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
        assert_eq!(gpu.timeline, vec![Event::Wait(0), Event::Acquire(0), Event::Recreate(WINDOW)]);
        assert_eq!(frames.frame(), 0);
        // The fence was left signaled, so the retry does not deadlock.
        assert!(gpu.signaled[0]);

        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Presented);
        assert_eq!(gpu.timeline.last(), Some(&Event::Present(0, 0)));
        assert_eq!(frames.frame(), 1);
    }

    #[test]
    fn acquire_timeout_recreates() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(AcquireStatus::TimedOut);
        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
        assert_eq!(gpu.count(|e| matches!(e, Event::Submit(_))), 0);
        assert_eq!(frames.frame(), 0);
    }

    #[test]
    fn fence_timeout_recreates_before_acquiring() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.waits.push_back(FenceStatus::TimedOut);
        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
        assert_eq!(gpu.timeline, vec![Event::Wait(0), Event::Recreate(WINDOW)]);
    }

    #[test]
    fn resize_signal_recreates_after_presenting() {
        let (mut frames, signal) = frame_loop();
        let mut gpu = MockGpu::new();
        signal.raise();

        let larger = vk::Extent2D { width: 1024, height: 768 };
        assert_eq!(frames.render(&mut gpu, larger).unwrap(), FrameOutcome::Recreated);
        let tail = &gpu.timeline[gpu.timeline.len() - 2..];
        assert_eq!(tail, &[Event::Present(0, 0), Event::Recreate(larger)]);
        assert_eq!(frames.frame(), 1);
        assert!(!signal.is_raised());
        assert_eq!(gpu.extent(), larger);
    }

    #[test]
    fn suboptimal_or_out_of_date_present_recreates() {
        for status in [PresentStatus::Suboptimal, PresentStatus::OutOfDate] {
            let (mut frames, _) = frame_loop();
            let mut gpu = MockGpu::new();
            gpu.presents.push_back(status);
            assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
            assert_eq!(gpu.timeline.last(), Some(&Event::Recreate(WINDOW)));
            assert_eq!(frames.frame(), 1);
        }
    }

    #[test]
    fn minimized_window_stalls_until_it_has_area() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(AcquireStatus::OutOfDate);

        assert_eq!(frames.render(&mut gpu, MINIMIZED).unwrap(), FrameOutcome::Stalled);
        assert!(frames.pending_recreate());
        let before = gpu.timeline.len();
        assert_eq!(frames.render(&mut gpu, MINIMIZED).unwrap(), FrameOutcome::Stalled);
        assert_eq!(gpu.timeline.len(), before, "no GPU work while minimized");

        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
        assert!(!frames.pending_recreate());
        assert_eq!(gpu.count(|e| matches!(e, Event::Recreate(_))), 1);
        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn restoring_a_minimized_window_recreates_once() {
        let (mut frames, signal) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(AcquireStatus::OutOfDate);
        signal.raise();
        assert_eq!(frames.render(&mut gpu, MINIMIZED).unwrap(), FrameOutcome::Stalled);

        // The window comes back and reports its new size.
        signal.raise();
        assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Recreated);
        assert!(!signal.is_raised());
        for _ in 0..3 {
            assert_eq!(frames.render(&mut gpu, WINDOW).unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(gpu.count(|e| matches!(e, Event::Recreate(_))), 1);
    }

    #[test]
    fn recreation_is_requested_once_per_trigger() {
        let (mut frames, signal) = frame_loop();
        let mut gpu = MockGpu::new();
        signal.raise();
        signal.raise();
        frames.render(&mut gpu, WINDOW).unwrap();
        frames.render(&mut gpu, WINDOW).unwrap();
        assert_eq!(gpu.count(|e| matches!(e, Event::Recreate(_))), 1);
    }

    #[test]
    fn backend_errors_propagate() {
        let (mut frames, _) = frame_loop();
        let mut gpu = MockGpu::new();
        gpu.fail_submit = true;
        assert!(frames.render(&mut gpu, WINDOW).is_err());
        assert_eq!(gpu.count(|e| matches!(e, Event::Present(..))), 0);
    }
}
