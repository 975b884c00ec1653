//! In-process GPU for exercising the frame and upload protocols.
//!
//! [`FakeDevice`] implements [`GpuDevice`] without a driver. Submitted
//! command buffers run on a worker thread after a configurable latency;
//! fills and buffer copies really execute against host memory, so a test can
//! read back what "the GPU" wrote. Fences, binary semaphores, command buffer
//! states and descriptor pool capacities follow Vulkan's rules, and every
//! misuse is recorded as a violation instead of being undefined behavior:
//!
//! - resetting or re-beginning a command buffer that is still pending
//! - submitting with a fence that is signaled or still pending
//! - waiting on a semaphore nobody signaled, or signaling one twice
//! - recording outside `begin`/`end`
//! - a host write to memory that a pending submission reads or writes
//!
//! [`FakeSwapchain`] is a scripted [`PresentTarget`] built on the same
//! semaphore bookkeeping.
//!
//! Available under `cfg(test)` and with the `testing` feature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;

use crate::error::{RhiError, RhiResult};
use crate::gpu::{DeviceMemory, GpuDevice, QueueSubmit};
use crate::swapchain::{AcquireOutcome, PresentOutcome, PresentTarget};

/// Upper bound on [`GpuDevice::wait_idle`] before the fake reports device loss.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something observable that happened on the fake device, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    FenceWaited(vk::Fence),
    FenceReset(vk::Fence),
    CommandBufferReset(vk::CommandBuffer),
    Submitted {
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    /// The worker finished a submission and signaled its fence.
    FenceSignaled(vk::Fence),
    ImageAcquired {
        image_index: u32,
    },
    Presented {
        image_index: u32,
    },
    Idle,
}

/// One element of a recorded `vkUpdateDescriptorSets` batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWriteRecord {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

/// One recorded image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Clone, Copy, Debug, Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Clone, Debug)]
enum Command {
    Fill {
        dst: u64,
        offset: u64,
        size: u64,
        data: u32,
    },
    Copy {
        src: u64,
        dst: u64,
        regions: Vec<vk::BufferCopy>,
    },
    Other,
}

struct CommandBufferState {
    pool: u64,
    state: RecordingState,
    commands: Vec<Command>,
}

struct PoolState {
    max_sets: u32,
    allocated: u32,
}

/// Host-side backing store of a fake allocation.
struct MemoryCell {
    bytes: Mutex<Vec<u8>>,
    host_visible: bool,
    /// Pending submissions touching this memory.
    in_flight: AtomicU32,
}

#[derive(Default)]
struct FakeState {
    fences: HashMap<u64, FenceState>,
    semaphores: HashMap<u64, bool>,
    command_pools: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    descriptor_pools: HashMap<u64, PoolState>,
    layouts: HashSet<u64>,
    buffers: HashMap<u64, Arc<MemoryCell>>,
    images: HashSet<u64>,
    views: HashSet<u64>,
    events: Vec<DeviceEvent>,
    violations: Vec<String>,
    descriptor_writes: Vec<Vec<DescriptorWriteRecord>>,
    barriers: Vec<BarrierRecord>,
    pool_capacities: Vec<u32>,
    forced_pool_failures: VecDeque<vk::Result>,
    submissions: usize,
    outstanding: usize,
    gpu_hung: bool,
}

impl FakeState {
    fn violation(&mut self, message: String) {
        tracing::warn!("fake device violation: {}", message);
        self.violations.push(message);
    }

    fn require_recording(&mut self, command_buffer: vk::CommandBuffer, command: Command) {
        match self.command_buffers.get_mut(&command_buffer.as_raw()) {
            Some(cb) if cb.state == RecordingState::Recording => cb.commands.push(command),
            Some(cb) => {
                let state = cb.state;
                self.violation(format!(
                    "command recorded into {command_buffer:?} while {state:?}"
                ));
            }
            None => self.violation(format!("unknown command buffer {command_buffer:?}")),
        }
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => {
                self.violation(format!("{by} signals {semaphore:?} which is already signaled"));
            }
            Some(signaled) => *signaled = true,
            None => self.violation(format!("{by} signals unknown semaphore {semaphore:?}")),
        }
    }

    fn consume_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => {
                self.violation(format!("{by} waits on {semaphore:?} which nobody signaled"));
            }
            None => self.violation(format!("{by} waits on unknown semaphore {semaphore:?}")),
        }
    }
}

struct Shared {
    state: Mutex<FakeState>,
    /// Notified whenever the worker completes a submission.
    completed: Condvar,
    next_handle: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

enum Op {
    Fill {
        cell: Arc<MemoryCell>,
        offset: u64,
        size: u64,
        data: u32,
    },
    Copy {
        src: Arc<MemoryCell>,
        dst: Arc<MemoryCell>,
        regions: Vec<vk::BufferCopy>,
    },
}

impl Op {
    fn cells(&self) -> Vec<&Arc<MemoryCell>> {
        match self {
            Op::Fill { cell, .. } => vec![cell],
            Op::Copy { src, dst, .. } => vec![src, dst],
        }
    }

    fn execute(&self) {
        match self {
            Op::Fill {
                cell,
                offset,
                size,
                data,
            } => {
                let mut bytes = cell.bytes.lock().unwrap_or_else(PoisonError::into_inner);
                let start = (*offset as usize).min(bytes.len());
                let end = if *size == vk::WHOLE_SIZE {
                    bytes.len()
                } else {
                    (start + *size as usize).min(bytes.len())
                };
                let word = data.to_le_bytes();
                for (i, byte) in bytes[start..end].iter_mut().enumerate() {
                    *byte = word[i % 4];
                }
            }
            Op::Copy { src, dst, regions } => {
                for region in regions {
                    let chunk: Vec<u8> = {
                        let bytes = src.bytes.lock().unwrap_or_else(PoisonError::into_inner);
                        let start = (region.src_offset as usize).min(bytes.len());
                        let end = (start + region.size as usize).min(bytes.len());
                        bytes[start..end].to_vec()
                    };
                    let mut bytes = dst.bytes.lock().unwrap_or_else(PoisonError::into_inner);
                    let start = (region.dst_offset as usize).min(bytes.len());
                    let end = (start + chunk.len()).min(bytes.len());
                    bytes[start..end].copy_from_slice(&chunk[..end - start]);
                }
            }
        }
    }
}

struct Job {
    command_buffer: u64,
    fence: u64,
    ops: Vec<Op>,
}

fn run_worker(shared: Arc<Shared>, jobs: mpsc::Receiver<Job>, latency: Duration) {
    for job in jobs {
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        for op in &job.ops {
            op.execute();
        }
        // Memory is released before the fence so a woken waiter never races it.
        for op in &job.ops {
            for cell in op.cells() {
                cell.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let mut state = shared.lock();
        if let Some(cb) = state.command_buffers.get_mut(&job.command_buffer) {
            if cb.state == RecordingState::Pending {
                cb.state = RecordingState::Executable;
            }
        }
        let fence = vk::Fence::from_raw(job.fence);
        if let Some(f) = state.fences.get_mut(&job.fence) {
            f.signaled = true;
            f.pending = false;
        }
        state.outstanding -= 1;
        state.events.push(DeviceEvent::FenceSignaled(fence));
        drop(state);
        shared.completed.notify_all();
    }
}

/// Memory handed out by [`FakeDevice`].
pub struct FakeMemory {
    cell: Arc<MemoryCell>,
    shared: Arc<Shared>,
}

impl DeviceMemory for FakeMemory {
    fn size(&self) -> u64 {
        self.cell
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RhiResult<()> {
        if !self.cell.host_visible {
            return Err(RhiError::InvalidState(
                "memory is not host visible".to_string(),
            ));
        }
        if self.cell.in_flight.load(Ordering::Acquire) > 0 {
            self.shared.lock().violation(format!(
                "host write of {} bytes to memory used by a pending submission",
                data.len()
            ));
        }
        let mut bytes = self.cell.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| RhiError::OutOfBounds(format!("write at {offset}")))?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> RhiResult<()> {
        if !self.cell.host_visible {
            return Err(RhiError::InvalidState(
                "memory is not host visible".to_string(),
            ));
        }
        let bytes = self.cell.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| RhiError::OutOfBounds(format!("read at {offset}")))?;
        out.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }
}

/// Driverless [`GpuDevice`] with a worker-thread queue.
pub struct FakeDevice {
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FakeDevice {
    /// A device whose submissions complete as soon as the worker picks them up.
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    /// A device whose submissions take at least `latency` to complete.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(FakeState::default()),
            completed: Condvar::new(),
            next_handle: AtomicU64::new(0x1000),
        });
        let (sender, receiver) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = thread::spawn(move || run_worker(worker_shared, receiver, latency));

        Arc::new(Self {
            shared,
            jobs: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Makes the next `count` descriptor set allocations fail as if the pool
    /// were out of memory.
    pub fn fail_next_descriptor_allocations(&self, count: usize) {
        self.fail_next_descriptor_allocations_with(count, vk::Result::ERROR_OUT_OF_POOL_MEMORY);
    }

    /// Makes the next `count` descriptor set allocations fail with `result`.
    pub fn fail_next_descriptor_allocations_with(&self, count: usize, result: vk::Result) {
        let mut state = self.shared.lock();
        state
            .forced_pool_failures
            .extend(std::iter::repeat_n(result, count));
    }

    /// Stops completing submissions. Waits time out and `wait_idle` reports
    /// device loss.
    pub fn hang_gpu(&self) {
        self.shared.lock().gpu_hung = true;
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.shared.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.shared.lock().events.clear();
    }

    /// Protocol violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.shared.lock().violations.clone()
    }

    /// Capacity of every descriptor pool created, in creation order.
    pub fn descriptor_pool_capacities(&self) -> Vec<u32> {
        self.shared.lock().pool_capacities.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.shared.lock().submissions
    }

    /// One entry per `update_descriptor_sets` call.
    pub fn descriptor_writes(&self) -> Vec<Vec<DescriptorWriteRecord>> {
        self.shared.lock().descriptor_writes.clone()
    }

    pub fn barriers(&self) -> Vec<BarrierRecord> {
        self.shared.lock().barriers.clone()
    }

    /// Device objects created and not yet destroyed. Command buffers are
    /// counted with their pool.
    pub fn live_objects(&self) -> usize {
        let state = self.shared.lock();
        state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.descriptor_pools.len()
            + state.layouts.len()
            + state.buffers.len()
            + state.images.len()
            + state.views.len()
    }

    fn send(&self, job: Job) {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = jobs.as_ref() {
            // The worker only exits once the sender is gone.
            let _ = sender.send(job);
        }
    }

    fn buffer_cell(state: &FakeState, buffer: vk::Buffer) -> Option<Arc<MemoryCell>> {
        state.buffers.get(&buffer.as_raw()).cloned()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
    }
}

impl GpuDevice for FakeDevice {
    type Memory = FakeMemory;

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence: vk::Fence = self.shared.handle();
        self.shared.lock().fences.insert(
            fence.as_raw(),
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.shared.lock();
        if let Some(f) = state.fences.remove(&fence.as_raw()) {
            if f.pending {
                state.violation(format!("{fence:?} destroyed while pending"));
            }
        }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RhiResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock();
        loop {
            let mut all_signaled = true;
            for fence in fences {
                match state.fences.get(&fence.as_raw()) {
                    Some(f) => all_signaled &= f.signaled,
                    None => {
                        return Err(RhiError::InvalidState(format!(
                            "wait on unknown fence {fence:?}"
                        )));
                    }
                }
            }
            if all_signaled {
                for &fence in fences {
                    state.events.push(DeviceEvent::FenceWaited(fence));
                }
                return Ok(());
            }

            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => {
                        return Err(RhiError::Timeout {
                            operation: "fence",
                            waited: timeout,
                        });
                    }
                },
                None => Duration::from_secs(60),
            };
            state = self
                .shared
                .completed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.shared.lock();
        for &fence in fences {
            let Some(f) = state.fences.get_mut(&fence.as_raw()) else {
                return Err(RhiError::InvalidState(format!(
                    "reset of unknown fence {fence:?}"
                )));
            };
            let pending = f.pending;
            f.signaled = false;
            if pending {
                state.violation(format!("{fence:?} reset while its submission is pending"));
            }
            state.events.push(DeviceEvent::FenceReset(fence));
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.shared
            .lock()
            .fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .ok_or_else(|| RhiError::InvalidState(format!("unknown fence {fence:?}")))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let semaphore: vk::Semaphore = self.shared.handle();
        self.shared
            .lock()
            .semaphores
            .insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.shared.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let deadline = Instant::now() + IDLE_TIMEOUT;
        let mut state = self.shared.lock();
        loop {
            if state.gpu_hung && state.outstanding > 0 {
                return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
            }
            if state.outstanding == 0 {
                state.events.push(DeviceEvent::Idle);
                return Ok(());
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
            };
            state = self
                .shared
                .completed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn create_command_pool(
        &self,
        _flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let pool: vk::CommandPool = self.shared.handle();
        self.shared.lock().command_pools.insert(pool.as_raw());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.shared.lock();
        state.command_pools.remove(&pool.as_raw());
        let pending = state
            .command_buffers
            .values()
            .any(|cb| cb.pool == pool.as_raw() && cb.state == RecordingState::Pending);
        if pending {
            state.violation(format!("{pool:?} destroyed with a pending command buffer"));
        }
        state
            .command_buffers
            .retain(|_, cb| cb.pool != pool.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.shared.lock();
        if !state.command_pools.contains(&pool.as_raw()) {
            return Err(RhiError::InvalidState(format!("unknown command pool {pool:?}")));
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| self.shared.handle()).collect();
        for buffer in &buffers {
            state.command_buffers.insert(
                buffer.as_raw(),
                CommandBufferState {
                    pool: pool.as_raw(),
                    state: RecordingState::Initial,
                    commands: Vec::new(),
                },
            );
        }
        Ok(buffers)
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.shared.lock();
        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(RhiError::InvalidState(format!(
                "reset of unknown command buffer {command_buffer:?}"
            )));
        };
        let was_pending = cb.state == RecordingState::Pending;
        cb.state = RecordingState::Initial;
        cb.commands.clear();
        if was_pending {
            state.violation(format!(
                "{command_buffer:?} reset while its submission is pending"
            ));
        }
        state
            .events
            .push(DeviceEvent::CommandBufferReset(command_buffer));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let mut state = self.shared.lock();
        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(RhiError::InvalidState(format!(
                "begin on unknown command buffer {command_buffer:?}"
            )));
        };
        let previous = cb.state;
        cb.state = RecordingState::Recording;
        cb.commands.clear();
        if matches!(previous, RecordingState::Pending | RecordingState::Recording) {
            state.violation(format!("{command_buffer:?} begun while {previous:?}"));
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.shared.lock();
        match state.command_buffers.get_mut(&command_buffer.as_raw()) {
            Some(cb) if cb.state == RecordingState::Recording => {
                cb.state = RecordingState::Executable;
                Ok(())
            }
            Some(_) => Err(RhiError::InvalidState(format!(
                "{command_buffer:?} ended while not recording"
            ))),
            None => Err(RhiError::InvalidState(format!(
                "end on unknown command buffer {command_buffer:?}"
            ))),
        }
    }

    fn queue_submit(&self, submit: &QueueSubmit) -> RhiResult<()> {
        let mut state = self.shared.lock();
        let command_buffer = submit.command_buffer;

        let commands = match state.command_buffers.get_mut(&command_buffer.as_raw()) {
            Some(cb) if cb.state == RecordingState::Executable => {
                cb.state = RecordingState::Pending;
                cb.commands.clone()
            }
            Some(cb) => {
                let current = cb.state;
                state.violation(format!("{command_buffer:?} submitted while {current:?}"));
                return Err(RhiError::InvalidState(format!(
                    "{command_buffer:?} is not executable"
                )));
            }
            None => {
                return Err(RhiError::InvalidState(format!(
                    "submit of unknown command buffer {command_buffer:?}"
                )));
            }
        };

        if let Some((semaphore, _)) = submit.wait {
            state.consume_semaphore(semaphore, "submit");
        }
        if let Some((semaphore, _)) = submit.signal {
            state.signal_semaphore(semaphore, "submit");
        }

        let fence = submit.fence;
        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(f) => {
                    let busy = f.signaled || f.pending;
                    f.pending = true;
                    if busy {
                        state.violation(format!(
                            "{fence:?} submitted while signaled or still pending"
                        ));
                    }
                }
                None => {
                    return Err(RhiError::InvalidState(format!(
                        "submit with unknown fence {fence:?}"
                    )));
                }
            }
        }

        let mut ops = Vec::new();
        for command in commands {
            match command {
                Command::Fill {
                    dst,
                    offset,
                    size,
                    data,
                } => {
                    if let Some(cell) = Self::buffer_cell(&state, vk::Buffer::from_raw(dst)) {
                        ops.push(Op::Fill {
                            cell,
                            offset,
                            size,
                            data,
                        });
                    }
                }
                Command::Copy { src, dst, regions } => {
                    let src = Self::buffer_cell(&state, vk::Buffer::from_raw(src));
                    let dst = Self::buffer_cell(&state, vk::Buffer::from_raw(dst));
                    if let (Some(src), Some(dst)) = (src, dst) {
                        ops.push(Op::Copy { src, dst, regions });
                    }
                }
                Command::Other => {}
            }
        }
        for op in &ops {
            for cell in op.cells() {
                cell.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }

        state.submissions += 1;
        state.outstanding += 1;
        state.events.push(DeviceEvent::Submitted {
            command_buffer,
            fence,
        });
        let hung = state.gpu_hung;
        drop(state);

        if !hung {
            self.send(Job {
                command_buffer: command_buffer.as_raw(),
                fence: fence.as_raw(),
                ops,
            });
        }
        Ok(())
    }

    fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency: &vk::DependencyInfo<'_>,
    ) {
        let mut state = self.shared.lock();
        state.require_recording(command_buffer, Command::Other);
        if dependency.image_memory_barrier_count > 0 && !dependency.p_image_memory_barriers.is_null()
        {
            // Safety: ash builds the pointer/count pair from a live slice.
            let barriers = unsafe {
                std::slice::from_raw_parts(
                    dependency.p_image_memory_barriers,
                    dependency.image_memory_barrier_count as usize,
                )
            };
            for barrier in barriers {
                state.barriers.push(BarrierRecord {
                    image: barrier.image,
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                    aspect: barrier.subresource_range.aspect_mask,
                });
            }
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.shared.lock().require_recording(
            command_buffer,
            Command::Copy {
                src: src.as_raw(),
                dst: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        self.shared.lock().require_recording(
            command_buffer,
            Command::Fill {
                dst: dst.as_raw(),
                offset,
                size,
                data,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        _src: vk::Buffer,
        _dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.shared
            .lock()
            .require_recording(command_buffer, Command::Other);
    }

    fn cmd_blit_image2(&self, command_buffer: vk::CommandBuffer, _info: &vk::BlitImageInfo2<'_>) {
        self.shared
            .lock()
            .require_recording(command_buffer, Command::Other);
    }

    fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        _image: vk::Image,
        _layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) {
        self.shared
            .lock()
            .require_recording(command_buffer, Command::Other);
    }

    fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let layout: vk::DescriptorSetLayout = self.shared.handle();
        self.shared.lock().layouts.insert(layout.as_raw());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.shared.lock().layouts.remove(&layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let pool: vk::DescriptorPool = self.shared.handle();
        let mut state = self.shared.lock();
        state.descriptor_pools.insert(
            pool.as_raw(),
            PoolState {
                max_sets,
                allocated: 0,
            },
        );
        state.pool_capacities.push(max_sets);
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.shared.lock().descriptor_pools.remove(&pool.as_raw());
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        match self.shared.lock().descriptor_pools.get_mut(&pool.as_raw()) {
            Some(p) => {
                p.allocated = 0;
                Ok(())
            }
            None => Err(RhiError::InvalidState(format!(
                "reset of unknown descriptor pool {pool:?}"
            ))),
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.shared.lock();
        if let Some(result) = state.forced_pool_failures.pop_front() {
            return Err(RhiError::VulkanError(result));
        }
        let Some(p) = state.descriptor_pools.get_mut(&pool.as_raw()) else {
            return Err(RhiError::InvalidState(format!(
                "allocation from unknown descriptor pool {pool:?}"
            )));
        };
        if p.allocated >= p.max_sets {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        p.allocated += 1;
        drop(state);
        Ok(self.shared.handle())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let batch = writes
            .iter()
            .map(|w| DescriptorWriteRecord {
                set: w.dst_set,
                binding: w.dst_binding,
                ty: w.descriptor_type,
                count: w.descriptor_count,
            })
            .collect();
        self.shared.lock().descriptor_writes.push(batch);
    }

    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        location: MemoryLocation,
        _name: &str,
    ) -> RhiResult<(vk::Buffer, FakeMemory)> {
        let buffer: vk::Buffer = self.shared.handle();
        let cell = Arc::new(MemoryCell {
            bytes: Mutex::new(vec![0; info.size as usize]),
            host_visible: location != MemoryLocation::GpuOnly,
            in_flight: AtomicU32::new(0),
        });
        self.shared
            .lock()
            .buffers
            .insert(buffer.as_raw(), cell.clone());
        Ok((
            buffer,
            FakeMemory {
                cell,
                shared: self.shared.clone(),
            },
        ))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: FakeMemory) {
        let mut state = self.shared.lock();
        state.buffers.remove(&buffer.as_raw());
        if memory.cell.in_flight.load(Ordering::Acquire) > 0 {
            state.violation(format!("{buffer:?} destroyed while a submission uses it"));
        }
    }

    fn create_image(
        &self,
        _info: &vk::ImageCreateInfo<'_>,
        _name: &str,
    ) -> RhiResult<(vk::Image, FakeMemory)> {
        let image: vk::Image = self.shared.handle();
        self.shared.lock().images.insert(image.as_raw());
        let cell = Arc::new(MemoryCell {
            bytes: Mutex::new(Vec::new()),
            host_visible: false,
            in_flight: AtomicU32::new(0),
        });
        Ok((
            image,
            FakeMemory {
                cell,
                shared: self.shared.clone(),
            },
        ))
    }

    fn destroy_image(&self, image: vk::Image, _memory: FakeMemory) {
        self.shared.lock().images.remove(&image.as_raw());
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        let view: vk::ImageView = self.shared.handle();
        self.shared.lock().views.insert(view.as_raw());
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.shared.lock().views.remove(&view.as_raw());
    }
}

/// Scripted result of the next [`FakeSwapchain`] acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedAcquire {
    Ready,
    Suboptimal,
    Stale,
    Timeout,
}

/// [`PresentTarget`] over a [`FakeDevice`].
///
/// Acquires hand out image indices round-robin unless a scripted outcome
/// says otherwise; presents are recorded.
pub struct FakeSwapchain {
    device: Arc<FakeDevice>,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    format: vk::Format,
    next_image: u32,
    acquire_script: VecDeque<ScriptedAcquire>,
    present_script: VecDeque<PresentOutcome>,
    presented: Vec<u32>,
    acquire_calls: usize,
}

impl FakeSwapchain {
    pub fn new(device: Arc<FakeDevice>, image_count: u32, extent: vk::Extent2D) -> Self {
        let images = (0..image_count).map(|_| device.shared.handle()).collect();
        let views = (0..image_count).map(|_| device.shared.handle()).collect();
        Self {
            device,
            images,
            views,
            extent,
            format: vk::Format::B8G8R8A8_UNORM,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            presented: Vec::new(),
            acquire_calls: 0,
        }
    }

    /// Queues the outcome of a future acquire.
    pub fn script_acquire(&mut self, outcome: ScriptedAcquire) {
        self.acquire_script.push_back(outcome);
    }

    /// Queues the outcome of a future present.
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    /// Image indices presented so far.
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls
    }

    /// Simulates a rebuild at a new size.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.extent = extent;
        self.next_image = 0;
    }
}

impl PresentTarget for FakeSwapchain {
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome> {
        self.acquire_calls += 1;
        let scripted = self
            .acquire_script
            .pop_front()
            .unwrap_or(ScriptedAcquire::Ready);

        let suboptimal = match scripted {
            ScriptedAcquire::Stale => return Ok(AcquireOutcome::Stale),
            ScriptedAcquire::Timeout => {
                return Err(RhiError::Timeout {
                    operation: "swapchain acquire",
                    waited: timeout,
                });
            }
            ScriptedAcquire::Ready => false,
            ScriptedAcquire::Suboptimal => true,
        };

        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images.len() as u32;

        let mut state = self.device.shared.lock();
        state.signal_semaphore(signal, "acquire");
        state.events.push(DeviceEvent::ImageAcquired { image_index });

        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal,
        })
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        {
            let mut state = self.device.shared.lock();
            state.consume_semaphore(wait, "present");
            state.events.push(DeviceEvent::Presented { image_index });
        }
        self.presented.push(image_index);
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn image(&self, image_index: u32) -> vk::Image {
        self.images[image_index as usize]
    }

    fn image_view(&self, image_index: u32) -> vk::ImageView {
        self.views[image_index as usize]
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_executes_fill_and_signals_fence() {
        let device = FakeDevice::with_latency(Duration::from_millis(5));
        let (buffer, memory) = device
            .create_buffer(
                &vk::BufferCreateInfo::default().size(8),
                MemoryLocation::GpuToCpu,
                "readback",
            )
            .unwrap();
        let pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        let fence = device.create_fence(false).unwrap();

        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        device.cmd_fill_buffer(cmd, buffer, 0, vk::WHOLE_SIZE, 0xDEAD_BEEF);
        device.end_command_buffer(cmd).unwrap();
        device
            .queue_submit(&QueueSubmit::standalone(cmd, fence))
            .unwrap();

        device
            .wait_for_fences(&[fence], Duration::from_secs(1))
            .unwrap();
        let mut out = [0u8; 8];
        memory.read_bytes(0, &mut out).unwrap();
        assert_eq!(&out[..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&out[4..], &0xDEAD_BEEFu32.to_le_bytes());
        assert!(device.violations().is_empty());

        device.destroy_buffer(buffer, memory);
        device.destroy_fence(fence);
        device.destroy_command_pool(pool);
    }

    #[test]
    fn test_resubmitting_pending_fence_is_a_violation() {
        let device = FakeDevice::new();
        device.hang_gpu();
        let pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmds = device.allocate_command_buffers(pool, 2).unwrap();
        let fence = device.create_fence(false).unwrap();

        for &cmd in &cmds {
            device
                .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .unwrap();
            device.end_command_buffer(cmd).unwrap();
            device
                .queue_submit(&QueueSubmit::standalone(cmd, fence))
                .unwrap();
        }

        assert_eq!(device.violations().len(), 1);
        assert!(matches!(
            device.wait_idle(),
            Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn test_unsignaled_semaphore_wait_is_a_violation() {
        let device = FakeDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let mut swapchain = FakeSwapchain::new(
            device.clone(),
            2,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
        );

        swapchain.present(0, semaphore).unwrap();
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn test_fake_swapchain_round_robin_and_script() {
        let device = FakeDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let mut swapchain = FakeSwapchain::new(
            device.clone(),
            2,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
        );
        swapchain.script_acquire(ScriptedAcquire::Ready);
        swapchain.script_acquire(ScriptedAcquire::Stale);

        let first = swapchain
            .acquire_next_image(semaphore, Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            first,
            AcquireOutcome::Ready {
                image_index: 0,
                suboptimal: false
            }
        );
        swapchain.present(0, semaphore).unwrap();

        let second = swapchain
            .acquire_next_image(semaphore, Duration::from_secs(1))
            .unwrap();
        assert_eq!(second, AcquireOutcome::Stale);

        let third = swapchain
            .acquire_next_image(semaphore, Duration::from_secs(1))
            .unwrap();
        assert!(matches!(third, AcquireOutcome::Ready { image_index: 1, .. }));
        assert_eq!(swapchain.presented(), &[0]);
        assert!(device.violations().is_empty());
    }
}
