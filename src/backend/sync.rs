// Synchronization primitives
//
// One `FrameSync` per frame in flight: the fence tells the CPU when the GPU
// is done with the slot, the semaphore orders acquire -> render. The
// render -> present semaphores belong to the swapchain images instead, since
// a present may still be waiting on one after the slot's fence has signaled.

use anyhow::{Context, Result};
use ash::vk;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSync {
    pub fn new(device: &ash::Device, command_pool: vk::CommandPool) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on a fresh slot returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        unsafe {
            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffer")?[0];

            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.create_fence(&fence_info, None)?,
                command_buffer,
            })
        }
    }

    /// Block until the GPU has finished the last submission from this slot.
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
            .context("Failed waiting for frame fence")
    }

    /// Command buffers are freed with their pool.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
