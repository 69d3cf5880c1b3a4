// Buffer utilities
//
// Buffers are backed by gpu-allocator allocations: host-visible ones for
// transfer buffers, device-local ones for everything the shaders read.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;

/// A `vk::Buffer` together with the memory bound to it.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: u32,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Create a buffer with specified usage in the given memory location
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: u32,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Cannot create zero-sized buffer '{}'", name);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(vk::DeviceSize::from(size))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };

        let mut gpu_buffer = Self {
            buffer,
            size,
            allocation: Some(allocation),
        };

        if let Err(e) = bound {
            gpu_buffer.destroy(device);
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(gpu_buffer)
    }

    /// Copy `data` into a host-visible buffer at `offset`.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).context("Write larger than 4 GiB")?;
        super::check_range("Transfer buffer", self.size, offset, len)?;

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
