// Conversions between the backend-agnostic enums and Vulkan

use super::{
    BufferUsage, CullMode, FillMode, FrontFace, LoadOp, PresentMode, PrimitiveType, StoreOp,
    TextureFormat, TransferBufferUsage,
};
use ash::vk;

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::B8G8R8A8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::R8G8B8A8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
    }
}

pub fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub fn primitive_topology(primitive: PrimitiveType) -> vk::PrimitiveTopology {
    match primitive {
        PrimitiveType::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

pub fn polygon_mode(fill_mode: FillMode) -> vk::PolygonMode {
    match fill_mode {
        FillMode::Fill => vk::PolygonMode::FILL,
        FillMode::Line => vk::PolygonMode::LINE,
    }
}

pub fn cull_mode(cull_mode: CullMode) -> vk::CullModeFlags {
    match cull_mode {
        CullMode::None => vk::CullModeFlags::NONE,
    }
}

pub fn front_face(front_face: FrontFace) -> vk::FrontFace {
    match front_face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    // Every device buffer is filled through a copy pass.
    let usage = match usage {
        BufferUsage::GraphicsStorageRead => vk::BufferUsageFlags::STORAGE_BUFFER,
    };
    usage | vk::BufferUsageFlags::TRANSFER_DST
}

pub fn transfer_buffer_usage(usage: TransferBufferUsage) -> vk::BufferUsageFlags {
    match usage {
        TransferBufferUsage::Upload => vk::BufferUsageFlags::TRANSFER_SRC,
    }
}

pub fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}
