// Backend module - GPU abstraction layer
//
// `Gpu` is the contract the triangle is written against. Resources are
// referred to by small copyable handles; drawing is recorded into a
// backend-agnostic `CommandBuffer` and translated by the backend at submit.

pub mod buffer;
pub mod command;
pub mod conv;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

use anyhow::Result;

pub use command::{BufferRegion, ColorTargetInfo, CommandBuffer, TransferBufferLocation, Viewport};
pub use device::VulkanDevice;
pub use swapchain::Swapchain;
pub use vulkan::VulkanGpu;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);
    };
}

handle!(
    /// A compiled shader stage.
    ShaderHandle
);
handle!(
    /// A graphics pipeline.
    GraphicsPipelineHandle
);
handle!(
    /// Device-local buffer.
    BufferHandle
);
handle!(
    /// Host-visible staging buffer.
    TransferBufferHandle
);
handle!(
    /// A texture; the swapchain images are the only textures this program uses.
    TextureHandle
);

impl TextureHandle {
    /// Index of the swapchain image behind this texture.
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderFormat {
    Spirv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    TriangleList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    GraphicsStorageRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBufferUsage {
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// What the host asks for when it creates a window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDesc {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

/// What the host asks for when it creates a GPU device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDesc {
    pub shader_formats: Vec<ShaderFormat>,
    pub debug_mode: bool,
    pub present_mode: PresentMode,
    pub frames_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct ShaderCreateInfo<'a> {
    pub code: &'a [u8],
    pub entrypoint: &'a str,
    pub format: ShaderFormat,
    pub stage: ShaderStage,
    pub num_samplers: u32,
    pub num_storage_textures: u32,
    pub num_storage_buffers: u32,
    pub num_uniform_buffers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTargetDescription {
    pub format: TextureFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsPipelineCreateInfo {
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: ShaderHandle,
    pub primitive_type: PrimitiveType,
    pub rasterizer_state: RasterizerState,
    pub color_target: ColorTargetDescription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBufferCreateInfo {
    pub usage: TransferBufferUsage,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub usage: BufferUsage,
    pub size: u32,
}

/// GPU device contract.
///
/// Every creation call either returns a live handle or an error; there is
/// no null handle.
pub trait Gpu {
    /// The window type this device presents to.
    type Window;

    /// Connect the device to a window for presentation.
    fn claim_window(&mut self, window: &Self::Window) -> Result<()>;

    /// Format of the images handed out by `wait_and_acquire_swapchain_texture`.
    fn swapchain_texture_format(&self, window: &Self::Window) -> Result<TextureFormat>;

    fn create_shader(&mut self, info: &ShaderCreateInfo<'_>) -> Result<ShaderHandle>;

    fn create_graphics_pipeline(
        &mut self,
        info: &GraphicsPipelineCreateInfo,
    ) -> Result<GraphicsPipelineHandle>;

    fn create_transfer_buffer(
        &mut self,
        info: &TransferBufferCreateInfo,
    ) -> Result<TransferBufferHandle>;

    /// Map the transfer buffer, copy `data` at `offset`, unmap.
    fn write_transfer_buffer(
        &mut self,
        buffer: TransferBufferHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<()>;

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle>;

    /// Attach a debug name to a buffer. Purely diagnostic.
    fn set_buffer_name(&mut self, buffer: BufferHandle, name: &str);

    fn acquire_command_buffer(&mut self) -> Result<CommandBuffer>;

    /// Block until the next swapchain image is available and attach it to
    /// `cmd`. `Ok(None)` means there is nothing to present to right now.
    fn wait_and_acquire_swapchain_texture(
        &mut self,
        cmd: &mut CommandBuffer,
        window: &Self::Window,
    ) -> Result<Option<TextureHandle>>;

    /// Execute the recorded commands; presents the acquired swapchain
    /// texture, if any.
    fn submit(&mut self, cmd: CommandBuffer) -> Result<()>;

    fn release_shader(&mut self, shader: ShaderHandle);
    fn release_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle);
    fn release_buffer(&mut self, buffer: BufferHandle);
    fn release_transfer_buffer(&mut self, buffer: TransferBufferHandle);

    fn wait_idle(&mut self) -> Result<()>;
}

/// Check a byte range against a buffer size.
pub(crate) fn check_range(what: &str, size: u32, offset: u32, len: u32) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => anyhow::bail!(
            "{} range {}..{} is outside its {} bytes",
            what,
            offset,
            u64::from(offset) + u64::from(len),
            size
        ),
    }
}
