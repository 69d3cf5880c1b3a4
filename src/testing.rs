// In-memory GPU for tests
//
// `RecordingGpu` implements the `Gpu` contract without a driver: buffers are
// byte vectors, copy passes are executed at submit, and every submitted
// command buffer is kept. Platform and device share one `Recording`, so a
// test can still inspect it after the application has quit.

use anyhow::{Context, Result};
use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use crate::app::Platform;
use crate::backend::command::Command;
use crate::backend::{
    check_range, BufferCreateInfo, BufferHandle, BufferUsage, CommandBuffer, DeviceDesc, Gpu,
    GraphicsPipelineCreateInfo, GraphicsPipelineHandle, ShaderCreateInfo, ShaderFormat,
    ShaderHandle, ShaderStage, TextureFormat, TextureHandle, TransferBufferCreateInfo,
    TransferBufferHandle, WindowDesc,
};

/// Calls that should fail, toggled by tests.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub create_window: bool,
    pub create_device: bool,
    pub claim_window: bool,
    pub create_shader: bool,
    pub create_pipeline: bool,
    pub create_buffer: bool,
    pub acquire_command_buffer: bool,
    pub acquire_texture: bool,
    /// Acquisition succeeds but there is nothing to draw to.
    pub no_texture: bool,
    pub submit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestWindow {
    pub id: u32,
}

#[derive(Debug, Clone)]
pub struct ShaderRecord {
    pub code: Vec<u8>,
    pub entrypoint: String,
    pub format: ShaderFormat,
    pub stage: ShaderStage,
    pub num_samplers: u32,
    pub num_storage_textures: u32,
    pub num_storage_buffers: u32,
    pub num_uniform_buffers: u32,
}

#[derive(Debug, Clone)]
pub struct BufferRecord {
    pub usage: BufferUsage,
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransferBufferRecord {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Recording {
    pub faults: Faults,
    pub windows: Vec<WindowDesc>,
    pub devices: Vec<DeviceDesc>,
    pub claimed: Option<TestWindow>,
    pub shaders: HashMap<ShaderHandle, ShaderRecord>,
    pub pipelines: HashMap<GraphicsPipelineHandle, GraphicsPipelineCreateInfo>,
    pub buffers: HashMap<BufferHandle, BufferRecord>,
    pub transfer_buffers: HashMap<TransferBufferHandle, TransferBufferRecord>,
    pub submissions: Vec<CommandBuffer>,
    pub idle_waits: usize,
    next_handle: u32,
}

impl Recording {
    fn next_id(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Submissions that rendered to a swapchain texture.
    pub fn frames(&self) -> impl Iterator<Item = &CommandBuffer> {
        self.submissions
            .iter()
            .filter(|cmd| cmd.swapchain_texture().is_some())
    }
}

pub struct RecordingPlatform {
    shared: Rc<RefCell<Recording>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Recording::default())),
        }
    }

    pub fn recording(&self) -> RefMut<'_, Recording> {
        self.shared.borrow_mut()
    }
}

impl Platform for RecordingPlatform {
    type Gpu = RecordingGpu;

    fn create_window(&mut self, desc: &WindowDesc) -> Result<TestWindow> {
        let mut recording = self.recording();
        if recording.faults.create_window {
            anyhow::bail!("Window creation refused");
        }
        recording.windows.push(desc.clone());
        Ok(TestWindow {
            id: recording.windows.len() as u32,
        })
    }

    fn create_gpu_device(&mut self, desc: &DeviceDesc) -> Result<RecordingGpu> {
        let mut recording = self.recording();
        if recording.faults.create_device {
            anyhow::bail!("No GPU available");
        }
        recording.devices.push(desc.clone());
        Ok(RecordingGpu {
            shared: self.shared.clone(),
        })
    }
}

pub struct RecordingGpu {
    shared: Rc<RefCell<Recording>>,
}

impl RecordingGpu {
    fn recording(&self) -> RefMut<'_, Recording> {
        self.shared.borrow_mut()
    }
}

impl Gpu for RecordingGpu {
    type Window = TestWindow;

    fn claim_window(&mut self, window: &TestWindow) -> Result<()> {
        let mut recording = self.recording();
        if recording.faults.claim_window {
            anyhow::bail!("Surface creation refused");
        }
        if recording.claimed.is_some() {
            anyhow::bail!("A window is already claimed");
        }
        recording.claimed = Some(*window);
        Ok(())
    }

    fn swapchain_texture_format(&self, window: &TestWindow) -> Result<TextureFormat> {
        match self.recording().claimed {
            Some(claimed) if claimed == *window => Ok(TextureFormat::B8G8R8A8Unorm),
            _ => anyhow::bail!("Window {} is not claimed", window.id),
        }
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo<'_>) -> Result<ShaderHandle> {
        let mut recording = self.recording();
        if recording.faults.create_shader {
            anyhow::bail!("Shader rejected");
        }
        let handle = ShaderHandle(recording.next_id());
        recording.shaders.insert(
            handle,
            ShaderRecord {
                code: info.code.to_vec(),
                entrypoint: info.entrypoint.to_string(),
                format: info.format,
                stage: info.stage,
                num_samplers: info.num_samplers,
                num_storage_textures: info.num_storage_textures,
                num_storage_buffers: info.num_storage_buffers,
                num_uniform_buffers: info.num_uniform_buffers,
            },
        );
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        info: &GraphicsPipelineCreateInfo,
    ) -> Result<GraphicsPipelineHandle> {
        let mut recording = self.recording();
        if recording.faults.create_pipeline {
            anyhow::bail!("Pipeline rejected");
        }
        for shader in [info.vertex_shader, info.fragment_shader] {
            if !recording.shaders.contains_key(&shader) {
                anyhow::bail!("Unknown shader {:?}", shader);
            }
        }
        let handle = GraphicsPipelineHandle(recording.next_id());
        recording.pipelines.insert(handle, info.clone());
        Ok(handle)
    }

    fn create_transfer_buffer(
        &mut self,
        info: &TransferBufferCreateInfo,
    ) -> Result<TransferBufferHandle> {
        let mut recording = self.recording();
        if recording.faults.create_buffer {
            anyhow::bail!("Out of memory");
        }
        let handle = TransferBufferHandle(recording.next_id());
        recording.transfer_buffers.insert(
            handle,
            TransferBufferRecord {
                bytes: vec![0; info.size as usize],
            },
        );
        Ok(handle)
    }

    fn write_transfer_buffer(
        &mut self,
        buffer: TransferBufferHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut recording = self.recording();
        let record = recording
            .transfer_buffers
            .get_mut(&buffer)
            .context("Unknown transfer buffer")?;
        check_range("Transfer buffer", record.bytes.len() as u32, offset, data.len() as u32)?;
        let start = offset as usize;
        record.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let mut recording = self.recording();
        if recording.faults.create_buffer {
            anyhow::bail!("Out of memory");
        }
        let handle = BufferHandle(recording.next_id());
        recording.buffers.insert(
            handle,
            BufferRecord {
                usage: info.usage,
                name: None,
                bytes: vec![0; info.size as usize],
            },
        );
        Ok(handle)
    }

    fn set_buffer_name(&mut self, buffer: BufferHandle, name: &str) {
        if let Some(record) = self.recording().buffers.get_mut(&buffer) {
            record.name = Some(name.to_string());
        }
    }

    fn acquire_command_buffer(&mut self) -> Result<CommandBuffer> {
        if self.recording().faults.acquire_command_buffer {
            anyhow::bail!("Command buffer pool exhausted");
        }
        Ok(CommandBuffer::new())
    }

    fn wait_and_acquire_swapchain_texture(
        &mut self,
        cmd: &mut CommandBuffer,
        window: &TestWindow,
    ) -> Result<Option<TextureHandle>> {
        let recording = self.recording();
        if recording.claimed != Some(*window) {
            anyhow::bail!("Window {} is not claimed", window.id);
        }
        if recording.faults.acquire_texture {
            anyhow::bail!("Swapchain lost");
        }
        if recording.faults.no_texture {
            return Ok(None);
        }
        // Cycle through three images like a typical swapchain
        let texture = TextureHandle(recording.submissions.len() as u32 % 3);
        cmd.attach_swapchain_texture(texture);
        Ok(Some(texture))
    }

    fn submit(&mut self, cmd: CommandBuffer) -> Result<()> {
        let mut recording = self.recording();
        if recording.faults.submit {
            anyhow::bail!("Device lost");
        }

        for command in cmd.commands() {
            match command {
                Command::CopyPass(uploads) => {
                    for upload in uploads {
                        let size = upload.destination.size;
                        let source = recording
                            .transfer_buffers
                            .get(&upload.source.transfer_buffer)
                            .context("Upload from an unknown transfer buffer")?;
                        check_range(
                            "Upload source",
                            source.bytes.len() as u32,
                            upload.source.offset,
                            size,
                        )?;
                        let start = upload.source.offset as usize;
                        let data = source.bytes[start..start + size as usize].to_vec();

                        let destination = recording
                            .buffers
                            .get_mut(&upload.destination.buffer)
                            .context("Upload to an unknown buffer")?;
                        check_range(
                            "Upload destination",
                            destination.bytes.len() as u32,
                            upload.destination.offset,
                            size,
                        )?;
                        let start = upload.destination.offset as usize;
                        destination.bytes[start..start + data.len()].copy_from_slice(&data);
                    }
                }
                Command::RenderPass { color_target, .. } => {
                    if cmd.swapchain_texture() != Some(color_target.texture) {
                        anyhow::bail!("Render pass targets a texture that was not acquired");
                    }
                }
            }
        }

        recording.submissions.push(cmd);
        Ok(())
    }

    fn release_shader(&mut self, shader: ShaderHandle) {
        self.recording().shaders.remove(&shader);
    }

    fn release_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) {
        self.recording().pipelines.remove(&pipeline);
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        self.recording().buffers.remove(&buffer);
    }

    fn release_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        self.recording().transfer_buffers.remove(&buffer);
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.recording().idle_waits += 1;
        Ok(())
    }
}
