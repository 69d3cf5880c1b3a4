// Vulkan implementation of the `Gpu` contract
//
// Resources live in tables keyed by handle id. Recorded command buffers are
// translated into the current frame slot's Vulkan command buffer at submit
// time; a frame slot is reused only after its fence has signaled.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use winit::window::Window;

use super::buffer::GpuBuffer;
use super::command::{BufferUpload, Command, PassCommand};
use super::pipeline::{self, PipelineDesc};
use super::sync::FrameSync;
use super::{
    check_range, conv, shader, surface, BufferCreateInfo, BufferHandle, BufferUsage,
    ColorTargetInfo, CommandBuffer, DeviceDesc, FillMode, Gpu, GraphicsPipelineCreateInfo,
    GraphicsPipelineHandle, LoadOp, ShaderCreateInfo, ShaderFormat, ShaderHandle, ShaderStage,
    StoreOp, Swapchain, TextureFormat, TextureHandle, TransferBufferCreateInfo,
    TransferBufferHandle, TransferBufferUsage, VulkanDevice,
};

const LOAD_OPS: [LoadOp; 2] = [LoadOp::Clear, LoadOp::DontCare];
const STORE_OPS: [StoreOp; 2] = [StoreOp::Store, StoreOp::DontCare];

const MAX_DESCRIPTOR_SETS: u32 = 64;
const MAX_STORAGE_DESCRIPTORS: u32 = 256;

struct ShaderEntry {
    module: vk::ShaderModule,
    entrypoint: CString,
    stage: ShaderStage,
    num_samplers: u32,
    num_storage_textures: u32,
    num_storage_buffers: u32,
    num_uniform_buffers: u32,
}

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    storage_set_layout: Option<vk::DescriptorSetLayout>,
    /// Vertex storage buffers the pipeline expects at set 0
    storage_buffers: u32,
}

/// A descriptor set is only valid for the layout it was allocated with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StorageSetKey {
    layout: vk::DescriptorSetLayout,
    buffers: Vec<BufferHandle>,
}

impl StorageSetKey {
    fn new(layout: vk::DescriptorSetLayout, buffers: &[BufferHandle]) -> Self {
        Self {
            layout,
            buffers: buffers.to_vec(),
        }
    }

    fn reads(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains(&buffer)
    }
}

struct BufferEntry {
    buffer: GpuBuffer,
    usage: BufferUsage,
}

/// Semaphores of a submission that renders to a swapchain image.
struct PresentSync {
    wait: [vk::Semaphore; 1],
    stages: [vk::PipelineStageFlags; 1],
    signal: [vk::Semaphore; 1],
}

impl PresentSync {
    /// Waits on the slot's acquire semaphore, signals the semaphore owned by
    /// the acquired image.
    fn new(
        image_available: vk::Semaphore,
        texture: TextureHandle,
        present_semaphores: &[vk::Semaphore],
    ) -> Result<Self> {
        let signal = present_semaphores
            .get(texture.raw() as usize)
            .copied()
            .with_context(|| format!("No present semaphore for swapchain image {}", texture.raw()))?;
        Ok(Self {
            wait: [image_available],
            stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal: [signal],
        })
    }

    /// The returned info points into `sync` and `command_buffers`.
    fn submit_info(
        sync: Option<&PresentSync>,
        command_buffers: &[vk::CommandBuffer],
    ) -> vk::SubmitInfo {
        let info = vk::SubmitInfo::builder().command_buffers(command_buffers);
        match sync {
            Some(sync) => info
                .wait_semaphores(&sync.wait)
                .wait_dst_stage_mask(&sync.stages)
                .signal_semaphores(&sync.signal)
                .build(),
            None => info.build(),
        }
    }
}

/// What reaches the queue once recording is over.
#[derive(Debug)]
enum Batch {
    Recorded,
    /// Recording failed while a swapchain image is held. The image still has
    /// to go through a submission and a present.
    Blank(TextureHandle, anyhow::Error),
    /// Recording failed and nothing was acquired.
    Abandon(anyhow::Error),
}

impl Batch {
    fn after_recording(recorded: Result<()>, texture: Option<TextureHandle>) -> Self {
        match (recorded, texture) {
            (Ok(()), _) => Batch::Recorded,
            (Err(e), Some(texture)) => Batch::Blank(texture, e),
            (Err(e), None) => Batch::Abandon(e),
        }
    }
}

/// The claimed window and everything that depends on its surface
struct PresentTarget {
    window: Arc<Window>,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    swapchain: Swapchain,
    render_passes: HashMap<(LoadOp, StoreOp), vk::RenderPass>,
    framebuffers: Vec<vk::Framebuffer>,
    /// Signaled by the submission that renders to image `i`, waited on by its present
    present_semaphores: Vec<vk::Semaphore>,
}

impl PresentTarget {
    fn create_attachments(&mut self, device: &ash::Device) -> Result<()> {
        for load_op in LOAD_OPS {
            for store_op in STORE_OPS {
                let render_pass =
                    pipeline::create_render_pass(device, self.swapchain.format, load_op, store_op)?;
                self.render_passes.insert((load_op, store_op), render_pass);
            }
        }

        // All variants are compatible, any of them works for the framebuffers
        let render_pass = self.render_pass(LoadOp::Clear, StoreOp::Store)?;
        self.framebuffers = pipeline::create_framebuffers(
            device,
            &self.swapchain.image_views,
            render_pass,
            self.swapchain.extent,
        )?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        for _ in &self.swapchain.images {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
                .context("Failed to create present semaphore")?;
            self.present_semaphores.push(semaphore);
        }
        Ok(())
    }

    fn render_pass(&self, load_op: LoadOp, store_op: StoreOp) -> Result<vk::RenderPass> {
        self.render_passes
            .get(&(load_op, store_op))
            .copied()
            .context("Render pass missing for this load/store combination")
    }

    fn destroy(self, device: &ash::Device) {
        unsafe {
            for framebuffer in self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for (_, render_pass) in self.render_passes {
                device.destroy_render_pass(render_pass, None);
            }
            for semaphore in self.present_semaphores {
                device.destroy_semaphore(semaphore, None);
            }
        }
        // The swapchain has to go before its surface
        drop(self.swapchain);
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

pub struct VulkanGpu {
    device: Arc<VulkanDevice>,
    present_mode: vk::PresentModeKHR,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    frames: Vec<FrameSync>,
    current_frame: usize,

    next_handle: u32,
    shaders: HashMap<ShaderHandle, ShaderEntry>,
    pipelines: HashMap<GraphicsPipelineHandle, PipelineEntry>,
    buffers: HashMap<BufferHandle, BufferEntry>,
    transfer_buffers: HashMap<TransferBufferHandle, GpuBuffer>,
    /// Storage-buffer set layouts by binding count
    storage_layouts: HashMap<u32, vk::DescriptorSetLayout>,
    /// Descriptor sets by layout and the buffers they point at, filled while recording
    storage_sets: Mutex<HashMap<StorageSetKey, vk::DescriptorSet>>,

    target: Option<PresentTarget>,
}

impl VulkanGpu {
    pub fn new(app_name: &str, display: RawDisplayHandle, desc: &DeviceDesc) -> Result<Self> {
        if !desc.shader_formats.contains(&ShaderFormat::Spirv) {
            anyhow::bail!(
                "No supported shader format requested ({:?}), Vulkan needs SPIR-V",
                desc.shader_formats
            );
        }

        let device = VulkanDevice::new(app_name, display, desc.debug_mode)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let mut gpu = Self {
            device,
            present_mode: conv::present_mode(desc.present_mode),
            command_pool,
            descriptor_pool: vk::DescriptorPool::null(),
            frames: Vec::new(),
            current_frame: 0,
            next_handle: 0,
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            buffers: HashMap::new(),
            transfer_buffers: HashMap::new(),
            storage_layouts: HashMap::new(),
            storage_sets: Mutex::new(HashMap::new()),
            target: None,
        };

        // From here on, Drop cleans up whatever was created
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: MAX_STORAGE_DESCRIPTORS,
        }];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);
        gpu.descriptor_pool =
            unsafe { gpu.device.device.create_descriptor_pool(&descriptor_pool_info, None) }
                .context("Failed to create descriptor pool")?;

        for _ in 0..desc.frames_in_flight.max(1) {
            let frame = FrameSync::new(&gpu.device.device, gpu.command_pool)?;
            gpu.frames.push(frame);
        }

        log::info!("GPU device ready, {} frames in flight", gpu.frames.len());
        Ok(gpu)
    }

    fn next_id(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn target_for(&self, window: &Window) -> Result<&PresentTarget> {
        self.target
            .as_ref()
            .filter(|target| target.window.id() == window.id())
            .context("Window is not claimed by this GPU device")
    }

    fn storage_layout(&mut self, count: u32) -> Result<vk::DescriptorSetLayout> {
        if let Some(&layout) = self.storage_layouts.get(&count) {
            return Ok(layout);
        }
        let layout = pipeline::create_storage_set_layout(&self.device.device, count)?;
        self.storage_layouts.insert(count, layout);
        Ok(layout)
    }

    /// Descriptor set pointing at `handles`, created on first use.
    fn storage_set(
        &self,
        handles: &[BufferHandle],
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let key = StorageSetKey::new(layout, handles);
        let mut sets = self.storage_sets.lock();
        if let Some(&set) = sets.get(&key) {
            return Ok(set);
        }

        let infos = handles
            .iter()
            .map(|handle| -> Result<vk::DescriptorBufferInfo> {
                let entry = self
                    .buffers
                    .get(handle)
                    .with_context(|| format!("Unknown buffer {:?}", handle))?;
                if entry.usage != BufferUsage::GraphicsStorageRead {
                    anyhow::bail!("Buffer {:?} was not created for storage reads", handle);
                }
                Ok(vk::DescriptorBufferInfo {
                    buffer: entry.buffer.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };

        sets.insert(key, set);
        Ok(set)
    }

    fn record(&self, cb: vk::CommandBuffer, cmd: &CommandBuffer) -> Result<()> {
        for command in cmd.commands() {
            match command {
                Command::CopyPass(uploads) => self.record_copy_pass(cb, uploads)?,
                Command::RenderPass {
                    color_target,
                    commands,
                } => self.record_render_pass(
                    cb,
                    cmd.swapchain_texture(),
                    color_target,
                    commands,
                )?,
            }
        }
        Ok(())
    }

    /// Reset `cb`, run `record` into it and close it.
    fn encode(&self, cb: vk::CommandBuffer, record: impl FnOnce() -> Result<()>) -> Result<()> {
        let device = &self.device.device;
        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cb, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        record()?;

        unsafe { device.end_command_buffer(cb) }.context("Failed to end command buffer")
    }

    /// Clear `texture` to black, leaving it ready to present.
    fn record_blank_pass(&self, cb: vk::CommandBuffer, texture: TextureHandle) -> Result<()> {
        let color_target = ColorTargetInfo {
            texture,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        };
        self.record_render_pass(cb, Some(texture), &color_target, &[])
    }

    fn record_copy_pass(&self, cb: vk::CommandBuffer, uploads: &[BufferUpload]) -> Result<()> {
        let device = &self.device.device;

        // Uploads are recorded in order, so `cycle` needs no special handling
        for upload in uploads {
            let source = self
                .transfer_buffers
                .get(&upload.source.transfer_buffer)
                .context("Upload from an unknown transfer buffer")?;
            let destination = self
                .buffers
                .get(&upload.destination.buffer)
                .context("Upload to an unknown buffer")?;

            let size = upload.destination.size;
            check_range("Upload source", source.size, upload.source.offset, size)?;
            check_range(
                "Upload destination",
                destination.buffer.size,
                upload.destination.offset,
                size,
            )?;

            let region = vk::BufferCopy {
                src_offset: vk::DeviceSize::from(upload.source.offset),
                dst_offset: vk::DeviceSize::from(upload.destination.offset),
                size: vk::DeviceSize::from(size),
            };
            unsafe {
                device.cmd_copy_buffer(cb, source.buffer, destination.buffer.buffer, &[region]);
            }
        }

        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ,
            )
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT
                    | vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    fn record_render_pass(
        &self,
        cb: vk::CommandBuffer,
        acquired: Option<TextureHandle>,
        color_target: &ColorTargetInfo,
        commands: &[PassCommand],
    ) -> Result<()> {
        let device = &self.device.device;
        let target = self.target.as_ref().context("No window claimed")?;

        if acquired != Some(color_target.texture) {
            anyhow::bail!(
                "Render target {:?} is not the swapchain texture acquired for this command buffer",
                color_target.texture
            );
        }
        let framebuffer = target
            .framebuffers
            .get(color_target.texture.raw() as usize)
            .copied()
            .context("Swapchain texture index out of range")?;
        let render_pass = target.render_pass(color_target.load_op, color_target.store_op)?;
        let extent = target.swapchain.extent;
        let full_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: color_target.clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(full_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_set_scissor(cb, 0, &[full_area]);
            device.cmd_set_viewport(
                cb,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
        }

        let mut bound_pipeline: Option<&PipelineEntry> = None;
        let mut storage_slots: Vec<Option<BufferHandle>> = Vec::new();

        let result = commands.iter().try_for_each(|command| -> Result<()> {
            match command {
                PassCommand::SetViewport(viewport) => unsafe {
                    device.cmd_set_viewport(
                        cb,
                        0,
                        &[vk::Viewport {
                            x: viewport.x,
                            y: viewport.y,
                            width: viewport.w,
                            height: viewport.h,
                            min_depth: viewport.min_depth,
                            max_depth: viewport.max_depth,
                        }],
                    );
                },
                PassCommand::BindGraphicsPipeline(handle) => {
                    let entry = self
                        .pipelines
                        .get(handle)
                        .with_context(|| format!("Unknown pipeline {:?}", handle))?;
                    unsafe {
                        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, entry.pipeline);
                    }
                    bound_pipeline = Some(entry);
                }
                PassCommand::BindVertexStorageBuffers {
                    first_slot,
                    buffers,
                } => {
                    let end = *first_slot as usize + buffers.len();
                    if storage_slots.len() < end {
                        storage_slots.resize(end, None);
                    }
                    for (slot, &buffer) in buffers.iter().enumerate() {
                        storage_slots[*first_slot as usize + slot] = Some(buffer);
                    }
                }
                PassCommand::Draw(draw) => {
                    let entry = bound_pipeline.context("Draw without a bound pipeline")?;
                    if let Some(layout) = entry.storage_set_layout {
                        let handles = (0..entry.storage_buffers as usize)
                            .map(|slot| {
                                storage_slots.get(slot).copied().flatten().with_context(|| {
                                    format!("Pipeline reads storage buffer {} but none is bound", slot)
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        let set = self.storage_set(&handles, layout)?;
                        unsafe {
                            device.cmd_bind_descriptor_sets(
                                cb,
                                vk::PipelineBindPoint::GRAPHICS,
                                entry.layout,
                                0,
                                &[set],
                                &[],
                            );
                        }
                    }
                    unsafe {
                        device.cmd_draw(
                            cb,
                            draw.num_vertices,
                            draw.num_instances,
                            draw.first_vertex,
                            draw.first_instance,
                        );
                    }
                }
            }
            Ok(())
        });

        unsafe { device.cmd_end_render_pass(cb) };
        result
    }

    fn destroy_buffer_entry(&mut self, handle: BufferHandle, mut entry: BufferEntry) {
        let stale: Vec<vk::DescriptorSet> = {
            let mut sets = self.storage_sets.lock();
            let keys: Vec<StorageSetKey> = sets
                .keys()
                .filter(|key| key.reads(handle))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| sets.remove(key)).collect()
        };
        unsafe {
            if !stale.is_empty() {
                if let Err(e) = self
                    .device
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &stale)
                {
                    log::warn!("Failed to free descriptor sets: {}", e);
                }
            }
        }
        entry.buffer.destroy(&self.device);
    }

    /// Releases wait for the GPU so nothing in flight loses a resource.
    fn idle_before_release(&self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Releasing a resource without an idle GPU: {:#}", e);
        }
    }
}

impl Gpu for VulkanGpu {
    type Window = Arc<Window>;

    fn claim_window(&mut self, window: &Arc<Window>) -> Result<()> {
        if self.target.is_some() {
            anyhow::bail!("This GPU device already presents to a window");
        }

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device = &self.device;
        let surface =
            unsafe { surface::create_surface(&device.entry, &device.instance, display, handle)? };
        let surface_loader = khr::Surface::new(&device.entry, &device.instance);

        // Verify the GPU supports presenting to this surface
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        };
        if !matches!(supported, Ok(true)) {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this window");
        }

        let size = window.inner_size();
        let swapchain = match Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            size.width,
            size.height,
            self.present_mode,
        ) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };

        let mut target = PresentTarget {
            window: window.clone(),
            surface,
            surface_loader,
            swapchain,
            render_passes: HashMap::new(),
            framebuffers: Vec::new(),
            present_semaphores: Vec::new(),
        };
        if let Err(e) = target.create_attachments(&device.device) {
            target.destroy(&device.device);
            return Err(e);
        }

        log::info!(
            "Claimed window {:?} for presentation ({} swapchain images)",
            window.id(),
            target.swapchain.images.len()
        );
        self.target = Some(target);
        Ok(())
    }

    fn swapchain_texture_format(&self, window: &Arc<Window>) -> Result<TextureFormat> {
        Ok(self.target_for(window)?.swapchain.texture_format)
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo<'_>) -> Result<ShaderHandle> {
        if info.format != ShaderFormat::Spirv {
            anyhow::bail!("Vulkan only accepts SPIR-V shaders, got {:?}", info.format);
        }
        let entrypoint =
            CString::new(info.entrypoint).context("Shader entry point contains a NUL byte")?;
        let module = shader::create_shader_module(&self.device.device, info.code)?;

        let handle = ShaderHandle(self.next_id());
        self.shaders.insert(
            handle,
            ShaderEntry {
                module,
                entrypoint,
                stage: info.stage,
                num_samplers: info.num_samplers,
                num_storage_textures: info.num_storage_textures,
                num_storage_buffers: info.num_storage_buffers,
                num_uniform_buffers: info.num_uniform_buffers,
            },
        );
        log::debug!(
            "Created {:?} shader {:?} ({} bytes)",
            info.stage,
            handle,
            info.code.len()
        );
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        info: &GraphicsPipelineCreateInfo,
    ) -> Result<GraphicsPipelineHandle> {
        let vertex = self
            .shaders
            .get(&info.vertex_shader)
            .context("Unknown vertex shader")?;
        let fragment = self
            .shaders
            .get(&info.fragment_shader)
            .context("Unknown fragment shader")?;

        if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
            anyhow::bail!("Pipeline needs a vertex and a fragment shader, in that order");
        }
        // Only vertex storage buffers have a binding scheme here
        let unsupported = vertex.num_samplers
            + vertex.num_storage_textures
            + vertex.num_uniform_buffers
            + fragment.num_samplers
            + fragment.num_storage_textures
            + fragment.num_storage_buffers
            + fragment.num_uniform_buffers;
        if unsupported > 0 {
            anyhow::bail!("Shaders declare resources other than vertex storage buffers");
        }
        if info.rasterizer_state.fill_mode == FillMode::Line
            && self.device.features.fill_mode_non_solid == vk::FALSE
        {
            anyhow::bail!("GPU does not support line fill mode");
        }

        let storage_buffers = vertex.num_storage_buffers;
        let vertex_module = vertex.module;
        let vertex_entry = vertex.entrypoint.clone();
        let fragment_module = fragment.module;
        let fragment_entry = fragment.entrypoint.clone();

        let target = self
            .target
            .as_ref()
            .context("Claim a window before creating pipelines")?;
        if info.color_target.format != target.swapchain.texture_format {
            anyhow::bail!(
                "Color target format {:?} does not match the swapchain ({:?})",
                info.color_target.format,
                target.swapchain.texture_format
            );
        }
        let render_pass = target.render_pass(LoadOp::Clear, StoreOp::Store)?;

        let storage_set_layout = if storage_buffers > 0 {
            Some(self.storage_layout(storage_buffers)?)
        } else {
            None
        };

        let (pipeline, layout) = pipeline::create_graphics_pipeline(
            &self.device.device,
            &PipelineDesc {
                render_pass,
                vertex_module,
                vertex_entry: &vertex_entry,
                fragment_module,
                fragment_entry: &fragment_entry,
                primitive_type: info.primitive_type,
                rasterizer: info.rasterizer_state,
                storage_set_layout,
            },
        )?;

        let handle = GraphicsPipelineHandle(self.next_id());
        self.pipelines.insert(
            handle,
            PipelineEntry {
                pipeline,
                layout,
                storage_set_layout,
                storage_buffers,
            },
        );
        log::debug!("Created graphics pipeline {:?}", handle);
        Ok(handle)
    }

    fn create_transfer_buffer(
        &mut self,
        info: &TransferBufferCreateInfo,
    ) -> Result<TransferBufferHandle> {
        let location = match info.usage {
            TransferBufferUsage::Upload => MemoryLocation::CpuToGpu,
        };
        let buffer = GpuBuffer::new(
            &self.device,
            "transfer buffer",
            info.size,
            conv::transfer_buffer_usage(info.usage),
            location,
        )?;

        let handle = TransferBufferHandle(self.next_id());
        self.transfer_buffers.insert(handle, buffer);
        log::debug!("Created {:?} transfer buffer {:?} ({} bytes)", info.usage, handle, info.size);
        Ok(handle)
    }

    fn write_transfer_buffer(
        &mut self,
        buffer: TransferBufferHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.transfer_buffers
            .get_mut(&buffer)
            .with_context(|| format!("Unknown transfer buffer {:?}", buffer))?
            .write(offset, data)
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let max_range = self.device.properties.limits.max_storage_buffer_range;
        if info.usage == BufferUsage::GraphicsStorageRead && info.size > max_range {
            anyhow::bail!(
                "Storage buffer of {} bytes exceeds the device limit of {}",
                info.size,
                max_range
            );
        }

        let buffer = GpuBuffer::new(
            &self.device,
            "buffer",
            info.size,
            conv::buffer_usage(info.usage),
            MemoryLocation::GpuOnly,
        )?;

        let handle = BufferHandle(self.next_id());
        self.buffers.insert(
            handle,
            BufferEntry {
                buffer,
                usage: info.usage,
            },
        );
        log::debug!("Created {:?} buffer {:?} ({} bytes)", info.usage, handle, info.size);
        Ok(handle)
    }

    fn set_buffer_name(&mut self, buffer: BufferHandle, name: &str) {
        match self.buffers.get(&buffer) {
            Some(entry) => self.device.set_object_name(entry.buffer.buffer, name),
            None => log::warn!("Cannot name unknown buffer {:?}", buffer),
        }
    }

    fn acquire_command_buffer(&mut self) -> Result<CommandBuffer> {
        Ok(CommandBuffer::new())
    }

    fn wait_and_acquire_swapchain_texture(
        &mut self,
        cmd: &mut CommandBuffer,
        window: &Arc<Window>,
    ) -> Result<Option<TextureHandle>> {
        let target = self.target_for(window)?;
        if cmd.swapchain_texture().is_some() {
            anyhow::bail!("Command buffer already holds a swapchain texture");
        }

        // Minimized: no image to render to
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(None);
        }

        // The slot's acquire semaphore is free once its last submission is done
        let frame = &self.frames[self.current_frame];
        frame.wait(&self.device.device)?;

        let (image_index, suboptimal) = target.swapchain.acquire_next_image(frame.image_available)?;
        if suboptimal {
            log::debug!("Swapchain is suboptimal for the window");
        }

        let texture = TextureHandle(image_index);
        cmd.attach_swapchain_texture(texture);
        Ok(Some(texture))
    }

    fn submit(&mut self, cmd: CommandBuffer) -> Result<()> {
        let device = self.device.clone();
        let frame = &self.frames[self.current_frame];
        frame.wait(&device.device)?;
        let (cb, image_available, fence) =
            (frame.command_buffer, frame.image_available, frame.in_flight_fence);

        let texture = cmd.swapchain_texture();
        let sync = match texture {
            Some(texture) => {
                let target = self.target.as_ref().context("No window claimed")?;
                Some(PresentSync::new(image_available, texture, &target.present_semaphores)?)
            }
            None => None,
        };

        let recorded = self.encode(cb, || self.record(cb, &cmd));
        let (mut failure, command_buffers) = match Batch::after_recording(recorded, texture) {
            Batch::Recorded => (None, vec![cb]),
            Batch::Abandon(e) => return Err(e),
            Batch::Blank(texture, e) => {
                log::warn!("Recording failed, presenting a blank frame instead");
                match self.encode(cb, || self.record_blank_pass(cb, texture)) {
                    Ok(()) => (Some(e), vec![cb]),
                    Err(blank) => {
                        log::warn!("Blank frame failed too: {:#}", blank);
                        (Some(e), Vec::new())
                    }
                }
            }
        };

        unsafe {
            device
                .device
                .reset_fences(&[fence])
                .context("Failed to reset frame fence")?;

            let submit_info = PresentSync::submit_info(sync.as_ref(), &command_buffers);
            if let Err(e) = device
                .device
                .queue_submit(device.graphics_queue, &[submit_info], fence)
            {
                // Still consume the acquire semaphore and signal the fence and
                // the present semaphore, so the slot and the image stay usable
                let empty = PresentSync::submit_info(sync.as_ref(), &[]);
                if let Err(retry) =
                    device
                        .device
                        .queue_submit(device.graphics_queue, &[empty], fence)
                {
                    log::warn!("Empty submission failed too: {}", retry);
                }
                if failure.is_none() {
                    failure = Some(anyhow::Error::new(e).context("vkQueueSubmit failed"));
                }
            }
        }

        self.current_frame = (self.current_frame + 1) % self.frames.len();

        if let (Some(texture), Some(sync)) = (texture, &sync) {
            let target = self.target.as_ref().context("No window claimed")?;
            match target
                .swapchain
                .present(device.graphics_queue, texture.raw(), &sync.signal)
            {
                Ok(true) => log::debug!("Present reported a suboptimal swapchain"),
                Ok(false) => {}
                Err(e) if failure.is_none() => return Err(e),
                Err(e) => log::warn!("Present after a failed submit: {:#}", e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_shader(&mut self, shader: ShaderHandle) {
        let Some(entry) = self.shaders.remove(&shader) else {
            log::warn!("Release of unknown shader {:?}", shader);
            return;
        };
        // Modules are not referenced after pipeline creation
        unsafe { self.device.device.destroy_shader_module(entry.module, None) };
    }

    fn release_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) {
        let Some(entry) = self.pipelines.remove(&pipeline) else {
            log::warn!("Release of unknown pipeline {:?}", pipeline);
            return;
        };
        self.idle_before_release();
        unsafe {
            self.device.device.destroy_pipeline(entry.pipeline, None);
            self.device.device.destroy_pipeline_layout(entry.layout, None);
        }
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        let Some(entry) = self.buffers.remove(&buffer) else {
            log::warn!("Release of unknown buffer {:?}", buffer);
            return;
        };
        self.idle_before_release();
        self.destroy_buffer_entry(buffer, entry);
    }

    fn release_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        let Some(mut entry) = self.transfer_buffers.remove(&buffer) else {
            log::warn!("Release of unknown transfer buffer {:?}", buffer);
            return;
        };
        self.idle_before_release();
        entry.destroy(&self.device);
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanGpu {
    fn drop(&mut self) {
        let leftover = self.shaders.len()
            + self.pipelines.len()
            + self.buffers.len()
            + self.transfer_buffers.len();
        if leftover > 0 {
            log::info!("Releasing {} GPU resources still alive at shutdown", leftover);
        }

        let _ = self.device.wait_idle();

        let device = &self.device.device;
        unsafe {
            for (_, entry) in self.pipelines.drain() {
                device.destroy_pipeline(entry.pipeline, None);
                device.destroy_pipeline_layout(entry.layout, None);
            }
            for (_, entry) in self.shaders.drain() {
                device.destroy_shader_module(entry.module, None);
            }
            for (_, layout) in self.storage_layouts.drain() {
                device.destroy_descriptor_set_layout(layout, None);
            }
            // Frees every descriptor set with it
            self.storage_sets.get_mut().clear();
            device.destroy_descriptor_pool(self.descriptor_pool, None);
        }

        for (_, mut entry) in self.buffers.drain() {
            entry.buffer.destroy(&self.device);
        }
        for (_, mut buffer) in self.transfer_buffers.drain() {
            buffer.destroy(&self.device);
        }

        let device = &self.device.device;
        for frame in &self.frames {
            frame.destroy(device);
        }
        unsafe { device.destroy_command_pool(self.command_pool, None) };

        if let Some(target) = self.target.take() {
            target.destroy(device);
        }
    }
}
