// =============================================================================
// TRIANGLE - Bootstrap and frame loop
// =============================================================================
//
// Bootstrap runs once: window, device, shaders, pipeline and (when the vertex
// shader reads a storage buffer) a one-off upload of the three vertices.
// Every frame after that is one render pass with a single 3-vertex draw.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::app::{AppCallbacks, AppEvent, AppResult, Platform};
use crate::backend::{
    BufferCreateInfo, BufferHandle, BufferRegion, BufferUsage, ColorTargetDescription,
    ColorTargetInfo, DeviceDesc, Gpu, GraphicsPipelineCreateInfo, GraphicsPipelineHandle,
    LoadOp, PrimitiveType, RasterizerState, ShaderCreateInfo, ShaderFormat, ShaderHandle,
    ShaderStage, StoreOp, TextureHandle, TransferBufferCreateInfo, TransferBufferHandle,
    TransferBufferLocation, TransferBufferUsage, Viewport, WindowDesc,
};
use crate::backend::command::CommandBuffer;
use crate::config::{Config, VertexSource};
use crate::files::read_file;

/// One vertex as the vertex shader reads it (std430, 16-byte stride).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub padding: f32,
}

impl Vertex {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Vec3::new(x, y, z),
            padding: 0.0,
        }
    }
}

pub const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex::new(0.0, -0.5, 0.0),
    Vertex::new(0.5, 0.5, 0.0),
    Vertex::new(-0.5, 0.5, 0.0),
];

/// Staging space for the upload. Far more than the vertices need.
pub const TRANSFER_BUFFER_SIZE: u32 = 1024 * 1024;

pub const VERTEX_BUFFER_NAME: &str = "The Vertex Buffer";

const SHADER_ENTRYPOINT: &str = "main";

/// Everything the frame loop needs. Every handle refers to a live resource.
pub struct RenderState<G: Gpu> {
    pub gpu: G,
    pub window: G::Window,
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: ShaderHandle,
    pub pipeline: GraphicsPipelineHandle,
    /// `None` when the vertex shader carries its own positions.
    pub vertex_buffer: Option<BufferHandle>,
    pub viewport: Viewport,
    pub clear_color: [f32; 4],
}

impl<G: Gpu> RenderState<G> {
    pub fn bootstrap<P>(platform: &mut P, config: &Config) -> Result<Self>
    where
        P: Platform<Gpu = G>,
    {
        let window = platform
            .create_window(&WindowDesc {
                title: config.window.title.clone(),
                width: config.window.width,
                height: config.window.height,
                resizable: false,
            })
            .context("Couldn't create window")?;

        let mut gpu = platform
            .create_gpu_device(&DeviceDesc {
                shader_formats: vec![ShaderFormat::Spirv],
                debug_mode: config.debug.validation_layers,
                present_mode: config.get_present_mode(),
                frames_in_flight: config.graphics.max_frames_in_flight,
            })
            .context("Couldn't create GPU device")?;

        gpu.claim_window(&window).context("Couldn't claim window")?;

        let storage_buffers = match config.graphics.vertex_source {
            VertexSource::StorageBuffer => 1,
            VertexSource::Shader => 0,
        };

        let vertex_code = read_file(&config.shaders.vertex);
        let fragment_code = read_file(&config.shaders.fragment);
        if vertex_code.is_empty() {
            anyhow::bail!("No vertex shader code in {:?}", config.shaders.vertex);
        }
        if fragment_code.is_empty() {
            anyhow::bail!("No fragment shader code in {:?}", config.shaders.fragment);
        }

        let vertex_shader = gpu
            .create_shader(&ShaderCreateInfo {
                code: &vertex_code,
                entrypoint: SHADER_ENTRYPOINT,
                format: ShaderFormat::Spirv,
                stage: ShaderStage::Vertex,
                num_samplers: 0,
                num_storage_textures: 0,
                num_storage_buffers: storage_buffers,
                num_uniform_buffers: 0,
            })
            .context("Couldn't create vertex shader")?;

        let fragment_shader = gpu
            .create_shader(&ShaderCreateInfo {
                code: &fragment_code,
                entrypoint: SHADER_ENTRYPOINT,
                format: ShaderFormat::Spirv,
                stage: ShaderStage::Fragment,
                num_samplers: 0,
                num_storage_textures: 0,
                num_storage_buffers: 0,
                num_uniform_buffers: 0,
            })
            .context("Couldn't create fragment shader")?;

        let format = gpu.swapchain_texture_format(&window)?;
        let pipeline = gpu
            .create_graphics_pipeline(&GraphicsPipelineCreateInfo {
                vertex_shader,
                fragment_shader,
                primitive_type: PrimitiveType::TriangleList,
                rasterizer_state: RasterizerState::default(),
                color_target: ColorTargetDescription { format },
            })
            .context("Couldn't create graphics pipeline")?;

        let vertex_buffer = match config.graphics.vertex_source {
            VertexSource::StorageBuffer => Some(
                upload_vertices(&mut gpu, &TRIANGLE_VERTICES)
                    .context("Couldn't upload vertex data")?,
            ),
            VertexSource::Shader => None,
        };

        log::info!(
            "Triangle ready ({:?} vertices, {}x{})",
            config.graphics.vertex_source,
            config.window.width,
            config.window.height
        );

        Ok(Self {
            gpu,
            window,
            vertex_shader,
            fragment_shader,
            pipeline,
            vertex_buffer,
            viewport: Viewport::full(config.window.width, config.window.height),
            clear_color: config.graphics.clear_color,
        })
    }

    /// Draw one frame. A missing swapchain image only skips the render
    /// pass; the command buffer is submitted either way.
    pub fn frame(&mut self) -> Result<()> {
        let mut cmd = self
            .gpu
            .acquire_command_buffer()
            .context("Failed to acquire command buffer")?;

        match self.gpu.wait_and_acquire_swapchain_texture(&mut cmd, &self.window) {
            Ok(Some(texture)) => self.record_triangle(&mut cmd, texture),
            Ok(None) => log::trace!("No swapchain texture this frame"),
            Err(e) => log::error!("Failed to acquire swapchain texture: {:#}", e),
        }

        self.gpu.submit(cmd).context("Failed to submit frame")
    }

    fn record_triangle(&self, cmd: &mut CommandBuffer, texture: TextureHandle) {
        let mut pass = cmd.begin_render_pass(ColorTargetInfo {
            texture,
            clear_color: self.clear_color,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        });
        pass.set_viewport(self.viewport);
        pass.bind_graphics_pipeline(self.pipeline);
        if let Some(buffer) = self.vertex_buffer {
            pass.bind_vertex_storage_buffers(0, &[buffer]);
        }
        pass.draw_primitives(TRIANGLE_VERTICES.len() as u32, 1, 0, 0);
        pass.end();
    }

    pub fn release(mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            log::warn!("GPU did not go idle before release: {:#}", e);
        }
        self.gpu.release_graphics_pipeline(self.pipeline);
        self.gpu.release_shader(self.vertex_shader);
        self.gpu.release_shader(self.fragment_shader);
        if let Some(buffer) = self.vertex_buffer {
            self.gpu.release_buffer(buffer);
        }
    }
}

/// Copy `vertices` into a new storage buffer through a transfer buffer.
fn upload_vertices<G: Gpu>(gpu: &mut G, vertices: &[Vertex]) -> Result<BufferHandle> {
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let size = bytes.len() as u32;

    let transfer = gpu.create_transfer_buffer(&TransferBufferCreateInfo {
        usage: TransferBufferUsage::Upload,
        size: TRANSFER_BUFFER_SIZE,
    })?;

    let result = copy_through(gpu, transfer, bytes, size);
    gpu.release_transfer_buffer(transfer);
    result
}

fn copy_through<G: Gpu>(
    gpu: &mut G,
    transfer: TransferBufferHandle,
    bytes: &[u8],
    size: u32,
) -> Result<BufferHandle> {
    gpu.write_transfer_buffer(transfer, 0, bytes)?;

    let buffer = gpu.create_buffer(&BufferCreateInfo {
        usage: BufferUsage::GraphicsStorageRead,
        size,
    })?;
    gpu.set_buffer_name(buffer, VERTEX_BUFFER_NAME);

    let mut cmd = gpu.acquire_command_buffer()?;
    let mut copy = cmd.begin_copy_pass();
    copy.upload_to_buffer(
        TransferBufferLocation {
            transfer_buffer: transfer,
            offset: 0,
        },
        BufferRegion {
            buffer,
            offset: 0,
            size,
        },
        false,
    );
    copy.end();

    if let Err(e) = gpu.submit(cmd) {
        gpu.release_buffer(buffer);
        return Err(e);
    }
    Ok(buffer)
}

pub struct TriangleApp<G: Gpu> {
    state: RenderState<G>,
    frames: u64,
}

impl<G: Gpu> TriangleApp<G> {
    #[cfg(test)]
    pub fn state(&self) -> &RenderState<G> {
        &self.state
    }
}

impl<G: Gpu> AppCallbacks for TriangleApp<G> {
    type Gpu = G;

    fn init<P>(platform: &mut P, config: &Config) -> Result<Self>
    where
        P: Platform<Gpu = G>,
    {
        Ok(Self {
            state: RenderState::bootstrap(platform, config)?,
            frames: 0,
        })
    }

    fn event(&mut self, event: &AppEvent) -> AppResult {
        match event {
            AppEvent::Quit => AppResult::Success,
            AppEvent::Resized { width, height } => {
                log::debug!("Ignoring resize to {}x{}", width, height);
                AppResult::Continue
            }
        }
    }

    fn iterate(&mut self) -> AppResult {
        if let Err(e) = self.state.frame() {
            log::error!("Frame {} failed: {:#}", self.frames, e);
        }
        self.frames += 1;
        AppResult::Continue
    }

    fn quit(self, result: AppResult) {
        log::info!("Quitting after {} frames: {:?}", self.frames, result);
        self.state.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppLoop;
    use crate::backend::command::{Command, PassCommand};
    use crate::testing::{RecordingGpu, RecordingPlatform};
    use std::path::PathBuf;

    fn shader_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "hello-triangle-{}-{}",
            tag,
            std::process::id()
        ))
    }

    /// Shader files with just enough bytes to pass as non-empty. The
    /// directory is removed when this is dropped.
    struct ShaderFiles {
        dir: PathBuf,
    }

    impl ShaderFiles {
        fn new(tag: &str) -> Self {
            let dir = shader_dir(tag);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("triangle.vert.spv"), 0x0723_0203u32.to_le_bytes()).unwrap();
            std::fs::write(
                dir.join("triangle.frag.spv"),
                [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00],
            )
            .unwrap();
            Self { dir }
        }
    }

    impl Drop for ShaderFiles {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn config(tag: &str, source: VertexSource) -> (Config, ShaderFiles) {
        let files = ShaderFiles::new(tag);
        let mut config = Config::default();
        config.shaders.vertex = files.dir.join("triangle.vert.spv");
        config.shaders.fragment = files.dir.join("triangle.frag.spv");
        config.graphics.vertex_source = source;
        config.debug.validation_layers = false;
        (config, files)
    }

    /// Bootstrapped app. The shader files are only read during init, so they
    /// are gone by the time this returns.
    fn started(
        tag: &str,
        source: VertexSource,
    ) -> (AppLoop<TriangleApp<RecordingGpu>>, RecordingPlatform) {
        let (config, _files) = config(tag, source);
        let mut platform = RecordingPlatform::new();
        let mut app_loop = AppLoop::new(config);
        assert_eq!(app_loop.init(&mut platform), AppResult::Continue);
        (app_loop, platform)
    }

    #[test]
    fn vertex_layout_matches_std430() {
        assert_eq!(std::mem::size_of::<Vertex>(), 16);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&TRIANGLE_VERTICES).len(), 48);
    }

    #[test]
    fn bootstrap_builds_everything() {
        let (app_loop, platform) = started("full", VertexSource::StorageBuffer);
        let recording = platform.recording();

        assert_eq!(
            recording.windows,
            vec![WindowDesc {
                title: "Hello Triangle".to_string(),
                width: 1024,
                height: 768,
                resizable: false,
            }]
        );
        assert_eq!(recording.devices.len(), 1);
        assert_eq!(recording.devices[0].shader_formats, vec![ShaderFormat::Spirv]);
        assert!(recording.claimed.is_some());

        let state = app_loop.app().unwrap().state();
        let vertex = &recording.shaders[&state.vertex_shader];
        assert_eq!(vertex.stage, ShaderStage::Vertex);
        assert_eq!(vertex.entrypoint, "main");
        assert_eq!(vertex.format, ShaderFormat::Spirv);
        assert_eq!(vertex.num_storage_buffers, 1);
        assert_eq!(vertex.code.len(), 4);
        let fragment = &recording.shaders[&state.fragment_shader];
        assert_eq!(fragment.stage, ShaderStage::Fragment);
        assert_eq!(
            fragment.num_samplers
                + fragment.num_storage_textures
                + fragment.num_storage_buffers
                + fragment.num_uniform_buffers,
            0
        );

        let pipeline = &recording.pipelines[&state.pipeline];
        assert_eq!(pipeline.primitive_type, PrimitiveType::TriangleList);
        assert_eq!(pipeline.rasterizer_state, RasterizerState::default());
        assert_eq!(pipeline.vertex_shader, state.vertex_shader);
        assert_eq!(pipeline.fragment_shader, state.fragment_shader);

        let buffer = &recording.buffers[&state.vertex_buffer.unwrap()];
        assert_eq!(buffer.usage, BufferUsage::GraphicsStorageRead);
        assert_eq!(buffer.bytes.len(), 48);
        assert_eq!(buffer.name.as_deref(), Some(VERTEX_BUFFER_NAME));

        // The staging buffer is gone once the upload is submitted
        assert!(recording.transfer_buffers.is_empty());
        assert_eq!(recording.submissions.len(), 1);
    }

    #[test]
    fn uploaded_bytes_are_the_triangle() {
        let (app_loop, platform) = started("upload", VertexSource::StorageBuffer);
        let recording = platform.recording();
        let state = app_loop.app().unwrap().state();

        let bytes = &recording.buffers[&state.vertex_buffer.unwrap()].bytes;
        let vertices: &[Vertex] = bytemuck::cast_slice(bytes);
        assert_eq!(vertices, &TRIANGLE_VERTICES);
        assert_eq!(vertices[0].position, Vec3::new(0.0, -0.5, 0.0));
        assert!(vertices.iter().all(|v| v.padding == 0.0));

        match &recording.submissions[0].commands()[0] {
            Command::CopyPass(uploads) => {
                assert_eq!(uploads.len(), 1);
                assert_eq!(uploads[0].source.offset, 0);
                assert_eq!(uploads[0].destination.offset, 0);
                assert_eq!(uploads[0].destination.size, 48);
                assert!(!uploads[0].cycle);
            }
            other => panic!("expected the upload, got {:?}", other),
        }
    }

    #[test]
    fn embedded_variant_has_no_buffer() {
        let (mut app_loop, platform) = started("embedded", VertexSource::Shader);
        app_loop.iterate();

        let recording = platform.recording();
        let state = app_loop.app().unwrap().state();
        assert!(state.vertex_buffer.is_none());
        assert_eq!(recording.shaders[&state.vertex_shader].num_storage_buffers, 0);
        assert!(recording.buffers.is_empty());

        // No upload, just the one frame
        assert_eq!(recording.submissions.len(), 1);
        match &recording.submissions[0].commands()[0] {
            Command::RenderPass { commands, .. } => assert!(!commands
                .iter()
                .any(|c| matches!(c, PassCommand::BindVertexStorageBuffers { .. }))),
            other => panic!("expected a render pass, got {:?}", other),
        }
    }

    #[test]
    fn missing_shader_fails_bootstrap() {
        let (mut config, _files) = config("missing", VertexSource::StorageBuffer);
        config.shaders.vertex = PathBuf::from("no/such/triangle.vert.spv");
        assert!(read_file(&config.shaders.vertex).is_empty());

        let mut platform = RecordingPlatform::new();
        let mut app_loop: AppLoop<TriangleApp<RecordingGpu>> = AppLoop::new(config);
        assert_eq!(app_loop.init(&mut platform), AppResult::Failure);
        assert!(platform.recording().shaders.is_empty());
    }

    #[test]
    fn environment_failures_end_with_failure() {
        let cases: [fn(&mut crate::testing::Faults); 3] = [
            |f| f.create_window = true,
            |f| f.create_device = true,
            |f| f.claim_window = true,
        ];
        for fault in cases {
            let mut platform = RecordingPlatform::new();
            fault(&mut platform.recording().faults);
            let (config, _files) = config("env", VertexSource::StorageBuffer);
            let mut app_loop: AppLoop<TriangleApp<RecordingGpu>> = AppLoop::new(config);

            assert_eq!(app_loop.init(&mut platform), AppResult::Failure);
            assert_eq!(app_loop.iterate(), AppResult::Failure);
            assert!(platform.recording().submissions.is_empty());
        }
    }

    #[test]
    fn creation_failures_end_with_failure() {
        let cases: [fn(&mut crate::testing::Faults); 3] = [
            |f| f.create_shader = true,
            |f| f.create_pipeline = true,
            |f| f.create_buffer = true,
        ];
        for fault in cases {
            let mut platform = RecordingPlatform::new();
            fault(&mut platform.recording().faults);
            let (config, _files) = config("create", VertexSource::StorageBuffer);
            let mut app_loop: AppLoop<TriangleApp<RecordingGpu>> = AppLoop::new(config);
            assert_eq!(app_loop.init(&mut platform), AppResult::Failure);
        }
    }

    #[test]
    fn each_iteration_draws_one_triangle() {
        let (mut app_loop, platform) = started("frames", VertexSource::StorageBuffer);
        for _ in 0..5 {
            assert_eq!(app_loop.iterate(), AppResult::Continue);
        }

        let recording = platform.recording();
        // One upload plus one submission per frame
        assert_eq!(recording.submissions.len(), 6);
        assert_eq!(recording.frames().count(), 5);

        let vertex_buffer = app_loop.app().unwrap().state().vertex_buffer.unwrap();
        for cmd in recording.frames() {
            let draws: Vec<_> = cmd.draw_calls().collect();
            assert_eq!(draws.len(), 1);
            let draw = draws[0];
            assert_eq!(
                (draw.num_vertices, draw.num_instances, draw.first_vertex, draw.first_instance),
                (3, 1, 0, 0)
            );

            match &cmd.commands()[0] {
                Command::RenderPass {
                    color_target,
                    commands,
                } => {
                    assert_eq!(color_target.clear_color, [0.0, 0.0, 0.0, 1.0]);
                    assert_eq!(color_target.load_op, LoadOp::Clear);
                    assert_eq!(color_target.store_op, StoreOp::Store);
                    assert_eq!(Some(color_target.texture), cmd.swapchain_texture());
                    assert_eq!(
                        commands[0],
                        PassCommand::SetViewport(Viewport {
                            x: 0.0,
                            y: 0.0,
                            w: 1024.0,
                            h: 768.0,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        })
                    );
                    assert_eq!(
                        commands[2],
                        PassCommand::BindVertexStorageBuffers {
                            first_slot: 0,
                            buffers: vec![vertex_buffer],
                        }
                    );
                }
                other => panic!("expected a render pass, got {:?}", other),
            }
        }
    }

    #[test]
    fn failed_acquisition_still_submits() {
        let (mut app_loop, platform) = started("acquire", VertexSource::StorageBuffer);
        platform.recording().faults.acquire_texture = true;

        assert_eq!(app_loop.iterate(), AppResult::Continue);
        assert_eq!(app_loop.iterate(), AppResult::Continue);

        let recording = platform.recording();
        assert_eq!(recording.submissions.len(), 3);
        assert_eq!(recording.frames().count(), 0);
        assert!(recording.submissions[1].commands().is_empty());
    }

    #[test]
    fn no_texture_skips_the_pass() {
        let (mut app_loop, platform) = started("minimized", VertexSource::StorageBuffer);
        platform.recording().faults.no_texture = true;
        app_loop.iterate();
        platform.recording().faults.no_texture = false;
        app_loop.iterate();

        let recording = platform.recording();
        assert_eq!(recording.submissions.len(), 3);
        assert_eq!(recording.frames().count(), 1);
    }

    #[test]
    fn frame_errors_keep_the_loop_running() {
        let (mut app_loop, platform) = started("submit", VertexSource::StorageBuffer);
        platform.recording().faults.submit = true;
        assert_eq!(app_loop.iterate(), AppResult::Continue);
        platform.recording().faults.acquire_command_buffer = true;
        assert_eq!(app_loop.iterate(), AppResult::Continue);

        let mut recording = platform.recording();
        recording.faults = Default::default();
        drop(recording);
        assert_eq!(app_loop.iterate(), AppResult::Continue);
        assert_eq!(platform.recording().frames().count(), 1);
    }

    #[test]
    fn quit_releases_everything() {
        let (mut app_loop, platform) = started("quit", VertexSource::StorageBuffer);
        app_loop.iterate();
        app_loop.iterate();

        assert_eq!(app_loop.handle_event(&AppEvent::Quit), AppResult::Success);
        assert_eq!(app_loop.iterate(), AppResult::Success);

        let recording = platform.recording();
        assert!(recording.shaders.is_empty());
        assert!(recording.pipelines.is_empty());
        assert!(recording.buffers.is_empty());
        assert!(recording.idle_waits >= 1);
        // Nothing drawn after the quit
        assert_eq!(recording.frames().count(), 2);
    }

    #[test]
    fn quit_before_the_first_frame() {
        let (mut app_loop, platform) = started("early-quit", VertexSource::StorageBuffer);

        assert_eq!(app_loop.handle_event(&AppEvent::Quit), AppResult::Success);
        assert_eq!(app_loop.iterate(), AppResult::Success);

        let recording = platform.recording();
        assert!(recording.shaders.is_empty());
        assert!(recording.pipelines.is_empty());
        assert!(recording.buffers.is_empty());
        assert!(recording.transfer_buffers.is_empty());
        // Only the vertex upload ever reached the GPU
        assert_eq!(recording.submissions.len(), 1);
        assert_eq!(recording.frames().count(), 0);
    }

    #[test]
    fn shader_files_do_not_outlive_the_test() {
        let (config, files) = config("cleanup", VertexSource::StorageBuffer);
        assert!(config.shaders.vertex.exists());
        drop(files);
        assert!(!shader_dir("cleanup").exists());

        let (_app_loop, _platform) = started("cleanup-started", VertexSource::Shader);
        assert!(!shader_dir("cleanup-started").exists());
    }

    #[test]
    fn resize_is_ignored() {
        let (mut app_loop, _platform) = started("resize", VertexSource::Shader);
        let result = app_loop.handle_event(&AppEvent::Resized {
            width: 640,
            height: 480,
        });
        assert_eq!(result, AppResult::Continue);
        assert_eq!(app_loop.app().unwrap().state().viewport, Viewport::full(1024, 768));
    }
}
