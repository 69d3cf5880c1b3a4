// Command recording
//
// A `CommandBuffer` is a plain list of commands. Passes borrow the buffer
// mutably, so only one pass can be open at a time, and they are closed
// either with `end()` or when dropped.

use super::{
    BufferHandle, GraphicsPipelineHandle, LoadOp, StoreOp, TextureHandle, TransferBufferHandle,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering a `width` x `height` target with the full depth range.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: width as f32,
            h: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTargetInfo {
    pub texture: TextureHandle,
    pub clear_color: [f32; 4],
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBufferLocation {
    pub transfer_buffer: TransferBufferHandle,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub buffer: BufferHandle,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawPrimitives {
    pub num_vertices: u32,
    pub num_instances: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUpload {
    pub source: TransferBufferLocation,
    pub destination: BufferRegion,
    pub cycle: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassCommand {
    SetViewport(Viewport),
    BindGraphicsPipeline(GraphicsPipelineHandle),
    BindVertexStorageBuffers {
        first_slot: u32,
        buffers: Vec<BufferHandle>,
    },
    Draw(DrawPrimitives),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyPass(Vec<BufferUpload>),
    RenderPass {
        color_target: ColorTargetInfo,
        commands: Vec<PassCommand>,
    },
}

#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    swapchain_texture: Option<TextureHandle>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_copy_pass(&mut self) -> CopyPass<'_> {
        CopyPass {
            cmd: self,
            uploads: Vec::new(),
        }
    }

    pub fn begin_render_pass(&mut self, color_target: ColorTargetInfo) -> RenderPass<'_> {
        RenderPass {
            cmd: self,
            color_target,
            commands: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The swapchain image this buffer will present, if one was acquired.
    pub fn swapchain_texture(&self) -> Option<TextureHandle> {
        self.swapchain_texture
    }

    pub(crate) fn attach_swapchain_texture(&mut self, texture: TextureHandle) {
        self.swapchain_texture = Some(texture);
    }

    /// Every draw recorded in any render pass, in order.
    #[cfg(test)]
    pub fn draw_calls(&self) -> impl Iterator<Item = &DrawPrimitives> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::RenderPass { commands, .. } => Some(commands),
                Command::CopyPass(_) => None,
            })
            .flatten()
            .filter_map(|command| match command {
                PassCommand::Draw(draw) => Some(draw),
                _ => None,
            })
    }
}

pub struct CopyPass<'a> {
    cmd: &'a mut CommandBuffer,
    uploads: Vec<BufferUpload>,
}

impl CopyPass<'_> {
    pub fn upload_to_buffer(
        &mut self,
        source: TransferBufferLocation,
        destination: BufferRegion,
        cycle: bool,
    ) {
        self.uploads.push(BufferUpload {
            source,
            destination,
            cycle,
        });
    }

    pub fn end(self) {}
}

impl Drop for CopyPass<'_> {
    fn drop(&mut self) {
        let uploads = std::mem::take(&mut self.uploads);
        self.cmd.commands.push(Command::CopyPass(uploads));
    }
}

pub struct RenderPass<'a> {
    cmd: &'a mut CommandBuffer,
    color_target: ColorTargetInfo,
    commands: Vec<PassCommand>,
}

impl RenderPass<'_> {
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(PassCommand::SetViewport(viewport));
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) {
        self.commands.push(PassCommand::BindGraphicsPipeline(pipeline));
    }

    /// Bind `buffers` as vertex-stage storage buffers starting at `first_slot`.
    pub fn bind_vertex_storage_buffers(&mut self, first_slot: u32, buffers: &[BufferHandle]) {
        self.commands.push(PassCommand::BindVertexStorageBuffers {
            first_slot,
            buffers: buffers.to_vec(),
        });
    }

    pub fn draw_primitives(
        &mut self,
        num_vertices: u32,
        num_instances: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.commands.push(PassCommand::Draw(DrawPrimitives {
            num_vertices,
            num_instances,
            first_vertex,
            first_instance,
        }));
    }

    pub fn end(self) {}
}

impl Drop for RenderPass<'_> {
    fn drop(&mut self) {
        let commands = std::mem::take(&mut self.commands);
        self.cmd.commands.push(Command::RenderPass {
            color_target: self.color_target,
            commands,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ColorTargetInfo {
        ColorTargetInfo {
            texture: TextureHandle(0),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        }
    }

    #[test]
    fn passes_are_recorded_in_order_when_ended() {
        let mut cmd = CommandBuffer::new();

        let mut copy = cmd.begin_copy_pass();
        copy.upload_to_buffer(
            TransferBufferLocation {
                transfer_buffer: TransferBufferHandle(1),
                offset: 0,
            },
            BufferRegion {
                buffer: BufferHandle(2),
                offset: 0,
                size: 48,
            },
            false,
        );
        copy.end();

        let mut pass = cmd.begin_render_pass(target());
        pass.bind_graphics_pipeline(GraphicsPipelineHandle(3));
        pass.draw_primitives(3, 1, 0, 0);
        pass.end();

        assert_eq!(cmd.commands().len(), 2);
        assert!(matches!(&cmd.commands()[0], Command::CopyPass(uploads) if uploads.len() == 1));
        match &cmd.commands()[1] {
            Command::RenderPass {
                color_target,
                commands,
            } => {
                assert_eq!(*color_target, target());
                assert_eq!(commands[0], PassCommand::BindGraphicsPipeline(GraphicsPipelineHandle(3)));
            }
            other => panic!("expected a render pass, got {:?}", other),
        }
    }

    #[test]
    fn dropping_a_pass_closes_it() {
        let mut cmd = CommandBuffer::new();
        {
            let mut pass = cmd.begin_render_pass(target());
            pass.draw_primitives(3, 1, 0, 0);
        }
        assert_eq!(cmd.draw_calls().count(), 1);
    }

    #[test]
    fn draw_calls_span_every_render_pass() {
        let mut cmd = CommandBuffer::new();
        for first_vertex in 0..2 {
            let mut pass = cmd.begin_render_pass(target());
            pass.set_viewport(Viewport::full(1024, 768));
            pass.draw_primitives(3, 1, first_vertex, 0);
            pass.end();
        }
        cmd.begin_copy_pass().end();

        let firsts: Vec<u32> = cmd.draw_calls().map(|d| d.first_vertex).collect();
        assert_eq!(firsts, vec![0, 1]);
    }

    #[test]
    fn full_viewport_spans_target_and_depth_range() {
        let vp = Viewport::full(1024, 768);
        assert_eq!((vp.x, vp.y, vp.w, vp.h), (0.0, 0.0, 1024.0, 768.0));
        assert_eq!((vp.min_depth, vp.max_depth), (0.0, 1.0));
    }

    #[test]
    fn swapchain_texture_starts_unset() {
        let mut cmd = CommandBuffer::new();
        assert_eq!(cmd.swapchain_texture(), None);
        cmd.attach_swapchain_texture(TextureHandle(1));
        assert_eq!(cmd.swapchain_texture(), Some(TextureHandle(1)));
    }
}
