//! The visible surface the preview is composited onto.

use camfeed_gpu::{Mat4, TextureId};

use crate::viewport::Viewport;
use crate::RenderResult;

/// Name of a linked shader program.
pub type ProgramId = u32;

/// Display-side GPU state: viewport, clear color, shader programs.
///
/// Only used from the render thread.
pub trait DisplaySurface: Send {
    fn set_viewport(&mut self, viewport: Viewport);

    fn set_clear_color(&mut self, rgba: [f32; 4]);

    fn clear(&mut self);

    /// Build the program that samples an external-image texture.
    fn create_program(&mut self) -> RenderResult<ProgramId>;

    fn delete_program(&mut self, program: ProgramId);

    /// Draw the full-screen quad sampling `texture`.
    fn draw_quad(&mut self, program: ProgramId, texture: TextureId, mvp: &Mat4, tex_matrix: &Mat4);

    /// Swap buffers.
    fn present(&mut self);
}
