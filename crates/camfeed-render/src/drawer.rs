//! Textured full-screen quad.

use camfeed_gpu::{Mat4, TextureId};
use tracing::trace;

use crate::display::{DisplaySurface, ProgramId};
use crate::RenderResult;

/// Draws an external-image texture as a quad under a model transform.
#[derive(Debug)]
pub struct QuadDrawer {
    program: ProgramId,
    mvp: Mat4,
}

impl QuadDrawer {
    pub fn new(display: &mut dyn DisplaySurface) -> RenderResult<Self> {
        let program = display.create_program()?;
        trace!(program, "Quad program created");
        Ok(Self {
            program,
            mvp: Mat4::IDENTITY,
        })
    }

    pub fn set_mvp(&mut self, mvp: Mat4) {
        self.mvp = mvp;
    }

    pub fn mvp(&self) -> &Mat4 {
        &self.mvp
    }

    pub fn draw(&self, display: &mut dyn DisplaySurface, texture: TextureId, tex_matrix: &Mat4) {
        display.draw_quad(self.program, texture, &self.mvp, tex_matrix);
    }

    pub fn release(self, display: &mut dyn DisplaySurface) {
        display.delete_program(self.program);
    }
}
