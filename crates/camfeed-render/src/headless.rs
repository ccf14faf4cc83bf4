//! A display surface that records what it was asked to do.

use std::collections::HashSet;
use std::sync::Arc;

use camfeed_gpu::{Mat4, TextureId};
use parking_lot::Mutex;
use tracing::warn;

use crate::display::{DisplaySurface, ProgramId};
use crate::viewport::Viewport;
use crate::RenderResult;

/// One call made on a [`RecordingDisplay`].
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayCall {
    Viewport(Viewport),
    ClearColor([f32; 4]),
    Clear,
    CreateProgram(ProgramId),
    DeleteProgram(ProgramId),
    Draw {
        program: ProgramId,
        texture: TextureId,
        mvp: Mat4,
        tex_matrix: Mat4,
    },
    Present,
}

/// Read side of a [`RecordingDisplay`], usable from any thread.
#[derive(Clone, Default)]
pub struct DisplayLog(Arc<Mutex<Vec<DisplayCall>>>);

impl DisplayLog {
    pub fn calls(&self) -> Vec<DisplayCall> {
        self.0.lock().clone()
    }

    pub fn presents(&self) -> usize {
        self.count(|call| matches!(call, DisplayCall::Present))
    }

    pub fn draws(&self) -> usize {
        self.count(|call| matches!(call, DisplayCall::Draw { .. }))
    }

    pub fn last_viewport(&self) -> Option<Viewport> {
        self.0.lock().iter().rev().find_map(|call| match call {
            DisplayCall::Viewport(viewport) => Some(*viewport),
            _ => None,
        })
    }

    /// Model transform of the most recent draw.
    pub fn last_draw_mvp(&self) -> Option<Mat4> {
        self.0.lock().iter().rev().find_map(|call| match call {
            DisplayCall::Draw { mvp, .. } => Some(*mvp),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn count(&self, predicate: impl Fn(&DisplayCall) -> bool) -> usize {
        self.0.lock().iter().filter(|call| predicate(call)).count()
    }

    fn push(&self, call: DisplayCall) {
        self.0.lock().push(call);
    }
}

/// A display surface that draws nothing and logs every call.
pub struct RecordingDisplay {
    log: DisplayLog,
    next_program: ProgramId,
    programs: HashSet<ProgramId>,
}

impl RecordingDisplay {
    pub fn new() -> (Self, DisplayLog) {
        let log = DisplayLog::default();
        let display = Self {
            log: log.clone(),
            next_program: 1,
            programs: HashSet::new(),
        };
        (display, log)
    }
}

impl DisplaySurface for RecordingDisplay {
    fn set_viewport(&mut self, viewport: Viewport) {
        self.log.push(DisplayCall::Viewport(viewport));
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.log.push(DisplayCall::ClearColor(rgba));
    }

    fn clear(&mut self) {
        self.log.push(DisplayCall::Clear);
    }

    fn create_program(&mut self) -> RenderResult<ProgramId> {
        let program = self.next_program;
        self.next_program += 1;
        self.programs.insert(program);
        self.log.push(DisplayCall::CreateProgram(program));
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if !self.programs.remove(&program) {
            warn!(program, "Deleting unknown program");
        }
        self.log.push(DisplayCall::DeleteProgram(program));
    }

    fn draw_quad(&mut self, program: ProgramId, texture: TextureId, mvp: &Mat4, tex_matrix: &Mat4) {
        self.log.push(DisplayCall::Draw {
            program,
            texture,
            mvp: *mvp,
            tex_matrix: *tex_matrix,
        });
    }

    fn present(&mut self) {
        self.log.push(DisplayCall::Present);
    }
}
