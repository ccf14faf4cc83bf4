//! Viewport and model transform for each scale policy.

use camfeed_gpu::Mat4;
use camfeed_ipc::{ScaleMode, Size};

/// A GPU viewport rectangle in pixels, origin at the bottom left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// The whole of `view`.
    pub const fn full(view: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            width: view.width,
            height: view.height,
        }
    }
}

/// Result of a viewport recomputation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportLayout {
    pub viewport: Viewport,
    /// Model transform applied to the full-screen quad.
    pub mvp: Mat4,
}

/// Inputs to a viewport recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportState {
    pub view: Size,
    pub content: Size,
    pub mode: ScaleMode,
}

impl ViewportState {
    pub const fn new(view: Size, content: Size, mode: ScaleMode) -> Self {
        Self {
            view,
            content,
            mode,
        }
    }

    /// Compute the viewport and model transform.
    ///
    /// A pure function of the three inputs. Letterboxing policies either
    /// shrink the viewport (keep-aspect-viewport) or scale the quad
    /// (keep-aspect, crop-center). An empty view or content yields the full
    /// viewport and the identity transform.
    pub fn compute(&self) -> ViewportLayout {
        let full = ViewportLayout {
            viewport: Viewport::full(self.view),
            mvp: Mat4::IDENTITY,
        };
        if self.view.is_empty() || self.content.is_empty() {
            return full;
        }

        let view_width = f64::from(self.view.width);
        let view_height = f64::from(self.view.height);
        let content_width = f64::from(self.content.width);
        let content_height = f64::from(self.content.height);

        match self.mode {
            ScaleMode::StretchFit => full,
            ScaleMode::KeepAspectViewport => {
                let content_aspect = content_width / content_height;
                let viewport = if view_width / view_height > content_aspect {
                    // View is wider than the content: pillarbox.
                    let width = (content_aspect * view_height) as u32;
                    Viewport {
                        x: (self.view.width.saturating_sub(width) / 2) as i32,
                        y: 0,
                        width,
                        height: self.view.height,
                    }
                } else {
                    let height = (view_width / content_aspect) as u32;
                    Viewport {
                        x: 0,
                        y: (self.view.height.saturating_sub(height) / 2) as i32,
                        width: self.view.width,
                        height,
                    }
                };
                ViewportLayout {
                    viewport,
                    mvp: Mat4::IDENTITY,
                }
            }
            ScaleMode::KeepAspect | ScaleMode::CropCenter => {
                let scale_x = view_width / content_width;
                let scale_y = view_height / content_height;
                let scale = if self.mode == ScaleMode::CropCenter {
                    scale_x.max(scale_y)
                } else {
                    scale_x.min(scale_y)
                };
                let width = scale * content_width;
                let height = scale * content_height;
                ViewportLayout {
                    viewport: full.viewport,
                    mvp: Mat4::from_scale(
                        (width / view_width) as f32,
                        (height / view_height) as f32,
                        1.0,
                    ),
                }
            }
        }
    }
}
