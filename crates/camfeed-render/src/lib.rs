//! Demand-driven preview rendering.
//!
//! The render thread never redraws on its own. A draw is requested when a
//! new frame reaches the preview surface, and each draw latches at most one
//! image into the preview texture before compositing it under the viewport
//! policy of the current [`camfeed_ipc::ScaleMode`].

mod coordinator;
mod display;
mod drawer;
mod error;
pub mod headless;
mod render_thread;
mod viewport;

pub use coordinator::{RenderCoordinator, RenderHost, RenderStatus};
pub use display::{DisplaySurface, ProgramId};
pub use drawer::QuadDrawer;
pub use error::RenderError;
pub use headless::RecordingDisplay;
pub use render_thread::{RenderRequester, RenderThread, RENDER_THREAD_NAME};
pub use viewport::{Viewport, ViewportLayout, ViewportState};

/// Result type for render operations.
pub type RenderResult<T> = Result<T, RenderError>;
