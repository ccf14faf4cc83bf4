//! Common types shared across execution contexts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the size with width and height exchanged.
    pub const fn swapped(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    /// Returns true if either dimension is zero.
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Manhattan distance between two sizes, used to rank supported sizes.
    pub fn distance(self, other: Size) -> u64 {
        u64::from(self.width.abs_diff(other.width)) + u64::from(self.height.abs_diff(other.height))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.trim().parse().map_err(|e| format!("bad width {w:?}: {e}"))?;
        let height = h.trim().parse().map_err(|e| format!("bad height {h:?}: {e}"))?;
        Ok(Self { width, height })
    }
}

/// A frame rate range in device units (frames per 1000 seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRateRange {
    pub min: u32,
    pub max: u32,
}

impl FrameRateRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// A degenerate range containing exactly one rate.
    pub const fn exact(rate: u32) -> Self {
        Self {
            min: rate,
            max: rate,
        }
    }

    /// Returns true if `rate` lies within the inclusive range.
    pub const fn contains(self, rate: u32) -> bool {
        self.min <= rate && rate <= self.max
    }

    /// Midpoint of the range, used as the negotiation target.
    pub const fn midpoint(self) -> u32 {
        self.min + (self.max - self.min) / 2
    }

    /// Maximum rate in frames per second.
    pub fn max_fps(self) -> f32 {
        self.max as f32 / 1000.0
    }
}

/// Auto-focus behavior a capture device may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FocusMode {
    ContinuousVideo,
    ContinuousPicture,
    Auto,
    Macro,
    Infinity,
    Fixed,
    ExtendedDepthOfField,
}

/// Which way the capture device faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facing {
    Front,
    Back,
}

/// Rotation of the display relative to its natural orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DisplayRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl DisplayRotation {
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Rotation0 => 0,
            Self::Rotation90 => 90,
            Self::Rotation180 => 180,
            Self::Rotation270 => 270,
        }
    }

    /// Maps a degree value (any multiple of 90) to a rotation.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Rotation0),
            90 => Some(Self::Rotation90),
            180 => Some(Self::Rotation180),
            270 => Some(Self::Rotation270),
            _ => None,
        }
    }
}

/// How content is fitted into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleMode {
    /// Identity transform; content fills the view, aspect not preserved.
    #[default]
    StretchFit,
    /// Letterbox by shrinking the viewport rectangle.
    KeepAspectViewport,
    /// Scale geometry so the content is fully visible.
    KeepAspect,
    /// Scale geometry so the view is fully filled.
    CropCenter,
}

impl ScaleMode {
    pub const ALL: [ScaleMode; 4] = [
        Self::StretchFit,
        Self::KeepAspectViewport,
        Self::KeepAspect,
        Self::CropCenter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::StretchFit => "stretch-fit",
            Self::KeepAspectViewport => "keep-aspect-viewport",
            Self::KeepAspect => "keep-aspect",
            Self::CropCenter => "crop-center",
        }
    }
}

impl fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScaleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| format!("unknown scale mode {s:?}"))
    }
}

/// A request to open the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub target_width: u32,
    pub target_height: u32,
    /// Frame rate target; negotiation aims for its midpoint.
    pub target_frame_rate: FrameRateRange,
}

impl CaptureRequest {
    pub const fn new(target_width: u32, target_height: u32, target_fps_milli: u32) -> Self {
        Self {
            target_width,
            target_height,
            target_frame_rate: FrameRateRange::exact(target_fps_milli),
        }
    }

    pub const fn target_size(&self) -> Size {
        Size::new(self.target_width, self.target_height)
    }
}

/// The parameters a device actually accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub actual_width: u32,
    pub actual_height: u32,
    pub frame_rate: FrameRateRange,
    pub rotation_degrees: u32,
    /// Still-image size chosen alongside the preview size.
    pub picture_size: Size,
    pub focus_mode: Option<FocusMode>,
}

impl NegotiatedFormat {
    pub const fn actual_size(&self) -> Size {
        Size::new(self.actual_width, self.actual_height)
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Frame-available signals raised by the producer.
    pub frames_notified: u64,

    /// Frames pulled into the bridge texture and published.
    pub frames_materialized: u64,

    /// Signals that collapsed into an earlier pending update.
    pub frames_coalesced: u64,

    /// Frames composited onto the display surface.
    pub frames_rendered: u64,

    /// Observers removed after a failed notification.
    pub listener_removals: u64,

    /// Materialized frames per second since the last report.
    pub fps: f32,

    /// Seconds since the pipeline was created.
    pub uptime_seconds: u64,
}
