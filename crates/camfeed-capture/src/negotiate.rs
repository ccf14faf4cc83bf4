//! Device parameter negotiation.
//!
//! Pure functions: given what a device supports and what the caller asked
//! for, pick the parameters to apply.

use camfeed_ipc::{CaptureRequest, DisplayRotation, Facing, FocusMode, FrameRateRange, Size};
use tracing::debug;

use crate::device::{DeviceCapabilities, DeviceInfo, DeviceParameters};
use crate::error::CaptureError;
use crate::CaptureResult;

/// Focus modes in order of preference.
const FOCUS_PREFERENCE: [FocusMode; 2] = [FocusMode::ContinuousVideo, FocusMode::Auto];

/// Parameters to apply plus the display orientation that goes with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPlan {
    pub params: DeviceParameters,
    pub rotation_degrees: u32,
}

/// Continuous-video focus if available, else auto, else none.
pub fn choose_focus_mode(supported: &[FocusMode]) -> Option<FocusMode> {
    FOCUS_PREFERENCE
        .into_iter()
        .find(|mode| supported.contains(mode))
}

/// Pick a range containing `target`, scanning from the end of the list.
///
/// If no range contains the target, the last range in the list is used.
pub fn choose_frame_rate(ranges: &[FrameRateRange], target: u32) -> Option<FrameRateRange> {
    for (index, range) in ranges.iter().enumerate().rev() {
        debug!(index, min = range.min, max = range.max, "Supported frame rate range");
        if range.contains(target) {
            return Some(*range);
        }
    }
    ranges.last().copied()
}

/// The supported size minimizing `|Δwidth| + |Δheight|`; the first one wins ties.
pub fn closest_size(supported: &[Size], requested: Size) -> Option<Size> {
    supported
        .iter()
        .copied()
        .min_by_key(|size| size.distance(requested))
}

/// Rotation to apply to the device output so it appears upright.
///
/// Front-facing output is mirrored, so its rotation is reversed.
pub fn display_orientation(info: DeviceInfo, display: DisplayRotation) -> u32 {
    let orientation = info.orientation % 360;
    let degrees = display.degrees();
    match info.facing {
        Facing::Front => (360 - (orientation + degrees) % 360) % 360,
        Facing::Back => (orientation + 360 - degrees) % 360,
    }
}

/// Choose every parameter for `request` against `caps`.
pub fn plan(
    caps: &DeviceCapabilities,
    request: &CaptureRequest,
    info: DeviceInfo,
    display: DisplayRotation,
) -> CaptureResult<NegotiationPlan> {
    let focus_mode = choose_focus_mode(&caps.focus_modes);
    if focus_mode.is_none() {
        debug!("Device does not support autofocus");
    }

    let frame_rate = choose_frame_rate(&caps.frame_rate_ranges, request.target_frame_rate.midpoint())
        .ok_or(CaptureError::NoFrameRateRange)?;

    let target = request.target_size();
    let preview_size =
        closest_size(&caps.preview_sizes, target).ok_or(CaptureError::NoSupportedSize("preview"))?;
    // Some devices crop preview to the still-image aspect ratio, so pick a
    // still size close to the request as well.
    let picture_size =
        closest_size(&caps.picture_sizes, target).ok_or(CaptureError::NoSupportedSize("picture"))?;

    Ok(NegotiationPlan {
        params: DeviceParameters {
            focus_mode,
            frame_rate,
            preview_size,
            picture_size,
            recording_hint: true,
        },
        rotation_degrees: display_orientation(info, display),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn back(orientation: u32) -> DeviceInfo {
        DeviceInfo {
            facing: Facing::Back,
            orientation,
        }
    }

    fn front(orientation: u32) -> DeviceInfo {
        DeviceInfo {
            facing: Facing::Front,
            orientation,
        }
    }

    #[test]
    fn test_exact_size_match_wins() {
        let sizes = [Size::new(640, 480), Size::new(1280, 720), Size::new(1920, 1080)];
        assert_eq!(closest_size(&sizes, Size::new(1280, 720)), Some(Size::new(1280, 720)));
    }

    #[test]
    fn test_closest_size_by_manhattan_distance() {
        // 800x600 is 600 away, 1024x768 is 304 away.
        let sizes = [Size::new(800, 600), Size::new(1024, 768)];
        assert_eq!(closest_size(&sizes, Size::new(1280, 720)), Some(Size::new(1024, 768)));
    }

    #[test]
    fn test_closest_size_tie_resolves_to_first() {
        let sizes = [Size::new(1270, 720), Size::new(1280, 710), Size::new(1290, 720)];
        assert_eq!(closest_size(&sizes, Size::new(1280, 720)), Some(Size::new(1270, 720)));
        assert_eq!(closest_size(&[], Size::new(1280, 720)), None);
    }

    #[test]
    fn test_closest_size_is_minimal_for_every_request() {
        let sizes = [
            Size::new(176, 144),
            Size::new(320, 240),
            Size::new(640, 480),
            Size::new(1280, 720),
            Size::new(1920, 1080),
        ];
        for w in (0..2000).step_by(97) {
            for h in (0..1200).step_by(89) {
                let requested = Size::new(w, h);
                let chosen = closest_size(&sizes, requested).unwrap();
                let best = sizes.iter().map(|s| s.distance(requested)).min().unwrap();
                assert_eq!(chosen.distance(requested), best);
                let first_best = sizes.iter().find(|s| s.distance(requested) == best).unwrap();
                assert_eq!(chosen, *first_best);
            }
        }
    }

    #[test]
    fn test_frame_rate_scans_from_end() {
        let ranges = [
            FrameRateRange::new(15_000, 60_000),
            FrameRateRange::new(30_000, 30_000),
            FrameRateRange::new(60_000, 60_000),
            FrameRateRange::new(7_000, 30_000),
        ];
        assert_eq!(choose_frame_rate(&ranges, 60_000), Some(FrameRateRange::new(60_000, 60_000)));
    }

    #[test]
    fn test_frame_rate_falls_back_to_last_range() {
        let ranges = [
            FrameRateRange::new(15_000, 30_000),
            FrameRateRange::new(30_000, 30_000),
            FrameRateRange::new(7_000, 24_000),
        ];
        assert_eq!(choose_frame_rate(&ranges, 60_000), Some(FrameRateRange::new(7_000, 24_000)));
        assert_eq!(choose_frame_rate(&[], 60_000), None);
    }

    #[test]
    fn test_focus_mode_preference() {
        assert_eq!(
            choose_focus_mode(&[FocusMode::Auto, FocusMode::ContinuousVideo]),
            Some(FocusMode::ContinuousVideo)
        );
        assert_eq!(
            choose_focus_mode(&[FocusMode::Fixed, FocusMode::Auto]),
            Some(FocusMode::Auto)
        );
        assert_eq!(choose_focus_mode(&[FocusMode::Fixed]), None);
    }

    #[test]
    fn test_back_facing_rotation() {
        for o in [0, 90, 180, 270] {
            for r in [
                DisplayRotation::Rotation0,
                DisplayRotation::Rotation90,
                DisplayRotation::Rotation180,
                DisplayRotation::Rotation270,
            ] {
                assert_eq!(display_orientation(back(o), r), (o + 360 - r.degrees()) % 360);
            }
        }
        assert_eq!(display_orientation(back(90), DisplayRotation::Rotation0), 90);
        assert_eq!(display_orientation(back(90), DisplayRotation::Rotation270), 180);
    }

    #[test]
    fn test_front_facing_rotation_is_mirrored() {
        assert_eq!(display_orientation(front(270), DisplayRotation::Rotation0), 90);
        assert_eq!(display_orientation(front(270), DisplayRotation::Rotation90), 0);
        assert_eq!(display_orientation(front(90), DisplayRotation::Rotation180), 90);
        assert_eq!(display_orientation(front(0), DisplayRotation::Rotation0), 0);
    }

    #[test]
    fn test_plan_uses_request_and_capabilities() {
        let caps = DeviceCapabilities {
            focus_modes: vec![FocusMode::Auto],
            frame_rate_ranges: vec![FrameRateRange::new(15_000, 30_000)],
            preview_sizes: vec![Size::new(640, 480), Size::new(1280, 720)],
            picture_sizes: vec![Size::new(1280, 960), Size::new(4000, 3000)],
        };
        let request = CaptureRequest::new(1280, 720, 60_000);
        let plan = plan(&caps, &request, back(90), DisplayRotation::Rotation0).unwrap();
        assert_eq!(plan.params.preview_size, Size::new(1280, 720));
        assert_eq!(plan.params.picture_size, Size::new(1280, 960));
        assert_eq!(plan.params.frame_rate, FrameRateRange::new(15_000, 30_000));
        assert_eq!(plan.params.focus_mode, Some(FocusMode::Auto));
        assert!(plan.params.recording_hint);
        assert_eq!(plan.rotation_degrees, 90);
    }

    #[test]
    fn test_plan_without_preview_sizes_fails() {
        let caps = DeviceCapabilities {
            frame_rate_ranges: vec![FrameRateRange::new(15_000, 30_000)],
            picture_sizes: vec![Size::new(1280, 960)],
            ..Default::default()
        };
        let request = CaptureRequest::new(1280, 720, 60_000);
        let err = plan(&caps, &request, back(0), DisplayRotation::Rotation0).unwrap_err();
        assert!(matches!(err, CaptureError::NoSupportedSize("preview")));
    }
}
