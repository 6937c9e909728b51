use crate::error::PipelineError;
use crate::permissions::check_screen_recording;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use image::{DynamicImage, RgbaImage, imageops};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Screen rectangle in global coordinates; always normalized so
/// `left <= right` and `top <= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RectFields")]
pub struct CaptureRect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

#[derive(Deserialize)]
struct RectFields {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl From<RectFields> for CaptureRect {
    fn from(raw: RectFields) -> Self {
        CaptureRect::from_corners((raw.left, raw.top), (raw.right, raw.bottom))
    }
}

impl CaptureRect {
    pub fn from_corners(a: (i32, i32), b: (i32, i32)) -> Self {
        Self {
            left: a.0.min(b.0),
            top: a.1.min(b.1),
            right: a.0.max(b.0),
            bottom: a.1.max(b.1),
        }
    }

    pub fn left(&self) -> i32 {
        self.left
    }

    pub fn top(&self) -> i32 {
        self.top
    }

    pub fn right(&self) -> i32 {
        self.right
    }

    pub fn bottom(&self) -> i32 {
        self.bottom
    }

    pub fn width(&self) -> u32 {
        self.right.abs_diff(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.abs_diff(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Translates into the pixel space of a display whose top-left corner sits at
    /// `origin`, clamped to `bounds`. `None` when nothing of the rect is visible.
    fn clamp_to_display(&self, origin: (i32, i32), bounds: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
        let max_x = i64::from(bounds.0);
        let max_y = i64::from(bounds.1);
        let left = (i64::from(self.left) - i64::from(origin.0)).clamp(0, max_x);
        let top = (i64::from(self.top) - i64::from(origin.1)).clamp(0, max_y);
        let right = (i64::from(self.right) - i64::from(origin.0)).clamp(0, max_x);
        let bottom = (i64::from(self.bottom) - i64::from(origin.1)).clamp(0, max_y);

        if right <= left || bottom <= top {
            return None;
        }
        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }
}

impl fmt::Display for CaptureRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{} ({}x{})",
            self.left,
            self.top,
            self.right,
            self.bottom,
            self.width(),
            self.height()
        )
    }
}

impl FromStr for CaptureRect {
    type Err = String;

    /// Parses `left,top,right,bottom`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid region `{value}`: {e}"))?;
        match parts.as_slice() {
            [left, top, right, bottom] => Ok(CaptureRect::from_corners(
                (*left, *top),
                (*right, *bottom),
            )),
            _ => Err(format!(
                "invalid region `{value}`: expected left,top,right,bottom"
            )),
        }
    }
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Grabs `region` of the screen, or the whole primary display when `None`.
    async fn capture(&self, region: Option<CaptureRect>) -> Result<DynamicImage, PipelineError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XcapScreenCapture;

#[async_trait]
impl ScreenCapture for XcapScreenCapture {
    async fn capture(&self, region: Option<CaptureRect>) -> Result<DynamicImage, PipelineError> {
        check_screen_recording()?;
        tokio::task::spawn_blocking(move || grab_primary_display(region))
            .await
            .map_err(|e| PipelineError::CaptureFailure(format!("capture worker panicked: {e}")))?
            .map_err(PipelineError::capture)
    }
}

fn grab_primary_display(region: Option<CaptureRect>) -> anyhow::Result<DynamicImage> {
    let monitors = xcap::Monitor::all().context("failed to enumerate displays")?;
    let monitor = monitors
        .iter()
        .find(|m| m.is_primary())
        .or_else(|| monitors.first())
        .ok_or_else(|| anyhow!("no display available"))?;

    let frame = monitor
        .capture_image()
        .with_context(|| format!("failed to capture display `{}`", monitor.name()))?;

    match region {
        None => Ok(DynamicImage::ImageRgba8(frame)),
        Some(rect) => crop_frame(&frame, rect, (monitor.x(), monitor.y())),
    }
}

fn crop_frame(frame: &RgbaImage, rect: CaptureRect, origin: (i32, i32)) -> anyhow::Result<DynamicImage> {
    let (x, y, width, height) = rect
        .clamp_to_display(origin, frame.dimensions())
        .ok_or_else(|| anyhow!("region {rect} lies outside the primary display"))?;
    Ok(DynamicImage::ImageRgba8(
        imageops::crop_imm(frame, x, y, width, height).to_image(),
    ))
}

/// Serves a fixed frame; regions are cropped from it as if it were the display.
#[derive(Debug, Clone)]
pub struct StaticScreenCapture {
    frame: RgbaImage,
}

impl StaticScreenCapture {
    pub fn new(frame: RgbaImage) -> Self {
        Self { frame }
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbaImage::new(width, height))
    }
}

#[async_trait]
impl ScreenCapture for StaticScreenCapture {
    async fn capture(&self, region: Option<CaptureRect>) -> Result<DynamicImage, PipelineError> {
        match region {
            None => Ok(DynamicImage::ImageRgba8(self.frame.clone())),
            Some(rect) => crop_frame(&self.frame, rect, (0, 0)).map_err(PipelineError::capture),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureRect, ScreenCapture, StaticScreenCapture};
    use crate::error::ErrorKind;

    #[test]
    fn corners_are_normalized() {
        let rect = CaptureRect::from_corners((300, 40), (100, 240));
        assert_eq!((rect.left(), rect.top()), (100, 40));
        assert_eq!((rect.right(), rect.bottom()), (300, 240));
        assert_eq!((rect.width(), rect.height()), (200, 200));
    }

    #[test]
    fn parses_comma_separated_region() {
        let rect: CaptureRect = "10, 20, 5, 60".parse().expect("parse");
        assert_eq!(rect, CaptureRect::from_corners((5, 20), (10, 60)));
        assert!("1,2,3".parse::<CaptureRect>().is_err());
        assert!("a,b,c,d".parse::<CaptureRect>().is_err());
    }

    #[test]
    fn deserializing_normalizes_inverted_rects() {
        let rect: CaptureRect =
            toml::from_str("left = 50\ntop = 80\nright = 10\nbottom = 20").expect("toml");
        assert_eq!(rect, CaptureRect::from_corners((10, 20), (50, 80)));
    }

    #[tokio::test]
    async fn static_capture_crops_and_clamps_region() {
        let source = StaticScreenCapture::blank(200, 100);

        let full = source.capture(None).await.expect("full frame");
        assert_eq!((full.width(), full.height()), (200, 100));

        let cropped = source
            .capture(Some(CaptureRect::from_corners((150, 50), (400, 400))))
            .await
            .expect("clamped crop");
        assert_eq!((cropped.width(), cropped.height()), (50, 50));
    }

    #[tokio::test]
    async fn region_outside_display_is_capture_failure() {
        let source = StaticScreenCapture::blank(200, 100);
        let err = source
            .capture(Some(CaptureRect::from_corners((500, 500), (600, 600))))
            .await
            .expect_err("outside");
        assert_eq!(err.kind(), ErrorKind::CaptureFailure);
    }
}
