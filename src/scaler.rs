use crate::backend::BackendKind;
use crate::error::PipelineError;
use image::DynamicImage;
use image::imageops::FilterType;
use std::borrow::Cow;

pub const REMOTE_PIXEL_BUDGET: u64 = 1_800_000;
pub const LOCAL_PIXEL_BUDGET: u64 = 350_000;

pub fn pixel_budget(kind: BackendKind) -> u64 {
    match kind {
        BackendKind::Remote => REMOTE_PIXEL_BUDGET,
        BackendKind::Local => LOCAL_PIXEL_BUDGET,
    }
}

/// Downscale `image` so `width * height` fits the backend's pixel budget.
///
/// Images already within budget are returned borrowed. Larger images keep their
/// aspect ratio and are resampled with Lanczos3.
pub fn scale(image: &DynamicImage, kind: BackendKind) -> Result<Cow<'_, DynamicImage>, PipelineError> {
    scale_to_budget(image, pixel_budget(kind))
}

/// Like [`scale`], but takes the frame by value so it can run on a blocking thread.
pub fn scale_owned(image: DynamicImage, kind: BackendKind) -> Result<DynamicImage, PipelineError> {
    let scaled = match scale(&image, kind)? {
        Cow::Owned(scaled) => Some(scaled),
        Cow::Borrowed(_) => None,
    };
    Ok(scaled.unwrap_or(image))
}

pub fn scale_to_budget(
    image: &DynamicImage,
    budget: u64,
) -> Result<Cow<'_, DynamicImage>, PipelineError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidImage { width, height });
    }

    let current = u64::from(width) * u64::from(height);
    if current <= budget {
        return Ok(Cow::Borrowed(image));
    }

    let (new_width, new_height) = target_dimensions(width, height, budget);
    log::debug!(
        "downscaling capture {width}x{height} ({current} px) to {new_width}x{new_height} (budget {budget} px)"
    );
    Ok(Cow::Owned(image.resize_exact(
        new_width,
        new_height,
        FilterType::Lanczos3,
    )))
}

fn target_dimensions(width: u32, height: u32, budget: u64) -> (u32, u32) {
    let current = u64::from(width) * u64::from(height);
    let factor = (budget as f64 / current as f64).sqrt();

    let new_width = ((f64::from(width) * factor).floor() as u64).max(1);
    // Float rounding (or a width clamped up to 1) must never push us over budget.
    let new_height = ((f64::from(height) * factor).floor() as u64)
        .min(budget / new_width)
        .max(1);

    (new_width as u32, new_height as u32)
}
