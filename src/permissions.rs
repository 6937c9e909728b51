use crate::error::PipelineError;
use anyhow::Result;

const PRIVACY_PANE: &str =
    "x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenRecording";

/// Fails with a capture error until macOS grants Screen Recording to this process.
pub fn check_screen_recording() -> Result<(), PipelineError> {
    if screen_recording_allowed() {
        return Ok(());
    }
    Err(PipelineError::CaptureFailure(
        "screen recording permission denied. Grant it in System Settings -> Privacy & Security -> Screen Recording, then relaunch."
            .to_string(),
    ))
}

#[cfg(target_os = "macos")]
fn screen_recording_allowed() -> bool {
    unsafe { CGPreflightScreenCaptureAccess() }
}

#[cfg(not(target_os = "macos"))]
fn screen_recording_allowed() -> bool {
    true
}

#[cfg(target_os = "macos")]
pub fn open_privacy_settings() -> Result<()> {
    use anyhow::{Context, ensure};

    let status = std::process::Command::new("open")
        .arg(PRIVACY_PANE)
        .status()
        .context("failed to run `open`")?;
    ensure!(status.success(), "`open {PRIVACY_PANE}` exited with {status}");
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn open_privacy_settings() -> Result<()> {
    anyhow::bail!("no privacy settings pane to open on this platform ({PRIVACY_PANE} is macOS only)")
}

#[cfg(target_os = "macos")]
#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
}

#[cfg(all(test, not(target_os = "macos")))]
mod tests {
    use super::{check_screen_recording, open_privacy_settings};

    #[test]
    fn capture_is_allowed_without_a_permission_gate() {
        assert!(check_screen_recording().is_ok());
        assert!(open_privacy_settings().is_err());
    }
}
