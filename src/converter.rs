use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Twitter caps video attachments at 2:20; anything longer is cut.
pub const MAX_DURATION_SECS: u32 = 140;

/// Converts a downloaded voice note into an MP4 the X API accepts:
/// the audio re-encoded to AAC over a solid black H.264 video track.
/// Output lands next to the input with an `.mp4` extension.
pub async fn convert(input: &Path, duration_secs: u32) -> Result<PathBuf> {
    let output = input.with_extension("mp4");
    let cap = duration_secs.min(MAX_DURATION_SECS).max(1);

    debug!(
        "Converting {} ({}s, capped at {}s)",
        input.display(),
        duration_secs,
        cap
    );

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-f")
        .arg("lavfi")
        .arg("-i")
        .arg("color=c=black:s=1280x720:r=25")
        .arg("-i")
        .arg(input)
        .arg("-t")
        .arg(cap.to_string())
        .arg("-c:v")
        .arg("libx264")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("128k")
        .arg("-shortest")
        .arg(&output);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());

    let result = cmd.output().await.context("failed to execute ffmpeg")?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        anyhow::bail!("ffmpeg failed on {}: {}", input.display(), stderr.trim());
    }

    Ok(output)
}
