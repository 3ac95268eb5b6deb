use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::warn;

use super::InvokeError;

/// Duration in seconds as reported by the prober, or None when the media
/// carries no usable duration (live-ish inputs, broken headers). Callers
/// must treat None as "no percentage available", never as zero.
pub async fn media_duration(ffprobe: &Path, input: &Path) -> Result<Option<f64>, InvokeError> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=nw=1:nk=1")
        .arg(input.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(InvokeError::Spawn)?;

    if !output.status.success() {
        return Err(InvokeError::InvalidMedia);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = stdout
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .unwrap_or(0.0);

    if duration.is_finite() && duration > 0.0 {
        Ok(Some(duration))
    } else {
        Ok(None)
    }
}

/// Full JSON report for analyze jobs (`-show_format -show_streams`).
pub async fn probe_report(ffprobe: &Path, input: &Path) -> Result<Vec<u8>, InvokeError> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(input.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(InvokeError::Spawn)?;

    if !output.status.success() {
        return Err(InvokeError::InvalidMedia);
    }

    Ok(output.stdout)
}

/// Encoders the local transcoder build actually carries, probed once per
/// process at startup.
#[derive(Debug, Default, Clone)]
pub struct EncoderCaps {
    names: HashSet<String>,
}

static ENCODER_CAPS: OnceCell<EncoderCaps> = OnceCell::const_new();

pub async fn cached_encoder_caps(ffmpeg: &Path) -> &'static EncoderCaps {
    ENCODER_CAPS
        .get_or_init(|| async {
            match probe_encoders(ffmpeg).await {
                Ok(caps) => caps,
                Err(err) => {
                    warn!("encoder probe failed, falling back to software: {}", err);
                    EncoderCaps::default()
                }
            }
        })
        .await
}

async fn probe_encoders(ffmpeg: &Path) -> Result<EncoderCaps, InvokeError> {
    let output = Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-encoders")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(InvokeError::Spawn)?;

    Ok(EncoderCaps::parse(&String::from_utf8_lossy(&output.stdout)))
}

/// Ranked encoder candidates per requested codec; hardware first, software
/// fallback last. The fallback is returned even when the probe saw nothing,
/// so a failed probe degrades to software instead of refusing work.
fn candidates(codec: &str) -> &'static [&'static str] {
    match codec {
        "h264" => &["h264_nvenc", "h264_qsv", "h264_vaapi", "libx264"],
        "hevc" => &["hevc_nvenc", "hevc_qsv", "hevc_vaapi", "libx265"],
        "av1" => &["av1_nvenc", "av1_qsv", "libsvtav1", "libaom-av1"],
        "vp9" => &["libvpx-vp9"],
        "vp8" => &["libvpx"],
        "prores" => &["prores_ks"],
        "aac" => &["aac"],
        "opus" => &["libopus"],
        "vorbis" => &["libvorbis"],
        "mp3" => &["libmp3lame"],
        "flac" => &["flac"],
        "pcm_s16le" => &["pcm_s16le"],
        _ => &[],
    }
}

impl EncoderCaps {
    pub fn parse(listing: &str) -> Self {
        let mut names = HashSet::new();
        // Listing rows look like " V....D libx264  H.264 / AVC ...". Skip
        // the header block above the "------" separator.
        let mut seen_separator = false;
        for line in listing.lines() {
            if !seen_separator {
                seen_separator = line.trim_start().starts_with("------");
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(_flags), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            names.insert(name.to_owned());
        }
        Self { names }
    }

    pub fn has(&self, encoder: &str) -> bool {
        self.names.contains(encoder)
    }

    /// Highest-ranked available encoder for the codec, with the software
    /// implementation as the fallback.
    pub fn select(&self, codec: &str) -> Option<&'static str> {
        let ranked = candidates(codec);
        ranked
            .iter()
            .find(|name| self.has(name))
            .or_else(|| ranked.last())
            .copied()
    }

    /// True when the selected encoder runs on dedicated hardware.
    pub fn is_hardware(encoder: &str) -> bool {
        encoder.ends_with("_nvenc") || encoder.ends_with("_qsv") || encoder.ends_with("_vaapi")
    }
}
