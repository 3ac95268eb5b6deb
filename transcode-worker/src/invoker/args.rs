//! Argument-vector construction for the transcoder. Everything is built as
//! discrete argv elements handed to a direct-exec API; nothing is ever
//! interpolated into a shell, including metadata values.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use conveyor_core::{Operation, StreamFormat};

use super::probe::EncoderCaps;

/// What one job invocation amounts to.
#[derive(Debug, PartialEq)]
pub enum Plan {
    /// A single transcoder run with the given argv (binary not included).
    Transcode(Vec<String>),
    /// Analyze-only job: a prober run producing a JSON report.
    Probe,
}

pub fn build_plan(
    operations: &[Operation],
    options: &BTreeMap<String, serde_json::Value>,
    input: &Path,
    output: &Path,
    caps: &EncoderCaps,
) -> Plan {
    if operations
        .iter()
        .all(|op| matches!(op, Operation::Analyze { .. }))
    {
        return Plan::Probe;
    }

    let mut argv: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-y".into(),
        "-i".into(),
        input.display().to_string(),
    ];

    let mut video_filters: Vec<String> = Vec::new();
    let mut watermark: Option<(String, String)> = None;
    let mut has_transcode = false;

    for operation in operations {
        match operation {
            Operation::Trim {
                start_seconds,
                duration_seconds,
            } => {
                argv.push("-ss".into());
                argv.push(format!("{start_seconds}"));
                if let Some(duration) = duration_seconds {
                    argv.push("-t".into());
                    argv.push(format!("{duration}"));
                }
            }
            Operation::Transcode {
                video_codec,
                audio_codec,
                crf,
                bitrate,
                resolution,
                preset,
            } => {
                has_transcode = true;
                if let Some(codec) = video_codec.as_deref() {
                    if let Some(encoder) = caps.select(codec) {
                        argv.push("-c:v".into());
                        argv.push(encoder.into());
                        if let Some(crf) = crf {
                            // Hardware encoders take a quality target under a
                            // different flag.
                            if EncoderCaps::is_hardware(encoder) {
                                argv.push("-cq".into());
                            } else {
                                argv.push("-crf".into());
                            }
                            argv.push(crf.to_string());
                        }
                        if let Some(preset) = preset.as_deref() {
                            argv.push("-preset".into());
                            argv.push(preset.into());
                        }
                    }
                }
                if let Some(bitrate) = bitrate.as_deref() {
                    argv.push("-b:v".into());
                    argv.push(bitrate.into());
                }
                if let Some(resolution) = resolution.as_deref() {
                    if let Some((width, height)) = resolution.split_once(['x', 'X']) {
                        video_filters.push(format!("scale={width}:{height}"));
                    }
                }
                if let Some(codec) = audio_codec.as_deref() {
                    if let Some(encoder) = caps.select(codec) {
                        argv.push("-c:a".into());
                        argv.push(encoder.into());
                    }
                }
            }
            Operation::Filter { name, params } => {
                if params.is_empty() {
                    video_filters.push(name.clone());
                } else {
                    let rendered = params
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect::<Vec<_>>()
                        .join(":");
                    video_filters.push(format!("{name}={rendered}"));
                }
            }
            Operation::Watermark {
                image,
                position,
                opacity,
            } => {
                let pos = match position.as_deref() {
                    Some("top-left") | None => "10:10".to_owned(),
                    Some("top-right") => "main_w-overlay_w-10:10".to_owned(),
                    Some("bottom-left") => "10:main_h-overlay_h-10".to_owned(),
                    Some("bottom-right") => {
                        "main_w-overlay_w-10:main_h-overlay_h-10".to_owned()
                    }
                    Some(other) => {
                        warn!("unknown watermark position {}, using top-left", other);
                        "10:10".to_owned()
                    }
                };
                let overlay = match opacity {
                    Some(opacity) => format!(
                        "format=rgba,colorchannelmixer=aa={opacity}[wm];[0:v][wm]overlay={pos}"
                    ),
                    None => format!("[0:v][1:v]overlay={pos}"),
                };
                watermark = Some((image.clone(), overlay));
            }
            Operation::Stream {
                format,
                segment_seconds,
            } => {
                let seconds = segment_seconds.unwrap_or(6);
                match format {
                    StreamFormat::Hls => {
                        argv.push("-f".into());
                        argv.push("hls".into());
                        argv.push("-hls_time".into());
                        argv.push(seconds.to_string());
                        argv.push("-hls_playlist_type".into());
                        argv.push("vod".into());
                    }
                    StreamFormat::Dash => {
                        argv.push("-f".into());
                        argv.push("dash".into());
                        argv.push("-seg_duration".into());
                        argv.push(seconds.to_string());
                    }
                }
            }
            Operation::Analyze { .. } => {
                // Mixed in with other work: decode statistics ride along for
                // free; the dedicated report path is analyze-only jobs.
            }
        }
    }

    if let Some((image, overlay)) = watermark {
        // The watermark is a second input; any plain filters append onto the
        // overlay chain (ffmpeg rejects -vf next to -filter_complex).
        let input_pos = argv
            .iter()
            .position(|arg| arg == "-i")
            .map(|idx| idx + 2)
            .unwrap_or(argv.len());
        argv.insert(input_pos, image.clone());
        argv.insert(input_pos, "-i".into());

        let mut chain = match opacity_prefix(&overlay) {
            Some(prefixed) => prefixed,
            None => overlay,
        };
        if !video_filters.is_empty() {
            chain = format!("{chain},{}", video_filters.join(","));
        }
        argv.push("-filter_complex".into());
        argv.push(chain);
    } else if !video_filters.is_empty() {
        argv.push("-vf".into());
        argv.push(video_filters.join(","));
    }

    if !has_transcode && video_filters_is_pure_copy(operations) {
        // Trim-only work keeps the streams untouched.
        argv.push("-c".into());
        argv.push("copy".into());
    }

    push_metadata(&mut argv, options);

    argv.push(output.display().to_string());
    Plan::Transcode(argv)
}

fn opacity_prefix(overlay: &str) -> Option<String> {
    // Overlay chains carrying an opacity stage already reference [1:v]
    // implicitly; prefix the watermark input label.
    overlay
        .starts_with("format=")
        .then(|| format!("[1:v]{overlay}"))
}

fn video_filters_is_pure_copy(operations: &[Operation]) -> bool {
    operations.iter().all(|op| {
        matches!(
            op,
            Operation::Trim { .. } | Operation::Analyze { .. } | Operation::Stream { .. }
        )
    })
}

/// Metadata pairs from the options map become discrete
/// `-metadata key=value` argv elements after validation; a shell never sees
/// any of this.
fn push_metadata(argv: &mut Vec<String>, options: &BTreeMap<String, serde_json::Value>) {
    let Some(serde_json::Value::Object(metadata)) = options.get("metadata") else {
        return;
    };

    for (key, value) in metadata {
        let Some(value) = value.as_str() else {
            warn!(%key, "skipping non-string metadata value");
            continue;
        };
        let key_ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !key_ok || value.chars().any(char::is_control) {
            warn!(%key, "skipping invalid metadata pair");
            continue;
        }
        argv.push("-metadata".into());
        argv.push(format!("{key}={value}"));
    }
}
