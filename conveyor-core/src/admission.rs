//! Admission: the synchronous phase between request arrival and job
//! persistence. Checks run in a fixed order, each failure fatal for the
//! submission: structural → paths → size → codec/container → webhook URL.
//! The quota check-and-increment happens afterwards, inside the creating
//! transaction (`JobManager::submit`), never here.

use std::path::PathBuf;

use url::Url;

use crate::error::{AdmissionError, ErrorCode};
use crate::storage::{normalize_path, Locator, StorageBackend, StorageError};
use crate::types::{JobInit, Operation, StreamFormat, Submission};

const DEFAULT_MAX_INPUT_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB
const DEFAULT_MAX_BITRATE_BPS: i64 = 200_000_000;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_OPERATIONS: usize = 16;

#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    pub max_input_bytes: u64,
    pub max_bitrate_bps: i64,
    pub max_width: u32,
    pub max_height: u32,
    pub local_roots: Vec<PathBuf>,
    pub s3_enabled: bool,
    pub max_attempts: i32,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            max_bitrate_bps: DEFAULT_MAX_BITRATE_BPS,
            max_width: 7680,
            max_height: 4320,
            local_roots: vec![PathBuf::from("/storage")],
            s3_enabled: true,
            max_attempts: 5,
        }
    }
}

/// Run the full admission sequence and produce a `JobInit` ready to be
/// persisted. The returned locators are normalized; the original request
/// strings never reach the worker.
pub async fn validate(
    owner_id: &str,
    submission: &Submission,
    limits: &AdmissionLimits,
    storage: &dyn StorageBackend,
) -> Result<JobInit, AdmissionError> {
    // 1. Structural.
    check_structure(submission)?;

    // 2. Paths, canonicalized before any predicate runs.
    let input = parse_scoped_locator(&submission.input, limits)?;
    let (output, container) = resolve_output(&input, &submission.output, submission, limits)?;

    // 3. Input size, from the backend's stat call.
    let stat = storage.stat(&input).await.map_err(stat_rejection)?;
    if stat.size > limits.max_input_bytes {
        return Err(AdmissionError::new(
            ErrorCode::InputTooLarge,
            format!(
                "input is {} bytes, ceiling is {} bytes",
                stat.size, limits.max_input_bytes
            ),
        ));
    }

    // 4. Codec/container compatibility and plan ceilings.
    for operation in &submission.operations {
        check_operation(operation, &container, limits)?;
    }

    // 5. Webhook target.
    if let Some(raw) = submission.webhook_url.as_deref() {
        check_webhook_url(raw).await?;
    }

    Ok(JobInit {
        owner_id: owner_id.to_owned(),
        idempotency_key: submission.idempotency_key.clone(),
        priority: submission.priority,
        operations: submission.operations.clone(),
        input_url: input.to_string(),
        output_url: output.to_string(),
        options: submission.options.clone(),
        webhook_url: submission.webhook_url.clone(),
        progress_webhook: submission.progress_webhook,
        max_attempts: limits.max_attempts,
    })
}

fn check_structure(submission: &Submission) -> Result<(), AdmissionError> {
    if submission.operations.is_empty() {
        return Err(AdmissionError::new(
            ErrorCode::InvalidInput,
            "a job needs at least one operation",
        ));
    }
    if submission.operations.len() > MAX_OPERATIONS {
        return Err(AdmissionError::new(
            ErrorCode::LimitExceeded,
            format!("at most {MAX_OPERATIONS} operations per job"),
        ));
    }

    for operation in &submission.operations {
        match operation {
            Operation::Trim {
                start_seconds,
                duration_seconds,
            } => {
                if !start_seconds.is_finite() || *start_seconds < 0.0 {
                    return Err(AdmissionError::new(
                        ErrorCode::InvalidInput,
                        "trim start must be a non-negative number",
                    ));
                }
                if let Some(duration) = duration_seconds {
                    if !duration.is_finite() || *duration <= 0.0 {
                        return Err(AdmissionError::new(
                            ErrorCode::InvalidInput,
                            "trim duration must be a positive number",
                        ));
                    }
                }
            }
            Operation::Filter { name, .. } if name.trim().is_empty() => {
                return Err(AdmissionError::new(
                    ErrorCode::InvalidOperation,
                    "filter operations need a filter name",
                ));
            }
            Operation::Watermark { opacity, .. } => {
                if let Some(opacity) = opacity {
                    if !(0.0..=1.0).contains(opacity) {
                        return Err(AdmissionError::new(
                            ErrorCode::InvalidInput,
                            "watermark opacity must be within [0, 1]",
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(key) = submission.idempotency_key.as_deref() {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AdmissionError::new(
                ErrorCode::InvalidInput,
                "idempotency key must be 1..=128 characters",
            ));
        }
    }

    Ok(())
}

/// Parse and scope a locator. Local paths are lexically canonicalized and
/// must land under a configured root; remote locators must belong to an
/// enabled backend. Filename tokens accept Unicode letters/digits/`-`/`_`/
/// `.`; control characters are rejected anywhere in the path.
fn parse_scoped_locator(raw: &str, limits: &AdmissionLimits) -> Result<Locator, AdmissionError> {
    if raw.chars().any(char::is_control) {
        return Err(AdmissionError::new(
            ErrorCode::InvalidPath,
            "locators must not contain control characters",
        ));
    }

    let locator = Locator::parse(raw).map_err(|err| match err {
        StorageError::InvalidLocator(message) => {
            AdmissionError::new(ErrorCode::InvalidPath, message)
        }
        other => AdmissionError::new(ErrorCode::InvalidPath, other.to_string()),
    })?;

    match &locator {
        Locator::File(path) => {
            let normalized = normalize_path(path)
                .ok_or_else(|| AdmissionError::from_code(ErrorCode::PathOutOfScope))?;
            if !limits
                .local_roots
                .iter()
                .any(|root| normalized.starts_with(root))
            {
                return Err(AdmissionError::from_code(ErrorCode::PathOutOfScope));
            }
            let filename = normalized
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            check_filename_token(&filename)?;
            Ok(Locator::File(normalized))
        }
        Locator::S3 { key, .. } => {
            if !limits.s3_enabled {
                return Err(AdmissionError::new(
                    ErrorCode::InvalidPath,
                    "the s3 backend is not enabled",
                ));
            }
            if key.split('/').any(|segment| segment == "..") {
                return Err(AdmissionError::from_code(ErrorCode::PathOutOfScope));
            }
            let filename = key.rsplit('/').next().unwrap_or_default();
            check_filename_token(filename)?;
            Ok(locator)
        }
    }
}

fn check_filename_token(token: &str) -> Result<(), AdmissionError> {
    if token.is_empty() {
        return Err(AdmissionError::new(
            ErrorCode::InvalidPath,
            "locators must name a file",
        ));
    }
    let ok = token
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(AdmissionError::new(
            ErrorCode::InvalidPath,
            "filenames may only contain letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

/// The output field is either a full locator or a bare container token
/// ("mp4"), in which case the output lands next to the input with the new
/// extension. Returns the resolved locator and the container that codec
/// checks run against.
fn resolve_output(
    input: &Locator,
    raw_output: &str,
    submission: &Submission,
    limits: &AdmissionLimits,
) -> Result<(Locator, String), AdmissionError> {
    let stream_format = submission.operations.iter().find_map(|op| match op {
        Operation::Stream { format, .. } => Some(*format),
        _ => None,
    });
    let analyze_only = submission
        .operations
        .iter()
        .all(|op| matches!(op, Operation::Analyze { .. }));

    let output = if raw_output.contains("://") {
        parse_scoped_locator(raw_output, limits)?
    } else {
        let container = raw_output.trim().to_ascii_lowercase();
        if container.is_empty() || !container.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AdmissionError::new(
                ErrorCode::InvalidPath,
                "output must be a locator or a bare container name",
            ));
        }
        derive_output_locator(input, &container)
    };

    let container = match stream_format {
        Some(format) => format.as_str().to_owned(),
        None => output_container(&output)?,
    };

    // Analyze-only jobs produce a report, not remuxed media.
    if analyze_only {
        if container != "json" {
            return Err(AdmissionError::new(
                ErrorCode::InvalidInput,
                "analyze jobs write a json report",
            ));
        }
        return Ok((output, container));
    }

    if !KNOWN_CONTAINERS.contains(&container.as_str()) {
        return Err(AdmissionError::new(
            ErrorCode::InvalidInput,
            format!("unsupported output container: {container}"),
        ));
    }

    Ok((output, container))
}

fn derive_output_locator(input: &Locator, container: &str) -> Locator {
    let extension = match container {
        "hls" => "m3u8",
        "dash" => "mpd",
        other => other,
    };
    match input {
        Locator::File(path) => Locator::File(path.with_extension(extension)),
        Locator::S3 { bucket, key } => {
            let stem = match key.rsplit_once('.') {
                Some((stem, _)) => stem,
                None => key.as_str(),
            };
            Locator::S3 {
                bucket: bucket.clone(),
                key: format!("{stem}.{extension}"),
            }
        }
    }
}

fn output_container(output: &Locator) -> Result<String, AdmissionError> {
    let name = match output {
        Locator::File(path) => path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase()),
        Locator::S3 { key, .. } => key
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase()),
    };
    let Some(extension) = name else {
        return Err(AdmissionError::new(
            ErrorCode::InvalidInput,
            "output locator needs a container extension",
        ));
    };
    Ok(match extension.as_str() {
        "m3u8" => "hls".to_owned(),
        "mpd" => "dash".to_owned(),
        other => other.to_owned(),
    })
}

const KNOWN_CONTAINERS: &[&str] = &["mp4", "mov", "webm", "mkv", "hls", "dash"];

/// Allowed codec sets per container. The transcoder would fail these later
/// anyway, but refusing at admission (and again before an HLS/DASH package
/// run) turns a wasted transcode into a 400.
pub fn allowed_video_codecs(container: &str) -> &'static [&'static str] {
    match container {
        "mp4" => &["h264", "hevc", "av1"],
        "mov" => &["h264", "hevc", "prores"],
        "webm" => &["vp8", "vp9", "av1"],
        "mkv" => &["h264", "hevc", "vp8", "vp9", "av1", "prores"],
        "hls" => &["h264", "hevc"],
        "dash" => &["h264", "hevc", "vp9", "av1"],
        _ => &[],
    }
}

pub fn allowed_audio_codecs(container: &str) -> &'static [&'static str] {
    match container {
        "mp4" => &["aac", "mp3", "opus"],
        "mov" => &["aac", "pcm_s16le"],
        "webm" => &["opus", "vorbis"],
        "mkv" => &["aac", "opus", "vorbis", "mp3", "flac"],
        "hls" => &["aac"],
        "dash" => &["aac", "opus"],
        _ => &[],
    }
}

fn check_operation(
    operation: &Operation,
    container: &str,
    limits: &AdmissionLimits,
) -> Result<(), AdmissionError> {
    match operation {
        Operation::Transcode {
            video_codec,
            audio_codec,
            bitrate,
            resolution,
            crf,
            ..
        } => {
            if let Some(codec) = video_codec.as_deref() {
                if !allowed_video_codecs(container).contains(&codec) {
                    return Err(AdmissionError::new(
                        ErrorCode::CodecContainerMismatch,
                        format!("video codec {codec} is not allowed in {container}"),
                    ));
                }
            }
            if let Some(codec) = audio_codec.as_deref() {
                if !allowed_audio_codecs(container).contains(&codec) {
                    return Err(AdmissionError::new(
                        ErrorCode::CodecContainerMismatch,
                        format!("audio codec {codec} is not allowed in {container}"),
                    ));
                }
            }
            if let Some(crf) = crf {
                if *crf > 63 {
                    return Err(AdmissionError::new(
                        ErrorCode::LimitExceeded,
                        "crf must be within [0, 63]",
                    ));
                }
            }
            if let Some(bitrate) = bitrate.as_deref() {
                let bps = parse_bitrate(bitrate)?;
                if bps > limits.max_bitrate_bps {
                    return Err(AdmissionError::new(
                        ErrorCode::LimitExceeded,
                        format!("bitrate exceeds the {} bps ceiling", limits.max_bitrate_bps),
                    ));
                }
            }
            if let Some(resolution) = resolution.as_deref() {
                let (width, height) = parse_resolution(resolution)?;
                if width > limits.max_width || height > limits.max_height {
                    return Err(AdmissionError::new(
                        ErrorCode::LimitExceeded,
                        format!(
                            "resolution exceeds the {}x{} ceiling",
                            limits.max_width, limits.max_height
                        ),
                    ));
                }
            }
            Ok(())
        }
        Operation::Stream { segment_seconds, .. } => {
            if let Some(seconds) = segment_seconds {
                if !(1..=60).contains(seconds) {
                    return Err(AdmissionError::new(
                        ErrorCode::LimitExceeded,
                        "segment length must be within [1, 60] seconds",
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Overflow-safe bitrate parsing. `9223372036854775807k` must come back as
/// `INVALID_BITRATE`, never silently truncated.
pub fn parse_bitrate(raw: &str) -> Result<i64, AdmissionError> {
    let trimmed = raw.trim();
    let reject = || AdmissionError::from_code(ErrorCode::InvalidBitrate);

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1_000i64),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1_000_000i64),
        Some(c) if c.is_ascii_digit() => (trimmed, 1i64),
        _ => return Err(reject()),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(reject());
    }

    let value: i64 = digits.parse().map_err(|_| reject())?;
    let bps = value.checked_mul(multiplier).ok_or_else(reject)?;
    if bps <= 0 {
        return Err(reject());
    }
    Ok(bps)
}

pub fn parse_resolution(raw: &str) -> Result<(u32, u32), AdmissionError> {
    let reject = || {
        AdmissionError::new(
            ErrorCode::InvalidInput,
            "resolution must look like 1920x1080",
        )
    };
    let (width, height) = raw.split_once(['x', 'X']).ok_or_else(reject)?;
    let width: u32 = width.parse().map_err(|_| reject())?;
    let height: u32 = height.parse().map_err(|_| reject())?;
    if width == 0 || height == 0 {
        return Err(reject());
    }
    Ok((width, height))
}

async fn check_webhook_url(raw: &str) -> Result<(), AdmissionError> {
    let url = Url::parse(raw).map_err(|_| {
        AdmissionError::new(ErrorCode::WebhookForbidden, "webhook url does not parse")
    })?;
    common_dns::ensure_public_webhook_target(&url)
        .await
        .map_err(|err| AdmissionError::new(ErrorCode::WebhookForbidden, err.to_string()))
}

fn stat_rejection(err: StorageError) -> AdmissionError {
    AdmissionError::new(err.code(), err.to_string())
}
