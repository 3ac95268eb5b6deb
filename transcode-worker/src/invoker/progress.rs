//! Parser for the transcoder's structured progress feed (`-progress
//! pipe:1`): one `key=value` per line, blocks terminated by a
//! `progress=continue|end` line.

/// One complete progress block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReport {
    pub elapsed_seconds: Option<f64>,
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    pub end: bool,
}

#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressReport,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a finished report when the block terminator
    /// arrives.
    pub fn feed(&mut self, line: &str) -> Option<ProgressReport> {
        let Some((key, value)) = line.trim().split_once('=') else {
            return None;
        };
        let value = value.trim();

        match key {
            "frame" => self.current.frame = value.parse().ok(),
            "fps" => self.current.fps = parse_numeric(value),
            "bitrate" => {
                // e.g. "1204.5kbits/s", or "N/A" before the first pass.
                self.current.bitrate_kbps =
                    parse_numeric(value.trim_end_matches("kbits/s"));
            }
            "out_time_us" => {
                if let Ok(us) = value.parse::<f64>() {
                    self.current.elapsed_seconds = Some(us / 1_000_000.0);
                }
            }
            "out_time_ms" => {
                // Despite the name, out_time_ms is expressed in microseconds
                // (FFmpeg ticket #7345). Convert so it lines up with
                // out_time and ffprobe's duration field.
                if let Ok(us) = value.parse::<f64>() {
                    self.current.elapsed_seconds = Some(us / 1_000_000.0);
                }
            }
            "out_time" => {
                self.current.elapsed_seconds = Some(parse_clock_to_seconds(value));
            }
            "speed" => {
                self.current.speed = parse_numeric(value.trim_end_matches('x'));
            }
            "progress" => {
                let mut report = std::mem::take(&mut self.current);
                report.end = value.eq_ignore_ascii_case("end");
                return Some(report);
            }
            _ => {}
        }

        None
    }
}

fn parse_numeric(value: &str) -> Option<f64> {
    let parsed: f64 = value.trim().parse().ok()?;
    if parsed.is_finite() {
        Some(parsed)
    } else {
        None
    }
}

fn parse_clock_to_seconds(value: &str) -> f64 {
    if value.contains(':') {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() == 3 {
            let h = parts[0].parse::<f64>().unwrap_or(0.0);
            let m = parts[1].parse::<f64>().unwrap_or(0.0);
            let s = parts[2].parse::<f64>().unwrap_or(0.0);
            return h * 3600.0 + m * 60.0 + s;
        }
    }
    value.parse::<f64>().unwrap_or(0.0)
}

/// Percentage as clamped elapsed/total. When the total duration is unknown
/// (zero, absent, non-finite) there is nothing honest to compute, so the
/// caller holds the last known value and lets stage updates flow instead.
pub fn compute_percent(total_duration: Option<f64>, elapsed_seconds: f64) -> Option<f64> {
    match total_duration {
        Some(total) if total.is_finite() && total > 0.0 => {
            let elapsed = if elapsed_seconds.is_finite() && elapsed_seconds > 0.0 {
                elapsed_seconds
            } else {
                0.0
            };
            let value = (elapsed / total * 100.0).clamp(0.0, 100.0);
            if value.is_finite() {
                Some(value)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn eta_seconds(
    total_duration: Option<f64>,
    elapsed_seconds: f64,
    speed: Option<f64>,
) -> Option<i64> {
    let total = total_duration?;
    let speed = speed.filter(|s| s.is_finite() && *s > 0.0)?;
    if !(total.is_finite() && total > elapsed_seconds) {
        return None;
    }
    let eta = (total - elapsed_seconds) / speed;
    if eta.is_finite() && eta >= 0.0 {
        Some(eta.round() as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_block() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("frame=480"), None);
        assert_eq!(parser.feed("fps=59.81"), None);
        assert_eq!(parser.feed("bitrate=1204.5kbits/s"), None);
        assert_eq!(parser.feed("out_time_ms=8008000"), None);
        assert_eq!(parser.feed("speed=2.01x"), None);

        let report = parser.feed("progress=continue").expect("block terminator");
        assert_eq!(report.frame, Some(480));
        assert_eq!(report.fps, Some(59.81));
        assert_eq!(report.bitrate_kbps, Some(1204.5));
        // out_time_ms carries microseconds.
        assert_eq!(report.elapsed_seconds, Some(8.008));
        assert_eq!(report.speed, Some(2.01));
        assert!(!report.end);
    }

    #[test]
    fn end_marker_is_flagged() {
        let mut parser = ProgressParser::new();
        parser.feed("out_time=00:01:23.450000");
        let report = parser.feed("progress=end").unwrap();
        assert!(report.end);
        let elapsed = report.elapsed_seconds.unwrap();
        assert!((elapsed - 83.45).abs() < 1e-6);
    }

    #[test]
    fn not_available_values_are_skipped() {
        let mut parser = ProgressParser::new();
        parser.feed("fps=N/A");
        parser.feed("bitrate=N/A");
        parser.feed("speed=N/A");
        let report = parser.feed("progress=continue").unwrap();
        assert_eq!(report.fps, None);
        assert_eq!(report.bitrate_kbps, None);
        assert_eq!(report.speed, None);
    }

    #[test]
    fn blocks_do_not_leak_into_each_other() {
        let mut parser = ProgressParser::new();
        parser.feed("frame=100");
        parser.feed("progress=continue").unwrap();

        let second = parser.feed("progress=continue").unwrap();
        assert_eq!(second.frame, None);
    }

    #[test]
    fn percent_is_linear_and_clamped() {
        assert_eq!(compute_percent(Some(100.0), 50.0), Some(50.0));
        assert_eq!(compute_percent(Some(100.0), 250.0), Some(100.0));
        assert_eq!(compute_percent(Some(100.0), -3.0), Some(0.0));
    }

    #[test]
    fn unknown_duration_yields_no_percentage() {
        // No division by zero and no synthetic curve.
        assert_eq!(compute_percent(Some(0.0), 10.0), None);
        assert_eq!(compute_percent(None, 10.0), None);
        assert_eq!(compute_percent(Some(f64::NAN), 10.0), None);
    }

    #[test]
    fn eta_comes_from_remaining_over_speed() {
        assert_eq!(eta_seconds(Some(100.0), 40.0, Some(2.0)), Some(30));
        assert_eq!(eta_seconds(Some(100.0), 40.0, None), None);
        assert_eq!(eta_seconds(None, 40.0, Some(2.0)), None);
        assert_eq!(eta_seconds(Some(100.0), 120.0, Some(2.0)), None);
    }
}
