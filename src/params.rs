// ABOUTME: Normalizes loosely named form fields into a canonical clip specification
// ABOUTME: Alias precedence is an explicit table; resolution never fails

use crate::ingest::FieldSet;
use serde::Serialize;

pub const DEFAULT_DURATION_SECONDS: f64 = 5.0;
pub const MIN_DURATION_SECONDS: f64 = 0.1;
pub const MAX_DURATION_SECONDS: f64 = 60.0;
pub const DEFAULT_FPS: u32 = 10;
pub const DEFAULT_WIDTH: u32 = 320;

/// Accepted field names per canonical parameter, highest precedence first
pub const START_ALIASES: &[&str] = &["start", "startTime", "inicio", "inicioTime"];
pub const END_ALIASES: &[&str] = &["end", "fim"];
pub const DURATION_ALIASES: &[&str] = &["duration", "dur"];
pub const FPS_ALIASES: &[&str] = &["fps"];
pub const WIDTH_ALIASES: &[&str] = &["width"];
pub const OPTIMIZE_ALIASES: &[&str] = &["optimize", "palette"];

/// Resolved clip parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipSpec {
    /// Always >= 0
    pub start_seconds: f64,
    /// Always within [MIN_DURATION_SECONDS, MAX_DURATION_SECONDS]
    pub duration_seconds: f64,
    pub fps: u32,
    pub width: u32,
    pub optimize_palette: bool,
}

impl Default for ClipSpec {
    fn default() -> Self {
        Self {
            start_seconds: 0.0,
            duration_seconds: DEFAULT_DURATION_SECONDS,
            fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            optimize_palette: false,
        }
    }
}

/// First alias present in `fields`. A present but empty or garbage value
/// still wins over later aliases.
fn lookup<'a>(fields: &'a FieldSet, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|name| fields.get(name))
}

/// Length of the leading `[+-]digits` run, or 0 without digits
fn integer_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits = bytes[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        0
    } else {
        sign + digits
    }
}

/// Length of the longest leading decimal literal (`-1.5e3` in `-1.5e3s`)
fn decimal_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));

    let int_digits = bytes[end..].iter().take_while(|b| b.is_ascii_digit()).count();
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = bytes[end + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let exp = &s[end + 1..];
        let exp_len = integer_prefix_len(exp);
        if exp_len > 0 {
            end += 1 + exp_len;
        }
    }

    end
}

/// Leading number of a field value; trailing text such as units is ignored
fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    let v = raw?.trim_start();
    v[..decimal_prefix_len(v)]
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Leading integer of a field value (`"12.5"` is 12)
fn parse_positive_int(raw: Option<&str>) -> Option<u32> {
    let v = raw?.trim_start();
    v[..integer_prefix_len(v)]
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

/// Map raw form fields to a usable [`ClipSpec`]. Total and deterministic.
pub fn normalize(fields: &FieldSet) -> ClipSpec {
    let start_seconds = parse_seconds(lookup(fields, START_ALIASES))
        .filter(|s| *s >= 0.0)
        .unwrap_or(0.0);

    let raw_duration = parse_seconds(lookup(fields, DURATION_ALIASES))
        .or_else(|| {
            parse_seconds(lookup(fields, END_ALIASES)).map(|end| (end - start_seconds).max(0.0))
        })
        .unwrap_or(DEFAULT_DURATION_SECONDS);

    let duration_seconds = raw_duration.clamp(MIN_DURATION_SECONDS, MAX_DURATION_SECONDS);

    let fps = parse_positive_int(lookup(fields, FPS_ALIASES)).unwrap_or(DEFAULT_FPS);
    let width = parse_positive_int(lookup(fields, WIDTH_ALIASES)).unwrap_or(DEFAULT_WIDTH);

    // Any of the optimize aliases may switch the palette path on
    let optimize_palette = OPTIMIZE_ALIASES
        .iter()
        .any(|name| fields.get(name) == Some("true"));

    ClipSpec {
        start_seconds,
        duration_seconds,
        fps,
        width,
        optimize_palette,
    }
}
