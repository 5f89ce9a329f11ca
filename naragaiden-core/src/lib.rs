use std::fmt::Display;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const ARM_WINDOW_MS: i64 = 2_000;
pub const MAX_STATUS_CHARS: usize = 80;
pub const UNKNOWN_NAME: &str = "Unknown";
pub const UNKNOWN_LABEL: &str = "unknown";
pub const STATUS_READY: &str = "Nara Gaiden";
pub const STATUS_LOADING: &str = "Loading...";
pub const STATUS_LAUNCH_PROMPT: &str = "Tap 2x to launch Nara Baby";
pub const UPDATED_PLACEHOLDER: &str = "as of --";
pub const UPDATED_UNKNOWN: &str = "Updated: unknown";
pub const VITAMINS_MARKER: &str = "\u{1f48a}";

const MS_PER_HOUR: f64 = 3_600_000.0;

pub const NEUTRAL_COLORS: TimeColors = TimeColors {
    background: Rgb::new(0x33, 0x33, 0x33),
    foreground: Rgb::new(0xf2, 0xf2, 0xf2),
};

/// Age color stops as `(hours, color)`, ordered by hour.
pub const AGE_STOPS: [(f64, Rgb); 4] = [
    (1.0, Rgb::new(27, 94, 32)),
    (2.0, Rgb::new(133, 100, 18)),
    (3.0, Rgb::new(121, 69, 0)),
    (4.0, Rgb::new(122, 28, 28)),
];

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("payload is not a JSON object")]
    PayloadNotObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatus {
    pub label: String,
    pub begin_at_ms: Option<i64>,
}

impl EventStatus {
    pub fn unknown() -> Self {
        Self {
            label: UNKNOWN_LABEL.to_owned(),
            begin_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub id: String,
    pub name: String,
    pub vitamins_today: bool,
    pub feed: EventStatus,
    pub diaper: EventStatus,
}

impl ChildStatus {
    pub fn display_name(&self) -> String {
        if self.vitamins_today {
            format!("{} {}", self.name, VITAMINS_MARKER)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Epoch milliseconds; `0` when the payload did not say.
    pub generated_at_ms: i64,
    pub children: Vec<ChildStatus>,
}

impl Snapshot {
    pub fn generated_at(&self) -> Option<i64> {
        (self.generated_at_ms > 0).then_some(self.generated_at_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(0xff, 0xff, 0xff);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeColors {
    pub background: Rgb,
    pub foreground: Rgb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowView {
    pub id: String,
    pub name: String,
    pub feed_label: String,
    pub feed_relative: String,
    pub feed_colors: TimeColors,
    pub diaper_label: String,
    pub diaper_relative: String,
    pub diaper_colors: TimeColors,
}

/// Fully formatted widget contents handed to a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewModel {
    pub status_line: String,
    pub updated_line: String,
    pub rows: Vec<RowView>,
    pub armed: bool,
}

impl ViewModel {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapAction {
    Launch,
    ShowPrompt,
}

/// Decodes an upstream payload, filling documented defaults for anything missing.
///
/// Only text that is not JSON at all, or JSON whose top level is not an object, is an error.
pub fn parse_snapshot(raw: &str) -> Result<Snapshot, CoreError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| CoreError::MalformedPayload(err.to_string()))?;
    let root = value.as_object().ok_or(CoreError::PayloadNotObject)?;

    let generated_at_ms = root.get("generatedAt").and_then(as_long).unwrap_or(0);

    let mut children = Vec::new();
    if let Some(items) = root.get("children").and_then(Value::as_array) {
        for item in items {
            let Some(child) = item.as_object() else {
                continue;
            };
            let position = children.len() + 1;
            children.push(parse_child(child, position));
        }
    }

    Ok(Snapshot {
        generated_at_ms,
        children,
    })
}

/// Reads only `generatedAt`, returning `0` for anything unusable.
pub fn peek_generated_at(raw: &str) -> i64 {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("generatedAt").and_then(as_long))
        .unwrap_or(0)
}

fn parse_child(child: &Map<String, Value>, position: usize) -> ChildStatus {
    let id = child
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("child-{position}"));
    let name = child
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_NAME)
        .to_owned();

    ChildStatus {
        id,
        name,
        vitamins_today: child
            .get("vitaminsToday")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        feed: parse_event(child.get("feed")),
        diaper: parse_event(child.get("diaper")),
    }
}

fn parse_event(value: Option<&Value>) -> EventStatus {
    let Some(event) = value.and_then(Value::as_object) else {
        return EventStatus::unknown();
    };
    EventStatus {
        label: event
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_LABEL)
            .to_owned(),
        begin_at_ms: event
            .get("beginDt")
            .and_then(as_long)
            .filter(|ms| *ms > 0),
    }
}

fn as_long(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("{count} {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Renders the age of an event as `"2 hours 5 mins ago"`.
///
/// Minutes are dropped once a full day has passed.
pub fn format_relative(begin_at_ms: Option<i64>, now_ms: i64) -> String {
    let Some(begin_at_ms) = begin_at_ms else {
        return UNKNOWN_LABEL.to_owned();
    };
    let elapsed_secs = now_ms.saturating_sub(begin_at_ms).max(0) / 1000;
    let days = elapsed_secs / 86_400;
    let hours = (elapsed_secs / 3_600) % 24;
    let minutes = (elapsed_secs / 60) % 60;

    let mut parts = Vec::with_capacity(3);
    if days > 0 {
        parts.push(plural(days, "day"));
    }
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 && days == 0 {
        parts.push(plural(minutes, "min"));
    }

    if parts.is_empty() {
        return "just now".to_owned();
    }
    format!("{} ago", parts.join(" "))
}

pub fn time_colors(begin_at_ms: Option<i64>, now_ms: i64) -> TimeColors {
    let Some(begin_at_ms) = begin_at_ms else {
        return NEUTRAL_COLORS;
    };
    let delta_hours = (now_ms.saturating_sub(begin_at_ms) as f64 / MS_PER_HOUR).max(0.0);
    TimeColors {
        background: age_color(delta_hours),
        foreground: Rgb::WHITE,
    }
}

/// Piecewise-linear color for an age in hours, clamped to the first and last stop.
pub fn age_color(delta_hours: f64) -> Rgb {
    let (first_hour, first) = AGE_STOPS[0];
    let (last_hour, last) = AGE_STOPS[AGE_STOPS.len() - 1];
    if delta_hours <= first_hour {
        return first;
    }
    if delta_hours >= last_hour {
        return last;
    }

    for pair in AGE_STOPS.windows(2) {
        let (h0, c0) = pair[0];
        let (h1, c1) = pair[1];
        if delta_hours <= h1 {
            let t = (delta_hours - h0) / (h1 - h0);
            return Rgb::new(lerp(c0.r, c1.r, t), lerp(c0.g, c1.g, t), lerp(c0.b, c1.b, t));
        }
    }
    last
}

fn lerp(from: u8, to: u8, t: f64) -> u8 {
    let value = f64::from(from) + (f64::from(to) - f64::from(from)) * t;
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

/// Appends `" (N mins old)"` to an updated label when asked to and the data has aged.
pub fn stale_suffix(updated_label: &str, last_success_ms: i64, include: bool, now_ms: i64) -> String {
    if !include || last_success_ms <= 0 {
        return updated_label.to_owned();
    }
    let minutes = now_ms.saturating_sub(last_success_ms).max(0) / 60_000;
    match minutes {
        0 => updated_label.to_owned(),
        1 => format!("{updated_label} (1 min old)"),
        n => format!("{updated_label} ({n} mins old)"),
    }
}

pub fn format_updated_label(generated_at_ms: i64) -> String {
    format_updated_label_in(generated_at_ms, &Local)
}

/// Short clock time of `generated_at_ms` in `tz`, e.g. `"Updated: 3:07 PM"`.
pub fn format_updated_label_in<Tz>(generated_at_ms: i64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if generated_at_ms <= 0 {
        return UPDATED_UNKNOWN.to_owned();
    }
    match tz.timestamp_millis_opt(generated_at_ms).single() {
        Some(at) => format!("Updated: {}", at.format("%-I:%M %p")),
        None => UPDATED_UNKNOWN.to_owned(),
    }
}

pub fn error_status(message: &str) -> String {
    short_status(&format!("Error: {message}"), MAX_STATUS_CHARS)
}

pub fn short_status(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('\u{2026}');
    out
}

pub fn build_rows(snapshot: &Snapshot, now_ms: i64) -> Vec<RowView> {
    snapshot
        .children
        .iter()
        .map(|child| RowView {
            id: child.id.clone(),
            name: child.display_name(),
            feed_label: child.feed.label.clone(),
            feed_relative: format_relative(child.feed.begin_at_ms, now_ms),
            feed_colors: time_colors(child.feed.begin_at_ms, now_ms),
            diaper_label: child.diaper.label.clone(),
            diaper_relative: format_relative(child.diaper.begin_at_ms, now_ms),
            diaper_colors: time_colors(child.diaper.begin_at_ms, now_ms),
        })
        .collect()
}

/// Rows for a cached raw payload. A cache that no longer parses yields no rows.
pub fn rows_from_cache(raw_payload: Option<&str>, now_ms: i64) -> Vec<RowView> {
    raw_payload
        .and_then(|raw| parse_snapshot(raw).ok())
        .map(|snapshot| build_rows(&snapshot, now_ms))
        .unwrap_or_default()
}

pub fn is_arm_window_open(armed_at_ms: i64, now_ms: i64) -> bool {
    armed_at_ms > 0 && now_ms.saturating_sub(armed_at_ms) <= ARM_WINDOW_MS
}

/// Returns the action for a tap and the armed timestamp to persist (`0` = disarmed).
pub fn arm_decision(armed_at_ms: i64, now_ms: i64) -> (TapAction, i64) {
    if is_arm_window_open(armed_at_ms, now_ms) {
        (TapAction::Launch, 0)
    } else {
        (TapAction::ShowPrompt, now_ms)
    }
}
