//! Toolpath analysis: derives summary statistics from a produced G-code file.
//!
//! Slicers disagree on how (and whether) they report totals, so the analyzer
//! combines two sources:
//! - Summary comments written by the engine (PrusaSlicer/SuperSlicer/Orca
//!   `; key = value` footers, Cura `;KEY:value` headers, layer markers).
//! - Motion analysis of `G0`–`G3` moves, used for any figure the comments
//!   don't provide.
//!
//! Every field is optional. Lines that can't be understood are skipped.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// `; filament used [mm] = 1234.5` (comma separated per extruder).
static FILAMENT_MM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^;\s*(?:total\s+)?filament\s+(?:used|length)\s*\[mm\]\s*[=:]\s*(.+)$")
        .expect("valid regex")
});

/// Cura: `;Filament used: 1.23456m`.
static FILAMENT_METERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^;\s*filament used\s*:\s*(.+)$").expect("valid regex"));

/// `;LAYER_COUNT:142`, `; total layers count = 142`, `; total layer number: 142`.
static LAYER_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^;\s*(?:layer_count\s*:|total\s+layers?\s+count\s*=|total\s+layer\s+number\s*[:=]?)\s*(\d+)")
        .expect("valid regex")
});

/// `; estimated printing time (normal mode) = 1h 2m 3s`.
static PRINT_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^;\s*estimated printing time(?:\s*\(normal mode\))?\s*=\s*(.+)$")
        .expect("valid regex")
});

/// Cura: `;TIME:3723` (seconds).
static CURA_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;TIME:\s*(\d+(?:\.\d+)?)\s*$").expect("valid regex"));

/// One `<number><unit>` group of a duration such as `1d 2h 3m 4s`.
static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*([dhms])").expect("valid regex"));

/// Physical extent of the extruded model, in engine units (normally mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Figures extracted from a toolpath.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolpathSummary {
    /// Filament consumed, in millimetres of filament.
    pub total_filament_length: Option<f64>,
    pub layer_count: Option<u32>,
    pub model_bounding_size: Option<BoundingSize>,
    /// Print time exactly as the engine wrote it.
    pub print_time_raw: Option<String>,
    /// `print_time_raw` converted to seconds, when it could be read.
    pub print_time_seconds: Option<u64>,
}

impl ToolpathSummary {
    /// True when nothing at all could be extracted.
    pub fn is_empty(&self) -> bool {
        self.total_filament_length.is_none()
            && self.layer_count.is_none()
            && self.model_bounding_size.is_none()
            && self.print_time_raw.is_none()
    }
}

/// Convert `1d 2h 3m 4s` (any subset, any order) to seconds.
pub fn parse_duration_secs(text: &str) -> Option<u64> {
    let mut total = 0f64;
    let mut matched = false;
    for cap in DURATION_PART.captures_iter(text) {
        let value: f64 = cap[1].parse().ok()?;
        let scale = match &cap[2] {
            "d" => 86_400.0,
            "h" => 3_600.0,
            "m" => 60.0,
            _ => 1.0,
        };
        total += value * scale;
        matched = true;
    }
    matched.then(|| total.round() as u64)
}

/// Sum a comma separated list of numbers, ignoring unit suffixes like `m`.
fn sum_values(list: &str, suffix: char) -> Option<f64> {
    let mut total = 0f64;
    let mut any = false;
    for part in list.split(',') {
        let part = part.trim().trim_end_matches(suffix).trim();
        if let Ok(v) = part.parse::<f64>() {
            total += v;
            any = true;
        }
    }
    any.then_some(total)
}

/// Parse `G1 X10 Y5.5 E0.2` (spaces optional) into `(letter, value)` words.
/// Line numbers and checksums are dropped.
fn parse_words(code: &str) -> Vec<(char, f64)> {
    let mut words = Vec::new();
    let mut chars = code.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '*' {
            break;
        }
        if !c.is_ascii_alphabetic() {
            continue;
        }
        let start = i + c.len_utf8();
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if d.is_ascii_digit() || d == '.' || d == '-' || d == '+' {
                end = j + d.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if let Ok(value) = code[start..end].parse::<f64>() {
            words.push((c.to_ascii_uppercase(), value));
        }
    }
    words
}

/// Streaming analyzer; feed lines then call [`ToolpathAnalyzer::finish`].
#[derive(Debug)]
pub struct ToolpathAnalyzer {
    // Comment-derived figures.
    reported_filament: Option<f64>,
    reported_layers: Option<u32>,
    layer_markers: u32,
    print_time_raw: Option<String>,
    print_time_seconds: Option<u64>,

    // Machine state.
    absolute_xyz: bool,
    absolute_e: bool,
    pos: [f64; 3],
    e: f64,

    // Motion-derived figures.
    net_extrusion: f64,
    extruded: bool,
    min: [f64; 3],
    max: [f64; 3],
    layer_heights: BTreeSet<i64>,
}

impl Default for ToolpathAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolpathAnalyzer {
    pub fn new() -> Self {
        Self {
            reported_filament: None,
            reported_layers: None,
            layer_markers: 0,
            print_time_raw: None,
            print_time_seconds: None,
            absolute_xyz: true,
            absolute_e: true,
            pos: [0.0; 3],
            e: 0.0,
            net_extrusion: 0.0,
            extruded: false,
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
            layer_heights: BTreeSet::new(),
        }
    }

    /// Consume one line of G-code.
    pub fn feed_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let (code, comment) = match line.find(';') {
            Some(pos) => (&line[..pos], Some(&line[pos..])),
            None => (line, None),
        };

        // Full-line comments carry the engine's own summary.
        if code.trim().is_empty() {
            if let Some(comment) = comment {
                self.feed_comment(comment);
            }
            return;
        }

        self.feed_code(code);
    }

    fn feed_comment(&mut self, comment: &str) {
        if comment.starts_with(";LAYER_CHANGE") || comment.starts_with(";LAYER:") {
            self.layer_markers += 1;
            return;
        }

        if let Some(cap) = FILAMENT_MM.captures(comment) {
            if let Some(total) = sum_values(&cap[1], ' ') {
                self.reported_filament = Some(total);
            }
        } else if let Some(cap) = FILAMENT_METERS.captures(comment) {
            if let Some(meters) = sum_values(&cap[1], 'm') {
                self.reported_filament = Some(meters * 1000.0);
            }
        } else if let Some(cap) = LAYER_COUNT.captures(comment) {
            if let Ok(count) = cap[1].parse() {
                self.reported_layers = Some(count);
            }
        } else if let Some(cap) = PRINT_TIME.captures(comment) {
            let raw = cap[1].trim().to_string();
            self.print_time_seconds = parse_duration_secs(&raw);
            self.print_time_raw = Some(raw);
        } else if let Some(cap) = CURA_TIME.captures(comment) {
            let raw = cap[1].to_string();
            self.print_time_seconds = raw.parse::<f64>().ok().map(|s| s.round() as u64);
            self.print_time_raw = Some(raw);
        }
    }

    fn feed_code(&mut self, code: &str) {
        let words = parse_words(code);
        let Some(&(letter, number)) = words.iter().find(|(l, _)| *l == 'G' || *l == 'M') else {
            return;
        };
        let command = (letter, number.round() as i64);
        let arg = |axis: char| words.iter().find(|(l, _)| *l == axis).map(|(_, v)| *v);

        match command {
            ('G', 0..=3) => self.apply_move(arg('X'), arg('Y'), arg('Z'), arg('E')),
            ('G', 90) => {
                self.absolute_xyz = true;
                self.absolute_e = true;
            }
            ('G', 91) => {
                self.absolute_xyz = false;
                self.absolute_e = false;
            }
            ('M', 82) => self.absolute_e = true,
            ('M', 83) => self.absolute_e = false,
            ('G', 92) => {
                // Logical position reset; no motion.
                for (i, axis) in ['X', 'Y', 'Z'].into_iter().enumerate() {
                    if let Some(v) = arg(axis) {
                        self.pos[i] = v;
                    }
                }
                if let Some(v) = arg('E') {
                    self.e = v;
                }
            }
            _ => {}
        }
    }

    fn apply_move(&mut self, x: Option<f64>, y: Option<f64>, z: Option<f64>, e: Option<f64>) {
        let start = self.pos;
        for (i, target) in [x, y, z].into_iter().enumerate() {
            if let Some(v) = target {
                self.pos[i] = if self.absolute_xyz { v } else { self.pos[i] + v };
            }
        }

        let delta_e = match e {
            Some(v) if self.absolute_e => {
                let d = v - self.e;
                self.e = v;
                d
            }
            Some(v) => {
                self.e += v;
                v
            }
            None => 0.0,
        };
        self.net_extrusion += delta_e;

        let moved_xy = start[0] != self.pos[0] || start[1] != self.pos[1];
        if delta_e > 0.0 && moved_xy {
            self.extruded = true;
            for point in [start, self.pos] {
                for i in 0..2 {
                    self.min[i] = self.min[i].min(point[i]);
                    self.max[i] = self.max[i].max(point[i]);
                }
            }
            self.min[2] = self.min[2].min(self.pos[2]);
            self.max[2] = self.max[2].max(self.pos[2]);
            self.layer_heights.insert((self.pos[2] * 1000.0).round() as i64);
        }
    }

    /// Produce the summary. Comment-derived values take precedence.
    pub fn finish(self) -> ToolpathSummary {
        let motion_filament = (self.extruded && self.net_extrusion > 0.0).then_some(self.net_extrusion);

        let layer_count = self
            .reported_layers
            .or((self.layer_markers > 0).then_some(self.layer_markers))
            .or((!self.layer_heights.is_empty()).then(|| self.layer_heights.len() as u32));

        let model_bounding_size = self.extruded.then(|| BoundingSize {
            x: self.max[0] - self.min[0],
            y: self.max[1] - self.min[1],
            z: self.max[2].max(0.0),
        });

        ToolpathSummary {
            total_filament_length: self.reported_filament.or(motion_filament),
            layer_count,
            model_bounding_size,
            print_time_raw: self.print_time_raw,
            print_time_seconds: self.print_time_seconds,
        }
    }
}

/// Analyze G-code held in memory. `None` if nothing could be extracted.
pub fn parse_gcode(text: &str) -> Option<ToolpathSummary> {
    let mut analyzer = ToolpathAnalyzer::new();
    for line in text.lines() {
        analyzer.feed_line(line);
    }
    let summary = analyzer.finish();
    (!summary.is_empty()).then_some(summary)
}

/// Analyze a G-code file line by line.
///
/// Unreadable, empty, or unintelligible files yield `None`; this never fails.
pub async fn summarize_file(path: &Path) -> Option<ToolpathSummary> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "Toolpath unreadable, skipping analysis");
            return None;
        }
    };

    let mut reader = BufReader::new(file);
    let mut analyzer = ToolpathAnalyzer::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => analyzer.feed_line(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!(error = %e, "Toolpath read failed mid-file, skipping analysis");
                return None;
            }
        }
    }

    let summary = analyzer.finish();
    (!summary.is_empty()).then_some(summary)
}
