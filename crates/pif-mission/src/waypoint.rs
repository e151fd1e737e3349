use serde::Serialize;
use std::path::Path;

use pif_proto::{PositionNed, PositionNedYaw};

use crate::error::ParseError;

/// One navigation target in the vehicle-local NED frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Waypoint {
    /// 1-based line in the source (the header is row 1).
    pub row: usize,
    pub north_m: f32,
    pub east_m: f32,
    pub down_m: f32,
    /// Heading of the leg arriving at this waypoint.
    pub yaw_deg: f32,
}

impl Waypoint {
    pub fn position(&self) -> PositionNed {
        PositionNed::new(self.north_m, self.east_m, self.down_m)
    }

    pub fn setpoint(&self) -> PositionNedYaw {
        PositionNedYaw::new(self.north_m, self.east_m, self.down_m, self.yaw_deg)
    }
}

/// Heading of the horizontal displacement, degrees from north. 0 when the
/// displacement is zero.
pub fn heading_deg(d_north: f32, d_east: f32) -> f32 {
    d_east.atan2(d_north).to_degrees()
}

pub fn load_mission(path: impl AsRef<Path>) -> Result<Vec<Waypoint>, ParseError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|source| ParseError::Io { path: path.display().to_string(), source })?;
    parse_mission(&text)
}

/// Parse `north,east,down` rows. The first line is a header; blank lines
/// are skipped and extra columns ignored. Fields may be double-quoted.
pub fn parse_mission(text: &str) -> Result<Vec<Waypoint>, ParseError> {
    let mut out = Vec::new();
    let (mut prev_n, mut prev_e) = (0.0_f32, 0.0_f32);

    for (i, line) in text.lines().enumerate().skip(1) {
        let row = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts = split_record(line);
        if parts.len() < 3 {
            return Err(ParseError::MissingColumns { row, found: parts.len() });
        }
        let north_m = parse_field(row, "north", &parts[0])?;
        let east_m = parse_field(row, "east", &parts[1])?;
        let down_m = parse_field(row, "down", &parts[2])?;

        let yaw_deg = heading_deg(north_m - prev_n, east_m - prev_e);
        prev_n = north_m;
        prev_e = east_m;

        out.push(Waypoint { row, north_m, east_m, down_m, yaw_deg });
    }

    if out.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(out)
}

/// Splits one CSV record. A quoted field may hold commas, and `""` inside
/// quotes is a literal quote.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn parse_field(row: usize, column: &'static str, raw: &str) -> Result<f32, ParseError> {
    let value = raw.trim();
    match value.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::BadNumber { row, column, value: value.to_string() }),
    }
}
