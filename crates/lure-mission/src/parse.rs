//! Mission file import.
//!
//! Accepts what ground tools commonly export:
//! - INAV Configurator / mwp XML (`<missionitem no=".." action=".." lat=".." lon=".." alt=".."/>`)
//! - QGroundControl `QGC WPL 110` text
//! - anything else with one `lat lon alt` triple per line (INAV text dumps, CSV)

use lure_proto::{Waypoint, WaypointAction};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionFormat {
    InavXml,
    QgcWpl,
    Numeric,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedMission {
    pub format: MissionFormat,
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("mission file is empty")]
    Empty,
    #[error("no waypoints found")]
    NoWaypoints,
    #[error("malformed xml: {0}")]
    Xml(String),
}

// MAVLink command ids seen in QGC files
const MAV_CMD_NAV_WAYPOINT: u32 = 16;
const MAV_CMD_NAV_LOITER_UNLIM: u32 = 17;
const MAV_CMD_NAV_LOITER_TIME: u32 = 19;
const MAV_CMD_NAV_LAND: u32 = 21;

pub fn parse_mission(text: &str, default_alt_m: f32) -> Result<ParsedMission, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if trimmed.starts_with("<?xml") || trimmed.contains("<missionitem") {
        let waypoints = parse_inav_xml(trimmed, default_alt_m)?;
        return finish(MissionFormat::InavXml, waypoints);
    }

    let qgc = parse_qgc(trimmed);
    if !qgc.is_empty() {
        return finish(MissionFormat::QgcWpl, qgc);
    }

    finish(MissionFormat::Numeric, parse_numeric(trimmed, default_alt_m))
}

fn finish(format: MissionFormat, waypoints: Vec<Waypoint>) -> Result<ParsedMission, ParseError> {
    if waypoints.is_empty() {
        return Err(ParseError::NoWaypoints);
    }
    debug!("mission parse: {:?} gave {} waypoints", format, waypoints.len());
    Ok(ParsedMission { format, waypoints })
}

fn parse_inav_xml(text: &str, default_alt_m: f32) -> Result<Vec<Waypoint>, ParseError> {
    let mut items: Vec<(i64, Waypoint)> = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("<missionitem") {
        let tag_body = &rest[start + "<missionitem".len()..];
        let end = tag_body
            .find('>')
            .ok_or_else(|| ParseError::Xml("unterminated <missionitem>".into()))?;
        let attrs = parse_attrs(&tag_body[..end]);
        rest = &tag_body[end..];

        let get = |k: &str| attrs.iter().find(|(name, _)| name.eq_ignore_ascii_case(k)).map(|(_, v)| v.as_str());

        let action = get("action").unwrap_or("WAYPOINT").to_ascii_uppercase();
        let action = match action.as_str() {
            "WAYPOINT" | "LAND" => WaypointAction::Navigate,
            "POSHOLD_TIME" | "POSHOLD_UNLIM" => WaypointAction::DropPayload,
            other => {
                debug!("mission parse: skipping non-positional item {}", other);
                continue;
            }
        };

        let (Some(lat), Some(lon)) = (
            get("lat").and_then(|v| v.parse::<f64>().ok()),
            get("lon").and_then(|v| v.parse::<f64>().ok()),
        ) else {
            debug!("mission parse: missionitem without lat/lon");
            continue;
        };
        let alt = get("alt").and_then(|v| v.parse::<f32>().ok()).unwrap_or(default_alt_m);
        let no = get("no").and_then(|v| v.parse::<i64>().ok()).unwrap_or(items.len() as i64 + 1);

        let wp = Waypoint::new(lat, lon, alt, action);
        if wp.is_valid() {
            items.push((no, wp));
        }
    }

    items.sort_by_key(|(no, _)| *no);
    Ok(items.into_iter().map(|(_, wp)| wp).collect())
}

/// `key="value"` pairs inside a tag. Single or double quotes.
fn parse_attrs(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().rsplit(char::is_whitespace).next().unwrap_or("").to_string();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let Some(close) = after[1..].find(quote) else {
            break;
        };
        out.push((key, after[1..1 + close].to_string()));
        rest = &after[close + 2..];
    }
    out
}

fn parse_qgc(text: &str) -> Vec<Waypoint> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.contains("QGC") {
            continue;
        }
        let mut parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 12 {
            parts = line.split_whitespace().collect();
        }
        if parts.len() < 12 {
            continue;
        }

        let parsed = (|| {
            let idx = parts[0].parse::<f64>().ok()? as i64;
            let cmd = parts[3].parse::<f64>().ok()? as u32;
            let lat = parts[8].parse::<f64>().ok()?;
            let lon = parts[9].parse::<f64>().ok()?;
            let alt = parts[10].parse::<f32>().ok()?;
            Some((idx, cmd, lat, lon, alt))
        })();
        let Some((idx, cmd, lat, lon, alt)) = parsed else { continue };

        // index 0 is the home position
        if idx <= 0 {
            continue;
        }
        let action = match cmd {
            MAV_CMD_NAV_LOITER_TIME | MAV_CMD_NAV_LOITER_UNLIM => WaypointAction::DropPayload,
            MAV_CMD_NAV_WAYPOINT | MAV_CMD_NAV_LAND => WaypointAction::Navigate,
            _ => continue,
        };
        let wp = Waypoint::new(lat, lon, alt, action);
        if wp.is_valid() {
            out.push(wp);
        }
    }
    out
}

fn parse_numeric(text: &str, default_alt_m: f32) -> Vec<Waypoint> {
    let mut out: Vec<Waypoint> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let nums: Vec<f64> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter_map(|t| t.parse::<f64>().ok())
            .collect();

        let found = nums.windows(3).find(|w| {
            w[0].abs() <= 90.0 && w[1].abs() <= 180.0 && (0.0..=1000.0).contains(&w[2])
        });
        let wp = match found {
            Some(w) => Waypoint::new(w[0], w[1], w[2] as f32, WaypointAction::DropPayload),
            None if nums.len() == 2 && nums[0].abs() <= 90.0 && nums[1].abs() <= 180.0 => {
                Waypoint::new(nums[0], nums[1], default_alt_m, WaypointAction::DropPayload)
            }
            None => continue,
        };
        if !out.iter().any(|w| w.lat == wp.lat && w.lon == wp.lon) {
            out.push(wp);
        }
    }
    out
}
