//! Decoders for the JSON documents published by package build servers.
//!
//! Three shapes are read, one per level of the server tree:
//! the server document (`data/.data.json`, group index under `masternames`),
//! the group document (`data/<group>/.data.json`, build index under `builds`)
//! and the build document (`data/<group>/<build>/.data.json`, per-port results
//! under `ports`). All functions are pure and fail with a [`ParseError`]
//! naming the offending field instead of returning partial data.

use std::collections::BTreeSet;

use buildsdb_core::{BuildSummary, DetailCategory, DetailRecord, EpochSecs};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "buildsdb-documents";

/// Key in the build index that aliases the newest build.
pub const LATEST_KEY: &str = "latest";

/// Ports key that is recognized but not stored.
pub const TOBUILD_KEY: &str = "tobuild";

const PLACEHOLDER_MARKERS: [&str; 2] = ["<html", "<!doctype html"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON is not an object while reading '{field}'")]
    NotAnObject { field: String },
    #[error("JSON is not an array while reading '{field}'")]
    NotAnArray { field: String },
    #[error("JSON object doesn't contain the field '{field}'")]
    MissingField { field: String },
    #[error("invalid value for the field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("invalid record: {field} mismatches (expected '{expected}', found '{found}')")]
    Mismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[error("unknown key '{key}' found in the ports record")]
    UnknownPortsKey { key: String },
    #[error("in '{key}': {source}")]
    Entry {
        key: String,
        #[source]
        source: Box<ParseError>,
    },
}

impl ParseError {
    fn in_entry(key: impl Into<String>) -> impl FnOnce(ParseError) -> ParseError {
        let key = key.into();
        move |source| ParseError::Entry {
            key,
            source: Box::new(source),
        }
    }
}

/// True when the body is an HTML page served in place of the JSON document.
pub fn is_placeholder(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let head = &body[start..];
    PLACEHOLDER_MARKERS.iter().any(|marker| {
        head.len() >= marker.len() && head[..marker.len()].eq_ignore_ascii_case(marker.as_bytes())
    })
}

pub fn decode_document(body: &[u8]) -> Result<JsonValue, ParseError> {
    Ok(serde_json::from_slice(body)?)
}

fn as_object<'a>(value: &'a JsonValue, field: &str) -> Result<&'a Map<String, JsonValue>, ParseError> {
    value.as_object().ok_or_else(|| ParseError::NotAnObject {
        field: field.to_string(),
    })
}

fn field<'a>(obj: &'a Map<String, JsonValue>, name: &str) -> Result<&'a JsonValue, ParseError> {
    obj.get(name).ok_or_else(|| ParseError::MissingField {
        field: name.to_string(),
    })
}

fn text(obj: &Map<String, JsonValue>, name: &str) -> Result<String, ParseError> {
    match field(obj, name)? {
        JsonValue::String(s) => Ok(s.clone()),
        other => Err(ParseError::InvalidField {
            field: name.to_string(),
            reason: format!("expected a string, found {other}"),
        }),
    }
}

fn parse_unsigned(name: &str, raw: &str) -> Result<u64, ParseError> {
    raw.trim().parse::<u64>().map_err(|e| ParseError::InvalidField {
        field: name.to_string(),
        reason: format!("'{raw}' is not an unsigned number ({e})"),
    })
}

/// Unsigned number published as a numeric string (plain JSON integers are
/// accepted too). `empty` is substituted for an empty string when given.
fn unsigned(value: &JsonValue, name: &str, empty: Option<u64>) -> Result<u64, ParseError> {
    match value {
        JsonValue::String(s) if s.trim().is_empty() => empty.ok_or_else(|| ParseError::InvalidField {
            field: name.to_string(),
            reason: "empty value".to_string(),
        }),
        JsonValue::String(s) => parse_unsigned(name, s),
        JsonValue::Number(n) => n.as_u64().ok_or_else(|| ParseError::InvalidField {
            field: name.to_string(),
            reason: format!("{n} is not an unsigned integer"),
        }),
        other => Err(ParseError::InvalidField {
            field: name.to_string(),
            reason: format!("expected a numeric string, found {other}"),
        }),
    }
}

fn epoch(value: &JsonValue, name: &str) -> Result<EpochSecs, ParseError> {
    let secs = unsigned(value, name, None)?;
    EpochSecs::try_from(secs).map_err(|_| ParseError::InvalidField {
        field: name.to_string(),
        reason: format!("{secs} is out of range"),
    })
}

fn elapsed(obj: &Map<String, JsonValue>, name: &str, empty: Option<u64>) -> Result<u32, ParseError> {
    let secs = unsigned(field(obj, name)?, name, empty)?;
    u32::try_from(secs).map_err(|_| ParseError::InvalidField {
        field: name.to_string(),
        reason: format!("{secs} is out of range"),
    })
}

/// Group names listed by a server document.
pub fn parse_group_index(doc: &JsonValue) -> Result<Vec<String>, ParseError> {
    let obj = as_object(doc, "server document")?;
    let groups = as_object(field(obj, "masternames")?, "masternames")?;
    Ok(groups.keys().cloned().collect())
}

pub fn parse_build_summary(value: &JsonValue) -> Result<BuildSummary, ParseError> {
    let obj = as_object(value, "build summary")?;
    let ended = match obj.get("ended") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(epoch(v, "ended")?).filter(|secs| *secs != 0),
    };
    Ok(BuildSummary {
        buildname: text(obj, "buildname")?,
        jailname: text(obj, "jailname")?,
        started: epoch(field(obj, "started")?, "started")?,
        ended,
        status: text(obj, "status")?,
    })
}

/// Build summaries listed by a group document; the `latest` alias is dropped.
pub fn parse_build_index(doc: &JsonValue, group: &str) -> Result<Vec<BuildSummary>, ParseError> {
    let obj = as_object(doc, "group document")?;
    let builds = as_object(field(obj, "builds")?, "builds")?;
    builds
        .iter()
        .filter(|(key, _)| key.as_str() != LATEST_KEY)
        .map(|(key, value)| {
            parse_build_summary(value).map_err(ParseError::in_entry(format!("{group}/{key}")))
        })
        .collect()
}

fn expect_equal(obj: &Map<String, JsonValue>, name: &str, expected: &str) -> Result<(), ParseError> {
    let found = text(obj, name)?;
    if found != expected {
        return Err(ParseError::Mismatch {
            field: name.to_string(),
            expected: expected.to_string(),
            found,
        });
    }
    Ok(())
}

fn decode_record(category: DetailCategory, value: &JsonValue) -> Result<DetailRecord, ParseError> {
    let obj = as_object(value, category.as_str())?;
    let origin = text(obj, "origin")?;
    let pkgname = text(obj, "pkgname")?;
    let record = match category {
        DetailCategory::Queued => DetailRecord::Queued {
            origin,
            pkgname,
            reason: text(obj, "reason")?,
        },
        DetailCategory::Built => DetailRecord::Built {
            origin,
            pkgname,
            elapsed: elapsed(obj, "elapsed", None)?,
        },
        // A port failing in the starting phase has no elapsed time yet.
        DetailCategory::Failed => DetailRecord::Failed {
            origin,
            pkgname,
            phase: text(obj, "phase")?,
            errortype: text(obj, "errortype")?,
            elapsed: elapsed(obj, "elapsed", Some(0))?,
        },
        DetailCategory::Ignored => DetailRecord::Ignored {
            origin,
            pkgname,
            reason: text(obj, "reason")?,
        },
        DetailCategory::Skipped => DetailRecord::Skipped {
            origin,
            pkgname,
            depends: text(obj, "depends")?,
        },
    };
    Ok(record)
}

/// Per-port records of a build document, validated against the summary the
/// group index already reported for it.
pub fn parse_build_detail(
    doc: &JsonValue,
    group: &str,
    summary: &BuildSummary,
) -> Result<Vec<DetailRecord>, ParseError> {
    let obj = as_object(doc, "build document")?;
    expect_equal(obj, "mastername", group)?;
    expect_equal(obj, "buildname", &summary.buildname)?;
    expect_equal(obj, "jailname", &summary.jailname)?;

    let ports = match obj.get("ports") {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(ports) => ports,
    };
    let ports = as_object(ports, "ports")?;

    let mut records = Vec::new();
    for (key, value) in ports {
        if key == TOBUILD_KEY {
            continue;
        }
        let category = DetailCategory::from_key(key).ok_or_else(|| ParseError::UnknownPortsKey {
            key: key.clone(),
        })?;
        let items = value.as_array().ok_or_else(|| ParseError::NotAnArray { field: key.clone() })?;
        records.reserve(items.len());
        for (i, item) in items.iter().enumerate() {
            records.push(decode_record(category, item).map_err(ParseError::in_entry(format!("{key}[{i}]")))?);
        }
    }
    Ok(records)
}

fn started_after(obj: &Map<String, JsonValue>, cutoff: EpochSecs) -> bool {
    match obj.get("started") {
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v > cutoff as f64),
        Some(JsonValue::String(s)) => s.trim().parse::<i64>().is_ok_and(|v| v > cutoff),
        _ => false,
    }
}

fn collect_servers(value: &JsonValue, cutoff: EpochSecs, out: &mut BTreeSet<String>) {
    match value {
        JsonValue::Object(obj) => {
            if started_after(obj, cutoff) {
                if let Some(JsonValue::String(server)) = obj.get("server") {
                    if !server.trim().is_empty() {
                        out.insert(server.trim().to_string());
                    }
                }
            }
            for child in obj.values() {
                collect_servers(child, cutoff, out);
            }
        }
        JsonValue::Array(items) => {
            for child in items {
                collect_servers(child, cutoff, out);
            }
        }
        _ => {}
    }
}

/// Names of servers that started a build after `cutoff`, sorted and unique.
/// Any object anywhere in the status document carrying `started` and
/// `server` counts.
pub fn parse_server_list(doc: &JsonValue, cutoff: EpochSecs) -> Vec<String> {
    let mut servers = BTreeSet::new();
    collect_servers(doc, cutoff, &mut servers);
    servers.into_iter().collect()
}
