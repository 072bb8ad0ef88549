//! Data Normalizer
//!
//! Converts raw adapter payloads into the canonical [`NormalizedEvent`]. Every
//! protocol converges here, so the hub and the filter engine only ever see JSON.
//!
//! - `json` text is parsed; a parse failure drops the event.
//! - `text` is kept under the synthetic `_raw` field.
//! - `xml` is converted best-effort (see [`xml_to_json`]), falling back to `_raw`.
//! - `csv` becomes an array of header-keyed records.
//! - Binary frames that are not UTF-8 are kept as `_raw_base64`.

use base64::Engine;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::feed::PayloadFormat;

/// Synthetic field holding unparsed text
pub const RAW_FIELD: &str = "_raw";

/// Synthetic field holding base64-encoded binary frames
pub const RAW_BASE64_FIELD: &str = "_raw_base64";

/// A payload as emitted by a protocol adapter
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Text frame or response body, not yet decoded
    Text(String),
    /// Binary frame, not yet decoded
    Binary(Vec<u8>),
    /// Already decoded (HTTP after `dataPath`/transform, protobuf after decoding)
    Structured(Value),
}

/// The canonical event shape shared by all protocols
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub feed_id: String,
    pub event_name: String,
    /// Ingestion time
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl NormalizedEvent {
    /// Number of records carried: array length, or 1 for scalars and objects
    pub fn record_count(&self) -> usize {
        match &self.payload {
            Value::Array(items) => items.len(),
            _ => 1,
        }
    }
}

/// Per-event decode errors; the event is dropped, the connection continues
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid CSV payload: {0}")]
    InvalidCsv(#[from] csv::Error),
}

/// Build a normalized event from a raw payload
pub fn normalize(
    feed_id: &str,
    event_name: &str,
    raw: RawPayload,
    format: PayloadFormat,
) -> Result<NormalizedEvent, NormalizeError> {
    let payload = match raw {
        RawPayload::Structured(value) => value,
        RawPayload::Text(text) => decode_text(&text, format)?,
        RawPayload::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => decode_text(&text, format)?,
            Err(e) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(e.as_bytes());
                single_field(RAW_BASE64_FIELD, Value::String(encoded))
            }
        },
    };

    Ok(NormalizedEvent {
        feed_id: feed_id.to_string(),
        event_name: event_name.to_string(),
        timestamp: Utc::now(),
        payload,
    })
}

/// Decode a text body according to its declared format
pub fn decode_text(text: &str, format: PayloadFormat) -> Result<Value, NormalizeError> {
    match format {
        PayloadFormat::Json => Ok(serde_json::from_str(text)?),
        PayloadFormat::Text => Ok(single_field(RAW_FIELD, Value::String(text.to_string()))),
        PayloadFormat::Xml => Ok(xml_to_json(text)
            .unwrap_or_else(|| single_field(RAW_FIELD, Value::String(text.to_string())))),
        PayloadFormat::Csv => csv_to_records(text),
    }
}

fn single_field(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// Parse CSV text with a header row into an array of records.
///
/// Numeric cells stay strings; the filter engine coerces them when compared
/// numerically.
pub fn csv_to_records(text: &str) -> Result<Value, NormalizeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        let mut record = Map::new();
        for (index, cell) in row.iter().enumerate() {
            let key = headers
                .get(index)
                .map(str::to_string)
                .unwrap_or_else(|| format!("column_{}", index));
            record.insert(key, Value::String(cell.to_string()));
        }
        records.push(Value::Object(record));
    }

    Ok(Value::Array(records))
}

/// Convert an XML document to JSON, best-effort.
///
/// - The root element becomes the single top-level key.
/// - Attributes become `@name` keys.
/// - Child elements become keys; repeated children collapse into arrays.
/// - Text of an element without attributes or children becomes its value;
///   otherwise it is stored under `#text`.
///
/// Returns `None` if the document is malformed.
pub fn xml_to_json(text: &str) -> Option<Value> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    // Stack of (element name, attributes + children, accumulated text)
    let mut stack: Vec<(String, Map<String, Value>, String)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                let attrs = read_attributes(&start)?;
                stack.push((name, attrs, String::new()));
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                let attrs = read_attributes(&start)?;
                let value = finish_element(attrs, String::new());
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::Text(t)) => {
                let content = t.unescape().ok()?;
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(&content);
                }
            }
            Ok(Event::CData(c)) => {
                let content = String::from_utf8_lossy(&c.into_inner()).to_string();
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(&content);
                }
            }
            Ok(Event::End(_)) => {
                let (name, children, text) = stack.pop()?;
                let value = finish_element(children, text);
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    if !stack.is_empty() {
        return None;
    }

    root.map(|(name, value)| single_field(&name, value))
}

fn read_attributes(start: &quick_xml::events::BytesStart) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
        let value = attr.unescape_value().ok()?.to_string();
        map.insert(key, Value::String(value));
    }
    Some(map)
}

fn finish_element(mut children: Map<String, Value>, text: String) -> Value {
    if children.is_empty() {
        return Value::String(text);
    }
    if !text.is_empty() {
        children.insert("#text".to_string(), Value::String(text));
    }
    Value::Object(children)
}

fn attach(
    stack: &mut [(String, Map<String, Value>, String)],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) {
    match stack.last_mut() {
        Some((_, children, _)) => match children.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                children.insert(name, value);
            }
        },
        None => *root = Some((name, value)),
    }
}
