//! Payload normalization.
//!
//! Sources deliver the same information as CSV exports, HTML listing pages or
//! JSON lists. Every shape is reduced to [`RawRecord`]s here; IP validation
//! happens later, in the store.

use super::FetchFailure;
use crate::models::RawRecord;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid row pattern"));
static CELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(t[dh])[^>]*>(.*?)</t[dh]>").expect("valid cell pattern")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Csv,
    Html,
    Json,
}

/// One fetched page, exactly as the source returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub format: PayloadFormat,
    pub page: u32,
    pub body: String,
}

impl RawPayload {
    pub fn new(format: PayloadFormat, page: u32, body: impl Into<String>) -> Self {
        Self {
            format,
            page,
            body: body.into(),
        }
    }

    /// Build from an HTTP response, trusting Content-Type and sniffing otherwise.
    pub fn detect(content_type: Option<&str>, page: u32, body: String) -> Self {
        let format = match content_type.map(str::to_ascii_lowercase) {
            Some(ct) if ct.contains("json") => PayloadFormat::Json,
            Some(ct) if ct.contains("html") => PayloadFormat::Html,
            Some(ct) if ct.contains("csv") => PayloadFormat::Csv,
            _ => sniff(&body),
        };
        Self { format, page, body }
    }
}

fn sniff(body: &str) -> PayloadFormat {
    let trimmed = body.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        PayloadFormat::Json
    } else if trimmed.starts_with('<') {
        PayloadFormat::Html
    } else {
        PayloadFormat::Csv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Ip,
    AttackType,
    Country,
    Date,
}

fn column_role(header: &str) -> Option<Column> {
    let key: String = header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();

    match key.as_str() {
        "ip" | "ipaddress" | "ipaddr" | "address" | "maliciousip" | "sourceip" | "srcip" => {
            Some(Column::Ip)
        }
        "attacktype" | "attack" | "type" | "category" | "threattype" | "reason" => {
            Some(Column::AttackType)
        }
        "country" | "countrycode" | "nation" | "cc" => Some(Column::Country),
        "detectiondate" | "detectedat" | "detected" | "date" | "regdate" | "registereddate"
        | "firstseen" | "reporteddate" => Some(Column::Date),
        _ => None,
    }
}

/// Column positions when a table carries no recognizable header.
const POSITIONAL: [Column; 4] = [Column::Ip, Column::AttackType, Column::Country, Column::Date];

fn record_from_cells<'a>(
    roles: &[Option<Column>],
    cells: impl IntoIterator<Item = &'a str>,
) -> RawRecord {
    let mut record = RawRecord::default();
    for (role, cell) in roles.iter().zip(cells) {
        let cell = cell.trim();
        match role {
            Some(Column::Ip) => record.ip = cell.to_string(),
            Some(Column::AttackType) if !cell.is_empty() => {
                record.attack_type = Some(cell.to_string())
            }
            Some(Column::Country) if !cell.is_empty() => record.country = Some(cell.to_string()),
            Some(Column::Date) => record.detected_at = parse_date(cell),
            _ => {}
        }
    }
    record
}

pub fn parse(payload: &RawPayload) -> Result<Vec<RawRecord>, FetchFailure> {
    match payload.format {
        PayloadFormat::Csv => parse_csv(&payload.body),
        PayloadFormat::Html => parse_html_table(&payload.body),
        PayloadFormat::Json => parse_json_list(&payload.body),
    }
}

/// Tabular export with a header row.
pub fn parse_csv(body: &str) -> Result<Vec<RawRecord>, FetchFailure> {
    let body = body.trim_start_matches('\u{feff}');
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let roles: Vec<Option<Column>> = reader
        .headers()
        .map_err(|e| FetchFailure::MalformedPayload(format!("unreadable CSV header: {e}")))?
        .iter()
        .map(column_role)
        .collect();

    if !roles.contains(&Some(Column::Ip)) {
        return Err(FetchFailure::MalformedPayload(
            "CSV export has no IP column".to_string(),
        ));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| FetchFailure::MalformedPayload(format!("bad CSV row: {e}")))?;
        records.push(record_from_cells(&roles, row.iter()));
    }

    Ok(records)
}

/// Listing page with the records in an HTML `<table>`.
pub fn parse_html_table(body: &str) -> Result<Vec<RawRecord>, FetchFailure> {
    if !body.to_ascii_lowercase().contains("<table") {
        return Err(FetchFailure::MalformedPayload(
            "HTML page has no table".to_string(),
        ));
    }

    let mut roles: Option<Vec<Option<Column>>> = None;
    let mut records = Vec::new();

    for row in ROW_RE.captures_iter(body) {
        let cells: Vec<(bool, String)> = CELL_RE
            .captures_iter(&row[1])
            .map(|cell| (cell[1].eq_ignore_ascii_case("th"), cell_text(&cell[2])))
            .collect();
        if cells.is_empty() {
            continue;
        }

        if roles.is_none() {
            let header: Vec<Option<Column>> = cells.iter().map(|(_, text)| column_role(text)).collect();
            let is_header = cells.iter().all(|(th, _)| *th) || header.contains(&Some(Column::Ip));
            if is_header {
                roles = Some(header);
                continue;
            }
            roles = Some(POSITIONAL.iter().copied().map(Some).collect());
        }

        let roles = roles.as_deref().unwrap_or_default();
        // "No data" placeholder rows span the whole table
        if cells.len() == 1 && roles.len() > 1 {
            continue;
        }
        records.push(record_from_cells(roles, cells.iter().map(|(_, text)| text.as_str())));
    }

    Ok(records)
}

fn cell_text(html: &str) -> String {
    TAG_RE
        .replace_all(html, "")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// JSON array of records, bare or wrapped in `data`/`items`/`results`/`rows`.
pub fn parse_json_list(body: &str) -> Result<Vec<RawRecord>, FetchFailure> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchFailure::MalformedPayload(format!("invalid JSON: {e}")))?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => ["data", "items", "results", "rows"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .ok_or_else(|| {
                FetchFailure::MalformedPayload("JSON object has no record list".to_string())
            })?,
        _ => {
            return Err(FetchFailure::MalformedPayload(
                "JSON payload is not a list".to_string(),
            ))
        }
    };

    Ok(items.iter().map(record_from_json).collect())
}

fn record_from_json(item: &Value) -> RawRecord {
    let Value::Object(map) = item else {
        return RawRecord::new(json_text(item));
    };

    let mut record = RawRecord::default();
    for (key, value) in map {
        match column_role(key) {
            Some(Column::Ip) => record.ip = json_text(value),
            Some(Column::AttackType) => {
                record.attack_type = value.as_str().map(str::to_string)
            }
            Some(Column::Country) => record.country = value.as_str().map(str::to_string),
            Some(Column::Date) => {
                record.detected_at = match value {
                    Value::String(s) => parse_date(s),
                    Value::Number(n) => n.as_i64().and_then(from_epoch),
                    _ => None,
                }
            }
            None => {}
        }
    }
    record
}

/// Strings as-is; anything else in its JSON form so validation rejects it.
fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Millisecond timestamps are past year 5138 when read as seconds
    let secs = if value > 100_000_000_000 { value / 1000 } else { value };
    Utc.timestamp_opt(secs, 0).single()
}

/// Parse the date formats sources are known to use. Dates without a time are
/// taken as midnight UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(at.and_utc());
        }
    }

    for format in ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d", "%Y.%m.%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|at| at.and_utc());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_csv_with_aliased_headers() {
        let body = "\u{feff}IP Address,Attack Type,Country,Reg Date\n\
                    203.0.113.5,SSH brute force,KR,2024-01-01\n\
                    198.51.100.7,,,\n";
        let records = parse_csv(body).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, "203.0.113.5");
        assert_eq!(records[0].attack_type.as_deref(), Some("SSH brute force"));
        assert_eq!(records[0].country.as_deref(), Some("KR"));
        assert_eq!(records[0].detected_at, Some(day(2024, 1, 1)));
        assert_eq!(records[1], RawRecord::new("198.51.100.7"));
    }

    #[test]
    fn test_parse_csv_without_ip_column_is_malformed() {
        let err = parse_csv("name,value\nfoo,bar\n").unwrap_err();
        assert!(matches!(err, FetchFailure::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_html_table_with_header() {
        let body = r##"
            <html><body><table class="list">
              <thead><tr><th>No</th><th>IP</th><th>Country</th><th>Detected</th></tr></thead>
              <tbody>
                <tr><td>1</td><td><a href="#">203.0.113.5</a></td><td>US</td><td>2024.01.05</td></tr>
                <tr><td>2</td><td>198.51.100.7&nbsp;</td><td></td><td></td></tr>
              </tbody>
            </table></body></html>"##;
        let records = parse_html_table(body).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, "203.0.113.5");
        assert_eq!(records[0].country.as_deref(), Some("US"));
        assert_eq!(records[0].detected_at, Some(day(2024, 1, 5)));
        assert_eq!(records[1].ip, "198.51.100.7");
        assert_eq!(records[1].country, None);
    }

    #[test]
    fn test_parse_html_table_skips_placeholder_rows() {
        let body = r#"<table><tr><th>IP</th><th>Type</th></tr>
                      <tr><td colspan="2">No data</td></tr></table>"#;
        assert!(parse_html_table(body).unwrap().is_empty());
    }

    #[test]
    fn test_parse_html_without_table_is_malformed() {
        let err = parse_html_table("<html><form id=\"login\"></form></html>").unwrap_err();
        assert!(matches!(err, FetchFailure::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_json_wrapped_list() {
        let body = r#"{"total": 3, "data": [
            {"ip": "203.0.113.5", "attackType": "scan", "countryCode": "cn", "detected_at": "2024-01-05T10:00:00Z"},
            {"ip_address": "198.51.100.7", "reg_date": 1704067200},
            {"ip": 12345}
        ]}"#;
        let records = parse_json_list(body).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].attack_type.as_deref(), Some("scan"));
        assert_eq!(records[0].country.as_deref(), Some("cn"));
        assert_eq!(
            records[0].detected_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap())
        );
        assert_eq!(records[1].ip, "198.51.100.7");
        assert_eq!(records[1].detected_at, Some(day(2024, 1, 1)));
        assert_eq!(records[2].ip, "12345");
    }

    #[test]
    fn test_parse_json_bare_strings() {
        let records = parse_json_list(r#"["203.0.113.5", null]"#).unwrap();
        assert_eq!(records[0].ip, "203.0.113.5");
        assert_eq!(records[1].ip, "null");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("20240101"), Some(day(2024, 1, 1)));
        assert_eq!(parse_date("2024/01/01"), Some(day(2024, 1, 1)));
        assert_eq!(
            parse_date("2024-01-01 12:30:00"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap())
        );
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_detect_sniffs_missing_content_type() {
        assert_eq!(RawPayload::detect(None, 1, "[]".into()).format, PayloadFormat::Json);
        assert_eq!(RawPayload::detect(None, 1, "<table>".into()).format, PayloadFormat::Html);
        assert_eq!(RawPayload::detect(None, 1, "ip\n".into()).format, PayloadFormat::Csv);
        assert_eq!(
            RawPayload::detect(Some("text/csv; charset=utf-8"), 1, "<x>".into()).format,
            PayloadFormat::Csv
        );
    }
}
