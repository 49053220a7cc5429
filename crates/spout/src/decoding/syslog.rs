//! Syslog lines: RFC 5424 first, RFC 3164 when the line is not 5424.
//!
//! Only the header grammar is enforced. Anything after the header is the
//! message, verbatim.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::text;
use crate::error::DecodeError;

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1",
    "local2", "local3", "local4", "local5", "local6", "local7",
];

const SEVERITIES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const NIL: &str = "-";

pub(super) fn decode(
    payload: &[u8],
    lossy: bool,
    received_at: DateTime<Utc>,
) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let text = text(payload, lossy)?;
    let line = text.trim_end_matches(['\r', '\n']);

    let (pri, rest) = parse_pri(line).map_err(DecodeError::Syslog)?;
    let mut fields = Map::new();
    fields.insert("facility".into(), Value::from(FACILITIES[(pri / 8) as usize]));
    fields.insert("severity".into(), Value::from(SEVERITIES[(pri % 8) as usize]));

    match parse_rfc5424(rest, &mut fields) {
        Ok(()) => {}
        Err(reason) => {
            tracing::trace!(reason, "Not RFC 5424, trying RFC 3164");
            parse_rfc3164(rest, received_at, &mut fields);
        }
    }
    Ok(vec![fields])
}

fn parse_pri(line: &str) -> Result<(u8, &str), String> {
    let rest = line
        .strip_prefix('<')
        .ok_or_else(|| "missing priority".to_string())?;
    let end = rest
        .find('>')
        .ok_or_else(|| "unterminated priority".to_string())?;
    let digits = &rest[..end];
    if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid priority {digits:?}"));
    }
    match digits.parse::<u8>() {
        Ok(pri) if pri <= 191 => Ok((pri, &rest[end + 1..])),
        _ => Err(format!("priority {digits} out of range")),
    }
}

/// Next space-separated header field. A field never contains a space.
fn header_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let (field, tail) = rest.split_once(' ')?;
    if field.is_empty() {
        return None;
    }
    *rest = tail;
    Some(field)
}

fn insert_unless_nil(fields: &mut Map<String, Value>, key: &str, value: &str) {
    if value != NIL {
        fields.insert(key.to_string(), Value::from(value));
    }
}

/// `VERSION SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP MSGID SP SD [SP MSG]`
fn parse_rfc5424(line: &str, fields: &mut Map<String, Value>) -> Result<(), &'static str> {
    let mut rest = line;
    let version = header_field(&mut rest).ok_or("missing version")?;
    if version != "1" {
        return Err("unsupported version");
    }
    let timestamp = header_field(&mut rest).ok_or("missing timestamp")?;
    let timestamp = if timestamp == NIL {
        None
    } else {
        Some(
            DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| "invalid timestamp")?
                .with_timezone(&Utc),
        )
    };
    let hostname = header_field(&mut rest).ok_or("missing hostname")?;
    let appname = header_field(&mut rest).ok_or("missing app-name")?;
    let procid = header_field(&mut rest).ok_or("missing procid")?;
    let msgid = header_field(&mut rest).ok_or("missing msgid")?;
    let (structured, rest) = parse_structured_data(rest)?;
    let message = match rest {
        "" => None,
        _ => Some(
            rest.strip_prefix(' ')
                .ok_or("missing space before message")?,
        ),
    };

    fields.insert("version".into(), Value::from(1));
    if let Some(ts) = timestamp {
        fields.insert(
            "timestamp".into(),
            Value::from(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }
    insert_unless_nil(fields, "hostname", hostname);
    insert_unless_nil(fields, "appname", appname);
    if procid != NIL {
        let value = procid
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(procid));
        fields.insert("procid".into(), value);
    }
    insert_unless_nil(fields, "msgid", msgid);
    for (id, params) in structured {
        fields.insert(id, Value::Object(params));
    }
    if let Some(message) = message {
        fields.insert(
            "message".into(),
            Value::from(message.trim_start_matches('\u{FEFF}')),
        );
    }
    Ok(())
}

type Element = (String, Map<String, Value>);

fn parse_structured_data(line: &str) -> Result<(Vec<Element>, &str), &'static str> {
    if let Some(rest) = line.strip_prefix(NIL) {
        return Ok((Vec::new(), rest));
    }
    if !line.starts_with('[') {
        return Err("missing structured data");
    }

    let mut elements = Vec::new();
    let mut rest = line;
    while let Some(body) = rest.strip_prefix('[') {
        let id_end = body
            .find([' ', ']'])
            .ok_or("unterminated structured data")?;
        let id = &body[..id_end];
        if id.is_empty() {
            return Err("empty SD-ID");
        }
        let mut params = Map::new();
        let mut cursor = &body[id_end..];
        loop {
            if let Some(after) = cursor.strip_prefix(']') {
                rest = after;
                break;
            }
            let param = cursor.strip_prefix(' ').ok_or("malformed SD-PARAM")?;
            let (name, value_start) = param.split_once("=\"").ok_or("malformed SD-PARAM")?;
            let (value, after) = parse_param_value(value_start)?;
            params.insert(name.to_string(), Value::from(value));
            cursor = after;
        }
        elements.push((id.to_string(), params));
    }
    Ok((elements, rest))
}

/// Reads up to the closing quote, resolving `\"`, `\\` and `\]`.
fn parse_param_value(s: &str) -> Result<(String, &str), &'static str> {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &s[i + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\\' | ']'))) => value.push(escaped),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => break,
            },
            _ => value.push(c),
        }
    }
    Err("unterminated SD-PARAM value")
}

/// `Mmm dd hh:mm:ss HOSTNAME TAG[PID]: MSG`, every part after the priority optional.
fn parse_rfc3164(line: &str, received_at: DateTime<Utc>, fields: &mut Map<String, Value>) {
    let mut rest = line.trim_start();

    if let Some((timestamp, after)) = parse_bsd_timestamp(rest, received_at) {
        fields.insert(
            "timestamp".into(),
            Value::from(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        rest = after.trim_start();
        if let Some((hostname, after)) = rest.split_once(' ')
            && !hostname.is_empty()
            && !hostname.ends_with(':')
        {
            fields.insert("hostname".into(), Value::from(hostname));
            rest = after;
        }
    }

    if let Some((tag, after)) = rest.split_once(':')
        && !tag.is_empty()
        && !tag.contains(' ')
    {
        let (appname, procid) = match tag.split_once('[') {
            Some((name, pid)) => (name, pid.strip_suffix(']')),
            None => (tag, None),
        };
        fields.insert("appname".into(), Value::from(appname));
        if let Some(procid) = procid {
            let value = procid
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(procid));
            fields.insert("procid".into(), value);
        }
        rest = after.strip_prefix(' ').unwrap_or(after);
    }

    fields.insert("message".into(), Value::from(rest));
}

/// BSD timestamps carry no year: take the arrival year, or the one before when
/// that would put the line more than a day in the future.
fn parse_bsd_timestamp(s: &str, received_at: DateTime<Utc>) -> Option<(DateTime<Utc>, &str)> {
    let month = MONTHS.iter().position(|m| s.starts_with(m))? as u32 + 1;
    let rest = s.get(3..)?.trim_start();
    let (day, rest) = rest.split_once(' ')?;
    let day: u32 = day.parse().ok()?;
    let (time, rest) = match rest.split_once(' ') {
        Some((time, rest)) => (time, rest),
        None => (rest, ""),
    };
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;

    let at_year = |year| {
        NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(time).and_utc())
    };
    let year = received_at.year();
    let mut timestamp = at_year(year)?;
    if timestamp > received_at + Duration::days(1) {
        timestamp = at_year(year - 1)?;
    }
    Some((timestamp, rest))
}
