use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use minijinja::value::{Rest, Value};
use minijinja::{context, Environment, Error, ErrorKind, UndefinedBehavior};
use serde::Serialize;

use crate::color::{paint_sgr, Color};

/// The value rendered for every output line. Colors travel next to it as
/// opaque SGR handles and stay out of the serialized form.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub message: String,
    pub container: String,
    pub service: String,
    pub namespace: String,
    pub number: String,
}

/// Returns the template text for a named output preset.
pub fn preset_template(output: &str) -> Option<String> {
    let body = match output {
        "default" => {
            "{% if namespace %}{{ color(namespaceColor, namespace) }} {% endif %}\
             {{ color(containerColor, service) }} {{ message }}"
        }
        "raw" => "{{ message }}",
        "json" => "{{ json(record) }}",
        "extjson" => {
            "{\"namespace\": \"{% if namespace %}{{ color(namespaceColor, namespace) }}{% endif %}\", \
             \"service\": \"{{ color(containerColor, service) }}\", \
             \"message\": {{ extjson(message) }}}"
        }
        "ppextjson" => {
            "{\n  \"namespace\": \"{% if namespace %}{{ color(namespaceColor, namespace) }}{% endif %}\",\n  \
             \"service\": \"{{ color(containerColor, service) }}\",\n  \
             \"message\": {{ extjson(message) }}\n}"
        }
        _ => return None,
    };
    Some(format!("{body}\n"))
}

/// Compiled output template plus the helper functions it can call.
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    pub fn new(template: &str, color_enabled: bool) -> Result<Self, Error> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        register_helpers(&mut env, color_enabled);
        env.add_template_owned("log".to_string(), template.to_string())?;
        Ok(Self { env })
    }

    pub fn render(
        &self,
        record: &LogRecord,
        namespace_color: &Color,
        container_color: &Color,
    ) -> Result<String, Error> {
        let template = self.env.get_template("log")?;
        template.render(context! {
            message => &record.message,
            container => &record.container,
            service => &record.service,
            namespace => &record.namespace,
            number => &record.number,
            containerColor => container_color.as_sgr(),
            namespaceColor => namespace_color.as_sgr(),
            record => Value::from_serialize(record),
        })
    }
}

fn register_helpers(env: &mut Environment<'static>, color_enabled: bool) {
    env.add_function("color", move |sgr: String, text: Value| {
        let text = stringify(&text);
        if color_enabled {
            paint_sgr(&sgr, &text)
        } else {
            text
        }
    });

    for (name, sgr) in [
        ("colorBlack", "30"),
        ("colorRed", "31"),
        ("colorGreen", "32"),
        ("colorYellow", "33"),
        ("colorBlue", "34"),
        ("colorMagenta", "35"),
        ("colorCyan", "36"),
        ("colorWhite", "37"),
    ] {
        env.add_function(name, move |text: Value| {
            let text = stringify(&text);
            if color_enabled {
                paint_sgr(sgr, &text)
            } else {
                text
            }
        });
    }

    env.add_function("json", |value: Value| -> Result<String, Error> {
        serde_json::to_string(&value)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });

    env.add_function("parseJSON", |text: String| -> Result<Value, Error> {
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        Ok(Value::from_serialize(&parsed))
    });

    env.add_function("tryParseJSON", |text: String| -> Value {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(parsed) => Value::from_serialize(&parsed),
            Err(_) => Value::UNDEFINED,
        }
    });

    env.add_function(
        "extractJSONParts",
        |text: String, parts: Rest<String>| -> Result<String, Error> {
            extract_json_parts(&text, &parts)
                .map_err(|e| Error::new(ErrorKind::InvalidOperation, e))
        },
    );

    env.add_function(
        "tryExtractJSONParts",
        |text: String, parts: Rest<String>| -> String {
            extract_json_parts(&text, &parts).unwrap_or(text)
        },
    );

    env.add_function("extjson", |text: String| -> Result<String, Error> {
        if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
            return Ok(text.trim_end_matches('\n').to_string());
        }
        serde_json::to_string(&text)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });

    env.add_function("toRFC3339Nano", |value: Value| -> String {
        format_rfc3339_nano(to_time(&value).unwrap_or(DateTime::UNIX_EPOCH))
    });

    env.add_function("msToRFC3339Nano", |value: Value| -> String {
        format_rfc3339_nano(to_time_milli(&value).unwrap_or(DateTime::UNIX_EPOCH))
    });

    env.add_function("toUTC", |value: Value| -> String {
        format_rfc3339_nano(to_time(&value).unwrap_or(DateTime::UNIX_EPOCH))
    });

    env.add_function(
        "toTimestamp",
        |value: Value, layout: String, tz: Rest<String>| -> Result<String, Error> {
            let time = to_time(&value)
                .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "unsupported time value"))?;
            let layout = validated_layout(&layout)?;
            match tz.first().map(String::as_str) {
                None | Some("") | Some("UTC") => Ok(time.format(&layout).to_string()),
                Some("Local") => Ok(time.with_timezone(&chrono::Local).format(&layout).to_string()),
                Some(name) => {
                    let tz: chrono_tz::Tz = name.parse().map_err(|_| {
                        Error::new(ErrorKind::InvalidOperation, format!("unknown timezone {name:?}"))
                    })?;
                    Ok(time.with_timezone(&tz).format(&layout).to_string())
                }
            }
        },
    );

    env.add_function("levelColor", move |value: Value| -> String {
        let Some(level) = value.as_str() else {
            return String::new();
        };
        let sgr = match level.to_lowercase().as_str() {
            "debug" => "35",
            "info" => "34",
            "warn" | "warning" => "33",
            "error" | "dpanic" | "panic" => "31",
            "fatal" | "critical" => "36",
            _ => return level.to_string(),
        };
        if color_enabled {
            paint_sgr(sgr, level)
        } else {
            level.to_string()
        }
    });

    env.add_function("bunyanLevelColor", move |value: Value| -> String {
        let level = match i64::try_from(value.clone()) {
            Ok(n) => n,
            Err(_) => match f64::try_from(value) {
                Ok(f) => f as i64,
                Err(_) => return String::new(),
            },
        };
        let sgr = match level {
            l if l < 30 => "35",
            l if l < 40 => "34",
            l if l < 50 => "33",
            l if l < 60 => "31",
            l if l < 100 => "36",
            _ => return level.to_string(),
        };
        if color_enabled {
            paint_sgr(sgr, &level.to_string())
        } else {
            level.to_string()
        }
    });
}

fn stringify(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

fn extract_json_parts(text: &str, parts: &[String]) -> Result<String, String> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(text).map_err(|e| e.to_string())?;
    let extracted: Vec<String> = parts
        .iter()
        .map(|key| match object.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        })
        .collect();
    Ok(extracted.join(", "))
}

fn format_rfc3339_nano(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Rejects strftime layouts chrono cannot format, so a bad layout surfaces
/// as a template error instead of a formatting panic.
fn validated_layout(layout: &str) -> Result<String, Error> {
    use chrono::format::{Item, StrftimeItems};
    if StrftimeItems::new(layout).any(|item| matches!(item, Item::Error)) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid time layout {layout:?}"),
        ));
    }
    Ok(layout.to_string())
}

/// Accepts epoch seconds with an optional fractional part (string or
/// number), RFC3339 strings, and common civil representations.
fn to_time(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        return parse_time_string(s);
    }
    if let Ok(n) = i64::try_from(value.clone()) {
        return DateTime::from_timestamp(n, 0);
    }
    if let Ok(f) = f64::try_from(value.clone()) {
        return from_epoch_f64(f);
    }
    None
}

fn to_time_milli(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        let ms: i64 = s.parse().ok()?;
        return DateTime::from_timestamp_millis(ms);
    }
    if let Ok(n) = i64::try_from(value.clone()) {
        return DateTime::from_timestamp_millis(n);
    }
    if let Ok(f) = f64::try_from(value.clone()) {
        return DateTime::from_timestamp_millis(f as i64);
    }
    None
}

fn from_epoch_f64(seconds: f64) -> Option<DateTime<Utc>> {
    let secs = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9).round() as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn parse_time_string(s: &str) -> Option<DateTime<Utc>> {
    if let Some(t) = parse_unix_time_string(s) {
        return Some(t);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Epoch seconds with an optional fraction, e.g. `1136171045.123456789`.
/// The fraction is padded or truncated to nanosecond precision.
fn parse_unix_time_string(num: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = num.split('.').collect();
    if parts.len() > 2 {
        return None;
    }
    let secs: i64 = parts[0].parse().ok()?;
    let mut nanos: u32 = 0;
    if parts.len() == 2 {
        let mut frac = parts[1].to_string();
        if frac.len() > 9 {
            frac.truncate(9);
        } else {
            while frac.len() < 9 {
                frac.push('0');
            }
        }
        nanos = frac.parse().ok()?;
    }
    DateTime::from_timestamp(secs, nanos)
}
