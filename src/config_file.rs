use std::collections::HashMap;
use std::path::PathBuf;

use clap::parser::ValueSource;
use clap::ArgMatches;
use log::warn;
use serde_yaml::Value;

use crate::cli::{Args, DEFAULT_CONFIG_PATH};

pub const CONFIG_ENV_VAR: &str = "TAILFINCONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to parse config file {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key:?} in the config file")]
    InvalidValue { key: String },
}

/// Overrides flag defaults from the YAML config file. Keys are the long
/// flag names; values set on the command line keep priority; unknown keys
/// only produce a warning so an old config does not break the run.
pub fn apply(matches: &ArgMatches, args: &mut Args) -> Result<(), ConfigFileError> {
    let (path, required) = resolve_path(matches, args);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => return Ok(()),
        Err(source) => {
            return Err(ConfigFileError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    apply_text(matches, args, &text, &path.display().to_string())
}

/// The explicit --config flag and $TAILFINCONFIG must exist; the default
/// path is used only when present.
fn resolve_path(matches: &ArgMatches, args: &Args) -> (PathBuf, bool) {
    if set_on_command_line(matches, "config") {
        return (expand_home(&args.config), true);
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return (expand_home(&path), true);
    }
    (expand_home(DEFAULT_CONFIG_PATH), false)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn apply_text(
    matches: &ArgMatches,
    args: &mut Args,
    text: &str,
    path: &str,
) -> Result<(), ConfigFileError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let mapping: HashMap<String, Value> =
        serde_yaml::from_str(text).map_err(|source| ConfigFileError::Yaml {
            path: path.to_string(),
            source,
        })?;

    for (key, value) in mapping {
        // A flag given on the command line has higher priority than the
        // config file.
        let overridden = |id: &str| set_on_command_line(matches, id);
        match key.as_str() {
            "compose" if !overridden("compose") => args.compose = string_list(&key, &value)?,
            "image" if !overridden("image") => args.image = string_list(&key, &value)?,
            "exclude-container" if !overridden("exclude_container") => {
                args.exclude_container = string_list(&key, &value)?
            }
            "exclude" if !overridden("exclude") => args.exclude = string_list(&key, &value)?,
            "include" if !overridden("include") => args.include = string_list(&key, &value)?,
            "highlight" if !overridden("highlight") => args.highlight = string_list(&key, &value)?,
            "label" if !overridden("label") => args.label = string_list(&key, &value)?,
            "namespace-colors" if !overridden("namespace_colors") => {
                args.namespace_colors = string_list(&key, &value)?
            }
            "container-colors" if !overridden("container_colors") => {
                args.container_colors = string_list(&key, &value)?
            }
            "no-follow" if !overridden("no_follow") => args.no_follow = boolean(&key, &value)?,
            "only-log-lines" if !overridden("only_log_lines") => {
                args.only_log_lines = boolean(&key, &value)?
            }
            "since" if !overridden("since") => args.since = string(&key, &value)?,
            "tail" if !overridden("tail") => args.tail = integer(&key, &value)?,
            "max-log-requests" if !overridden("max_log_requests") => {
                args.max_log_requests = integer(&key, &value)?
            }
            "output" if !overridden("output") => args.output = string(&key, &value)?,
            "template" if !overridden("template") => args.template = string(&key, &value)?,
            "template-file" if !overridden("template_file") => {
                args.template_file = Some(expand_home(&string(&key, &value)?))
            }
            "timestamps" if !overridden("timestamps") => {
                args.timestamps = match &value {
                    Value::Bool(true) => Some("default".to_string()),
                    Value::Bool(false) => None,
                    other => Some(string(&key, other)?),
                }
            }
            "timezone" if !overridden("timezone") => args.timezone = string(&key, &value)?,
            "color" if !overridden("color") => args.color = string(&key, &value)?,
            "verbosity" if !overridden("verbosity") => args.verbosity = string(&key, &value)?,
            "compose" | "image" | "exclude-container" | "exclude" | "include" | "highlight"
            | "label" | "namespace-colors" | "container-colors" | "no-follow"
            | "only-log-lines" | "since" | "tail" | "max-log-requests" | "output" | "template"
            | "template-file" | "timestamps" | "timezone" | "color" | "verbosity" => {
                // Known key, but the flag was given explicitly.
            }
            _ => warn!("Unknown option specified in the config file: {key}"),
        }
    }
    Ok(())
}

fn set_on_command_line(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

fn string(key: &str, value: &Value) -> Result<String, ConfigFileError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
    }
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>, ConfigFileError> {
    match value {
        Value::Sequence(items) => items.iter().map(|item| string(key, item)).collect(),
        scalar => Ok(vec![string(key, scalar)?]),
    }
}

fn boolean(key: &str, value: &Value) -> Result<bool, ConfigFileError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => s.parse().map_err(|_| ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
        _ => Err(ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
    }
}

fn integer(key: &str, value: &Value) -> Result<i64, ConfigFileError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or(ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
        Value::String(s) => s.parse().map_err(|_| ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
        _ => Err(ConfigFileError::InvalidValue {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, FromArgMatches};

    use super::*;

    fn parse(argv: &[&str]) -> (ArgMatches, Args) {
        let matches = Args::command().get_matches_from(argv);
        let args = Args::from_arg_matches(&matches).unwrap();
        (matches, args)
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        let yaml = r#"
            tail: 25
            since: 1h
            no-follow: true
            exclude:
              - noise
              - debug
            output: raw
        "#;
        apply_text(&matches, &mut args, yaml, "test.yaml").unwrap();
        assert_eq!(args.tail, 25);
        assert_eq!(args.since, "1h");
        assert!(args.no_follow);
        assert_eq!(args.exclude, vec!["noise", "debug"]);
        assert_eq!(args.output, "raw");
    }

    #[test]
    fn test_explicit_flags_keep_priority() {
        let (matches, mut args) = parse(&["tailfin", "web", "--tail", "10", "-o", "json"]);
        let yaml = "tail: 25\noutput: raw\n";
        apply_text(&matches, &mut args, yaml, "test.yaml").unwrap();
        assert_eq!(args.tail, 10);
        assert_eq!(args.output, "json");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        let yaml = "no-such-option: true\ntail: 5\n";
        apply_text(&matches, &mut args, yaml, "test.yaml").unwrap();
        assert_eq!(args.tail, 5);
    }

    #[test]
    fn test_scalar_value_for_a_list_key() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        apply_text(&matches, &mut args, "include: error\n", "test.yaml").unwrap();
        assert_eq!(args.include, vec!["error"]);
    }

    #[test]
    fn test_timestamps_accepts_bool_and_string() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        apply_text(&matches, &mut args, "timestamps: true\n", "test.yaml").unwrap();
        assert_eq!(args.timestamps.as_deref(), Some("default"));

        let (matches, mut args) = parse(&["tailfin", "web"]);
        apply_text(&matches, &mut args, "timestamps: short\n", "test.yaml").unwrap();
        assert_eq!(args.timestamps.as_deref(), Some("short"));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        let result = apply_text(&matches, &mut args, "tail: [1, 2]\n", "test.yaml");
        assert!(matches!(
            result,
            Err(ConfigFileError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_file_is_fine() {
        let (matches, mut args) = parse(&["tailfin", "web"]);
        apply_text(&matches, &mut args, "", "test.yaml").unwrap();
        assert_eq!(args.tail, -1);
    }
}
