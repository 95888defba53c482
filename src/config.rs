use std::io::IsTerminal;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use crate::cli::Args;
use crate::color::{ColorError, Palette};
use crate::options::{TailOptions, TimestampFormat, Timezone};
use crate::render::{preset_template, Renderer};
use crate::target::FilterConfig;

/// Validated runtime configuration: every regex compiled, the template
/// parsed, the since-cutoff pinned to a wall-clock instant.
pub struct TailfinConfig {
    pub options: TailOptions,
    pub filter: FilterConfig,
    pub labels: Vec<String>,
    pub max_log_requests: usize,
    pub palette: Palette,
    pub renderer: Renderer,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to compile regular expression {context}: {source}")]
    Regex {
        context: &'static str,
        source: regex::Error,
    },
    #[error("{0}")]
    Timezone(String),
    #[error("{0}")]
    TimestampFormat(String),
    #[error("invalid duration {0:?}")]
    Duration(String),
    #[error("color should be one of 'always', 'never', or 'auto'")]
    ColorMode,
    #[error(transparent)]
    Color(#[from] ColorError),
    #[error("output should be one of 'default', 'raw', 'json', 'extjson', and 'ppextjson'")]
    UnknownOutput,
    #[error("unable to read template file: {0}")]
    TemplateFile(std::io::Error),
    #[error("unable to parse template: {0}")]
    Template(#[from] minijinja::Error),
}

impl TailfinConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let name = compile_regexes(&args.query, "from query")?;
        let name_exclude = compile_regexes(&args.exclude_container, "for excluded container query")?;
        let compose = compile_regexes(&args.compose, "for compose filter")?;
        let image = compile_regexes(&args.image, "for image filter")?;
        let exclude = compile_regexes(&args.exclude, "for exclusion filter")?;
        let include = compile_regexes(&args.include, "for inclusion filter")?;
        let highlight = compile_regexes(&args.highlight, "for highlight filter")?;

        let follow = !args.no_follow;

        let since_duration = parse_duration(&args.since)?;
        let since = Utc::now()
            - chrono::Duration::from_std(since_duration)
                .map_err(|_| ConfigError::Duration(args.since.clone()))?;

        let timestamp_format = match args.timestamps.as_deref() {
            None => TimestampFormat::Default,
            Some(format) => format.parse().map_err(ConfigError::TimestampFormat)?,
        };
        let timezone: Timezone = args.timezone.parse().map_err(ConfigError::Timezone)?;

        let color_enabled = match args.color.as_str() {
            "always" => true,
            "never" => false,
            "auto" => std::io::stdout().is_terminal(),
            _ => return Err(ConfigError::ColorMode),
        };
        let palette = if args.namespace_colors.is_empty() && args.container_colors.is_empty() {
            Palette::standard(color_enabled)
        } else {
            Palette::from_sgr_lists(&args.namespace_colors, &args.container_colors, color_enabled)?
        };

        let max_log_requests = if args.max_log_requests < 0 {
            if follow {
                50
            } else {
                5
            }
        } else {
            args.max_log_requests as usize
        };

        let template = resolve_template(args)?;
        let renderer = Renderer::new(&template, color_enabled)?;

        let options = TailOptions {
            timestamps: args.timestamps.is_some(),
            timestamp_format,
            timezone,
            since,
            exclude,
            include,
            highlight,
            tail_lines: args.tail,
            follow,
            only_log_lines: args.only_log_lines,
            highlight_color: palette.highlight(),
            combined_highlight: OnceLock::new(),
        };

        Ok(Self {
            options,
            filter: FilterConfig {
                name,
                name_exclude,
                compose,
                image,
            },
            labels: args.label.clone(),
            max_log_requests,
            palette,
            renderer,
        })
    }
}

fn resolve_template(args: &Args) -> Result<String, ConfigError> {
    if let Some(path) = &args.template_file {
        return std::fs::read_to_string(path).map_err(ConfigError::TemplateFile);
    }
    if !args.template.is_empty() {
        return Ok(args.template.clone());
    }
    preset_template(&args.output).ok_or(ConfigError::UnknownOutput)
}

fn compile_regexes(patterns: &[String], context: &'static str) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|source| ConfigError::Regex { context, source }))
        .collect()
}

/// Parses durations in the `5s`, `2m`, `3h`, `1h30m`, `1.5h` style.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::Duration(input.to_string());
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(err());
    }
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(err)?;
        if digits == 0 {
            return Err(err());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| err())?;
        let unit = &rest[digits..];
        let (unit_len, unit_secs) = if unit.starts_with("ms") {
            (2, 0.001)
        } else if unit.starts_with('s') {
            (1, 1.0)
        } else if unit.starts_with('m') {
            (1, 60.0)
        } else if unit.starts_with('h') {
            (1, 3600.0)
        } else {
            return Err(err());
        };
        total += Duration::from_secs_f64(value * unit_secs);
        rest = &unit[unit_len..];
    }
    Ok(total)
}
