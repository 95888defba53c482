use clap::{CommandFactory, FromArgMatches, Parser};

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/tailfin/config.yaml";

/// Tail multiple docker containers.
#[derive(Parser, Debug, Clone)]
#[command(name = "tailfin", version, about, long_about = None)]
pub struct Args {
    /// Container name to match (regular expression).
    #[arg(value_name = "query")]
    pub query: Vec<String>,

    /// Compose project name to match (regular expression).
    #[arg(long)]
    pub compose: Vec<String>,

    /// Images to match (regular expression).
    #[arg(short = 'm', long)]
    pub image: Vec<String>,

    /// Container name to exclude (regular expression).
    #[arg(short = 'E', long)]
    pub exclude_container: Vec<String>,

    /// Log lines to exclude (regular expression).
    #[arg(short = 'e', long)]
    pub exclude: Vec<String>,

    /// Log lines to include (regular expression).
    #[arg(short = 'i', long)]
    pub include: Vec<String>,

    /// Log lines to highlight (regular expression).
    #[arg(short = 'H', long)]
    pub highlight: Vec<String>,

    /// Label query to filter on. One `key` or `key=value` per flag instance.
    #[arg(short = 'l', long)]
    pub label: Vec<String>,

    /// Exit when all logs have been shown.
    #[arg(long)]
    pub no_follow: bool,

    /// Return logs newer than a relative duration like 5s, 2m, or 3h.
    #[arg(short = 's', long, default_value = "48h")]
    pub since: String,

    /// The number of lines from the end of the logs to show. -1 shows all.
    #[arg(long, default_value_t = -1)]
    pub tail: i64,

    /// Maximum number of concurrent logs to request. Defaults to 50, but 5
    /// when specifying --no-follow.
    #[arg(long, default_value_t = -1)]
    pub max_log_requests: i64,

    /// Specify a predefined template: default, raw, json, extjson, or
    /// ppextjson.
    #[arg(short = 'o', long, default_value = "default")]
    pub output: String,

    /// Template to use for log lines, leave empty to use the --output flag.
    #[arg(long, default_value = "")]
    pub template: String,

    /// Path to a template for log lines, overrides --template.
    #[arg(short = 'T', long)]
    pub template_file: Option<std::path::PathBuf>,

    /// Print timestamps with the specified format, one of 'default' or
    /// 'short'. If specified without a value, 'default' is used.
    #[arg(
        short = 't',
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "default"
    )]
    pub timestamps: Option<String>,

    /// Set timestamps to a specific timezone.
    #[arg(long, default_value = "Local")]
    pub timezone: String,

    /// Force set color output: 'auto' colorizes if a tty is attached,
    /// 'always' and 'never' do what they say.
    #[arg(long, default_value = "auto")]
    pub color: String,

    /// Colors used to highlight the compose project, as a comma-separated
    /// list of SGR sequences, e.g. "91,92,93,94,95,96".
    #[arg(long, value_delimiter = ',')]
    pub namespace_colors: Vec<String>,

    /// Colors used to highlight container names. Defaults to the values of
    /// --namespace-colors and must match its length.
    #[arg(long, value_delimiter = ',')]
    pub container_colors: Vec<String>,

    /// Print only log lines.
    #[arg(long)]
    pub only_log_lines: bool,

    /// Path to the tailfin config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Log level. One of error, warn, info, debug, or trace.
    #[arg(long, default_value = "error")]
    pub verbosity: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Clap(#[from] clap::Error),
    #[error(transparent)]
    ConfigFile(#[from] crate::config_file::ConfigFileError),
    #[error("one of a container query, --label, or --image is required")]
    MissingQuery,
}

/// Parses the command line. Help, version, and usage errors exit through
/// clap like any CLI. The config file is folded in afterwards, once logging
/// is up, via `apply_config_and_validate`.
pub fn parse_command_line() -> Result<(clap::ArgMatches, Args), CliError> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches)?;
    Ok((matches, args))
}

/// Overrides flag defaults from the config file and checks that the result
/// names something to tail.
pub fn apply_config_and_validate(
    matches: &clap::ArgMatches,
    args: &mut Args,
) -> Result<(), CliError> {
    crate::config_file::apply(matches, args)?;
    validate(args)
}

fn validate(args: &Args) -> Result<(), CliError> {
    if args.query.is_empty() && args.label.is_empty() && args.image.is_empty() {
        return Err(CliError::MissingQuery);
    }
    Ok(())
}
