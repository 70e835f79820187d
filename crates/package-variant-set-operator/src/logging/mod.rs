use std::path::PathBuf;

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    layer::{Layered, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

pub mod controller;
mod k8s_events;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender in {}", directory.display()))]
    InitRollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InitSubscriber { source: TryInitError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Supported periods when the log file is rolled over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, clap::Args)]
pub struct LoggingOptions {
    /// Disable console logs.
    #[arg(long, env)]
    pub console_log_disabled: bool,

    /// Format of the console logs.
    #[arg(long, env, value_enum, default_value_t)]
    pub console_log_format: LogFormat,

    /// Enable logging to files located in the specified DIRECTORY. File logs are always JSON.
    #[arg(long, env, value_name = "DIRECTORY")]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[arg(long, env, value_name = "PERIOD", value_enum, default_value_t, requires = "file_log_directory")]
    pub file_log_rotation_period: RotationPeriod,
}

type FilteredLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Initializes `tracing` logging with the log level filter taken from the environment variable
/// `env`, e.g. `PACKAGE_VARIANT_SET_OPERATOR_LOG=debug`.
///
/// If the variable is not set, the maximum log level is INFO.
pub fn initialize_logging(env: &str, app_name: &str, options: &LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_from_env(env)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let mut layers: Vec<FilteredLayer> = Vec::new();
    if !options.console_log_disabled {
        layers.push(match options.console_log_format {
            LogFormat::Plain => tracing_subscriber::fmt::layer().boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        });
    }

    if let Some(directory) = &options.file_log_directory {
        let appender = RollingFileAppender::builder()
            .rotation(options.file_log_rotation_period.into())
            .filename_prefix(app_name)
            .filename_suffix("log")
            .max_log_files(6)
            .build(directory)
            .with_context(|_| InitRollingFileAppenderSnafu {
                directory: directory.clone(),
            })?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(appender)
                .boxed(),
        );
    }

    Registry::default()
        .with(filter)
        .with(layers)
        .try_init()
        .context(InitSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match &options.file_log_directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
    Ok(())
}
