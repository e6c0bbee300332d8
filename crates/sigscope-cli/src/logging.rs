use std::{io, panic, path::PathBuf};

use color_eyre::config::{EyreHook, HookBuilder, PanicHook};
use eyre::Result;
use strip_ansi_escapes::Writer;
use tracing::{error, level_filters::LevelFilter};
use tracing_appender::rolling::RollingFileAppender;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::{config::Config, paths::get_logs_dir};

const LOG_ENV_VAR: &str = "SIGSCOPE_LOG";

struct StripAnsiWriter {
    dir: PathBuf,
    filename: String,
}

impl StripAnsiWriter {
    fn new(dir: PathBuf, filename: &str) -> Self {
        Self {
            dir,
            filename: filename.to_owned(),
        }
    }
}

impl<'a> MakeWriter<'a> for StripAnsiWriter {
    type Writer = Writer<RollingFileAppender>;

    fn make_writer(&'a self) -> Self::Writer {
        Writer::new(tracing_appender::rolling::never(&self.dir, &self.filename))
    }
}

/// Setup logging for the cli
///
/// Logs go to stderr so command output on stdout stays pipeable.
pub fn setup_logging(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV_VAR)
        .with_regex(false)
        .parse(&config.log.level)?;

    let stderr_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(io::stderr)
        .without_time()
        .with_ansi(true)
        .with_target(config.log.targets);

    // a log writer which also strips ansi, because the panic hook outputs ansi into the normal stream
    let log_layer = if config.log.file {
        let log_writer = StripAnsiWriter::new(get_logs_dir()?, "sigscope.log");

        let layer = tracing_subscriber::fmt::Layer::default()
            .with_writer(log_writer)
            .with_ansi(false)
            .with_target(config.log.targets);

        Some(layer)
    } else {
        None
    };

    Registry::default()
        .with(stderr_layer)
        .with(log_layer)
        .with(ErrorLayer::default())
        .with(env_filter)
        .init();

    let (panic_hook, eyre_hook) = report_hooks();

    eyre_hook.install()?;
    set_panic_hook(panic_hook);

    Ok(())
}

fn report_hooks() -> (PanicHook, EyreHook) {
    HookBuilder::default()
        .add_issue_metadata("version", env!("CARGO_PKG_VERSION"))
        .into_hooks()
}

fn set_panic_hook(hook: PanicHook) {
    // this panic hook makes sure that eyre panic hook gets sent to all tracing layers
    panic::set_hook(Box::new(move |info| {
        let panic = hook.panic_report(info);
        error!("{panic}");
    }))
}
