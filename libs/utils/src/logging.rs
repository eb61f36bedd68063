use anyhow::Context;
use strum_macros::{EnumString, VariantNames};

#[derive(EnumString, strum_macros::Display, VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
    Test,
}

/// Where the logging should output to.
#[derive(Clone, Copy)]
pub enum Output {
    Stdout,
    Stderr,
}

fn rust_log_env_filter(default: &str) -> tracing_subscriber::EnvFilter {
    // We fall back to printing all events at `default` level or above if
    // the RUST_LOG environment variable is not set.
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
}

fn build_subscriber(
    log_format: LogFormat,
    output: Output,
    default_filter: &str,
) -> impl tracing::Subscriber + Send + Sync {
    use tracing_subscriber::prelude::*;

    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn std::io::Write> {
            match output {
                Output::Stdout => Box::new(std::io::stdout()),
                Output::Stderr => Box::new(std::io::stderr()),
            }
        });
    let log_layer = match log_format {
        LogFormat::Json => log_layer.json().boxed(),
        LogFormat::Plain => log_layer.boxed(),
        LogFormat::Test => log_layer.with_test_writer().boxed(),
    };
    tracing_subscriber::registry().with(log_layer.with_filter(rust_log_env_filter(default_filter)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    use tracing_subscriber::util::SubscriberInitExt;

    build_subscriber(log_format, output, "info")
        .try_init()
        .context("install global tracing subscriber")
}

/// Test flavour of [`init`]: captured by the test harness, defaults to
/// `debug`, and tolerates being called from many tests in one process.
pub fn init_for_tests() {
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = build_subscriber(LogFormat::Test, Output::Stderr, "debug").try_init();
}

/// Route panics through tracing so they land in the same log stream.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicHookInfo) {
    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<dyn Any>",
        },
    };

    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::capture();

    let _entered = match info.location() {
        Some(location) => tracing::error_span!(
            "panic",
            %thread,
            location = %format_args!("{}:{}:{}", location.file(), location.line(), location.column())
        ),
        None => tracing::error_span!("panic", %thread),
    }
    .entered();

    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        tracing::error!("{msg}\n\nStack backtrace:\n{backtrace}");
    } else {
        tracing::error!("{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_names() {
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn init_for_tests_is_reentrant() {
        init_for_tests();
        init_for_tests();
        tracing::info!("still logging");
    }
}
