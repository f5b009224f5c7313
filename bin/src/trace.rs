//! tracing configuration
use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use crate::cli::LogFormat;

/// Install the global subscriber. `coord_log` is an `EnvFilter` directive
/// string; an invalid one falls back to `info`.
pub fn init(coord_log: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(coord_log)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("h2=off".parse()?)
        .add_directive("tower=off".parse()?);

    // logs go to stderr, stdout carries command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new())
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogFormat::Standard => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
