//! Log output setup for the daemon.
use std::{fmt, str::FromStr};

use anyhow::{Result, bail};
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    fmt::format::{Format, PrettyFields},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Directives always appended to the filter; the gRPC transport of the
/// etcd backend is chatty at debug.
const QUIET_TARGETS: [&str; 3] = ["h2=off", "tower=off", "hyper=off"];

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// single-line, unstructured
    #[default]
    Standard,
    Json,
    /// multi-line, for local debugging
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "" => Ok(Self::Standard),
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => bail!("unknown log format {other:?}, expected standard, json or pretty"),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Installed log configuration
#[derive(Debug)]
pub struct Config {
    pub format: LogFormat,
    /// filter directives in effect
    pub filter: String,
}

impl Config {
    /// Build the filter from `tether_log` (falling back to `info` when it
    /// does not parse) and install the global subscriber.
    pub fn parse(tether_log: &str, log_format: &str) -> Result<Self> {
        let format = log_format.parse::<LogFormat>()?;
        let filter = build_filter(tether_log)?;
        let directives = filter.to_string();

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .event_format(Format::default().pretty().with_source_location(false))
                .fmt_fields(PrettyFields::new())
                .boxed(),
            LogFormat::Standard => tracing_subscriber::fmt::layer().boxed(),
        };
        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()?;

        Ok(Self {
            format,
            filter: directives,
        })
    }
}

fn build_filter(tether_log: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(tether_log).or_else(|_| EnvFilter::try_new("info"))?;
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("standard".parse::<LogFormat>().unwrap(), LogFormat::Standard);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "standard");
    }

    #[test]
    fn test_filter_directives() {
        let filter = build_filter("not a [valid directive").unwrap().to_string();
        assert!(filter.contains("h2=off"));

        let filter = build_filter("coordination=debug").unwrap().to_string();
        assert!(filter.contains("coordination=debug"));
        assert!(filter.contains("tower=off"));
    }
}
