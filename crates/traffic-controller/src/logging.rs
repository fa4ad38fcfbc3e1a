use anyhow::Result;
use std::io::IsTerminal;
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use crate::config::LogFormat;

pub fn init_logging(level: &str, format: &LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    // Inside a pod stderr is not a terminal; auto picks JSON there.
    let json = match format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stderr().is_terminal(),
    };
    if json {
        tracing_subscriber::registry().with(env).with(base.json()).try_init()?;
    } else {
        tracing_subscriber::registry().with(env).with(base.compact()).try_init()?;
    }
    Ok(())
}
