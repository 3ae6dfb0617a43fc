//! Logging setup and helpers.
use tracing::Subscriber;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter, Layer};

/// The error type returned when building a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum BuildSubscriberError {
    #[error("failed to parse filtering directive")]
    Parse(#[from] tracing_subscriber::filter::ParseError),
}

/// Build a tracing subscriber.
///
/// Filtering follows `RUST_LOG` when it is set and defaults to `info`.
pub fn build_subscriber() -> Result<impl Subscriber + Send + Sync, BuildSubscriberError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    Ok(tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter)))
}

/// Log an error at the ERROR level, recording its `Display` output as
/// `error.message` and its `Debug` output as `error.details`. Extra fields and
/// a message may follow the error, as with `tracing::error!`.
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error.message = %$error, error.details = ?$error)
    };
    ($error:expr, $($arg:tt)+) => {
        tracing::error!(error.message = %$error, error.details = ?$error, $($arg)+)
    };
}

/// Closure form of `log_error!`, meant for `Result::inspect_err`.
macro_rules! as_error {
    () => {
        |error| $crate::utils::o11y::logging::log_error!(error)
    };
    ($($arg:tt)+) => {
        |error| $crate::utils::o11y::logging::log_error!(error, $($arg)+)
    };
}

pub(crate) use as_error;
pub(crate) use log_error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_builds_with_default_filter() {
        assert!(build_subscriber().is_ok());
    }

    #[test]
    fn macros_accept_errors_and_fields() {
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        log_error!(error);
        log_error!(error, topic = "orders", "failed");
        let result: Result<(), std::io::Error> = Err(error);
        let _ = result.inspect_err(as_error!("failed to read"));
    }
}
