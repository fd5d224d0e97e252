//! Logging setup.
//!
//! Binaries call [`init_stdout`] once at startup to install a subscriber.
//! Library code logs through the `tracing` macros; `use
//! crate::tracing::prelude::*` brings in `trace!()` through `error!()`.
//!
//! Filtering follows `RUST_LOG` (e.g. `RUST_LOG=elx_client=debug`), with
//! INFO as the default. Frame-level protocol traffic is logged at TRACE
//! by `elx_client::electrumx`.

use std::fmt;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

const CRATE_PREFIX: &str = "elx_client::";

/// Log to stdout, filtered by `RUST_LOG` with a default of INFO.
///
/// Colors are used when stdout is a terminal. Calling this twice is
/// harmless; the second call keeps the first subscriber.
pub fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let ansi = std::io::IsTerminal::is_terminal(&std::io::stdout());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(ansi)
                .fmt_fields(DefaultFields::new())
                .event_format(CompactFormatter { ansi }),
        )
        .try_init();
}

/// One line per event: local time, level, short target, message, then
/// the structured fields as `key=value`.
struct CompactFormatter {
    ansi: bool,
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }
}

impl CompactFormatter {
    fn paint(&self, level: Level) -> (&'static str, &'static str) {
        let text = match level {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN ",
            Level::INFO => "INFO ",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        if !self.ansi {
            return ("", text);
        }
        let color = match level {
            Level::ERROR => "\x1b[31m",
            Level::WARN => "\x1b[33m",
            Level::INFO => "\x1b[32m",
            Level::DEBUG => "\x1b[34m",
            Level::TRACE => "\x1b[35m",
        };
        (color, text)
    }
}

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, level) = self.paint(*event.metadata().level());
        let reset = if self.ansi { "\x1b[0m" } else { "" };
        write!(writer, " {}{}{} ", color, level, reset)?;

        let target = event.metadata().target();
        let target = target.strip_prefix(CRATE_PREFIX).unwrap_or(target);
        write!(writer, "{}: ", target)?;

        if let Some(message) = &visitor.message {
            write!(writer, "{}", message)?;
        }
        for (key, value) in &visitor.fields {
            write!(writer, " {}={}", key, value)?;
        }

        writeln!(writer)
    }
}

// Local time to the second; the default timer prints long UTC stamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
