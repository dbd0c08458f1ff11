use chrono::Local;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Event formatter printing `[HH:MM:SS.mmm] LEVEL message`, with the whole
/// line colored by severity so worker noise stands apart from the reports.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let mut line = format!("[{}] {:<5} ", Local::now().format("%H:%M:%S%.3f"), level);
        ctx.format_fields(Writer::new(&mut line), event)?;

        let colored_line = match level {
            Level::ERROR => line.red().bold(),
            Level::WARN => line.yellow(),
            Level::INFO => line.normal(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };
        writeln!(writer, "{}", colored_line)
    }
}

/// Filter from `RUST_LOG`, falling back to `info` (or `debug` when verbose)
pub fn env_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber; later calls are ignored
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .event_format(ColorizedFormatter)
        .try_init();
}
