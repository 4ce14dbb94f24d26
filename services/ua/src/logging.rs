//! Log output in the `[timestamp] [component] [level] message` layout.

use crate::config::LoggingConfig;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Crates whose level follows the configured one
const CHANNEL_CRATES: [&str; 3] = ["ua_wire", "ua_channel", "ua_securechannel"];

/// Formats events as `[timestamp] [component] [level] message`
pub struct ChannelLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with an explicit component column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Warn with an explicit component column
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

impl ChannelLogFormatter {
    /// Formatter naming non-channel events after `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Force colors on or off
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    /// Component column: the `component` field, else the emitting crate
    fn component_name(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => {
                let krate = target.split("::").next().unwrap_or(target);
                if CHANNEL_CRATES.contains(&krate) {
                    krate.replace('_', "-")
                } else {
                    self.service_name.clone()
                }
            }
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        // +2 for the icon
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    /// Render one line without the trailing newline
    fn render(
        &self,
        timestamp: &str,
        level: &tracing::Level,
        target: &str,
        fields: &FieldVisitor,
    ) -> String {
        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };
        format!(
            "{}[{}] [{}] [{}{}{}] {}{}",
            cyan,
            timestamp,
            self.component_name(fields.component.as_deref(), target),
            color,
            self.format_log_level(level),
            reset,
            fields.message,
            reset
        )
    }
}

impl<S, N> FormatEvent<S, N> for ChannelLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(
            writer,
            "{}",
            self.render(&timestamp, metadata.level(), metadata.target(), &visitor)
        )
    }
}

/// Collects the message and component fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = text
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        match field.name() {
            "message" => self.message = text,
            "component" => self.component = Some(text),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn color_supported() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

/// Filter at `info`, with the channel crates at `level`
pub fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new("info");
    for krate in CHANNEL_CRATES {
        filter = filter.add_directive(format!("{}={}", krate, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let formatter = ChannelLogFormatter::new(config.service_name.clone());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.level)?)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(formatter)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(message: &str, component: Option<&str>) -> FieldVisitor {
        FieldVisitor {
            message: message.to_string(),
            component: component.map(str::to_string),
        }
    }

    #[test]
    fn test_plain_line_layout() {
        let formatter = ChannelLogFormatter::new("ua").with_color(false);
        let line = formatter.render(
            "2024-01-01 00:00:00.000",
            &tracing::Level::INFO,
            "ua_channel::channel",
            &fields("Secure channel 1 open with token 1", None),
        );
        assert_eq!(
            line,
            format!(
                "[2024-01-01 00:00:00.000] [{:<20}] [{:<9}] Secure channel 1 open with token 1",
                "ua-channel", "ℹ INFO"
            )
        );
    }

    #[test]
    fn test_component_column() {
        let formatter = ChannelLogFormatter::new("ua").with_color(false);
        assert_eq!(
            formatter.component_name(Some("authority"), "anything").trim_end(),
            "ua-authority"
        );
        assert_eq!(
            formatter.component_name(None, "ua_wire::chunk").trim_end(),
            "ua-wire"
        );
        assert_eq!(formatter.component_name(None, "tokio::runtime").trim_end(), "ua");

        let long = formatter.component_name(Some("a-very-long-component-name"), "x");
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_colored_line() {
        let formatter = ChannelLogFormatter::new("ua").with_color(true);
        let line = formatter.render(
            "ts",
            &tracing::Level::WARN,
            "ua_channel",
            &fields("renewal failed", None),
        );
        assert!(line.starts_with(COLOR_CYAN));
        assert!(line.contains(COLOR_BRIGHT_YELLOW));
        assert!(line.ends_with(COLOR_RESET));
    }

    #[test]
    fn test_env_filter() {
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("trace").is_ok());
    }
}
