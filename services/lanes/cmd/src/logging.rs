//! Console log formatting for the lanes client.
//!
//! Every event renders as `[timestamp] [component] [level] message`. The
//! component column comes from an explicit `component` field when one is
//! set, otherwise from the `lane_*` crate that emitted the event.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Renders `[timestamp] [component] [level] message`
pub struct LanesLogFormatter {
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

impl LanesLogFormatter {
    pub fn new(service_name: String) -> Self {
        Self {
            service_name,
            color_enabled: is_terminal(),
        }
    }

    /// Component column with fixed width
    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        let chars = name.chars().count();
        if chars > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    /// Level column with a visual indicator
    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn get_color_for_level(&self, level: &tracing::Level) -> &'static str {
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
}

impl<S, N> FormatEvent<S, N> for LanesLogFormatter
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
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // Library events carry no component field; label them by crate
        let component = visitor
            .component
            .as_deref()
            .or_else(|| crate_component(event.metadata().target()));

        let color = self.get_color_for_level(level);
        let reset_color = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan_color = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan_color,
            timestamp,
            self.format_component(component),
            color,
            self.format_log_level(level),
            reset_color
        )?;

        writeln!(writer, "{}{}", visitor.message, reset_color)
    }
}

/// `lane_session::manager` -> `session`
fn crate_component(target: &str) -> Option<&str> {
    target
        .split("::")
        .next()
        .and_then(|krate| krate.strip_prefix("lane_"))
}

/// Extracts the message and component fields from an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                let comp = format!("{:?}", value);
                self.component = Some(comp.trim_matches('"').to_string());
            }
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

fn is_terminal() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> LanesLogFormatter {
        LanesLogFormatter {
            service_name: "lanes".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_column() {
        let f = formatter();
        assert_eq!(f.format_component(None), format!("{:<20}", "lanes"));
        assert_eq!(f.format_component(Some("session")), format!("{:<20}", "lanes-session"));

        let long = f.format_component(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_crate_component() {
        assert_eq!(crate_component("lane_session::manager"), Some("session"));
        assert_eq!(crate_component("lane_wire"), Some("wire"));
        assert_eq!(crate_component("lanes"), None);
    }

    #[test]
    fn test_no_color_when_disabled() {
        assert_eq!(formatter().get_color_for_level(&tracing::Level::ERROR), "");
    }
}
