use std::fmt::Write as _;

use bevy::log::tracing_subscriber::{layer::Context, Layer};
use bevy::log::BoxedLayer;
use bevy::prelude::*;
use bevy::utils::tracing::field::{Field, Visit};
use bevy::utils::tracing::{Event, Level, Subscriber};

use super::HostSignals;
use crate::buffers::{LogRecord, Severity};

/// `LogPlugin::custom_layer` hook: every log event becomes a `HostSignals::notify_log`.
pub fn capture_layer(app: &mut App) -> Option<BoxedLayer> {
    let signals = app
        .world_mut()
        .get_resource_or_insert_with(HostSignals::default);
    Some(
        LogCaptureLayer {
            signals: HostSignals::clone(&signals),
        }
        .boxed(),
    )
}

struct LogCaptureLayer {
    signals: HostSignals,
}

impl<S: Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut detail = metadata.target().to_string();
        if !visitor.fields.is_empty() {
            let _ = write!(detail, " {}", visitor.fields);
        }
        self.signals.notify_log(&LogRecord::new(
            severity_of(metadata.level()),
            visitor.message,
            detail,
        ));
    }
}

fn severity_of(level: &Level) -> Severity {
    if *level == Level::ERROR {
        Severity::Error
    } else if *level == Level::WARN {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field, value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field, &format!("{value:?}"));
        }
    }
}

impl MessageVisitor {
    fn push_field(&mut self, field: &Field, value: &str) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}
