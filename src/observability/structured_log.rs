//! JSON line per notable event, written to stderr.
use serde_json::{Map, Value, json};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Emits INFO and above as `{timestamp, level, target, message, fields}` objects.
pub(crate) struct StructuredLogLayer;

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.insert(field.name().to_string(), json!(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), json!(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }
}

fn render(event: &Event<'_>) -> Value {
    let mut visitor = JsonVisitor::default();
    event.record(&mut visitor);

    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": event.metadata().level().as_str(),
        "target": event.metadata().target(),
        "message": visitor.message.unwrap_or_else(|| event.metadata().name().to_string()),
        "fields": visitor.fields,
    })
}

impl<S: Subscriber> Layer<S> for StructuredLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::INFO {
            return;
        }
        eprintln!("{}", serde_json::to_string(&render(event)).unwrap_or_default());
    }
}
