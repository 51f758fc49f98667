//! In-memory capture of `tracing` events for log assertions.
//!
//! The capture is installed as the thread-local default subscriber, so it only
//! sees events emitted on the test's own thread (the single-threaded
//! `#[tokio::test]` runtime included).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// One captured log record.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    /// Record level
    pub level: Level,
    /// Rendered message
    pub message: String,
    /// Structured fields, rendered as they would be displayed
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Rendered value of `name`, if the record carries it.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

type Records = Arc<Mutex<Vec<CapturedEvent>>>;

/// Records every event for the lifetime of the capture.
pub struct LogCapture {
    records: Records,
    _guard: DefaultGuard,
}

impl LogCapture {
    /// All records captured so far, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First record whose message equals `message`.
    #[must_use]
    pub fn find(&self, message: &str) -> Option<CapturedEvent> {
        self.events().into_iter().find(|e| e.message == message)
    }
}

/// Start capturing events on the current thread until the capture is dropped.
#[must_use]
pub fn capture_logs() -> LogCapture {
    let records = Records::default();
    let layer = CaptureLayer {
        records: Arc::clone(&records),
    };
    let guard = tracing::subscriber::set_default(Registry::default().with(layer));

    LogCapture {
        records,
        _guard: guard,
    }
}

struct CaptureLayer {
    records: Records,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *event.metadata().level(),
                message: visitor.message,
                fields: visitor.fields,
            });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}
