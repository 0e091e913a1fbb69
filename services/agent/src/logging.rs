//! Tracing setup, subsystem tags and log redaction.
//!
//! Every engine log event carries a `subsystem` field. Besides the JSON
//! stderr output, a [`LogForwarder`] layer renders each event as a single
//! line, redacts credential material and hands it to the log-viewer
//! collaborator as an [`OutboundEvent::LogLine`]. Lines logged before the
//! viewer attaches are replayed from a bounded history.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use fluxwarden_events::OutboundEvent;
use fluxwarden_id::NodeId;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Log tag identifying the component (and node) an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// Network discovery.
    Discovery,
    /// Process-level events.
    Main,
    /// Per-node event handling and lifecycle.
    Node(NodeId),
    /// Per-node automation cycle.
    Auto(NodeId),
    /// Per-node control-plane calls.
    Api(NodeId),
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Discovery => write!(f, "DISCOVERY"),
            Subsystem::Main => write!(f, "MAIN"),
            Subsystem::Node(id) => write!(f, "MAIN-{id}"),
            Subsystem::Auto(id) => write!(f, "AUTO-{id}"),
            Subsystem::Api(id) => write!(f, "API-{id}"),
        }
    }
}

// =============================================================================
// Redaction
// =============================================================================

const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &str = "zelidauth|token|signature|loginphrase|credential|password";

static QUOTED_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?i)"({SENSITIVE_KEYS})"\s*:\s*"(?:[^"\\]|\\.)*""#
    ))
    .expect("quoted pair pattern is valid")
});

static ESCAPED_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?i)\\"({SENSITIVE_KEYS})\\"\s*:\s*\\"[^\\]*\\""#
    ))
    .expect("escaped pair pattern is valid")
});

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r#"(?i)\b({SENSITIVE_KEYS})=[^\s&,;"]+"#)).expect("key=value pattern is valid")
});

/// Replace credential-bearing values in a log line with `[REDACTED]`.
///
/// Handles `"key":"value"` (plain and backslash-escaped) and `key=value`.
pub fn redact(line: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(line);

    for (pattern, replacement) in [
        (&*QUOTED_PAIR, format!(r#""${{1}}":"{REDACTED}""#)),
        (&*ESCAPED_PAIR, format!(r#"\"${{1}}\":\"{REDACTED}\""#)),
        (&*KEY_VALUE, format!("${{1}}={REDACTED}")),
    ] {
        if pattern.is_match(&out) {
            out = Cow::Owned(pattern.replace_all(&out, replacement.as_str()).into_owned());
        }
    }

    out
}

// =============================================================================
// Forwarding layer
// =============================================================================

/// Lines kept for replay when the log viewer attaches.
pub const LOG_HISTORY_CAPACITY: usize = 500;

/// Destination for rendered, redacted log lines.
///
/// Every line is recorded in a bounded history. Lines are only forwarded
/// live once [`LogSink::attach`] has been called; [`LogSink::close`] drops
/// the forwarding channel so the writer can drain and finish.
#[derive(Debug, Clone)]
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Debug)]
struct SinkState {
    tx: Option<mpsc::Sender<OutboundEvent>>,
    attached: bool,
    history: VecDeque<String>,
    capacity: usize,
}

impl LogSink {
    /// Create a sink that forwards into a dedicated log channel.
    pub fn new(tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self::with_history_capacity(tx, LOG_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(tx: mpsc::Sender<OutboundEvent>, capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                tx: Some(tx),
                attached: false,
                history: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start live forwarding and return the recorded history, oldest first.
    pub fn attach(&self) -> Vec<String> {
        let mut state = self.lock();
        state.attached = true;
        state.history.iter().cloned().collect()
    }

    /// Recorded history, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.iter().cloned().collect()
    }

    /// Stop forwarding. Lines are still recorded in the history.
    pub fn close(&self) {
        self.lock().tx = None;
    }

    /// Record a line and forward it when attached. Forwarded lines are
    /// dropped when the channel is full.
    fn push(&self, line: String) {
        let mut state = self.lock();
        if state.capacity > 0 {
            if state.history.len() == state.capacity {
                state.history.pop_front();
            }
            state.history.push_back(line.clone());
        }
        if state.attached {
            if let Some(tx) = &state.tx {
                let _ = tx.try_send(OutboundEvent::LogLine { line });
            }
        }
    }
}

/// Tracing layer that forwards redacted lines to a [`LogSink`].
pub struct LogForwarder {
    sink: LogSink,
}

impl LogForwarder {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for LogForwarder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%d.%m.%Y %H:%M");
        let line = visitor.render(&timestamp.to_string(), *event.metadata().level());
        self.sink.push(redact(&line).into_owned());
    }
}

#[derive(Default)]
struct LineVisitor {
    subsystem: Option<String>,
    message: String,
    fields: String,
}

impl LineVisitor {
    fn render(&self, timestamp: &str, level: Level) -> String {
        let subsystem = self.subsystem.as_deref().unwrap_or("MAIN");
        let mut line = format!("[{timestamp}][{subsystem}]");
        if level == Level::WARN || level == Level::ERROR {
            let _ = write!(line, " {level}");
        }
        let _ = write!(line, " {}{}", self.message, self.fields);
        line
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "subsystem" => self.subsystem = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "subsystem" => self.subsystem = Some(format!("{value:?}")),
            name => {
                let _ = write!(self.fields, " {name}={value:?}");
            }
        }
    }
}

/// Install the global subscriber: env filter, JSON on stderr, and the
/// collaborator forwarder.
pub fn init_tracing(config: &Config, sink: LogSink) -> Result<()> {
    let default_directive = if config.debug {
        "info,fluxwarden_agent=debug".to_string()
    } else {
        config.log_level.clone()
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .with(LogForwarder::new(sink))
        .try_init()?;

    Ok(())
}
