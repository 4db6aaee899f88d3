use std::sync::Arc;

use tracing::debug;

use crate::app::models::{LogLevel, ProvisionEvent};

pub trait ProvisionObserver {
    fn emit(&self, event: ProvisionEvent);
}

impl<F> ProvisionObserver for F
where
    F: Fn(ProvisionEvent),
{
    fn emit(&self, event: ProvisionEvent) {
        self(event)
    }
}

pub type SharedObserver = Arc<dyn ProvisionObserver + Send + Sync>;

pub fn emit_log(observer: &dyn ProvisionObserver, text: impl Into<String>, level: LogLevel) {
    observer.emit(ProvisionEvent::Log {
        text: text.into(),
        level,
    });
}

pub fn emit_progress(observer: &dyn ProvisionObserver, stage: &str, fraction: f64) {
    observer.emit(ProvisionEvent::Progress {
        stage: stage.to_string(),
        fraction: fraction.clamp(0.0, 1.0),
    });
}

/// Debug-level copy of observer events. The console observer already shows them at normal verbosity.
pub struct TracingObserver {
    trace_id: String,
}

impl TracingObserver {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }
}

impl ProvisionObserver for TracingObserver {
    fn emit(&self, event: ProvisionEvent) {
        let trace_id = &self.trace_id;
        match event {
            ProvisionEvent::Progress { stage, fraction } => {
                debug!(trace_id = %trace_id, stage = %stage, fraction, "progress");
            }
            ProvisionEvent::Log { text, level } => {
                debug!(trace_id = %trace_id, level = ?level, "{text}");
            }
            ProvisionEvent::Finished { success, message } => {
                debug!(trace_id = %trace_id, success, "{message}");
            }
        }
    }
}

pub struct FanoutObserver {
    observers: Vec<SharedObserver>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<SharedObserver>) -> Self {
        Self { observers }
    }
}

impl ProvisionObserver for FanoutObserver {
    fn emit(&self, event: ProvisionEvent) {
        for observer in &self.observers {
            observer.emit(event.clone());
        }
    }
}
