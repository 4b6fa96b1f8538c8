//! Shared test utilities for readstat integration tests.
//!
//! A recording handler that captures every event in order, plus in-memory
//! fixture builders for each supported format (see [`builders`]).

#![allow(dead_code)]

pub mod builders;

use std::ops::ControlFlow;

use readstat::{FileMetadata, Handler, Value, Variable};

// ===========================================================================
// Recorded events
// ===========================================================================

/// One handler invocation.
#[derive(Debug, Clone)]
pub enum Event {
    Info { obs: usize, vars: usize },
    Variable { index: usize, name: String },
    Value { obs: usize, var: usize, value: Value },
    Label { set: String, value: Value, label: String },
    Error(String),
}

/// Handler that records everything and optionally breaks after a number of
/// control events.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub metadata: Option<FileMetadata>,
    pub variables: Vec<Variable>,
    /// Break on the n-th (0-based) control event.
    pub break_at: Option<usize>,
    control_events: usize,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaking_at(n: usize) -> Self {
        Self {
            break_at: Some(n),
            ..Self::default()
        }
    }

    fn flow(&mut self) -> ControlFlow<()> {
        let n = self.control_events;
        self.control_events += 1;
        if self.break_at == Some(n) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    pub fn values(&self) -> Vec<&Value> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Value { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    /// (obs, var) of every value event, in emission order.
    pub fn positions(&self) -> Vec<(usize, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Value { obs, var, .. } => Some((*obs, *var)),
                _ => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<(String, Value, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Label { set, value, label } => Some((set.clone(), value.clone(), label.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Error(m) => Some(m.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Events other than `error`.
    pub fn control_event_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| !matches!(e, Event::Error(_)))
            .count()
    }

    /// Value at `(obs, var)`.
    pub fn cell(&self, obs: usize, var: usize) -> &Value {
        self.events
            .iter()
            .find_map(|e| match e {
                Event::Value { obs: o, var: v, value } if *o == obs && *v == var => Some(value),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no value at ({obs}, {var})"))
    }
}

impl Handler for Recorder {
    fn info(&mut self, metadata: &FileMetadata) -> ControlFlow<()> {
        self.events.push(Event::Info {
            obs: metadata.obs_count,
            vars: metadata.var_count,
        });
        self.metadata = Some(metadata.clone());
        self.flow()
    }

    fn variable(&mut self, index: usize, variable: &Variable) -> ControlFlow<()> {
        self.events.push(Event::Variable {
            index,
            name: variable.name.clone(),
        });
        self.variables.push(variable.clone());
        self.flow()
    }

    fn value(&mut self, obs: usize, var: usize, value: &Value) -> ControlFlow<()> {
        self.events.push(Event::Value {
            obs,
            var,
            value: value.clone(),
        });
        self.flow()
    }

    fn value_label(&mut self, set: &str, value: &Value, label: &str) -> ControlFlow<()> {
        self.events.push(Event::Label {
            set: set.to_string(),
            value: value.clone(),
            label: label.to_string(),
        });
        self.flow()
    }

    fn error(&mut self, message: &str) {
        self.events.push(Event::Error(message.to_string()));
    }
}

/// Row-major positions for an `obs x vars` table.
pub fn row_major(obs: usize, vars: usize) -> Vec<(usize, usize)> {
    (0..obs).flat_map(|o| (0..vars).map(move |v| (o, v))).collect()
}
