//! Callback interface and the per-session event dispatcher.
//!
//! A [`Handler`] receives the decoded stream: file info once, one call per
//! variable, one call per cell in row-major order, then value labels. Every
//! method has a no-op default, so an unimplemented method is simply skipped.
//! Returning [`ControlFlow::Break`] stops the decode, which then returns
//! [`ReadStatError::UserAbort`].

use std::ops::ControlFlow;

use tracing::{debug, trace};

use crate::error::{ReadStatError, Result};
use crate::metadata::{FileMetadata, Variable};
use crate::value::Value;

/// Receiver of decode events.
pub trait Handler {
    /// Called once with the file-level metadata.
    fn info(&mut self, _metadata: &FileMetadata) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once per variable, in file order.
    fn variable(&mut self, _index: usize, _variable: &Variable) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once per cell, all variables of an observation before the next.
    fn value(&mut self, _obs_index: usize, _var_index: usize, _value: &Value) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once per (set, value, label) triple.
    fn value_label(&mut self, _label_set: &str, _value: &Value, _label: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Receives a description of the failure right before a decode returns
    /// an error. Diagnostic only.
    fn error(&mut self, _message: &str) {}
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn info(&mut self, metadata: &FileMetadata) -> ControlFlow<()> {
        (**self).info(metadata)
    }

    fn variable(&mut self, index: usize, variable: &Variable) -> ControlFlow<()> {
        (**self).variable(index, variable)
    }

    fn value(&mut self, obs_index: usize, var_index: usize, value: &Value) -> ControlFlow<()> {
        (**self).value(obs_index, var_index, value)
    }

    fn value_label(&mut self, label_set: &str, value: &Value, label: &str) -> ControlFlow<()> {
        (**self).value_label(label_set, value, label)
    }

    fn error(&mut self, message: &str) {
        (**self).error(message)
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl Handler for NullHandler {}

/// Stage of a decode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Signature,
    Metadata,
    Dictionary,
    Data,
    Labels,
}

/// Session state around a handler: enforces the ordering and count
/// contract and turns a `Break` into `UserAbort`.
pub(crate) struct Dispatcher<'h, H: Handler + ?Sized> {
    handler: &'h mut H,
    stage: Stage,
    aborted: bool,
    obs_count: usize,
    var_count: usize,
    variables_seen: usize,
    next_obs: usize,
    next_var: usize,
    values_seen: u64,
}

impl<'h, H: Handler + ?Sized> Dispatcher<'h, H> {
    pub(crate) fn new(handler: &'h mut H) -> Self {
        Self {
            handler,
            stage: Stage::Signature,
            aborted: false,
            obs_count: 0,
            var_count: 0,
            variables_seen: 0,
            next_obs: 0,
            next_var: 0,
            values_seen: 0,
        }
    }

    fn check(&mut self, flow: ControlFlow<()>) -> Result<()> {
        match flow {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => {
                debug!(stage = ?self.stage, "handler requested abort");
                self.aborted = true;
                Err(ReadStatError::UserAbort)
            }
        }
    }

    fn guard(&self) -> Result<()> {
        if self.aborted {
            Err(ReadStatError::UserAbort)
        } else {
            Ok(())
        }
    }

    /// Mark the signature as accepted.
    pub(crate) fn signature_ok(&mut self) {
        self.stage = Stage::Metadata;
    }

    pub(crate) fn info(&mut self, metadata: &FileMetadata) -> Result<()> {
        self.guard()?;
        debug!(
            format = %metadata.format,
            obs = metadata.obs_count,
            vars = metadata.var_count,
            encoding = %metadata.encoding,
            "file metadata"
        );
        self.stage = Stage::Dictionary;
        self.obs_count = metadata.obs_count;
        self.var_count = metadata.var_count;
        let flow = self.handler.info(metadata);
        self.check(flow)
    }

    pub(crate) fn variable(&mut self, variable: &Variable) -> Result<()> {
        self.guard()?;
        debug_assert_eq!(variable.index, self.variables_seen, "variables out of order");
        trace!(index = variable.index, name = %variable.name, "variable");
        self.variables_seen += 1;
        let flow = self.handler.variable(variable.index, variable);
        self.check(flow)
    }

    pub(crate) fn value(&mut self, obs_index: usize, var_index: usize, value: &Value) -> Result<()> {
        self.guard()?;
        if self.stage < Stage::Data {
            self.stage = Stage::Data;
        }
        debug_assert_eq!(
            (obs_index, var_index),
            (self.next_obs, self.next_var),
            "values must be emitted in row-major order"
        );
        self.next_var += 1;
        if self.next_var == self.var_count {
            self.next_var = 0;
            self.next_obs += 1;
        }
        self.values_seen += 1;
        let flow = self.handler.value(obs_index, var_index, value);
        self.check(flow)
    }

    pub(crate) fn value_label(&mut self, label_set: &str, value: &Value, label: &str) -> Result<()> {
        self.guard()?;
        self.stage = Stage::Labels;
        let flow = self.handler.value_label(label_set, value, label);
        self.check(flow)
    }

    /// Verify the emitted cell count against the announced dimensions.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.stage < Stage::Dictionary {
            return Ok(());
        }
        let expected = self.obs_count as u64 * self.var_count as u64;
        if self.values_seen != expected {
            let width = self.var_count.max(1) as u64;
            let partial = self.values_seen % width;
            if partial != 0 {
                return Err(ReadStatError::RowWidthMismatch {
                    expected: width,
                    actual: partial,
                });
            }
            return Err(ReadStatError::RowCountMismatch {
                expected: self.obs_count as u64,
                actual: self.values_seen / width,
            });
        }
        Ok(())
    }

    pub(crate) fn error(&mut self, message: &str) {
        self.handler.error(message);
    }
}
