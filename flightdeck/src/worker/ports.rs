//! Positional channel bindings handed to a worker entry point.

use std::fmt;

use crate::channel::{AnyHandle, ChannelError, ChannelHandle};
use crate::wire::Message;

/// Which side of a worker a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Input,
    Output,
}

impl fmt::Display for PortSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Errors from looking up a port.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("worker `{worker}` has no {side} port {index} ({bound} bound)")]
    Missing {
        worker: String,
        side: PortSide,
        index: usize,
        bound: usize,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The input and output channels of one worker, in declaration order.
#[derive(Debug, Clone)]
pub struct Ports {
    worker: String,
    inputs: Vec<AnyHandle>,
    outputs: Vec<AnyHandle>,
}

impl Ports {
    pub(crate) fn new(worker: String, inputs: Vec<AnyHandle>, outputs: Vec<AnyHandle>) -> Self {
        Self {
            worker,
            inputs,
            outputs,
        }
    }

    /// Typed handle of input port `index`.
    ///
    /// # Errors
    ///
    /// [`PortError::Missing`] for an out-of-range index, or a type mismatch.
    pub fn input<T: Message>(&self, index: usize) -> Result<ChannelHandle<T>, PortError> {
        self.lookup(PortSide::Input, index)
    }

    /// Typed handle of output port `index`.
    ///
    /// # Errors
    ///
    /// [`PortError::Missing`] for an out-of-range index, or a type mismatch.
    pub fn output<T: Message>(&self, index: usize) -> Result<ChannelHandle<T>, PortError> {
        self.lookup(PortSide::Output, index)
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn lookup<T: Message>(&self, side: PortSide, index: usize) -> Result<ChannelHandle<T>, PortError> {
        let list = match side {
            PortSide::Input => &self.inputs,
            PortSide::Output => &self.outputs,
        };
        let raw = list.get(index).ok_or_else(|| PortError::Missing {
            worker: self.worker.clone(),
            side,
            index,
            bound: list.len(),
        })?;
        Ok(raw.typed()?)
    }
}
