//! Command Router — dequeues frames, dispatches by `op` to a registered
//! handler, and produces a response carrying the same `id` and `origin`.
//!
//! Handlers are registered at orchestrator boot as a table of
//! `(op, Box<dyn CommandHandler>)` rather than a hardcoded match, since the
//! set of ops is small and fixed but still varies by build (which service
//! handlers are wired in). Unknown ops never reach a handler — the router
//! answers them itself.

use std::collections::HashMap;

use valvelink_core::message::{Frame, RespFrame};

/// One registered operation. Implementations own whatever state they need
/// (e.g. a channel to the solenoid task) and must not block the router's
/// thread for longer than the operation truly requires.
pub trait CommandHandler: Send + Sync {
    /// Handle `frame`, returning `(status, payload)`. A negative status
    /// means failure; the payload is attached to the response regardless.
    fn handle(&self, frame: &Frame) -> (i8, Vec<u8>);
}

/// Echoes the incoming payload back with `status = 0`. Ships only to
/// exercise the router end-to-end — the solenoid/schedule/wifi handlers
/// themselves are external collaborators, out of scope for this crate.
pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle(&self, frame: &Frame) -> (i8, Vec<u8>) {
        (0, frame.payload.clone())
    }
}

/// Reports a fixed "ok" status with no payload. Useful as a liveness probe
/// op (`status`) during integration testing.
pub struct StatusHandler;

impl CommandHandler for StatusHandler {
    fn handle(&self, _frame: &Frame) -> (i8, Vec<u8>) {
        (0, Vec::new())
    }
}

#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `op`.
    pub fn register(&mut self, op: impl Into<String>, handler: Box<dyn CommandHandler>) {
        self.handlers.insert(op.into(), handler);
    }

    /// Dispatch `frame` by exact `op` match. Unknown ops produce
    /// `status = -1` with an empty payload, per the router's contract.
    pub fn dispatch(&self, frame: Frame) -> RespFrame {
        match self.handlers.get(frame.op.as_str()) {
            Some(handler) => {
                let (status, payload) = handler.handle(&frame);
                RespFrame {
                    id: frame.id,
                    status,
                    origin: frame.origin,
                    is_final: frame.is_final,
                    payload,
                }
            }
            None => RespFrame::unknown_op(frame.id, frame.origin),
        }
    }
}
