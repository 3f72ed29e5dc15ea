use crate::execution_payload::ExecutionPayload;

/// The one I/O boundary of block processing: a synchronous predicate asking the execution layer
/// whether a payload is valid.
pub trait ExecutionEngine {
    fn notify_new_payload(&self, payload: &ExecutionPayload) -> anyhow::Result<bool>;
}

/// Defers payload validation to the caller (e.g. a syncing node that verified the payload out of
/// band).
#[derive(Debug, Default)]
pub struct NoopEngine;

impl ExecutionEngine for NoopEngine {
    fn notify_new_payload(&self, _payload: &ExecutionPayload) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Test engine with a scripted verdict.
#[derive(Debug)]
pub struct MockEngine {
    pub valid: bool,
}

impl ExecutionEngine for MockEngine {
    fn notify_new_payload(&self, _payload: &ExecutionPayload) -> anyhow::Result<bool> {
        Ok(self.valid)
    }
}
