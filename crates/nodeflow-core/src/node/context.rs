//! Per-execution node context.
//!
//! A `NodeExecutionContext` is exclusively owned by one node execution
//! attempt. Nothing written to `local_variables` leaves the attempt; only
//! `output_data` (and the selected port) flows downstream.

use std::collections::HashMap;
use std::sync::Arc;

use nodeflow_types::definition::NodeId;
use serde_json::Value;
use uuid::Uuid;

/// Receives signals a node emits while it is still running.
///
/// The engine installs a sink that routes `Next` and `Progress` messages
/// immediately, so downstream nodes can start on loop items before the
/// emitting node completes.
pub trait SignalSink: Send + Sync {
    /// A loop-style node produced one item. Opens a fresh epoch.
    fn next(&self, node_id: &str, iteration: u64, output: Value);

    /// A progress report for the current activation.
    fn progress(&self, node_id: &str, epoch: u64, percent: f32, detail: Option<String>);
}

/// Scratch space for one node execution attempt.
#[derive(Clone)]
pub struct NodeExecutionContext {
    pub instance_id: Uuid,
    pub node_id: NodeId,
    /// Epoch of the triggering message(s).
    pub epoch: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Data delivered by upstream nodes.
    pub input_data: Value,
    /// Data handed to downstream nodes on completion.
    pub output_data: Value,
    /// Port the output leaves through. `None` selects the default port.
    pub output_port: Option<String>,
    /// Attempt-local state, never propagated.
    pub local_variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    sink: Option<Arc<dyn SignalSink>>,
}

impl NodeExecutionContext {
    pub fn new(instance_id: Uuid, node_id: impl Into<NodeId>, epoch: u64, input: Value) -> Self {
        Self {
            instance_id,
            node_id: node_id.into(),
            epoch,
            attempt: 1,
            input_data: input,
            output_data: Value::Null,
            output_port: None,
            local_variables: HashMap::new(),
            metadata: HashMap::new(),
            sink: None,
        }
    }

    /// Attach the sink that receives `Next` and progress signals.
    pub fn with_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// A clean copy for the given attempt: same input and metadata, no output.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            output_data: Value::Null,
            output_port: None,
            local_variables: HashMap::new(),
            ..self.clone()
        }
    }

    pub fn set_output(&mut self, output: Value) {
        self.output_data = output;
    }

    pub fn set_output_port(&mut self, port: impl Into<String>) {
        self.output_port = Some(port.into());
    }

    /// Emit one loop iteration downstream as a `Next` message.
    pub fn emit_next(&self, iteration: u64, output: Value) {
        match &self.sink {
            Some(sink) => sink.next(&self.node_id, iteration, output),
            None => tracing::debug!(node_id = %self.node_id, iteration, "no signal sink, next dropped"),
        }
    }

    /// Report progress (0-100) to observers and progress connections.
    pub fn report_progress(&self, percent: f32, detail: Option<String>) {
        if let Some(sink) = &self.sink {
            sink.progress(&self.node_id, self.epoch, percent.clamp(0.0, 100.0), detail);
        }
    }
}

impl std::fmt::Debug for NodeExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutionContext")
            .field("instance_id", &self.instance_id)
            .field("node_id", &self.node_id)
            .field("epoch", &self.epoch)
            .field("attempt", &self.attempt)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        nexts: Mutex<Vec<(String, u64, Value)>>,
        progress: Mutex<Vec<f32>>,
    }

    impl SignalSink for RecordingSink {
        fn next(&self, node_id: &str, iteration: u64, output: Value) {
            self.nexts
                .lock()
                .unwrap()
                .push((node_id.to_string(), iteration, output));
        }

        fn progress(&self, _node_id: &str, _epoch: u64, percent: f32, _detail: Option<String>) {
            self.progress.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn for_attempt_resets_output_but_keeps_input() {
        let mut ctx = NodeExecutionContext::new(Uuid::now_v7(), "a", 4, json!({"x": 1}));
        ctx.set_output(json!("done"));
        ctx.set_output_port("yes");
        ctx.local_variables.insert("scratch".into(), json!(true));
        ctx.metadata.insert("trace".into(), json!("abc"));

        let retry = ctx.for_attempt(2);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.epoch, 4);
        assert_eq!(retry.input_data, json!({"x": 1}));
        assert!(retry.output_data.is_null());
        assert!(retry.output_port.is_none());
        assert!(retry.local_variables.is_empty());
        assert_eq!(retry.metadata["trace"], json!("abc"));
    }

    #[test]
    fn signals_reach_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = NodeExecutionContext::new(Uuid::now_v7(), "loop", 0, Value::Null)
            .with_sink(sink.clone());

        ctx.emit_next(0, json!("a"));
        ctx.emit_next(1, json!("b"));
        ctx.report_progress(150.0, None);

        let nexts = sink.nexts.lock().unwrap();
        assert_eq!(nexts.len(), 2);
        assert_eq!(nexts[1], ("loop".to_string(), 1, json!("b")));
        assert_eq!(*sink.progress.lock().unwrap(), vec![100.0]);
    }

    #[test]
    fn signals_without_sink_are_ignored() {
        let ctx = NodeExecutionContext::new(Uuid::now_v7(), "a", 0, Value::Null);
        ctx.emit_next(0, json!(1));
        ctx.report_progress(10.0, Some("warming up".into()));
        assert!(format!("{ctx:?}").contains("has_sink: false"));
    }
}
