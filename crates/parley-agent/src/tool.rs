//! Native tool binding. Agent configs persist tool references as
//! `{module, function}` symbols; a binder rebinds them to registered
//! functions at load time. Missing symbols are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parley_provider::ToolSpec;
use serde::{Deserialize, Serialize};

/// A persisted tool symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolRef {
    pub module: String,
    pub function: String,
}

impl ToolRef {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }

    pub fn symbol(&self) -> String {
        format!("{}::{}", self.module, self.function)
    }
}

/// Executable tool: invoked with the model's arguments and the resolved
/// per-tool config (Null when the config has no entry for it).
pub type ToolFn = Arc<
    dyn Fn(serde_json::Value, serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct BoundTool {
    pub spec: ToolSpec,
    pub func: ToolFn,
}

/// Registry of native tool functions keyed by `module::function` symbol.
#[derive(Clone, Default)]
pub struct ToolBinder {
    tools: HashMap<String, BoundTool>,
}

impl ToolBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reference: ToolRef, spec: ToolSpec, func: ToolFn) {
        self.tools.insert(reference.symbol(), BoundTool { spec, func });
    }

    /// Rebind persisted references. Unknown symbols are dropped with a warning.
    pub fn bind(&self, refs: &[ToolRef]) -> Vec<BoundTool> {
        refs.iter()
            .filter_map(|r| {
                let bound = self.tools.get(&r.symbol()).cloned();
                if bound.is_none() {
                    tracing::warn!("tool symbol {} not registered, dropping", r.symbol());
                }
                bound
            })
            .collect()
    }
}
