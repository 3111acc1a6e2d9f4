use std::collections::BTreeMap;

/// Requests handlers may enqueue against the dispatcher. Modeled as messages
/// rather than direct calls so a handler never reenters the dispatcher while
/// it is mid-dispatch.
#[derive(Debug, Clone)]
pub enum DispatcherCommand {
    /// Instantiate a template and register the resulting index at runtime.
    SpawnIndex {
        name: String,
        template: String,
        values: BTreeMap<String, String>,
    },
}
