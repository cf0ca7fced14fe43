//! Port traits for the engine's external collaborators.
//!
//! The script sandbox, the AI provider client, the approval UI, and durable
//! workflow storage all live outside this crate. The executor is generic
//! over these traits; tests substitute in-memory doubles.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use dashmap::DashMap;
use loomflow_types::workflow::WorkflowDefinition;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Execution ports
// ---------------------------------------------------------------------------

/// Result of a sandboxed script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// The script's stdout parsed as JSON (a plain string if not JSON).
    pub stdout: Value,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Executes workflow scripts in the external sandbox.
pub trait ScriptPort: Send + Sync {
    /// Run the script at `script` with the resolved step inputs on stdin.
    ///
    /// A non-zero exit or sandbox failure is an external error; wall-clock
    /// enforcement is the executor's job, not the port's.
    fn execute(
        &self,
        script: &str,
        input: &Value,
    ) -> impl std::future::Future<Output = Result<ScriptOutput, EngineError>> + Send;
}

/// Sends prompts to the configured AI provider.
pub trait AiPort: Send + Sync {
    /// Send a resolved prompt, optionally pinning a model, and return the
    /// completion text.
    fn send(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> impl std::future::Future<Output = Result<String, EngineError>> + Send;
}

/// Gates side-effecting steps behind user approval.
pub trait ApprovalPort: Send + Sync {
    /// Ask for approval to run a side-effecting step. `false` means denied.
    fn request_approval(
        &self,
        step_id: &str,
        description: &str,
    ) -> impl std::future::Future<Output = Result<bool, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// Definition storage
// ---------------------------------------------------------------------------

/// Storage interface for workflow definitions.
///
/// The product ships a durable implementation; [`MemoryWorkflowStore`] backs
/// tests and ephemeral sessions.
pub trait WorkflowStore: Send + Sync {
    /// Upsert a definition (insert or replace by ID).
    fn save(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;

    /// Get a definition by its UUID.
    fn load(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, EngineError>> + Send;

    /// List all stored definitions, sorted by name.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, EngineError>> + Send;

    /// Delete a definition by ID. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, EngineError>> + Send;
}

/// In-memory workflow store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    definitions: DashMap<Uuid, WorkflowDefinition>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    async fn save(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        self.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, EngineError> {
        Ok(self.definitions.get(id).map(|entry| entry.clone()))
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let mut all: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, EngineError> {
        Ok(self.definitions.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::workflow::ErrorPropagation;
    use std::collections::BTreeMap;

    fn sample_definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            inputs: BTreeMap::new(),
            steps: vec![],
            error_propagation: ErrorPropagation::FailFast,
            concurrency: None,
            timeout_ms: None,
            history_retention: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryWorkflowStore::new();
        let def = sample_definition("alpha");
        store.save(&def).await.unwrap();

        let loaded = store.load(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert!(store.load(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_by_id() {
        let store = MemoryWorkflowStore::new();
        let mut def = sample_definition("alpha");
        store.save(&def).await.unwrap();

        def.name = "alpha-renamed".to_string();
        store.save(&def).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "alpha-renamed");
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let store = MemoryWorkflowStore::new();
        store.save(&sample_definition("zeta")).await.unwrap();
        store.save(&sample_definition("alpha")).await.unwrap();
        store.save(&sample_definition("mid")).await.unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryWorkflowStore::new();
        let def = sample_definition("alpha");
        store.save(&def).await.unwrap();

        assert!(store.delete(&def.id).await.unwrap());
        assert!(!store.delete(&def.id).await.unwrap());
        assert!(store.load(&def.id).await.unwrap().is_none());
    }
}
