//! Instance command execution.
//!
//! Commands arrive on the agent's HTTP surface and run synchronously:
//! prepare assembles the workspace from cached template layers; start,
//! stop, and destroy manage what is already on disk. Every command reports
//! its outcome to the brain with a lifecycle callback, and failures
//! best-effort report `failed` before surfacing to the caller.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use warren_id::{InstanceId, NodeId};
use warren_proto::{CallbackKind, InstanceCommand, PrepareInstanceCommand};

use crate::client::BrainClient;
use crate::template::{
    merge_layers, substitute_variables, CacheError, LayerSource, MergeError, SubstituteError,
    TemplateCache,
};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Provide either variables or variablesJson, not both")]
    ConflictingVariables,

    #[error("variablesJson must be a JSON object with string values")]
    MalformedVariablesJson,

    #[error("instance {0} has no prepared workspace")]
    NotPrepared(InstanceId),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Substitute(#[from] SubstituteError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("callback delivery failed: {0}")]
    Callback(#[source] anyhow::Error),
}

/// Executes brain commands against the local cache and workspaces.
pub struct InstanceManager {
    cache: Arc<TemplateCache>,
    workspace: Arc<Workspace>,
    client: Arc<BrainClient>,
    node_id: NodeId,
    max_substitution_bytes: u64,
}

impl InstanceManager {
    pub fn new(
        cache: Arc<TemplateCache>,
        workspace: Arc<Workspace>,
        client: Arc<BrainClient>,
        node_id: NodeId,
        max_substitution_bytes: u64,
    ) -> Self {
        Self {
            cache,
            workspace,
            client,
            node_id,
            max_substitution_bytes,
        }
    }

    pub async fn prepare(&self, command: &PrepareInstanceCommand) -> Result<(), CommandError> {
        let outcome = self
            .prepare_inner(command)
            .await
            .map(|()| CallbackKind::Prepared);
        self.finish(command.instance_id, outcome).await
    }

    pub async fn start(&self, command: &InstanceCommand) -> Result<(), CommandError> {
        let outcome = self.start_inner(command).map(|()| CallbackKind::Running);
        self.finish(command.instance_id, outcome).await
    }

    pub async fn stop(&self, command: &InstanceCommand) -> Result<(), CommandError> {
        info!(
            instance_id = %command.instance_id,
            name = %command.name,
            "Instance stop acknowledged"
        );
        self.finish(command.instance_id, Ok(CallbackKind::Stopped))
            .await
    }

    pub async fn destroy(&self, command: &InstanceCommand) -> Result<(), CommandError> {
        let outcome = self
            .destroy_inner(command)
            .map(|()| CallbackKind::Destroyed);
        self.finish(command.instance_id, outcome).await
    }

    /// Sends the outcome callback, or the best-effort `failed` callback when
    /// the command (or the outcome callback itself) went wrong. The original
    /// error always wins over callback trouble.
    async fn finish(
        &self,
        instance_id: InstanceId,
        outcome: Result<CallbackKind, CommandError>,
    ) -> Result<(), CommandError> {
        let result = match outcome {
            Ok(kind) => self
                .client
                .send_callback(self.node_id, instance_id, kind)
                .await
                .map_err(CommandError::Callback),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(instance_id = %instance_id, error = %e, "Instance command failed");
            self.client
                .notify_failed_quietly(self.node_id, instance_id)
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn prepare_inner(&self, command: &PrepareInstanceCommand) -> Result<(), CommandError> {
        let variables =
            resolve_variables(command.variables.as_ref(), command.variables_json.as_deref())?;
        let paths = self.workspace.prepare(command.instance_id)?;

        let mut layers = Vec::with_capacity(command.layers.len());
        for layer in &command.layers {
            let lookup = self
                .cache
                .ensure_cached(
                    &layer.template_id.to_string(),
                    &layer.version,
                    &layer.checksum,
                    &layer.s3_key,
                )
                .await?;
            layers.push(LayerSource {
                template_id: lookup.template_id,
                version: lookup.version,
                order_index: layer.order_index,
                contents_dir: lookup.contents_dir,
            });
        }

        merge_layers(&layers, &paths.merged_dir)?;
        let report =
            substitute_variables(&paths.merged_dir, &variables, self.max_substitution_bytes)?;

        info!(
            instance_id = %command.instance_id,
            name = %command.name,
            layers = command.layers.len(),
            files_updated = report.updated,
            "Instance prepared"
        );
        Ok(())
    }

    fn start_inner(&self, command: &InstanceCommand) -> Result<(), CommandError> {
        let paths = self.workspace.resolve(command.instance_id);
        if !paths.merged_dir.is_dir() {
            return Err(CommandError::NotPrepared(command.instance_id));
        }
        info!(
            instance_id = %command.instance_id,
            name = %command.name,
            "Instance start acknowledged"
        );
        Ok(())
    }

    fn destroy_inner(&self, command: &InstanceCommand) -> Result<(), CommandError> {
        let existed = self.workspace.delete(command.instance_id)?;
        info!(
            instance_id = %command.instance_id,
            name = %command.name,
            existed,
            "Instance workspace destroyed"
        );
        Ok(())
    }
}

/// Resolves the prepare command's variable sources into one map.
/// `variables` and `variablesJson` are mutually exclusive; a blank JSON
/// string means no variables.
pub fn resolve_variables(
    variables: Option<&HashMap<String, String>>,
    variables_json: Option<&str>,
) -> Result<HashMap<String, String>, CommandError> {
    match (variables, variables_json) {
        (Some(_), Some(_)) => Err(CommandError::ConflictingVariables),
        (Some(map), None) => Ok(map.clone()),
        (None, Some(json)) => parse_variables_json(json),
        (None, None) => Ok(HashMap::new()),
    }
}

fn parse_variables_json(json: &str) -> Result<HashMap<String, String>, CommandError> {
    if json.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let value: Value =
        serde_json::from_str(json).map_err(|_| CommandError::MalformedVariablesJson)?;
    let Value::Object(object) = value else {
        return Err(CommandError::MalformedVariablesJson);
    };
    let mut map = HashMap::with_capacity(object.len());
    for (key, value) in object {
        let Value::String(text) = value else {
            return Err(CommandError::MalformedVariablesJson);
        };
        map.insert(key, text);
    }
    Ok(map)
}
