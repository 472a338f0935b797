//! Hub → instance routing
//!
//! Hub-level tools, resources, and prompts are the union of every Active
//! instance's surface under a per-instance prefix: `<id>_<tool>`,
//! `<id>_<uri>`, and `<id>/<prompt>`. Prefixes are parsed back against
//! the live instance-ID set because IDs may themselves contain the
//! separator.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::error::{HubError, HubResult};
use crate::instance::validate_tool_name;
use crate::manager::ConnectionManager;
use crate::protocol::messages::{
    CallToolResult, GetPromptParams, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool,
};

/// Deadline applied to every forwarded call
const FORWARD_DEADLINE: Duration = Duration::from_secs(30);

/// Routes hub-level calls to the owning instance client
#[derive(Debug, Clone)]
pub struct HubRouter {
    manager: ConnectionManager,
}

impl HubRouter {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Split `name` into (instance id, remainder) for the given
    /// separator, matching against live instance IDs. The longest
    /// matching ID wins.
    async fn resolve_prefix(&self, name: &str, separator: char) -> Option<(String, String)> {
        let mut best: Option<(String, String)> = None;
        for info in self.manager.list_instances().await {
            let id = info.instance.id;
            let prefix_len = id.len() + separator.len_utf8();
            if name.len() > prefix_len
                && name.starts_with(&id)
                && name[id.len()..].starts_with(separator)
                && best.as_ref().is_none_or(|(b, _)| id.len() > b.len())
            {
                best = Some((id.clone(), name[prefix_len..].to_string()));
            }
        }
        best
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Union of every Active instance's tools under `<id>_` prefixes.
    /// Instances that fail to answer are skipped, not fatal.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for info in self.manager.list_instances().await {
            let Some(client) = info.client else { continue };
            let id = &info.instance.id;
            match client.list_tools(Some(FORWARD_DEADLINE)).await {
                Ok(result) => {
                    self.manager.touch(id).await;
                    for tool in result.tools {
                        let name = format!("{id}_{}", tool.name);
                        if !validate_tool_name(&name) {
                            debug!(%name, "skipping tool with incompatible name");
                            continue;
                        }
                        tools.push(Tool { name, ..tool });
                    }
                }
                Err(err) => warn!(instance = %id, %err, "tools/list failed"),
            }
        }
        tools
    }

    /// Forward a prefixed tool call to its instance
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> HubResult<CallToolResult> {
        let Some((instance_id, tool)) = self.resolve_prefix(name, '_').await else {
            return Err(HubError::ToolNotFound(name.to_string()));
        };
        let client = self
            .manager
            .client_for_instance(&instance_id)
            .await
            .ok_or_else(|| HubError::not_connected(&instance_id))?;

        let result = client
            .call_tool(&tool, arguments, Some(FORWARD_DEADLINE))
            .await?;
        self.manager.touch(&instance_id).await;
        Ok(result)
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Union of every Active instance's resources under `<id>_` prefixes
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut resources = Vec::new();
        for info in self.manager.list_instances().await {
            let Some(client) = info.client else { continue };
            let id = &info.instance.id;
            match client.list_resources(Some(FORWARD_DEADLINE)).await {
                Ok(result) => {
                    self.manager.touch(id).await;
                    for resource in result.resources {
                        resources.push(Resource {
                            uri: format!("{id}_{}", resource.uri),
                            ..resource
                        });
                    }
                }
                Err(err) => warn!(instance = %id, %err, "resources/list failed"),
            }
        }
        resources
    }

    /// Forward a prefixed resource read to its instance
    pub async fn read_resource(&self, uri: &str) -> HubResult<ReadResourceResult> {
        let Some((instance_id, original)) = self.resolve_prefix(uri, '_').await else {
            return Err(HubError::ResourceNotFound(uri.to_string()));
        };
        let client = self
            .manager
            .client_for_instance(&instance_id)
            .await
            .ok_or_else(|| HubError::not_connected(&instance_id))?;

        let result = client
            .read_resource(&original, Some(FORWARD_DEADLINE))
            .await?;
        self.manager.touch(&instance_id).await;
        Ok(result)
    }

    // ========================================================================
    // Prompts
    // ========================================================================

    /// Union of every Active instance's prompts under `<id>/` prefixes
    pub async fn list_prompts(&self) -> Vec<Prompt> {
        let mut prompts = Vec::new();
        for info in self.manager.list_instances().await {
            let Some(client) = info.client else { continue };
            let id = &info.instance.id;
            match client.list_prompts(Some(FORWARD_DEADLINE)).await {
                Ok(result) => {
                    self.manager.touch(id).await;
                    for prompt in result.prompts {
                        prompts.push(Prompt {
                            name: format!("{id}/{}", prompt.name),
                            ..prompt
                        });
                    }
                }
                Err(err) => warn!(instance = %id, %err, "prompts/list failed"),
            }
        }
        prompts
    }

    /// Forward a prefixed prompt expansion to its instance
    pub async fn get_prompt(&self, params: GetPromptParams) -> HubResult<GetPromptResult> {
        let Some((instance_id, original)) = self.resolve_prefix(&params.name, '/').await else {
            return Err(HubError::PromptNotFound(params.name));
        };
        let client = self
            .manager
            .client_for_instance(&instance_id)
            .await
            .ok_or_else(|| HubError::not_connected(&instance_id))?;

        let result = client
            .get_prompt(
                GetPromptParams {
                    name: original,
                    arguments: params.arguments,
                },
                Some(FORWARD_DEADLINE),
            )
            .await?;
        self.manager.touch(&instance_id).await;
        Ok(result)
    }
}
