//! Brain→node command payloads.
//!
//! Commands are posted to `{base_url}/api/instances/{instance_id}/{action}`.
//! Prepare carries the full material list; start, stop, and destroy only
//! identify the instance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use warren_id::{InstanceId, TemplateId, TemplateVersionId};

/// One template layer of a prepare command, lowest `order_index` first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareLayer {
    pub template_version_id: TemplateVersionId,
    pub template_id: TemplateId,
    pub version: String,
    pub checksum: String,
    pub s3_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<String>,
    pub order_index: i32,
}

/// Payload for the `prepare` action.
///
/// `variables` and `variables_json` are mutually exclusive; the agent rejects
/// payloads that set both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareInstanceCommand {
    pub instance_id: InstanceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_json: Option<String>,
    pub layers: Vec<PrepareLayer>,
}

/// Payload for the `start`, `stop`, and `destroy` actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCommand {
    pub instance_id: InstanceId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layer() -> PrepareLayer {
        PrepareLayer {
            template_version_id: TemplateVersionId::new(),
            template_id: TemplateId::new(),
            version: "1.2.0".to_string(),
            checksum: "ab".repeat(32),
            s3_key: "templates/base/1.2.0.tar.gz".to_string(),
            metadata_json: None,
            order_index: 0,
        }
    }

    #[test]
    fn prepare_serializes_camel_case() {
        let cmd = PrepareInstanceCommand {
            instance_id: InstanceId::new(),
            name: "lobby-1".to_string(),
            display_name: Some("Lobby".to_string()),
            ports_json: None,
            variables: None,
            variables_json: Some("{\"MOTD\":\"hi\"}".to_string()),
            layers: vec![sample_layer()],
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert!(value.get("instanceId").is_some());
        assert!(value.get("displayName").is_some());
        assert!(value.get("variablesJson").is_some());
        // None fields are omitted entirely, not serialized as null.
        assert!(value.get("portsJson").is_none());
        assert!(value.get("variables").is_none());
        let layer = &value["layers"][0];
        assert!(layer.get("templateVersionId").is_some());
        assert!(layer.get("templateId").is_some());
        assert!(layer.get("s3Key").is_some());
        assert!(layer.get("orderIndex").is_some());
        assert!(layer.get("metadataJson").is_none());
    }

    #[test]
    fn prepare_roundtrips() {
        let cmd = PrepareInstanceCommand {
            instance_id: InstanceId::new(),
            name: "arena-7".to_string(),
            display_name: None,
            ports_json: Some("[{\"port\":25565}]".to_string()),
            variables: Some(HashMap::from([(
                "SERVER_NAME".to_string(),
                "arena-7".to_string(),
            )])),
            variables_json: None,
            layers: vec![sample_layer(), sample_layer()],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: PrepareInstanceCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn instance_command_roundtrips() {
        let cmd = InstanceCommand {
            instance_id: InstanceId::new(),
            name: "lobby-1".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("instanceId"));
        let back: InstanceCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn prepare_accepts_missing_optionals() {
        let json = format!(
            "{{\"instanceId\":\"{}\",\"name\":\"n\",\"layers\":[]}}",
            InstanceId::new()
        );
        let cmd: PrepareInstanceCommand = serde_json::from_str(&json).unwrap();
        assert!(cmd.display_name.is_none());
        assert!(cmd.variables.is_none());
        assert!(cmd.variables_json.is_none());
        assert!(cmd.layers.is_empty());
    }
}
