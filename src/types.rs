use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Full attribute document returned by `GET /api/v1/appliance/{said}`.
#[derive(Debug, Deserialize)]
pub struct ApplianceData {
    pub attributes: HashMap<String, Attribute>,
}

/// A single named appliance property with its last-update timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub value: String,
    #[serde(rename = "updateTime")]
    pub update_time: i64,
}

/// Command envelope for `POST /api/v1/appliance/command`.
#[derive(Debug, Serialize)]
pub struct CommandEnvelope {
    pub body: HashMap<String, String>,
    pub header: CommandHeader,
}

#[derive(Debug, Serialize)]
pub struct CommandHeader {
    pub said: String,
    pub command: String,
}

impl CommandEnvelope {
    pub fn set_attributes(said: &str, attributes: HashMap<String, String>) -> Self {
        Self {
            body: attributes,
            header: CommandHeader {
                said: said.to_string(),
                command: "setAttributes".to_string(),
            },
        }
    }
}

/// Push message delivered over the event socket.
///
/// Values arrive as arbitrary JSON scalars and are stringified before
/// being written into the attribute table.
#[derive(Debug, Deserialize)]
pub struct EventMessage {
    pub timestamp: i64,
    #[serde(rename = "attributeMap")]
    pub attribute_map: HashMap<String, serde_json::Value>,
}

/// Response from `GET /api/v1/getUserDetails`.
#[derive(Debug, Deserialize)]
pub struct UserDetails {
    #[serde(rename = "accountId")]
    pub account_id: i64,
}

/// Entry in the `GET /api/v1/appliancebyaccount/{accountId}` listing,
/// keyed by account id and then by appliance category.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceInfo {
    #[serde(rename = "SAID")]
    pub said: String,
    #[serde(rename = "APPLIANCE_NAME")]
    pub appliance_name: String,
}

pub type AccountAppliances = HashMap<String, HashMap<String, Vec<ApplianceInfo>>>;
