use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use std::fmt::{Display, Formatter, Result as FmtResult};


#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct ObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl ObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// How admission of a mirrored object is checked against its service cluster
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum WebhookStrategy {
    /// Admit without consulting the service cluster
    #[default]
    None,
    /// Dry run the destination write on the service cluster before admitting
    ServiceCluster,
}

impl Display for WebhookStrategy {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            WebhookStrategy::None => write!(f, "None"),
            WebhookStrategy::ServiceCluster => write!(f, "ServiceCluster"),
        }
    }
}

impl std::str::FromStr for WebhookStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" | "None" => Ok(WebhookStrategy::None),
            "ServiceCluster" => Ok(WebhookStrategy::ServiceCluster),
            other => Err(format!("unknown webhook strategy `{}`", other)),
        }
    }
}

/// Identifies one served version of a custom resource
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct CRDReference {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}
