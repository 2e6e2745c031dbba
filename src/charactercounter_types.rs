use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ramp-up.joe.ionos.io",
    version = "v1alpha1",
    kind = "CharacterCounter",
    shortname = "cc",
    status = "CharacterCounterStatus",
    namespaced
)]
pub struct CharacterCounterSpec {
    /// Namespace the managed children live in. Empty means "default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub frontend: CharacterCounterComponent,
    pub server: CharacterCounterComponent,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CharacterCounterComponent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<corev1::ContainerPort>,
    #[serde(
        rename = "servicePorts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub service_ports: Vec<corev1::ServicePort>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CharacterCounterCondition {
    Available,
    Progressing,
}

// Reserved for the observed workload state; this controller never writes it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CharacterCounterStatus {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<CharacterCounterCondition>,
}

/// The component tiers a CharacterCounter is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The character-counting RPC service.
    Server,
    /// The page-rendering front end that dials the server.
    Frontend,
}

impl Role {
    /// Reconcile order. The front tier's desired state names the server tier,
    /// so the server tier goes first.
    pub const ORDER: [Role; 2] = [Role::Server, Role::Frontend];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Frontend => write!(f, "frontend"),
        }
    }
}

impl CharacterCounterSpec {
    pub fn component(&self, role: Role) -> &CharacterCounterComponent {
        match role {
            Role::Server => &self.server,
            Role::Frontend => &self.frontend,
        }
    }
}
