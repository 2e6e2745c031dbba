use crate::charactercounter_types::*;

pub const DEFAULT_NAMESPACE: &str = "default";

// Replica count used when a component leaves it unset.
pub const DEFAULT_REPLICAS: i32 = 1;

// The frontend always dials the server through its Service on this port.
pub const SERVER_RPC_PORT: i32 = 80;

pub const GRPC_ADDR_FLAG: &str = "-grpc-addr";

pub const IMAGE_PULL_POLICY: &str = "IfNotPresent";

pub fn managed_namespace(cc: &CharacterCounter) -> String {
    match cc.spec.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => DEFAULT_NAMESPACE.to_string(),
    }
}

pub fn service_name(cc: &CharacterCounter, role: Role) -> String {
    cc.spec.component(role).name.clone()
}

pub fn deployment_name(cc: &CharacterCounter, role: Role) -> String {
    cc.spec.component(role).name.clone()
}

pub fn server_rpc_addr(cc: &CharacterCounter) -> String {
    format!("{}:{}", service_name(cc, Role::Server), SERVER_RPC_PORT)
}

/// Fills in every optional field the builders rely on, so that the desired
/// objects are total. Mirrors what the API server would default.
pub fn with_defaults(mut cc: CharacterCounter) -> CharacterCounter {
    cc.spec.namespace = Some(managed_namespace(&cc));
    for component in [&mut cc.spec.server, &mut cc.spec.frontend] {
        if component.replicas.is_none() {
            component.replicas = Some(DEFAULT_REPLICAS);
        }
    }
    cc
}
