use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use std::collections::BTreeMap;

use crate::charactercounter_types::*;
use crate::common::*;

// The builders below are pure: no I/O and no owner references. The owner
// reference is stamped by the linker right before the first write.

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn non_empty_vec<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

pub fn make_service(cc: &CharacterCounter, role: Role) -> corev1::Service {
    let component = cc.spec.component(role);
    corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(service_name(cc, role)),
            namespace: Some(managed_namespace(cc)),
            labels: non_empty_map(&cc.spec.labels),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            ports: non_empty_vec(&component.service_ports),
            selector: non_empty_map(&component.selector),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

/// Container args for a role. Only the frontend has any: the address of the
/// server tier's Service, derived from the intent and not from a live lookup.
pub fn make_container_args(cc: &CharacterCounter, role: Role) -> Option<Vec<String>> {
    match role {
        Role::Server => None,
        Role::Frontend => Some(vec![GRPC_ADDR_FLAG.to_string(), server_rpc_addr(cc)]),
    }
}

pub fn make_container(cc: &CharacterCounter, role: Role) -> corev1::Container {
    let component = cc.spec.component(role);
    corev1::Container {
        name: component.name.clone(),
        image: Some(component.image.clone()),
        args: make_container_args(cc, role),
        image_pull_policy: Some(IMAGE_PULL_POLICY.to_string()),
        ports: non_empty_vec(&component.ports),
        ..corev1::Container::default()
    }
}

pub fn make_deployment(cc: &CharacterCounter, role: Role) -> appsv1::Deployment {
    let component = cc.spec.component(role);
    appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(deployment_name(cc, role)),
            namespace: Some(managed_namespace(cc)),
            labels: non_empty_map(&cc.spec.labels),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(component.replicas.unwrap_or(DEFAULT_REPLICAS)),
            selector: metav1::LabelSelector {
                match_labels: non_empty_map(&component.selector),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: non_empty_map(&component.selector),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    containers: vec![make_container(cc, role)],
                    ..corev1::PodSpec::default()
                }),
            },
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    }
}
