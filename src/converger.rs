//! Drives one managed object towards its desired state with minimal writes.
//!
//! Only the fields the builders control are compared and written back; the
//! rest of the live object (store-assigned metadata, fields defaulted by the
//! API server, anything other actors added) is carried over untouched. The
//! Deployment's containers are create-once: a container is inserted when it
//! is missing, otherwise only its image and args are refreshed.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;
use std::fmt;
use tracing::*;

use crate::error::Error;
use crate::owner_reference::link;
use crate::store::{version_of, ObjectKey, Store, StoreError, StoreObject};

// How many times a write that lost a race is retried against a fresh read.
const CONFLICT_RETRIES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Created => write!(f, "created"),
            Operation::Updated => write!(f, "updated"),
            Operation::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// A kind whose builder-controlled fields can be merged into a live object.
pub trait ControlledFields: StoreObject {
    const KIND: &'static str;

    /// Overwrites the controlled fields of `live` with those of `desired`.
    /// Returns whether anything changed.
    fn merge_controlled(live: &mut Self, desired: &Self) -> bool;
}

impl ControlledFields for corev1::Service {
    const KIND: &'static str = <corev1::Service as k8s_openapi::Resource>::KIND;

    fn merge_controlled(live: &mut Self, desired: &Self) -> bool {
        merge_service(live, desired)
    }
}

impl ControlledFields for appsv1::Deployment {
    const KIND: &'static str = <appsv1::Deployment as k8s_openapi::Resource>::KIND;

    fn merge_controlled(live: &mut Self, desired: &Self) -> bool {
        merge_deployment(live, desired)
    }
}

fn same_map(a: Option<&BTreeMap<String, String>>, b: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    a.unwrap_or(&empty) == b.unwrap_or(&empty)
}

fn same_args(a: Option<&Vec<String>>, b: Option<&Vec<String>>) -> bool {
    a.map(Vec::as_slice).unwrap_or_default() == b.map(Vec::as_slice).unwrap_or_default()
}

/// Applies the API server's port defaults so a defaulted live port compares
/// equal to the port it was created from.
fn defaulted_service_ports(ports: Option<&Vec<corev1::ServicePort>>) -> Vec<corev1::ServicePort> {
    ports
        .into_iter()
        .flatten()
        .map(|port| corev1::ServicePort {
            protocol: port.protocol.clone().or_else(|| Some("TCP".to_string())),
            target_port: port
                .target_port
                .clone()
                .or(Some(IntOrString::Int(port.port))),
            ..port.clone()
        })
        .collect()
}

fn merge_labels(live: &mut Option<BTreeMap<String, String>>, desired: &Option<BTreeMap<String, String>>) -> bool {
    if same_map(live.as_ref(), desired.as_ref()) {
        return false;
    }
    *live = desired.clone();
    true
}

/// Merges labels, selector and ports of a desired Service into a live one.
pub fn merge_service(live: &mut corev1::Service, desired: &corev1::Service) -> bool {
    let mut changed = merge_labels(&mut live.metadata.labels, &desired.metadata.labels);

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let live_spec = live.spec.get_or_insert_with(corev1::ServiceSpec::default);
    if !same_map(live_spec.selector.as_ref(), desired_spec.selector.as_ref()) {
        live_spec.selector = desired_spec.selector.clone();
        changed = true;
    }
    if defaulted_service_ports(live_spec.ports.as_ref())
        != defaulted_service_ports(desired_spec.ports.as_ref())
    {
        live_spec.ports = desired_spec.ports.clone();
        changed = true;
    }
    changed
}

/// Merges labels, replicas, selector, template labels and the managed
/// container of a desired Deployment into a live one.
pub fn merge_deployment(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    let mut changed = merge_labels(&mut live.metadata.labels, &desired.metadata.labels);

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let live_spec = live.spec.get_or_insert_with(appsv1::DeploymentSpec::default);
    if live_spec.replicas != desired_spec.replicas {
        live_spec.replicas = desired_spec.replicas;
        changed = true;
    }
    if !same_map(
        live_spec.selector.match_labels.as_ref(),
        desired_spec.selector.match_labels.as_ref(),
    ) {
        live_spec.selector.match_labels = desired_spec.selector.match_labels.clone();
        changed = true;
    }

    // Pods must keep matching the selector; other template labels stay.
    let desired_template_labels = desired_spec
        .template
        .metadata
        .as_ref()
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default();
    if !desired_template_labels.is_empty() {
        let live_template_labels = live_spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new);
        for (key, value) in desired_template_labels {
            if live_template_labels.get(&key) != Some(&value) {
                live_template_labels.insert(key, value);
                changed = true;
            }
        }
    }

    let Some(desired_container) = desired_spec
        .template
        .spec
        .as_ref()
        .and_then(|pod| pod.containers.first())
    else {
        return changed;
    };
    let live_pod = live_spec
        .template
        .spec
        .get_or_insert_with(corev1::PodSpec::default);
    match live_pod
        .containers
        .iter_mut()
        .find(|c| c.name == desired_container.name)
    {
        None => {
            live_pod.containers.insert(0, desired_container.clone());
            changed = true;
        }
        Some(container) => {
            if container.image != desired_container.image {
                container.image = desired_container.image.clone();
                changed = true;
            }
            if !same_args(container.args.as_ref(), desired_container.args.as_ref()) {
                container.args = desired_container.args.clone();
                changed = true;
            }
        }
    }
    changed
}

/// Creates `desired` if it is absent, or writes back the controlled fields
/// when the live object has drifted. Returns which of the two happened, or
/// [`Operation::Unchanged`] without any write when nothing drifted.
pub async fn converge<S, K, P>(store: &S, desired: &K, owner: &P) -> Result<Operation, Error>
where
    S: Store,
    K: ControlledFields,
    P: Resource<DynamicType = ()> + Sync,
{
    let key = ObjectKey::of(desired).ok_or(Error::MissingObjectKey(".metadata.namespace/.metadata.name"))?;
    let converge_failed = |source: StoreError| Error::ConvergeFailed {
        kind: K::KIND,
        key: key.clone(),
        source,
    };
    let link_failed = |source| Error::LinkFailed {
        kind: K::KIND,
        key: key.clone(),
        source,
    };

    let mut attempt = 0;
    loop {
        let can_retry = attempt < CONFLICT_RETRIES;
        attempt += 1;

        match store.get::<K>(&key.namespace, &key.name).await {
            Err(StoreError::NotFound) => {
                let mut obj = desired.clone();
                link(&mut obj, owner).map_err(link_failed)?;
                match store.create(&obj).await {
                    Ok(_) => {
                        info!("Created {} {}", K::KIND, key);
                        return Ok(Operation::Created);
                    }
                    Err(StoreError::AlreadyExists) if can_retry => {
                        warn!("{} {} appeared concurrently, retrying", K::KIND, key);
                    }
                    Err(e) => return Err(converge_failed(e)),
                }
            }
            Err(e) => return Err(converge_failed(e)),
            Ok(mut live) => {
                let owners_before = live.meta().owner_references.clone();
                // Adopts an unowned live object; refuses one controlled by someone else.
                link(&mut live, owner).map_err(link_failed)?;
                let relinked = live.meta().owner_references != owners_before;
                let drifted = K::merge_controlled(&mut live, desired);
                if !relinked && !drifted {
                    debug!("{} {} unchanged", K::KIND, key);
                    return Ok(Operation::Unchanged);
                }
                let version = version_of(&live)
                    .ok_or_else(|| {
                        converge_failed(StoreError::Invalid("live object has no resourceVersion".to_string()))
                    })?
                    .to_string();
                match store.update(&live, &version).await {
                    Ok(_) => {
                        info!("Updated {} {}", K::KIND, key);
                        return Ok(Operation::Updated);
                    }
                    Err(StoreError::Conflict) if can_retry => {
                        warn!("{} {} changed since rv {}, retrying", K::KIND, key, version);
                    }
                    Err(e) => return Err(converge_failed(e)),
                }
            }
        }
    }
}
