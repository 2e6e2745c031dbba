// The controller runtime connects the reconciler to kube-rs. kube-rs watches
// CharacterCounters and the Services/Deployments they control, serializes
// invocations per object and calls reconcile for every relevant change and
// after every requeue interval.

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client, Resource,
};
use std::sync::Arc;
use tracing::*;

use crate::charactercounter_types::CharacterCounter;
use crate::config::ControllerConfig;
use crate::converger::Operation;
use crate::error::{Error, ErrorClass};
use crate::owner_reference::controlling_owner;
use crate::reconciler::{self, ReconcileOutcome};
use crate::store::{KubeStore, ObjectKey};

pub const CONTROLLER_NAME: &str = "charactercounter-controller";

// Data is passed to every reconcile and error_policy call.
pub struct Data {
    pub store: KubeStore,
    pub config: ControllerConfig,
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Maps an event on a managed child to the CharacterCounter controlling it.
pub fn owner_object_ref(meta: &metav1::ObjectMeta) -> Option<ObjectRef<CharacterCounter>> {
    controlling_owner::<CharacterCounter>(meta).map(|key| ObjectRef::new(&key.name).within(&key.namespace))
}

pub fn action_for_outcome(outcome: &ReconcileOutcome, config: &ControllerConfig) -> Action {
    match outcome {
        ReconcileOutcome::Deleted => Action::await_change(),
        ReconcileOutcome::Converged(_) => Action::requeue(config.resync_interval),
    }
}

pub fn action_for_error(error: &Error, config: &ControllerConfig) -> Action {
    match error.class() {
        ErrorClass::Transient => Action::requeue(config.error_backoff),
        // Rebuilding the same intent would fail again; wait for it to change.
        ErrorClass::Permanent => Action::await_change(),
    }
}

pub async fn reconcile(cc: Arc<CharacterCounter>, ctx: Arc<Data>) -> Result<Action, Error> {
    let name = cc
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = cc
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let key = ObjectKey::new(namespace.clone(), name.clone());

    let outcome = reconciler::reconcile(&ctx.store, &key).await?;
    for change in outcome.changes() {
        if change.operation != Operation::Unchanged {
            info!(
                object = %change.key,
                kind = change.kind,
                operation = %change.operation,
                "Converged managed object"
            );
        }
    }
    Ok(action_for_outcome(&outcome, &ctx.config))
}

pub fn error_policy(cc: Arc<CharacterCounter>, error: &Error, ctx: Arc<Data>) -> Action {
    let name = cc.metadata.name.as_deref().unwrap_or_default();
    match error.class() {
        ErrorClass::Transient => warn!("Reconcile {} failed, will retry: {}", name, error),
        ErrorClass::Permanent => error!("Reconcile {} failed permanently: {}", name, error),
    }
    action_for_error(error, &ctx.config)
}

pub fn report_controller_reconciled<K, QueueErr>(
    controller_name: &str,
    result: &std::result::Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

pub async fn run_controller(config: ControllerConfig) -> Result<()> {
    let client = Client::try_default().await?;
    let namespace = config.watch_namespace.clone();
    let ccs = api_for::<CharacterCounter>(&client, namespace.as_deref());
    let services = api_for::<corev1::Service>(&client, namespace.as_deref());
    let deployments = api_for::<appsv1::Deployment>(&client, namespace.as_deref());

    info!(
        "starting {} (resync {:?}, namespace {})",
        CONTROLLER_NAME,
        config.resync_interval,
        namespace.as_deref().unwrap_or("*")
    );
    let data = Arc::new(Data {
        store: KubeStore::new(client),
        config,
    });
    // Events on the children are attributed to their controlling CharacterCounter,
    // so drift on a Service or Deployment triggers a reconcile of its parent.
    Controller::new(ccs, watcher::Config::default())
        .watches(services, watcher::Config::default(), |svc| {
            owner_object_ref(&svc.metadata)
        })
        .watches(deployments, watcher::Config::default(), |deploy| {
            owner_object_ref(&deploy.metadata)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, data)
        .for_each(|res| async move { report_controller_reconciled(CONTROLLER_NAME, &res) })
        .await;
    info!("controller terminated");
    Ok(())
}
