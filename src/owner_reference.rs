use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use thiserror::Error;

use crate::store::ObjectKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("owner {0} has no uid, it is not persisted or was deleted")]
    OwnerNotPersisted(String),
    #[error("owner {0} is being deleted")]
    OwnerDeleting(String),
    #[error("owner lives in namespace {owner} but the object in {child}")]
    CrossNamespace { owner: String, child: String },
    #[error("object is already controlled by {kind} {name}")]
    AlreadyControlled { kind: String, name: String },
}

impl LinkError {
    /// Whether a later attempt may succeed without the intent changing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::OwnerNotPersisted(_) | LinkError::OwnerDeleting(_)
        )
    }
}

/// Stamps `child` with a controller owner reference to `parent`.
///
/// Must run before the child's first write. Fails closed: when no valid
/// reference can be built the caller has to abort the write instead of
/// producing an orphan.
pub fn link<C, P>(child: &mut C, parent: &P) -> Result<(), LinkError>
where
    C: Resource,
    P: Resource<DynamicType = ()>,
{
    let parent_meta = parent.meta();
    let parent_name = parent_meta.name.clone().unwrap_or_default();
    // Already controlled by this parent: nothing to write, even while it is being deleted.
    if let Some(uid) = parent_meta.uid.as_deref() {
        let controlled_by_parent = child
            .meta()
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.controller == Some(true) && o.uid == uid);
        if controlled_by_parent {
            return Ok(());
        }
    }
    if parent_meta.deletion_timestamp.is_some() {
        return Err(LinkError::OwnerDeleting(parent_name));
    }
    // controller_owner_ref is None unless both name and uid are known.
    let oref = parent
        .controller_owner_ref(&())
        .ok_or_else(|| LinkError::OwnerNotPersisted(parent_name))?;

    let parent_ns = parent_meta.namespace.clone().unwrap_or_default();
    let child_ns = child.meta().namespace.clone().unwrap_or_default();
    if parent_ns != child_ns {
        return Err(LinkError::CrossNamespace {
            owner: parent_ns,
            child: child_ns,
        });
    }

    let orefs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(existing) = orefs.iter().find(|o| o.controller == Some(true)) {
        if existing.uid == oref.uid {
            return Ok(());
        }
        return Err(LinkError::AlreadyControlled {
            kind: existing.kind.clone(),
            name: existing.name.clone(),
        });
    }
    orefs.retain(|o| o.uid != oref.uid);
    orefs.push(oref);
    Ok(())
}

/// Attributes an event on a child object to the `P` that controls it, if any.
pub fn controlling_owner<P>(child: &metav1::ObjectMeta) -> Option<ObjectKey>
where
    P: Resource<DynamicType = ()>,
{
    let namespace = child.namespace.clone()?;
    child
        .owner_references
        .iter()
        .flatten()
        .find(|o| {
            o.controller == Some(true)
                && o.kind == P::kind(&())
                && o.api_version == P::api_version(&())
        })
        .map(|o| ObjectKey::new(namespace, o.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charactercounter_types::*;
    use k8s_openapi::api::core::v1 as corev1;

    fn make_parent(uid: Option<&str>) -> CharacterCounter {
        let mut cc = CharacterCounter::new("counter", CharacterCounterSpec::default());
        cc.metadata.namespace = Some("default".to_string());
        cc.metadata.uid = uid.map(str::to_string);
        cc
    }

    fn make_child(namespace: &str) -> corev1::Service {
        corev1::Service {
            metadata: metav1::ObjectMeta {
                name: Some("srv".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn link_sets_single_controller_reference() {
        let parent = make_parent(Some("uid-1"));
        let mut child = make_child("default");
        link(&mut child, &parent).unwrap();
        // Linking twice does not duplicate the reference.
        link(&mut child, &parent).unwrap();

        let orefs = child.metadata.owner_references.unwrap();
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].uid, "uid-1");
        assert_eq!(orefs[0].name, "counter");
        assert_eq!(orefs[0].kind, "CharacterCounter");
        assert_eq!(orefs[0].api_version, "ramp-up.joe.ionos.io/v1alpha1");
        assert_eq!(orefs[0].controller, Some(true));
        assert_eq!(orefs[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn link_fails_closed_without_uid() {
        let parent = make_parent(None);
        let mut child = make_child("default");
        let err = link(&mut child, &parent).unwrap_err();
        assert_eq!(err, LinkError::OwnerNotPersisted("counter".to_string()));
        assert!(err.is_retryable());
        assert!(child.metadata.owner_references.is_none());
    }

    #[test]
    fn link_rejects_cross_namespace_child() {
        let parent = make_parent(Some("uid-1"));
        let mut child = make_child("elsewhere");
        let err = link(&mut child, &parent).unwrap_err();
        assert!(matches!(err, LinkError::CrossNamespace { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn link_refuses_to_steal_controlled_child() {
        let mut child = make_child("default");
        link(&mut child, &make_parent(Some("uid-1"))).unwrap();
        let err = link(&mut child, &make_parent(Some("uid-2"))).unwrap_err();
        assert!(matches!(err, LinkError::AlreadyControlled { .. }));
        assert_eq!(child.metadata.owner_references.unwrap()[0].uid, "uid-1");
    }

    #[test]
    fn deleting_owner_keeps_existing_link_but_refuses_new_ones() {
        let mut child = make_child("default");
        link(&mut child, &make_parent(Some("uid-1"))).unwrap();

        let mut deleting = make_parent(Some("uid-1"));
        deleting.metadata.deletion_timestamp = Some(metav1::Time(k8s_openapi::chrono::Utc::now()));
        link(&mut child, &deleting).unwrap();
        assert_eq!(child.metadata.owner_references.as_ref().unwrap().len(), 1);

        let mut fresh = make_child("default");
        let err = link(&mut fresh, &deleting).unwrap_err();
        assert_eq!(err, LinkError::OwnerDeleting("counter".to_string()));
        assert!(err.is_retryable());
        assert!(fresh.metadata.owner_references.is_none());
    }

    #[test]
    fn events_are_attributed_to_controlling_intent() {
        let parent = make_parent(Some("uid-1"));
        let mut child = make_child("default");
        assert_eq!(controlling_owner::<CharacterCounter>(&child.metadata), None);

        link(&mut child, &parent).unwrap();
        assert_eq!(
            controlling_owner::<CharacterCounter>(&child.metadata),
            Some(ObjectKey::new("default", "counter"))
        );
        assert_eq!(controlling_owner::<corev1::ConfigMap>(&child.metadata), None);
    }
}
