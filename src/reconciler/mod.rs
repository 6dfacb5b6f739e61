//! Binding reconciliation
//!
//! Diffs desired ClusterRoleBindings against the managed ones on the cluster
//! and applies the difference: deletions, then additions, then updates.
//! Bindings are keyed by name only. Nothing without the management marker is
//! ever updated or deleted; an attempt to do so is a fatal
//! [`Error::OwnershipViolation`].

mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use tracing::{error, info, instrument};

pub use store::{BindingStore, KubeBindingStore};

#[cfg(test)]
pub use store::MockBindingStore;

use crate::binding::{binding_name, is_managed, mark_managed, DesiredBinding};
use crate::{Error, Result};

/// Changes needed to move the cluster to the desired bindings
///
/// Every list is ordered by binding name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Current bindings with no desired counterpart
    pub deletions: Vec<ClusterRoleBinding>,
    /// Desired bindings not yet on the cluster
    pub additions: Vec<ClusterRoleBinding>,
    /// Current bindings rewritten with desired roleRef and subjects
    pub updates: Vec<ClusterRoleBinding>,
    /// Names of the updates that change roleRef, which the API server rejects
    pub role_ref_changes: Vec<String>,
    /// Bindings present on both sides that already match
    pub unchanged: usize,
}

/// Counts of what a reconcile applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Bindings created
    pub added: usize,
    /// Bindings replaced
    pub updated: usize,
    /// Bindings deleted
    pub deleted: usize,
    /// Bindings left alone
    pub unchanged: usize,
}

impl ReconcilePlan {
    /// Diff `desired` against `current` by binding name
    ///
    /// Updates keep the current object's metadata (resourceVersion, labels,
    /// annotations) and take roleRef and subjects from the desired object.
    pub fn compute(desired: Vec<ClusterRoleBinding>, current: Vec<ClusterRoleBinding>) -> Self {
        let desired = by_name(desired);
        let mut current = by_name(current);
        let mut plan = Self::default();

        for (name, wanted) in desired {
            match current.remove(&name) {
                None => plan.additions.push(wanted),
                Some(existing) if same_content(&existing, &wanted) => plan.unchanged += 1,
                Some(mut existing) => {
                    if existing.role_ref != wanted.role_ref {
                        plan.role_ref_changes.push(name);
                    }
                    existing.role_ref = wanted.role_ref;
                    existing.subjects = wanted.subjects;
                    plan.updates.push(existing);
                }
            }
        }
        plan.deletions = current.into_values().collect();
        plan
    }

    /// Whether applying the plan would make no API calls
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.additions.is_empty() && self.updates.is_empty()
    }
}

fn by_name(bindings: Vec<ClusterRoleBinding>) -> BTreeMap<String, ClusterRoleBinding> {
    bindings
        .into_iter()
        .map(|crb| (binding_name(&crb).to_string(), crb))
        .collect()
}

fn same_content(a: &ClusterRoleBinding, b: &ClusterRoleBinding) -> bool {
    a.role_ref == b.role_ref
        && a.subjects.as_deref().unwrap_or_default() == b.subjects.as_deref().unwrap_or_default()
}

fn ensure_managed(crb: &ClusterRoleBinding, operation: &'static str) -> Result<()> {
    if is_managed(crb) {
        Ok(())
    } else {
        Err(Error::OwnershipViolation {
            binding: binding_name(crb).to_string(),
            operation,
        })
    }
}

/// Applies desired bindings to a [`BindingStore`]
pub struct Reconciler {
    store: Arc<dyn BindingStore>,
}

impl Reconciler {
    /// Create a reconciler over the given store
    pub fn new(store: Arc<dyn BindingStore>) -> Self {
        Self { store }
    }

    /// Make the managed bindings on the cluster match `desired`
    ///
    /// The first failing store call aborts the remaining operations; what was
    /// already applied stays applied and the next pass converges the rest.
    #[instrument(skip_all, fields(desired = desired.len()))]
    pub async fn upsert(&self, desired: &[DesiredBinding]) -> Result<ReconcileSummary> {
        let current = self.store.list_managed().await?;
        let desired = desired
            .iter()
            .map(DesiredBinding::to_cluster_role_binding)
            .collect();
        let plan = ReconcilePlan::compute(desired, current);

        info!(
            added = plan.additions.len(),
            updated = plan.updates.len(),
            deleted = plan.deletions.len(),
            unchanged = plan.unchanged,
            "reconciling ClusterRoleBindings"
        );
        self.apply(plan).await
    }

    /// Apply a computed plan: deletions, then additions, then updates
    pub async fn apply(&self, plan: ReconcilePlan) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary {
            unchanged: plan.unchanged,
            ..Default::default()
        };

        for crb in &plan.deletions {
            ensure_managed(crb, "delete")?;
            let name = binding_name(crb);
            self.store.delete(name).await?;
            info!(binding = %name, "deleted ClusterRoleBinding");
            summary.deleted += 1;
        }

        for mut crb in plan.additions {
            mark_managed(&mut crb);
            self.store.create(&crb).await?;
            info!(binding = %binding_name(&crb), "created ClusterRoleBinding");
            summary.added += 1;
        }

        for mut crb in plan.updates {
            ensure_managed(&crb, "update")?;
            mark_managed(&mut crb);
            let name = binding_name(&crb);
            if let Err(e) = self.store.replace(&crb).await {
                if plan.role_ref_changes.iter().any(|changed| changed == name) {
                    error!(
                        binding = %name,
                        role = %crb.role_ref.name,
                        "roleRef of an existing ClusterRoleBinding cannot be changed; \
                         delete it manually and the next pass recreates it"
                    );
                }
                return Err(e);
            }
            info!(binding = %binding_name(&crb), "updated ClusterRoleBinding");
            summary.updated += 1;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{UserIdentifier, EMAIL_TYPE, MANAGED_BY_ANNOTATION};
    use kube::api::ObjectMeta;
    use mockall::Sequence;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn desired(name: &str, role: &str, users: &[&str]) -> DesiredBinding {
        DesiredBinding {
            binding_name: name.to_string(),
            role_name: role.to_string(),
            users: users
                .iter()
                .map(|u| UserIdentifier::new(EMAIL_TYPE, *u))
                .collect(),
            source: "default/bindings".to_string(),
        }
    }

    /// A binding as the API server would return it
    fn existing(name: &str, role: &str, users: &[&str], managed: bool) -> ClusterRoleBinding {
        let mut crb = desired(name, role, users).to_cluster_role_binding();
        crb.metadata.resource_version = Some("42".to_string());
        crb.metadata.uid = Some(format!("uid-{name}"));
        if !managed {
            crb.metadata.annotations = None;
        }
        crb
    }

    fn names(bindings: &[ClusterRoleBinding]) -> Vec<&str> {
        bindings.iter().map(binding_name).collect()
    }

    fn reconciler(store: MockBindingStore) -> Reconciler {
        Reconciler::new(Arc::new(store))
    }

    #[rstest]
    #[case(&["a", "b"], &[], &["a", "b"], &[], &[])]
    #[case(&[], &["a", "b"], &[], &["a", "b"], &[])]
    #[case(&["a", "b", "c"], &["b", "c", "d"], &["a"], &["d"], &["b", "c"])]
    #[case(&["x"], &["x"], &[], &[], &["x"])]
    #[case(&[], &[], &[], &[], &[])]
    fn test_plan_partitions_names(
        #[case] desired_names: &[&str],
        #[case] current_names: &[&str],
        #[case] added: &[&str],
        #[case] deleted: &[&str],
        #[case] updated: &[&str],
    ) {
        // Roles differ so every overlapping name is an update
        let desired_bindings = desired_names
            .iter()
            .map(|n| desired(n, "edit", &["u@x.com"]).to_cluster_role_binding())
            .collect();
        let current_bindings = current_names
            .iter()
            .map(|n| existing(n, "view", &["u@x.com"], true))
            .collect();

        let plan = ReconcilePlan::compute(desired_bindings, current_bindings);

        assert_eq!(names(&plan.additions), added);
        assert_eq!(names(&plan.deletions), deleted);
        assert_eq!(names(&plan.updates), updated);

        let add: BTreeSet<_> = names(&plan.additions).into_iter().collect();
        let del: BTreeSet<_> = names(&plan.deletions).into_iter().collect();
        assert!(add.is_disjoint(&del));
    }

    #[test]
    fn test_update_keeps_current_identity_and_takes_desired_content() {
        let plan = ReconcilePlan::compute(
            vec![desired("readers", "view", &["a@x.com"]).to_cluster_role_binding()],
            vec![existing("readers", "edit", &["b@x.com"], true)],
        );

        assert_eq!(plan.updates.len(), 1);
        let update = &plan.updates[0];
        assert_eq!(update.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(update.metadata.uid.as_deref(), Some("uid-readers"));
        assert_eq!(update.role_ref.name, "view");
        let subjects = update.subjects.as_ref().expect("subjects");
        assert_eq!(subjects[0].name, "a@x.com");
    }

    #[test]
    fn test_role_ref_changes_are_singled_out_among_updates() {
        let plan = ReconcilePlan::compute(
            vec![
                desired("admins", "cluster-admin", &["a@x.com", "b@x.com"]).to_cluster_role_binding(),
                desired("readers", "view", &["a@x.com"]).to_cluster_role_binding(),
            ],
            vec![
                existing("admins", "cluster-admin", &["a@x.com"], true),
                existing("readers", "edit", &["a@x.com"], true),
            ],
        );

        assert_eq!(names(&plan.updates), vec!["admins", "readers"]);
        assert_eq!(plan.role_ref_changes, vec!["readers".to_string()]);
    }

    #[test]
    fn test_matching_binding_is_unchanged() {
        let plan = ReconcilePlan::compute(
            vec![desired("readers", "view", &["a@x.com"]).to_cluster_role_binding()],
            vec![existing("readers", "view", &["a@x.com"], true)],
        );

        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_missing_and_empty_subjects_match() {
        let mut wanted = desired("empty", "view", &[]).to_cluster_role_binding();
        wanted.subjects = Some(Vec::new());
        let mut current = existing("empty", "view", &[], true);
        current.subjects = None;

        let plan = ReconcilePlan::compute(vec![wanted], vec![current]);
        assert_eq!(plan.unchanged, 1);
    }

    /// Story: a new binding in a ConfigMap is created on the cluster
    #[tokio::test]
    async fn story_new_binding_is_created() {
        let mut store = MockBindingStore::new();
        store.expect_list_managed().returning(|| Ok(Vec::new()));
        store
            .expect_create()
            .withf(|crb| {
                binding_name(crb) == "admins"
                    && crb.role_ref.name == "cluster-admin"
                    && is_managed(crb)
                    && crb.subjects.as_ref().is_some_and(|s| {
                        s.len() == 1 && s[0].name == "100000000001-1700000000"
                    })
            })
            .times(1)
            .returning(|_| Ok(()));
        store.expect_delete().never();
        store.expect_replace().never();

        let summary = reconciler(store)
            .upsert(&[desired("admins", "cluster-admin", &["100000000001-1700000000"])])
            .await
            .expect("upsert");

        assert_eq!(summary.added, 1);
        assert_eq!(summary.deleted, 0);
    }

    /// Story: a binding removed from every ConfigMap is deleted
    #[tokio::test]
    async fn story_removed_binding_is_deleted() {
        let mut store = MockBindingStore::new();
        store
            .expect_list_managed()
            .returning(|| Ok(vec![existing("admins", "cluster-admin", &["a"], true)]));
        store
            .expect_delete()
            .withf(|name| name == "admins")
            .times(1)
            .returning(|_| Ok(()));
        store.expect_create().never();

        let summary = reconciler(store).upsert(&[]).await.expect("upsert");
        assert_eq!(summary.deleted, 1);
    }

    /// Story: a hand-made binding with the same name is invisible and survives
    #[tokio::test]
    async fn story_unmanaged_binding_is_never_deleted() {
        let mut store = MockBindingStore::new();
        // The store only lists marked bindings, so the hand-made one is absent
        store.expect_list_managed().returning(|| Ok(Vec::new()));
        store.expect_delete().never();

        let summary = reconciler(store).upsert(&[]).await.expect("upsert");
        assert_eq!(summary, ReconcileSummary::default());
    }

    /// Story: changing a binding's role replaces it in place
    #[tokio::test]
    async fn story_changed_role_is_one_update() {
        let mut store = MockBindingStore::new();
        store
            .expect_list_managed()
            .returning(|| Ok(vec![existing("readers", "edit", &["a@x.com"], true)]));
        store
            .expect_replace()
            .withf(|crb| {
                crb.role_ref.name == "view"
                    && crb.metadata.resource_version.as_deref() == Some("42")
                    && is_managed(crb)
            })
            .times(1)
            .returning(|_| Ok(()));
        store.expect_create().never();
        store.expect_delete().never();

        let summary = reconciler(store)
            .upsert(&[desired("readers", "view", &["a@x.com"])])
            .await
            .expect("upsert");
        assert_eq!(summary.updated, 1);
    }

    #[rstest]
    #[case::delete(ReconcilePlan {
        deletions: vec![existing("admins", "view", &[], false)],
        ..Default::default()
    }, "delete")]
    #[case::update(ReconcilePlan {
        updates: vec![existing("admins", "view", &[], false)],
        ..Default::default()
    }, "update")]
    #[tokio::test]
    async fn test_unmarked_binding_never_reaches_store(
        #[case] plan: ReconcilePlan,
        #[case] operation: &str,
    ) {
        let mut store = MockBindingStore::new();
        store.expect_delete().never();
        store.expect_replace().never();
        store.expect_create().never();

        let err = reconciler(store).apply(plan).await.err().expect("should refuse");

        assert!(err.is_fatal());
        match err {
            Error::OwnershipViolation { binding, operation: op } => {
                assert_eq!(binding, "admins");
                assert_eq!(op, operation);
            }
            other => panic!("expected ownership violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_run_delete_add_update() {
        let mut seq = Sequence::new();
        let mut store = MockBindingStore::new();
        store.expect_list_managed().returning(|| {
            Ok(vec![
                existing("old", "view", &["a"], true),
                existing("readers", "edit", &["a"], true),
            ])
        });
        store
            .expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_replace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let summary = reconciler(store)
            .upsert(&[
                desired("new", "view", &["a"]),
                desired("readers", "view", &["a"]),
            ])
            .await
            .expect("upsert");

        assert_eq!(
            summary,
            ReconcileSummary {
                added: 1,
                updated: 1,
                deleted: 1,
                unchanged: 0,
            }
        );
    }

    /// Story: the API server refuses a roleRef change and the pass stops there
    #[tokio::test]
    async fn story_rejected_role_change_blocks_later_updates() {
        let mut store = MockBindingStore::new();
        store.expect_list_managed().returning(|| {
            Ok(vec![
                existing("admins", "edit", &["a"], true),
                existing("readers", "view", &["a"], true),
            ])
        });
        store
            .expect_replace()
            .withf(|crb| binding_name(crb) == "admins")
            .times(1)
            .returning(|_| Err(Error::validation("roleRef: Invalid value: cannot change roleRef")));
        store
            .expect_replace()
            .withf(|crb| binding_name(crb) == "readers")
            .never();

        let err = reconciler(store)
            .upsert(&[
                desired("admins", "cluster-admin", &["a"]),
                desired("readers", "view", &["a", "b"]),
            ])
            .await
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("cannot change roleRef"));
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_operations() {
        let mut store = MockBindingStore::new();
        store
            .expect_list_managed()
            .returning(|| Ok(vec![existing("readers", "edit", &["a"], true)]));
        store
            .expect_create()
            .times(1)
            .returning(|_| Err(Error::validation("admission webhook denied")));
        store.expect_replace().never();

        let err = reconciler(store)
            .upsert(&[
                desired("admins", "cluster-admin", &["a"]),
                desired("readers", "view", &["a"]),
            ])
            .await
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("admission webhook denied"));
    }

    #[tokio::test]
    async fn test_additions_are_stamped_even_without_marker() {
        let mut crb = desired("admins", "view", &["a"]).to_cluster_role_binding();
        crb.metadata = ObjectMeta {
            name: Some("admins".to_string()),
            ..Default::default()
        };

        let mut store = MockBindingStore::new();
        store
            .expect_create()
            .withf(|crb| {
                crb.metadata
                    .annotations
                    .as_ref()
                    .is_some_and(|a| a.contains_key(MANAGED_BY_ANNOTATION))
            })
            .times(1)
            .returning(|_| Ok(()));

        let plan = ReconcilePlan {
            additions: vec![crb],
            ..Default::default()
        };
        reconciler(store).apply(plan).await.expect("apply");
    }

    #[tokio::test]
    async fn test_list_failure_is_returned() {
        let mut store = MockBindingStore::new();
        store
            .expect_list_managed()
            .returning(|| Err(Error::validation("forbidden")));

        let result = reconciler(store).upsert(&[]).await;
        assert!(result.is_err());
    }
}
