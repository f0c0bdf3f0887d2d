//! Scaling controller behavior: bounds, ghost reservations, targeted
//! deletion, and node-to-group resolution.

mod common;

use common::{settings_with_group, Harness, GROUP};
use proxmox_ca_domain::DomainError;
use proxmox_ca_shared::{VmState, Vmid};
use rstest::rstest;

#[tokio::test]
async fn desired_defaults_to_min_size_on_first_read() {
    let h = Harness::new(settings_with_group(2, 5)).await;
    assert_eq!(h.desired().await, 2);
}

#[tokio::test]
async fn increase_beyond_max_is_out_of_range_and_leaves_desired_untouched() {
    let h = Harness::new(settings_with_group(0, 3)).await;
    h.scaling.increase_size(GROUP, 1).await.unwrap();

    let err = h.scaling.increase_size(GROUP, 10).await.unwrap_err();
    assert!(matches!(err, DomainError::OutOfRange { .. }));
    assert_eq!(h.desired().await, 1);
}

#[rstest]
#[case(0)]
#[case(-2)]
#[tokio::test]
async fn increase_requires_a_positive_delta(#[case] delta: i64) {
    let h = Harness::new(settings_with_group(0, 3)).await;
    let err = h.scaling.increase_size(GROUP, delta).await.unwrap_err();
    assert!(matches!(err, DomainError::OutOfRange { .. }));
}

#[rstest]
#[case(0)]
#[case(3)]
#[tokio::test]
async fn decrease_requires_a_negative_delta(#[case] delta: i64) {
    let h = Harness::new(settings_with_group(0, 3)).await;
    let err = h
        .scaling
        .decrease_target_size(GROUP, delta)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::OutOfRange { .. }));
}

#[tokio::test]
async fn decrease_shrinks_headroom_but_never_live_capacity() {
    let h = Harness::new(settings_with_group(0, 5)).await;
    h.scaling.increase_size(GROUP, 4).await.unwrap();
    h.insert_row(Vmid(101), VmState::Active, Harness::now()).await;
    h.insert_row(Vmid(102), VmState::Active, Harness::now()).await;

    // 4 desired, 2 live: two slots of headroom may be released.
    let err = h
        .scaling
        .decrease_target_size(GROUP, -3)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::OutOfRange { .. }));
    assert_eq!(h.desired().await, 4);

    h.scaling.decrease_target_size(GROUP, -2).await.unwrap();
    assert_eq!(h.desired().await, 2);
}

#[tokio::test]
async fn desired_stays_within_bounds_across_any_successful_sequence() {
    let h = Harness::new(settings_with_group(1, 4)).await;
    let deltas: [i64; 12] = [3, -1, 2, -2, 5, 1, -4, -1, 2, 2, -1, 7];
    let group = h.group().clone();

    for delta in deltas {
        let result = if delta >= 0 {
            h.scaling.increase_size(GROUP, delta).await
        } else {
            h.scaling.decrease_target_size(GROUP, delta).await
        };
        // Some of these are rejected; either way the invariant holds.
        let _ = result;
        let desired = h.desired().await;
        assert!(
            desired >= group.min_size && desired <= group.max_size,
            "desired {desired} escaped [{}, {}]",
            group.min_size,
            group.max_size
        );
    }
}

#[tokio::test]
async fn delete_nodes_marks_rows_and_decrements_desired_exactly() {
    let h = Harness::new(settings_with_group(0, 5)).await;
    h.scaling.increase_size(GROUP, 3).await.unwrap();
    for vmid in [101, 102, 103] {
        h.insert_row(Vmid(vmid), VmState::Active, Harness::now()).await;
        h.join_node(Vmid(vmid)).await;
    }

    h.scaling
        .delete_nodes(
            GROUP,
            &["ca-web-101".to_string(), "ca-web-103".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(h.row(Vmid(101)).await.unwrap().state, VmState::DeletingVm);
    assert_eq!(h.row(Vmid(102)).await.unwrap().state, VmState::Active);
    assert_eq!(h.row(Vmid(103)).await.unwrap().state, VmState::DeletingVm);
    assert_eq!(h.desired().await, 1);
}

#[tokio::test]
async fn delete_nodes_ignores_unknown_nodes() {
    let h = Harness::new(settings_with_group(0, 5)).await;
    h.scaling.increase_size(GROUP, 1).await.unwrap();
    h.insert_row(Vmid(101), VmState::Active, Harness::now()).await;

    h.scaling
        .delete_nodes(GROUP, &["no-such-node".to_string()])
        .await
        .unwrap();

    assert_eq!(h.row(Vmid(101)).await.unwrap().state, VmState::Active);
    assert_eq!(h.desired().await, 1);
}

#[tokio::test]
async fn delete_nodes_falls_back_to_hostname_matching() {
    let h = Harness::new(settings_with_group(0, 5)).await;
    h.scaling.increase_size(GROUP, 1).await.unwrap();
    // Row exists but the node never registered in Kubernetes.
    h.insert_row(Vmid(101), VmState::Pending, Harness::now()).await;

    h.scaling
        .delete_nodes(GROUP, &["ca-web-101".to_string()])
        .await
        .unwrap();

    assert_eq!(h.row(Vmid(101)).await.unwrap().state, VmState::DeletingVm);
    assert_eq!(h.desired().await, 0);
}

#[tokio::test]
async fn delete_nodes_is_idempotent_for_already_deleting_rows() {
    let h = Harness::new(settings_with_group(0, 5)).await;
    h.scaling.increase_size(GROUP, 1).await.unwrap();
    h.insert_row(Vmid(101), VmState::Active, Harness::now()).await;
    h.join_node(Vmid(101)).await;

    h.scaling
        .delete_nodes(GROUP, &["ca-web-101".to_string()])
        .await
        .unwrap();
    h.scaling
        .delete_nodes(GROUP, &["ca-web-101".to_string()])
        .await
        .unwrap();

    assert_eq!(h.row(Vmid(101)).await.unwrap().state, VmState::DeletingVm);
    // Only the first call decremented.
    assert_eq!(h.desired().await, 0);
}

#[tokio::test]
async fn unknown_group_is_reported_as_not_found() {
    let h = Harness::new(settings_with_group(0, 3)).await;
    let err = h.scaling.target_size("db").await.unwrap_err();
    assert!(matches!(err, DomainError::GroupNotFound { .. }));
}

#[tokio::test]
async fn group_for_node_resolves_labels_then_hostnames() {
    let h = Harness::new(settings_with_group(0, 3)).await;
    h.kube.register_node("ca-web-101", GROUP, Vmid(101));

    let group = h.scaling.group_for_node("ca-web-101").await.unwrap();
    assert_eq!(group.map(|g| g.id.as_str()), Some(GROUP));

    // Not in Kubernetes, but a store row carries the hostname.
    h.insert_row(Vmid(102), VmState::Pending, Harness::now()).await;
    let group = h.scaling.group_for_node("ca-web-102").await.unwrap();
    assert_eq!(group.map(|g| g.id.as_str()), Some(GROUP));

    let group = h.scaling.group_for_node("unrelated-node").await.unwrap();
    assert!(group.is_none());
}
