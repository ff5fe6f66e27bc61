//! End-to-end membership changes against the in-memory replica set

use replset::{
    retry, Member, MemberState, MemoryOptions, MemoryReplicaSet, ReadConsistency, ReplicaSet,
    ReplicaSetError, ReplicaSetSettings,
};
use std::collections::BTreeMap;
use tracing_subscriber::fmt::try_init;

const ROOT: &str = "10.0.0.1:37017";

fn test_settings() -> ReplicaSetSettings {
    ReplicaSetSettings {
        initiate_attempt_delay_ms: 5,
        initiate_status_delay_ms: 5,
        ready_poll_interval_ms: 20,
        reconfig_retry_total_ms: 5_000,
        reconfig_retry_delay_ms: 20,
        ..Default::default()
    }
}

fn tags() -> BTreeMap<String, String> {
    BTreeMap::from([("foo".to_string(), "bar".to_string())])
}

fn host(n: u16) -> String {
    format!("10.0.0.1:{}", 37017 + n)
}

async fn start_nodes(cluster: &MemoryReplicaSet, count: u16) {
    for n in 0..count {
        cluster.start_node(&host(n)).await;
    }
}

async fn initiated_set(cluster: &MemoryReplicaSet, nodes: u16) -> ReplicaSet {
    start_nodes(cluster, nodes).await;
    let rs = ReplicaSet::with_settings(cluster.connect(ROOT), test_settings());
    rs.initiate(ROOT, "juju", tags()).await.unwrap();
    rs
}

async fn add_with_retry(rs: &ReplicaSet, members: Vec<Member>) {
    let strategy = rs.settings().reconfig_strategy();
    retry(strategy, "add members", || rs.add(members.clone()))
        .await
        .unwrap();
}

fn addresses(members: &[Member]) -> Vec<(u32, String)> {
    members.iter().map(|m| (m.id, m.address.clone())).collect()
}

/// A non-root member carrying its own `key{n}` tag
fn tagged(n: u16) -> Member {
    Member::new(host(n)).with_tag(format!("key{}", n), format!("val{}", n))
}

fn root_member() -> Member {
    Member::new(ROOT).with_id(1).with_tags(tags())
}

/// Initiate, add, remove and set the way a controller manages a real set
#[tokio::test]
async fn test_add_remove_set() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 5).await;

    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(members, vec![root_member()]);
    let config = rs.current_config(ReadConsistency::Strong).await.unwrap();
    assert_eq!(config.version, 1);
    assert_eq!(config.name, "juju");

    // Add the remaining nodes; the root is listed again and must be skipped.
    let mut wanted: Vec<Member> = vec![Member::new(ROOT)];
    wanted.extend((1..5).map(tagged));
    add_with_retry(&rs, wanted.clone()).await;

    let config = rs.current_config(ReadConsistency::Strong).await.unwrap();
    assert_eq!(config.version, 2);
    let mut expected = vec![root_member()];
    expected.extend((1..5).map(|n| tagged(n).with_id(n as u32 + 1)));
    assert_eq!(config.members, expected);

    // Adding the same members again changes nothing but the version.
    add_with_retry(&rs, wanted.split_off(3)).await;
    let config = rs.current_config(ReadConsistency::Strong).await.unwrap();
    assert_eq!(config.version, 3);
    assert_eq!(config.members, expected);

    let strategy = rs.settings().reconfig_strategy();
    let gone = [host(3), host(4)];
    retry(strategy, "remove members", || rs.remove(&gone))
        .await
        .unwrap();
    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(members, expected[..3].to_vec());

    let set = vec![
        tagged(3),
        tagged(2),
        Member::new(ROOT).with_tags(tags()),
        tagged(4).with_id(10),
    ];
    retry(strategy, "set members", || rs.set(set.clone()))
        .await
        .unwrap();
    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(
        members,
        vec![tagged(3).with_id(11), tagged(2).with_id(3), root_member(), tagged(4).with_id(10)]
    );
    assert_eq!(cluster.config().await.unwrap().version, 5);
}

#[tokio::test]
async fn test_remove_absent_address_bumps_version() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 1).await;

    rs.remove(&["10.9.9.9:37017"]).await.unwrap();
    let config = rs.current_config(ReadConsistency::Strong).await.unwrap();
    assert_eq!(config.version, 2);
    assert_eq!(config.members.len(), 1);
}

#[tokio::test]
async fn test_remove_primary_moves_leadership() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 3).await;
    add_with_retry(&rs, (1..3).map(|n| Member::new(host(n))).collect()).await;

    // The primary drops every connection as it leaves the set.
    rs.remove(&[ROOT]).await.unwrap();
    assert_eq!(cluster.primary().await, Some(host(1)));

    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(addresses(&members), vec![(2, host(1)), (3, host(2))]);
}

#[tokio::test]
async fn test_dropped_connection_after_reconfig() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::with_options(MemoryOptions {
        drop_on_reconfig: true,
        ..Default::default()
    });
    let rs = initiated_set(&cluster, 2).await;

    rs.add(vec![Member::new(host(1))]).await.unwrap();
    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn test_initiate_waits_for_members() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::with_options(MemoryOptions {
        status_lag: 3,
        ..Default::default()
    });
    let rs = initiated_set(&cluster, 1).await;

    let status = rs.current_status().await.unwrap();
    assert_eq!(status.name, "juju");
    assert_eq!(status.members.len(), 1);
}

/// An initiate that the server rejects still settles once status lists members
#[tokio::test]
async fn test_initiate_on_initiated_node_settles() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 2).await;
    rs.initiate(&host(1), "other", BTreeMap::new()).await.unwrap();

    let config = rs.current_config(ReadConsistency::Strong).await.unwrap();
    assert_eq!(config.name, "juju");
    assert_eq!(config.version, 1);
}

/// Old servers report IPv6 members without brackets
#[tokio::test]
async fn test_ipv6_addresses_are_normalized() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::with_options(MemoryOptions {
        unbracketed_ipv6: true,
        ..Default::default()
    });
    cluster.start_node("[::1]:37017").await;
    cluster.start_node("[::1]:37018").await;

    let rs = ReplicaSet::with_settings(cluster.connect("::1:37017"), test_settings());
    rs.initiate("::1:37017", "juju", BTreeMap::new())
        .await
        .unwrap();
    rs.add(vec![Member::new("[::1]:37018")]).await.unwrap();

    let members = rs.current_members(ReadConsistency::Strong).await.unwrap();
    assert_eq!(
        addresses(&members),
        vec![(1, "[::1]:37017".to_string()), (2, "[::1]:37018".to_string())]
    );

    // Re-adding by the unbracketed form is recognized as the same member.
    rs.add(vec![Member::new("::1:37018")]).await.unwrap();
    assert_eq!(rs.current_members(ReadConsistency::Strong).await.unwrap().len(), 2);

    let status = rs.current_status().await.unwrap();
    assert_eq!(status.members[0].address, "[::1]:37017");
    assert_eq!(rs.master_host_port().await.unwrap(), "[::1]:37017");

    let results = rs.is_master().await.unwrap();
    assert!(results.is_master);
    assert_eq!(results.address, "[::1]:37017");
    assert_eq!(results.addresses, vec!["[::1]:37017", "[::1]:37018"]);
}

#[tokio::test]
async fn test_master_host_port_uninitiated() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    cluster.start_node(ROOT).await;
    let rs = ReplicaSet::new(cluster.connect(ROOT));

    let err = rs.master_host_port().await.unwrap_err();
    assert!(matches!(err, ReplicaSetError::MasterNotConfigured));
    assert_eq!(err.to_string(), "master not configured");

    let results = rs.is_master().await.unwrap();
    assert!(!results.is_master);
    assert!(results.local_time.is_some());

    let err = rs.current_config(ReadConsistency::Strong).await.unwrap_err();
    assert!(matches!(err, ReplicaSetError::NotInitiated));
}

#[tokio::test]
async fn test_step_down_primary() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 3).await;
    add_with_retry(&rs, (1..3).map(|n| Member::new(host(n))).collect()).await;
    assert_eq!(rs.master_host_port().await.unwrap(), ROOT);

    rs.step_down_primary().await.unwrap();

    let rs = ReplicaSet::with_settings(cluster.connect(&host(2)), test_settings());
    let primary = rs.master_host_port().await.unwrap();
    assert_ne!(primary, ROOT);
    assert_eq!(Some(primary), cluster.primary().await);

    let results = rs.is_master().await.unwrap();
    assert!(results.secondary);
    assert_eq!(results.replica_set_name, "juju");
}

#[tokio::test]
async fn test_status_and_readiness() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 3).await;
    add_with_retry(&rs, (1..3).map(|n| Member::new(host(n))).collect()).await;

    let status = rs.current_status().await.unwrap();
    let states: Vec<MemberState> = status.members.iter().map(|m| m.state).collect();
    assert_eq!(
        states,
        vec![MemberState::Primary, MemberState::Secondary, MemberState::Secondary]
    );
    assert!(status.members[0].is_self);
    assert_eq!(status.primary().map(|m| m.address.as_str()), Some(ROOT));
    assert!(rs.is_ready().await.unwrap());
    rs.wait_until_ready(5).await.unwrap();

    // Two of three healthy is still a majority.
    cluster.stop_node(&host(2)).await;
    assert!(rs.is_ready().await.unwrap());
    let status = rs.current_status().await.unwrap();
    assert_eq!(status.members[2].state, MemberState::Down);
    assert!(!status.members[2].healthy);

    cluster.stop_node(&host(1)).await;
    assert!(!rs.is_ready().await.unwrap());
    let err = rs.wait_until_ready(0).await.unwrap_err();
    assert_eq!(err.to_string(), "timed out after 0 seconds");

    cluster.start_node(&host(1)).await;
    rs.wait_until_ready(5).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_node_is_not_ready() {
    let _ = try_init();

    let cluster = MemoryReplicaSet::new();
    let rs = initiated_set(&cluster, 1).await;
    cluster.stop_node(ROOT).await;

    assert!(!rs.is_ready().await.unwrap());
}
