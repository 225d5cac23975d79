//! Node wiring tests

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use libstrand_core::config::{RemoteConfig, StrandConfig, SyncConfig};
use libstrand_core::types::ids::{drive_collection_id, sync_unit_id};
use libstrand_core::types::operation::{DRIVE_DOCUMENT_TYPE, GLOBAL_SCOPE, MAIN_BRANCH};
use libstrand_core::types::remote::{ChannelConfig, RemoteFilter};
use libstrand_core::Action;
use libstrand_reactor::RequestMeta;
use libstrand_sync::{InternalNetwork, SyncError};
use serde_json::json;
use strand_daemon::{DaemonError, Node};
use tempfile::tempdir;

fn internal(peer: &str, address: &str) -> ChannelConfig {
    ChannelConfig {
        channel_type: "internal".to_string(),
        parameters: BTreeMap::from([
            ("peer".to_string(), peer.to_string()),
            ("address".to_string(), address.to_string()),
        ]),
    }
}

fn remote(name: &str, channel: ChannelConfig) -> RemoteConfig {
    RemoteConfig {
        name: name.to_string(),
        collection_id: drive_collection_id(MAIN_BRANCH, "drive-1"),
        channel,
        filter: RemoteFilter::default(),
    }
}

fn set_name(name: &str) -> Action {
    Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": name }))
}

async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn written_operations_update_sync_units_of_their_drive() {
    let node = Node::start(&StrandConfig::default()).await.unwrap();
    let reactor = node.reactor();

    for (id, kind) in [("drive-1", DRIVE_DOCUMENT_TYPE), ("doc-1", "test/doc")] {
        let job = reactor.create(id, kind, RequestMeta::default()).await.unwrap();
        reactor.wait_for_job(&job.id).await.unwrap();
    }
    let job = reactor
        .add_children("drive-1", &["doc-1".to_string()], MAIN_BRANCH, RequestMeta::default())
        .await
        .unwrap();
    reactor.wait_for_job(&job.id).await.unwrap();
    let job = reactor
        .mutate("doc-1", MAIN_BRANCH, vec![set_name("a")], RequestMeta::default())
        .await
        .unwrap();
    reactor.wait_for_job(&job.id).await.unwrap();

    let units = node.listeners().sync_units();
    let unit_id = sync_unit_id("doc-1", GLOBAL_SCOPE, MAIN_BRANCH);
    let unit_id = unit_id.as_str();
    let tracked = eventually(|| async move {
        units
            .get(unit_id)
            .is_some_and(|unit| unit.revision == 1 && unit.drive_id == "drive-1")
    })
    .await;
    assert!(tracked);
    node.shutdown().await;
}

#[tokio::test]
async fn configured_remotes_are_registered_on_sled_storage() {
    let dir = tempdir().unwrap();
    let mut config = StrandConfig::default();
    config.storage.path = Some(dir.path().join("store"));
    config.remotes.push(remote("mirror", internal("elsewhere", "here")));

    let node = Node::start(&config).await.unwrap();
    let names: Vec<String> = node.sync().list().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["mirror".to_string()]);
    assert!(dir.path().join("store").exists());
    node.shutdown().await;
}

#[tokio::test]
async fn invalid_configured_remote_fails_startup() {
    let mut config = StrandConfig::default();
    config.remotes.push(remote("broken", ChannelConfig::internal()));

    let result = Node::start(&config).await;
    assert!(matches!(
        result,
        Err(DaemonError::Sync(SyncError::InvalidChannel(_)))
    ));
}

#[tokio::test]
async fn two_nodes_replicate_a_drive() {
    let sync = SyncConfig {
        outbox_flush_ms: 5,
        cursor_write_delay_ms: 10,
        ..SyncConfig::default()
    };
    let network = Arc::new(InternalNetwork::new(sync.clone()));

    let mut config_a = StrandConfig::default();
    config_a.sync = sync.clone();
    config_a.remotes.push(remote("node-b", internal("node-b", "node-a")));
    let mut config_b = StrandConfig::default();
    config_b.sync = sync;
    config_b.remotes.push(remote("node-a", internal("node-a", "node-b")));

    let a = Node::start_with(&config_a, network.clone()).await.unwrap();
    let b = Node::start_with(&config_b, network).await.unwrap();

    let job = a
        .reactor()
        .create("drive-1", DRIVE_DOCUMENT_TYPE, RequestMeta::default())
        .await
        .unwrap();
    a.reactor().wait_for_job(&job.id).await.unwrap();
    let job = a
        .reactor()
        .mutate("drive-1", MAIN_BRANCH, vec![set_name("shared")], RequestMeta::default())
        .await
        .unwrap();
    a.reactor().wait_for_job(&job.id).await.unwrap();

    let b_reactor = b.reactor();
    let replicated = eventually(|| async move {
        b_reactor
            .get_operations("drive-1", GLOBAL_SCOPE, MAIN_BRANCH, 0)
            .await
            .map(|ops| ops.len() == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(replicated);

    let b_units = b.listeners().sync_units();
    let unit_id = sync_unit_id("drive-1", GLOBAL_SCOPE, MAIN_BRANCH);
    let unit_id = unit_id.as_str();
    let tracked = eventually(|| async move {
        b_units.get(unit_id).is_some_and(|unit| unit.revision == 1)
    })
    .await;
    assert!(tracked);

    a.shutdown().await;
    b.shutdown().await;
}

/// Start a node, retrying while a previous instance still holds the sled lock
async fn start_again(config: &StrandConfig, network: Arc<InternalNetwork>) -> Node {
    let mut attempts = 0;
    loop {
        match Node::start_with(config, network.clone()).await {
            Ok(node) => return node,
            Err(DaemonError::Strand(_)) if attempts < 50 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("restart failed: {e}"),
        }
    }
}

#[tokio::test]
async fn restarted_sled_node_keeps_replicating_past_its_cursor() {
    let dir = tempdir().unwrap();
    let sync = SyncConfig {
        outbox_flush_ms: 5,
        cursor_write_delay_ms: 10,
        ..SyncConfig::default()
    };
    let network = Arc::new(InternalNetwork::new(sync.clone()));

    let mut config_a = StrandConfig::default();
    config_a.sync = sync.clone();
    config_a.storage.path = Some(dir.path().join("store"));
    config_a.remotes.push(remote("node-b", internal("node-b", "node-a")));
    let mut config_b = StrandConfig::default();
    config_b.sync = sync;
    config_b.remotes.push(remote("node-a", internal("node-a", "node-b")));

    let a = Node::start_with(&config_a, network.clone()).await.unwrap();
    let b = Node::start_with(&config_b, network.clone()).await.unwrap();

    let job = a
        .reactor()
        .create("drive-1", DRIVE_DOCUMENT_TYPE, RequestMeta::default())
        .await
        .unwrap();
    a.reactor().wait_for_job(&job.id).await.unwrap();
    let job = a
        .reactor()
        .mutate("drive-1", MAIN_BRANCH, vec![set_name("one")], RequestMeta::default())
        .await
        .unwrap();
    a.reactor().wait_for_job(&job.id).await.unwrap();

    let b_reactor = b.reactor().clone();
    let global_ops = move |count: usize| {
        let b_reactor = b_reactor.clone();
        async move {
            b_reactor
                .get_operations("drive-1", GLOBAL_SCOPE, MAIN_BRANCH, 0)
                .await
                .map(|ops| ops.len() == count)
                .unwrap_or(false)
        }
    };
    assert!(eventually(|| global_ops(1)).await);
    let outbox = a.sync().get_by_name("node-b").unwrap().channel.outbox().clone();
    assert!(eventually(|| {
        let outbox = outbox.clone();
        async move { outbox.is_empty() }
    })
    .await);
    drop(outbox);
    a.shutdown().await;

    let a = start_again(&config_a, network).await;
    let job = a
        .reactor()
        .mutate("drive-1", MAIN_BRANCH, vec![set_name("two")], RequestMeta::default())
        .await
        .unwrap();
    a.reactor().wait_for_job(&job.id).await.unwrap();
    assert!(eventually(|| global_ops(2)).await);

    a.shutdown().await;
    b.shutdown().await;
}
