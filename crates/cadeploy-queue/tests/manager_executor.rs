//! Committed transactions drive the deployment manager.

use std::sync::Arc;

use cadeploy_cluster::{InMemoryCluster, ResourceKind};
use cadeploy_core::DeployerConfig;
use cadeploy_manager::DeploymentManager;
use cadeploy_queue::{Action, CheckpointStore, CommandQueue, Mailboxes, Outbox, recover_all, spawn_dispatcher};

fn manager(cluster: &InMemoryCluster) -> DeploymentManager {
    let config = Arc::new(DeployerConfig::scaffold("apps", "caches"));
    DeploymentManager::new(Arc::new(cluster.clone()), config)
}

fn create(name: &str) -> Action {
    Action::CreateApp {
        app_local_name: name.to_string(),
        image: "app:1".to_string(),
        is_untrusted: false,
        plan: "bronze".to_string(),
        cdn: None,
        env: Vec::new(),
    }
}

#[tokio::test]
async fn create_flex_delete_through_the_queue() {
    let cluster = InMemoryCluster::new();
    let mgr = manager(&cluster);
    let mailboxes = Mailboxes::new();
    let (outbox, rx) = Outbox::channel();
    let dispatcher = spawn_dispatcher(rx, Arc::new(mailboxes.clone()));

    let mut queue = CommandQueue::new("alice_ca1", outbox).unwrap();
    queue.begin();
    let created = queue.record(create("foo"), Some("deployed")).unwrap();
    let flexed = queue
        .record(
            Action::FlexApp {
                app_local_name: "foo".to_string(),
                plan: "bronze".to_string(),
                number_of_cas: 10,
            },
            Some("deployed"),
        )
        .unwrap();
    queue.prepare().unwrap();
    assert!(cluster.calls().is_empty());

    assert_eq!(queue.commit(&mgr).await.unwrap(), 2);
    let deployment = cluster.get("apps", ResourceKind::Deployment, "alice-foo").unwrap();
    assert_eq!(deployment["spec"]["replicas"], 3);

    queue.begin();
    queue
        .record(
            Action::DeleteApp {
                app_local_name: "foo".to_string(),
                keep_data: false,
            },
            None,
        )
        .unwrap();
    queue.commit(&mgr).await.unwrap();
    assert!(cluster.names("apps", ResourceKind::Deployment).is_empty());

    drop(queue);
    dispatcher.await.unwrap();
    let replies = mailboxes.drain("alice_ca1");
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].request_id, created);
    assert_eq!(replies[0].data["id"], "alice-foo");
    assert_eq!(replies[1].request_id, flexed);
    assert_eq!(replies[1].data["instances"], 3);
    assert!(replies.iter().all(|r| r.error.is_none()));
}

#[tokio::test]
async fn apply_errors_become_reply_errors() {
    let cluster = InMemoryCluster::new();
    let mgr = manager(&cluster);
    let (outbox, mut rx) = Outbox::channel();

    let mut queue = CommandQueue::new("alice_ca1", outbox).unwrap();
    queue.begin();
    queue
        .record(
            Action::RestartApp {
                app_local_name: "ghost".to_string(),
            },
            Some("restarted"),
        )
        .unwrap();
    queue.commit(&mgr).await.unwrap();

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.error.as_deref(), Some("unknown deployment `alice-ghost`"));
    assert!(reply.data.is_null());
}

#[tokio::test]
async fn interrupted_transaction_is_replayed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.redb");
    let cluster = InMemoryCluster::new();

    {
        let store = CheckpointStore::open(&path).unwrap();
        let (outbox, _rx) = Outbox::channel();
        let mut queue = CommandQueue::new("alice_ca1", outbox).unwrap();
        queue.begin();
        queue.record(create("foo"), None).unwrap();
        store.put(&queue.prepare().unwrap()).unwrap();
        // Crash before commit.
    }

    let store = CheckpointStore::open(&path).unwrap();
    let (outbox, _rx) = Outbox::channel();
    let resumed = recover_all(&store, &manager(&cluster), &outbox).await.unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(cluster.names("apps", ResourceKind::Deployment), vec!["alice-foo"]);
    assert!(store.list().unwrap().is_empty());
}

#[tokio::test]
async fn huge_flex_is_applied_not_fatal() {
    let cluster = InMemoryCluster::new();
    let mgr = manager(&cluster);
    let (outbox, mut rx) = Outbox::channel();

    let mut queue = CommandQueue::new("alice_ca1", outbox).unwrap();
    queue.begin();
    queue.record(create("foo"), None).unwrap();
    queue
        .record(
            Action::FlexApp {
                app_local_name: "foo".to_string(),
                plan: "bronze".to_string(),
                number_of_cas: u32::MAX,
            },
            Some("flexed"),
        )
        .unwrap();
    assert_eq!(queue.commit(&mgr).await.unwrap(), 2);

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.error, None);
    assert_eq!(reply.data["instances"], u32::MAX / 5);
    let cache = cluster
        .get("caches", ResourceKind::Deployment, "redis-alice-foo")
        .unwrap();
    assert_eq!(
        cache["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["memory"],
        format!("{}M", u32::MAX)
    );
}
