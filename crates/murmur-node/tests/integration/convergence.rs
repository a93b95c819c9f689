//! Fresh-cluster convergence over real QUIC loopback.

use crate::harness::{TestNode, BASE_GENERATION};
use murmur_protocol::state::{AppStateKey, Status};
use std::time::Duration;

/// Three nodes, seeds = {A}: everyone converges on the full live set and
/// sees NORMAL status for the others.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_cluster_converges() -> anyhow::Result<()> {
    let a = TestNode::build("itest", vec![]).await?;
    let seeds = vec![a.addr];
    let b = TestNode::build("itest", seeds.clone()).await?;
    let c = TestNode::build("itest", seeds.clone()).await?;

    a.join(BASE_GENERATION).await?;
    b.join(BASE_GENERATION + 1).await?;
    c.join(BASE_GENERATION + 2).await?;

    let timeout = Duration::from_secs(15);
    a.wait_live(&[b.addr, c.addr], timeout).await?;
    b.wait_live(&[a.addr, c.addr], timeout).await?;
    c.wait_live(&[a.addr, b.addr], timeout).await?;

    // Everyone sees NORMAL status for everyone else, on the coordinator
    // view and on the shard replicas alike.
    for node in [&a, &b, &c] {
        for peer in [a.addr, b.addr, c.addr] {
            if peer == node.addr {
                continue;
            }
            node.wait_for("peer status NORMAL", timeout, || async {
                match node.gossiper.store().get(&peer).await {
                    Some(rec) => rec.state.status() == Some(Status::Normal) && rec.alive,
                    None => false,
                }
            })
            .await?;
            let replica = node.gossiper.store().reader(1).get(&peer).await;
            assert!(replica.is_some(), "shard replica missing {peer}");
        }
        assert!(
            node.gossiper.store().unreachable_snapshot().await.is_empty(),
            "no unreachable peers in a healthy cluster"
        );
    }

    // Settling completes on a quiet cluster.
    tokio::time::timeout(Duration::from_secs(10), a.gossiper.wait_for_gossip_to_settle())
        .await
        .expect("settle wait must finish on a quiet cluster");

    a.stop().await;
    b.stop().await;
    c.stop().await;
    Ok(())
}

/// A state published after the cluster formed reaches every node with its
/// version intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_application_state_disseminates() -> anyhow::Result<()> {
    let a = TestNode::build("itest-app", vec![]).await?;
    let b = TestNode::build("itest-app", vec![a.addr]).await?;

    a.join(BASE_GENERATION).await?;
    b.join(BASE_GENERATION + 1).await?;

    let timeout = Duration::from_secs(15);
    a.wait_live(&[b.addr], timeout).await?;
    b.wait_live(&[a.addr], timeout).await?;

    a.gossiper
        .add_local_application_state(AppStateKey::Load, "0.42".into())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    b.wait_for("load state from a", timeout, || async {
        b.gossiper
            .store()
            .get(&a.addr)
            .await
            .and_then(|rec| rec.state.get(AppStateKey::Load).cloned())
            .map(|v| v.value == "0.42")
            .unwrap_or(false)
    })
    .await?;

    // Versions observed at b never exceed what a published and are
    // monotonic per key.
    let published = a
        .gossiper
        .store()
        .get(&a.addr)
        .await
        .unwrap()
        .state
        .get(AppStateKey::Load)
        .unwrap()
        .version;
    let observed = b
        .gossiper
        .store()
        .get(&a.addr)
        .await
        .unwrap()
        .state
        .get(AppStateKey::Load)
        .unwrap()
        .version;
    assert_eq!(published, observed);

    a.stop().await;
    b.stop().await;
    Ok(())
}
