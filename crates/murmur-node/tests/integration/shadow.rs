//! Shadow-round bootstrap against a live node.

use crate::harness::{TestNode, BASE_GENERATION};
use murmur_protocol::state::Status;
use std::time::Duration;

/// A joining node learns the cluster's state through the shadow round
/// without firing any listener, then joins normally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shadow_round_populates_state_silently() -> anyhow::Result<()> {
    let a = TestNode::build("itest-shadow", vec![]).await?;
    a.join(BASE_GENERATION).await?;

    let n = TestNode::build("itest-shadow", vec![a.addr]).await?;

    // Shadow round only -- gossip not started yet.
    n.gossiper
        .do_shadow_round(vec![a.addr])
        .await
        .map_err(|e| anyhow::anyhow!("shadow round failed: {e}"))?;

    let rec = n
        .gossiper
        .store()
        .get(&a.addr)
        .await
        .expect("shadow round must install the seed's state");
    assert_eq!(rec.state.status(), Some(Status::Normal));
    assert!(!rec.alive, "shadow round must not mark anyone alive");
    assert!(
        n.events.events().is_empty(),
        "shadow round must not fire listeners, got {:?}",
        n.events.events()
    );

    // Now join for real; both sides converge.
    n.gossiper
        .start_gossiping(
            BASE_GENERATION + 1,
            vec![(murmur_protocol::state::AppStateKey::Status, "NORMAL".into())],
            true,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let timeout = Duration::from_secs(15);
    n.wait_live(&[a.addr], timeout).await?;
    a.wait_live(&[n.addr], timeout).await?;

    a.stop().await;
    n.stop().await;
    Ok(())
}

/// Shadow round against a dead contact fails; the node must not join.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shadow_round_fails_against_dead_contact() -> anyhow::Result<()> {
    // Reserve an address nobody listens on by binding and dropping.
    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let dead_addr = probe.local_addr()?;
    drop(probe);

    // Shorten the deadline; nothing will ever answer.
    let n = TestNode::build_with("itest-shadow-fail", vec![dead_addr], |cfg| {
        cfg.shadow_round_timeout = Duration::from_millis(700);
    })
    .await?;

    let err = n.gossiper.do_shadow_round(vec![dead_addr]).await;
    assert!(err.is_err(), "shadow round against a dead contact must fail");

    n.stop().await;
    Ok(())
}
