//! Graceful shutdown propagation.

use crate::harness::{TestNode, BASE_GENERATION};
use murmur_protocol::state::Status;
use std::time::Duration;

/// A graceful stop pushes STATUS=SHUTDOWN at the highest version; the
/// surviving peer marks the leaver dead exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_marks_peer_dead() -> anyhow::Result<()> {
    let a = TestNode::build("itest-stop", vec![]).await?;
    let b = TestNode::build("itest-stop", vec![a.addr]).await?;

    a.join(BASE_GENERATION).await?;
    b.join(BASE_GENERATION + 1).await?;

    let timeout = Duration::from_secs(15);
    a.wait_live(&[b.addr], timeout).await?;
    b.wait_live(&[a.addr], timeout).await?;

    b.stop().await;

    a.wait_for("b marked dead", timeout, || async {
        !a.gossiper.store().is_live(&b.addr).await
    })
    .await?;

    let rec = a.gossiper.store().get(&b.addr).await.unwrap();
    assert!(!rec.alive);
    assert_eq!(rec.state.status(), Some(Status::Shutdown));
    assert_eq!(
        rec.state
            .get(murmur_protocol::state::AppStateKey::Status)
            .unwrap()
            .version,
        i32::MAX,
        "the shutdown notice must carry the forced-highest version"
    );

    // Unreachable on the coordinator and on the replicas.
    let unreachable: Vec<_> = a
        .gossiper
        .store()
        .unreachable_snapshot()
        .await
        .into_iter()
        .map(|(addr, _)| addr)
        .collect();
    assert_eq!(unreachable, vec![b.addr]);

    // Give gossip a few more rounds: the dead state must stick and on_dead
    // must not repeat.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        a.events.count_of(&format!("dead:{}", b.addr)),
        1,
        "on_dead fires exactly once, got {:?}",
        a.events.events()
    );
    assert!(!a.gossiper.store().get(&b.addr).await.unwrap().alive);

    a.stop().await;
    Ok(())
}

/// With the announcement suppressed (peer killed hard), the active failure
/// detector convicts within the grace window.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_detector_convicts_dead_peer() -> anyhow::Result<()> {
    let a = TestNode::build("itest-fd", vec![]).await?;
    let b = TestNode::build("itest-fd", vec![a.addr]).await?;

    a.join(BASE_GENERATION).await?;
    b.join(BASE_GENERATION + 1).await?;

    let timeout = Duration::from_secs(15);
    a.wait_live(&[b.addr], timeout).await?;
    b.wait_live(&[a.addr], timeout).await?;

    // Kill b without announcement: echoes are rejected from here on, so a's
    // active detector sees only declines.
    b.gossiper.set_advertise(false);

    // Grace is echo_interval (100 ms) + fd timeout (400 ms).
    a.wait_for("b convicted by the failure detector", timeout, || async {
        !a.gossiper.store().is_live(&b.addr).await
    })
    .await?;

    let rec = a.gossiper.store().get(&b.addr).await.unwrap();
    assert!(!rec.alive);
    assert_eq!(a.events.count_of(&format!("dead:{}", b.addr)), 1);

    a.stop().await;
    b.stop().await;
    Ok(())
}
