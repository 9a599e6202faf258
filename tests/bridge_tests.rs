//! Exercises the shared bridging discipline (spec.md §4.3.4, §8) directly
//! over in-memory duplex pipes, without bringing up an overlay node; the
//! Bridge's contract is independent of which transport sits on either side.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnelmesh::forward::bridge::{bridge_duplex, shutdown_all, Bridge, BridgeState};

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn bytes_written_on_one_side_arrive_intact_on_the_other() {
    let (local, mut local_peer) = tokio::io::duplex(4096);
    let (remote, mut remote_peer) = tokio::io::duplex(4096);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let bridge = Bridge::new("test-echo");
    let pump = tokio::spawn(bridge_duplex(
        bridge,
        local_r,
        local_w,
        remote_r,
        remote_w,
        IDLE_TIMEOUT,
        true,
    ));

    local_peer.write_all(b"ping\n").await.unwrap();
    let mut buf = [0u8; 5];
    remote_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping\n");

    remote_peer.write_all(b"pong\n").await.unwrap();
    let mut buf2 = [0u8; 5];
    local_peer.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"pong\n");

    drop(local_peer);
    drop(remote_peer);
    pump.await.unwrap();
}

#[tokio::test]
async fn half_close_on_one_side_leaves_the_other_direction_open() {
    let (local, mut local_peer) = tokio::io::duplex(4096);
    let (remote, mut remote_peer) = tokio::io::duplex(4096);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let bridge = Bridge::new("test-half-close");
    let pump = tokio::spawn(bridge_duplex(
        bridge,
        local_r,
        local_w,
        remote_r,
        remote_w,
        IDLE_TIMEOUT,
        true,
    ));

    // Local finishes writing (shuts its write half down); remote must still
    // be able to send a reply and have it observed before EOF.
    local_peer.shutdown().await.unwrap();

    remote_peer.write_all(b"bye\n").await.unwrap();
    let mut buf = [0u8; 4];
    local_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bye\n");

    drop(remote_peer);
    pump.await.unwrap();
}

#[tokio::test]
async fn half_close_transitions_bridge_state_and_destroy_follows_the_other_side() {
    let (local, local_peer) = tokio::io::duplex(4096);
    let (remote, remote_peer) = tokio::io::duplex(4096);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let bridge = Bridge::new("test-state-machine");
    let handle = bridge.clone();
    let pump = tokio::spawn(bridge_duplex(
        bridge,
        local_r,
        local_w,
        remote_r,
        remote_w,
        IDLE_TIMEOUT,
        true,
    ));

    drop(local_peer);
    // Give the pump loop a turn to observe local EOF and update the state.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), BridgeState::HalfClosedLocal);

    drop(remote_peer);
    pump.await.unwrap();
    assert_eq!(handle.state(), BridgeState::Destroyed);
}

#[tokio::test]
async fn destroy_latch_is_write_once_and_idempotent() {
    let bridge = Bridge::new("test-destroy");
    assert!(!bridge.is_destroyed());
    assert!(bridge.mark_destroyed());
    assert!(bridge.is_destroyed());
    // Every subsequent call is a no-op per the "cleanup is idempotent" invariant.
    assert!(!bridge.mark_destroyed());
    assert!(!bridge.mark_destroyed());
    assert_eq!(bridge.state(), BridgeState::Destroyed);
}

#[tokio::test]
async fn idle_timeout_destroys_the_bridge() {
    let (local, _local_peer) = tokio::io::duplex(4096);
    let (remote, _remote_peer) = tokio::io::duplex(4096);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let bridge = Bridge::new("test-idle-timeout");
    let handle = bridge.clone();
    let pump = bridge_duplex(
        bridge,
        local_r,
        local_w,
        remote_r,
        remote_w,
        Duration::from_millis(50),
        true,
    );
    pump.await;
    assert!(handle.is_destroyed());
}

#[tokio::test]
async fn shutdown_all_closes_a_live_bridge_within_the_grace_period() {
    let (local, _local_peer) = tokio::io::duplex(4096);
    let (remote, _remote_peer) = tokio::io::duplex(4096);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let bridge = Bridge::new("test-shutdown-all");
    let handle = bridge.clone();
    let pump = tokio::spawn(bridge_duplex(
        bridge,
        local_r,
        local_w,
        remote_r,
        remote_w,
        Duration::from_secs(30),
        true,
    ));

    shutdown_all(Duration::from_secs(1)).await;
    pump.await.unwrap();
    assert!(handle.is_destroyed());
}
