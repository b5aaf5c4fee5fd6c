//! End-to-end cluster scenarios over the in-memory network.

mod common;

use std::time::Duration;

use common::{addr_of, expect_not_leader, Cluster, HEARTBEAT, LONG, SHORT};
use raftforge::message::{
    read_response, write_request, Request, RpcResult, VoteReq, RPC_VOTE,
};
use raftforge::{Dialer, Role};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_apply() {
    let cluster = Cluster::launch(1).await;
    let leader = cluster.wait_for_leader(SHORT).await;
    assert_eq!(leader, 1);

    let resp = cluster.apply(leader, b"test".to_vec()).await.unwrap();
    assert_eq!(resp, b"test");

    cluster.wait_fsm_convergence(&[b"test"], SHORT).await;

    // noop at index 1, the command at index 2
    let info = cluster.info(leader).await;
    assert_eq!(info.commit_index, 2);
    assert_eq!(info.last_applied, 2);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_triple_node_replication() {
    let cluster = Cluster::launch(3).await;
    let leader = cluster.wait_for_leader(SHORT).await;

    let resp = cluster.apply(leader, b"test".to_vec()).await.unwrap();
    assert_eq!(resp, b"test");

    cluster.wait_fsm_convergence(&[b"test"], SHORT).await;
    for id in 1..=3 {
        let info = cluster.info(id).await;
        assert!(info.commit_index >= 2, "node {id} commit {}", info.commit_index);
        assert_eq!(info.leader, leader);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failure() {
    let cluster = Cluster::launch(3).await;
    let old_leader = cluster.wait_for_leader(SHORT).await;

    let resp = cluster.apply(old_leader, b"a".to_vec()).await.unwrap();
    assert_eq!(resp, b"a");
    cluster.wait_fsm_convergence(&[b"a"], SHORT).await;
    let old_term = cluster.info(old_leader).await.term;

    cluster.isolate(old_leader);

    // submitted while the old leader still thinks it leads; fails once
    // its lease expires
    let err = cluster.apply(old_leader, b"b".to_vec()).await.unwrap_err();
    assert!(expect_not_leader(err), "stepdown must report lost leadership");

    let rest: Vec<u64> = (1..=3).filter(|id| *id != old_leader).collect();
    let new_leader = cluster.wait_for_leader_among(&rest, SHORT).await;
    assert_ne!(new_leader, old_leader);
    assert!(cluster.info(new_leader).await.term > old_term);

    let resp = cluster.apply(new_leader, b"b".to_vec()).await.unwrap();
    assert_eq!(resp, b"b");

    cluster.reconnect_all();
    cluster.wait_fsm_convergence(&[b"a", b"b"], LONG).await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_behind_follower_catch_up() {
    let cluster = Cluster::launch(3).await;
    let leader = cluster.wait_for_leader(SHORT).await;

    let behind = (1..=3).find(|id| *id != leader).unwrap();
    cluster.isolate(behind);

    let mut want = Vec::new();
    for i in 0..100 {
        let data = format!("cmd{i}").into_bytes();
        let resp = cluster.apply(leader, data.clone()).await.unwrap();
        assert_eq!(resp, data);
        want.push(data);
    }

    cluster.reconnect_all();
    cluster.wait_fsm_len(100, LONG).await;

    // exactly the hundred commands, in order, everywhere; catching up
    // replays nothing
    let want: Vec<&[u8]> = want.iter().map(Vec::as_slice).collect();
    cluster.wait_fsm_convergence(&want, SHORT).await;

    // the cluster settles on a single agreed leader
    cluster.wait_for_leader(LONG).await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies() {
    let cluster = Cluster::launch(3).await;
    let leader = cluster.wait_for_leader(SHORT).await;

    let tasks = cluster.nodes[&leader].tasks();
    let mut handles = Vec::new();
    for i in 0..100 {
        let tasks = tasks.clone();
        handles.push(tokio::spawn(async move {
            let data = format!("concurrent{i}").into_bytes();
            let (task, rx) = raftforge::Task::apply(data.clone());
            tasks.send(task).await.expect("submit");
            let resp = rx.await.expect("reply").expect("apply");
            assert_eq!(resp, data);
        }));
    }
    for handle in handles {
        handle.await.expect("apply task");
    }

    cluster.wait_fsm_len(100, LONG).await;
    let reference = cluster.fsms[&leader].commands();
    assert_eq!(reference.len(), 100);
    for (id, fsm) in &cluster.fsms {
        assert_eq!(fsm.commands(), reference, "node {id} diverged");
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_catch_up() {
    // two voters plus a nonvoter: the nonvoter never campaigns, so its
    // return cannot disturb leadership and catch-up must go through
    // snapshot installation once the log is compacted
    let cluster = Cluster::launch_with(vec![
        raftforge::Node::voter(1, addr_of(1)),
        raftforge::Node::voter(2, addr_of(2)),
        raftforge::Node::nonvoter(3, addr_of(3)),
    ])
    .await;
    let leader = cluster.wait_for_leader_among(&[1, 2], SHORT).await;

    cluster.isolate(3);

    let mut want = Vec::new();
    for i in 0..10 {
        let data = format!("snap{i}").into_bytes();
        cluster.apply(leader, data.clone()).await.unwrap();
        want.push(data);
    }

    // compacts the log up to the snapshot index
    let snap_index = cluster.nodes[&leader].take_snapshot(1).await.unwrap();
    let applied = cluster.info(leader).await.last_applied;
    assert_eq!(snap_index, applied);

    cluster.reconnect_all();
    let want: Vec<&[u8]> = want.iter().map(Vec::as_slice).collect();
    cluster.wait_fsm_convergence(&want, LONG).await;

    let behind = cluster.info(3).await;
    assert!(behind.last_log_index >= snap_index);
    assert!(behind.last_applied >= snap_index);
    assert_eq!(behind.role, Role::Follower);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_vote_with_known_leader() {
    let cluster = Cluster::launch(3).await;
    let leader = cluster.wait_for_leader(SHORT).await;
    // give heartbeats a moment so every follower knows the leader
    tokio::time::sleep(2 * HEARTBEAT).await;

    let info = cluster.info(leader).await;
    let follower = (1..=3).find(|id| *id != leader).unwrap();
    let other = (1..=3).find(|id| *id != leader && *id != follower).unwrap();

    let (_listener, dialer) = cluster.net.host("client:1");
    let mut conn = dialer.dial(&addr_of(follower), Duration::from_secs(1)).await.unwrap();

    // a follower with a leader re-grants that leader's vote
    let from_leader = Request::Vote(VoteReq {
        term: info.term,
        candidate: leader,
        last_log_index: info.last_log_index,
        last_log_term: info.last_log_term,
    });
    write_request(&mut conn, &from_leader).await.unwrap();
    let granted = read_response(&mut conn, RPC_VOTE).await.unwrap();
    assert_eq!(granted.result(), RpcResult::Success);
    assert_eq!(granted.term(), info.term);

    // identical request, identical answer
    write_request(&mut conn, &from_leader).await.unwrap();
    let again = read_response(&mut conn, RPC_VOTE).await.unwrap();
    assert_eq!(again.result(), RpcResult::Success);
    assert_eq!(again.term(), info.term);

    // any other candidate is rejected in this term
    let from_other = Request::Vote(VoteReq {
        term: info.term,
        candidate: other,
        last_log_index: info.last_log_index,
        last_log_term: info.last_log_term,
    });
    write_request(&mut conn, &from_other).await.unwrap();
    let rejected = read_response(&mut conn, RPC_VOTE).await.unwrap();
    assert_eq!(rejected.result(), RpcResult::LeaderKnown);

    // the cluster must still be on the same leader
    assert_eq!(cluster.info(follower).await.leader, leader);
    assert_eq!(cluster.info(follower).await.role, Role::Follower);

    cluster.shutdown().await;
}
