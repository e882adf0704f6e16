//! Disconnect, Time-Wait, forced teardown and stale connections.

use rcm_core::wire::CmMessage;
use rcm_core::RejectReason;
use rcm_services::{CallbackOutcome, CmEventKind, CmState, DisconnectReason, IdleReason, QpState};

use crate::*;

async fn wait_disconnected(node: &Node, comm_id: u32) -> DisconnectReason {
    let e = node
        .rec
        .wait_for("disconnect", |e| {
            e.comm_id == comm_id && matches!(e.kind, CmEventKind::Disconnected(_))
        })
        .await;
    match e.kind {
        CmEventKind::Disconnected(reason) => reason,
        _ => unreachable!(),
    }
}

async fn wait_idle(node: &Node, comm_id: u32) -> IdleReason {
    let e = node
        .rec
        .wait_for("idle", |e| e.comm_id == comm_id && matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    match e.kind {
        CmEventKind::Idle(reason) => reason,
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_passes_through_time_wait() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    a.ctx.disconnect(a_id).unwrap();
    assert_eq!(a.ctx.state(a_id), Some(CmState::DreqSent));

    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::RemoteClose);
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::LocalClose);
    assert_eq!(a.ctx.state(a_id), Some(CmState::TimeWait));
    assert_eq!(b.ctx.state(b_id), Some(CmState::TimeWait));
    assert_eq!(a.qp.state(0x11), Some(QpState::Error));
    assert_eq!(b.qp.state(0x200), Some(QpState::Error));

    let a_history = a.ctx.history(a_id).unwrap();
    let b_history = b.ctx.history(b_id).unwrap();
    assert_legal(&a_history);
    assert_legal(&b_history);
    assert!(b_history.ends_with(&[CmState::DreqReceived, CmState::TimeWait]));

    assert_eq!(wait_idle(&a, a_id).await, IdleReason::TimeWaitDone);
    assert_eq!(wait_idle(&b, b_id).await, IdleReason::TimeWaitDone);
    assert_eq!(a.ctx.state(a_id), None);
    assert_eq!(b.ctx.state(b_id), None);

    // Nothing follows the terminal event.
    settle().await;
    assert!(matches!(
        a.rec.kinds(a_id).last(),
        Some(CmEventKind::Idle(IdleReason::TimeWaitDone))
    ));
}

#[tokio::test(start_paused = true)]
async fn passive_side_may_disconnect() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    b.ctx.disconnect(b_id).unwrap();
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::RemoteClose);
    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::LocalClose);
}

#[tokio::test(start_paused = true)]
async fn crossed_disconnects_both_complete() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    a.ctx.disconnect(a_id).unwrap();
    b.ctx.disconnect(b_id).unwrap();

    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::RemoteClose);
    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::RemoteClose);
    assert_eq!(wait_idle(&a, a_id).await, IdleReason::TimeWaitDone);
    assert_eq!(wait_idle(&b, b_id).await, IdleReason::TimeWaitDone);

    // Exactly one disconnect event each.
    for (node, id) in [(&a, a_id), (&b, b_id)] {
        let n = node
            .rec
            .kinds(id)
            .iter()
            .filter(|k| matches!(k, CmEventKind::Disconnected(_)))
            .count();
        assert_eq!(n, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_disconnect_is_harmless() {
    let (a, b) = pair();
    let (a_id, _) = established(&a, &b).await;
    a.ctx.disconnect(a_id).unwrap();
    a.ctx.disconnect(a_id).unwrap();
    assert_eq!(a.link.count(AttrId::Dreq), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_disconnect_times_out() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;
    a.link.drop_next(AttrId::Dreq, usize::MAX);

    a.ctx.disconnect(a_id).unwrap();
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::RemoteTimeout);
    assert_eq!(a.link.count(AttrId::Dreq), 1 + usize::from(MAX_RETRIES));
    assert_eq!(b.ctx.state(b_id), Some(CmState::Established));
}

#[tokio::test(start_paused = true)]
async fn dreq_in_time_wait_is_answered_again() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;
    b.link.drop_next(AttrId::Drep, 1);

    a.ctx.disconnect(a_id).unwrap();
    wait_disconnected(&b, b_id).await;
    // The first DREP was lost; the retransmitted DREQ finds B in Time-Wait.
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::LocalClose);
    assert_eq!(b.link.count(AttrId::Drep), 2);
    assert_eq!(a.link.count(AttrId::Dreq), 2);
}

#[tokio::test(start_paused = true)]
async fn kill_established_sends_dreq_without_further_events() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    a.ctx.kill(a_id).await.unwrap();
    assert_eq!(a.ctx.state(a_id), None);
    assert_eq!(a.qp.state(0x11), Some(QpState::Error));

    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::RemoteClose);
    settle().await;
    assert_eq!(a.rec.kinds(a_id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn kill_while_establishing_rejects() {
    let (a, b) = pair();
    b.rec.set_policy(Policy {
        req: CallbackOutcome::Defer,
        ..Policy::default()
    });
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    let b_id = b.accepted_id().await;

    a.ctx.kill(a_id).await.unwrap();
    assert_eq!(
        wait_idle(&b, b_id).await,
        IdleReason::Rejected(RejectReason::ConsumerReject)
    );
    assert_eq!(b.ctx.state(b_id), None);
    assert!(a.rec.kinds(a_id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_everything() {
    let (a, b) = pair();
    let (_, b_id) = established(&a, &b).await;

    a.ctx.shutdown().await;
    assert_eq!(a.ctx.connection_count(), 0);
    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::RemoteClose);
}

#[tokio::test(start_paused = true)]
async fn new_request_from_a_connected_qp_marks_the_old_connection_stale() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    // Same local QP, new comm id: the passive side must not keep both.
    let retry_id = a.connect(&b, 0x11).await;
    assert_eq!(
        wait_idle(&a, retry_id).await,
        IdleReason::Rejected(RejectReason::StaleConn)
    );
    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::Stale);
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::RemoteClose);
    assert_eq!(b.ctx.state(b_id), Some(CmState::TimeWait));
}

#[tokio::test(start_paused = true)]
async fn repeated_request_inside_the_window_repeats_the_reply() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    // The REP was lost as far as the peer knows: answer the same REQ again.
    let req = a.link.sent_raw(AttrId::Req)[0].clone();
    b.ctx.handle_datagram(a.gid, &req).await;
    settle().await;

    assert_eq!(b.link.count(AttrId::Rep), 2);
    assert_eq!(b.link.count(AttrId::Rej), 0);
    assert_eq!(b.link.count(AttrId::Dreq), 0);
    assert_eq!(a.link.count(AttrId::Rtu), 2);
    assert_eq!(a.ctx.state(a_id), Some(CmState::Established));
    assert_eq!(b.ctx.state(b_id), Some(CmState::Established));
}

#[tokio::test(start_paused = true)]
async fn repeated_request_after_the_window_is_stale() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    let req = a.link.sent_raw(AttrId::Req)[0].clone();
    tokio::time::advance(RESPONSE_TIMEOUT * 2).await;
    b.ctx.handle_datagram(a.gid, &req).await;

    assert_eq!(b.ctx.state(b_id), Some(CmState::TimeWait));
    let sent = b.link.sent();
    let tail: Vec<AttrId> = sent[sent.len() - 2..].iter().map(|m| m.msg.attr_id()).collect();
    assert_eq!(tail, [AttrId::Rej, AttrId::Dreq]);
    let CmMessage::Rej(rej) = &sent[sent.len() - 2].msg else {
        unreachable!()
    };
    assert_eq!(rej.reason.get(), RejectReason::StaleConn.code());
    assert_eq!(b.link.count(AttrId::Rep), 1);

    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::Stale);
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::RemoteClose);
}

#[tokio::test(start_paused = true)]
async fn api_calls_from_a_plain_thread_are_served() {
    let (a, b) = pair();
    a.rec.set_policy(Policy {
        rep: CallbackOutcome::Defer,
        ..Policy::default()
    });
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    a.rec
        .wait_for("REP", |e| matches!(e.kind, CmEventKind::RepReceived(_)))
        .await;

    // Neither call runs inside the runtime.
    let ctx = a.ctx.clone();
    std::thread::spawn(move || ctx.confirm(a_id)).join().unwrap().unwrap();
    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;

    let ctx = a.ctx.clone();
    std::thread::spawn(move || ctx.disconnect(a_id)).join().unwrap().unwrap();
    assert_eq!(a.ctx.state(a_id), Some(CmState::DreqSent));
    assert_eq!(wait_disconnected(&b, b_id).await, DisconnectReason::RemoteClose);
    assert_eq!(wait_disconnected(&a, a_id).await, DisconnectReason::LocalClose);
}
