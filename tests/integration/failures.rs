//! Lost datagrams, retransmission and malformed input.

use rcm_core::wire::{CmMessage, DreqMsg, Mad};
use rcm_core::RejectReason;
use rcm_services::{CmEventKind, CmState, IdleReason};
use zerocopy::byteorder::U32;
use zerocopy::FromZeroes;

use crate::*;

#[tokio::test(start_paused = true)]
async fn lost_requests_are_retransmitted_then_abandoned() {
    let (a, b) = pair();
    b.listen();
    a.link.drop_next(AttrId::Req, usize::MAX);
    let a_id = a.connect(&b, 0x11).await;

    let idle = a
        .rec
        .wait_for("timeout", |e| matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    assert_eq!(idle.comm_id, a_id);
    assert!(matches!(idle.kind, CmEventKind::Idle(IdleReason::RemoteTimeout)));
    assert_eq!(a.ctx.state(a_id), None);

    // Every retransmission is the original datagram.
    let reqs = a.link.sent_raw(AttrId::Req);
    assert_eq!(reqs.len(), 1 + usize::from(MAX_RETRIES));
    assert!(reqs.iter().all(|r| r == &reqs[0]));

    // The abandoned attempt is reported to the peer.
    let last = a.link.sent().pop().unwrap();
    let CmMessage::Rej(rej) = last.msg else {
        panic!("last datagram was {:?}", last.msg.attr_id());
    };
    assert_eq!(rej.reason.get(), RejectReason::Timeout.code());
    assert!(b.rec.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_rtu_is_recovered_by_rep_retransmission() {
    let (a, b) = pair();
    b.listen();
    a.link.drop_next(AttrId::Rtu, 1);
    let a_id = a.connect(&b, 0x11).await;
    a.wait_established(a_id).await;

    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;

    let reps = b.link.sent_raw(AttrId::Rep);
    assert_eq!(reps.len(), 2);
    assert_eq!(reps[0], reps[1]);
    let rtus = a.link.sent_raw(AttrId::Rtu);
    assert_eq!(rtus.len(), 2);
    assert_eq!(rtus[0], rtus[1]);

    // The repeated REP did not produce a second event on the active side.
    assert_eq!(a.rec.kinds(a_id).len(), 2);
    assert_legal(&a.ctx.history(a_id).unwrap());
    assert_legal(&b.ctx.history(b_id).unwrap());
}

#[tokio::test(start_paused = true)]
async fn lost_rep_leaves_a_single_passive_connection() {
    let (a, b) = pair();
    b.listen();
    b.link.drop_next(AttrId::Rep, 1);
    let a_id = a.connect(&b, 0x11).await;
    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;

    // Listener plus the one connection, whatever got retransmitted.
    assert_eq!(b.ctx.connection_count(), 2);
    let reqs = b
        .rec
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, CmEventKind::ReqReceived(_)))
        .count();
    assert_eq!(reqs, 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_reply_times_out_on_both_sides() {
    let (a, b) = pair();
    b.listen();
    a.link.drop_next(AttrId::Rtu, usize::MAX);
    let a_id = a.connect(&b, 0x11).await;
    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;

    let b_idle = b
        .rec
        .wait_for("passive timeout", |e| matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    assert_eq!(b_idle.comm_id, b_id);
    assert!(matches!(b_idle.kind, CmEventKind::Idle(IdleReason::RemoteTimeout)));
    assert_eq!(b.link.count(AttrId::Rep), 1 + usize::from(MAX_RETRIES));

    // The REJ that follows takes the active side down too.
    let a_idle = a
        .rec
        .wait_for("active rejection", |e| matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    assert!(matches!(
        a_idle.kind,
        CmEventKind::Idle(IdleReason::Rejected(RejectReason::Timeout))
    ));
    assert_eq!(a.ctx.state(a_id), None);
    assert_eq!(b.ctx.state(b_id), None);
}

#[tokio::test(start_paused = true)]
async fn malformed_datagrams_are_dropped() {
    let (a, b) = pair();
    a.ctx.handle_datagram(b.gid, &[0u8; 10]).await;
    a.ctx.handle_datagram(b.gid, &[0u8; 256]).await;
    let mut bad_attr = Mad::new(1, CmMessage::Dreq(DreqMsg::new_zeroed()))
        .to_bytes()
        .to_vec();
    bad_attr[16] = 0xff;
    bad_attr[17] = 0xff;
    a.ctx.handle_datagram(b.gid, &bad_attr).await;
    settle().await;

    assert!(a.link.sent().is_empty());
    assert_eq!(a.ctx.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dreq_for_unknown_connection_is_answered() {
    let (a, b) = pair();
    let mut dreq = DreqMsg::new_zeroed();
    dreq.local_comm_id = U32::new(77);
    dreq.remote_comm_id = U32::new(0x4242);
    let bytes = Mad::new(9, CmMessage::Dreq(dreq)).to_bytes();

    b.ctx.handle_datagram(a.gid, &bytes).await;

    let sent = b.link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tid(), 9);
    let CmMessage::Drep(drep) = &sent[0].msg else {
        panic!("answered with {:?}", sent[0].msg.attr_id());
    };
    assert_eq!(drep.remote_comm_id.get(), 77);
    assert_eq!(drep.local_comm_id.get(), 0x4242);
}

#[tokio::test(start_paused = true)]
async fn establishment_history_stays_on_the_graph() {
    let (a, b) = pair();
    b.listen();
    a.link.drop_next(AttrId::Req, 1);
    b.link.drop_next(AttrId::Rep, 1);
    let a_id = a.connect(&b, 0x11).await;
    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;

    for history in [a.ctx.history(a_id).unwrap(), b.ctx.history(b_id).unwrap()] {
        assert_legal(&history);
        assert_eq!(history.last(), Some(&CmState::Established));
    }
}
