//! Peer-to-peer establishment: both nodes listen and connect at once.

use rcm_services::{CmEventKind, CmState};
use rcmd::CmError;

use crate::*;

fn p2p_params(from: &Node, to: &Node, qpn: u32) -> ConnectParams {
    let mut params = from.params_to(to, qpn);
    params.peer_to_peer = true;
    params
}

#[tokio::test(start_paused = true)]
async fn crossed_requests_make_one_connection() {
    let (a, b) = pair();
    a.listen();
    b.listen();

    // Both REQs are on the wire before either is delivered.
    let a_id = a
        .ctx
        .connect(p2p_params(&a, &b, 0x21), a.handler())
        .await
        .unwrap();
    let b_id = b
        .ctx
        .connect(p2p_params(&b, &a, 0x22), b.handler())
        .await
        .unwrap();

    a.wait_established(a_id).await;
    b.wait_established(b_id).await;
    settle().await;

    // fe80::a < fe80::b, so a gives way and answers b's REQ.
    let a_history = a.ctx.history(a_id).unwrap();
    assert_eq!(
        a_history,
        vec![
            CmState::Idle,
            CmState::ReqSent,
            CmState::ReqReceived,
            CmState::RepSent,
            CmState::Established
        ]
    );
    assert_eq!(
        b.ctx.history(b_id).unwrap(),
        vec![CmState::Idle, CmState::ReqSent, CmState::RepReceived, CmState::Established]
    );
    assert_legal(&a_history);

    // One listener and one connection on each side.
    assert_eq!(a.ctx.connection_count(), 2);
    assert_eq!(b.ctx.connection_count(), 2);
    assert_eq!(b.link.count(AttrId::Rep), 0);
    assert_eq!(a.link.count(AttrId::Rep), 1);

    let a_kinds = a.rec.kinds(a_id);
    assert!(matches!(a_kinds[0], CmEventKind::ReqReceived(_)));
}

#[tokio::test(start_paused = true)]
async fn crossed_requests_on_one_gid_are_decided_by_qpn() {
    let (a, b) = pair_with(gid(0xc), gid(0xc));
    a.listen();
    b.listen();

    // a's QP number is the larger, so b gives way this time.
    let a_id = a
        .ctx
        .connect(p2p_params(&a, &b, 0x22), a.handler())
        .await
        .unwrap();
    let b_id = b
        .ctx
        .connect(p2p_params(&b, &a, 0x21), b.handler())
        .await
        .unwrap();

    a.wait_established(a_id).await;
    b.wait_established(b_id).await;
    settle().await;

    assert_eq!(
        a.ctx.history(a_id).unwrap(),
        vec![CmState::Idle, CmState::ReqSent, CmState::RepReceived, CmState::Established]
    );
    let b_history = b.ctx.history(b_id).unwrap();
    assert_eq!(
        b_history,
        vec![
            CmState::Idle,
            CmState::ReqSent,
            CmState::ReqReceived,
            CmState::RepSent,
            CmState::Established
        ]
    );
    assert_legal(&b_history);
    assert_eq!(a.link.count(AttrId::Rep), 0);
    assert_eq!(b.link.count(AttrId::Rep), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_to_peer_needs_a_listener() {
    let (a, b) = pair();
    let err = a
        .ctx
        .connect(p2p_params(&a, &b, 0x21), a.handler())
        .await
        .unwrap_err();
    assert!(matches!(err, CmError::NoListener(SERVICE)));
    assert_eq!(a.ctx.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_pending_peer_to_peer_connect_per_service() {
    let (a, b) = pair();
    a.listen();
    a.link.drop_next(AttrId::Req, usize::MAX);
    a.ctx
        .connect(p2p_params(&a, &b, 0x21), a.handler())
        .await
        .unwrap();
    let err = a
        .ctx
        .connect(p2p_params(&a, &b, 0x23), a.handler())
        .await
        .unwrap_err();
    assert!(matches!(err, CmError::PeerToPeerBusy(SERVICE)));
}

#[tokio::test(start_paused = true)]
async fn peer_to_peer_request_to_a_plain_listener_is_answered_normally() {
    let (a, b) = pair();
    a.listen();
    b.listen();
    let a_id = a
        .ctx
        .connect(p2p_params(&a, &b, 0x21), a.handler())
        .await
        .unwrap();
    a.wait_established(a_id).await;

    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;
    let CmEventKind::ReqReceived(req) = &b.rec.kinds(b_id)[0] else {
        panic!("expected a REQ event");
    };
    assert!(req.peer_to_peer);
}
