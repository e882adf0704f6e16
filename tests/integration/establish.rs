//! Connection establishment between two nodes.

use rcm_core::RejectReason;
use rcm_services::{CallbackOutcome, CmEventKind, CmState, IdleReason, QpState};

use crate::*;

#[tokio::test(start_paused = true)]
async fn connect_reaches_established_on_both_sides() {
    let (a, b) = pair();
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    assert_eq!(a.ctx.state(a_id), Some(CmState::ReqSent));

    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;

    assert_eq!(a.ctx.state(a_id), Some(CmState::Established));
    assert_eq!(b.ctx.state(b_id), Some(CmState::Established));
    assert_eq!(
        a.ctx.history(a_id).unwrap(),
        vec![CmState::Idle, CmState::ReqSent, CmState::RepReceived, CmState::Established]
    );
    assert_eq!(
        b.ctx.history(b_id).unwrap(),
        vec![CmState::Idle, CmState::ReqReceived, CmState::RepSent, CmState::Established]
    );

    // Both QPs are ready to send and point at each other.
    let a_qp = a.qp.entry(0x11).unwrap();
    let b_qp = b.qp.entry(0x200).unwrap();
    assert_eq!(a_qp.state, Some(QpState::ReadyToSend));
    assert_eq!(b_qp.state, Some(QpState::ReadyToSend));
    assert_eq!(a_qp.remote_qpn, 0x200);
    assert_eq!(b_qp.remote_qpn, 0x11);
    assert_eq!(a_qp.rq_psn, 0x1234);
    assert_eq!(b_qp.path.unwrap().dgid, a.gid);
}

#[tokio::test(start_paused = true)]
async fn events_carry_the_peer_parameters() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;

    let b_kinds = b.rec.kinds(b_id);
    let CmEventKind::ReqReceived(req) = &b_kinds[0] else {
        panic!("first passive event was {:?}", b_kinds[0]);
    };
    assert_eq!(req.service_id, SERVICE);
    assert_eq!(req.remote_comm_id, a_id);
    assert_eq!(req.remote_gid, a.gid);
    assert_eq!(req.remote_qpn, 0x11);
    assert!(req.private_data.starts_with(b"hello"));
    assert!(!req.peer_to_peer);
    // Paths arrive expressed from the receiver's side.
    assert_eq!(req.primary_path.sgid, b.gid);
    assert_eq!(req.primary_path.dgid, a.gid);
    assert!(matches!(b_kinds[1], CmEventKind::Established));

    let a_kinds = a.rec.kinds(a_id);
    let CmEventKind::RepReceived(rep) = &a_kinds[0] else {
        panic!("first active event was {:?}", a_kinds[0]);
    };
    assert_eq!(rep.remote_comm_id, b_id);
    assert_eq!(rep.remote_qpn, 0x200);
    assert!(rep.private_data.starts_with(b"welcome"));
    assert!(matches!(a_kinds[1], CmEventKind::Established));
    assert_eq!(a_kinds.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn deferred_request_is_delayed_then_accepted() {
    let (a, b) = pair();
    b.rec.set_policy(Policy {
        req: CallbackOutcome::Defer,
        ..Policy::default()
    });
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    let b_id = b.accepted_id().await;
    assert_eq!(b.ctx.state(b_id), Some(CmState::ReqReceived));

    b.ctx.delay(b_id, 14).unwrap();
    let mra = a
        .rec
        .wait_for("MRA", |e| matches!(e.kind, CmEventKind::MraReceived { .. }))
        .await;
    assert!(matches!(
        mra.kind,
        CmEventKind::MraReceived { service_timeout: 14 }
    ));
    assert_eq!(a.ctx.state(a_id), Some(CmState::ReqSent));

    b.ctx
        .accept(
            b_id,
            AcceptParams {
                qpn: 0x300,
                starting_psn: 7,
                responder_resources: 2,
                initiator_depth: 2,
                rnr_retry_count: 7,
                ..AcceptParams::default()
            },
        )
        .unwrap();
    a.wait_established(a_id).await;
    b.wait_established(b_id).await;

    let history = b.ctx.history(b_id).unwrap();
    assert!(history.contains(&CmState::MraSent));
    assert_legal(&history);
    assert_eq!(a.qp.entry(0x11).unwrap().remote_qpn, 0x300);
}

#[tokio::test(start_paused = true)]
async fn deferred_reply_is_confirmed() {
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
    assert_eq!(a.ctx.state(a_id), Some(CmState::RepReceived));
    assert_eq!(a.link.count(AttrId::Rtu), 0);

    a.ctx.confirm(a_id).unwrap();
    a.wait_established(a_id).await;
    let b_id = b.accepted_id().await;
    b.wait_established(b_id).await;
    assert_eq!(a.link.count(AttrId::Rtu), 1);
}

#[tokio::test(start_paused = true)]
async fn confirm_outside_a_reply_is_refused() {
    let (a, b) = pair();
    let (a_id, _) = established(&a, &b).await;
    assert!(matches!(
        a.ctx.confirm(a_id),
        Err(rcmd::CmError::InvalidState { .. })
    ));
    assert!(matches!(
        a.ctx.confirm(0xdead),
        Err(rcmd::CmError::UnknownConnection(0xdead))
    ));
}

#[tokio::test(start_paused = true)]
async fn request_for_unknown_service_is_rejected() {
    let (a, b) = pair();
    let a_id = a.connect(&b, 0x11).await;
    let idle = a
        .rec
        .wait_for("idle", |e| matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    assert_eq!(idle.comm_id, a_id);
    assert!(matches!(
        idle.kind,
        CmEventKind::Idle(IdleReason::Rejected(RejectReason::InvalidServiceId))
    ));
    assert_eq!(a.ctx.state(a_id), None);
    assert_eq!(a.qp.state(0x11), Some(QpState::Error));
    assert!(b.rec.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn consumer_abort_rejects_the_request() {
    let (a, b) = pair();
    b.rec.set_policy(Policy {
        req: CallbackOutcome::Abort,
        ..Policy::default()
    });
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    a.rec
        .wait_for("idle", |e| {
            e.comm_id == a_id
                && matches!(
                    e.kind,
                    CmEventKind::Idle(IdleReason::Rejected(RejectReason::ConsumerReject))
                )
        })
        .await;
    settle().await;

    // Only the listener is left; the refused connection got no more events.
    assert_eq!(b.ctx.connection_count(), 1);
    assert_eq!(b.rec.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reject_from_the_api_carries_private_data() {
    let (a, b) = pair();
    b.rec.set_policy(Policy {
        req: CallbackOutcome::Defer,
        ..Policy::default()
    });
    b.listen();
    let a_id = a.connect(&b, 0x11).await;
    let b_id = b.accepted_id().await;
    b.ctx.reject(b_id, b"go away").unwrap();
    assert_eq!(b.ctx.state(b_id), None);

    a.rec
        .wait_for("idle", |e| e.comm_id == a_id && matches!(e.kind, CmEventKind::Idle(_)))
        .await;
    let rej = b
        .link
        .sent()
        .into_iter()
        .find_map(|m| match m.msg {
            rcm_core::wire::CmMessage::Rej(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(rej.reason.get(), RejectReason::ConsumerReject.code());
    assert_eq!(rej.remote_comm_id.get(), a_id);
    assert!(rej.private_data.starts_with(b"go away"));
}

#[tokio::test(start_paused = true)]
async fn stopped_listener_no_longer_accepts() {
    let (a, b) = pair();
    let listen_id = b.listen();
    assert_eq!(b.ctx.state(listen_id), Some(CmState::Listening));
    b.ctx.stop_listen(listen_id).await.unwrap();
    assert_eq!(b.ctx.connection_count(), 0);

    let a_id = a.connect(&b, 0x11).await;
    a.rec
        .wait_for("rejection", |e| {
            e.comm_id == a_id
                && matches!(
                    e.kind,
                    CmEventKind::Idle(IdleReason::Rejected(RejectReason::InvalidServiceId))
                )
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn overlapping_listeners_conflict() {
    let (_a, b) = pair();
    b.listen();
    let err = b
        .ctx
        .listen(SERVICE & !0xff, !0xff, b.handler())
        .unwrap_err();
    assert!(matches!(err, rcmd::CmError::Service(_)));
}
