//! Alternate path loading and migration.

use rcm_core::wire::AprStatus;
use rcm_services::{AltPathStatus, CallbackOutcome, CmEventKind, CmState};
use rcmd::CmError;

use crate::*;

fn alternate(a: &Node, b: &Node) -> PathRecord {
    let mut path = PathRecord::between(a.gid, b.gid);
    path.dgid = gid(0xbb);
    path
}

async fn wait_alt_result(node: &Node, comm_id: u32) -> AltPathStatus {
    let e = node
        .rec
        .wait_for("alternate path result", |e| {
            e.comm_id == comm_id && matches!(e.kind, CmEventKind::AltPathResult(_))
        })
        .await;
    match e.kind {
        CmEventKind::AltPathResult(status) => status,
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn alternate_path_is_loaded_and_migrated_to() {
    let (a, b) = pair();
    let (a_id, b_id) = established(&a, &b).await;
    let path = alternate(&a, &b);

    a.ctx.load_alternate_path(a_id, path).unwrap();
    assert_eq!(
        wait_alt_result(&a, a_id).await,
        AltPathStatus::Response(AprStatus::Loaded)
    );

    // The passive side saw the path from its own end and armed it.
    let lap = b
        .rec
        .wait_for("LAP", |e| matches!(e.kind, CmEventKind::LapReceived(_)))
        .await;
    let CmEventKind::LapReceived(seen) = lap.kind else {
        unreachable!()
    };
    assert_eq!(lap.comm_id, b_id);
    assert_eq!(seen.sgid, gid(0xbb));
    assert_eq!(seen.dgid, a.gid);
    assert_eq!(b.qp.entry(0x200).unwrap().alternate, Some(seen));

    a.ctx.migrate(a_id).unwrap();
    assert_eq!(a.qp.entry(0x11).unwrap().path.map(|p| p.dgid), Some(gid(0xbb)));
    assert!(matches!(a.ctx.migrate(a_id), Err(CmError::NoAlternatePath)));
    assert_eq!(a.ctx.state(a_id), Some(CmState::Established));
}

#[tokio::test(start_paused = true)]
async fn passive_consumer_may_refuse_the_path() {
    let (a, b) = pair();
    b.rec.set_policy(Policy {
        lap: CallbackOutcome::Abort,
        ..Policy::default()
    });
    let (a_id, _) = established(&a, &b).await;

    a.ctx.load_alternate_path(a_id, alternate(&a, &b)).unwrap();
    assert_eq!(
        wait_alt_result(&a, a_id).await,
        AltPathStatus::Response(AprStatus::Rejected)
    );
    assert!(matches!(a.ctx.migrate(a_id), Err(CmError::NoAlternatePath)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_lap_times_out() {
    let (a, b) = pair();
    let (a_id, _) = established(&a, &b).await;
    a.link.drop_next(AttrId::Lap, usize::MAX);

    a.ctx.load_alternate_path(a_id, alternate(&a, &b)).unwrap();
    assert!(matches!(
        a.ctx.load_alternate_path(a_id, alternate(&a, &b)),
        Err(CmError::LapPending)
    ));
    assert_eq!(wait_alt_result(&a, a_id).await, AltPathStatus::Timeout);
    assert_eq!(a.link.count(AttrId::Lap), 1 + usize::from(MAX_RETRIES));

    // The connection itself is unaffected.
    assert_eq!(a.ctx.state(a_id), Some(CmState::Established));
}

#[tokio::test(start_paused = true)]
async fn only_the_active_side_proposes_paths() {
    let (a, b) = pair();
    let (_, b_id) = established(&a, &b).await;
    assert!(matches!(
        b.ctx.load_alternate_path(b_id, alternate(&b, &a)),
        Err(CmError::InvalidState { .. })
    ));
}
