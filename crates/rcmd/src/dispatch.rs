//! Routes inbound CM datagrams to the state machine that owns them.

use rcm_core::wire::{CmMessage, Mad, HEADER_SIZE};
use rcm_core::Gid;

use crate::cm::CmContext;

impl CmContext {
    /// Feed one received datagram to the engine. `src` is the sender's
    /// port GID as seen by the transport. Malformed datagrams are logged
    /// and dropped.
    pub async fn handle_datagram(&self, src: Gid, bytes: &[u8]) {
        let mad = match Mad::decode(bytes) {
            Ok(mad) => mad,
            Err(e) => {
                let head = &bytes[..bytes.len().min(HEADER_SIZE)];
                tracing::debug!(
                    src = %src,
                    len = bytes.len(),
                    header = %hex::encode(head),
                    error = %e,
                    "dropping datagram"
                );
                return;
            }
        };
        let tid = mad.tid();
        tracing::trace!(
            src = %src,
            attr = ?mad.msg.attr_id(),
            comm_id = mad.msg.local_comm_id(),
            tid = %format_args!("0x{tid:016x}"),
            "recv"
        );
        match &mad.msg {
            CmMessage::Req(m) => self.on_req(src, tid, m).await,
            CmMessage::Mra(m) => self.on_mra(m),
            CmMessage::Rej(m) => self.on_rej(m),
            CmMessage::Rep(m) => self.on_rep(m),
            CmMessage::Rtu(m) => self.on_rtu(m),
            CmMessage::Dreq(m) => self.on_dreq(src, tid, m),
            CmMessage::Drep(m) => self.on_drep(m),
            CmMessage::Lap(m) => self.on_lap(tid, m),
            CmMessage::Apr(m) => self.on_apr(m),
        }
    }
}
