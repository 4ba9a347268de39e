//! See [`MsgPool`].

use std::time::Instant;

use tracing::{debug, warn};

use crate::{
    conn::ConnId,
    mbuf::MbufPool,
    msg::{Family, Msg, MsgId, MsgToken},
    proto::{Protocol, UNBOUND},
};

/// No message shell could be acquired.
///
/// Non-forced acquires fail at the soft ceiling; every acquire fails at the
/// hard ceiling.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message pool exhausted")]
pub struct PoolFull;

#[derive(Debug)]
struct Slot {
    live: bool,
    msg: Msg,
}

/// Arena of recyclable message shells with soft and hard allocation
/// ceilings.
///
/// Shells are addressed through generation-checked [`MsgToken`]s and
/// recycled LIFO. The soft ceiling sheds droppable client traffic under
/// overload; forced acquires (the replication plane) bypass it but never
/// the hard ceiling, so inbound replication is not starved by client load
/// and a runaway peer still cannot exhaust memory.
#[derive(Debug)]
pub struct MsgPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_id: u64,
    soft_ceil: usize,
    hard_ceil: usize,
}

impl MsgPool {
    /// Creates a pool with the given ceilings.
    ///
    /// # Panics
    ///
    /// Panics if `soft_ceil` is 0 or exceeds `hard_ceil`.
    #[must_use]
    pub fn new(soft_ceil: usize, hard_ceil: usize) -> Self {
        assert!(soft_ceil > 0 && soft_ceil <= hard_ceil);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_id: 1,
            soft_ceil,
            hard_ceil,
        }
    }

    /// Shells allocated over the pool's lifetime, free or live.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Shells currently sitting in the free-list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Acquires a message shell bound to `proto` with a fresh id.
    ///
    /// The free-list head is reused when available; otherwise a new shell
    /// is allocated subject to the ceilings. `force` is asserted by
    /// replication-plane callers.
    pub fn acquire(
        &mut self,
        owner: ConnId,
        request: bool,
        family: Family,
        dyn_mode: bool,
        proto: &'static dyn Protocol,
        force: bool,
        now: Instant,
    ) -> Result<MsgToken, PoolFull> {
        let slot_idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            if self.slots.len() >= self.hard_ceil {
                warn!(allocated = self.slots.len(), "message pool hard ceiling hit");
                return Err(PoolFull);
            }
            if self.slots.len() >= self.soft_ceil && !force {
                debug!(allocated = self.slots.len(), "message pool soft ceiling hit");
                return Err(PoolFull);
            }
            self.slots.push(Slot {
                live: false,
                msg: Msg::shell(&UNBOUND, now),
            });
            u32::try_from(self.slots.len() - 1).map_err(|_| PoolFull)?
        };

        let id = MsgId(self.next_id);
        self.next_id += 1;

        let slot = &mut self.slots[slot_idx as usize];
        slot.msg.rebind(id, owner, request, family, dyn_mode, proto, now);
        slot.live = true;
        Ok(MsgToken { slot: slot_idx, id })
    }

    /// Releases `tok`'s shell back to the free-list head: the chain is
    /// drained into `mbufs`, the envelope dropped, and the peer link broken
    /// on both sides.
    ///
    /// Releasing a stale token is a no-op and returns `false`.
    pub fn release(&mut self, tok: MsgToken, mbufs: &mut MbufPool) -> bool {
        let Some(idx) = self.index(tok) else {
            return false;
        };
        let peer = {
            let slot = &mut self.slots[idx];
            let peer = slot.msg.peer.take();
            slot.msg.chain.drain(mbufs);
            slot.msg.dmsg = None;
            slot.msg.tmo_key = None;
            slot.msg.frag_owner = None;
            slot.live = false;
            peer
        };
        self.free.push(tok.slot);
        if let Some(ptok) = peer {
            if let Some(pmsg) = self.get_mut(ptok) {
                pmsg.peer = None;
            }
        }
        true
    }

    fn index(&self, tok: MsgToken) -> Option<usize> {
        let idx = tok.slot as usize;
        let slot = self.slots.get(idx)?;
        (slot.live && slot.msg.id() == tok.id).then_some(idx)
    }

    #[must_use]
    pub fn get(&self, tok: MsgToken) -> Option<&Msg> {
        self.index(tok).map(|idx| &self.slots[idx].msg)
    }

    pub fn get_mut(&mut self, tok: MsgToken) -> Option<&mut Msg> {
        self.index(tok).map(|idx| &mut self.slots[idx].msg)
    }

    /// Resolves two distinct tokens mutably at once.
    pub fn get2_mut(&mut self, a: MsgToken, b: MsgToken) -> Option<(&mut Msg, &mut Msg)> {
        let ia = self.index(a)?;
        let ib = self.index(b)?;
        if ia == ib {
            return None;
        }
        if ia < ib {
            let (left, right) = self.slots.split_at_mut(ib);
            Some((&mut left[ia].msg, &mut right[0].msg))
        } else {
            let (left, right) = self.slots.split_at_mut(ia);
            Some((&mut right[0].msg, &mut left[ib].msg))
        }
    }

    /// Links `req` and `rsp` as a request/response pair through `peer`.
    pub fn link_peers(&mut self, req: MsgToken, rsp: MsgToken) -> bool {
        let Some((req_msg, rsp_msg)) = self.get2_mut(req, rsp) else {
            return false;
        };
        req_msg.peer = Some(rsp);
        rsp_msg.peer = Some(req);
        true
    }
}
