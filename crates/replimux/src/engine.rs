//! See [`Engine`].

use std::time::Instant;

use crate::{
    conn::{ConnId, Connection},
    mbuf::MbufPool,
    msg::{Family, MsgKind, MsgToken},
    pool::{MsgPool, PoolFull},
    proto::Protocol,
    timeout::TimeoutIndex,
};

/// Tunables for one [`Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Message shells allocatable by non-forced acquires. Past this point
    /// client traffic is shed while replication traffic still gets shells.
    pub msg_soft_ceil: usize,
    /// Absolute message shell ceiling; no acquire succeeds past it.
    pub msg_hard_ceil: usize,
    /// Data-region capacity of every buffer segment.
    pub mbuf_len: usize,
    /// Trailing segment region reserved for cipher block overhead.
    pub mbuf_extra_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            msg_soft_ceil: 4096,
            msg_hard_ceil: 8192,
            mbuf_len: 16384,
            mbuf_extra_len: 16,
        }
    }
}

/// Counters exposed to the stats collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub msgs_acquired: u64,
    pub frags_created: u64,
    pub frames_parsed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Client-plane parse failures.
    pub parse_errors: u64,
    /// Replication-plane parse failures that were swallowed.
    pub dyn_parse_errors: u64,
}

/// Per-event-loop message engine state.
///
/// One engine owns one message pool, one segment pool, and one timeout
/// index. Event loops never share an engine; multi-core deployments run one
/// engine per loop with no shared mutable state, so nothing in here takes a
/// lock.
#[derive(Debug)]
pub struct Engine {
    pub msgs: MsgPool,
    pub mbufs: MbufPool,
    pub timeouts: TimeoutIndex,
    pub stats: EngineStats,
    pub(crate) next_frag_id: u64,
}

impl Engine {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            msgs: MsgPool::new(config.msg_soft_ceil, config.msg_hard_ceil),
            mbufs: MbufPool::new(config.mbuf_len, config.mbuf_extra_len),
            timeouts: TimeoutIndex::new(),
            stats: EngineStats::default(),
            next_frag_id: 0,
        }
    }

    /// Acquires a message shell.
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
        let tok = self
            .msgs
            .acquire(owner, request, family, dyn_mode, proto, force, now)?;
        self.stats.msgs_acquired += 1;
        Ok(tok)
    }

    /// Acquires a message shell for traffic arriving on `conn`, forcing the
    /// acquire on the replication plane.
    pub fn acquire_for_conn<C: Connection + ?Sized>(
        &mut self,
        conn: &C,
        request: bool,
        now: Instant,
    ) -> Result<MsgToken, PoolFull> {
        self.acquire(
            conn.id(),
            request,
            conn.family(),
            conn.dyn_mode(),
            conn.proto(),
            conn.dyn_mode(),
            now,
        )
    }

    /// Acquires a sibling shell inheriting `tok`'s owner, role, family,
    /// plane, and protocol binding.
    pub(crate) fn acquire_like(&mut self, tok: MsgToken, now: Instant) -> Result<MsgToken, PoolFull> {
        let (owner, request, family, dyn_mode, proto) = {
            let msg = self.msgs.get(tok).ok_or(PoolFull)?;
            (msg.owner(), msg.request, msg.family, msg.dyn_mode, msg.proto())
        };
        self.acquire(owner, request, family, dyn_mode, proto, dyn_mode, now)
    }

    /// Releases a message: timeout entry deleted, chain drained, envelope
    /// dropped, peer unlinked, shell recycled.
    pub fn release_msg(&mut self, tok: MsgToken) -> bool {
        self.timeouts.delete(&mut self.msgs, tok);
        self.msgs.release(tok, &mut self.mbufs)
    }

    /// Releases every message a closing connection still owns, timeout
    /// entries first. Returns how many were released.
    pub fn sweep(&mut self, msgs: impl IntoIterator<Item = MsgToken>) -> usize {
        let mut released = 0;
        for tok in msgs {
            if self.release_msg(tok) {
                released += 1;
            }
        }
        released
    }

    /// Starts tracking `tok` against `conn`'s per-request deadline.
    ///
    /// A missing or zero [`Connection::server_timeout`] skips tracking, as
    /// do non-requests and `quit`/`noreply` messages.
    pub fn insert_timeout<C: Connection + ?Sized>(
        &mut self,
        conn: &C,
        tok: MsgToken,
        now: Instant,
    ) -> bool {
        let Some(timeout) = conn.server_timeout() else {
            return false;
        };
        if timeout.is_zero() {
            return false;
        }
        self.timeouts
            .insert(&mut self.msgs, tok, conn.id(), now + timeout)
    }

    /// Synthesises a one-line error response frame for `conn`'s family:
    /// prefix, source tag, error text, CRLF.
    pub fn error_reply<C: Connection + ?Sized>(
        &mut self,
        conn: &C,
        source: &str,
        error: &str,
        now: Instant,
    ) -> Result<MsgToken, PoolFull> {
        let proto = conn.proto();
        let tok = self.acquire(
            conn.id(),
            false,
            conn.family(),
            conn.dyn_mode(),
            proto,
            true,
            now,
        )?;
        let line = format!("{} {source} {error}\r\n", proto.error_prefix());
        let Engine { msgs, mbufs, .. } = self;
        if let Some(msg) = msgs.get_mut(tok) {
            msg.chain.extend_from_slice(line.as_bytes(), mbufs);
            msg.pos = msg.chain.len();
            msg.kind = MsgKind::Error;
            msg.error = true;
            msg.done = true;
        }
        Ok(tok)
    }

    /// Allocates a fresh fragment-group id (never 0).
    pub(crate) fn alloc_frag_id(&mut self) -> u64 {
        self.next_frag_id += 1;
        self.next_frag_id
    }
}
