//! See [`Msg`].

use std::{fmt, time::Instant};

use bytes::Bytes;

use crate::{
    chain::Chain,
    conn::ConnId,
    dmsg::Dmsg,
    proto::{ParseStatus, Protocol},
};

/// Monotonic identifier assigned to a message at acquisition.
///
/// Ids are per-engine and never reused, which makes them usable as the
/// generation check inside [`MsgToken`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgId(pub u64);

/// Weak handle to a message living in the engine's pool.
///
/// A token resolves only while the message it was issued for is still live;
/// after release (and any later slot reuse) the generation check fails and
/// lookups return [`None`]. This is how the `peer` and `frag_owner`
/// back-links stay safe without owning pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgToken {
    pub(crate) slot: u32,
    pub(crate) id: MsgId,
}

impl MsgToken {
    /// Id of the message this token was issued for.
    #[must_use]
    pub const fn id(&self) -> MsgId {
        self.id
    }
}

/// Wire-protocol family of a connection or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Text-line protocol: space-separated tokens, CRLF terminated.
    Ascii,
    /// Length-prefixed inline protocol: `*n` arrays of `$len` bulks.
    Inline,
}

/// Decoded message kind, abstracted over both families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MsgKind {
    #[default]
    Unknown,
    /// Single-key retrieval.
    Get,
    /// Multi-key retrieval; fragments per key.
    MultiGet,
    /// Storage command carrying a value body.
    Store,
    /// Single-key deletion.
    Delete,
    /// Multi-key deletion; fragments per key.
    MultiDelete,
    /// Increment/decrement.
    Arith,
    /// Connection shutdown request.
    Quit,
    /// One-line status response.
    Status,
    /// One-line error response.
    Error,
    /// Integer response.
    Integer,
    /// Single bulk response.
    Bulk,
    /// Array response.
    Array,
    /// `VALUE`-block response (hit), terminated by `END`.
    Value,
    /// Bare `END` response (miss).
    End,
}

/// Parsing and I/O state for one in-flight request or response.
///
/// A message owns its byte [`Chain`] and, on the replication plane, its
/// internode envelope. Everything else is either decoded protocol state or
/// a weak link to a related message.
pub struct Msg {
    pub(crate) id: MsgId,
    pub(crate) owner: ConnId,
    pub(crate) proto: &'static dyn Protocol,

    /// Paired message on the opposite side of the proxy (request ↔
    /// response). Weak; unlinked by whichever side is released first.
    pub peer: Option<MsgToken>,
    pub request: bool,
    pub family: Family,
    /// Whether this message travels on the peer-to-peer replication plane.
    pub dyn_mode: bool,

    pub chain: Chain,
    /// Parser cursor: byte offset from the start of the chain.
    pub pos: usize,
    /// Parser-owned scratch; opaque to the engine.
    pub state: u16,
    /// Outcome of the most recent parse invocation.
    pub result: Option<ParseStatus>,

    pub kind: MsgKind,
    /// Decoded key span as chain offsets, `[key_start, key_end)`.
    pub key_start: usize,
    pub key_end: usize,
    /// Declared value length of a storage command.
    pub vlen: usize,
    /// Declared argument count (inline family).
    pub narg: u32,
    /// Arguments still unread past the parser cursor (inline family).
    pub rnarg: u32,
    /// Bytes of the current value body still to consume.
    pub rlen: usize,
    /// Decoded integer payload.
    pub integer: u64,

    /// Fragment group id; 0 means not fragmented.
    pub frag_id: u64,
    /// Back-reference to the first fragment of the group.
    pub frag_owner: Option<MsgToken>,
    /// Total sibling count; maintained on the group owner only.
    pub nfrag: u32,
    pub first_fragment: bool,
    pub last_fragment: bool,

    pub error: bool,
    /// A fragment of this message's group failed.
    pub ferror: bool,
    pub done: bool,
    pub fdone: bool,
    pub quit: bool,
    pub noreply: bool,
    /// Response is consumed internally, never forwarded.
    pub swallow: bool,
    /// Whether the decoded command is a read.
    pub is_read: bool,

    /// Internode envelope; present on replication-plane messages only.
    pub dmsg: Option<Box<Dmsg>>,

    pub(crate) tmo_key: Option<(Instant, MsgId)>,
    /// When this message entered the engine, for latency accounting.
    pub stime: Instant,
}

impl Msg {
    pub(crate) fn shell(proto: &'static dyn Protocol, now: Instant) -> Self {
        Self {
            id: MsgId(0),
            owner: ConnId(0),
            proto,
            peer: None,
            request: false,
            family: Family::Ascii,
            dyn_mode: false,
            chain: Chain::new(),
            pos: 0,
            state: 0,
            result: None,
            kind: MsgKind::Unknown,
            key_start: 0,
            key_end: 0,
            vlen: 0,
            narg: 0,
            rnarg: 0,
            rlen: 0,
            integer: 0,
            frag_id: 0,
            frag_owner: None,
            nfrag: 0,
            first_fragment: false,
            last_fragment: false,
            error: false,
            ferror: false,
            done: false,
            fdone: false,
            quit: false,
            noreply: false,
            swallow: false,
            is_read: false,
            dmsg: None,
            tmo_key: None,
            stime: now,
        }
    }

    pub(crate) fn rebind(
        &mut self,
        id: MsgId,
        owner: ConnId,
        request: bool,
        family: Family,
        dyn_mode: bool,
        proto: &'static dyn Protocol,
        now: Instant,
    ) {
        debug_assert!(self.chain.is_empty());
        debug_assert!(self.dmsg.is_none());
        self.id = id;
        self.owner = owner;
        self.proto = proto;
        self.peer = None;
        self.request = request;
        self.family = family;
        self.dyn_mode = dyn_mode;
        self.pos = 0;
        self.state = 0;
        self.result = None;
        self.kind = MsgKind::Unknown;
        self.key_start = 0;
        self.key_end = 0;
        self.vlen = 0;
        self.narg = 0;
        self.rnarg = 0;
        self.rlen = 0;
        self.integer = 0;
        self.frag_id = 0;
        self.frag_owner = None;
        self.nfrag = 0;
        self.first_fragment = false;
        self.last_fragment = false;
        self.error = false;
        self.ferror = false;
        self.done = false;
        self.fdone = false;
        self.quit = false;
        self.noreply = false;
        self.swallow = false;
        self.is_read = false;
        self.tmo_key = None;
        self.stime = now;
    }

    #[must_use]
    pub const fn id(&self) -> MsgId {
        self.id
    }

    /// Connection that produced or consumes this message.
    #[must_use]
    pub const fn owner(&self) -> ConnId {
        self.owner
    }

    /// Protocol adapter bound at acquisition.
    #[must_use]
    pub const fn proto(&self) -> &'static dyn Protocol {
        self.proto
    }

    /// Total message length: the sum of segment lengths in the chain.
    #[must_use]
    pub fn mlen(&self) -> usize {
        self.chain.len()
    }

    /// Copies the decoded key span out of the chain.
    #[must_use]
    pub fn key(&self) -> Bytes {
        let len = self.key_end.saturating_sub(self.key_start);
        self.chain.cursor(self.key_start).take(len).collect()
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("request", &self.request)
            .field("family", &self.family)
            .field("dyn_mode", &self.dyn_mode)
            .field("kind", &self.kind)
            .field("mlen", &self.mlen())
            .field("pos", &self.pos)
            .field("frag_id", &self.frag_id)
            .field("nfrag", &self.nfrag)
            .finish_non_exhaustive()
    }
}
