//! See [`TimeoutIndex`].

use std::{collections::BTreeMap, time::Instant};

use crate::{
    conn::ConnId,
    msg::{MsgId, MsgToken},
    pool::MsgPool,
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    conn: ConnId,
    slot: u32,
}

/// Ordered index of outstanding requests keyed by absolute deadline.
///
/// The event loop peeks [`TimeoutIndex::min`] each tick to size its poll
/// timeout and to find requests whose deadline has passed; enforcement
/// (failing the request) stays with the loop. Keys are `(deadline, msg id)`
/// so equal deadlines cannot collide; the id component imposes no
/// meaningful order beyond uniqueness.
///
/// Each message caches its own key, making [`TimeoutIndex::delete`] an
/// O(log n) exact removal and idempotent by construction.
#[derive(Debug, Default)]
pub struct TimeoutIndex {
    map: BTreeMap<(Instant, MsgId), Entry>,
}

impl TimeoutIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Tracks `tok` until `deadline`, carrying `conn` for the event loop.
    ///
    /// Non-requests and messages marked `quit` or `noreply` are rejected,
    /// as is a message that is already tracked. Returns whether the entry
    /// was inserted.
    pub fn insert(
        &mut self,
        msgs: &mut MsgPool,
        tok: MsgToken,
        conn: ConnId,
        deadline: Instant,
    ) -> bool {
        let Some(msg) = msgs.get_mut(tok) else {
            return false;
        };
        if !msg.request || msg.quit || msg.noreply || msg.tmo_key.is_some() {
            return false;
        }
        let key = (deadline, msg.id());
        msg.tmo_key = Some(key);
        self.map.insert(
            key,
            Entry {
                conn,
                slot: tok.slot,
            },
        );
        true
    }

    /// Removes `tok`'s entry if it has one. Idempotent; stale tokens and
    /// untracked messages are treated as absent.
    pub fn delete(&mut self, msgs: &mut MsgPool, tok: MsgToken) -> bool {
        let Some(msg) = msgs.get_mut(tok) else {
            return false;
        };
        match msg.tmo_key.take() {
            Some(key) => self.map.remove(&key).is_some(),
            None => false,
        }
    }

    /// The outstanding request with the earliest deadline, if any.
    #[must_use]
    pub fn min(&self) -> Option<(Instant, MsgToken, ConnId)> {
        self.map.iter().next().map(|(&(deadline, id), entry)| {
            (
                deadline,
                MsgToken {
                    slot: entry.slot,
                    id,
                },
                entry.conn,
            )
        })
    }
}
