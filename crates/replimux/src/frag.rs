//! Fragmentation engine: splits a multi-key request into sibling messages
//! sharing one fragment group.

use std::time::Instant;

use tracing::trace;

use crate::{conn::Connection, engine::Engine, msg::MsgToken, proto::FragError};

/// Splits `tok` at the parser's boundary into itself plus a sibling.
///
/// The sibling's chain starts with the protocol preamble emitted by
/// `pre_splitcopy`, followed by the bytes at and after the boundary; the
/// original is patched by `post_splitcopy` into a stand-alone command. Both
/// end up in one fragment group: the group owner (the first message to
/// fragment) keeps `first_fragment` and the sibling count, the newest
/// sibling carries `last_fragment`, and every member shares the group id
/// and a weak back-reference to the owner. The owner must outlive its
/// siblings; release order is the response path's responsibility.
///
/// On return the connection's `recv_done` has been signalled with the
/// sibling as the continuation message, which may itself fragment further.
pub(crate) fn fragment<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    now: Instant,
) -> Result<(), FragError> {
    // build the sibling preamble, then split at the parser boundary
    let mut prefix = Vec::new();
    let pos = {
        let msg = engine.msgs.get(tok).ok_or(FragError::Stale)?;
        msg.proto().pre_splitcopy(msg, &mut prefix)?;
        msg.pos
    };
    let mut tail = {
        let Engine { msgs, mbufs, .. } = engine;
        let msg = msgs.get_mut(tok).ok_or(FragError::Stale)?;
        msg.chain.split_off(pos, &prefix, mbufs)
    };

    // patch the original into a stand-alone command
    {
        let Engine { msgs, mbufs, .. } = engine;
        let Some(msg) = msgs.get_mut(tok) else {
            tail.drain(mbufs);
            return Err(FragError::Stale);
        };
        let proto = msg.proto();
        if let Err(err) = proto.post_splitcopy(msg, mbufs) {
            tail.drain(mbufs);
            return Err(err);
        }
    }

    // the sibling takes the split chain
    let sib = match engine.acquire_like(tok, now) {
        Ok(sib) => sib,
        Err(err) => {
            tail.drain(&mut engine.mbufs);
            return Err(FragError::Pool(err));
        }
    };
    if let Some(sib_msg) = engine.msgs.get_mut(sib) {
        sib_msg.chain = tail;
    }

    // group assignment
    let (frag_id, owner) = {
        let msg = engine.msgs.get(tok).ok_or(FragError::Stale)?;
        (msg.frag_id, msg.frag_owner)
    };
    let (frag_id, owner) = if frag_id == 0 {
        let id = engine.alloc_frag_id();
        let msg = engine.msgs.get_mut(tok).ok_or(FragError::Stale)?;
        msg.frag_id = id;
        msg.first_fragment = true;
        msg.nfrag = 1;
        msg.frag_owner = Some(tok);
        (id, tok)
    } else {
        (frag_id, owner.ok_or(FragError::Stale)?)
    };

    if let Some(msg) = engine.msgs.get_mut(tok) {
        msg.last_fragment = false;
    }
    if let Some(sib_msg) = engine.msgs.get_mut(sib) {
        sib_msg.frag_id = frag_id;
        sib_msg.frag_owner = Some(owner);
        sib_msg.last_fragment = true;
    }
    if let Some(owner_msg) = engine.msgs.get_mut(owner) {
        owner_msg.nfrag += 1;
    }
    engine.stats.frags_created += 1;
    trace!(?tok, ?sib, frag_id, "split off fragment sibling");

    conn.recv_done(engine, tok, Some(sib));
    Ok(())
}
