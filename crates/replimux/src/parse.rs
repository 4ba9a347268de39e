//! Parser driver: advances a message's bound parser and dispatches the
//! outcome.

use std::{io, time::Instant};

use tracing::{debug, trace};

use crate::{
    conn::Connection,
    engine::Engine,
    msg::MsgToken,
    proto::{ParseError, ParseStatus},
    recv::RecvError,
};

/// Runs one parse step on `tok` and acts on the outcome.
///
/// - `Complete` with the cursor at the chain end: the frame is whole,
///   `recv_done(msg, None)`.
/// - `Complete` with trailing bytes: the tail chain is split off onto a
///   fresh message inheriting the connection binding, and parsing continues
///   there (`recv_done(msg, Some(next))`).
/// - `Fragment`: hand off to the fragmentation engine.
/// - `Repair`: re-seat the unparsed tail so the next read lands contiguous
///   with it.
/// - `Again`: not enough bytes; success with no progress.
/// - Parse errors fail the connection on the client plane and are swallowed
///   on the replication plane.
pub(crate) fn parse_msg<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    now: Instant,
) -> Result<(), RecvError> {
    let outcome = {
        let Some(msg) = engine.msgs.get_mut(tok) else {
            return Err(RecvError::StaleMsg);
        };
        if let Some(flip) = msg.chain.take_read_flip() {
            // a decrypted segment replaced wire bytes in place; rewind the
            // cursor to its start
            msg.pos = msg.pos.min(flip);
        }
        let proto = msg.proto();
        let outcome = proto.parse(msg);
        msg.result = outcome.as_ref().ok().copied();
        outcome
    };

    match outcome {
        Ok(ParseStatus::Complete) => msg_parsed(engine, conn, tok, now),
        Ok(ParseStatus::Fragment) => {
            crate::frag::fragment(engine, conn, tok, now).map_err(RecvError::Frag)
        }
        Ok(ParseStatus::Repair) => {
            msg_repair(engine, tok);
            Ok(())
        }
        Ok(ParseStatus::Again) => Ok(()),
        Err(err) => parse_failed(engine, conn, tok, &err),
    }
}

fn msg_parsed<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    now: Instant,
) -> Result<(), RecvError> {
    engine.stats.frames_parsed += 1;
    let (pos, mlen) = {
        let msg = engine.msgs.get(tok).ok_or(RecvError::StaleMsg)?;
        (msg.pos, msg.mlen())
    };
    debug_assert!(pos <= mlen);

    if pos == mlen {
        trace!(?tok, mlen, "frame complete");
        conn.recv_done(engine, tok, None);
        return Ok(());
    }

    // trailing bytes start the next frame
    trace!(?tok, pos, mlen, "frame complete with trailing bytes");
    let next = engine.acquire_like(tok, now).map_err(RecvError::MsgPool)?;
    let tail = {
        let Engine { msgs, mbufs, .. } = engine;
        let Some(msg) = msgs.get_mut(tok) else {
            return Err(RecvError::StaleMsg);
        };
        msg.chain.split_off(pos, &[], mbufs)
    };
    if let Some(nmsg) = engine.msgs.get_mut(next) {
        nmsg.chain = tail;
    }
    conn.recv_done(engine, tok, Some(next));
    Ok(())
}

/// Re-seats the bytes at and after the cursor into a fresh tail segment so
/// the next read appends contiguously to them, letting the parser make
/// progress across a malformed segment boundary without copying the parsed
/// prefix.
fn msg_repair(engine: &mut Engine, tok: MsgToken) {
    let Engine { msgs, mbufs, .. } = engine;
    if let Some(msg) = msgs.get_mut(tok) {
        let pos = msg.pos;
        let tail = msg.chain.split_off(pos, &[], mbufs);
        msg.chain.append(tail);
    }
}

fn parse_failed<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    err: &ParseError,
) -> Result<(), RecvError> {
    let dyn_mode = conn.dyn_mode();
    let frag_owner = {
        let Some(msg) = engine.msgs.get_mut(tok) else {
            return Err(RecvError::StaleMsg);
        };
        msg.error = true;
        if dyn_mode {
            msg.swallow = true;
            msg.done = true;
        }
        msg.frag_owner
    };
    // a failing fragment poisons its whole group
    if let Some(owner) = frag_owner {
        if let Some(owner_msg) = engine.msgs.get_mut(owner) {
            owner_msg.ferror = true;
        }
    }

    if dyn_mode {
        engine.stats.dyn_parse_errors += 1;
        debug!(%err, "swallowing replication-plane parse error");
        conn.recv_done(engine, tok, None);
        Ok(())
    } else {
        engine.stats.parse_errors += 1;
        conn.set_err(io::Error::new(io::ErrorKind::InvalidData, err.clone()));
        Err(RecvError::Parse(err.clone()))
    }
}
