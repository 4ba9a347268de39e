//! Receive driver: see [`msg_recv`].

use std::{io, time::Instant};

use tracing::trace;

use crate::{
    conn::{CipherError, Connection},
    engine::Engine,
    msg::MsgToken,
    parse::parse_msg,
    pool::PoolFull,
    proto::{FragError, ParseError},
};

/// Error raised by the receive path.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The peer closed the transport (zero-byte read).
    #[error("connection closed by peer")]
    Closed,
    /// Fatal transport error; the sticky connection error has been set.
    #[error("transport receive failed")]
    Io(#[source] io::Error),
    /// No message shell for a follow-on frame.
    #[error("message pool exhausted")]
    MsgPool(#[source] PoolFull),
    /// Client-plane parse failure; the sticky connection error has been
    /// set. Replication-plane parse failures are swallowed instead.
    #[error("frame failed to parse")]
    Parse(#[source] ParseError),
    /// Multi-key request could not be split.
    #[error("fragmentation failed")]
    Frag(#[source] FragError),
    /// Encrypted payload block could not be decrypted.
    #[error("payload decryption failed")]
    Cipher(#[source] CipherError),
    /// A message token stopped resolving mid-drive.
    #[error("stale message token")]
    StaleMsg,
}

/// Drains `conn`'s readable bytes into messages and parses every frame
/// that arrived.
///
/// One pass reads into the tail segment of the connection's current
/// inbound message, decrypts completed envelope payload blocks, and then
/// runs the parser until it stops making progress. The outer loop repeats
/// while the connection reports `recv_ready`; a `WouldBlock` read clears
/// the flag (edge-triggered readiness contract).
pub fn msg_recv<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    now: Instant,
) -> Result<(), RecvError> {
    while conn.recv_ready() {
        let Some(tok) = conn.recv_next(engine, true) else {
            return Ok(());
        };
        recv_chain(engine, conn, tok, now)?;
    }
    Ok(())
}

fn recv_chain<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    now: Instant,
) -> Result<(), RecvError> {
    // the tail segment must have room for this read
    {
        let Engine { msgs, mbufs, .. } = engine;
        let msg = msgs.get_mut(tok).ok_or(RecvError::StaleMsg)?;
        let encrypted = msg
            .dmsg
            .as_deref()
            .is_some_and(|d| d.is_encrypted() && d.plen > 0);
        let full = msg.chain.last().is_none_or(|seg| {
            if encrypted {
                seg.last() >= seg.capacity_extra()
            } else {
                seg.is_full()
            }
        });
        if full {
            msg.chain.push(mbufs.acquire());
        }
    }

    // size the read: an encrypted envelope payload is clamped to the bytes
    // still expected so one ciphertext block lands in one segment,
    // overhead included
    let n = {
        let msg = engine.msgs.get_mut(tok).ok_or(RecvError::StaleMsg)?;
        let clamp = match msg.dmsg.as_deref() {
            Some(d) if d.is_encrypted() && d.plen > 0 => Some(d.plen),
            _ => None,
        };
        let seg = msg
            .chain
            .last_mut()
            .expect("tail segment ensured above");
        let window = match clamp {
            Some(plen) => {
                let writable = seg.writable_extra();
                let lim = plen.min(writable.len());
                &mut writable[..lim]
            }
            None => seg.writable(),
        };
        if window.is_empty() {
            0
        } else {
            match conn.recv(window) {
                Ok(0) => return Err(RecvError::Closed),
                Ok(n) => {
                    seg.advance_write(n);
                    n
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // success with zero progress; readiness is spent
                    conn.set_recv_ready(false);
                    0
                }
                Err(err) => {
                    conn.set_err(io::Error::from(err.kind()));
                    return Err(RecvError::Io(err));
                }
            }
        }
    };
    engine.stats.bytes_in += n as u64;
    trace!(?tok, n, "received bytes");

    decrypt_tail(engine, conn, tok, n)?;

    // drain every frame that arrived in this read; recv_done points the
    // connection at the successor message each time a frame completes
    let mut cur = tok;
    loop {
        parse_msg(engine, conn, cur, now)?;
        match conn.recv_next(engine, false) {
            None => break,
            Some(next) if next == cur => break,
            Some(next) => cur = next,
        }
    }
    Ok(())
}

/// Replaces a completed ciphertext tail segment with its plaintext.
///
/// A payload block is complete once its segment is filled through the
/// extra region or the read satisfied the bytes still expected. The
/// plaintext lands in a fresh segment flagged `read_flip` so the parser
/// rewinds over it; the old segment goes back to the pool.
///
/// Encrypted payload segments hold only envelope payload bytes (the read
/// clamp guarantees it), so the whole written region is the ciphertext.
fn decrypt_tail<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    tok: MsgToken,
    n: usize,
) -> Result<(), RecvError> {
    let complete = {
        let Some(msg) = engine.msgs.get_mut(tok) else {
            return Err(RecvError::StaleMsg);
        };
        let Some(d) = msg.dmsg.as_deref_mut() else {
            return Ok(());
        };
        if n == 0 || !d.is_encrypted() || d.plen == 0 {
            return Ok(());
        }
        let expected = d.plen;
        d.plen = d.plen.saturating_sub(n);
        match msg.chain.last() {
            Some(seg) => seg.last() >= seg.capacity_extra() || n >= expected,
            None => false,
        }
    };
    if !complete {
        return Ok(());
    }

    let cipher = conn.cipher().ok_or(RecvError::Cipher(CipherError))?;
    let Engine { msgs, mbufs, .. } = engine;
    let msg = msgs.get_mut(tok).ok_or(RecvError::StaleMsg)?;
    let mut nseg = mbufs.acquire();
    let res = {
        let seg = msg.chain.last().ok_or(RecvError::StaleMsg)?;
        cipher.decrypt(seg.written(), nseg.writable_extra())
    };
    match res {
        Ok(plain_len) => {
            nseg.advance_write(plain_len);
            nseg.set_read_flip();
            if let Some(old) = msg.chain.replace_last(nseg) {
                mbufs.release(old);
            }
            // the parser cursor must not sit past the rewritten tail
            let tail_off = msg.chain.last_offset();
            msg.pos = msg.pos.min(tail_off);
            Ok(())
        }
        Err(err) => {
            mbufs.release(nseg);
            Err(RecvError::Cipher(err))
        }
    }
}
