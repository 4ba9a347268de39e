//! Send driver: see [`msg_send`].

use std::{io, io::IoSlice};

use tracing::trace;

use crate::{
    conn::Connection,
    engine::Engine,
    msg::{Msg, MsgToken},
};

/// Most spans one scatter-gather write may carry.
///
/// POSIX guarantees `IOV_MAX >= 16` and mainstream platforms ship 1024;
/// 128 is the point past which another span stops paying for itself, so
/// the effective cap is `min(IOV_MAX, 128)`.
pub const IOV_CAP: usize = 128;

/// Byte ceiling of one gather, keeping the write below the platform's
/// maximum signed byte count.
const MAX_SENDV_BYTES: usize = isize::MAX as usize;

/// Error raised by the send path.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Fatal transport error; the sticky connection error has been set.
    #[error("transport send failed")]
    Io(#[source] io::Error),
    /// A message token stopped resolving mid-drive.
    #[error("stale message token")]
    StaleMsg,
}

/// Drains `conn`'s outbound queue with bounded scatter-gather writes.
///
/// Each round gathers unread spans from as many queued messages as fit
/// under [`IOV_CAP`] and the byte ceiling, issues one `sendv`, and fans the
/// written count back out in FIFO order: fully drained messages get
/// `send_done`, a partially written message becomes the send cursor for the
/// next round. Message bytes are never reordered, and a message's spans
/// always form a contiguous prefix of the iovec.
///
/// `WouldBlock` counts as a zero-byte write and clears `send_ready`.
pub fn msg_send<C: Connection>(engine: &mut Engine, conn: &mut C) -> Result<(), SendError> {
    while conn.send_ready() {
        let Some(first) = conn.send_next(engine) else {
            conn.set_smsg(None);
            return Ok(());
        };
        send_chain(engine, conn, first)?;
    }
    Ok(())
}

/// Counts `msg`'s contribution to the gather, returning `true` once a
/// budget is exhausted.
fn tally(msg: &Msg, niov: &mut usize, nbytes: &mut usize) -> bool {
    for seg in msg.chain.iter() {
        let len = seg.unread().len();
        if len == 0 {
            continue;
        }
        if *niov == IOV_CAP || *nbytes == MAX_SENDV_BYTES {
            return true;
        }
        let take = len.min(MAX_SENDV_BYTES - *nbytes);
        *niov += 1;
        *nbytes += take;
        if take < len {
            return true;
        }
    }
    false
}

fn send_chain<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    first: MsgToken,
) -> Result<(), SendError> {
    // collect the batch under the iovec and byte budgets
    let mut batch = vec![first];
    let mut niov = 0;
    let mut nbytes = 0;
    let mut limited = {
        let msg = engine.msgs.get(first).ok_or(SendError::StaleMsg)?;
        tally(msg, &mut niov, &mut nbytes)
    };
    while !limited {
        let Some(tok) = conn.send_next(engine) else {
            break;
        };
        batch.push(tok);
        let msg = engine.msgs.get(tok).ok_or(SendError::StaleMsg)?;
        limited = tally(msg, &mut niov, &mut nbytes);
    }

    // rebuild the spans and write them in one syscall
    let sent = {
        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(niov);
        let mut left = MAX_SENDV_BYTES;
        'gather: for &tok in &batch {
            let Some(msg) = engine.msgs.get(tok) else {
                continue;
            };
            for seg in msg.chain.iter() {
                let span = seg.unread();
                if span.is_empty() {
                    continue;
                }
                if iovs.len() == IOV_CAP || left == 0 {
                    break 'gather;
                }
                let take = span.len().min(left);
                iovs.push(IoSlice::new(&span[..take]));
                left -= take;
            }
        }
        if iovs.is_empty() {
            0
        } else {
            match conn.sendv(&iovs) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    conn.set_send_ready(false);
                    0
                }
                Err(err) => {
                    conn.set_err(io::Error::from(err.kind()));
                    return Err(SendError::Io(err));
                }
            }
        }
    };
    engine.stats.bytes_out += sent as u64;
    trace!(n = sent, batch = batch.len(), "flushed outbound bytes");

    fan_out(engine, conn, &batch, sent)
}

/// Walks the batch in FIFO order crediting `sent` bytes against each
/// segment, completing drained messages and parking the first partial one
/// as the send cursor.
fn fan_out<C: Connection>(
    engine: &mut Engine,
    conn: &mut C,
    batch: &[MsgToken],
    mut left: usize,
) -> Result<(), SendError> {
    let mut cursor = None;
    for &tok in batch {
        let drained = {
            let msg = engine.msgs.get_mut(tok).ok_or(SendError::StaleMsg)?;
            for seg in msg.chain.iter_mut() {
                if left == 0 {
                    break;
                }
                let len = seg.unread().len();
                if len == 0 {
                    continue;
                }
                let take = len.min(left);
                seg.consume(take);
                left -= take;
                if take < len {
                    break;
                }
            }
            msg.chain.all_consumed()
        };
        if drained {
            conn.send_done(engine, tok);
        } else {
            cursor = Some(tok);
            break;
        }
    }
    conn.set_smsg(cursor);
    Ok(())
}
