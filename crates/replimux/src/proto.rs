//! Protocol-family dispatch: see [`Protocol`].

use crate::{mbuf::MbufPool, msg::Msg, pool::PoolFull};

/// Outcome of one parser invocation over a message's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A whole frame ends at `msg.pos`. Bytes past the cursor belong to the
    /// next frame.
    Complete,
    /// The request spans multiple keys and must be split at `msg.pos`.
    Fragment,
    /// The parser wants the bytes at and after `msg.pos` re-seated so the
    /// next read lands contiguously with them.
    Repair,
    /// More bytes are needed before a decision can be made.
    Again,
}

/// The bytes on the wire do not form a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at byte {at}")]
pub struct ParseError {
    /// What was malformed.
    pub reason: &'static str,
    /// Chain offset the parser gave up at.
    pub at: usize,
}

/// Error while splitting a multi-key request into fragments.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FragError {
    /// The protocol adapter cannot re-emit a valid command at the parser's
    /// boundary.
    #[error("message is not splittable at the parser boundary")]
    BadBoundary,
    /// No message shell available for the sibling fragment.
    #[error("message pool exhausted while fragmenting")]
    Pool(#[from] PoolFull),
    /// The message disappeared mid-operation.
    #[error("stale message token")]
    Stale,
}

/// One protocol family's behavior, bound to each message at acquisition.
///
/// Implementations are selected per (family, role, plane) by the event
/// layer and installed as `&'static` trait objects, so dispatch costs one
/// vtable call and messages stay `'static`-clean.
pub trait Protocol: Sync {
    /// Advances `msg.pos` over the chain and decodes message state.
    ///
    /// Parsers own the `msg.state` scratch word and the framing fields
    /// (`narg`, `rnarg`, `rlen`, `vlen`, `integer`, key span, `kind`).
    ///
    /// # Errors
    ///
    /// Errors if the bytes cannot form a valid frame for this family.
    fn parse(&self, msg: &mut Msg) -> Result<ParseStatus, ParseError>;

    /// Emits the command preamble that makes the bytes after the split
    /// boundary a valid stand-alone command. Written at the head of the
    /// sibling's chain before the bulk bytes.
    fn pre_splitcopy(&self, msg: &Msg, prefix: &mut Vec<u8>) -> Result<(), FragError> {
        let _ = (msg, prefix);
        Err(FragError::BadBoundary)
    }

    /// Patches the original message after the split so it is itself a valid
    /// stand-alone command (re-terminate the line, correct the argument
    /// count).
    fn post_splitcopy(&self, msg: &mut Msg, mbufs: &mut MbufPool) -> Result<(), FragError> {
        let _ = (msg, mbufs);
        Ok(())
    }

    /// Strips per-fragment framing from one sibling's response so the
    /// responses can be stitched into a single reply.
    fn pre_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        let _ = (msg, mbufs);
    }

    /// Finalizes a coalesced response (emit the single trailer or header
    /// the stripped fragments shared).
    fn post_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        let _ = (msg, mbufs);
    }

    /// Error-line prefix for client-visible failure frames.
    fn error_prefix(&self) -> &'static str;
}

/// Placeholder bound to free-listed shells; any use is a bug.
pub(crate) struct Unbound;

pub(crate) static UNBOUND: Unbound = Unbound;

impl Protocol for Unbound {
    fn parse(&self, msg: &mut Msg) -> Result<ParseStatus, ParseError> {
        Err(ParseError {
            reason: "message has no protocol bound",
            at: msg.pos,
        })
    }

    fn error_prefix(&self) -> &'static str {
        "-ERR"
    }
}
