//! Text-line protocol family: see [`AsciiProto`].

use replimux::{
    mbuf::MbufPool,
    msg::{Msg, MsgKind},
    proto::{FragError, ParseError, ParseStatus, Protocol},
};

use crate::scan::{self, Stall};

/// `msg.state` phases.
const PHASE_LINE: u16 = 0;
const PHASE_VALUE: u16 = 1;

/// Space-separated, CRLF-terminated command family.
///
/// Requests are one command line, optionally followed by a value block
/// whose length the line declares. Multi-key retrievals fragment per key:
/// the split boundary sits at the start of the second remaining key, the
/// sibling preamble re-emits the verb, and the truncated original is
/// re-terminated with CRLF.
///
/// Value blocks are consumed incrementally (`msg.rlen` tracks the bytes
/// still owed), so a large body is never rescanned across reads.
pub struct AsciiProto;

/// The installable adapter instance.
pub static ASCII: AsciiProto = AsciiProto;

impl Protocol for AsciiProto {
    fn parse(&self, msg: &mut Msg) -> Result<ParseStatus, ParseError> {
        let scanned = if msg.request {
            parse_request(msg)
        } else {
            parse_response(msg)
        };
        scanned.or_else(Stall::into_status)
    }

    fn pre_splitcopy(&self, msg: &Msg, prefix: &mut Vec<u8>) -> Result<(), FragError> {
        if msg.kind != MsgKind::MultiGet {
            return Err(FragError::BadBoundary);
        }
        // re-emit the verb leading the original line
        let mut cur = msg.chain.cursor(0);
        loop {
            match cur.next() {
                Some(b' ') => break,
                Some(byte) if prefix.len() < 16 => prefix.push(byte),
                _ => return Err(FragError::BadBoundary),
            }
        }
        prefix.push(b' ');
        Ok(())
    }

    fn post_splitcopy(&self, msg: &mut Msg, mbufs: &mut MbufPool) -> Result<(), FragError> {
        // the split cut the line mid-argument list; close it again
        msg.chain.extend_from_slice(b"\r\n", mbufs);
        msg.pos = msg.chain.len();
        msg.rnarg = 0;
        Ok(())
    }

    fn pre_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        // every fragment response carries its own END trailer; strip it so
        // the stitched reply ends with exactly one
        if !matches!(msg.kind, MsgKind::Value | MsgKind::End) {
            return;
        }
        let len = msg.chain.len();
        if len < 5 {
            return;
        }
        let tail: Vec<u8> = msg.chain.cursor(len - 5).collect();
        if tail == b"END\r\n" {
            msg.chain.truncate(len - 5, mbufs);
            msg.pos = msg.chain.len();
        }
    }

    fn post_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        msg.chain.extend_from_slice(b"END\r\n", mbufs);
        msg.pos = msg.chain.len();
    }

    fn error_prefix(&self) -> &'static str {
        "SERVER_ERROR"
    }
}

fn parse_request(msg: &mut Msg) -> Result<ParseStatus, Stall> {
    if msg.state == PHASE_VALUE {
        return consume_value(msg, true);
    }

    let (line, end) = scan::read_line(&msg.chain, 0)?;
    let toks = scan::tokens(&line, 0);
    let Some(&verb) = toks.first() else {
        return Err(scan::bad("empty command line", end));
    };
    let verb_bytes = &line[verb.start..verb.end];

    match verb_bytes {
        b"get" | b"gets" => {
            let keys = &toks[1..];
            if keys.is_empty() {
                return Err(scan::bad("retrieval without a key", end));
            }
            msg.is_read = true;
            msg.key_start = keys[0].start;
            msg.key_end = keys[0].end;
            if keys.len() == 1 {
                msg.kind = MsgKind::Get;
                msg.pos = end;
                Ok(ParseStatus::Complete)
            } else {
                msg.kind = MsgKind::MultiGet;
                msg.narg = arg_count(keys.len())?;
                msg.rnarg = arg_count(keys.len() - 1)?;
                msg.pos = keys[1].start;
                Ok(ParseStatus::Fragment)
            }
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            let want = if verb_bytes == b"cas" { 6 } else { 5 };
            let toks = take_noreply(msg, &line, toks);
            if toks.len() != want {
                return Err(scan::bad("wrong number of storage arguments", end));
            }
            msg.kind = MsgKind::Store;
            msg.key_start = toks[1].start;
            msg.key_end = toks[1].end;
            scan::parse_u64(&line[toks[2].start..toks[2].end], toks[2].start)?;
            scan::parse_u64(&line[toks[3].start..toks[3].end], toks[3].start)?;
            let vlen = scan::parse_u64(&line[toks[4].start..toks[4].end], toks[4].start)?;
            if verb_bytes == b"cas" {
                msg.integer = scan::parse_u64(&line[toks[5].start..toks[5].end], toks[5].start)?;
            }
            msg.vlen = usize::try_from(vlen)
                .map_err(|_| scan::bad("value length overflows", toks[4].start))?;
            msg.state = PHASE_VALUE;
            msg.rlen = msg.vlen + 2;
            msg.pos = end;
            consume_value(msg, true)
        }
        b"delete" => {
            let toks = take_noreply(msg, &line, toks);
            if toks.len() != 2 {
                return Err(scan::bad("wrong number of delete arguments", end));
            }
            msg.kind = MsgKind::Delete;
            msg.key_start = toks[1].start;
            msg.key_end = toks[1].end;
            msg.pos = end;
            Ok(ParseStatus::Complete)
        }
        b"incr" | b"decr" => {
            let toks = take_noreply(msg, &line, toks);
            if toks.len() != 3 {
                return Err(scan::bad("wrong number of arithmetic arguments", end));
            }
            msg.kind = MsgKind::Arith;
            msg.key_start = toks[1].start;
            msg.key_end = toks[1].end;
            msg.integer = scan::parse_u64(&line[toks[2].start..toks[2].end], toks[2].start)?;
            msg.pos = end;
            Ok(ParseStatus::Complete)
        }
        b"quit" => {
            msg.kind = MsgKind::Quit;
            msg.quit = true;
            msg.pos = end;
            Ok(ParseStatus::Complete)
        }
        _ => Err(scan::bad("unknown command", verb.end)),
    }
}

/// Pops a trailing `noreply` token, recording it on the message.
fn take_noreply(msg: &mut Msg, line: &[u8], mut toks: Vec<scan::Span>) -> Vec<scan::Span> {
    if let Some(last) = toks.last() {
        if &line[last.start..last.end] == b"noreply" {
            msg.noreply = true;
            toks.pop();
        }
    }
    toks
}

fn arg_count(n: usize) -> Result<u32, Stall> {
    u32::try_from(n).map_err(|_| scan::bad("argument count overflows", 0))
}

/// Consumes value-block bytes up to `msg.rlen`, verifying the trailing
/// CRLF once the block is whole. `terminal` distinguishes a request value
/// (frame ends with the block) from a response `VALUE` block (more lines
/// follow).
fn consume_value(msg: &mut Msg, terminal: bool) -> Result<ParseStatus, Stall> {
    let avail = msg.mlen() - msg.pos;
    if avail < msg.rlen {
        msg.rlen -= avail;
        msg.pos = msg.mlen();
        return Ok(ParseStatus::Again);
    }
    msg.pos += msg.rlen;
    msg.rlen = 0;
    msg.state = PHASE_LINE;
    let mut cur = msg.chain.cursor(msg.pos - 2);
    if (cur.next(), cur.next()) != (Some(b'\r'), Some(b'\n')) {
        return Err(scan::bad("value block not CRLF-terminated", msg.pos));
    }
    if terminal {
        Ok(ParseStatus::Complete)
    } else {
        Ok(ParseStatus::Again)
    }
}

fn parse_response(msg: &mut Msg) -> Result<ParseStatus, Stall> {
    loop {
        if msg.state == PHASE_VALUE {
            match consume_value(msg, false)? {
                // block consumed; scan the next line
                ParseStatus::Again if msg.state == PHASE_LINE => {}
                other => return Ok(other),
            }
        }

        let first_line = msg.pos == 0;
        let (line, end) = scan::read_line(&msg.chain, msg.pos)?;
        let toks = scan::tokens(&line, msg.pos);
        let head = toks
            .first()
            .map(|s| &line[s.start - msg.pos..s.end - msg.pos])
            .unwrap_or_default();

        if !first_line && !matches!(head, b"VALUE" | b"END") {
            return Err(scan::bad("expected VALUE or END", end));
        }

        match head {
            b"VALUE" => {
                if toks.len() != 4 && toks.len() != 5 {
                    return Err(scan::bad("malformed VALUE line", end));
                }
                if first_line {
                    msg.kind = MsgKind::Value;
                    msg.key_start = toks[1].start;
                    msg.key_end = toks[1].end;
                }
                let vlen =
                    scan::parse_u64(&line[toks[3].start - msg.pos..toks[3].end - msg.pos], end)?;
                msg.vlen = usize::try_from(vlen)
                    .map_err(|_| scan::bad("value length overflows", end))?;
                msg.state = PHASE_VALUE;
                msg.rlen = msg.vlen + 2;
                msg.pos = end;
            }
            b"END" => {
                if first_line {
                    msg.kind = MsgKind::End;
                }
                msg.pos = end;
                return Ok(ParseStatus::Complete);
            }
            b"STORED" | b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" | b"DELETED" | b"TOUCHED" => {
                msg.kind = MsgKind::Status;
                msg.pos = end;
                return Ok(ParseStatus::Complete);
            }
            b"ERROR" | b"CLIENT_ERROR" | b"SERVER_ERROR" => {
                msg.kind = MsgKind::Error;
                msg.pos = end;
                return Ok(ParseStatus::Complete);
            }
            digits if !digits.is_empty() && digits.iter().all(u8::is_ascii_digit) => {
                msg.kind = MsgKind::Integer;
                msg.integer = scan::parse_u64(digits, end)?;
                msg.pos = end;
                return Ok(ParseStatus::Complete);
            }
            _ => return Err(scan::bad("unknown response line", end)),
        }
    }
}
