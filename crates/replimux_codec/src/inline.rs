//! Length-prefixed inline protocol family: see [`InlineProto`].

use replimux::{
    chain::ChainCursor,
    mbuf::MbufPool,
    msg::{Msg, MsgKind},
    proto::{FragError, ParseError, ParseStatus, Protocol},
};

use crate::scan::{self, Span, Stall};

/// `*n` arrays of `$len` bulk strings.
///
/// Requests declare their argument count up front, which makes multi-key
/// commands fragment cleanly: the boundary sits after the first key bulk,
/// the sibling preamble re-declares the remaining count plus the verb, and
/// the original's array header is rewritten to the count it retains. Both
/// sides of the split re-parse as ordinary stand-alone commands.
pub struct InlineProto;

/// The installable adapter instance.
pub static INLINE: InlineProto = InlineProto;

impl Protocol for InlineProto {
    fn parse(&self, msg: &mut Msg) -> Result<ParseStatus, ParseError> {
        let scanned = if msg.request {
            parse_request(msg)
        } else {
            parse_response(msg)
        };
        scanned.or_else(Stall::into_status)
    }

    fn pre_splitcopy(&self, msg: &Msg, prefix: &mut Vec<u8>) -> Result<(), FragError> {
        if !matches!(msg.kind, MsgKind::MultiGet | MsgKind::MultiDelete) {
            return Err(FragError::BadBoundary);
        }
        let verb = read_verb(msg).ok_or(FragError::BadBoundary)?;
        let narg = msg.rnarg + 1;
        prefix.extend_from_slice(format!("*{narg}\r\n${}\r\n", verb.len()).as_bytes());
        prefix.extend_from_slice(&verb);
        prefix.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn post_splitcopy(&self, msg: &mut Msg, mbufs: &mut MbufPool) -> Result<(), FragError> {
        // the original keeps the verb plus the keys before the boundary;
        // its array header must declare exactly that many
        if msg.rnarg >= msg.narg {
            return Err(FragError::BadBoundary);
        }
        let kept = msg.narg - msg.rnarg;
        let Ok((_, old_header)) = scan::read_line(&msg.chain, 0) else {
            return Err(FragError::BadBoundary);
        };
        msg.chain
            .replace_front(old_header, format!("*{kept}\r\n").as_bytes(), mbufs);
        msg.narg = kept;
        msg.rnarg = 0;
        msg.pos = msg.chain.len();
        Ok(())
    }

    fn pre_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        // drop the per-fragment array header; element runs concatenate
        if msg.kind != MsgKind::Array {
            return;
        }
        if let Ok((_, end)) = scan::read_line(&msg.chain, 0) {
            msg.chain.replace_front(end, b"", mbufs);
            msg.pos = msg.chain.len();
        }
    }

    fn post_coalesce(&self, msg: &mut Msg, mbufs: &mut MbufPool) {
        // re-head the assembled reply with the collective element count
        let header = format!("*{}\r\n", msg.integer);
        msg.chain.replace_front(0, header.as_bytes(), mbufs);
        msg.pos = msg.chain.len();
    }

    fn error_prefix(&self) -> &'static str {
        "-ERR"
    }
}

/// Copies the verb bulk out of a parsed request chain.
fn read_verb(msg: &Msg) -> Option<Vec<u8>> {
    let mut cur = msg.chain.cursor(0);
    if cur.next() != Some(b'*') {
        return None;
    }
    scan::read_decimal(&mut cur).ok()?;
    let span = read_bulk(&mut cur).ok()?;
    Some(msg.chain.cursor(span.start).take(span.len()).collect())
}

/// Reads one `$len\r\n<bytes>\r\n` bulk, returning the payload span.
fn read_bulk(cur: &mut ChainCursor<'_>) -> Result<Span, Stall> {
    if scan::need(cur.next())? != b'$' {
        return Err(scan::bad("expected bulk header", cur.abs()));
    }
    let len = scan::read_decimal(cur)?;
    let len = usize::try_from(len).map_err(|_| scan::bad("negative bulk length", cur.abs()))?;
    let start = cur.abs();
    if ChainCursor::skip(cur, len) < len {
        return Err(Stall::Incomplete);
    }
    let end = cur.abs();
    expect_crlf(cur)?;
    Ok(Span { start, end })
}

fn expect_crlf(cur: &mut ChainCursor<'_>) -> Result<(), Stall> {
    if scan::need(cur.next())? != b'\r' || scan::need(cur.next())? != b'\n' {
        return Err(scan::bad("bulk not CRLF-terminated", cur.abs()));
    }
    Ok(())
}

fn skip_line(cur: &mut ChainCursor<'_>) -> Result<(), Stall> {
    let mut prev = 0;
    loop {
        let byte = scan::need(cur.next())?;
        if byte == b'\n' {
            if prev == b'\r' {
                return Ok(());
            }
            return Err(scan::bad("line feed without carriage return", cur.abs()));
        }
        prev = byte;
    }
}

fn parse_request(msg: &mut Msg) -> Result<ParseStatus, Stall> {
    let mut cur = msg.chain.cursor(0);
    if scan::need(cur.next())? != b'*' {
        return Err(scan::bad("expected array header", 0));
    }
    let narg = scan::read_decimal(&mut cur)?;
    if narg <= 0 {
        return Err(scan::bad("bad argument count", cur.abs()));
    }
    let narg = u32::try_from(narg).map_err(|_| scan::bad("argument count overflows", cur.abs()))?;
    msg.narg = narg;
    let args = narg - 1;

    let verb_span = read_bulk(&mut cur)?;
    let verb: Vec<u8> = msg
        .chain
        .cursor(verb_span.start)
        .take(verb_span.len())
        .collect();

    if verb.eq_ignore_ascii_case(b"get") {
        expect_arity(args == 1, &cur)?;
        msg.kind = MsgKind::Get;
        msg.is_read = true;
        let key = read_bulk(&mut cur)?;
        msg.key_start = key.start;
        msg.key_end = key.end;
        msg.pos = cur.abs();
        Ok(ParseStatus::Complete)
    } else if verb.eq_ignore_ascii_case(b"mget") {
        expect_arity(args >= 1, &cur)?;
        msg.kind = MsgKind::MultiGet;
        msg.is_read = true;
        let (key, rnarg, pos, status) = multi_key(&mut cur, args)?;
        msg.key_start = key.start;
        msg.key_end = key.end;
        if let Some(rnarg) = rnarg {
            msg.rnarg = rnarg;
        }
        msg.pos = pos;
        Ok(status)
    } else if verb.eq_ignore_ascii_case(b"del") {
        expect_arity(args >= 1, &cur)?;
        msg.kind = MsgKind::MultiDelete;
        let (key, rnarg, pos, status) = multi_key(&mut cur, args)?;
        msg.key_start = key.start;
        msg.key_end = key.end;
        if let Some(rnarg) = rnarg {
            msg.rnarg = rnarg;
        }
        msg.pos = pos;
        Ok(status)
    } else if verb.eq_ignore_ascii_case(b"set") {
        expect_arity(args == 2, &cur)?;
        msg.kind = MsgKind::Store;
        let key = read_bulk(&mut cur)?;
        msg.key_start = key.start;
        msg.key_end = key.end;
        let value = read_bulk(&mut cur)?;
        msg.vlen = value.len();
        msg.pos = cur.abs();
        Ok(ParseStatus::Complete)
    } else if verb.eq_ignore_ascii_case(b"incr") || verb.eq_ignore_ascii_case(b"decr") {
        expect_arity(args == 1, &cur)?;
        msg.kind = MsgKind::Arith;
        let key = read_bulk(&mut cur)?;
        msg.key_start = key.start;
        msg.key_end = key.end;
        msg.pos = cur.abs();
        Ok(ParseStatus::Complete)
    } else if verb.eq_ignore_ascii_case(b"quit") {
        expect_arity(args == 0, &cur)?;
        msg.kind = MsgKind::Quit;
        msg.quit = true;
        msg.pos = cur.abs();
        Ok(ParseStatus::Complete)
    } else {
        Err(scan::bad("unknown command", verb_span.end))
    }
}

fn expect_arity(ok: bool, cur: &ChainCursor<'_>) -> Result<(), Stall> {
    if ok {
        Ok(())
    } else {
        Err(scan::bad("wrong number of arguments", cur.abs()))
    }
}

/// Reads the first key of a multi-key command and decides whether the
/// remaining keys force a split.
fn multi_key(cur: &mut ChainCursor<'_>, args: u32) -> Result<(Span, Option<u32>, usize, ParseStatus), Stall> {
    let key = read_bulk(cur)?;
    if args == 1 {
        Ok((key, None, cur.abs(), ParseStatus::Complete))
    } else {
        Ok((key, Some(args - 1), cur.abs(), ParseStatus::Fragment))
    }
}

fn parse_response(msg: &mut Msg) -> Result<ParseStatus, Stall> {
    let mut cur = msg.chain.cursor(0);
    match scan::need(cur.next())? {
        b'+' => {
            skip_line(&mut cur)?;
            msg.kind = MsgKind::Status;
        }
        b'-' => {
            skip_line(&mut cur)?;
            msg.kind = MsgKind::Error;
        }
        b':' => {
            let value = scan::read_decimal(&mut cur)?;
            msg.kind = MsgKind::Integer;
            msg.integer = value.unsigned_abs();
        }
        b'$' => {
            bulk_body(&mut cur)?;
            msg.kind = MsgKind::Bulk;
        }
        b'*' => {
            let count = scan::read_decimal(&mut cur)?;
            if count >= 0 {
                for _ in 0..count {
                    match scan::need(cur.next())? {
                        b'$' => bulk_body(&mut cur)?,
                        b':' => {
                            scan::read_decimal(&mut cur)?;
                        }
                        _ => return Err(scan::bad("unsupported array element", cur.abs())),
                    }
                }
            }
            msg.kind = MsgKind::Array;
            msg.integer = if count < 0 { 0 } else { count.unsigned_abs() };
        }
        _ => return Err(scan::bad("unknown response type", 0)),
    }
    msg.pos = cur.abs();
    Ok(ParseStatus::Complete)
}

/// Consumes a bulk body after its `$` marker; `-1` is the null bulk.
fn bulk_body(cur: &mut ChainCursor<'_>) -> Result<(), Stall> {
    let len = scan::read_decimal(cur)?;
    if len < 0 {
        return Ok(());
    }
    let len = usize::try_from(len).map_err(|_| scan::bad("bulk length overflows", cur.abs()))?;
    if ChainCursor::skip(cur, len) < len {
        return Err(Stall::Incomplete);
    }
    expect_crlf(cur)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use assert_matches::assert_matches;
    use replimux::{
        conn::ConnId,
        mbuf::MbufPool,
        msg::{Family, MsgToken},
        pool::MsgPool,
    };

    use super::*;

    const MGET3: &[u8] = b"*4\r\n$4\r\nmget\r\n$3\r\nk1\r\n$3\r\nk2\r\n$3\r\nk3\r\n";

    fn msg_with(bytes: &[u8], request: bool) -> (MsgPool, MbufPool, MsgToken) {
        let mut msgs = MsgPool::new(8, 8);
        let mut mbufs = MbufPool::new(64, 0);
        let tok = msgs
            .acquire(
                ConnId(1),
                request,
                Family::Inline,
                false,
                &INLINE,
                false,
                Instant::now(),
            )
            .unwrap();
        msgs.get_mut(tok)
            .unwrap()
            .chain
            .extend_from_slice(bytes, &mut mbufs);
        (msgs, mbufs, tok)
    }

    #[test]
    fn single_get() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Get);
        assert!(msg.is_read);
        assert_eq!(msg.key().as_ref(), b"foo");
        assert_eq!(msg.pos, msg.mlen());
    }

    #[test]
    fn uppercase_verbs_are_accepted() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Get);
    }

    #[test]
    fn partial_frame_is_again() {
        let (mut msgs, mut mbufs, tok) = msg_with(b"*2\r\n$3\r\nget\r\n$3\r\nfo", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Again));
        msg.chain.extend_from_slice(b"o\r\n", &mut mbufs);
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
    }

    #[test]
    fn multi_get_fragments_after_first_key() {
        let (mut msgs, _mbufs, tok) = msg_with(MGET3, true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Fragment));
        assert_eq!(msg.kind, MsgKind::MultiGet);
        assert_eq!(msg.key().as_ref(), b"k1");
        assert_eq!(msg.narg, 4);
        assert_eq!(msg.rnarg, 2);
        // boundary sits at the start of the k2 bulk
        assert_eq!(msg.pos, 22);
    }

    #[test]
    fn splitcopy_round_trips() {
        let (mut msgs, mut mbufs, tok) = msg_with(MGET3, true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Fragment));

        let mut prefix = Vec::new();
        INLINE.pre_splitcopy(msg, &mut prefix).unwrap();
        assert_eq!(prefix, b"*3\r\n$4\r\nmget\r\n");

        let pos = msg.pos;
        let tail = msg.chain.split_off(pos, &prefix, &mut mbufs);
        INLINE.post_splitcopy(msg, &mut mbufs).unwrap();

        assert_eq!(
            msg.chain.copy_to_bytes().as_ref(),
            b"*2\r\n$4\r\nmget\r\n$3\r\nk1\r\n"
        );
        assert_eq!(
            tail.copy_to_bytes().as_ref(),
            b"*3\r\n$4\r\nmget\r\n$3\r\nk2\r\n$3\r\nk3\r\n"
        );
    }

    #[test]
    fn multi_delete_fragments_too() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*3\r\n$3\r\ndel\r\n$1\r\na\r\n$1\r\nb\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Fragment));
        assert_eq!(msg.kind, MsgKind::MultiDelete);
        assert!(!msg.is_read);
    }

    #[test]
    fn set_records_value_length() {
        let (mut msgs, _mbufs, tok) =
            msg_with(b"*3\r\n$3\r\nset\r\n$3\r\nkey\r\n$5\r\nhello\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Store);
        assert_eq!(msg.vlen, 5);
        assert_eq!(msg.key().as_ref(), b"key");
    }

    #[test]
    fn quit_takes_no_arguments() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*1\r\n$4\r\nquit\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert!(msg.quit);

        let (mut msgs, _mbufs, tok) = msg_with(b"*2\r\n$4\r\nquit\r\n$1\r\nx\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Err(ParseError { .. }));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*1\r\n$3\r\nget\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Err(ParseError { .. }));
    }

    #[test]
    fn unknown_verb_is_an_error() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*1\r\n$4\r\nping\r\n", true);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Err(ParseError { .. }));
    }

    #[test]
    fn status_error_and_integer_responses() {
        let (mut msgs, _mbufs, tok) = msg_with(b"+OK\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Status);

        let (mut msgs, _mbufs, tok) = msg_with(b"-ERR oops\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Error);

        let (mut msgs, _mbufs, tok) = msg_with(b":42\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Integer);
        assert_eq!(msg.integer, 42);
    }

    #[test]
    fn bulk_responses_including_null() {
        let (mut msgs, _mbufs, tok) = msg_with(b"$3\r\nbar\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Bulk);

        let (mut msgs, _mbufs, tok) = msg_with(b"$-1\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Bulk);
    }

    #[test]
    fn array_response_counts_elements() {
        let (mut msgs, _mbufs, tok) = msg_with(b"*2\r\n$1\r\na\r\n$1\r\nb\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));
        assert_eq!(msg.kind, MsgKind::Array);
        assert_eq!(msg.integer, 2);
        assert_eq!(msg.pos, msg.mlen());
    }

    #[test]
    fn coalesce_hooks_rewrite_array_headers() {
        let (mut msgs, mut mbufs, tok) = msg_with(b"*1\r\n$3\r\nval\r\n", false);
        let msg = msgs.get_mut(tok).unwrap();
        assert_matches!(INLINE.parse(msg), Ok(ParseStatus::Complete));

        INLINE.pre_coalesce(msg, &mut mbufs);
        assert_eq!(msg.chain.copy_to_bytes().as_ref(), b"$3\r\nval\r\n");

        msg.integer = 3;
        INLINE.post_coalesce(msg, &mut mbufs);
        assert_eq!(msg.chain.copy_to_bytes().as_ref(), b"*3\r\n$3\r\nval\r\n");
    }
}
