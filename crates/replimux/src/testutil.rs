//! Scripted protocol and connection stubs for driver tests.

use std::{
    collections::VecDeque,
    io,
    io::IoSlice,
    time::{Duration, Instant},
};

use crate::{
    conn::{Cipher, CipherError, ConnId, Connection, Role},
    engine::Engine,
    msg::{Family, Msg, MsgToken},
    proto::{FragError, ParseError, ParseStatus, Protocol},
};

/// `msg.state` values understood by [`SCRIPTED`].
pub(crate) mod script {
    pub const AGAIN: u16 = 0;
    pub const COMPLETE_ALL: u16 = 1;
    /// Complete with the cursor at `msg.vlen`.
    pub const COMPLETE_AT: u16 = 2;
    /// Repair with the cursor at `msg.vlen`.
    pub const REPAIR_AT: u16 = 3;
    pub const FAIL: u16 = 4;
    /// Fragment with the cursor at `msg.vlen`.
    pub const FRAG_AT: u16 = 5;
    /// Like `FRAG_AT`, but `post_splitcopy` fails.
    pub const FRAG_FAIL_POST: u16 = 6;
}

/// Protocol whose behavior is scripted through `msg.state`.
pub(crate) struct ScriptedProto;

pub(crate) static SCRIPTED: ScriptedProto = ScriptedProto;

impl Protocol for ScriptedProto {
    fn parse(&self, msg: &mut Msg) -> Result<ParseStatus, ParseError> {
        // scripted "frames" are msg.vlen bytes long; short chains wait
        if matches!(
            msg.state,
            script::COMPLETE_AT | script::REPAIR_AT | script::FRAG_AT | script::FRAG_FAIL_POST
        ) && msg.mlen() < msg.vlen
        {
            return Ok(ParseStatus::Again);
        }
        match msg.state {
            script::COMPLETE_ALL => {
                msg.pos = msg.mlen();
                Ok(ParseStatus::Complete)
            }
            script::COMPLETE_AT => {
                msg.pos = msg.vlen;
                Ok(ParseStatus::Complete)
            }
            script::REPAIR_AT => {
                msg.pos = msg.vlen;
                Ok(ParseStatus::Repair)
            }
            script::FRAG_AT | script::FRAG_FAIL_POST => {
                msg.pos = msg.vlen;
                Ok(ParseStatus::Fragment)
            }
            script::FAIL => Err(ParseError {
                reason: "scripted failure",
                at: msg.pos,
            }),
            _ => Ok(ParseStatus::Again),
        }
    }

    fn pre_splitcopy(&self, _msg: &Msg, prefix: &mut Vec<u8>) -> Result<(), FragError> {
        prefix.extend_from_slice(b"PRE ");
        Ok(())
    }

    fn post_splitcopy(
        &self,
        msg: &mut Msg,
        mbufs: &mut crate::mbuf::MbufPool,
    ) -> Result<(), FragError> {
        if msg.state == script::FRAG_FAIL_POST {
            return Err(FragError::BadBoundary);
        }
        msg.chain.extend_from_slice(b"\r\n", mbufs);
        msg.pos = msg.chain.len();
        Ok(())
    }

    fn error_prefix(&self) -> &'static str {
        "-ERR"
    }
}

/// XOR "cipher" standing in for a block cipher in receive-path tests.
pub(crate) struct XorCipher(pub u8);

impl Cipher for XorCipher {
    fn decrypt(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CipherError> {
        if dst.len() < src.len() {
            return Err(CipherError);
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s ^ self.0;
        }
        Ok(src.len())
    }
}

/// Scriptable [`Connection`] recording every engine callback.
pub(crate) struct StubConn {
    pub id: ConnId,
    pub family: Family,
    pub dyn_mode: bool,
    pub role: Role,
    pub recv_ready: bool,
    pub send_ready: bool,
    pub err: Option<io::Error>,
    pub timeout: Option<Duration>,
    pub cipher: Option<XorCipher>,

    /// Byte chunks (or errors) handed out by successive `recv` calls; an
    /// oversized chunk is split against the offered window and re-queued.
    pub recv_script: VecDeque<io::Result<Vec<u8>>>,
    /// Byte counts (or errors) returned by successive `sendv` calls;
    /// exhausted script means "write everything".
    pub send_script: VecDeque<io::Result<usize>>,
    /// Bytes accepted by `sendv`, in order.
    pub sent: Vec<u8>,
    /// Iovec count of each `sendv` call.
    pub sendv_calls: Vec<usize>,

    /// Parser scratch installed on messages this connection acquires,
    /// letting tests script the next frame's outcome.
    pub new_msg_state: u16,
    pub new_msg_vlen: usize,

    pub rmsg: Option<MsgToken>,
    /// Outbound queue; messages stay queued until `send_done`.
    pub outq: VecDeque<MsgToken>,
    /// Index into `outq` of the next message `send_next` hands out.
    next: usize,
    pub smsg: Option<MsgToken>,
    pub done_recv: Vec<(MsgToken, Option<MsgToken>)>,
    pub done_send: Vec<MsgToken>,
}

impl StubConn {
    pub(crate) fn new(dyn_mode: bool) -> Self {
        Self {
            id: ConnId(1),
            family: Family::Ascii,
            dyn_mode,
            role: Role::Client,
            recv_ready: true,
            send_ready: true,
            err: None,
            timeout: None,
            cipher: None,
            recv_script: VecDeque::new(),
            send_script: VecDeque::new(),
            sent: Vec::new(),
            sendv_calls: Vec::new(),
            new_msg_state: script::AGAIN,
            new_msg_vlen: 0,
            rmsg: None,
            outq: VecDeque::new(),
            next: 0,
            smsg: None,
            done_recv: Vec::new(),
            done_send: Vec::new(),
        }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.recv_script.push_back(Ok(bytes.to_vec()));
    }

    pub(crate) fn enqueue(&mut self, tok: MsgToken) {
        self.outq.push_back(tok);
    }

    fn apply_script(&self, engine: &mut Engine, tok: MsgToken) {
        if let Some(msg) = engine.msgs.get_mut(tok) {
            msg.state = self.new_msg_state;
            msg.vlen = self.new_msg_vlen;
        }
    }
}

impl Connection for StubConn {
    fn id(&self) -> ConnId {
        self.id
    }

    fn family(&self) -> Family {
        self.family
    }

    fn dyn_mode(&self) -> bool {
        self.dyn_mode
    }

    fn role(&self) -> Role {
        self.role
    }

    fn proto(&self) -> &'static dyn Protocol {
        &SCRIPTED
    }

    fn recv_ready(&self) -> bool {
        self.recv_ready
    }

    fn set_recv_ready(&mut self, ready: bool) {
        self.recv_ready = ready;
    }

    fn send_ready(&self) -> bool {
        self.send_ready
    }

    fn set_send_ready(&mut self, ready: bool) {
        self.send_ready = ready;
    }

    fn set_err(&mut self, err: io::Error) {
        self.err = Some(err);
    }

    fn has_err(&self) -> bool {
        self.err.is_some()
    }

    fn server_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn cipher(&self) -> Option<&dyn Cipher> {
        self.cipher.as_ref().map(|c| c as &dyn Cipher)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv_script.pop_front() {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.recv_script.push_front(Ok(data[n..].to_vec()));
                }
                Ok(n)
            }
            Some(Err(err)) => Err(err),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn sendv(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.sendv_calls.push(bufs.len());
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let n = match self.send_script.pop_front() {
            Some(Ok(n)) => n.min(total),
            Some(Err(err)) => return Err(err),
            None => total,
        };
        let mut left = n;
        for buf in bufs {
            if left == 0 {
                break;
            }
            let take = left.min(buf.len());
            self.sent.extend_from_slice(&buf[..take]);
            left -= take;
        }
        Ok(n)
    }

    fn recv_next(&mut self, engine: &mut Engine, alloc: bool) -> Option<MsgToken> {
        if self.rmsg.is_none() && alloc {
            let request = self.role != Role::Server;
            self.rmsg = engine
                .acquire_for_conn(&*self, request, Instant::now())
                .ok();
            if let Some(tok) = self.rmsg {
                self.apply_script(engine, tok);
            }
        }
        self.rmsg
    }

    fn send_next(&mut self, _engine: &mut Engine) -> Option<MsgToken> {
        let tok = self.outq.get(self.next).copied();
        if tok.is_some() {
            self.next += 1;
        }
        tok
    }

    fn recv_done(&mut self, engine: &mut Engine, msg: MsgToken, next: Option<MsgToken>) {
        self.done_recv.push((msg, next));
        self.rmsg = next;
        if let Some(tok) = next {
            self.apply_script(engine, tok);
        }
    }

    fn send_done(&mut self, _engine: &mut Engine, msg: MsgToken) {
        self.done_send.push(msg);
        if let Some(idx) = self.outq.iter().position(|&t| t == msg) {
            self.outq.remove(idx);
            if self.next > idx {
                self.next -= 1;
            }
        }
    }

    fn smsg(&self) -> Option<MsgToken> {
        self.smsg
    }

    fn set_smsg(&mut self, msg: Option<MsgToken>) {
        self.smsg = msg;
        self.next = msg
            .and_then(|tok| self.outq.iter().position(|&t| t == tok))
            .unwrap_or(0);
    }
}
