//! The contract the engine requires of any connection handed to it.

use std::{io, io::IoSlice, time::Duration};

use crate::{
    engine::Engine,
    msg::{Family, MsgToken},
    proto::Protocol,
};

/// Opaque identity of a connection, assigned by the event layer.
///
/// The engine never dereferences it; it only stores it (message ownership,
/// timeout entries) and hands it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// What sits on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// An external client; inbound frames are requests.
    Client,
    /// A listening proxy endpoint.
    Proxy,
    /// A backend storage server; inbound frames are responses.
    Server,
}

/// Decrypts replication-plane payload blocks.
///
/// Implementations live with the event layer (the engine never names a
/// cipher); the contract is that one ciphertext block decrypts into at most
/// its own length of plaintext, and that block overhead fits the segment
/// pool's extra region.
pub trait Cipher {
    /// Decrypts `src` into `dst`, returning the plaintext length.
    ///
    /// # Errors
    ///
    /// Errors if the block is malformed for this cipher.
    fn decrypt(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CipherError>;
}

/// Payload block failed to decrypt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("payload decryption failed")]
pub struct CipherError;

/// One connection as seen by the message engine.
///
/// The engine's drivers are generic over this trait; the event layer owns
/// the sockets, the queues, and the policy callbacks. `recv`/`sendv` follow
/// std I/O conventions: [`io::ErrorKind::WouldBlock`] is the transient
/// "try again later" result and is never fatal.
pub trait Connection {
    fn id(&self) -> ConnId;
    fn family(&self) -> Family;
    /// Whether this connection is on the peer-to-peer replication plane.
    fn dyn_mode(&self) -> bool;
    fn role(&self) -> Role;
    /// Protocol adapter bound to messages received on this connection.
    fn proto(&self) -> &'static dyn Protocol;

    fn recv_ready(&self) -> bool;
    fn set_recv_ready(&mut self, ready: bool);
    fn send_ready(&self) -> bool;
    fn set_send_ready(&mut self, ready: bool);

    /// Sticky transport error; once set the event loop tears the
    /// connection down.
    fn set_err(&mut self, err: io::Error);
    fn has_err(&self) -> bool;

    /// Per-request deadline for requests forwarded on this connection.
    /// `None` (or zero) disables timeout tracking.
    fn server_timeout(&self) -> Option<Duration>;

    /// Cipher for encrypted replication-plane payloads, if any.
    fn cipher(&self) -> Option<&dyn Cipher>;

    /// Reads bytes from the transport into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a scatter-gather batch to the transport.
    fn sendv(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Picks the inbound message to parse into; `alloc` permits acquiring
    /// a fresh one. `None` means there is nothing to receive into.
    fn recv_next(&mut self, engine: &mut Engine, alloc: bool) -> Option<MsgToken>;

    /// Picks the next outbound message to gather, advancing the send
    /// cursor. `None` means the outbound queue is drained.
    fn send_next(&mut self, engine: &mut Engine) -> Option<MsgToken>;

    /// A whole frame finished parsing. `next` carries the successor message
    /// holding any trailing bytes (or a fragment sibling) that parsing
    /// continues on.
    fn recv_done(&mut self, engine: &mut Engine, msg: MsgToken, next: Option<MsgToken>);

    /// Every byte of `msg` has been written to the transport.
    fn send_done(&mut self, engine: &mut Engine, msg: MsgToken);

    /// Current send-cursor message, if a gather stopped mid-message.
    fn smsg(&self) -> Option<MsgToken>;
    fn set_smsg(&mut self, msg: Option<MsgToken>);
}
