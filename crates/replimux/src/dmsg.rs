//! See [`Dmsg`].

/// Bit in [`Dmsg::bit_field`] marking an encrypted, length-prefixed
/// payload.
pub const DMSG_ENCRYPTED: u8 = 0x1;

/// Internode envelope wrapped around frames on the replication plane.
///
/// The engine treats the envelope as opaque except for `bit_field` and
/// `plen`, which drive the receive driver's sizing and decryption policy.
/// Its lifecycle is tied to the owning message.
#[derive(Debug, Clone, Default)]
pub struct Dmsg {
    /// Envelope message type, opaque to the engine.
    pub kind: u8,
    /// Envelope wire version, opaque to the engine.
    pub version: u8,
    /// Flag bits; see [`DMSG_ENCRYPTED`].
    pub bit_field: u8,
    /// Payload bytes still expected on the wire.
    pub plen: usize,
}

impl Dmsg {
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.bit_field & DMSG_ENCRYPTED != 0
    }
}
