//! ONC RPC v2 as specified in RFC 5531, plus the RPC-with-TLS upgrade from
//! RFC 9289.
//!
//! The submodules split the concern the way the rest of the protocol tree
//! does: `server` owns the TCP listener, record-marking framer and
//! dispatch; `tls` the optional TLS 1.3 session; `client` the one-shot
//! outbound calls used by the callback channel, the portmapper client and
//! the NSM client.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::protocol::xdr::{XdrDecoder, XdrEncoder, XdrResult};

pub mod client;
pub mod portmap;
pub mod server;
pub mod tls;

pub use server::{ProcError, ProgramRegistry, RpcListener, RpcProgram};

/// Maximum size of a single record-marking fragment we accept.
pub const MAX_FRAGMENT_LENGTH: usize = 1024 * 1024;
/// Maximum size of a reassembled RPC record.
pub const MAX_RECORD_LENGTH: usize = 16 * 1024 * 1024;

/// RFC 5531 §9 and RFC 1813: well-known program numbers.
pub const NFS_PROGRAM: u32 = 100003;
pub const MOUNT_PROGRAM: u32 = 100005;
pub const NLM_PROGRAM: u32 = 100021;
pub const NSM_PROGRAM: u32 = 100024;
pub const PMAP_PROGRAM: u32 = 100000;

/// RFC 5531 §7.1 msg_type.
pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

/// RFC 5531 §7.2 reply_stat.
pub const MSG_ACCEPTED: u32 = 0;
pub const MSG_DENIED: u32 = 1;

/// RFC 5531 §7.2 accept_stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum AcceptStatus {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

/// RFC 5531 §7.2 reject_stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum RejectStatus {
    RpcMismatch = 0,
    AuthError = 1,
}

/// RFC 5531 §8.2 auth flavors, plus AUTH_TLS from RFC 9289 §4.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum AuthFlavor {
    #[default]
    AuthNone = 0,
    AuthSys = 1,
    AuthShort = 2,
    AuthDh = 3,
    AuthTls = 7,
}

/// RFC 5531 §7.1 opaque_auth.
#[derive(Clone, Debug, Default)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn flavor(&self) -> Option<AuthFlavor> {
        AuthFlavor::from_u32(self.flavor)
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.flavor);
        enc.encode_opaque(&self.body);
    }

    pub fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(Self { flavor: dec.decode_u32()?, body: dec.decode_opaque()? })
    }
}

/// RFC 5531 §8.2.2 authsys_parms.
#[derive(Clone, Debug, Default)]
pub struct AuthSysCred {
    pub stamp: u32,
    pub machinename: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

/// Decoded call_body, handed to every procedure handler.
#[derive(Clone, Debug, Default)]
pub struct RpcCallHeader {
    pub xid: u32,
    pub rpc_version: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: OpaqueAuth,
    pub verifier: OpaqueAuth,
}

impl RpcCallHeader {
    /// Parse AUTH_SYS credentials out of the credential body, if that is
    /// the flavor the client sent. The server trusts these values as-is.
    pub fn auth_sys(&self) -> Option<AuthSysCred> {
        if self.credential.flavor() != Some(AuthFlavor::AuthSys) {
            return None;
        }
        let mut dec = XdrDecoder::new(&self.credential.body);
        let mut parse = || -> XdrResult<AuthSysCred> {
            let stamp = dec.decode_u32()?;
            let machinename = dec.decode_string()?;
            let uid = dec.decode_u32()?;
            let gid = dec.decode_u32()?;
            let ngids = dec.decode_u32()?;
            let mut gids = Vec::with_capacity(ngids.min(16) as usize);
            for _ in 0..ngids {
                gids.push(dec.decode_u32()?);
            }
            Ok(AuthSysCred { stamp, machinename, uid, gid, gids })
        };
        parse().ok()
    }
}

/// Encode an RPC CALL header with AUTH_NONE credentials, for the outbound
/// clients (callback channel, portmapper, NSM).
pub fn encode_call_header(
    enc: &mut XdrEncoder,
    xid: u32,
    program: u32,
    version: u32,
    procedure: u32,
) {
    enc.encode_u32(xid);
    enc.encode_u32(MSG_CALL);
    enc.encode_u32(2); // rpcvers
    enc.encode_u32(program);
    enc.encode_u32(version);
    enc.encode_u32(procedure);
    OpaqueAuth::none().encode(enc);
    OpaqueAuth::none().encode(enc);
}
