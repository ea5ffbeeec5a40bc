//! NFSv4 callback channel (RFC 7530 §15): a reverse-direction ONC RPC
//! session the server opens to the client, used for the CB_NULL
//! reachability probe and CB_RECALL of delegations.
//!
//! The client is stateless: one connection per call, one timeout per
//! call. Failures only mean the client's callback channel gets marked
//! invalid and no further delegations are offered.

use std::time::Duration;

use tracing::debug;

use crate::protocol::nfs4::{StateId, CB_COMPOUND, CB_NULL, OP_CB_RECALL};
use crate::protocol::rpc::client;
use crate::protocol::xdr::{XdrDecoder, XdrEncoder};
use crate::vfs::FileHandle;

/// Callback channel coordinates a client registered via SETCLIENTID.
#[derive(Clone, Debug, Default)]
pub struct CallbackInfo {
    pub cb_program: u32,
    pub netid: String,
    /// Universal address, "h1.h2.h3.h4.p1.p2".
    pub addr: String,
    pub ident: u32,
    pub valid: bool,
}

const NFS4_CB_VERSION: u32 = 1;
const CB_NULL_TIMEOUT: Duration = Duration::from_secs(5);
const CB_RECALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse an RFC 5665 universal address into host and port.
/// `"192.168.1.1.8.1"` → `("192.168.1.1", 2049)`.
pub fn parse_universal_addr(r_addr: &str) -> Option<(String, u16)> {
    let parts: Vec<&str> = r_addr.split('.').collect();
    if parts.len() != 6 {
        return None;
    }
    for part in &parts[..4] {
        let octet: u32 = part.parse().ok()?;
        if octet > 255 {
            return None;
        }
    }
    let p1: u32 = parts[4].parse().ok()?;
    let p2: u32 = parts[5].parse().ok()?;
    if p1 > 255 || p2 > 255 {
        return None;
    }
    Some((parts[..4].join("."), (p1 * 256 + p2) as u16))
}

/// CB_NULL probe: succeeds iff the client answers with an accepted,
/// successful reply within the timeout.
pub async fn cb_null_probe(cb: &CallbackInfo, xid: u32) -> bool {
    let Some((host, port)) = parse_universal_addr(&cb.addr) else {
        return false;
    };
    let addr = format!("{host}:{port}");
    match client::call_once(&addr, CB_NULL_TIMEOUT, xid, cb.cb_program, NFS4_CB_VERSION, CB_NULL, &[])
        .await
    {
        Ok(_) => true,
        Err(e) => {
            debug!("CB_NULL probe to {addr} failed: {e:#}");
            false
        }
    }
}

/// Send CB_RECALL inside a CB_COMPOUND. Success iff the compound-level
/// status is NFS4_OK.
pub async fn cb_recall(
    cb: &CallbackInfo,
    xid: u32,
    stateid: &StateId,
    truncate: bool,
    fh: &FileHandle,
) -> bool {
    let Some((host, port)) = parse_universal_addr(&cb.addr) else {
        return false;
    };
    let addr = format!("{host}:{port}");

    let mut args = XdrEncoder::new();
    // CB_COMPOUND4args: tag, minorversion, callback_ident, ops
    args.encode_string("");
    args.encode_u32(0);
    args.encode_u32(cb.ident);
    args.encode_u32(1);
    args.encode_u32(OP_CB_RECALL);
    stateid.encode(&mut args);
    args.encode_bool(truncate);
    args.encode_opaque(fh.as_bytes());

    let reply = match client::call_once(
        &addr,
        CB_RECALL_TIMEOUT,
        xid,
        cb.cb_program,
        NFS4_CB_VERSION,
        CB_COMPOUND,
        args.data(),
    )
    .await
    {
        Ok(reply) => reply,
        Err(e) => {
            debug!("CB_RECALL to {addr} failed: {e:#}");
            return false;
        }
    };

    // CB_COMPOUND4res: status, tag, resops…
    let mut dec = XdrDecoder::new(&reply);
    matches!(dec.decode_u32(), Ok(0))
}
