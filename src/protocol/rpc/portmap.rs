//! Portmapper (rpcbind) client, portmap v2 per RFC 1833.
//!
//! Registration is best-effort: the server works without rpcbind, so
//! failures are logged and ignored. `getport` is also used by the NSM
//! client to discover the local statd.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::protocol::rpc::{self, client};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder};

pub const PMAP_VERSION: u32 = 2;
pub const PMAPPROC_SET: u32 = 1;
pub const PMAPPROC_UNSET: u32 = 2;
pub const PMAPPROC_GETPORT: u32 = 3;

/// Protocol number for TCP in portmap mappings.
const IPPROTO_TCP: u32 = 6;

const PORTMAPPER_ADDR: &str = "127.0.0.1:111";
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_XID: AtomicU32 = AtomicU32::new(1);

fn next_xid() -> u32 {
    NEXT_XID.fetch_add(1, Ordering::Relaxed)
}

async fn pmap_call(procedure: u32, program: u32, version: u32, port: u32) -> anyhow::Result<bool> {
    let mut args = XdrEncoder::new();
    args.encode_u32(program);
    args.encode_u32(version);
    args.encode_u32(IPPROTO_TCP);
    args.encode_u32(port);

    let body = client::call_once(
        PORTMAPPER_ADDR,
        CALL_TIMEOUT,
        next_xid(),
        rpc::PMAP_PROGRAM,
        PMAP_VERSION,
        procedure,
        args.data(),
    )
    .await?;

    let mut dec = XdrDecoder::new(&body);
    Ok(dec.decode_bool().context("portmap reply body")?)
}

pub async fn pmap_register(program: u32, version: u32, port: u16) -> anyhow::Result<bool> {
    pmap_call(PMAPPROC_SET, program, version, u32::from(port)).await
}

pub async fn pmap_unregister(program: u32, version: u32) -> anyhow::Result<bool> {
    pmap_call(PMAPPROC_UNSET, program, version, 0).await
}

/// Ask the local portmapper where a program listens. Returns 0 when the
/// program is not registered.
pub async fn pmap_getport(program: u32, version: u32) -> anyhow::Result<u16> {
    let mut args = XdrEncoder::new();
    args.encode_u32(program);
    args.encode_u32(version);
    args.encode_u32(IPPROTO_TCP);
    args.encode_u32(0);

    let body = client::call_once(
        PORTMAPPER_ADDR,
        CALL_TIMEOUT,
        next_xid(),
        rpc::PMAP_PROGRAM,
        PMAP_VERSION,
        PMAPPROC_GETPORT,
        args.data(),
    )
    .await?;

    let mut dec = XdrDecoder::new(&body);
    Ok(dec.decode_u32().context("portmap getport reply")? as u16)
}

const SERVED_PROGRAMS: [(u32, u32, &str); 4] = [
    (rpc::NFS_PROGRAM, 3, "NFS v3"),
    (rpc::NFS_PROGRAM, 4, "NFS v4"),
    (rpc::MOUNT_PROGRAM, 3, "MOUNT v3"),
    (rpc::NLM_PROGRAM, 4, "NLM v4"),
];

/// Register every served program, retrying briefly in case rpcbind is
/// still starting. Not required for correctness.
pub async fn register_all(port: u16) {
    let (first_prog, first_vers, _) = SERVED_PROGRAMS[0];
    let mut registered = false;
    for _ in 0..5 {
        match pmap_register(first_prog, first_vers, port).await {
            Ok(true) => {
                registered = true;
                break;
            }
            Ok(false) | Err(_) => {
                warn!("portmapper not ready, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    if !registered {
        warn!("could not register with portmapper (rpcbind may not be running)");
        return;
    }

    for (prog, vers, _) in &SERVED_PROGRAMS[1..] {
        let _ = pmap_register(*prog, *vers, port).await;
    }
    for (_, _, name) in SERVED_PROGRAMS {
        info!("registered {name} with portmapper");
    }
}

pub async fn unregister_all() {
    for (prog, vers, _) in SERVED_PROGRAMS {
        let _ = pmap_unregister(prog, vers).await;
    }
}
