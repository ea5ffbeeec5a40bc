//! Wire protocol tree: XDR encoding, the ONC RPC transport and the
//! protocol servers it dispatches to (MOUNT v3, NFS v3, NFS v4.0, NLM v4)
//! plus the outbound NSM client.

pub mod mount;
pub mod nfs3;
pub mod nfs4;
pub mod nlm;
pub mod nsm;
pub mod rpc;
pub mod xdr;
