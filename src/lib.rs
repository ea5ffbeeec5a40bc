//! nfs-aurochs: a user-space NFS server speaking MOUNT v3, NFS v3,
//! NFS v4.0 and NLM v4 over ONC RPC on a single TCP port, with optional
//! RPC-with-TLS (RFC 9289) and portmapper registration.
//!
//! ## Standards
//!
//! - RFC 4506: XDR encoding
//! - RFC 5531: ONC RPC v2 and its TCP record marking
//! - RFC 1833: portmap v2
//! - RFC 1813: NFS v3 and the MOUNT v3 appendix
//! - RFC 7530: NFS v4.0, including the callback channel
//! - RFC 9289: RPC over TLS
//! - RFC 5665: universal addresses
//!
//! ## Layout
//!
//! - [`protocol`]: the wire protocols: XDR codec, RPC transport with the
//!   program registry and TLS upgrade, and the MOUNT/NFS3/NFS4/NLM
//!   servers plus the NSM client.
//! - [`vfs`]: the filesystem trait the protocol servers are written
//!   against.
//! - [`localfs`]: the shipped passthrough backend serving a host
//!   directory.
//! - [`locking`]: the protocol-agnostic byte-range lock table shared by
//!   NFSv4 and NLM.
//!
//! Everything in memory: a restart starts a fresh grace period and
//! implicitly revokes all client state.

pub mod localfs;
pub mod locking;
pub mod protocol;
pub mod vfs;

pub use protocol::xdr;
