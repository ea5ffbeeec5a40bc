//! MOUNT v3 protocol (RFC 1813 Appendix I).
//!
//! The server keeps no per-client mount state: MNT hands out the export
//! root handle, UMNT/UMNTALL are accepted and ignored.

use std::sync::Arc;

use async_trait::async_trait;
use num_derive::ToPrimitive;
use tracing::{debug, warn};

use crate::protocol::rpc::{AuthFlavor, ProcError, RpcCallHeader, RpcProgram};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder};
use crate::vfs::Vfs;

pub const VERSION: u32 = 3;

pub const MOUNTPROC3_NULL: u32 = 0;
pub const MOUNTPROC3_MNT: u32 = 1;
pub const MOUNTPROC3_DUMP: u32 = 2;
pub const MOUNTPROC3_UMNT: u32 = 3;
pub const MOUNTPROC3_UMNTALL: u32 = 4;
pub const MOUNTPROC3_EXPORT: u32 = 5;

/// RFC 1813 §A.3 mountstat3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ToPrimitive)]
#[repr(u32)]
pub enum MountStat3 {
    Ok = 0,
    Perm = 1,
    Noent = 2,
    Io = 5,
    Acces = 13,
    Notdir = 20,
    Inval = 22,
    NameTooLong = 63,
    NotSupp = 10004,
    ServerFault = 10006,
}

pub struct MountServer {
    vfs: Arc<dyn Vfs>,
    exports: Vec<String>,
}

impl MountServer {
    pub fn new(vfs: Arc<dyn Vfs>, exports: Vec<String>) -> Self {
        Self { vfs, exports }
    }

    /// MOUNTPROC3_MNT: verify the path is exported and return the root
    /// handle together with the accepted auth flavors.
    fn proc_mnt(&self, args: &mut XdrDecoder<'_>, reply: &mut XdrEncoder) -> Result<(), ProcError> {
        let dirpath = args.decode_string()?;
        debug!("MNT {dirpath}");

        // "/" is always accepted as an alias for the export.
        let known = dirpath == "/" || self.exports.iter().any(|e| *e == dirpath);
        if !known {
            warn!("MNT for unexported path {dirpath}");
            reply.encode_u32(MountStat3::Acces as u32);
            return Ok(());
        }

        match self.vfs.root_fh() {
            Ok(fh) => {
                reply.encode_u32(MountStat3::Ok as u32);
                reply.encode_opaque(fh.as_bytes());
                // auth flavors: AUTH_SYS only
                reply.encode_u32(1);
                reply.encode_u32(AuthFlavor::AuthSys as u32);
            }
            Err(_) => {
                reply.encode_u32(MountStat3::Noent as u32);
            }
        }
        Ok(())
    }

    /// MOUNTPROC3_EXPORT: list the exports, each with an empty group list.
    fn proc_export(&self, reply: &mut XdrEncoder) {
        for export in &self.exports {
            reply.encode_bool(true);
            reply.encode_string(export);
            reply.encode_bool(false); // no groups: world-mountable
        }
        reply.encode_bool(false);
    }
}

#[async_trait]
impl RpcProgram for MountServer {
    async fn handle(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError> {
        match call.procedure {
            MOUNTPROC3_NULL => Ok(()),
            MOUNTPROC3_MNT => self.proc_mnt(args, reply),
            MOUNTPROC3_DUMP => {
                // Empty mount list.
                reply.encode_bool(false);
                Ok(())
            }
            MOUNTPROC3_UMNT => {
                // Consume the dirpath; no mount state is kept.
                args.decode_string()?;
                Ok(())
            }
            MOUNTPROC3_UMNTALL => Ok(()),
            MOUNTPROC3_EXPORT => {
                self.proc_export(reply);
                Ok(())
            }
            _ => Err(ProcError::Unavail),
        }
    }
}
