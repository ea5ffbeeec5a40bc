//! NLM v4, the Network Lock Manager companion to NFSv3 (program 100021).
//!
//! Locks land in the shared byte-range table under `nlm:{caller}:{svid}`
//! owner keys, taken through the NFSv4 state manager so both protocols
//! serialize on the same mutex and exclude each other's ranges. Only the
//! synchronous procedures are served; the server never queues blocked
//! requests, so a blocking LOCK gets LCK_BLOCKED and the client retries.

use std::sync::Arc;

use async_trait::async_trait;
use num_derive::ToPrimitive;
use tracing::debug;

use crate::protocol::nfs4::state::StateManager;
use crate::protocol::rpc::{ProcError, RpcCallHeader, RpcProgram};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder, XdrResult};
use crate::vfs::FileHandle;

pub const VERSION: u32 = 4;

pub const NLMPROC4_NULL: u32 = 0;
pub const NLMPROC4_TEST: u32 = 1;
pub const NLMPROC4_LOCK: u32 = 2;
pub const NLMPROC4_CANCEL: u32 = 3;
pub const NLMPROC4_UNLOCK: u32 = 4;
// The async _MSG variants (5-16) and GRANTED callbacks are not served.
pub const NLMPROC4_FREE_ALL: u32 = 23;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ToPrimitive)]
#[repr(u32)]
pub enum NlmStat {
    Granted = 0,
    Denied = 1,
    DeniedNolocks = 2,
    Blocked = 3,
    DeniedGracePeriod = 4,
    Deadlock = 5,
}

/// nlm4_lock: the lock a request talks about.
#[derive(Clone, Debug, Default)]
struct NlmLock {
    caller_name: String,
    fh: FileHandle,
    /// Owner handle; opaque to the server.
    #[allow(dead_code)]
    oh: Vec<u8>,
    svid: u32,
    offset: u64,
    length: u64,
}

pub struct NlmServer {
    state: Arc<StateManager>,
}

impl NlmServer {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    /// Table key for an NLM lock: `nlm:{caller}:{svid}`.
    fn owner_key(lock: &NlmLock) -> String {
        format!("nlm:{}:{}", lock.caller_name, lock.svid)
    }

    /// Prefix matching every lock a host owns, for crash eviction.
    pub fn host_prefix(caller_name: &str) -> String {
        format!("nlm:{caller_name}:")
    }

    /// NLM says length 0 for "to EOF"; the table says `u64::MAX`.
    fn nlm_length(len: u64) -> u64 {
        if len == 0 {
            u64::MAX
        } else {
            len
        }
    }

    fn decode_nlm4_lock(dec: &mut XdrDecoder<'_>) -> XdrResult<NlmLock> {
        let caller_name = dec.decode_string()?;
        let fh_bytes = dec.decode_opaque()?;
        let fh = FileHandle::from_bytes(&fh_bytes).unwrap_or_default();
        Ok(NlmLock {
            caller_name,
            fh,
            oh: dec.decode_opaque()?,
            svid: dec.decode_u32()?,
            offset: dec.decode_u64()?,
            length: dec.decode_u64()?,
        })
    }

    /// NLMPROC4_TEST.
    fn proc_test(&self, args: &mut XdrDecoder<'_>, reply: &mut XdrEncoder) -> XdrResult<()> {
        let cookie = args.decode_opaque()?;
        let exclusive = args.decode_bool()?;
        let lock = Self::decode_nlm4_lock(args)?;

        reply.encode_opaque(&cookie);

        let key = Self::owner_key(&lock);
        let conflict = self.state.with_lock_table(|table| {
            table.test(&lock.fh, &key, exclusive, lock.offset, Self::nlm_length(lock.length))
        });

        match conflict {
            Some(c) => {
                reply.encode_u32(NlmStat::Denied as u32);
                // nlm4_holder; svid/oh of the holder are unknown across
                // protocols, so they encode empty.
                reply.encode_bool(c.exclusive);
                reply.encode_u32(0);
                reply.encode_opaque(&[]);
                reply.encode_u64(c.offset);
                reply.encode_u64(if c.length == u64::MAX { 0 } else { c.length });
            }
            None => reply.encode_u32(NlmStat::Granted as u32),
        }
        Ok(())
    }

    /// NLMPROC4_LOCK.
    fn proc_lock(&self, args: &mut XdrDecoder<'_>, reply: &mut XdrEncoder) -> XdrResult<()> {
        let cookie = args.decode_opaque()?;
        let block = args.decode_bool()?;
        let exclusive = args.decode_bool()?;
        let lock = Self::decode_nlm4_lock(args)?;
        args.decode_bool()?; // reclaim
        args.decode_u32()?; // state

        reply.encode_opaque(&cookie);

        let key = Self::owner_key(&lock);
        let acquired = self.state.with_lock_table(|table| {
            table
                .acquire(&lock.fh, &key, exclusive, lock.offset, Self::nlm_length(lock.length))
                .is_ok()
        });

        let status = if acquired {
            NlmStat::Granted
        } else if block {
            // No blocked-request queue: the client polls again.
            NlmStat::Blocked
        } else {
            NlmStat::Denied
        };
        debug!("NLM LOCK {}:{} -> {status:?}", lock.caller_name, lock.svid);
        reply.encode_u32(status as u32);
        Ok(())
    }

    /// NLMPROC4_CANCEL: nothing is ever queued, so nothing to cancel.
    fn proc_cancel(&self, args: &mut XdrDecoder<'_>, reply: &mut XdrEncoder) -> XdrResult<()> {
        let cookie = args.decode_opaque()?;
        args.decode_bool()?; // block
        args.decode_bool()?; // exclusive
        Self::decode_nlm4_lock(args)?;

        reply.encode_opaque(&cookie);
        reply.encode_u32(NlmStat::Granted as u32);
        Ok(())
    }

    /// NLMPROC4_UNLOCK.
    fn proc_unlock(&self, args: &mut XdrDecoder<'_>, reply: &mut XdrEncoder) -> XdrResult<()> {
        let cookie = args.decode_opaque()?;
        let lock = Self::decode_nlm4_lock(args)?;

        reply.encode_opaque(&cookie);

        let key = Self::owner_key(&lock);
        self.state.with_lock_table(|table| {
            table.release(&lock.fh, &key, lock.offset, Self::nlm_length(lock.length));
        });
        reply.encode_u32(NlmStat::Granted as u32);
        Ok(())
    }

    /// NLMPROC4_FREE_ALL: a client rebooted, drop everything it owned.
    fn proc_free_all(&self, args: &mut XdrDecoder<'_>) -> XdrResult<()> {
        let name = args.decode_string()?;
        args.decode_u32()?; // state

        let prefix = Self::host_prefix(&name);
        debug!("NLM FREE_ALL for {name}");
        self.state.with_lock_table(|table| table.release_all_matching(&prefix));
        Ok(())
    }
}

#[async_trait]
impl RpcProgram for NlmServer {
    async fn handle(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError> {
        match call.procedure {
            NLMPROC4_NULL => Ok(()),
            NLMPROC4_TEST => Ok(self.proc_test(args, reply)?),
            NLMPROC4_LOCK => Ok(self.proc_lock(args, reply)?),
            NLMPROC4_CANCEL => Ok(self.proc_cancel(args, reply)?),
            NLMPROC4_UNLOCK => Ok(self.proc_unlock(args, reply)?),
            NLMPROC4_FREE_ALL => Ok(self.proc_free_all(args)?),
            _ => Err(ProcError::Unavail),
        }
    }
}
