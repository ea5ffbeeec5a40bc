//! NSM: Network Status Monitor client (program 100024, version 1).
//!
//! The server asks the local rpc.statd to watch NLM clients; when statd
//! reports that a monitored host rebooted, every lock that host owned is
//! evicted from the shared table. statd's port is discovered through the
//! portmapper per call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::protocol::nfs4::state::StateManager;
use crate::protocol::nlm::NlmServer;
use crate::protocol::rpc::{self, client, portmap};
use crate::protocol::xdr::XdrEncoder;

pub const SM_VERSION: u32 = 1;
pub const SM_MON: u32 = 2;
pub const SM_UNMON: u32 = 3;
pub const SM_UNMON_ALL: u32 = 4;

const STATD_TIMEOUT: Duration = Duration::from_secs(2);

pub struct NsmClient {
    state: Arc<StateManager>,
    monitored: Mutex<HashSet<String>>,
    next_xid: AtomicU32,
}

impl NsmClient {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state, monitored: Mutex::new(HashSet::new()), next_xid: AtomicU32::new(200) }
    }

    fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    async fn statd_addr() -> Option<String> {
        match portmap::pmap_getport(rpc::NSM_PROGRAM, SM_VERSION).await {
            Ok(0) | Err(_) => {
                warn!("rpc.statd not registered with portmapper");
                None
            }
            Ok(port) => Some(format!("127.0.0.1:{port}")),
        }
    }

    /// Encode a mon_id: the monitored host plus our own notification
    /// coordinates.
    fn encode_mon_id(
        args: &mut XdrEncoder,
        client_name: &str,
        my_name: &str,
        my_prog: u32,
        my_vers: u32,
        my_proc: u32,
    ) {
        args.encode_string(client_name);
        args.encode_string(my_name);
        args.encode_u32(my_prog);
        args.encode_u32(my_vers);
        args.encode_u32(my_proc);
    }

    /// SM_MON: start monitoring a client. Returns false when statd is
    /// unreachable; NLM keeps working, just without reboot cleanup.
    pub async fn monitor(
        &self,
        client_name: &str,
        my_name: &str,
        my_prog: u32,
        my_vers: u32,
        my_proc: u32,
    ) -> bool {
        let Some(addr) = Self::statd_addr().await else {
            return false;
        };

        let mut args = XdrEncoder::new();
        Self::encode_mon_id(&mut args, client_name, my_name, my_prog, my_vers, my_proc);
        args.encode_opaque_fixed(&[0u8; 16]); // priv, unused

        let ok = client::call_once(
            &addr,
            STATD_TIMEOUT,
            self.next_xid(),
            rpc::NSM_PROGRAM,
            SM_VERSION,
            SM_MON,
            args.data(),
        )
        .await
        .is_ok();

        if ok {
            self.monitored.lock().unwrap().insert(client_name.to_string());
        }
        ok
    }

    /// SM_UNMON: stop monitoring a client.
    pub async fn unmonitor(&self, client_name: &str, my_name: &str) -> bool {
        let Some(addr) = Self::statd_addr().await else {
            return false;
        };

        let mut args = XdrEncoder::new();
        Self::encode_mon_id(&mut args, client_name, my_name, 0, 0, 0);

        let ok = client::call_once(
            &addr,
            STATD_TIMEOUT,
            self.next_xid(),
            rpc::NSM_PROGRAM,
            SM_VERSION,
            SM_UNMON,
            args.data(),
        )
        .await
        .is_ok();

        self.monitored.lock().unwrap().remove(client_name);
        ok
    }

    /// SM_UNMON_ALL: stop monitoring everything (shutdown path).
    pub async fn unmonitor_all(&self, my_name: &str) -> bool {
        let Some(addr) = Self::statd_addr().await else {
            return false;
        };

        let mut args = XdrEncoder::new();
        args.encode_string(my_name);
        args.encode_u32(0);
        args.encode_u32(0);
        args.encode_u32(0);

        let ok = client::call_once(
            &addr,
            STATD_TIMEOUT,
            self.next_xid(),
            rpc::NSM_PROGRAM,
            SM_VERSION,
            SM_UNMON_ALL,
            args.data(),
        )
        .await
        .is_ok();

        self.monitored.lock().unwrap().clear();
        ok
    }

    /// SM_NOTIFY arrived: the host rebooted, so every NLM lock it held is
    /// gone.
    pub fn handle_notify(&self, client_name: &str) {
        debug!("NSM notify: {client_name} rebooted, releasing its locks");
        let prefix = NlmServer::host_prefix(client_name);
        self.state.with_lock_table(|table| table.release_all_matching(&prefix));
        self.monitored.lock().unwrap().remove(client_name);
    }

    pub fn is_monitored(&self, client_name: &str) -> bool {
        self.monitored.lock().unwrap().contains(client_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::FileHandle;

    #[test]
    fn notify_releases_the_rebooted_hosts_locks() {
        let state = Arc::new(StateManager::new());
        let nsm = NsmClient::new(state.clone());
        let fh = FileHandle::from_bytes(&[1u8; 16]).unwrap();

        state.with_lock_table(|table| {
            table.acquire(&fh, "nlm:hostA:100", true, 0, 100).unwrap();
            table.acquire(&fh, "nlm:hostB:100", true, 200, 100).unwrap();
        });

        nsm.handle_notify("hostA");

        state.with_lock_table(|table| {
            assert!(!table.has_locks(&fh, "nlm:hostA:100"));
            assert!(table.has_locks(&fh, "nlm:hostB:100"));
        });
        assert!(!nsm.is_monitored("hostA"));
    }
}
