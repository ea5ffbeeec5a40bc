//! RPC transport: TCP listener, record-marking framer and message
//! dispatch (RFC 5531 §7, §11).
//!
//! One task per accepted connection; within a connection, requests are
//! processed strictly one at a time in arrival order. A record is a
//! sequence of fragments, each prefixed by a 4-byte header whose top bit
//! marks the last fragment. Oversized fragments or records close the
//! connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::rpc::tls::{RpcTlsContext, ALPN_SUNRPC, STARTTLS_VERIFIER};
use crate::protocol::rpc::{
    self, AcceptStatus, AuthFlavor, OpaqueAuth, RejectStatus, RpcCallHeader,
};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder, XdrError};

/// Why a procedure handler did not produce a reply body.
#[derive(Debug)]
pub enum ProcError {
    /// The procedure number is not implemented → PROC_UNAVAIL.
    Unavail,
    /// The handler failed → SYSTEM_ERR; the connection continues.
    Fault(anyhow::Error),
}

impl From<XdrError> for ProcError {
    fn from(e: XdrError) -> Self {
        ProcError::Fault(e.into())
    }
}

impl From<anyhow::Error> for ProcError {
    fn from(e: anyhow::Error) -> Self {
        ProcError::Fault(e)
    }
}

/// A registered RPC program (one version of it).
///
/// The handler decodes procedure-specific arguments from `args` and
/// appends the procedure result body to `reply`; the transport wraps the
/// body into an accepted SUCCESS reply.
#[async_trait]
pub trait RpcProgram: Send + Sync {
    async fn handle(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError>;
}

/// Map of (program, version) → handler.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<(u32, u32), Box<dyn RpcProgram>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, program: u32, version: u32, handler: Box<dyn RpcProgram>) {
        self.programs.insert((program, version), handler);
    }

    fn lookup(&self, program: u32, version: u32) -> Option<&dyn RpcProgram> {
        self.programs.get(&(program, version)).map(|p| &**p)
    }
}

/// Bound RPC listener; accepts connections until shut down.
pub struct RpcListener {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    registry: ProgramRegistry,
    tls: Option<RpcTlsContext>,
    running: AtomicBool,
}

/// Either side of the opportunistic TLS upgrade.
enum ConnStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Placeholder while the socket is being handed to the TLS acceptor.
    Detached,
}

impl ConnStream {
    fn is_tls(&self) -> bool {
        matches!(self, ConnStream::Tls(_))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            ConnStream::Plain(s) => s.read_exact(buf).await.map(|_| ()),
            ConnStream::Tls(s) => s.read_exact(buf).await.map(|_| ()),
            ConnStream::Detached => unreachable!("read on detached stream"),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            ConnStream::Plain(s) => s.write_all(buf).await,
            ConnStream::Tls(s) => s.write_all(buf).await,
            ConnStream::Detached => unreachable!("write on detached stream"),
        }
    }
}

impl RpcListener {
    /// Bind to `ip:port` with the given program registry and optional TLS
    /// context.
    pub async fn bind(
        addr: &str,
        registry: ProgramRegistry,
        tls: Option<RpcTlsContext>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("RPC server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            shared: Arc::new(Shared { registry, tls, running: AtomicBool::new(true) }),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.listener.local_addr().map(|a| a.ip()).ok()
    }

    /// Stop accepting work; per-connection tasks exit on their next read.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Accept connections forever, spawning a task per client.
    pub async fn handle_forever(&self) -> std::io::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            if !self.shared.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let _ = socket.set_nodelay(true);
            info!("accepting connection from {peer}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, shared).await {
                    debug!("connection {peer} closed: {e:#}");
                }
            });
        }
    }
}

/// Read one record (all fragments) from the connection. Returns `None` on
/// a clean EOF at a record boundary.
async fn read_record(conn: &mut ConnStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut record = Vec::new();
    loop {
        let mut header_buf = [0u8; 4];
        match conn.read_exact(&mut header_buf).await {
            Ok(()) => {}
            Err(e) if record.is_empty() && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let raw = u32::from_be_bytes(header_buf);
        let last = raw & 0x8000_0000 != 0;
        let frag_len = (raw & 0x7FFF_FFFF) as usize;
        trace!("reading fragment length:{frag_len} last:{last}");

        if frag_len > rpc::MAX_FRAGMENT_LENGTH {
            bail!("fragment of {frag_len} bytes exceeds limit");
        }
        let start = record.len();
        if start + frag_len > rpc::MAX_RECORD_LENGTH {
            bail!("record exceeds {} byte limit", rpc::MAX_RECORD_LENGTH);
        }
        record.resize(start + frag_len, 0);
        conn.read_exact(&mut record[start..]).await?;

        if last {
            return Ok(Some(record));
        }
    }
}

/// Send one reply as a single last-fragment record.
async fn send_record(conn: &mut ConnStream, data: &[u8]) -> std::io::Result<()> {
    let header = (data.len() as u32) | 0x8000_0000;
    conn.write_all(&header.to_be_bytes()).await?;
    conn.write_all(data).await
}

fn decode_call_header(dec: &mut XdrDecoder<'_>) -> anyhow::Result<RpcCallHeader> {
    let xid = dec.decode_u32()?;
    let msg_type = dec.decode_u32()?;
    if msg_type != rpc::MSG_CALL {
        bail!("expected RPC CALL, got message type {msg_type}");
    }
    Ok(RpcCallHeader {
        xid,
        rpc_version: dec.decode_u32()?,
        program: dec.decode_u32()?,
        version: dec.decode_u32()?,
        procedure: dec.decode_u32()?,
        credential: OpaqueAuth::decode(dec)?,
        verifier: OpaqueAuth::decode(dec)?,
    })
}

fn encode_accepted_reply(xid: u32, status: AcceptStatus, body: &[u8]) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(rpc::MSG_REPLY);
    enc.encode_u32(rpc::MSG_ACCEPTED);
    OpaqueAuth::none().encode(&mut enc);
    enc.encode_u32(status as u32);
    enc.encode_opaque_fixed(body);
    enc.into_inner()
}

fn encode_denied_reply(xid: u32, reject: RejectStatus, low: u32, high: u32) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(rpc::MSG_REPLY);
    enc.encode_u32(rpc::MSG_DENIED);
    enc.encode_u32(reject as u32);
    if reject == RejectStatus::RpcMismatch {
        enc.encode_u32(low);
        enc.encode_u32(high);
    }
    enc.into_inner()
}

/// RFC 9289 §4.1: MSG_ACCEPTED/SUCCESS with a `STARTTLS` verifier.
fn encode_starttls_reply(xid: u32) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(rpc::MSG_REPLY);
    enc.encode_u32(rpc::MSG_ACCEPTED);
    enc.encode_u32(AuthFlavor::AuthNone as u32);
    enc.encode_opaque(STARTTLS_VERIFIER);
    enc.encode_u32(AcceptStatus::Success as u32);
    enc.into_inner()
}

async fn handle_connection(socket: TcpStream, shared: Arc<Shared>) -> anyhow::Result<()> {
    let mut conn = ConnStream::Plain(socket);

    while shared.running.load(Ordering::SeqCst) {
        let record = match read_record(&mut conn).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        process_record(&record, &mut conn, &shared).await?;
    }
    Ok(())
}

/// Decode, dispatch and answer one RPC record. Malformed call headers drop
/// the record; everything else is answered at the RPC envelope level.
async fn process_record(
    record: &[u8],
    conn: &mut ConnStream,
    shared: &Shared,
) -> anyhow::Result<()> {
    let mut dec = XdrDecoder::new(record);
    let call = match decode_call_header(&mut dec) {
        Ok(call) => call,
        Err(e) => {
            warn!("dropping malformed RPC record: {e}");
            return Ok(());
        }
    };

    if call.rpc_version != 2 {
        warn!("RPC version mismatch: {} != 2", call.rpc_version);
        let reply = encode_denied_reply(call.xid, RejectStatus::RpcMismatch, 2, 2);
        return Ok(send_record(conn, &reply).await?);
    }

    // RFC 9289: opportunistic TLS upgrade before normal dispatch.
    if call.procedure == 0
        && call.credential.flavor() == Some(AuthFlavor::AuthTls)
        && shared.tls.is_some()
        && !conn.is_tls()
    {
        return upgrade_to_tls(conn, shared, call.xid).await;
    }

    let Some(program) = shared.registry.lookup(call.program, call.version) else {
        warn!("program {}/{} not registered", call.program, call.version);
        let reply = encode_accepted_reply(call.xid, AcceptStatus::ProgUnavail, &[]);
        return Ok(send_record(conn, &reply).await?);
    };

    let mut body = XdrEncoder::new();
    let reply = match program.handle(&call, &mut dec, &mut body).await {
        Ok(()) => encode_accepted_reply(call.xid, AcceptStatus::Success, body.data()),
        Err(ProcError::Unavail) => {
            warn!(
                "procedure {} not implemented by program {}/{}",
                call.procedure, call.program, call.version
            );
            encode_accepted_reply(call.xid, AcceptStatus::ProcUnavail, &[])
        }
        Err(ProcError::Fault(e)) => {
            error!("procedure {} failed: {e:#}", call.procedure);
            encode_accepted_reply(call.xid, AcceptStatus::SystemErr, &[])
        }
    };
    send_record(conn, &reply).await?;
    Ok(())
}

/// Answer the AUTH_TLS probe and run the server-side handshake on the same
/// socket. Handshake failure terminates the connection.
async fn upgrade_to_tls(
    conn: &mut ConnStream,
    shared: &Shared,
    xid: u32,
) -> anyhow::Result<()> {
    let tls = shared.tls.as_ref().expect("TLS context checked by caller");

    send_record(conn, &encode_starttls_reply(xid)).await?;

    let ConnStream::Plain(socket) = std::mem::replace(conn, ConnStream::Detached) else {
        bail!("TLS upgrade on a non-plain stream");
    };
    let stream = tls.accept(socket).await.map_err(|e| {
        error!("TLS handshake failed: {e}");
        anyhow!("TLS handshake failed: {e}")
    })?;

    // RFC 9289 §5.1: the client must have negotiated "sunrpc" via ALPN.
    let (_, session) = stream.get_ref();
    if session.alpn_protocol() != Some(ALPN_SUNRPC) {
        bail!("TLS client did not negotiate the sunrpc ALPN protocol");
    }

    debug!("connection upgraded to TLS");
    *conn = ConnStream::Tls(Box::new(stream));
    Ok(())
}
