//! One-shot outbound ONC RPC calls over TCP.
//!
//! The callback channel, the portmapper client and the NSM client all
//! speak the same pattern: connect, send a single record-marked CALL with
//! AUTH_NONE, read one reply record, check `MSG_ACCEPTED`/`SUCCESS`, and
//! hand back the result body. The whole exchange runs under one timeout.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::rpc::{self, AcceptStatus};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder};

/// Write one record as a single last-fragment frame.
async fn send_record(stream: &mut TcpStream, data: &[u8]) -> anyhow::Result<()> {
    let header = (data.len() as u32) | 0x8000_0000;
    stream.write_all(&header.to_be_bytes()).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Read one complete record, reassembling fragments.
async fn recv_record(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut header_buf = [0u8; 4];
        stream.read_exact(&mut header_buf).await?;
        let raw = u32::from_be_bytes(header_buf);
        let last = raw & 0x8000_0000 != 0;
        let frag_len = (raw & 0x7FFF_FFFF) as usize;
        if frag_len > rpc::MAX_FRAGMENT_LENGTH {
            bail!("reply fragment of {frag_len} bytes exceeds limit");
        }
        let start = record.len();
        record.resize(start + frag_len, 0);
        stream.read_exact(&mut record[start..]).await?;
        if last {
            return Ok(record);
        }
    }
}

/// Perform a single RPC call and return the raw result body (the bytes
/// after the accepted-reply header). Errors cover connect failures,
/// timeouts, denied replies and non-SUCCESS accept statuses alike.
pub async fn call_once(
    addr: &str,
    timeout: Duration,
    xid: u32,
    program: u32,
    version: u32,
    procedure: u32,
    args: &[u8],
) -> anyhow::Result<Vec<u8>> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        let _ = stream.set_nodelay(true);

        let mut enc = XdrEncoder::new();
        rpc::encode_call_header(&mut enc, xid, program, version, procedure);
        enc.encode_opaque_fixed(args);
        send_record(&mut stream, enc.data()).await?;

        let reply = recv_record(&mut stream).await?;
        let mut dec = XdrDecoder::new(&reply);

        let reply_xid = dec.decode_u32()?;
        let msg_type = dec.decode_u32()?;
        if reply_xid != xid || msg_type != rpc::MSG_REPLY {
            bail!("mismatched RPC reply (xid {reply_xid}, type {msg_type})");
        }
        let reply_stat = dec.decode_u32()?;
        if reply_stat != rpc::MSG_ACCEPTED {
            bail!("RPC call denied by {addr}");
        }
        dec.decode_u32()?; // verifier flavor
        dec.decode_opaque()?; // verifier body
        let accept_stat = dec.decode_u32()?;
        if accept_stat != AcceptStatus::Success as u32 {
            bail!("RPC call to {addr} failed with accept status {accept_stat}");
        }

        Ok(dec.take_remaining().to_vec())
    })
    .await
    .map_err(|_| anyhow!("RPC call to {addr} timed out"))?
}
