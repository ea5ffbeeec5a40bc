//! NFSv3 procedure tests driven through the program handler with an
//! in-memory filesystem.

use std::sync::Arc;

use nfs_aurochs::protocol::nfs3::{self, Nfs3Server};
use nfs_aurochs::protocol::rpc::{RpcCallHeader, RpcProgram};
use nfs_aurochs::vfs::Vfs;
use nfs_aurochs::xdr::{XdrDecoder, XdrEncoder};

mod support;
use support::MemFs;

const NFS3_OK: u32 = 0;
const NFS3ERR_EXIST: u32 = 17;
const NFS3ERR_INVAL: u32 = 22;
const NFS3ERR_NOT_SYNC: u32 = 10002;
const NFS3ERR_BAD_COOKIE: u32 = 10003;
const NFS3ERR_NOTSUPP: u32 = 10004;

fn server() -> (Arc<MemFs>, Nfs3Server) {
    let fs = Arc::new(MemFs::new());
    let server = Nfs3Server::new(fs.clone());
    (fs, server)
}

async fn call(server: &Nfs3Server, procedure: u32, args: &[u8]) -> Vec<u8> {
    let call = RpcCallHeader { procedure, ..RpcCallHeader::default() };
    let mut dec = XdrDecoder::new(args);
    let mut reply = XdrEncoder::new();
    server.handle(&call, &mut dec, &mut reply).await.expect("procedure should not fault");
    reply.into_inner()
}

/// The wire fields of a fattr3 this suite cares about.
struct WireAttr {
    ftype: u32,
    mode: u32,
    ctime: (u32, u32),
}

fn decode_fattr3(dec: &mut XdrDecoder<'_>) -> WireAttr {
    let ftype = dec.decode_u32().unwrap();
    let mode = dec.decode_u32().unwrap();
    dec.decode_u32().unwrap(); // nlink
    dec.decode_u32().unwrap(); // uid
    dec.decode_u32().unwrap(); // gid
    dec.decode_u64().unwrap(); // size
    dec.decode_u64().unwrap(); // used
    dec.decode_u32().unwrap(); // rdev major
    dec.decode_u32().unwrap(); // rdev minor
    dec.decode_u64().unwrap(); // fsid
    dec.decode_u64().unwrap(); // fileid
    dec.decode_u64().unwrap(); // atime
    dec.decode_u64().unwrap(); // mtime
    let ctime = (dec.decode_u32().unwrap(), dec.decode_u32().unwrap());
    WireAttr { ftype, mode, ctime }
}

fn skip_post_op_attr(dec: &mut XdrDecoder<'_>) {
    if dec.decode_bool().unwrap() {
        decode_fattr3(dec);
    }
}

fn skip_wcc_data(dec: &mut XdrDecoder<'_>) {
    if dec.decode_bool().unwrap() {
        dec.decode_u64().unwrap(); // size
        dec.decode_u64().unwrap(); // mtime
        dec.decode_u64().unwrap(); // ctime
    }
    skip_post_op_attr(dec);
}

/// Empty sattr3: nothing set, both times untouched.
fn encode_empty_sattr3(enc: &mut XdrEncoder) {
    for _ in 0..4 {
        enc.encode_bool(false);
    }
    enc.encode_u32(0); // atime DONT_CHANGE
    enc.encode_u32(0); // mtime DONT_CHANGE
}

fn root_fh_bytes(fs: &MemFs) -> Vec<u8> {
    fs.root_fh().unwrap().as_bytes().to_vec()
}

/// Run CREATE (UNCHECKED) and return the new file's wire handle.
async fn create_file(server: &Nfs3Server, fs: &MemFs, name: &str) -> Vec<u8> {
    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(fs));
    args.encode_string(name);
    args.encode_u32(nfs3::CREATE_UNCHECKED);
    encode_empty_sattr3(&mut args);

    let reply = call(server, nfs3::NFSPROC3_CREATE, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    assert!(dec.decode_bool().unwrap()); // post_op_fh3 present
    dec.decode_opaque().unwrap()
}

#[tokio::test]
async fn getattr_reports_directory_root() {
    let (fs, server) = server();

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    let reply = call(&server, nfs3::NFSPROC3_GETATTR, args.data()).await;

    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    let attr = decode_fattr3(&mut dec);
    assert_eq!(attr.ftype, 2); // NF3DIR
    assert_eq!(attr.mode, 0o755);
    assert_eq!(dec.remaining(), 0);
}

#[tokio::test]
async fn create_write_read_through_the_wire() {
    let (fs, server) = server();
    let fh = create_file(&server, &fs, "data.bin").await;

    // WRITE 8 bytes at offset 0.
    let payload = b"abcdefgh";
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_u64(0);
    args.encode_u32(payload.len() as u32);
    args.encode_u32(1); // DATA_SYNC
    args.encode_opaque(payload);

    let reply = call(&server, nfs3::NFSPROC3_WRITE, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_wcc_data(&mut dec);
    assert_eq!(dec.decode_u32().unwrap(), payload.len() as u32);
    assert_eq!(dec.decode_u32().unwrap(), 1); // stability echoed
    let verf = dec.decode_u64().unwrap();

    // READ it back.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_u64(0);
    args.encode_u32(64);
    let reply = call(&server, nfs3::NFSPROC3_READ, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_post_op_attr(&mut dec);
    assert_eq!(dec.decode_u32().unwrap(), payload.len() as u32);
    assert!(dec.decode_bool().unwrap()); // eof
    assert_eq!(dec.decode_opaque().unwrap(), payload);

    // COMMIT echoes the same session verifier.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_u64(0);
    args.encode_u32(0);
    let reply = call(&server, nfs3::NFSPROC3_COMMIT, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_wcc_data(&mut dec);
    assert_eq!(dec.decode_u64().unwrap(), verf);
}

#[tokio::test]
async fn write_with_short_data_is_invalid() {
    let (fs, server) = server();
    let fh = create_file(&server, &fs, "short").await;

    // count says 16 but only 4 bytes follow.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_u64(0);
    args.encode_u32(16);
    args.encode_u32(0);
    args.encode_opaque(b"abcd");

    let reply = call(&server, nfs3::NFSPROC3_WRITE, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3ERR_INVAL);
}

#[tokio::test]
async fn guarded_create_refuses_existing() {
    let (fs, server) = server();
    create_file(&server, &fs, "taken").await;

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("taken");
    args.encode_u32(nfs3::CREATE_GUARDED);
    encode_empty_sattr3(&mut args);

    let reply = call(&server, nfs3::NFSPROC3_CREATE, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3ERR_EXIST);
}

#[tokio::test]
async fn setattr_guard_checks_ctime() {
    let (fs, server) = server();
    let fh = create_file(&server, &fs, "guarded").await;

    // Learn the current ctime.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    let reply = call(&server, nfs3::NFSPROC3_GETATTR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    let ctime = decode_fattr3(&mut dec).ctime;

    // Mismatching guard: NOT_SYNC, attributes untouched.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_bool(true);
    args.encode_u32(0o600);
    for _ in 0..3 {
        args.encode_bool(false);
    }
    args.encode_u32(0);
    args.encode_u32(0);
    args.encode_bool(true); // guard present
    args.encode_u32(ctime.0 + 999);
    args.encode_u32(ctime.1);
    let reply = call(&server, nfs3::NFSPROC3_SETATTR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3ERR_NOT_SYNC);

    // Matching guard: accepted.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    args.encode_bool(true);
    args.encode_u32(0o600);
    for _ in 0..3 {
        args.encode_bool(false);
    }
    args.encode_u32(0);
    args.encode_u32(0);
    args.encode_bool(true);
    args.encode_u32(ctime.0);
    args.encode_u32(ctime.1);
    let reply = call(&server, nfs3::NFSPROC3_SETATTR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_wcc_data(&mut dec);

    let mut args = XdrEncoder::new();
    args.encode_opaque(&fh);
    let reply = call(&server, nfs3::NFSPROC3_GETATTR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    assert_eq!(decode_fattr3(&mut dec).mode, 0o600);
}

#[tokio::test]
async fn readdir_rejects_stale_cookieverf() {
    let (fs, server) = server();
    create_file(&server, &fs, "one").await;
    create_file(&server, &fs, "two").await;

    // First page: cookie 0 always accepted; remember the verifier.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_u64(0);
    args.encode_u64(0);
    args.encode_u32(100);
    let reply = call(&server, nfs3::NFSPROC3_READDIR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_post_op_attr(&mut dec);
    let verf = dec.decode_u64().unwrap();
    assert_ne!(verf, 0);

    // Resuming with the right verifier works.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_u64(1);
    args.encode_u64(verf);
    args.encode_u32(100);
    let reply = call(&server, nfs3::NFSPROC3_READDIR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);

    // Mutating the directory invalidates outstanding cookies.
    create_file(&server, &fs, "three").await;
    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_u64(1);
    args.encode_u64(verf);
    args.encode_u32(100);
    let reply = call(&server, nfs3::NFSPROC3_READDIR, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3ERR_BAD_COOKIE);
}

#[tokio::test]
async fn mknod_consumes_args_and_reports_notsupp() {
    let (fs, server) = server();

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("dev0");
    args.encode_u32(4); // NF3CHR
    encode_empty_sattr3(&mut args);
    args.encode_u32(1); // specdata major
    args.encode_u32(9); // specdata minor

    // A clean NOTSUPP reply (rather than a SYSTEM_ERR fault) proves the
    // union body was consumed correctly.
    let reply = call(&server, nfs3::NFSPROC3_MKNOD, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3ERR_NOTSUPP);
    skip_wcc_data(&mut dec);
    assert_eq!(dec.remaining(), 0);
}

#[tokio::test]
async fn rename_moves_and_remove_deletes() {
    let (fs, server) = server();
    create_file(&server, &fs, "from").await;

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("from");
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("to");
    let reply = call(&server, nfs3::NFSPROC3_RENAME, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("to");
    let reply = call(&server, nfs3::NFSPROC3_REMOVE, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);

    // Gone now.
    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    args.encode_string("to");
    let reply = call(&server, nfs3::NFSPROC3_LOOKUP, args.data()).await;
    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), 2); // NFS3ERR_NOENT
}

#[tokio::test]
async fn fsinfo_advertises_expected_limits() {
    let (fs, server) = server();

    let mut args = XdrEncoder::new();
    args.encode_opaque(&root_fh_bytes(&fs));
    let reply = call(&server, nfs3::NFSPROC3_FSINFO, args.data()).await;

    let mut dec = XdrDecoder::new(&reply);
    assert_eq!(dec.decode_u32().unwrap(), NFS3_OK);
    skip_post_op_attr(&mut dec);
    assert_eq!(dec.decode_u32().unwrap(), 1024 * 1024); // rtmax
    dec.decode_u32().unwrap(); // rtpref
    assert_eq!(dec.decode_u32().unwrap(), 4096); // rtmult
    assert_eq!(dec.decode_u32().unwrap(), 1024 * 1024); // wtmax
    dec.decode_u32().unwrap(); // wtpref
    assert_eq!(dec.decode_u32().unwrap(), 4096); // wtmult
    dec.decode_u32().unwrap(); // dtpref
    dec.decode_u64().unwrap(); // maxfilesize
    assert_eq!(dec.decode_u32().unwrap(), 1); // time_delta seconds
    assert_eq!(dec.decode_u32().unwrap(), 0); // time_delta nseconds
    assert_eq!(dec.decode_u32().unwrap(), 0x001B); // properties
}
