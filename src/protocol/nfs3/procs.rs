//! NFSv3 procedure implementations (RFC 1813 §3.3).

use tracing::debug;

use super::*;

/// Failure tail for procedures whose fail-case reply carries wcc_data of a
/// handle we could not even decode.
fn encode_empty_wcc(reply: &mut XdrEncoder) {
    reply.encode_bool(false); // no pre-op attributes
    reply.encode_bool(false); // no post-op attributes
}

impl Nfs3Server {
    /// RFC 1813 §3.3.1 GETATTR.
    pub(super) fn proc_getattr(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let Some(fh) = decode_fh(args)? else {
            encode_status(reply, NfsStat3::BadHandle);
            return Ok(());
        };
        match self.vfs().getattr(&fh) {
            Ok(attr) => {
                encode_status(reply, NfsStat3::Ok);
                encode_fattr3(reply, &attr);
            }
            Err(status) => encode_status(reply, status),
        }
        Ok(())
    }

    /// RFC 1813 §3.3.2 SETATTR, including the ctime guard.
    pub(super) fn proc_setattr(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let sa = decode_sattr3(args)?;
        let guard = if args.decode_bool()? {
            Some(NfsTime { seconds: args.decode_u32()?, nseconds: args.decode_u32()? })
        } else {
            None
        };

        let Some(fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&fh).ok();

        if let Some(guard_ctime) = guard {
            let Some(pre) = pre.as_ref() else {
                encode_status(reply, NfsStat3::Stale);
                encode_wcc_data(reply, self.vfs(), &fh, None);
                return Ok(());
            };
            if pre.ctime != guard_ctime {
                encode_status(reply, NfsStat3::NotSync);
                encode_wcc_data(reply, self.vfs(), &fh, Some(pre));
                return Ok(());
            }
        }

        let status = match self.vfs().setattr(&fh, &sa) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.3 LOOKUP.
    pub(super) fn proc_lookup(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false); // dir post_op_attr
            return Ok(());
        };

        match self.vfs().lookup(&dir_fh, &name) {
            Ok((obj_fh, obj_attr)) => {
                encode_status(reply, NfsStat3::Ok);
                reply.encode_opaque(obj_fh.as_bytes());
                reply.encode_bool(true);
                encode_fattr3(reply, &obj_attr);
            }
            Err(status) => encode_status(reply, status),
        }
        encode_post_op_attr(reply, self.vfs(), &dir_fh);
        Ok(())
    }

    /// RFC 1813 §3.3.4 ACCESS.
    pub(super) fn proc_access(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let requested = args.decode_u32()?;
        let Some(fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };

        match self.vfs().access(&fh, requested) {
            Ok(granted) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_u32(granted);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.5 READLINK.
    pub(super) fn proc_readlink(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let Some(fh) = decode_fh(args)? else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };
        match self.vfs().readlink(&fh) {
            Ok(target) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_string(&target);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.6 READ.
    pub(super) fn proc_read(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let offset = args.decode_u64()?;
        let count = args.decode_u32()?;
        let Some(fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };

        match self.vfs().read(&fh, offset, count) {
            Ok((data, eof)) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_u32(data.len() as u32);
                reply.encode_bool(eof);
                reply.encode_opaque(&data);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.7 WRITE.
    pub(super) fn proc_write(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let offset = args.decode_u64()?;
        let count = args.decode_u32()?;
        let stable = args.decode_u32()?;
        let data = args.decode_opaque()?;
        debug!("WRITE offset={offset} count={count}");

        let Some(fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&fh).ok();

        if data.len() < count as usize {
            encode_status(reply, NfsStat3::Inval);
            encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
            return Ok(());
        }

        match self.vfs().write(&fh, offset, &data[..count as usize]) {
            Ok(written) => {
                encode_status(reply, NfsStat3::Ok);
                encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
                reply.encode_u32(written);
                reply.encode_u32(stable); // echo the requested stability
                reply.encode_u64(self.write_verifier());
            }
            Err(status) => {
                encode_status(reply, status);
                encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.8 CREATE with the three createmodes.
    pub(super) fn proc_create(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        let createmode = args.decode_u32()?;

        let mut mode = 0o644;
        if createmode == CREATE_EXCLUSIVE {
            // createverf3: consumed off the wire; replay detection is an
            // NFSv4 concern (EXCLUSIVE4 stores it in the timestamps).
            args.decode_u64()?;
        } else {
            let sa = decode_sattr3(args)?;
            if let Some(m) = sa.mode {
                mode = m;
            }
        }

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();

        if createmode == CREATE_GUARDED && self.vfs().lookup(&dir_fh, &name).is_ok() {
            encode_status(reply, NfsStat3::Exist);
            encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
            return Ok(());
        }

        match self.vfs().create(&dir_fh, &name, mode) {
            Ok((obj_fh, obj_attr)) => {
                encode_status(reply, NfsStat3::Ok);
                reply.encode_bool(true);
                reply.encode_opaque(obj_fh.as_bytes());
                reply.encode_bool(true);
                encode_fattr3(reply, &obj_attr);
            }
            Err(status) => encode_status(reply, status),
        }
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.9 MKDIR.
    pub(super) fn proc_mkdir(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        let sa = decode_sattr3(args)?;
        let mode = sa.mode.unwrap_or(0o755);

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        match self.vfs().mkdir(&dir_fh, &name, mode) {
            Ok((obj_fh, obj_attr)) => {
                encode_status(reply, NfsStat3::Ok);
                reply.encode_bool(true);
                reply.encode_opaque(obj_fh.as_bytes());
                reply.encode_bool(true);
                encode_fattr3(reply, &obj_attr);
            }
            Err(status) => encode_status(reply, status),
        }
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.10 SYMLINK.
    pub(super) fn proc_symlink(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        decode_sattr3(args)?; // symlink attributes are not applied
        let target = args.decode_string()?;

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        match self.vfs().symlink(&dir_fh, &name, &target) {
            Ok((obj_fh, obj_attr)) => {
                encode_status(reply, NfsStat3::Ok);
                reply.encode_bool(true);
                reply.encode_opaque(obj_fh.as_bytes());
                reply.encode_bool(true);
                encode_fattr3(reply, &obj_attr);
            }
            Err(status) => encode_status(reply, status),
        }
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.11 MKNOD. The union body is fully consumed so the
    /// decoder stays clean, then the VFS gets to refuse it.
    pub(super) fn proc_mknod(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;

        let ftype = args.decode_u32()?;
        match ftype {
            3 | 4 => {
                // NF3BLK / NF3CHR: devicedata3 = sattr3 + specdata3
                decode_sattr3(args)?;
                args.decode_u32()?;
                args.decode_u32()?;
            }
            6 | 7 => {
                // NF3SOCK / NF3FIFO: sattr3 only
                decode_sattr3(args)?;
            }
            _ => {}
        }

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        let status = match self.vfs().mknod(&dir_fh, &name) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.12 REMOVE.
    pub(super) fn proc_remove(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        let status = match self.vfs().remove(&dir_fh, &name) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.13 RMDIR.
    pub(super) fn proc_rmdir(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let name = args.decode_string()?;
        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        let status = match self.vfs().rmdir(&dir_fh, &name) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.14 RENAME.
    pub(super) fn proc_rename(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let from_fh = decode_fh(args)?;
        let from_name = args.decode_string()?;
        let to_fh = decode_fh(args)?;
        let to_name = args.decode_string()?;

        let (Some(from_dir), Some(to_dir)) = (from_fh, to_fh) else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let from_pre = self.vfs().getattr(&from_dir).ok();
        let to_pre = self.vfs().getattr(&to_dir).ok();

        let status = match self.vfs().rename(&from_dir, &from_name, &to_dir, &to_name) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_wcc_data(reply, self.vfs(), &from_dir, from_pre.as_ref());
        encode_wcc_data(reply, self.vfs(), &to_dir, to_pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.15 LINK.
    pub(super) fn proc_link(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let file_fh = decode_fh(args)?;
        let dir_fh = decode_fh(args)?;
        let name = args.decode_string()?;

        let (Some(file_fh), Some(dir_fh)) = (file_fh, dir_fh) else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&dir_fh).ok();
        let status = match self.vfs().link(&file_fh, &dir_fh, &name) {
            Ok(()) => NfsStat3::Ok,
            Err(s) => s,
        };
        encode_status(reply, status);
        encode_post_op_attr(reply, self.vfs(), &file_fh);
        encode_wcc_data(reply, self.vfs(), &dir_fh, pre.as_ref());
        Ok(())
    }

    /// RFC 1813 §3.3.16 READDIR.
    pub(super) fn proc_readdir(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let cookie = args.decode_u64()?;
        let client_verf = args.decode_u64()?;
        let dircount = args.decode_u32()?;

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };

        let verf = directory_cookieverf(self.vfs(), &dir_fh);
        if cookie != 0 && client_verf != 0 && client_verf != verf {
            encode_status(reply, NfsStat3::BadCookie);
            encode_post_op_attr(reply, self.vfs(), &dir_fh);
            return Ok(());
        }

        match self.vfs().readdir(&dir_fh, cookie, dircount.min(READDIR_MAX_ENTRIES)) {
            Ok((entries, eof)) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &dir_fh);
                reply.encode_u64(verf);
                for e in &entries {
                    reply.encode_bool(true);
                    reply.encode_u64(e.fileid);
                    reply.encode_string(&e.name);
                    reply.encode_u64(e.cookie);
                }
                reply.encode_bool(false);
                reply.encode_bool(eof);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &dir_fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.17 READDIRPLUS.
    pub(super) fn proc_readdirplus(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let cookie = args.decode_u64()?;
        let client_verf = args.decode_u64()?;
        let dircount = args.decode_u32()?;
        args.decode_u32()?; // maxcount

        let Some(dir_fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };

        let verf = directory_cookieverf(self.vfs(), &dir_fh);
        if cookie != 0 && client_verf != 0 && client_verf != verf {
            encode_status(reply, NfsStat3::BadCookie);
            encode_post_op_attr(reply, self.vfs(), &dir_fh);
            return Ok(());
        }

        match self.vfs().readdir(&dir_fh, cookie, dircount.min(READDIR_MAX_ENTRIES)) {
            Ok((entries, eof)) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &dir_fh);
                reply.encode_u64(verf);
                for e in &entries {
                    reply.encode_bool(true);
                    reply.encode_u64(e.fileid);
                    reply.encode_string(&e.name);
                    reply.encode_u64(e.cookie);
                    // name_attributes and name_handle
                    match self.vfs().lookup(&dir_fh, &e.name) {
                        Ok((entry_fh, entry_attr)) => {
                            reply.encode_bool(true);
                            encode_fattr3(reply, &entry_attr);
                            reply.encode_bool(true);
                            reply.encode_opaque(entry_fh.as_bytes());
                        }
                        Err(_) => {
                            reply.encode_bool(false);
                            reply.encode_bool(false);
                        }
                    }
                }
                reply.encode_bool(false);
                reply.encode_bool(eof);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &dir_fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.18 FSSTAT.
    pub(super) fn proc_fsstat(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let Some(fh) = decode_fh(args)? else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };
        match self.vfs().fsstat(&fh) {
            Ok(st) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_u64(st.total_bytes);
                reply.encode_u64(st.free_bytes);
                reply.encode_u64(st.avail_bytes);
                reply.encode_u64(st.total_files);
                reply.encode_u64(st.free_files);
                reply.encode_u64(st.avail_files);
                reply.encode_u32(0); // invarsec
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.19 FSINFO.
    pub(super) fn proc_fsinfo(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let Some(fh) = decode_fh(args)? else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };
        match self.vfs().fsinfo(&fh) {
            Ok(info) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_u32(info.rtmax);
                reply.encode_u32(info.rtpref);
                reply.encode_u32(4096); // rtmult: block size
                reply.encode_u32(info.wtmax);
                reply.encode_u32(info.wtpref);
                reply.encode_u32(4096); // wtmult
                reply.encode_u32(info.dtpref);
                reply.encode_u64(info.maxfilesize);
                // time_delta
                reply.encode_u32(1);
                reply.encode_u32(0);
                // FSF3_LINK | FSF3_SYMLINK | FSF3_HOMOGENEOUS | FSF3_CANSETTIME
                reply.encode_u32(0x001B);
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.20 PATHCONF.
    pub(super) fn proc_pathconf(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let Some(fh) = decode_fh(args)? else {
            encode_status(reply, NfsStat3::BadHandle);
            reply.encode_bool(false);
            return Ok(());
        };
        match self.vfs().pathconf(&fh) {
            Ok(pc) => {
                encode_status(reply, NfsStat3::Ok);
                encode_post_op_attr(reply, self.vfs(), &fh);
                reply.encode_u32(pc.linkmax);
                reply.encode_u32(pc.name_max);
                reply.encode_bool(true); // no_trunc
                reply.encode_bool(true); // chown_restricted
                reply.encode_bool(false); // case_insensitive
                reply.encode_bool(true); // case_preserving
            }
            Err(status) => {
                encode_status(reply, status);
                encode_post_op_attr(reply, self.vfs(), &fh);
            }
        }
        Ok(())
    }

    /// RFC 1813 §3.3.21 COMMIT.
    pub(super) fn proc_commit(
        &self,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> XdrResult<()> {
        let fh = decode_fh(args)?;
        let offset = args.decode_u64()?;
        let count = args.decode_u32()?;

        let Some(fh) = fh else {
            encode_status(reply, NfsStat3::BadHandle);
            encode_empty_wcc(reply);
            return Ok(());
        };

        let pre = self.vfs().getattr(&fh).ok();
        match self.vfs().commit(&fh, offset, count) {
            Ok(()) => {
                encode_status(reply, NfsStat3::Ok);
                encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
                reply.encode_u64(self.write_verifier());
            }
            Err(status) => {
                encode_status(reply, status);
                encode_wcc_data(reply, self.vfs(), &fh, pre.as_ref());
            }
        }
        Ok(())
    }
}
