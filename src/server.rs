//! Inbound listener: accepts peer connections, verifies the handshake, and
//! applies mirroring requests to the local tree.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::crypto::{self, SessionKeys};
use crate::fs_enum;
use crate::paths;
use crate::protocol::{self, timeouts, RequestKind, SyncRequest, SyncResponse};
use crate::tombstone::TombstoneTable;
use crate::wire::{self, Connection, SecureConnection};

#[derive(Clone)]
pub struct Server {
    root: PathBuf,
    password: String,
    keys: SessionKeys,
    tombstones: TombstoneTable,
}

impl Server {
    pub fn new(root: &Path, password: &str, tombstones: TombstoneTable) -> Self {
        Self {
            root: root.to_path_buf(),
            password: password.to_string(),
            keys: SessionKeys::derive(password),
            tombstones,
        }
    }

    /// Bind and serve forever. A bind failure is fatal; per-connection
    /// errors only close that connection.
    pub fn serve(&self, port: u16) -> Result<()> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("bind :{port}"))?;
        info!("listening on port {port}");
        self.serve_on(listener)
    }

    /// Accept loop over an already-bound listener, one thread per
    /// connection.
    pub fn serve_on(&self, listener: TcpListener) -> Result<()> {
        for conn in listener.incoming() {
            let stream = conn.context("accept")?;
            wire::tune_socket(&stream);
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());

            let server = self.clone();
            std::thread::spawn(move || {
                if let Err(e) = server.handle_connection(stream, &peer) {
                    warn!("[{peer}] connection closed: {e:#}");
                }
            });
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: &str) -> Result<()> {
        let mut conn = Connection::new(stream);
        self.verify_handshake(&mut conn)?;
        info!("[{peer}] peer authenticated");

        let mut conn = conn.into_secure(self.keys.clone());
        self.handle_requests(&mut conn, peer)
    }

    fn verify_handshake(&self, conn: &mut Connection<TcpStream>) -> Result<()> {
        if conn.read_plain()? != protocol::HELLO {
            bail!("unexpected handshake opener");
        }
        conn.write_plain(protocol::OK)?;

        let credential = conn.read_plain()?;
        if credential.len() != crypto::CREDENTIAL_SIZE {
            bail!("credential has wrong size");
        }
        let salt = &credential[..crypto::SALT_SIZE];
        let expected = crypto::salted_hash(self.password.as_bytes(), salt);
        if !crypto::constant_time_eq(&expected, &credential) {
            bail!("credential mismatch");
        }
        conn.write_plain(protocol::OK)?;
        Ok(())
    }

    fn handle_requests(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        peer: &str,
    ) -> Result<()> {
        // Paths materialized empty on this connection. They win their next
        // UPDATE comparison even on an mtime tie, so a create followed by
        // an update with the same timestamp still transfers the body.
        let mut fresh: HashSet<String> = HashSet::new();

        loop {
            let req = SyncRequest::recv(conn)?;
            match req.kind {
                RequestKind::CreateDir => self.handle_create_dir(&req, peer)?,
                RequestKind::CreateFile => self.handle_create_file(&req, peer, &mut fresh)?,
                RequestKind::UpdatePing => self.handle_update(conn, &req, peer, &mut fresh)?,
                RequestKind::Update => bail!("UPDATE without a preceding UPDATE_PING"),
                RequestKind::Delete => self.handle_delete(&req, peer)?,
            }
        }
    }

    fn handle_create_dir(&self, req: &SyncRequest, peer: &str) -> Result<()> {
        let target = paths::resolve(&self.root, &req.rel_path)?;
        if target.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating directory {}", req.rel_path))?;
        fs_enum::set_times(&target, req.mod_time)?;
        info!("[{peer}] created directory {}", req.rel_path);
        Ok(())
    }

    fn handle_create_file(
        &self,
        req: &SyncRequest,
        peer: &str,
        fresh: &mut HashSet<String>,
    ) -> Result<()> {
        let target = paths::resolve(&self.root, &req.rel_path)?;
        if target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&target).with_context(|| format!("creating file {}", req.rel_path))?;
        fs_enum::set_times(&target, req.mod_time)?;
        fresh.insert(req.rel_path.clone());
        info!("[{peer}] created file {}", req.rel_path);
        Ok(())
    }

    /// UPDATE_PING opens and write-locks the target before acknowledging;
    /// the UPDATE leg and any body transfer then run under that lock.
    fn handle_update(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        ping: &SyncRequest,
        peer: &str,
        fresh: &mut HashSet<String>,
    ) -> Result<()> {
        let target = paths::resolve(&self.root, &ping.rel_path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(f) => (f, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&target)
                    .with_context(|| format!("opening {}", ping.rel_path))?;
                (f, false)
            }
            Err(e) => return Err(e).with_context(|| format!("creating {}", ping.rel_path)),
        };
        if created {
            fresh.insert(ping.rel_path.clone());
        }

        // Every read under the lock runs against a deadline so a stalled
        // initiator cannot park the lock forever.
        conn.get_ref()
            .set_read_timeout(Some(Duration::from_secs(timeouts::LOCKED_TRANSFER_SECS)))?;

        debug!("[{peer}] locking {} for update", ping.rel_path);
        file.lock_exclusive()
            .with_context(|| format!("write-locking {}", ping.rel_path))?;
        let result = self.handle_update_locked(conn, ping, peer, fresh, &target, &file);
        let _ = file.unlock();
        debug!("[{peer}] unlocked {}", ping.rel_path);

        let _ = conn.get_ref().set_read_timeout(None);
        result
    }

    fn handle_update_locked(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        ping: &SyncRequest,
        peer: &str,
        fresh: &mut HashSet<String>,
        target: &Path,
        file: &File,
    ) -> Result<()> {
        SyncResponse::ack_ping().send(conn)?;

        let req = SyncRequest::recv(conn)?;
        if req.kind != RequestKind::Update {
            bail!("expected UPDATE after UPDATE_PING, got {:?}", req.kind);
        }
        if req.rel_path != ping.rel_path {
            bail!(
                "UPDATE path {} does not match pinged path {}",
                req.rel_path,
                ping.rel_path
            );
        }

        let local_mod_time = fs_enum::mod_time_nanos(&file.metadata()?);
        let send_file = fresh.contains(&req.rel_path) || local_mod_time < req.mod_time;
        SyncResponse::request_body(send_file).send(conn)?;
        if !send_file {
            debug!("[{peer}] {} is already current", req.rel_path);
            return Ok(());
        }

        debug!("[{peer}] receiving {}", req.rel_path);

        // Stage next to the target so a failed transfer never touches it;
        // the staging file is removed on drop either way.
        let staging_dir = target.parent().unwrap_or(&self.root);
        let mut staged = tempfile::NamedTempFile::new_in(staging_dir)
            .with_context(|| format!("staging file for {}", req.rel_path))?;

        let bytes = conn
            .read_stream(staged.as_file_mut())
            .with_context(|| format!("receiving body for {}", req.rel_path))?;

        // Swap under the lock: truncate and copy the verified content in.
        staged.as_file_mut().seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        std::io::copy(staged.as_file_mut(), &mut &*file)
            .with_context(|| format!("resolving {}", req.rel_path))?;
        fs_enum::set_times(target, req.mod_time)?;
        fresh.remove(&req.rel_path);

        info!("[{peer}] updated {} ({bytes} bytes)", req.rel_path);
        Ok(())
    }

    fn handle_delete(&self, req: &SyncRequest, peer: &str) -> Result<()> {
        let target = paths::resolve(&self.root, &req.rel_path)?;
        let md = match std::fs::symlink_metadata(&target) {
            Ok(md) => md,
            // Already gone
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("stat {}", req.rel_path)),
        };

        // The delete only wins over a strictly older local modification.
        if fs_enum::mod_time_nanos(&md) >= req.del_time {
            debug!("[{peer}] ignoring stale delete for {}", req.rel_path);
            return Ok(());
        }

        self.tombstones.insert(&req.rel_path, req.del_time);
        if md.is_dir() {
            std::fs::remove_dir_all(&target)?;
        } else {
            std::fs::remove_file(&target)?;
        }
        info!("[{peer}] deleted {}", req.rel_path);
        Ok(())
    }
}
