//! Outbound peer link: connect-retry loop, handshake, initial sync, and the
//! watcher-driven event loop that turns local changes into requests.

use std::fs::File;
use std::io::ErrorKind;
use std::net::{IpAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::PeerEntry;
use crate::crypto::{self, SessionKeys};
use crate::fs_enum::{self, list_items};
use crate::paths;
use crate::protocol::{self, SyncRequest, SyncResponse};
use crate::tombstone::TombstoneTable;
use crate::watch::{FsEvent, FsOp, NotifyWatcher, Watcher};
use crate::wire::{self, Connection, SecureConnection};

/// Linear reconnect backoff: the first attempt of a session is immediate,
/// then 3s, growing by 1s per failure, capped at 30s. Reset once a
/// handshake succeeds.
struct Backoff {
    next: Option<Duration>,
}

impl Backoff {
    const FIRST: Duration = Duration::from_secs(3);
    const STEP: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self { next: None }
    }

    fn reset(&mut self) {
        self.next = None;
    }

    /// Current delay, advancing the schedule for the next failure.
    fn advance(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = Some(current.map_or(Self::FIRST, |d| (d + Self::STEP).min(Self::MAX)));
        current
    }

    fn wait(&mut self) {
        if let Some(delay) = self.advance() {
            std::thread::sleep(delay);
        }
    }
}

/// One configured outbound link. Owns its connection and watcher; shares
/// only the tombstone table.
pub struct Tunnel {
    addr: IpAddr,
    port: u16,
    root: PathBuf,
    password: String,
    keys: SessionKeys,
    tombstones: TombstoneTable,
}

impl Tunnel {
    pub fn new(peer: &PeerEntry, root: &Path, tombstones: TombstoneTable) -> Result<Self> {
        let addr: IpAddr = peer
            .ip
            .parse()
            .with_context(|| format!("invalid peer IP {}", peer.ip))?;
        Ok(Self {
            addr,
            port: peer.port,
            root: root.to_path_buf(),
            password: peer.password.clone(),
            keys: SessionKeys::derive(&peer.password),
            tombstones,
        })
    }

    fn label(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Run the link forever: connect, handshake, sync, reconnect.
    pub fn run(&self) {
        let mut backoff = Backoff::new();
        loop {
            backoff.wait();

            let mut watcher = match NotifyWatcher::new() {
                Ok(w) => w,
                Err(e) => {
                    warn!("[{}] creating watcher: {:#}", self.label(), e);
                    continue;
                }
            };
            let mut conn = match self.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[{}] {:#}", self.label(), e);
                    continue;
                }
            };
            backoff.reset();
            info!("[{}] ready", self.label());

            if let Err(e) = self.run_session(&mut conn, &mut watcher) {
                warn!("[{}] session ended: {:#}", self.label(), e);
            }
        }
    }

    /// One connection attempt: TCP connect, plaintext handshake, upgrade.
    pub fn connect(&self) -> Result<SecureConnection<TcpStream>> {
        debug!("[{}] connecting", self.label());
        let stream = TcpStream::connect((self.addr, self.port))
            .with_context(|| format!("connecting to {}", self.label()))?;
        wire::tune_socket(&stream);
        info!("[{}] connected", self.label());

        let mut conn = Connection::new(stream);
        self.handshake(&mut conn)
            .with_context(|| format!("handshake with {}", self.label()))?;
        Ok(conn.into_secure(self.keys.clone()))
    }

    fn handshake(&self, conn: &mut Connection<TcpStream>) -> Result<()> {
        conn.write_plain(protocol::HELLO)?;
        if conn.read_plain()? != protocol::OK {
            bail!("unexpected handshake reply");
        }

        let credential = crypto::salted_hash_with_new_salt(self.password.as_bytes())?;
        conn.write_plain(&credential)?;
        if conn.read_plain()? != protocol::OK {
            bail!("peer rejected credential");
        }
        Ok(())
    }

    /// One connected session: bootstrap the peer, then forward watcher
    /// events until something fails.
    pub fn run_session(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        watcher: &mut dyn Watcher,
    ) -> Result<()> {
        watcher.add(&self.root)?;

        let (files, dirs) = list_items(&self.root)?;
        let tombstones = self.tombstones.snapshot();
        info!(
            "[{}] initial sync: {} dirs, {} files, {} historic deletes",
            self.label(),
            dirs.len(),
            files.len(),
            tombstones.len()
        );

        // Bootstrap order matters: the peer needs the directory tree before
        // deletes and bodies, and historic deletes must land before any
        // update could resurrect the same path.
        for rel in &dirs {
            self.handle_event(conn, watcher, &FsEvent::new(self.root.join(rel), FsOp::Create))?;
        }
        for (rel, _) in &tombstones {
            self.handle_event(conn, watcher, &FsEvent::new(self.root.join(rel), FsOp::Remove))?;
        }
        for rel in &files {
            self.handle_event(conn, watcher, &FsEvent::new(self.root.join(rel), FsOp::Write))?;
        }

        loop {
            let event = watcher.next_event()?;
            self.handle_event(conn, watcher, &event)?;
        }
    }

    /// Translate one event into requests on the wire. Paths outside the
    /// root or non-canonical are dropped here, not sent.
    fn handle_event(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        watcher: &mut dyn Watcher,
        event: &FsEvent,
    ) -> Result<()> {
        let Some(rel) = paths::rel_under_root(&self.root, &event.path) else {
            debug!("[{}] dropping event for {}", self.label(), event.path.display());
            return Ok(());
        };

        match event.op {
            FsOp::Remove | FsOp::Rename => self.send_delete(conn, watcher, &event.path, &rel),
            FsOp::Create if event.path.is_dir() => {
                self.send_create_dir(conn, watcher, &event.path, &rel)
            }
            FsOp::Create => self.send_create_file(conn, &event.path, &rel),
            FsOp::Write => {
                if event.path.is_dir() {
                    return Ok(());
                }
                self.send_update(conn, &event.path, &rel)
            }
        }
    }

    fn send_create_dir(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        watcher: &mut dyn Watcher,
        path: &Path,
        rel: &str,
    ) -> Result<()> {
        self.tombstones.remove(rel);

        // Watch before announcing, so files created inside right away are
        // not missed.
        if let Err(e) = watcher.add(path) {
            debug!("[{}] watching {}: {:#}", self.label(), rel, e);
        }

        let md = match std::fs::metadata(path) {
            Ok(md) => md,
            // Vanished between the event and now; a remove event follows.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };

        debug!("[{}] create-dir {}", self.label(), rel);
        SyncRequest::create_dir(rel, fs_enum::mod_time_nanos(&md)).send(conn)
    }

    fn send_create_file(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        path: &Path,
        rel: &str,
    ) -> Result<()> {
        self.tombstones.remove(rel);

        let md = match std::fs::metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };

        debug!("[{}] create-file {}", self.label(), rel);
        SyncRequest::create_file(rel, fs_enum::mod_time_nanos(&md)).send(conn)?;
        self.send_update(conn, path, rel)
    }

    fn send_update(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        path: &Path,
        rel: &str,
    ) -> Result<()> {
        self.tombstones.remove(rel);

        // Take the local read lock before pinging: once the ping is out the
        // peer expects an UPDATE next, so the file must still be openable.
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
        };
        file.lock_shared()
            .with_context(|| format!("read-locking {}", path.display()))?;
        let result = self.send_update_locked(conn, &file, rel);
        let _ = file.unlock();
        result
    }

    fn send_update_locked(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        file: &File,
        rel: &str,
    ) -> Result<()> {
        let md = file.metadata()?;
        if md.is_dir() {
            return Ok(());
        }
        let mod_time = fs_enum::mod_time_nanos(&md);

        // Ping so the peer takes its write lock before we commit to a
        // transfer.
        SyncRequest::update_ping(rel).send(conn)?;
        if !SyncResponse::recv(conn)?.ping_ok {
            bail!("peer refused update ping for {rel}");
        }

        SyncRequest::update(rel, mod_time).send(conn)?;
        if !SyncResponse::recv(conn)?.send_file {
            debug!("[{}] {} already current on peer", self.label(), rel);
            return Ok(());
        }

        debug!("[{}] transferring {} ({} bytes)", self.label(), rel, md.len());
        conn.write_stream(&mut &*file, md.len())?;
        debug!("[{}] transfer complete for {}", self.label(), rel);
        Ok(())
    }

    fn send_delete(
        &self,
        conn: &mut SecureConnection<TcpStream>,
        watcher: &mut dyn Watcher,
        path: &Path,
        rel: &str,
    ) -> Result<()> {
        // Keep the first observed deletion time across reconnects.
        let del_time = self.tombstones.record(rel, fs_enum::now_nanos());
        watcher.remove(path);

        debug!("[{}] delete {}", self.label(), rel);
        SyncRequest::delete(rel, del_time).send(conn)
    }
}
