//! Change observation behind a small trait, so tunnels can be driven by the
//! real filesystem watcher or by synthetic bootstrap events.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use anyhow::{anyhow, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

/// Watcher operations, reduced to what the sync pipeline distinguishes.
/// A rename is modeled as a delete of the old name; the watcher reports the
/// new name as a separate create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Create,
    Write,
    Remove,
    Rename,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub op: FsOp,
}

impl FsEvent {
    pub fn new(path: PathBuf, op: FsOp) -> Self {
        Self { path, op }
    }
}

/// A lazy, infinite stream of filesystem events plus the ability to extend
/// the watched set as new directories appear.
pub trait Watcher: Send {
    /// Watch one directory (non-recursive; new subdirectories are added as
    /// their create events arrive).
    fn add(&mut self, path: &Path) -> Result<()>;

    /// Stop watching a path. Unwatching something already gone is not an
    /// error.
    fn remove(&mut self, path: &Path);

    /// Block until the next event. An error means the watcher died and the
    /// session must be torn down.
    fn next_event(&mut self) -> Result<FsEvent>;
}

/// `notify`-backed watcher.
pub struct NotifyWatcher {
    inner: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    pending: VecDeque<FsEvent>,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = channel();
        let inner = notify::recommended_watcher(tx)?;
        Ok(Self { inner, rx, pending: VecDeque::new() })
    }

    fn translate(event: notify::Event, out: &mut VecDeque<FsEvent>) {
        let op = match event.kind {
            EventKind::Create(_) => FsOp::Create,
            EventKind::Remove(_) => FsOp::Remove,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FsOp::Rename,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsOp::Create,
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Both-ended rename: old name first, then the new one.
                let mut paths = event.paths.into_iter();
                if let Some(old) = paths.next() {
                    out.push_back(FsEvent::new(old, FsOp::Rename));
                }
                if let Some(new) = paths.next() {
                    out.push_back(FsEvent::new(new, FsOp::Create));
                }
                return;
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => FsOp::Write,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
        };

        for path in event.paths {
            out.push_back(FsEvent::new(path, op));
        }
    }
}

impl Watcher for NotifyWatcher {
    fn add(&mut self, path: &Path) -> Result<()> {
        self.inner.watch(path, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) {
        let _ = self.inner.unwatch(path);
    }

    fn next_event(&mut self) -> Result<FsEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let event = self
                .rx
                .recv()
                .map_err(|_| anyhow!("watcher channel closed"))??;
            Self::translate(event, &mut self.pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn translate(kind: EventKind, paths: &[&str]) -> Vec<(PathBuf, FsOp)> {
        let mut event = notify::Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        let mut out = VecDeque::new();
        NotifyWatcher::translate(event, &mut out);
        out.into_iter().map(|e| (e.path, e.op)).collect()
    }

    #[test]
    fn create_and_remove_map_directly() {
        assert_eq!(
            translate(EventKind::Create(CreateKind::File), &["/r/a"]),
            [(PathBuf::from("/r/a"), FsOp::Create)]
        );
        assert_eq!(
            translate(EventKind::Remove(RemoveKind::Any), &["/r/a"]),
            [(PathBuf::from("/r/a"), FsOp::Remove)]
        );
    }

    #[test]
    fn data_modification_is_a_write() {
        assert_eq!(
            translate(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/r/a"]
            ),
            [(PathBuf::from("/r/a"), FsOp::Write)]
        );
    }

    #[test]
    fn rename_splits_into_delete_and_create() {
        assert_eq!(
            translate(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/r/old"]
            ),
            [(PathBuf::from("/r/old"), FsOp::Rename)]
        );
        assert_eq!(
            translate(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/r/new"]
            ),
            [(PathBuf::from("/r/new"), FsOp::Create)]
        );
        assert_eq!(
            translate(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/r/old", "/r/new"]
            ),
            [
                (PathBuf::from("/r/old"), FsOp::Rename),
                (PathBuf::from("/r/new"), FsOp::Create),
            ]
        );
    }

    #[test]
    fn noise_is_dropped() {
        assert!(translate(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/r/a"]
        )
        .is_empty());
        assert!(translate(EventKind::Any, &["/r/a"]).is_empty());
    }
}
