use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex as PLMutex;
use tokio::select;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::mem_rowset::MemRowSet;
use crate::rowset::DiskRowSet;

/// One immutable snapshot of the tablet's row-set registry: the active
/// MemRowSet plus every live DiskRowSet, keyed by id.
pub struct TabletVersion {
    pub epoch: u64,
    pub mrs: Arc<MemRowSet>,
    pub rowsets: BTreeMap<u32, Arc<DiskRowSet>>,
}

/// A structural change to the registry.
pub enum RegistryOp {
    /// Publish a successor MemRowSet (the previous one was flushed).
    SwapMemRowSet(Arc<MemRowSet>),
    AddRowSet(Arc<DiskRowSet>),
    RemoveRowSet(u32),
}

impl std::fmt::Debug for RegistryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SwapMemRowSet(_) => f.write_str("RegistryOp::SwapMemRowSet"),
            Self::AddRowSet(rs) => f
                .debug_tuple("RegistryOp::AddRowSet")
                .field(&rs.rowset_id())
                .finish(),
            Self::RemoveRowSet(id) => {
                f.debug_tuple("RegistryOp::RemoveRowSet").field(id).finish()
            }
        }
    }
}

#[derive(Default)]
struct VersionInner {
    current: Option<Arc<TabletVersion>>,
    /// Reference count of each pinned epoch.
    ref_cnt: HashMap<u64, usize>,
    /// Row set directories that became unreferenced at each epoch.
    deletions_to_apply: HashMap<u64, Vec<PathBuf>>,
    epoch: u64,
}

/// Publishes registry versions by atomic pointer swap and defers physical
/// deletion of retired row set directories until no pinned epoch can still
/// reach them.
///
/// Every scan pins the epoch it opened at; a row set logically removed at a
/// later epoch stays on disk until the last pin at or before its removal
/// drops. Vacuuming then deletes the directories.
pub struct VersionManager {
    inner: Arc<PLMutex<VersionInner>>,
    tx: tokio::sync::mpsc::UnboundedSender<()>,
    rx: PLMutex<Option<tokio::sync::mpsc::UnboundedReceiver<()>>>,
}

impl VersionManager {
    pub fn new(initial_mrs: Arc<MemRowSet>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(PLMutex::new(VersionInner::default())),
            tx,
            rx: PLMutex::new(Some(rx)),
        };
        manager.inner.lock().current = Some(Arc::new(TabletVersion {
            epoch: 0,
            mrs: initial_mrs,
            rowsets: BTreeMap::new(),
        }));
        manager
    }

    /// Apply structural changes and publish a new epoch.
    pub fn commit(&self, ops: Vec<RegistryOp>) -> u64 {
        let mut inner = self.inner.lock();
        let current = inner.current.as_ref().unwrap();
        let mut mrs = current.mrs.clone();
        let mut rowsets = current.rowsets.clone();
        let mut retired_dirs = vec![];

        for op in ops {
            match op {
                RegistryOp::SwapMemRowSet(next) => mrs = next,
                RegistryOp::AddRowSet(rowset) => {
                    let prev = rowsets.insert(rowset.rowset_id(), rowset);
                    debug_assert!(prev.is_none(), "rowset id reused");
                }
                RegistryOp::RemoveRowSet(id) => match rowsets.remove(&id) {
                    Some(rowset) => retired_dirs.push(rowset.dir().to_path_buf()),
                    None => warn!(rowset_id = id, "removal of unknown rowset"),
                },
            }
        }

        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.current = Some(Arc::new(TabletVersion {
            epoch,
            mrs,
            rowsets,
        }));
        if !retired_dirs.is_empty() {
            inner.deletions_to_apply.insert(epoch, retired_dirs);
        }
        epoch
    }

    /// The latest registry snapshot, unpinned. Only safe to use from contexts
    /// serialized with structural changes (the applier and maintenance ops).
    pub fn current(&self) -> Arc<TabletVersion> {
        self.inner.lock().current.as_ref().unwrap().clone()
    }

    /// Pin the latest epoch for reading. Row sets visible in the returned
    /// version stay on disk until the pin drops.
    pub fn pin(&self) -> VersionPin {
        let mut inner = self.inner.lock();
        let version = inner.current.as_ref().unwrap().clone();
        *inner.ref_cnt.entry(version.epoch).or_default() += 1;
        VersionPin {
            version,
            inner: self.inner.clone(),
            tx: self.tx.clone(),
        }
    }

    fn find_vacuum(&self) -> Vec<PathBuf> {
        let mut inner = self.inner.lock();
        let min_pinned_epoch = inner.ref_cnt.keys().min().cloned();
        let vacuum_epoch = min_pinned_epoch.unwrap_or(inner.epoch);
        let can_apply = |epoch: u64| epoch <= vacuum_epoch;

        let mut deletions = vec![];
        for (epoch, dirs) in &inner.deletions_to_apply {
            if can_apply(*epoch) {
                deletions.extend(dirs.iter().cloned());
            }
        }
        inner.deletions_to_apply.retain(|epoch, _| !can_apply(*epoch));
        deletions
    }

    /// Physically delete every retired directory no pin can still reach.
    pub async fn do_vacuum(&self) -> EngineResult<()> {
        for dir in self.find_vacuum() {
            info!(path = %dir.display(), "vacuuming retired rowset");
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Background vacuum loop: runs on every unpin notification until `stop`.
    pub async fn run(
        self: &Arc<Self>,
        mut stop: tokio::sync::mpsc::UnboundedReceiver<()>,
    ) -> EngineResult<()> {
        let mut notifier = self.rx.lock().take().expect("vacuum loop started twice");
        loop {
            select! {
                Some(_) = notifier.recv() => self.do_vacuum().await?,
                _ = stop.recv() => break,
            }
        }
        Ok(())
    }
}

/// A pinned registry snapshot. Dropping it may make retired row sets
/// reclaimable.
pub struct VersionPin {
    pub version: Arc<TabletVersion>,
    inner: Arc<PLMutex<VersionInner>>,
    tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl Drop for VersionPin {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let epoch = self.version.epoch;
        let ref_cnt = inner.ref_cnt.get_mut(&epoch).expect("epoch not pinned");
        *ref_cnt -= 1;
        if *ref_cnt == 0 {
            inner.ref_cnt.remove(&epoch);
            if epoch != inner.epoch {
                let _ = self.tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_swap_isolated_from_pins() {
        let manager = VersionManager::new(Arc::new(MemRowSet::new()));
        let pinned = manager.pin();
        assert_eq!(pinned.version.epoch, 0);

        let successor = Arc::new(MemRowSet::new());
        manager.commit(vec![RegistryOp::SwapMemRowSet(successor.clone())]);
        // The pin still sees the old version; the current pointer moved on.
        assert_eq!(pinned.version.epoch, 0);
        assert_eq!(manager.current().epoch, 1);
        assert!(Arc::ptr_eq(&manager.current().mrs, &successor));
    }

    #[tokio::test]
    async fn test_vacuum_waits_for_pins() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path().join("rs-1");
        std::fs::create_dir(&dir).unwrap();

        let manager = VersionManager::new(Arc::new(MemRowSet::new()));
        // Fake the retirement bookkeeping directly: register a deletion at
        // epoch 1 while a pin holds epoch 0.
        let pin = manager.pin();
        {
            let mut inner = manager.inner.lock();
            inner.epoch = 1;
            inner.deletions_to_apply.insert(1, vec![dir.clone()]);
        }
        manager.do_vacuum().await.unwrap();
        assert!(dir.exists(), "pinned epoch must block vacuum");

        drop(pin);
        manager.do_vacuum().await.unwrap();
        assert!(!dir.exists());
    }
}
