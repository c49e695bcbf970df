//! Filesystem wrapper that announces every mutation on the event bus.

use std::io;
use std::path::Path;
use std::sync::Arc;

use ferry_core::{CopyControl, CopyError, FileEntry, Filesystem};

use crate::events::{Event, EventBus};

/// A [`Filesystem`] that publishes `DirectoryCreated`, `EntryRemoved` and
/// `EntryMoved` after the wrapped filesystem succeeds.
#[derive(Clone)]
pub struct ObservedFs {
    inner: Arc<dyn Filesystem>,
    bus: EventBus,
}

impl ObservedFs {
    /// Wrap `inner`, publishing on `bus`.
    pub fn new(inner: Arc<dyn Filesystem>, bus: EventBus) -> Self {
        Self { inner, bus }
    }
}

impl Filesystem for ObservedFs {
    fn list(&self, path: &Path) -> io::Result<Vec<FileEntry>> {
        self.inner.list(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileEntry> {
        self.inner.stat(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        let existed = self.inner.exists(path);
        self.inner.mkdir(path)?;
        if !existed {
            self.bus.publish(Event::DirectoryCreated {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)?;
        self.bus.publish(Event::EntryRemoved {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        self.inner.rename(src, dst)?;
        self.bus.publish(Event::EntryMoved {
            old: src.to_path_buf(),
            new: dst.to_path_buf(),
        });
        Ok(())
    }

    fn copy(
        &self,
        src: &Path,
        dst: &Path,
        control: &mut dyn CopyControl,
    ) -> Result<u64, CopyError> {
        self.inner.copy(src, dst, control)
    }

    fn size_of(&self, path: &Path) -> io::Result<u64> {
        self.inner.size_of(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::LocalFs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mutations_are_published() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let fs = ObservedFs::new(Arc::new(LocalFs), bus);

        let dir = temp.path().join("made");
        fs.mkdir(&dir).unwrap();
        // Already present, no second announcement.
        fs.mkdir(&dir).unwrap();
        std::fs::write(dir.join("a"), b"a").unwrap();
        fs.rename(&dir.join("a"), &dir.join("b")).unwrap();
        fs.remove(&dir).unwrap();

        assert!(matches!(
            rx.recv().await.unwrap().event,
            Event::DirectoryCreated { ref path } if *path == dir
        ));
        assert!(matches!(rx.recv().await.unwrap().event, Event::EntryMoved { .. }));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            Event::EntryRemoved { ref path } if *path == dir
        ));
    }

    #[test]
    fn test_failed_mutation_is_silent() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let fs = ObservedFs::new(Arc::new(LocalFs), bus);

        assert!(fs.remove(&temp.path().join("missing")).is_err());
        assert!(rx.try_recv().is_err());
    }
}
