//! Huge-page Allocator: hugetlbfs mount and pool reservation.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use nicprep_common::{HostPrepError, HostPrepResult, HugepageSpec, ResourceStore};

use crate::journal::JournalEntry;

/// Ensures huge page memory is mounted and reserved.
pub struct HugepageMgr {
    store: Arc<dyn ResourceStore>,
}

impl HugepageMgr {
    /// Creates an allocator over `store`.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Mounts hugetlbfs at `spec.mount_path` unless it is already mounted.
    #[instrument(skip_all, fields(path = %spec.mount_path.display()))]
    pub async fn ensure_mounted(
        &self,
        spec: &HugepageSpec,
    ) -> HostPrepResult<Option<JournalEntry>> {
        if self.store.is_hugetlbfs_mounted(&spec.mount_path).await? {
            debug!("hugetlbfs already mounted");
            return Ok(None);
        }

        self.store
            .mount_hugetlbfs(&spec.mount_path, spec.page_size_kb)
            .await
            .map_err(|e| HostPrepError::HugepageMountFailed {
                path: spec.mount_path.clone(),
                reason: e.to_string(),
            })?;

        info!(page_size_kb = spec.page_size_kb, "Mounted hugetlbfs");
        Ok(Some(JournalEntry::HugetlbfsMounted {
            path: spec.mount_path.clone(),
            page_size_kb: spec.page_size_kb,
        }))
    }

    /// Sets the pool for (`spec.page_size_kb`, `spec.node`) to `spec.count`.
    ///
    /// The count is written as an absolute value and read back. A pool
    /// already holding between [`HugepageSpec::required`] and `spec.count`
    /// pages is left alone. A grant below the required count is
    /// `InsufficientHugepages`; the granted pages stay reserved and nothing
    /// is journaled. Not retried.
    #[instrument(skip_all, fields(page_size_kb = spec.page_size_kb, node = %spec.node_label()))]
    pub async fn ensure_reserved(
        &self,
        spec: &HugepageSpec,
    ) -> HostPrepResult<Option<JournalEntry>> {
        if !self.store.is_hugetlbfs_mounted(&spec.mount_path).await? {
            return Err(HostPrepError::HugepageMountFailed {
                path: spec.mount_path.clone(),
                reason: "not mounted; refusing to reserve pages".to_string(),
            });
        }

        let previous = self
            .store
            .hugepage_count(spec.page_size_kb, spec.node)
            .await?;
        if spec.is_met_by(previous) {
            debug!(count = previous, "Reservation already satisfied");
            return Ok(None);
        }

        self.store
            .set_hugepage_count(spec.page_size_kb, spec.node, spec.count)
            .await?;
        let granted = self
            .store
            .hugepage_count(spec.page_size_kb, spec.node)
            .await?;

        if granted < spec.required() {
            warn!(
                requested = spec.count,
                required = spec.required(),
                granted,
                "Kernel granted too few huge pages"
            );
            return Err(HostPrepError::InsufficientHugepages {
                page_size_kb: spec.page_size_kb,
                node: spec.node_label(),
                requested: spec.count,
                required: spec.required(),
                granted,
            });
        }
        if granted < spec.count {
            warn!(
                requested = spec.count,
                granted, "Huge page grant below request, above minimum"
            );
        }

        info!(previous, granted, "Reserved huge pages");
        Ok(Some(JournalEntry::HugepagesReserved {
            page_size_kb: spec.page_size_kb,
            node: spec.node,
            previous,
        }))
    }

    /// Writes a pool back to an earlier count.
    #[instrument(skip(self))]
    pub async fn restore_count(
        &self,
        page_size_kb: u64,
        node: Option<u32>,
        previous: u64,
    ) -> HostPrepResult<()> {
        self.store
            .set_hugepage_count(page_size_kb, node, previous)
            .await?;
        info!("Restored huge page count");
        Ok(())
    }

    /// Unmounts a hugetlbfs mount this tool created.
    #[instrument(skip(self))]
    pub async fn unmount(&self, path: &Path) -> HostPrepResult<()> {
        self.store.unmount_hugetlbfs(path).await?;
        info!("Unmounted hugetlbfs");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::{e1000_host, hugepages_2m, HUGE_MOUNT};
    use nicprep_test::FakeHost;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn mgr(host: &FakeHost) -> HugepageMgr {
        HugepageMgr::new(Arc::new(host.clone()))
    }

    #[tokio::test]
    async fn test_mount_then_reserve() {
        let host = e1000_host();
        let spec = hugepages_2m(1024);
        let m = mgr(&host);

        assert_eq!(
            m.ensure_mounted(&spec).await.unwrap(),
            Some(JournalEntry::HugetlbfsMounted {
                path: PathBuf::from(HUGE_MOUNT),
                page_size_kb: 2048
            })
        );
        assert_eq!(m.ensure_mounted(&spec).await.unwrap(), None);

        assert_eq!(
            m.ensure_reserved(&spec).await.unwrap(),
            Some(JournalEntry::HugepagesReserved {
                page_size_kb: 2048,
                node: None,
                previous: 0
            })
        );
        assert_eq!(host.reserved_pages(2048, None), 1024);
        assert_eq!(m.ensure_reserved(&spec).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reserve_requires_mount() {
        let host = e1000_host();
        let err = mgr(&host)
            .ensure_reserved(&hugepages_2m(64))
            .await
            .unwrap_err();
        assert!(matches!(err, HostPrepError::HugepageMountFailed { .. }));
        assert_eq!(host.reserved_pages(2048, None), 0);
    }

    #[tokio::test]
    async fn test_shortfall_keeps_granted_count() {
        let host = FakeHost::new()
            .with_mount(HUGE_MOUNT)
            .with_pool(2048, None, 16, 300);

        let err = mgr(&host)
            .ensure_reserved(&hugepages_2m(1024))
            .await
            .unwrap_err();
        match err {
            HostPrepError::InsufficientHugepages {
                requested,
                required,
                granted,
                ..
            } => {
                assert_eq!((requested, required, granted), (1024, 1024, 300));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(host.reserved_pages(2048, None), 300);
    }

    #[tokio::test]
    async fn test_partial_grant_above_minimum() {
        let host = FakeHost::new()
            .with_mount(HUGE_MOUNT)
            .with_pool(2048, None, 0, 600);
        let mut spec = hugepages_2m(1024);
        spec.min_count = Some(512);

        let entry = mgr(&host).ensure_reserved(&spec).await.unwrap();
        assert!(entry.is_some());
        assert_eq!(host.reserved_pages(2048, None), 600);
    }

    #[tokio::test]
    async fn test_partial_grant_is_kept_on_rerun() {
        let host = FakeHost::new()
            .with_mount(HUGE_MOUNT)
            .with_pool(2048, None, 0, 600);
        let mut spec = hugepages_2m(1024);
        spec.min_count = Some(512);
        let m = mgr(&host);

        assert!(m.ensure_reserved(&spec).await.unwrap().is_some());
        let writes = host.mutations().len();

        assert_eq!(m.ensure_reserved(&spec).await.unwrap(), None);
        assert_eq!(host.mutations().len(), writes);
        assert_eq!(host.reserved_pages(2048, None), 600);
    }

    #[tokio::test]
    async fn test_mount_failure() {
        let host = e1000_host().fail_mount();
        let err = mgr(&host)
            .ensure_mounted(&hugepages_2m(8))
            .await
            .unwrap_err();
        assert_eq!(err.entity().as_deref(), Some(HUGE_MOUNT));
    }

    #[tokio::test]
    async fn test_restore_and_unmount() {
        let host = e1000_host();
        let spec = hugepages_2m(128);
        let m = mgr(&host);
        m.ensure_mounted(&spec).await.unwrap();
        m.ensure_reserved(&spec).await.unwrap();

        m.restore_count(2048, None, 0).await.unwrap();
        m.unmount(&spec.mount_path).await.unwrap();
        assert_eq!(host.reserved_pages(2048, None), 0);
        assert!(!host.is_mounted(HUGE_MOUNT));
    }
}
