//! Rollback journal: the ordered log of completed reversible actions.
//!
//! An entry is appended only after its step has changed host state, and
//! the journal is consumed newest-first on abort.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use nicprep_common::types::node_label;
use nicprep_common::BusAddress;

/// Kind of a reversible action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A kernel module was loaded.
    ModuleLoad,
    /// hugetlbfs was mounted.
    Mount,
    /// A huge page pool was resized.
    Reserve,
    /// A device was moved to another driver.
    Rebind,
    /// A device was unbound and the bind that followed failed.
    Strand,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::ModuleLoad => "module-load",
            ActionKind::Mount => "mount",
            ActionKind::Reserve => "reserve",
            ActionKind::Rebind => "rebind",
            ActionKind::Strand => "strand",
        };
        f.write_str(s)
    }
}

/// One reversible action with the value it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JournalEntry {
    /// `module` was not loaded before.
    ModuleLoaded { module: String },

    /// Nothing was mounted at `path` before.
    HugetlbfsMounted { path: PathBuf, page_size_kb: u64 },

    /// The pool held `previous` pages before.
    HugepagesReserved {
        page_size_kb: u64,
        node: Option<u32>,
        previous: u64,
    },

    /// The device was bound to `prior_driver` and now is bound to the
    /// target. `recorded_original` is set when this run wrote the durable
    /// original-driver record.
    DeviceRebound {
        address: BusAddress,
        prior_driver: Option<String>,
        recorded_original: bool,
    },

    /// The device was unbound from `prior_driver` but the bind to the
    /// target failed, leaving it without a driver.
    DeviceStranded {
        address: BusAddress,
        prior_driver: Option<String>,
        recorded_original: bool,
    },
}

impl JournalEntry {
    /// Action kind of the entry.
    pub fn kind(&self) -> ActionKind {
        match self {
            JournalEntry::ModuleLoaded { .. } => ActionKind::ModuleLoad,
            JournalEntry::HugetlbfsMounted { .. } => ActionKind::Mount,
            JournalEntry::HugepagesReserved { .. } => ActionKind::Reserve,
            JournalEntry::DeviceRebound { .. } => ActionKind::Rebind,
            JournalEntry::DeviceStranded { .. } => ActionKind::Strand,
        }
    }

    /// Identifier of the entity the action changed.
    pub fn target(&self) -> String {
        match self {
            JournalEntry::ModuleLoaded { module } => module.clone(),
            JournalEntry::HugetlbfsMounted { path, .. } => path.display().to_string(),
            JournalEntry::HugepagesReserved {
                page_size_kb, node, ..
            } => format!("hugepages-{}kB@{}", page_size_kb, node_label(*node)),
            JournalEntry::DeviceRebound { address, .. }
            | JournalEntry::DeviceStranded { address, .. } => address.to_string(),
        }
    }

    /// The value the action replaced, rendered for reports.
    pub fn prior(&self) -> String {
        match self {
            JournalEntry::ModuleLoaded { .. } => "unloaded".to_string(),
            JournalEntry::HugetlbfsMounted { .. } => "unmounted".to_string(),
            JournalEntry::HugepagesReserved { previous, .. } => previous.to_string(),
            JournalEntry::DeviceRebound { prior_driver, .. }
            | JournalEntry::DeviceStranded { prior_driver, .. } => {
                prior_driver.clone().unwrap_or_else(|| "none".to_string())
            }
        }
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.kind(), self.target(), self.prior())
    }
}

/// Ordered log of completed reversible actions for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RollbackJournal {
    entries: Vec<JournalEntry>,
}

impl RollbackJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completed action.
    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Number of journaled actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was journaled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in the order they were recorded.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Empties the journal, yielding entries newest first.
    pub fn drain_reverse(&mut self) -> impl Iterator<Item = JournalEntry> + '_ {
        self.entries.drain(..).rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rebound(addr: &str, prior: &str) -> JournalEntry {
        JournalEntry::DeviceRebound {
            address: addr.parse().unwrap(),
            prior_driver: Some(prior.to_string()),
            recorded_original: true,
        }
    }

    #[test]
    fn test_entry_triple() {
        let entry = rebound("02:02.0", "e1000");
        assert_eq!(entry.kind(), ActionKind::Rebind);
        assert_eq!(entry.target(), "0000:02:02.0");
        assert_eq!(entry.prior(), "e1000");
        assert_eq!(entry.to_string(), "(rebind, 0000:02:02.0, e1000)");

        let pool = JournalEntry::HugepagesReserved {
            page_size_kb: 2048,
            node: Some(1),
            previous: 64,
        };
        assert_eq!(pool.to_string(), "(reserve, hugepages-2048kB@node1, 64)");
    }

    #[test]
    fn test_drain_reverse() {
        let mut journal = RollbackJournal::new();
        journal.record(JournalEntry::ModuleLoaded {
            module: "vfio".to_string(),
        });
        journal.record(rebound("02:02.0", "e1000"));
        journal.record(rebound("02:03.0", "e1000"));
        assert_eq!(journal.len(), 3);

        let targets: Vec<String> = journal.drain_reverse().map(|e| e.target()).collect();
        assert_eq!(targets, vec!["0000:02:03.0", "0000:02:02.0", "vfio"]);
        assert!(journal.is_empty());
    }

    #[test]
    fn test_serialize_tagged() {
        let json = serde_json::to_value(rebound("02:02.0", "e1000")).unwrap();
        assert_eq!(json["action"], "device_rebound");
        assert_eq!(json["address"], "0000:02:02.0");
        assert_eq!(json["prior_driver"], "e1000");
    }
}
