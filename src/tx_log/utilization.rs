use std::collections::BTreeMap;

use super::lsn::Lsn;

/// Per log file counts of live and obsolete bytes.
///
/// A space reclaiming cleaner picks files by `utilization()`, the
/// cleaner itself is not part of this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSummary {
    pub total_count: u64,
    pub total_size: u64,
    pub total_node_count: u64,
    pub total_node_size: u64,
    pub obsolete_node_count: u64,
    pub obsolete_node_size: u64,
    pub obsolete_record_count: u64,
    pub obsolete_record_size: u64,
}

impl FileSummary {
    pub fn obsolete_size(&self) -> u64 {
        self.obsolete_node_size + self.obsolete_record_size
    }

    /// Live bytes in percent of all bytes written to the file.
    pub fn utilization(&self) -> u64 {
        if self.total_size == 0 {
            return 100;
        }
        let live = self.total_size.saturating_sub(self.obsolete_size());
        live * 100 / self.total_size
    }
}

#[derive(Debug, Default)]
pub struct UtilizationTracker {
    summaries: BTreeMap<u32, FileSummary>,
}

impl UtilizationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_new(&mut self, lsn: Lsn, is_node: bool, size: u64) {
        let s = self.summaries.entry(lsn.file_number()).or_default();
        s.total_count += 1;
        s.total_size += size;
        if is_node {
            s.total_node_count += 1;
            s.total_node_size += size;
        }
    }

    pub fn count_obsolete(&mut self, lsn: Lsn, is_node: bool, size: u64) {
        if lsn.is_null() {
            return;
        }
        let s = self.summaries.entry(lsn.file_number()).or_default();
        if is_node {
            s.obsolete_node_count += 1;
            s.obsolete_node_size += size;
        } else {
            s.obsolete_record_count += 1;
            s.obsolete_record_size += size;
        }
    }

    pub fn summary(&self, file_number: u32) -> Option<&FileSummary> {
        self.summaries.get(&file_number)
    }

    pub fn summaries(&self) -> BTreeMap<u32, FileSummary> {
        self.summaries.clone()
    }
}
