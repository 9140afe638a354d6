//! Process group resolution
//!
//! A group is everything that belongs to one application from the user's
//! point of view: the seed process, every process sharing its executable
//! name, and all descendants of those. Browsers, launchers and games that fork
//! helpers are handled as one unit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::platform::ProcessSnapshot;

/// Derived set of related pids, rebuilt on every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub seed_pid: u32,
    /// Lowest-pid process carrying the group name
    pub representative_pid: u32,
    pub name: String,
    pub members: BTreeSet<u32>,
}

impl ProcessGroup {
    pub fn contains(&self, pid: u32) -> bool {
        self.members.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Parent/child index over one snapshot.
pub struct GroupResolver<'a> {
    snapshot: &'a ProcessSnapshot,
    children: HashMap<u32, Vec<u32>>,
}

impl<'a> GroupResolver<'a> {
    pub fn new(snapshot: &'a ProcessSnapshot) -> Self {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in snapshot.iter() {
            if let Some(parent) = entry.parent_pid {
                children.entry(parent).or_default().push(entry.pid);
            }
        }
        Self { snapshot, children }
    }

    /// Add `root` and all its descendants to `into`, skipping anything
    /// already present. Parent links that form a cycle stop at the first
    /// repeated pid.
    pub fn collect_descendants(&self, root: u32, into: &mut BTreeSet<u32>) {
        let mut stack = vec![root];
        let mut visited = HashSet::new();
        while let Some(pid) = stack.pop() {
            if !visited.insert(pid) {
                continue;
            }
            into.insert(pid);
            if let Some(kids) = self.children.get(&pid) {
                stack.extend(kids.iter().copied().filter(|k| !visited.contains(k)));
            }
        }
    }

    /// Descendants of `root`, excluding `root` itself unless a cycle leads
    /// back to it.
    pub fn descendants(&self, root: u32) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        if let Some(kids) = self.children.get(&root) {
            for &kid in kids {
                self.collect_descendants(kid, &mut out);
            }
        }
        out
    }

    /// Group of `seed_pid`. Always contains the seed, even when the seed is
    /// no longer in the snapshot.
    pub fn resolve(&self, seed_pid: u32) -> ProcessGroup {
        let mut members = BTreeSet::new();
        self.collect_descendants(seed_pid, &mut members);

        let Some(seed) = self.snapshot.get(seed_pid) else {
            return ProcessGroup {
                seed_pid,
                representative_pid: seed_pid,
                name: String::new(),
                members,
            };
        };

        let namesakes = self.snapshot.pids_named(&seed.name);
        for &pid in &namesakes {
            if !members.contains(&pid) {
                self.collect_descendants(pid, &mut members);
            }
        }

        ProcessGroup {
            seed_pid,
            representative_pid: namesakes.iter().next().copied().unwrap_or(seed_pid),
            name: seed.name.clone(),
            members,
        }
    }

    /// Snapshot pids bucketed by lowercase name, in pid order.
    pub fn by_name(&self) -> BTreeMap<String, Vec<u32>> {
        let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for entry in self.snapshot.iter() {
            groups.entry(entry.name.clone()).or_default().push(entry.pid);
        }
        groups
    }

    /// Every process outside `claimed`, bucketed by name and widened with
    /// descendants. A pid belongs to the first bucket (in name order) that
    /// reaches it.
    pub fn partition_by_name(&self, claimed: &BTreeSet<u32>) -> Vec<ProcessGroup> {
        let mut claimed = claimed.clone();
        let mut groups = Vec::new();
        for (name, pids) in self.by_name() {
            let mut members = BTreeSet::new();
            for &pid in pids.iter().filter(|p| !claimed.contains(p)) {
                self.collect_descendants(pid, &mut members);
            }
            members.retain(|p| !claimed.contains(p));
            if members.is_empty() {
                continue;
            }
            claimed.extend(members.iter().copied());
            groups.push(ProcessGroup {
                seed_pid: pids[0],
                representative_pid: pids[0],
                name,
                members,
            });
        }
        groups
    }
}
