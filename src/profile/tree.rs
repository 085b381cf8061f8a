//! Aggregated call trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::method::ProfiledMethod;

#[cfg(feature = "serialize")]
fn serialize_children<S>(
    children: &HashMap<Arc<ProfiledMethod>, ProfileSegment>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(children.values())
}

/// One call site in an aggregated tree, with the number of samples that
/// observed it as the innermost frame.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug)]
pub struct ProfileSegment {
    /// The interned call-site identity.
    pub method: Arc<ProfiledMethod>,
    /// Samples that ended at this call site on a runnable thread.
    pub runnable_count: u64,
    /// Samples that ended at this call site on a non-runnable thread.
    pub non_runnable_count: u64,
    /// Callees observed below this call site, keyed by identity.
    #[cfg_attr(feature = "serialize", serde(serialize_with = "serialize_children"))]
    pub children: HashMap<Arc<ProfiledMethod>, ProfileSegment>,
}

impl ProfileSegment {
    fn new(method: Arc<ProfiledMethod>) -> Self {
        ProfileSegment {
            method,
            runnable_count: 0,
            non_runnable_count: 0,
            children: HashMap::new(),
        }
    }

    /// Number of call sites in this subtree, including `self`.
    pub fn call_site_count(&self) -> usize {
        1 + self
            .children
            .values()
            .map(ProfileSegment::call_site_count)
            .sum::<usize>()
    }
}

/// The aggregated call tree for one thread group.
///
/// Shared call paths collapse into shared nodes; only the innermost frame
/// of each sample gets its count incremented, so a node's counts measure
/// where samples actually ended.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug, Default)]
pub struct ProfileTree {
    /// Root call sites, keyed by identity.
    #[cfg_attr(feature = "serialize", serde(serialize_with = "serialize_children"))]
    pub roots: HashMap<Arc<ProfiledMethod>, ProfileSegment>,
    /// CPU time attributed to this thread group over the session.
    pub cpu_time: Duration,
}

impl ProfileTree {
    /// Folds one captured stack into the tree. `path` runs outermost
    /// first; only the leaf call site's count is incremented.
    pub fn fold(&mut self, path: &[Arc<ProfiledMethod>], runnable: bool) {
        let (leaf, ancestors) = match path.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut children = &mut self.roots;
        for method in ancestors {
            children = &mut children
                .entry(Arc::clone(method))
                .or_insert_with(|| ProfileSegment::new(Arc::clone(method)))
                .children;
        }
        let segment = children
            .entry(Arc::clone(leaf))
            .or_insert_with(|| ProfileSegment::new(Arc::clone(leaf)));
        if runnable {
            segment.runnable_count += 1;
        } else {
            segment.non_runnable_count += 1;
        }
    }

    /// Adds CPU time attributed to this thread group.
    pub fn record_cpu_time(&mut self, cpu_time: Duration) {
        self.cpu_time += cpu_time;
    }

    /// Number of call sites in the tree.
    pub fn call_site_count(&self) -> usize {
        self.roots
            .values()
            .map(ProfileSegment::call_site_count)
            .sum()
    }

    /// Whether the tree holds no call sites.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Every call site in the tree as `(path, runnable_count, depth)`,
    /// with `path` running outermost first. Used to rank subtrees when a
    /// report exceeds its size budget.
    pub(crate) fn call_sites(&self) -> Vec<(Vec<Arc<ProfiledMethod>>, u64, usize)> {
        let mut sites = Vec::new();
        for segment in self.roots.values() {
            collect_sites(segment, &mut Vec::new(), &mut sites);
        }
        sites
    }

    /// Removes the subtree rooted at `path`. Returns how many call sites
    /// were removed, zero if the path is already gone.
    pub(crate) fn remove_subtree(&mut self, path: &[Arc<ProfiledMethod>]) -> usize {
        let (leaf, ancestors) = match path.split_last() {
            Some(split) => split,
            None => return 0,
        };
        let mut children = &mut self.roots;
        for method in ancestors {
            children = match children.get_mut(method) {
                Some(segment) => &mut segment.children,
                None => return 0,
            };
        }
        children
            .remove(leaf)
            .map(|segment| segment.call_site_count())
            .unwrap_or(0)
    }
}

fn collect_sites(
    segment: &ProfileSegment,
    path: &mut Vec<Arc<ProfiledMethod>>,
    sites: &mut Vec<(Vec<Arc<ProfiledMethod>>, u64, usize)>,
) {
    path.push(Arc::clone(&segment.method));
    sites.push((path.clone(), segment.runnable_count, path.len()));
    for child in segment.children.values() {
        collect_sites(child, path, sites);
    }
    path.pop();
}
