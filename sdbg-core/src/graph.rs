// Query contract of a completed succinct de Bruijn graph
// The simplifier only touches the graph through this interface; the concrete
// representation (and the branch-group search it hands out) lives elsewhere.

/// Read view of an SdBG plus the one mutation simplification needs
/// (`set_invalid`, backed by interior-mutable flags).
pub trait SdbgAccess: Sync {
    /// Number of edge slots; node indices are edge indices of LAST edges.
    fn size(&self) -> u64;

    fn kmer_k(&self) -> usize;

    fn is_valid_node(&self, idx: u64) -> bool;

    fn is_last(&self, idx: u64) -> bool;

    fn indegree_zero(&self, idx: u64) -> bool;

    fn outdegree_zero(&self, idx: u64) -> bool;

    fn indegree(&self, idx: u64) -> usize;

    fn outdegree(&self, idx: u64) -> usize;

    /// The single predecessor of `idx`, or `None` when the in-degree is not
    /// exactly one.
    fn unique_incoming(&self, idx: u64) -> Option<u64>;

    /// The single successor of `idx`, or `None` when the out-degree is not
    /// exactly one.
    fn unique_outgoing(&self, idx: u64) -> Option<u64>;

    /// Canonical index of the node containing edge `idx` (its LAST edge).
    fn get_last_index(&self, idx: u64) -> u64;

    /// Mark the node invalid. Interior-mutable; safe to call concurrently.
    fn set_invalid(&self, idx: u64);
}

/// One multi-branch region rooted at a node, as produced by the external
/// branch-group search.
pub trait BranchGroup {
    /// Explore the branches; true when the region closes into a bubble
    /// within the configured limits.
    fn search(&mut self) -> bool;

    /// Length of the longest branch found by `search`.
    fn length(&self) -> usize;

    /// Drop branches whose depth falls below `low_depth_ratio` times the
    /// strongest branch; true when something was removed.
    fn remove_error_branches(&mut self, low_depth_ratio: f64) -> bool;
}
