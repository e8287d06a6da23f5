//! The CFG successor map: for each edge id, the edge ids that can follow
//! it in one step of the instrumented program. Produced once by the LLVM
//! instrumentation passes and loaded read-only here.

/// Read-only successor relation over edge ids, sized to `map_size`.
#[derive(Debug, Clone)]
pub struct SuccessorMap {
    /// `successors[e]` is the list of edge ids reachable in one step from `e`.
    successors: Vec<Vec<u32>>,
}

impl SuccessorMap {
    /// Builds a successor map with `map_size` entries, all initially empty.
    pub fn new(map_size: usize) -> Self {
        Self {
            successors: vec![Vec::new(); map_size],
        }
    }

    /// Builds a successor map from already-computed adjacency lists, one
    /// per edge id in order. This is the shape instrumentation metadata is
    /// loaded from.
    pub fn from_lists(lists: Vec<Vec<u32>>) -> Self {
        Self { successors: lists }
    }

    pub fn map_size(&self) -> usize {
        self.successors.len()
    }

    /// Registers that `to` is reachable in one step from `from`.
    pub fn add_edge(&mut self, from: u32, to: u32) {
        self.successors[from as usize].push(to);
    }

    /// The successor list for `edge`, or an empty slice if `edge` has no
    /// recorded successors (e.g. a sink).
    pub fn successors_of(&self, edge: u32) -> &[u32] {
        self.successors
            .get(edge as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn successor_count(&self, edge: u32) -> usize {
        self.successors_of(edge).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_edge_has_no_successors() {
        let m = SuccessorMap::new(4);
        assert_eq!(m.successor_count(3), 0);
        assert!(m.successors_of(3).is_empty());
    }

    #[test]
    fn add_edge_accumulates() {
        let mut m = SuccessorMap::new(4);
        m.add_edge(0, 1);
        m.add_edge(0, 2);
        assert_eq!(m.successors_of(0), &[1, 2]);
    }
}
