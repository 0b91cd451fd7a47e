//! Module execution order.
//!
//! Invoked on the worker thread whenever the graph mutates, never on RT.
//! Feedback-flagged edges are treated as absent; if the remainder is still
//! cyclic the mutation is refused and the previous plan stays in force.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{Error, Result};
use crate::urid::Urid;

/// A group of pairwise-independent modules.  Within a barrier the slots may
/// run in parallel; a join separates consecutive barriers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    /// One module list per worker slot.
    pub slots: Vec<Vec<Urid>>,
}

/// The scheduling result: a deterministic total order plus its partition
/// into barriers and slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub order: Vec<Urid>,
    pub barriers: Vec<Barrier>,
}

/// Compute the plan for `urns` under dependency edges `deps`
/// (source -> sink, feedback edges already filtered out).
///
/// Kahn topological sort, tie-broken by module URN so the same graph always
/// yields the same order.  Barriers are the longest-path depth levels:
/// modules of equal depth cannot reach one another.
pub fn schedule(urns: &[Urid], deps: &[(Urid, Urid)], cpus_used: u32) -> Result<Plan> {
    let n = urns.len();
    let index: HashMap<Urid, usize> = urns.iter().enumerate().map(|(i, &u)| (u, i)).collect();

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree: Vec<usize> = vec![0; n];
    for &(src, snk) in deps {
        let (Some(&s), Some(&t)) = (index.get(&src), index.get(&snk)) else {
            return Err(Error::lookup(format!(
                "dependency references unknown module ({src} -> {snk})"
            )));
        };
        if s == t {
            return Err(Error::constraint("self-cycle without feedback hint"));
        }
        successors[s].push(t);
        indegree[t] += 1;
    }

    let mut ready: BinaryHeap<Reverse<Urid>> = urns
        .iter()
        .enumerate()
        .filter(|&(i, _)| indegree[i] == 0)
        .map(|(_, &u)| Reverse(u))
        .collect();

    let mut order = Vec::with_capacity(n);
    let mut depth: Vec<usize> = vec![0; n];

    while let Some(Reverse(urn)) = ready.pop() {
        let i = index[&urn];
        order.push(urn);
        for &succ in &successors[i] {
            depth[succ] = depth[succ].max(depth[i] + 1);
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(Reverse(urns[succ]));
            }
        }
    }

    if order.len() != n {
        return Err(Error::constraint(
            "graph is cyclic; flag a connection as feedback to close the loop",
        ));
    }

    // Partition into depth levels, each level split round-robin over the
    // available slots.
    let cpus = cpus_used.max(1) as usize;
    let max_depth = depth.iter().copied().max().unwrap_or(0);
    let mut barriers = Vec::with_capacity(max_depth + 1);
    for level in 0..=max_depth {
        let mut members: Vec<Urid> = urns
            .iter()
            .enumerate()
            .filter(|&(i, _)| depth[i] == level)
            .map(|(_, &u)| u)
            .collect();
        if members.is_empty() {
            continue;
        }
        members.sort_unstable();
        let mut slots: Vec<Vec<Urid>> = vec![Vec::new(); cpus.min(members.len())];
        for (pos, urn) in members.into_iter().enumerate() {
            let slot = pos % slots.len();
            slots[slot].push(urn);
        }
        barriers.push(Barrier { slots });
    }

    Ok(Plan { order, barriers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_orders_by_dependency() {
        // 30 -> 10 -> 20 despite URN ordering
        let plan = schedule(&[10, 20, 30], &[(30, 10), (10, 20)], 1).unwrap();
        assert_eq!(plan.order, vec![30, 10, 20]);
        assert_eq!(plan.barriers.len(), 3);
    }

    #[test]
    fn ties_break_by_urn() {
        let plan = schedule(&[5, 3, 9], &[], 1).unwrap();
        assert_eq!(plan.order, vec![3, 5, 9]);
        // All independent: one barrier, one slot holding all three.
        assert_eq!(plan.barriers.len(), 1);
        assert_eq!(plan.barriers[0].slots[0], vec![3, 5, 9]);
    }

    #[test]
    fn diamond_gets_parallel_barrier() {
        //    1
        //   / \
        //  2   3
        //   \ /
        //    4
        let plan = schedule(&[1, 2, 3, 4], &[(1, 2), (1, 3), (2, 4), (3, 4)], 2).unwrap();
        assert_eq!(plan.order, vec![1, 2, 3, 4]);
        assert_eq!(plan.barriers.len(), 3);
        let mid = &plan.barriers[1];
        assert_eq!(mid.slots.len(), 2);
        assert_eq!(mid.slots[0], vec![2]);
        assert_eq!(mid.slots[1], vec![3]);
    }

    #[test]
    fn cycle_is_refused() {
        let err = schedule(&[1, 2], &[(1, 2), (2, 1)], 1).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn unknown_module_is_a_lookup_error() {
        let err = schedule(&[1], &[(1, 99)], 1).unwrap_err();
        assert!(matches!(err, Error::Lookup(_)));
    }
}
