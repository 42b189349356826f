//! Shortest-path planning over a template's implied directed graph.
//!
//! The planner is the piece that turns "I want to be in one of these states"
//! into "this is the state to move to now". It is a pure function of its
//! inputs: breadth-first search with uniform edge weight over
//! [`Template::successors`], so it terminates on cyclic graphs and returns
//! the same answer every time it is called.

use std::collections::{HashMap, VecDeque};

use crate::template::{StateKey, Template};

/// Compute the shortest route from `start` to the nearest member of
/// `targets`.
///
/// Returns the ordered state keys on the path, excluding `start` and
/// including the chosen target, so the scheduler consumes `plan[0]` as "the
/// state to move to now". Among equally near targets, ties break in favor
/// of the key that appears earliest in `targets` (caller order, not graph
/// order). An empty return means no target is reachable: a legitimate,
/// non-error outcome in which the caller stays put.
pub fn plan<I, P, C>(
    start: StateKey,
    targets: &[StateKey],
    template: &Template<I, P, C>,
) -> Vec<StateKey>
where
    I: Clone,
    P: Clone,
{
    if targets.is_empty() || !template.contains(start) {
        return Vec::new();
    }

    // Unweighted BFS with visited-set discipline; parents recorded at first
    // discovery, so paths are deterministic given declared edge order.
    let mut distance: HashMap<StateKey, usize> = HashMap::new();
    let mut parent: HashMap<StateKey, StateKey> = HashMap::new();
    let mut queue: VecDeque<StateKey> = VecDeque::new();
    distance.insert(start, 0);
    queue.push_back(start);

    while let Some(state) = queue.pop_front() {
        let next_distance = distance[&state] + 1;
        for successor in template.successors(state) {
            if !distance.contains_key(&successor) {
                distance.insert(successor, next_distance);
                parent.insert(successor, state);
                queue.push_back(successor);
            }
        }
    }

    // Nearest reachable target; strict < keeps the earliest caller-listed
    // key on ties.
    let mut chosen: Option<(usize, StateKey)> = None;
    for target in targets {
        if let Some(&d) = distance.get(target) {
            if chosen.map_or(true, |(best, _)| d < best) {
                chosen = Some((d, *target));
            }
        }
    }

    let Some((d, target)) = chosen else {
        return Vec::new();
    };
    if d == 0 {
        // Already there.
        return Vec::new();
    }

    let mut path = vec![target];
    let mut cursor = target;
    while let Some(&previous) = parent.get(&cursor) {
        if previous == start {
            break;
        }
        path.push(previous);
        cursor = previous;
    }
    path.reverse();
    path
}
