//! Stop ordering over a cost matrix.
//!
//! Open paths: a sequence starts at one stop and ends at another, there is no
//! return leg. Costs are compared as `(total, longest leg)` so an equal total
//! prefers the more even route.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Square matrix of leg costs; `costs[i][j]` is the cost of going from `i` to `j`.
pub type CostMatrix = Vec<Vec<u64>>;

/// How the first stop is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// This stop must come first.
    Fixed(usize),
    /// Preferred first stop; restarts and improvement may pick another.
    Preferred(usize),
}

/// Sequencing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SequenceOptions {
    pub restarts: u32,
    pub improvement_passes: u32,
    pub seed: u64,
}

/// `(total, longest leg)` of an ordering.
pub fn path_cost(order: &[usize], costs: &CostMatrix) -> (u64, u64) {
    order.windows(2).fold((0, 0), |(total, longest), w| {
        let c = costs[w[0]][w[1]];
        (total.saturating_add(c), longest.max(c))
    })
}

/// Greedy construction from `start`. Ties go to the lower index.
pub fn nearest_neighbour(costs: &CostMatrix, start: usize) -> Vec<usize> {
    let n = costs.len();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut current = start;
    visited[current] = true;
    order.push(current);
    while order.len() < n {
        let next = (0..n)
            .filter(|&j| !visited[j])
            .min_by_key(|&j| (costs[current][j], j));
        let Some(next) = next else { break };
        visited[next] = true;
        order.push(next);
        current = next;
    }
    order
}

/// Work allowed per `improve` call, counted in leg lookups.
const IMPROVE_BUDGET: u64 = 400_000_000;

/// Pairwise exchange improvement: segment reversal (2-opt) and stop swaps.
///
/// Accepts the first strictly better move and keeps scanning. Stops after
/// `passes` full scans, when a scan finds nothing, or once the work budget
/// is spent. `pinned_first` keeps position 0 in place.
///
/// Moves are scored by the legs they change, so a scan is quadratic in the
/// stop count. Costs may be asymmetric: a reversal also turns the legs
/// inside the segment around.
pub fn improve(order: Vec<usize>, costs: &CostMatrix, passes: u32, pinned_first: bool) -> Vec<usize> {
    improve_within(order, costs, passes, pinned_first, IMPROVE_BUDGET)
}

fn improve_within(
    mut order: Vec<usize>,
    costs: &CostMatrix,
    passes: u32,
    pinned_first: bool,
    budget: u64,
) -> Vec<usize> {
    let n = order.len();
    if n < 3 {
        return order;
    }
    let first = usize::from(pinned_first);
    let mut best = path_cost(&order, costs);
    let mut work: u64 = 0;

    'passes: for _ in 0..passes {
        let mut improved = false;
        for i in first..n - 1 {
            // Leg sums over order[i..=j], walked forwards and backwards.
            let mut forward: i128 = 0;
            let mut backward: i128 = 0;
            for j in (i + 1)..n {
                if work >= budget {
                    tracing::debug!(stops = n, work, "Improvement budget spent");
                    break 'passes;
                }
                work += 1;
                forward += leg(costs, order[j - 1], order[j]);
                backward += leg(costs, order[j], order[j - 1]);

                let delta = reversal_delta(&order, costs, i, j, forward, backward);
                if try_move(&mut order, costs, &mut best, delta, &mut work, |o| o[i..=j].reverse()) {
                    std::mem::swap(&mut forward, &mut backward);
                    improved = true;
                    continue;
                }

                let delta = swap_delta(&order, costs, i, j);
                if try_move(&mut order, costs, &mut best, delta, &mut work, |o| o.swap(i, j)) {
                    (forward, backward) = segment_sums(&order, costs, i, j);
                    work += (j - i) as u64;
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }
    order
}

fn leg(costs: &CostMatrix, from: usize, to: usize) -> i128 {
    i128::from(costs[from][to])
}

fn segment_sums(order: &[usize], costs: &CostMatrix, i: usize, j: usize) -> (i128, i128) {
    order[i..=j].windows(2).fold((0, 0), |(forward, backward), w| {
        (forward + leg(costs, w[0], w[1]), backward + leg(costs, w[1], w[0]))
    })
}

/// Change in total when order[i..=j] is reversed.
fn reversal_delta(order: &[usize], costs: &CostMatrix, i: usize, j: usize, forward: i128, backward: i128) -> i128 {
    let (a, b) = (order[i], order[j]);
    let (mut before, mut after) = (forward, backward);
    if i > 0 {
        let p = order[i - 1];
        before += leg(costs, p, a);
        after += leg(costs, p, b);
    }
    if j + 1 < order.len() {
        let q = order[j + 1];
        before += leg(costs, b, q);
        after += leg(costs, a, q);
    }
    after - before
}

/// Change in total when the stops at `i` and `j` trade places.
fn swap_delta(order: &[usize], costs: &CostMatrix, i: usize, j: usize) -> i128 {
    let (a, b) = (order[i], order[j]);
    let (mut before, mut after) = (0, 0);
    if i > 0 {
        let p = order[i - 1];
        before += leg(costs, p, a);
        after += leg(costs, p, b);
    }
    if j + 1 < order.len() {
        let q = order[j + 1];
        before += leg(costs, b, q);
        after += leg(costs, a, q);
    }
    if j == i + 1 {
        before += leg(costs, a, b);
        after += leg(costs, b, a);
    } else {
        let (x, y) = (order[i + 1], order[j - 1]);
        before += leg(costs, a, x) + leg(costs, y, b);
        after += leg(costs, b, x) + leg(costs, y, a);
    }
    after - before
}

/// Apply a self-inverse move if it beats `best`; undo it otherwise.
///
/// Only moves that do not raise the total are applied. The longest leg is
/// recomputed for those to settle ties.
fn try_move(
    order: &mut [usize],
    costs: &CostMatrix,
    best: &mut (u64, u64),
    delta: i128,
    work: &mut u64,
    apply: impl Fn(&mut [usize]),
) -> bool {
    if delta > 0 {
        return false;
    }
    apply(order);
    *work += order.len() as u64;
    let cost = path_cost(order, costs);
    if cost < *best {
        *best = cost;
        return true;
    }
    apply(order);
    false
}

/// Best ordering over the initial start plus `restarts` seeded alternatives.
pub fn sequence(costs: &CostMatrix, start: Start, options: SequenceOptions) -> Vec<usize> {
    let n = costs.len();
    if n == 0 {
        return Vec::new();
    }
    let (first, pinned) = match start {
        Start::Fixed(i) => (i.min(n - 1), true),
        Start::Preferred(i) => (i.min(n - 1), false),
    };

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut best = improve(nearest_neighbour(costs, first), costs, options.improvement_passes, pinned);
    let mut best_cost = path_cost(&best, costs);

    for _ in 0..options.restarts {
        let candidate = if pinned {
            // Start is fixed, so shuffle the rest instead.
            let mut rest: Vec<usize> = (0..n).filter(|&i| i != first).collect();
            rest.shuffle(&mut rng);
            std::iter::once(first).chain(rest).collect()
        } else {
            nearest_neighbour(costs, rng.gen_range(0..n))
        };
        let candidate = improve(candidate, costs, options.improvement_passes, pinned);
        let cost = path_cost(&candidate, costs);
        if cost < best_cost {
            best = candidate;
            best_cost = cost;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points on a line at the given positions; cost is the distance.
    fn line(positions: &[u64]) -> CostMatrix {
        positions
            .iter()
            .map(|a| positions.iter().map(|b| a.abs_diff(*b)).collect())
            .collect()
    }

    fn options() -> SequenceOptions {
        SequenceOptions {
            restarts: 3,
            improvement_passes: 50,
            seed: 7,
        }
    }

    #[test]
    fn test_nearest_neighbour_on_line() {
        let costs = line(&[0, 10, 3, 7]);
        assert_eq!(nearest_neighbour(&costs, 0), vec![0, 2, 3, 1]);
    }

    #[test]
    fn test_improve_untangles() {
        let costs = line(&[0, 1, 2, 3, 4]);
        let tangled = vec![0, 3, 2, 1, 4];
        let fixed = improve(tangled, &costs, 10, true);
        assert_eq!(path_cost(&fixed, &costs).0, 4);
        assert_eq!(fixed[0], 0);
    }

    /// Exchange improvement that rescores every candidate from scratch.
    fn improve_by_full_cost(mut order: Vec<usize>, costs: &CostMatrix, passes: u32, pinned_first: bool) -> Vec<usize> {
        let n = order.len();
        if n < 3 {
            return order;
        }
        let mut best = path_cost(&order, costs);
        for _ in 0..passes {
            let mut improved = false;
            for i in usize::from(pinned_first)..n - 1 {
                for j in (i + 1)..n {
                    order[i..=j].reverse();
                    let cost = path_cost(&order, costs);
                    if cost < best {
                        best = cost;
                        improved = true;
                        continue;
                    }
                    order[i..=j].reverse();
                    order.swap(i, j);
                    let cost = path_cost(&order, costs);
                    if cost < best {
                        best = cost;
                        improved = true;
                        continue;
                    }
                    order.swap(i, j);
                }
            }
            if !improved {
                break;
            }
        }
        order
    }

    fn random_matrix(rng: &mut StdRng, n: usize) -> CostMatrix {
        (0..n)
            .map(|i| (0..n).map(|j| if i == j { 0 } else { rng.gen_range(1..20) }).collect())
            .collect()
    }

    #[test]
    fn test_improve_matches_full_rescoring_on_asymmetric_costs() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in 3..10 {
            for _ in 0..20 {
                let costs = random_matrix(&mut rng, n);
                let mut start: Vec<usize> = (0..n).collect();
                start.shuffle(&mut rng);
                for pinned in [false, true] {
                    assert_eq!(
                        improve(start.clone(), &costs, 20, pinned),
                        improve_by_full_cost(start.clone(), &costs, 20, pinned),
                        "n={} pinned={} costs={:?}",
                        n,
                        pinned,
                        costs
                    );
                }
            }
        }
    }

    #[test]
    fn test_improve_scales_to_large_stop_sets() {
        let mut rng = StdRng::seed_from_u64(3);
        let positions: Vec<u64> = (0..1500).map(|_| rng.gen_range(0..1_000_000)).collect();
        let costs = line(&positions);
        let greedy = nearest_neighbour(&costs, 0);
        let greedy_cost = path_cost(&greedy, &costs);

        let order = improve(greedy, &costs, 3, false);

        assert!(path_cost(&order, &costs) <= greedy_cost);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..1500).collect::<Vec<_>>());
    }

    #[test]
    fn test_spent_budget_stops_improvement() {
        let costs = line(&[0, 1, 2, 3, 4]);
        let tangled = vec![0, 3, 2, 1, 4];
        assert_eq!(improve_within(tangled.clone(), &costs, 10, true, 0), tangled);
    }

    #[test]
    fn test_fixed_start_is_kept() {
        let costs = line(&[5, 0, 10, 3]);
        let order = sequence(&costs, Start::Fixed(0), options());
        assert_eq!(order[0], 0);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_preferred_start_may_move_to_an_end() {
        // Starting in the middle of a line is never optimal for an open path.
        let costs = line(&[5, 0, 10]);
        let order = sequence(&costs, Start::Preferred(0), options());
        assert_eq!(path_cost(&order, &costs).0, 10);
    }

    #[test]
    fn test_tie_break_prefers_smaller_longest_leg() {
        // Both orders total 10; the first has legs (5, 5), the second (9, 1).
        let costs: CostMatrix = vec![vec![0, 5, 9], vec![5, 0, 5], vec![9, 1, 0]];
        assert_eq!(path_cost(&[0, 1, 2], &costs), (10, 5));
        assert_eq!(path_cost(&[0, 2, 1], &costs), (10, 9));
        let order = sequence(&costs, Start::Fixed(0), options());
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let costs = line(&[3, 17, 4, 99, 23, 8, 42, 15]);
        assert_eq!(
            sequence(&costs, Start::Preferred(2), options()),
            sequence(&costs, Start::Preferred(2), options())
        );
    }

    #[test]
    fn test_small_inputs() {
        assert!(sequence(&Vec::new(), Start::Preferred(0), options()).is_empty());
        assert_eq!(sequence(&vec![vec![0]], Start::Preferred(0), options()), vec![0]);
    }
}
