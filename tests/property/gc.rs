// tests/property/gc.rs

use std::collections::{BTreeSet, VecDeque};

use proptest::prelude::*;

use planloop::errors::PlanError;
use planloop::plan::{Plan, SIMPLE_MODEL};
use planloop::relations::DependencyOptions;
use planloop::types::{TaskId, START};

fn fail(e: PlanError) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

/// Indices reachable from `roots` along `edges` (parent, child).
fn reachable(roots: impl IntoIterator<Item = usize>, edges: &[(usize, usize)]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<usize> = roots.into_iter().collect();
    while let Some(node) = queue.pop_front() {
        if !seen.insert(node) {
            continue;
        }
        queue.extend(edges.iter().filter(|(p, _)| *p == node).map(|(_, c)| *c));
    }
    seen
}

// Random acyclic plans: task i may only depend on tasks with a larger index.
fn plan_strategy(max_tasks: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<bool>, Vec<bool>)> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            Just(n),
            proptest::collection::vec((0..n, 0..n), 0..n * 2),
            proptest::collection::vec(any::<bool>(), n),
            proptest::collection::vec(any::<bool>(), n),
        )
            .prop_map(|(n, raw_edges, missions, started)| {
                let edges: BTreeSet<(usize, usize)> = raw_edges
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| (a.min(b), a.max(b)))
                    .collect();
                (n, edges.into_iter().collect(), missions, started)
            })
    })
}

proptest! {
    #[test]
    fn gc_keeps_exactly_the_tasks_reachable_from_missions(
        (n, edges, missions, started) in plan_strategy(10)
    ) {
        let mut plan = Plan::new();
        let mut ids: Vec<TaskId> = Vec::new();
        for _ in 0..n {
            ids.push(plan.add_task(SIMPLE_MODEL).map_err(fail)?);
        }
        for (parent, child) in edges.iter() {
            plan.depends_on(ids[*parent], ids[*child], DependencyOptions::new())
                .map_err(fail)?;
        }
        for (i, mission) in missions.iter().enumerate() {
            if *mission {
                plan.add_mission_task(ids[i]).map_err(fail)?;
            }
        }
        for (i, start) in started.iter().enumerate() {
            if *start {
                plan.call_event(ids[i], START).map_err(fail)?;
            }
        }

        let roots = missions.iter().enumerate().filter(|(_, m)| **m).map(|(i, _)| i);
        let expected: BTreeSet<TaskId> = reachable(roots, &edges).into_iter().map(|i| ids[i]).collect();

        plan.garbage_collect().map_err(fail)?;
        let remaining: BTreeSet<TaskId> = plan.task_ids().into_iter().collect();
        prop_assert_eq!(&remaining, &expected);
        prop_assert_eq!(plan.useful_tasks(), expected);

        let again = plan.garbage_collect().map_err(fail)?;
        prop_assert!(again.is_empty());
    }

    #[test]
    fn dependency_graph_never_accepts_a_cycle(
        attempts in proptest::collection::vec((0..6usize, 0..6usize), 0..24)
    ) {
        let mut plan = Plan::new();
        let mut ids: Vec<TaskId> = Vec::new();
        for _ in 0..6 {
            ids.push(plan.add_task(SIMPLE_MODEL).map_err(fail)?);
        }

        let mut accepted: Vec<(usize, usize)> = Vec::new();
        for (parent, child) in attempts {
            let closes_cycle = parent == child || reachable([child], &accepted).contains(&parent);
            let result = plan.depends_on(ids[parent], ids[child], DependencyOptions::new());
            prop_assert_eq!(result.is_err(), closes_cycle);
            if result.is_ok() && !accepted.contains(&(parent, child)) {
                accepted.push((parent, child));
            }
        }

        for (parent, child) in accepted.iter() {
            prop_assert!(plan.depends_on_task(ids[*parent], ids[*child]));
        }
    }

    #[test]
    fn structure_checks_are_quiet_on_healthy_plans(
        (n, edges, missions, started) in plan_strategy(8)
    ) {
        let mut plan = Plan::new();
        let mut ids: Vec<TaskId> = Vec::new();
        for _ in 0..n {
            ids.push(plan.add_task(SIMPLE_MODEL).map_err(fail)?);
        }
        for (parent, child) in edges.iter() {
            plan.depends_on(ids[*parent], ids[*child], DependencyOptions::new())
                .map_err(fail)?;
        }
        for (i, mission) in missions.iter().enumerate() {
            if *mission {
                plan.add_mission_task(ids[i]).map_err(fail)?;
            }
        }
        for (i, start) in started.iter().enumerate() {
            if *start {
                plan.call_event(ids[i], START).map_err(fail)?;
            }
        }

        let before = plan.task_ids();
        prop_assert!(plan.check_structure().is_empty());
        prop_assert!(plan.check_structure().is_empty());
        prop_assert_eq!(plan.task_ids(), before);
    }
}
