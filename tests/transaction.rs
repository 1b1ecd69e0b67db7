// tests/transaction.rs

use planloop::errors::PlanError;
use planloop::plan::{Plan, SIMPLE_MODEL};
use planloop::relations::{DependencyOptions, ModelConstraint};
use planloop::transaction::{in_transaction, TransactionState};
use planloop::types::{EventRelation, Value, INTERNAL_ERROR, START, STOP, SUCCESS};
use planloop_test_utils::builders::test_plan;
use planloop_test_utils::{init_tracing, TestResult};

#[test]
fn committed_tasks_and_relations_appear_in_the_plan() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let (mission, child) = {
        let mut tx = plan.transaction();
        let mission = tx.add_mission(SIMPLE_MODEL)?;
        let child = tx.add_task(SIMPLE_MODEL)?;
        tx.depends_on(mission, child, DependencyOptions::new().role("helper"))?;

        assert!(tx.contains_task(mission));
        assert!(!tx.plan().contains_task(mission));
        assert_eq!(tx.children(mission), vec![child]);
        assert_eq!(tx.parents(child), vec![mission]);
        assert!(tx.proxy(child).is_some_and(|p| p.is_new()));

        tx.commit()?;
        assert_eq!(tx.state(), TransactionState::Committed);
        (mission, child)
    };

    assert!(plan.is_mission(mission));
    assert!(!plan.is_mission(child));
    assert_eq!(plan.child_from_role(mission, "helper"), Some(child));
    assert!(plan.status(mission).is_some_and(|s| s.pending()));

    // Model relations of new tasks are instantiated like any other.
    let success = plan.task_event(child, SUCCESS)?;
    let stop = plan.task_event(child, STOP)?;
    assert!(plan.has_event_relation(EventRelation::Forwarding, success, stop));
    Ok(())
}

#[test]
fn discarded_transaction_leaves_the_plan_alone() -> TestResult {
    let mut plan = Plan::new();
    let existing = plan.add_task(SIMPLE_MODEL)?;
    {
        let mut tx = plan.transaction();
        tx.add_mission_task(existing)?;
        let new = tx.add_task(SIMPLE_MODEL)?;
        tx.depends_on(existing, new, DependencyOptions::new())?;
        assert_eq!(tx.modified_tasks().len(), 2);
        tx.discard();
        assert_eq!(tx.state(), TransactionState::Discarded);

        let err = tx.add_task(SIMPLE_MODEL).expect_err("transaction is closed");
        assert!(matches!(err, PlanError::TransactionClosed("discarded")));
        let err = tx.commit().expect_err("transaction is closed");
        assert!(matches!(err, PlanError::TransactionClosed(_)));
    }

    assert!(!plan.is_mission(existing));
    assert!(plan.children(existing).is_empty());
    assert_eq!(plan.task_ids(), vec![existing]);
    Ok(())
}

#[test]
fn dropping_an_open_transaction_discards_it() -> TestResult {
    let mut plan = Plan::new();
    {
        let mut tx = plan.transaction();
        tx.add_mission(SIMPLE_MODEL)?;
    }
    assert!(plan.task_ids().is_empty());
    assert_eq!(plan.missions().count(), 0);
    Ok(())
}

#[test]
fn edits_of_existing_tasks_are_replayed_on_commit() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let goto = plan.add_mission("Goto")?;
    let helper = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(goto, helper, DependencyOptions::new())?;
    assert!(!plan.fully_instantiated(goto));

    {
        let mut tx = plan.transaction();
        tx.set_argument(goto, "target", Value::String("dock".into()))?;
        assert_eq!(tx.argument(goto, "target"), Some(Value::String("dock".into())));
        assert!(tx.plan().argument(goto, "target").is_none());

        let err = tx
            .set_argument(goto, "target", Value::String("lab".into()))
            .expect_err("arguments are set once");
        assert!(matches!(err, PlanError::Argument(_)));

        tx.unmark_mission(goto)?;
        tx.remove_dependency(goto, helper)?;
        tx.add_permanent_task(helper)?;
        tx.commit()?;
    }

    assert_eq!(plan.argument(goto, "target"), Some(Value::String("dock".into())));
    assert!(plan.fully_instantiated(goto));
    assert!(!plan.is_mission(goto));
    assert!(plan.is_permanent(helper));
    assert!(plan.children(goto).is_empty());
    Ok(())
}

#[test]
fn failed_commit_changes_nothing() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let parent = plan.add_task(SIMPLE_MODEL)?;
    let mover = plan.add_task("Move")?;
    let other = plan.add_task(SIMPLE_MODEL)?;

    {
        let mut tx = plan.transaction();
        tx.add_mission_task(other)?;
        // Accepted here, refused by the plan: Move is not a Goto.
        tx.depends_on(
            parent,
            mover,
            DependencyOptions::new().model(ModelConstraint::new("Goto")),
        )?;
        let err = tx.commit().expect_err("child does not fulfill Goto");
        assert!(matches!(err, PlanError::Argument(_)));
        assert!(tx.is_open());
        assert!(!tx.plan().is_mission(other));

        // Fix the edit and try again.
        tx.remove_dependency(parent, mover)?;
        tx.depends_on(parent, mover, DependencyOptions::new())?;
        tx.commit()?;
    }

    assert!(plan.is_mission(other));
    assert_eq!(plan.children(parent), vec![mover]);
    Ok(())
}

#[test]
fn dependency_cycles_are_detected_across_plan_and_transaction() -> TestResult {
    let mut plan = Plan::new();
    let a = plan.add_task(SIMPLE_MODEL)?;
    let b = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(a, b, DependencyOptions::new())?;

    let mut tx = plan.transaction();
    let c = tx.add_task(SIMPLE_MODEL)?;
    tx.depends_on(b, c, DependencyOptions::new())?;
    let err = tx.depends_on(c, a, DependencyOptions::new()).expect_err("cycle");
    assert!(matches!(err, PlanError::RelationCycle(_)));
    Ok(())
}

#[test]
fn event_relations_between_new_and_existing_tasks() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let running = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(running, START)?;
    let follower = {
        let mut tx = plan.transaction();
        let follower = tx.add_task(SIMPLE_MODEL)?;
        let running_success = tx.task_event(running, SUCCESS)?;
        let follower_start = tx.task_event(follower, START)?;
        let follower_success = tx.task_event(follower, SUCCESS)?;
        let follower_stop = tx.task_event(follower, STOP)?;

        assert!(tx.has_event_relation(EventRelation::Forwarding, follower_success, follower_stop));
        tx.add_signal(running_success, follower_start)?;
        assert_eq!(
            tx.event_children(EventRelation::Signal, running_success),
            vec![follower_start]
        );
        assert!(!tx.plan().has_event_relation(EventRelation::Signal, running_success, follower_start));

        let internal_error = tx.task_event(running, INTERNAL_ERROR)?;
        let err = tx
            .add_signal(follower_start, internal_error)
            .expect_err("internal_error is contingent");
        assert!(matches!(err, PlanError::Argument(_)));
        tx.commit()?;
        follower
    };

    plan.call_event(running, SUCCESS)?;
    assert!(plan.status(follower).is_some_and(|s| s.running()));
    Ok(())
}

#[test]
fn in_transaction_commits_on_success_only() -> TestResult {
    let mut plan = Plan::new();
    let task = in_transaction(&mut plan, |tx| tx.add_mission(SIMPLE_MODEL))?;
    assert!(plan.is_mission(task));

    let result = in_transaction(&mut plan, |tx| {
        tx.add_mission(SIMPLE_MODEL)?;
        tx.add_task("NoSuchModel")
    });
    assert!(result.is_err());
    assert_eq!(plan.task_ids(), vec![task]);
    Ok(())
}

#[test]
fn open_transaction_does_not_disturb_structure_checks() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let parent = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(parent, START)?;
    let stopped = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(stopped, START)?;
    plan.call_event(stopped, STOP)?;
    assert!(plan.check_structure().is_empty());

    {
        let mut tx = plan.transaction();
        // A dependency on a child that already failed.
        tx.depends_on(parent, stopped, DependencyOptions::new())?;
        assert_eq!(tx.children(parent), vec![stopped]);
        assert!(tx.plan().children(parent).is_empty());
        tx.discard();
    }
    assert!(plan.check_structure().is_empty());
    assert!(plan.children(parent).is_empty());

    in_transaction(&mut plan, |tx| tx.depends_on(parent, stopped, DependencyOptions::new()))?;
    let errors = plan.check_structure();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].involved, vec![stopped, parent]);
    Ok(())
}

#[test]
fn committed_dependencies_match_the_transaction_view() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let root = plan.add_task(SIMPLE_MODEL)?;
    let old = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(root, old, DependencyOptions::new())?;

    let (expected, new) = {
        let mut tx = plan.transaction();
        let new = tx.add_task(SIMPLE_MODEL)?;
        tx.remove_dependency(root, old)?;
        tx.depends_on(root, new, DependencyOptions::new().role("fresh").remove_when_done(false))?;
        tx.depends_on(old, new, DependencyOptions::new())?;

        let mut expected = Vec::new();
        for parent in [root, old, new] {
            for child in tx.children(parent) {
                expected.push((parent, child, tx.dependency_info(parent, child)));
            }
        }
        tx.commit()?;
        (expected, new)
    };

    let mut committed = Vec::new();
    for parent in [root, old, new] {
        for child in plan.children(parent) {
            committed.push((parent, child, plan.dependency_info(parent, child).cloned()));
        }
    }
    assert_eq!(committed, expected);
    assert_eq!(committed.len(), 2);
    assert!(!plan.depends_on_task(root, old));
    assert_eq!(plan.child_from_role(root, "fresh"), Some(new));
    Ok(())
}

#[test]
fn refused_event_relation_keeps_the_transaction_open() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    let start = plan.task_event(task, START)?;
    let stop = plan.task_event(task, STOP)?;

    {
        let mut tx = plan.transaction();
        tx.add_mission_task(task)?;
        // Accepted here, refused by the plan: stop cannot lead to start.
        tx.add_forwarding(stop, start)?;
        let err = tx.commit().expect_err("terminal event forwarded to start");
        assert!(matches!(err, PlanError::Argument(_)));
        assert!(tx.is_open());
        assert!(!tx.plan().is_mission(task));
        assert!(!tx.plan().has_event_relation(EventRelation::Forwarding, stop, start));

        assert!(tx.remove_event_relation(EventRelation::Forwarding, stop, start)?);
        tx.commit()?;
    }

    assert!(plan.is_mission(task));
    assert!(!plan.has_event_relation(EventRelation::Forwarding, stop, start));
    Ok(())
}
