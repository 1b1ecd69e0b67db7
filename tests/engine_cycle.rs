// tests/engine_cycle.rs

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use planloop::engine::{ErrorDecision, ErrorFilter, ExceptionAction, ExecutionEngine};
use planloop::errors::{LocalizedError, PlanError};
use planloop::plan::{Plan, SIMPLE_MODEL};
use planloop::relations::DependencyOptions;
use planloop::types::{TaskId, START, STOP, SUCCESS};
use planloop_test_utils::builders::{test_engine, test_plan};
use planloop_test_utils::control::ScriptedControl;
use planloop_test_utils::recorder::Recorder;
use planloop_test_utils::{init_tracing, run_cycles, TestResult};

fn is_running(engine: &ExecutionEngine, task: TaskId) -> bool {
    engine.plan().status(task).is_some_and(|s| s.running())
}

/// Mission with one child, both running after two cycles.
fn mission_with_child(
    control: Option<ScriptedControl>,
) -> Result<(ExecutionEngine, TaskId, TaskId), PlanError> {
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    let child = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(mission, child, DependencyOptions::new())?;
    let mut engine = test_engine(plan);
    if let Some(control) = control {
        engine = engine.with_control(Box::new(control));
    }
    run_cycles(&mut engine, 2)?;
    Ok((engine, mission, child))
}

#[test]
fn scheduler_starts_missions_then_their_children() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    let child = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(mission, child, DependencyOptions::new())?;
    let mut engine = test_engine(plan);

    let report = engine.process_events()?;
    assert_eq!(report.cycle, 1);
    assert!(is_running(&engine, mission));
    assert!(engine.plan().status(child).is_some_and(|s| s.pending()));

    engine.process_events()?;
    assert!(is_running(&engine, child));
    assert_eq!(engine.cycle(), 2);
    Ok(())
}

#[test]
fn siblings_ordered_by_signals_start_in_turn() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    let first = plan.add_task(SIMPLE_MODEL)?;
    let second = plan.add_task(SIMPLE_MODEL)?;
    plan.depends_on(mission, first, DependencyOptions::new())?;
    plan.depends_on(mission, second, DependencyOptions::new())?;
    let first_success = plan.task_event(first, SUCCESS)?;
    let second_start = plan.task_event(second, START)?;
    plan.add_signal(first_success, second_start)?;
    let mut engine = test_engine(plan);

    engine.process_events()?;
    engine.process_events()?;
    engine.process_events()?;
    assert!(is_running(&engine, first));
    assert!(engine.plan().status(second).is_some_and(|s| s.pending()));

    engine.plan_mut().call_event(first, SUCCESS)?;
    assert!(is_running(&engine, second));
    Ok(())
}

#[test]
fn polls_run_on_running_tasks() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let recorder = Recorder::new();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    plan.poll(mission, None, recorder.on_poll("poll"))?;
    plan.poll(
        mission,
        None,
        Rc::new(|plan: &mut Plan, task: TaskId| -> anyhow::Result<()> {
            plan.emit_event(task, SUCCESS)?;
            Ok(())
        }),
    )?;
    let mut engine = test_engine(plan);

    engine.process_events()?;
    assert_eq!(recorder.count("poll"), 0);
    assert!(!engine.is_idle());

    engine.process_events()?;
    assert_eq!(recorder.count("poll"), 1);
    assert_eq!(engine.mission_results().get(&mission), Some(&true));
    assert!(engine.is_idle());
    Ok(())
}

#[test]
fn failing_poll_fails_its_task() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    plan.poll(
        mission,
        None,
        Rc::new(|_: &mut Plan, _: TaskId| -> anyhow::Result<()> { Err(anyhow!("lost contact")) }),
    )?;
    let mut engine = test_engine(plan);

    engine.process_events()?;
    let report = engine.process_events()?;
    assert!(report.handled.iter().any(|e| e.kind().name() == "PollingFailed"));
    let status = engine.plan().status(mission).ok_or("mission vanished")?;
    assert!(status.finished() && status.failed());
    assert_eq!(engine.mission_results().get(&mission), Some(&false));
    Ok(())
}

#[test]
fn unhandled_child_failure_kills_the_parent() -> TestResult {
    init_tracing();
    let (mut engine, mission, child) = mission_with_child(None)?;
    assert!(is_running(&engine, child));

    engine.plan_mut().call_event(child, STOP)?;
    let report = engine.process_events()?;

    assert_eq!(report.exceptions.unhandled.len(), 1);
    let exception = &report.exceptions.unhandled[0];
    assert_eq!(exception.error.kind().name(), "ChildFailed");
    assert_eq!(exception.trace, vec![child, mission]);
    assert_eq!(report.exceptions.killed, vec![mission]);

    // Killed tasks lose their mission status and are collected.
    assert!(report.gc.removed_tasks.contains(&mission));
    assert!(report.gc.removed_tasks.contains(&child));
    assert!(!engine.plan().contains_task(mission));
    Ok(())
}

#[test]
fn ignored_child_failure_leaves_the_parent_alone() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Ignore);
    let (mut engine, mission, child) = mission_with_child(Some(control.clone()))?;

    engine.plan_mut().call_event(child, STOP)?;
    let report = engine.process_events()?;

    assert_eq!(control.unhandled_kinds(), vec!["ChildFailed".to_string()]);
    assert!(report.exceptions.killed.is_empty());
    assert!(is_running(&engine, mission));
    assert!(engine.plan().is_mission(mission));
    Ok(())
}

#[test]
fn exception_handler_on_the_parent_handles_child_failure() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Escalate);
    let (mut engine, mission, child) = mission_with_child(Some(control.clone()))?;
    let seen = Rc::new(RefCell::new(Vec::new()));
    let handler_seen = seen.clone();
    engine.plan_mut().on_exception(
        mission,
        ErrorFilter::kind("ChildFailed"),
        None,
        Rc::new(
            move |_: &mut Plan, task: TaskId, error: &LocalizedError| -> anyhow::Result<ExceptionAction> {
                handler_seen.borrow_mut().push((task, error.failed_task()));
                Ok(ExceptionAction::Handled)
            },
        ),
    )?;

    engine.plan_mut().call_event(child, STOP)?;
    let report = engine.process_events()?;

    assert_eq!(*seen.borrow(), vec![(mission, Some(child))]);
    assert_eq!(report.exceptions.handled.len(), 1);
    assert_eq!(report.exceptions.handled[0].handled_by, Some(mission));
    assert!(control.unhandled_kinds().is_empty());
    assert!(is_running(&engine, mission));
    Ok(())
}

#[test]
fn passing_handlers_let_the_exception_continue() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Ignore);
    let (mut engine, mission, child) = mission_with_child(Some(control.clone()))?;
    let recorder = Recorder::new();
    let pass_recorder = recorder.clone();
    engine.plan_mut().on_exception(
        mission,
        ErrorFilter::Any,
        None,
        Rc::new(
            move |_: &mut Plan, _: TaskId, _: &LocalizedError| -> anyhow::Result<ExceptionAction> {
                pass_recorder.push("pass");
                Ok(ExceptionAction::Pass)
            },
        ),
    )?;

    engine.plan_mut().call_event(child, STOP)?;
    let report = engine.process_events()?;

    assert_eq!(recorder.entries(), vec!["pass"]);
    assert!(report.exceptions.handled.is_empty());
    assert_eq!(control.unhandled_kinds(), vec!["ChildFailed".to_string()]);
    Ok(())
}

#[test]
fn failing_exception_handler_raises_its_own_exception() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Ignore);
    let (mut engine, mission, child) = mission_with_child(Some(control.clone()))?;
    engine.plan_mut().on_exception(
        mission,
        ErrorFilter::kind("ChildFailed"),
        None,
        Rc::new(
            |_: &mut Plan, _: TaskId, _: &LocalizedError| -> anyhow::Result<ExceptionAction> {
                Err(anyhow!("handler crashed"))
            },
        ),
    )?;

    engine.plan_mut().call_event(child, STOP)?;
    engine.process_events()?;

    assert_eq!(
        control.unhandled_kinds(),
        vec!["ChildFailed".to_string(), "FailedExceptionHandler".to_string()]
    );
    Ok(())
}

#[test]
fn escalated_exception_aborts_the_cycle() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Escalate);
    let (mut engine, _mission, child) = mission_with_child(Some(control))?;

    engine.plan_mut().call_event(child, STOP)?;
    match engine.process_events() {
        Err(PlanError::Aborting(aborting)) => {
            let kinds: Vec<&str> = aborting
                .all_exceptions()
                .iter()
                .map(|e| e.kind().name())
                .collect();
            assert_eq!(kinds, vec!["ChildFailed"]);
        }
        other => return Err(format!("expected Aborting, got {other:?}").into()),
    }
    Ok(())
}

#[test]
fn failed_mission_is_recorded_and_reported() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::KillSubtree);
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    let mut engine = test_engine(plan).with_control(Box::new(control.clone()));
    engine.process_events()?;

    engine.plan_mut().call_event(mission, STOP)?;
    engine.process_events()?;

    assert_eq!(engine.mission_results().get(&mission), Some(&false));
    assert_eq!(control.unhandled_kinds(), vec!["MissionFailed".to_string()]);
    assert!(!engine.plan().contains_task(mission));
    assert!(engine.is_idle());
    Ok(())
}

#[test]
fn failed_planner_reports_planning_failure() -> TestResult {
    init_tracing();
    let control = ScriptedControl::new(ErrorDecision::Ignore);
    let mut plan = test_plan();
    let planned = plan.add_mission(SIMPLE_MODEL)?;
    plan.set_executable(planned, Some(false))?;
    let planner = plan.add_task(SIMPLE_MODEL)?;
    plan.planned_by(planned, planner)?;
    let mut engine = test_engine(plan).with_control(Box::new(control.clone()));

    engine.process_events()?;
    assert!(is_running(&engine, planner));
    assert!(engine.plan().status(planned).is_some_and(|s| s.pending()));

    engine.plan_mut().call_event(planner, STOP)?;
    engine.process_events()?;
    assert_eq!(control.unhandled_kinds(), vec!["PlanningFailed".to_string()]);
    Ok(())
}

#[test]
fn useless_tasks_are_collected() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let pending = plan.add_task(SIMPLE_MODEL)?;
    let running = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(running, START)?;
    let finalized = Recorder::new();
    plan.when_finalized(pending, None, finalized.on_finalized("pending"))?;
    let mut engine = test_engine(plan);

    let report = engine.process_events()?;
    assert!(report.gc.removed_tasks.contains(&pending));
    assert_eq!(report.gc.stopping, vec![running]);
    assert!(!engine.plan().contains_task(pending));
    assert!(!engine.plan().contains_task(running));
    assert_eq!(finalized.entries(), vec!["pending"]);
    Ok(())
}

#[test]
fn deferred_work_runs_at_the_top_of_the_next_cycle() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    let mut engine = test_engine(plan);
    engine.process_events()?;

    let replies = Rc::new(RefCell::new(Vec::new()));
    let ok_replies = replies.clone();
    engine.once_with_reply(
        move |plan: &mut Plan| plan.call_event(mission, SUCCESS),
        move |result| ok_replies.borrow_mut().push(result.is_ok()),
    );
    let err_replies = replies.clone();
    engine.once_with_reply(
        move |plan: &mut Plan| plan.call_event(mission, "nonexistent"),
        move |result| err_replies.borrow_mut().push(result.is_ok()),
    );
    assert!(is_running(&engine, mission));

    engine.process_events()?;
    assert_eq!(*replies.borrow(), vec![true, false]);
    assert_eq!(engine.mission_results().get(&mission), Some(&true));
    Ok(())
}

#[test]
fn garbage_collection_is_refused_during_propagation() -> TestResult {
    let mut plan = test_plan();
    plan.propagate(|plan| {
        assert!(plan.is_propagating());
        match plan.garbage_collect() {
            Err(PlanError::PhaseMismatch(_)) => Ok(()),
            other => Err(PlanError::Argument(format!("unexpected {other:?}"))),
        }
    })?;
    assert!(!plan.is_propagating());
    Ok(())
}

#[test]
fn registered_structure_checks_feed_exception_handling() -> TestResult {
    use planloop::engine::{DecisionControl, StructureError};
    use planloop::errors::{ErrorKind, FailurePoint};

    init_tracing();
    let mut plan = test_plan();
    let mission = plan.add_mission(SIMPLE_MODEL)?;
    plan.add_structure_check(
        "running_missions",
        Rc::new(|plan: &Plan, _: &mut dyn DecisionControl| -> Vec<StructureError> {
            plan.missions()
                .filter(|m| plan.status(*m).is_some_and(|s| s.running()))
                .filter_map(|m| {
                    LocalizedError::new(ErrorKind::TaskNotExecutable, FailurePoint::Task(m), plan)
                        .ok()
                        .map(|error| StructureError {
                            error,
                            involved: vec![m],
                        })
                })
                .collect()
        }),
    );
    assert_eq!(
        plan.structure_check_names(),
        vec!["dependency", "missions", "planning", "running_missions"]
    );

    let control = ScriptedControl::new(ErrorDecision::Ignore);
    let mut engine = test_engine(plan).with_control(Box::new(control.clone()));
    engine.process_events()?;
    assert!(control.unhandled_kinds().is_empty());

    engine.process_events()?;
    assert_eq!(control.unhandled_kinds(), vec!["TaskNotExecutable".to_string()]);
    assert!(is_running(&engine, mission));
    Ok(())
}
