// tests/task_lifecycle.rs

use std::rc::Rc;

use planloop::errors::PlanError;
use planloop::plan::{
    ArgumentDefault, DelayedArgument, Event, EventSpec, Lifecycle, Plan, TaskModelBuilder,
    SIMPLE_MODEL,
};
use planloop::types::{EventRelation, TerminalKind, Value, FAILED, INTERNAL_ERROR, START, STOP, SUCCESS};
use planloop_test_utils::builders::test_plan;
use planloop_test_utils::recorder::Recorder;
use planloop_test_utils::{init_tracing, TestResult};

#[test]
fn simple_task_starts_and_succeeds() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;

    assert_eq!(plan.status(task).map(|s| s.lifecycle), Some(Lifecycle::Pending));

    plan.call_event(task, START)?;
    let status = plan.status(task).ok_or("task vanished")?;
    assert!(status.running());
    assert!(status.started());

    plan.call_event(task, SUCCESS)?;
    let status = plan.status(task).ok_or("task vanished")?;
    assert!(status.finished());
    assert!(status.success());

    // success forwards to stop, which ends the task.
    let stop = plan.task_event(task, STOP)?;
    assert_eq!(plan.generator(stop).map(|g| g.history().len()), Some(1));
    Ok(())
}

#[test]
fn stopping_a_simple_task_fails_it() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(task, START)?;
    plan.call_event(task, STOP)?;

    let status = plan.status(task).ok_or("task vanished")?;
    assert!(status.finished());
    assert!(status.failed());

    let t = plan.task(task).ok_or("task vanished")?;
    let failed = plan.task_event(task, FAILED)?;
    let failure = t.failure_event().ok_or("no failure event")?;
    assert_eq!(plan.event(failure).map(|e| e.generator()), Some(failed));
    Ok(())
}

#[test]
fn finished_task_events_are_unreachable() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    plan.call_event(task, START)?;
    plan.call_event(task, SUCCESS)?;

    let start = plan.task_event(task, START)?;
    assert!(plan.generator(start).is_some_and(|g| g.is_unreachable()));

    let err = plan.call_event(task, FAILED).expect_err("event should be unreachable");
    assert_eq!(err.kind_name(), Some("EventNotExecutable"));
    Ok(())
}

#[test]
fn events_of_a_pending_task_cannot_be_used_before_start() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;

    let err = plan.call_event(task, SUCCESS).expect_err("task is not running");
    assert_eq!(err.kind_name(), Some("EventNotExecutable"));
    assert!(plan.status(task).is_some_and(|s| s.pending()));
    Ok(())
}

#[test]
fn contingent_events_cannot_be_called() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let task = plan.add_task("Move")?;
    plan.call_event(task, START)?;

    let err = plan.call_event(task, "blocked").expect_err("blocked is contingent");
    assert_eq!(err.kind_name(), Some("EventNotControlable"));

    // ... but can be emitted, and lead to failure.
    plan.emit_event(task, "blocked")?;
    assert!(plan.status(task).is_some_and(|s| s.finished() && s.failed()));
    Ok(())
}

#[test]
fn terminal_events_are_classified_from_relations() -> TestResult {
    let plan = test_plan();
    let localize = plan.models().get_or_err("Localize")?;
    assert_eq!(
        localize.event("located").and_then(|e| e.terminal_kind()),
        Some(TerminalKind::Success)
    );
    assert_eq!(
        localize.event(INTERNAL_ERROR).and_then(|e| e.terminal_kind()),
        Some(TerminalKind::Failure)
    );
    assert_eq!(localize.event(STOP).and_then(|e| e.terminal_kind()), Some(TerminalKind::Stop));
    assert!(localize.event(START).is_some_and(|e| !e.is_terminal()));

    let moving = plan.models().get_or_err("Move")?;
    assert_eq!(
        moving.event("blocked").and_then(|e| e.terminal_kind()),
        Some(TerminalKind::Failure)
    );
    Ok(())
}

#[test]
fn declared_terminal_event_gets_forwarded_to_stop() -> TestResult {
    let mut plan = Plan::new();
    plan.models_mut().register(
        TaskModelBuilder::new("Dock")
            .parent(SIMPLE_MODEL)
            .event("docked", EventSpec::controllable().terminal()),
    )?;
    let dock = plan.models().get_or_err("Dock")?;
    assert!(dock
        .forwards()
        .iter()
        .any(|(from, to)| from == "docked" && to == STOP));

    let task = plan.add_task("Dock")?;
    plan.call_event(task, START)?;
    plan.call_event(task, "docked")?;
    let status = plan.status(task).ok_or("task vanished")?;
    assert!(status.finished());
    assert_eq!(status.success, None);
    Ok(())
}

#[test]
fn terminal_event_cannot_lead_to_non_terminal_event() {
    let mut plan = Plan::new();
    let err = plan
        .models_mut()
        .register(
            TaskModelBuilder::new("Bad")
                .parent(SIMPLE_MODEL)
                .event("progress", EventSpec::new())
                .forward(SUCCESS, "progress"),
        )
        .expect_err("model should be rejected");
    assert!(matches!(err, PlanError::Argument(_)));
}

#[test]
fn signals_need_a_controllable_target() {
    let mut plan = Plan::new();
    let err = plan
        .models_mut()
        .register(
            TaskModelBuilder::new("Bad")
                .parent(SIMPLE_MODEL)
                .event("ready", EventSpec::new())
                .signal(START, "ready"),
        )
        .expect_err("ready is not controllable");
    assert!(matches!(err, PlanError::Argument(_)));
}

#[test]
fn models_inherit_and_provide_tags() -> TestResult {
    let plan = test_plan();
    let models = plan.models();
    assert!(models.is_subclass("Goto", "Move"));
    assert!(models.is_subclass("Goto", SIMPLE_MODEL));
    assert!(!models.is_subclass("Move", "Goto"));

    let localize = models.get_or_err("Localize")?;
    assert!(localize.fullfills("Localization"));
    assert!(localize.fullfills(SIMPLE_MODEL));
    assert!(!localize.fullfills("Move"));
    Ok(())
}

#[test]
fn abstract_tasks_are_not_executable() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task("Task")?;
    assert!(!plan.is_executable(task));

    let err = plan.call_event(task, START).expect_err("abstract task");
    assert_eq!(err.kind_name(), Some("TaskEventNotExecutable"));
    Ok(())
}

#[test]
fn missing_arguments_make_a_task_partially_instantiated() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let task = plan.add_task("Goto")?;
    assert_eq!(plan.missing_arguments(task), vec!["target".to_string()]);
    assert!(!plan.is_executable(task));
    assert!(plan
        .non_executable_cause(task)
        .is_some_and(|c| c.contains("partially instantiated")));

    plan.set_argument(task, "target", Value::String("dock".into()))?;
    assert!(plan.fully_instantiated(task));
    assert!(plan.is_executable(task));
    plan.call_event(task, START)?;
    assert!(plan.status(task).is_some_and(|s| s.running()));
    Ok(())
}

#[test]
fn arguments_are_set_once() -> TestResult {
    let mut plan = test_plan();
    let task = plan.add_task_with("Goto", [("target", Value::String("dock".into()))])?;

    // Same value again is fine.
    plan.set_argument(task, "target", Value::String("dock".into()))?;
    let err = plan
        .set_argument(task, "target", Value::String("lab".into()))
        .expect_err("argument already set");
    assert!(matches!(err, PlanError::Argument(_)));
    assert_eq!(plan.argument(task, "target"), Some(Value::String("dock".into())));
    Ok(())
}

#[test]
fn default_and_delayed_arguments_resolve_from_the_plan() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    plan.models_mut().register(
        TaskModelBuilder::new("Survey")
            .parent(SIMPLE_MODEL)
            .argument_with_default("speed", ArgumentDefault::Value(Value::Float(0.5)))
            .argument("area"),
    )?;
    let survey = plan.add_task("Survey")?;
    let planner = plan.add_task_with(SIMPLE_MODEL, [("area", Value::String("north".into()))])?;

    assert_eq!(plan.argument(survey, "speed"), Some(Value::Float(0.5)));
    assert_eq!(plan.argument(survey, "area"), None);

    // Delayed value read from the task planned by the survey's planner.
    plan.set_delayed_argument(
        survey,
        "area",
        DelayedArgument::new(move |plan, _| plan.static_argument(planner, "area")),
    )?;
    assert!(plan.is_executable(survey));
    assert_eq!(plan.argument(survey, "area"), Some(Value::String("north".into())));
    assert_eq!(plan.static_argument(survey, "area"), None);

    // Starting freezes delayed values and defaults into plain arguments.
    plan.call_event(survey, START)?;
    assert_eq!(plan.static_argument(survey, "area"), Some(Value::String("north".into())));
    assert_eq!(plan.static_argument(survey, "speed"), Some(Value::Float(0.5)));
    Ok(())
}

#[test]
fn executable_flag_cannot_change_while_running() -> TestResult {
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    plan.set_executable(task, Some(false))?;
    assert!(plan.call_event(task, START).is_err());

    plan.set_executable(task, None)?;
    plan.call_event(task, START)?;
    let err = plan
        .set_executable(task, Some(false))
        .expect_err("task is running");
    assert!(matches!(err, PlanError::ModelViolation(_)));
    Ok(())
}

#[test]
fn non_executable_plan_refuses_calls() -> TestResult {
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    plan.set_plan_executable(false);
    let err = plan.call_event(task, START).expect_err("plan is not executable");
    assert_eq!(err.kind_name(), Some("TaskEventNotExecutable"));
    Ok(())
}

#[test]
fn queries_filter_by_model_and_state() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let loc = plan.add_task("Localize")?;
    let mv = plan.add_task("Move")?;
    let goto = plan.add_task_with("Goto", [("target", Value::String("dock".into()))])?;
    plan.add_mission_task(goto)?;
    plan.call_event(mv, START)?;

    assert_eq!(plan.find_tasks().with_model("Localization").to_vec(), vec![loc]);
    assert_eq!(plan.find_tasks().with_model("Move").to_vec(), vec![mv, goto]);
    assert_eq!(plan.find_tasks().with_model("Move").running().to_vec(), vec![mv]);
    assert_eq!(plan.find_tasks().pending().count(), 2);
    assert_eq!(plan.find_tasks().missions().first(), Some(goto));
    assert_eq!(plan.find_tasks().model_matching("^Go")?.to_vec(), vec![goto]);
    assert!(plan.find_tasks().model_matching("(").is_err());
    Ok(())
}

#[test]
fn task_is_finishing_between_success_and_stop() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let recorder = Recorder::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    let success = plan.task_event(task, SUCCESS)?;
    let seen = recorder.clone();
    plan.on_event(
        success,
        None,
        Rc::new(move |plan: &mut Plan, _: &Event| -> anyhow::Result<()> {
            if let Some(status) = plan.status(task) {
                seen.push(format!("{:?} running={}", status.lifecycle, status.running()));
            }
            Ok(())
        }),
    )?;

    plan.call_event(task, START)?;
    plan.call_event(task, SUCCESS)?;

    assert_eq!(recorder.entries(), vec!["Finishing running=true"]);
    assert_eq!(plan.status(task).map(|s| s.lifecycle), Some(Lifecycle::Finished));
    Ok(())
}

#[test]
fn refused_forwarding_keeps_terminal_flags() -> TestResult {
    init_tracing();
    let mut plan = Plan::new();
    let task = plan.add_task(SIMPLE_MODEL)?;
    let start = plan.task_event(task, START)?;
    let stop = plan.task_event(task, STOP)?;

    let err = plan.add_forwarding(stop, start).expect_err("stop cannot lead to start");
    assert!(matches!(err, PlanError::Argument(msg) if msg.contains("non-terminal")));
    assert!(!plan.has_event_relation(EventRelation::Forwarding, stop, start));
    assert!(plan.generator(start).is_some_and(|g| !g.is_terminal()));
    assert!(plan.generator(stop).is_some_and(|g| g.is_terminal()));

    plan.call_event(task, START)?;
    assert!(plan.status(task).is_some_and(|s| s.lifecycle == Lifecycle::Running));
    Ok(())
}
