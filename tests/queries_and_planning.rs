// tests/queries_and_planning.rs

use planloop::errors::PlanError;
use planloop::plan::{
    call_sibling, emit_sibling, noop_command, ArgumentDefault, DelayedArgument, EventSpec,
    ModelRegistry, Plan, TaskModelBuilder, SIMPLE_MODEL,
};
use planloop::types::{Value, FAILED, START, SUCCESS};
use planloop_test_utils::builders::test_plan;
use planloop_test_utils::{init_tracing, TestResult};

#[test]
fn task_queries_filter_by_model_state_and_mission() -> TestResult {
    init_tracing();
    let mut plan = test_plan();
    let loc = plan.add_task("Localize")?;
    let goto = plan.add_task_with("Goto", [("target", Value::String("dock".into()))])?;
    let mover = plan.add_mission("Move")?;
    plan.call_event(mover, START)?;

    assert_eq!(plan.find_tasks().with_model("Move").to_vec(), vec![goto, mover]);
    assert_eq!(plan.find_tasks().with_model("Localization").to_vec(), vec![loc]);
    assert_eq!(plan.find_tasks().with_model("Move").pending().to_vec(), vec![goto]);
    assert_eq!(plan.find_tasks().running().to_vec(), vec![mover]);
    assert_eq!(plan.find_tasks().pending().count(), 2);
    assert_eq!(plan.find_tasks().missions().first(), Some(mover));
    assert_eq!(plan.find_tasks().model_matching("^Go")?.to_vec(), vec![goto]);

    plan.call_event(mover, SUCCESS)?;
    assert_eq!(plan.find_tasks().succeeded().to_vec(), vec![mover]);
    assert_eq!(plan.find_tasks().finished().count(), 1);
    assert!(plan.find_tasks().failed().to_vec().is_empty());
    Ok(())
}

#[test]
fn invalid_model_pattern_is_an_argument_error() {
    let plan = Plan::new();
    match plan.find_tasks().model_matching("(") {
        Err(PlanError::Argument(msg)) => assert!(msg.contains("invalid model pattern")),
        other => panic!("Expected Argument error, got: {other:?}"),
    }
}

#[test]
fn planning_relation_links_planner_and_planned() -> TestResult {
    let mut plan = Plan::new();
    let planned = plan.add_task(SIMPLE_MODEL)?;
    let planner = plan.add_task(SIMPLE_MODEL)?;

    plan.planned_by(planned, planner)?;
    assert_eq!(plan.planning_task(planned), Some(planner));
    assert_eq!(plan.planned_tasks(planner), vec![planned]);

    assert!(matches!(
        plan.planned_by(planned, planned),
        Err(PlanError::RelationCycle(_))
    ));
    assert!(matches!(
        plan.planned_by(planner, planned),
        Err(PlanError::RelationCycle(_))
    ));

    assert!(plan.remove_planning(planned, planner));
    assert!(!plan.remove_planning(planned, planner));
    assert_eq!(plan.planning_task(planned), None);
    Ok(())
}

#[test]
fn planner_reads_arguments_of_the_planned_task() -> TestResult {
    init_tracing();
    let mut registry = ModelRegistry::new();
    registry.register(TaskModelBuilder::new("Explore").argument("area"))?;
    registry.register(TaskModelBuilder::new("Survey").argument_with_default(
        "area",
        ArgumentDefault::Delayed(DelayedArgument::from_planned_task("area")),
    ))?;
    let mut plan = Plan::with_models(registry);

    let explore = plan.add_task_with("Explore", [("area", Value::String("north".into()))])?;
    let survey = plan.add_task("Survey")?;
    assert!(!plan.fully_instantiated(survey));
    assert_eq!(plan.argument(survey, "area"), None);

    plan.planned_by(explore, survey)?;
    assert!(plan.fully_instantiated(survey));
    assert_eq!(plan.argument(survey, "area"), Some(Value::String("north".into())));
    Ok(())
}

#[test]
fn meaningful_arguments_skip_undeclared_ones() -> TestResult {
    let mut plan = test_plan();
    let goto = plan.add_task_with("Goto", [("target", Value::String("dock".into()))])?;
    plan.set_argument(goto, "note", Value::String("scratch".into()))?;

    let meaningful = plan.meaningful_arguments(goto);
    assert_eq!(meaningful.len(), 1);
    assert_eq!(meaningful.get("target"), Some(&Value::String("dock".into())));
    Ok(())
}

#[test]
fn sibling_commands_route_calls_within_the_task() -> TestResult {
    init_tracing();
    let mut registry = ModelRegistry::new();
    registry.register(
        TaskModelBuilder::new("Dock")
            .parent(SIMPLE_MODEL)
            .event("dock", EventSpec::new().command(call_sibling(SUCCESS)))
            .event("abandon", EventSpec::new().command(emit_sibling(FAILED)))
            .event("ping", EventSpec::new().command(noop_command())),
    )?;
    let mut plan = Plan::with_models(registry);

    let docking = plan.add_task("Dock")?;
    plan.call_event(docking, START)?;
    plan.call_event(docking, "ping")?;
    let ping = plan.task_event(docking, "ping")?;
    assert!(!plan.generator(ping).is_some_and(|g| g.happened()));

    plan.call_event(docking, "dock")?;
    let status = plan.status(docking).ok_or("task vanished")?;
    assert!(status.success());
    let dock = plan.task_event(docking, "dock")?;
    assert!(!plan.generator(dock).is_some_and(|g| g.happened()));

    let abandoned = plan.add_task("Dock")?;
    plan.call_event(abandoned, START)?;
    plan.call_event(abandoned, "abandon")?;
    let status = plan.status(abandoned).ok_or("task vanished")?;
    assert!(status.failed());
    Ok(())
}
