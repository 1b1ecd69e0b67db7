// tests/config_loading.rs

use std::io::Write;

use tempfile::NamedTempFile;

use planloop::config::{
    build_engine, build_plan, default_config_path, load_and_validate, parse_str,
    validate_plan_file, PlanFile,
};
use planloop::errors::PlanError;
use planloop::types::Value;
use planloop_test_utils::builders::{dependency, PlanFileBuilder, TaskConfigBuilder};
use planloop_test_utils::{init_tracing, run_cycles, TestResult};

fn validate(contents: &str) -> Result<PlanFile, PlanError> {
    PlanFile::try_from(parse_str(contents)?)
}

fn expect_config_error(contents: &str, needle: &str) {
    match validate(contents) {
        Err(PlanError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "'{msg}' does not mention '{needle}'");
        }
        Err(e) => panic!("Expected ConfigError, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn full_plan_file_loads_from_disk() -> TestResult {
    init_tracing();
    let mut file = NamedTempFile::new()?;
    write!(
        file,
        r#"
tags = ["Localization"]

[engine]
cycle_period_ms = 20
max_cycles = 7
exit_when_idle = false

[model.Localize]
tags = ["Localization"]
events = {{ located = {{}}, lost = {{ terminal = true }} }}
forward = [["located", "success"]]

[model.Goto]
arguments = ["target"]
defaults = {{ speed = 0.5 }}
events = {{ replan = {{ controllable = true }} }}

[task.loc]
model = "Localize"
succeed_after = 2

[task.nav]
model = "Goto"
mission = true
arguments = {{ target = "dock" }}

[[dependency]]
parent = "nav"
child = "loc"
roles = ["localization"]
success = ["located"]
remove_when_done = false
"#
    )?;

    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.tags, vec!["Localization".to_string()]);
    assert_eq!(cfg.engine.cycle_period_ms, 20);
    assert_eq!(cfg.engine.max_cycles, 7);
    assert!(!cfg.engine.exit_when_idle);

    let localize = &cfg.model["Localize"];
    assert_eq!(localize.effective_parent(), "Simple");
    assert!(localize.events["lost"].terminal);
    assert!(!localize.events["located"].controllable);
    assert!(cfg.model["Goto"].events["replan"].controllable);

    assert_eq!(cfg.task["nav"].effective_model(), "Goto");
    assert_eq!(cfg.task["loc"].succeed_after, Some(2));
    assert_eq!(cfg.dependency.len(), 1);
    assert_eq!(cfg.dependency[0].remove_when_done, Some(false));
    Ok(())
}

#[test]
fn omitted_sections_take_defaults() -> TestResult {
    let cfg = validate("[task.only]\n")?;
    assert_eq!(cfg.engine.cycle_period_ms, 100);
    assert_eq!(cfg.engine.max_cycles, 0);
    assert!(cfg.engine.exit_when_idle);
    assert!(cfg.model.is_empty());
    assert!(cfg.dependency.is_empty());

    let task = &cfg.task["only"];
    assert_eq!(task.effective_model(), "Simple");
    assert!(!task.mission && !task.permanent);
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    match load_and_validate("/definitely/not/here/Plan.toml") {
        Err(PlanError::IoError(_)) => {}
        other => panic!("Expected IoError, got: {other:?}"),
    }
}

#[test]
fn unknown_fields_are_rejected() {
    match validate("[task.a]\ncmd = \"echo a\"\n") {
        Err(PlanError::TomlError(e)) => assert!(e.to_string().contains("cmd")),
        other => panic!("Expected TomlError, got: {other:?}"),
    }
}

#[test]
fn semantic_errors_are_reported() {
    init_tracing();
    expect_config_error("", "at least one");
    expect_config_error("[engine]\ncycle_period_ms = 0\n[task.a]\n", "cycle_period_ms");
    expect_config_error("[task.a]\nmodel = \"Nope\"\n", "unknown model 'Nope'");
    expect_config_error("[model.M]\nparent = \"Nope\"\n[task.a]\n", "unknown parent 'Nope'");
    expect_config_error("[model.M]\ntags = [\"T\"]\n[task.a]\n", "undeclared tag 'T'");
    expect_config_error(
        "[model.M]\nforward = [[\"start\", \"bogus\"]]\n[task.a]\n",
        "unknown event 'bogus'",
    );
    expect_config_error("[model.Simple]\n[task.a]\n", "built-in");
    expect_config_error("tags = [\"M\"]\n[model.M]\n[task.a]\n", "both as a tag and as a model");
    expect_config_error("[task.a]\nsucceed_after = 0\n", "must be >= 1");
    expect_config_error("[task.a]\nplanned_by = \"ghost\"\n", "unknown task 'ghost'");
    expect_config_error("[task.a]\nplanned_by = \"a\"\n", "cannot plan itself");
    expect_config_error(
        "[task.a]\n[[dependency]]\nparent = \"a\"\nchild = \"a\"\n",
        "cannot depend on itself",
    );
    expect_config_error(
        "[task.a]\n[[dependency]]\nparent = \"a\"\nchild = \"b\"\n",
        "unknown task 'b'",
    );
    expect_config_error(
        "[task.a]\n[task.b]\n[[dependency]]\nparent = \"a\"\nchild = \"b\"\nfailure = [\"blocked\"]\n",
        "unknown event 'blocked'",
    );
}

#[test]
fn model_inheritance_cycle_is_a_config_error() {
    expect_config_error(
        "[model.A]\nparent = \"B\"\n[model.B]\nparent = \"A\"\n[task.a]\nmodel = \"A\"\n",
        "model inheritance",
    );
}

#[test]
fn dependency_cycle_returns_relation_cycle() {
    let result = validate(
        r#"
[task.A]
[task.B]

[[dependency]]
parent = "A"
child = "B"

[[dependency]]
parent = "B"
child = "A"
"#,
    );

    match result {
        Err(PlanError::RelationCycle(msg)) => {
            assert!(msg.contains("dependency"));
            assert!(msg.contains('A') || msg.contains('B'));
        }
        Err(e) => panic!("Expected RelationCycle error, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn planning_cycle_returns_relation_cycle() {
    let result = validate(
        r#"
[task.A]
planned_by = "B"

[task.B]
planned_by = "A"
"#,
    );

    match result {
        Err(PlanError::RelationCycle(msg)) => assert!(msg.contains("planning")),
        Err(e) => panic!("Expected RelationCycle error, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn edited_plan_file_can_be_validated_again() -> TestResult {
    let mut cfg = PlanFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new().mission().build())
        .with_task("b", TaskConfigBuilder::new().build())
        .with_dependency("a", "b")
        .build();
    validate_plan_file(&cfg)?;

    cfg.dependency.push(dependency("b", "a"));
    assert!(matches!(
        validate_plan_file(&cfg),
        Err(PlanError::RelationCycle(_))
    ));
    Ok(())
}

#[test]
fn build_plan_instantiates_tasks_and_relations() -> TestResult {
    init_tracing();
    let cfg = validate(
        r#"
tags = ["Localization"]

[model.Localize]
tags = ["Localization"]

[model.Goto]
arguments = ["target"]
defaults = { speed = 0.5 }

[task.loc]
model = "Localize"

[task.nav]
model = "Goto"
mission = true
arguments = { target = "dock" }

[task.watchdog]
permanent = true

[task.planner]

[task.ready]
planned_by = "planner"

[[dependency]]
parent = "nav"
child = "loc"
roles = ["localization"]
consider_in_pending = false
"#,
    )?;

    let built = build_plan(&cfg)?;
    let plan = &built.plan;
    let id = |name: &str| built.tasks[name];
    assert_eq!(built.tasks.len(), 5);

    assert!(plan.is_mission(id("nav")));
    assert!(plan.is_permanent(id("watchdog")));
    assert!(!plan.is_mission(id("loc")));

    assert!(plan.depends_on_task(id("nav"), id("loc")));
    assert_eq!(plan.child_from_role_strict(id("nav"), "localization")?, id("loc"));
    let info = plan
        .dependency_info(id("nav"), id("loc"))
        .ok_or("dependency missing")?;
    assert!(!info.consider_in_pending);

    assert_eq!(plan.planning_task(id("ready")), Some(id("planner")));

    assert_eq!(
        plan.argument(id("nav"), "target"),
        Some(Value::String("dock".into()))
    );
    assert_eq!(plan.argument(id("nav"), "speed"), Some(Value::Float(0.5)));
    assert!(plan.models().is_tag("Localization"));
    assert_eq!(
        plan.task(id("loc")).map(|t| t.model_name().to_string()),
        Some("Localize".to_string())
    );
    Ok(())
}

#[test]
fn build_engine_maps_the_engine_section() -> TestResult {
    let cfg = PlanFileBuilder::new()
        .cycle_period_ms(25)
        .with_task("a", TaskConfigBuilder::new().mission().succeed_after(1).build())
        .build();
    let engine = build_engine(&cfg)?;
    let options = engine.options();
    assert_eq!(options.cycle_period, std::time::Duration::from_millis(25));
    assert_eq!(options.max_cycles, None);
    assert!(options.exit_when_idle);

    let limited = PlanFileBuilder::new()
        .max_cycles(3)
        .exit_when_idle(false)
        .with_task("a", TaskConfigBuilder::new().build())
        .build();
    let engine = build_engine(&limited)?;
    assert_eq!(engine.options().max_cycles, Some(3));
    assert!(!engine.options().exit_when_idle);
    Ok(())
}

#[test]
fn countdown_polls_finish_tasks_from_plan_files() -> TestResult {
    init_tracing();
    let cfg = PlanFileBuilder::new()
        .with_task("good", TaskConfigBuilder::new().mission().succeed_after(1).build())
        .with_task("bad", TaskConfigBuilder::new().mission().fail_after(2).build())
        .build();
    let mut engine = build_engine(&cfg)?;

    // Missions start in the first cycle and are polled from the second on.
    run_cycles(&mut engine, 2)?;
    let results: Vec<bool> = engine.mission_results().values().copied().collect();
    assert_eq!(results, vec![true]);

    engine.process_events()?;
    let mut results: Vec<bool> = engine.mission_results().values().copied().collect();
    results.sort();
    assert_eq!(results, vec![false, true]);
    Ok(())
}

#[test]
fn default_config_path_is_plan_toml() {
    assert_eq!(default_config_path(), std::path::PathBuf::from("Plan.toml"));
}
