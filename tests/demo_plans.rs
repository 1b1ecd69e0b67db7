// tests/demo_plans.rs

use std::path::PathBuf;

use clap::Parser;

use planloop::cli::CliArgs;
use planloop::config::{build_engine, build_plan, load_and_validate};
use planloop::engine::{Runtime, StopReason};
use planloop_test_utils::{init_tracing, with_timeout, TestResult};

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

#[tokio::test]
async fn navigation_demo_completes_its_mission() -> TestResult {
    init_tracing();
    let cfg = load_and_validate(demo("navigation.toml"))?;
    assert_eq!(cfg.engine.max_cycles, 100);

    let built = build_plan(&cfg)?;
    let nav = built.tasks["goto_dock"];
    let loc = built.tasks["localization"];
    assert!(built.plan.depends_on_task(nav, loc));

    let (runtime, _handle) = Runtime::new(build_engine(&cfg)?, 8);
    let summary = with_timeout(runtime.run()).await?;
    assert_eq!(summary.reason, StopReason::Idle);
    assert_eq!(summary.missions_succeeded, 1);
    assert_eq!(summary.missions_failed, 0);
    assert!(summary.cycles >= 5);
    Ok(())
}

#[tokio::test]
async fn failing_mission_demo_reports_the_failure() -> TestResult {
    init_tracing();
    let cfg = load_and_validate(demo("failing_mission.toml"))?;
    let (runtime, _handle) = Runtime::new(build_engine(&cfg)?, 8);

    let summary = with_timeout(runtime.run()).await?;
    assert_eq!(summary.reason, StopReason::Idle);
    assert_eq!(summary.missions_failed, 1);
    assert_eq!(summary.cycles, 3);
    Ok(())
}

#[tokio::test]
async fn planning_demo_runs_planner_and_mission() -> TestResult {
    init_tracing();
    let cfg = load_and_validate(demo("planning.toml"))?;
    let built = build_plan(&cfg)?;
    assert_eq!(
        built.plan.planning_task(built.tasks["deliver"]),
        Some(built.tasks["planner"])
    );

    let (runtime, _handle) = Runtime::new(build_engine(&cfg)?, 8);
    let summary = with_timeout(runtime.run()).await?;
    assert_eq!(summary.missions_succeeded, 1);
    assert_eq!(summary.reason, StopReason::Idle);
    Ok(())
}

#[tokio::test]
async fn dry_run_does_not_execute() -> TestResult {
    init_tracing();
    let path = demo("navigation.toml");
    let args = CliArgs::try_parse_from([
        "planloop",
        "--config",
        path.to_str().ok_or("non-utf8 path")?,
        "--dry-run",
    ])?;
    assert!(args.dry_run);
    let summary = with_timeout(planloop::run(args)).await?;
    assert!(summary.is_none());
    Ok(())
}

#[tokio::test]
async fn cli_cycle_limit_overrides_the_plan_file() -> TestResult {
    init_tracing();
    let path = demo("navigation.toml");
    let args = CliArgs::try_parse_from([
        "planloop",
        "--config",
        path.to_str().ok_or("non-utf8 path")?,
        "--max-cycles",
        "2",
        "--log-level",
        "debug",
    ])?;
    assert_eq!(args.max_cycles, Some(2));
    assert!(args.log_level.is_some());
    let summary = with_timeout(planloop::run(args)).await?.ok_or("no summary")?;
    assert_eq!(summary.reason, StopReason::MaxCycles);
    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.missions_succeeded, 0);
    Ok(())
}

#[test]
fn cli_defaults_to_plan_toml() -> TestResult {
    let args = CliArgs::try_parse_from(["planloop"])?;
    assert_eq!(args.config, "Plan.toml");
    assert_eq!(args.max_cycles, None);
    assert!(!args.dry_run);
    Ok(())
}
