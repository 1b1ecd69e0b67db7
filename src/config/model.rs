// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::types::Value;

/// Plan file as read from TOML, before validation.
///
/// ```toml
/// tags = ["Localization"]
///
/// [engine]
/// cycle_period_ms = 50
/// max_cycles = 100
///
/// [model.Localize]
/// tags = ["Localization"]
/// events = { located = {} }
/// forward = [["located", "success"]]
///
/// [task.loc]
/// model = "Localize"
/// succeed_after = 2
///
/// [task.nav]
/// mission = true
/// succeed_after = 5
///
/// [[dependency]]
/// parent = "nav"
/// child = "loc"
/// roles = ["localization"]
/// ```
///
/// All sections except `[task.*]` are optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPlanFile {
    /// Tags that models can declare (`[model.X].tags`).
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub engine: EngineSection,

    /// Task models from `[model.<Name>]`.
    #[serde(default)]
    pub model: BTreeMap<String, ModelConfig>,

    /// Task instances from `[task.<name>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    #[serde(default)]
    pub dependency: Vec<DependencyConfig>,
}

/// Validated plan file. Build with `PlanFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct PlanFile {
    pub tags: Vec<String>,
    pub engine: EngineSection,
    pub model: BTreeMap<String, ModelConfig>,
    pub task: BTreeMap<String, TaskConfig>,
    pub dependency: Vec<DependencyConfig>,
}

impl PlanFile {
    pub(crate) fn new_unchecked(raw: RawPlanFile) -> Self {
        Self {
            tags: raw.tags,
            engine: raw.engine,
            model: raw.model,
            task: raw.task,
            dependency: raw.dependency,
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_cycle_period_ms")]
    pub cycle_period_ms: u64,

    /// 0 means no limit.
    #[serde(default)]
    pub max_cycles: u64,

    /// Stop once no mission or permanent task is left running.
    #[serde(default = "default_exit_when_idle")]
    pub exit_when_idle: bool,
}

fn default_cycle_period_ms() -> u64 {
    100
}

fn default_exit_when_idle() -> bool {
    true
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            cycle_period_ms: default_cycle_period_ms(),
            max_cycles: 0,
            exit_when_idle: default_exit_when_idle(),
        }
    }
}

/// `[model.<Name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Parent model. Defaults to `Simple`.
    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Required arguments.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Arguments with a default value.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,

    #[serde(default)]
    pub events: BTreeMap<String, EventConfig>,

    #[serde(default)]
    pub forward: Vec<[String; 2]>,

    #[serde(default)]
    pub signal: Vec<[String; 2]>,

    #[serde(default)]
    pub causal_link: Vec<[String; 2]>,
}

impl ModelConfig {
    pub fn effective_parent(&self) -> &str {
        self.parent.as_deref().unwrap_or(crate::plan::SIMPLE_MODEL)
    }

    /// Every `[from, to]` pair of the model's event relations.
    pub fn edges(&self) -> impl Iterator<Item = &[String; 2]> {
        self.forward
            .iter()
            .chain(&self.signal)
            .chain(&self.causal_link)
    }
}

/// `<event> = { controllable = true, terminal = false }`.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    #[serde(default)]
    pub controllable: bool,

    #[serde(default)]
    pub terminal: bool,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Defaults to `Simple`.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,

    #[serde(default)]
    pub mission: bool,

    #[serde(default)]
    pub permanent: bool,

    /// Name of the task planning this one.
    #[serde(default)]
    pub planned_by: Option<String>,

    /// Emit `success` after this many polls.
    #[serde(default)]
    pub succeed_after: Option<u32>,

    /// Emit `failed` after this many polls.
    #[serde(default)]
    pub fail_after: Option<u32>,
}

impl TaskConfig {
    pub fn effective_model(&self) -> &str {
        self.model.as_deref().unwrap_or(crate::plan::SIMPLE_MODEL)
    }
}

/// `[[dependency]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyConfig {
    pub parent: String,
    pub child: String,

    /// Events of the child that complete the dependency. Defaults to
    /// `["success"]`; an empty list means it never completes.
    #[serde(default)]
    pub success: Option<Vec<String>>,

    #[serde(default)]
    pub failure: Vec<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub remove_when_done: Option<bool>,

    #[serde(default)]
    pub consider_in_pending: Option<bool>,
}
