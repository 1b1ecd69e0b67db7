// src/relations/predicate.rs

//! Event predicates used by the dependency relation.
//!
//! A predicate is evaluated against one task and yields three things:
//! - its current value;
//! - whether that value is static (can no longer change, because the
//!   events involved were emitted or became unreachable);
//! - an explanation: the emission or the unreachability that settled it.

use std::fmt;

use crate::plan::{Plan, UnreachableReason};
use crate::types::{EventId, GeneratorId, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Const(bool),
    /// True once the named event has been emitted.
    Emitted(String),
    /// True once the named event became unreachable without being emitted.
    Never(String),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone)]
pub enum Explanation {
    Emitted(EventId),
    Unreachable {
        generator: GeneratorId,
        reason: Option<UnreachableReason>,
    },
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: bool,
    pub is_static: bool,
    pub explanation: Option<Explanation>,
}

impl Evaluation {
    fn constant(value: bool) -> Self {
        Self {
            value,
            is_static: true,
            explanation: None,
        }
    }

    fn open(value: bool) -> Self {
        Self {
            value,
            is_static: false,
            explanation: None,
        }
    }

    /// False and can never become true.
    pub fn is_static_false(&self) -> bool {
        !self.value && self.is_static
    }
}

impl Predicate {
    pub fn emitted(event: impl Into<String>) -> Self {
        Predicate::Emitted(event.into())
    }

    pub fn never(event: impl Into<String>) -> Self {
        Predicate::Never(event.into())
    }

    /// Disjunction of `emitted` over `events`; `None` when `events` is empty.
    pub fn any_emitted<I, S>(events: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        events
            .into_iter()
            .map(|e| Predicate::Emitted(e.into()))
            .reduce(Predicate::or)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Predicate::Const(v) => Predicate::Const(!v),
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Const(true), p) | (p, Predicate::Const(true)) => p,
            (Predicate::Const(false), _) | (_, Predicate::Const(false)) => Predicate::Const(false),
            (a, b) if a == b => a,
            (a, b) => Predicate::And(Box::new(a), Box::new(b)),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Const(false), p) | (p, Predicate::Const(false)) => p,
            (Predicate::Const(true), _) | (_, Predicate::Const(true)) => Predicate::Const(true),
            (a, b) if a == b => a,
            (a, b) => Predicate::Or(Box::new(a), Box::new(b)),
        }
    }

    /// Event names the predicate refers to.
    pub fn events(&self) -> Vec<&str> {
        let mut result = Vec::new();
        self.collect_events(&mut result);
        result
    }

    fn collect_events<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Const(_) => {}
            Predicate::Emitted(e) | Predicate::Never(e) => {
                if !out.contains(&e.as_str()) {
                    out.push(e);
                }
            }
            Predicate::Not(p) => p.collect_events(out),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_events(out);
                b.collect_events(out);
            }
        }
    }

    pub fn evaluate(&self, plan: &Plan, task: TaskId) -> Evaluation {
        match self {
            Predicate::Const(v) => Evaluation::constant(*v),
            Predicate::Emitted(name) => {
                let Some(generator) = plan.task(task).and_then(|t| t.event(name)) else {
                    return Evaluation::constant(false);
                };
                let Some(g) = plan.generator(generator) else {
                    return Evaluation::constant(false);
                };
                if let Some(event) = g.last() {
                    Evaluation {
                        value: true,
                        is_static: true,
                        explanation: Some(Explanation::Emitted(event)),
                    }
                } else if g.is_unreachable() {
                    Evaluation {
                        value: false,
                        is_static: true,
                        explanation: Some(Explanation::Unreachable {
                            generator,
                            reason: g.unreachability_reason().cloned(),
                        }),
                    }
                } else {
                    Evaluation::open(false)
                }
            }
            Predicate::Never(name) => {
                let Some(generator) = plan.task(task).and_then(|t| t.event(name)) else {
                    return Evaluation::constant(true);
                };
                let Some(g) = plan.generator(generator) else {
                    return Evaluation::constant(true);
                };
                if let Some(event) = g.last() {
                    Evaluation {
                        value: false,
                        is_static: true,
                        explanation: Some(Explanation::Emitted(event)),
                    }
                } else if g.is_unreachable() {
                    Evaluation {
                        value: true,
                        is_static: true,
                        explanation: Some(Explanation::Unreachable {
                            generator,
                            reason: g.unreachability_reason().cloned(),
                        }),
                    }
                } else {
                    Evaluation::open(false)
                }
            }
            Predicate::Not(p) => {
                let e = p.evaluate(plan, task);
                Evaluation {
                    value: !e.value,
                    ..e
                }
            }
            Predicate::And(a, b) => {
                let ea = a.evaluate(plan, task);
                if ea.is_static_false() {
                    return ea;
                }
                let eb = b.evaluate(plan, task);
                if eb.is_static_false() {
                    return eb;
                }
                let value = ea.value && eb.value;
                Evaluation {
                    value,
                    is_static: ea.is_static && eb.is_static,
                    explanation: if value {
                        eb.explanation.or(ea.explanation)
                    } else {
                        None
                    },
                }
            }
            Predicate::Or(a, b) => {
                let ea = a.evaluate(plan, task);
                if ea.value && ea.is_static {
                    return ea;
                }
                let eb = b.evaluate(plan, task);
                if eb.value && eb.is_static {
                    return eb;
                }
                let value = ea.value || eb.value;
                let is_static = ea.is_static && eb.is_static;
                let explanation = if value {
                    if ea.value { ea.explanation } else { eb.explanation }
                } else if is_static {
                    ea.explanation.or(eb.explanation)
                } else {
                    None
                };
                Evaluation {
                    value,
                    is_static,
                    explanation,
                }
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Const(v) => write!(f, "{v}"),
            Predicate::Emitted(e) => write!(f, "{e}?"),
            Predicate::Never(e) => write!(f, "{e}.never"),
            Predicate::Not(p) => write!(f, "!({p})"),
            Predicate::And(a, b) => write!(f, "({a} && {b})"),
            Predicate::Or(a, b) => write!(f, "({a} || {b})"),
        }
    }
}
