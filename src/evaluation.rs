//! Threshold rules applied to incoming results
//!
//! A job may carry any number of rules; a result passes only when every rule
//! holds. The evaluator remembers which jobs are currently failing so that a
//! violation is reported once per streak and the recovery once at its end.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{JobId, ResultValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Less => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterOrEqual => ">=",
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Comparator::Less => ordering == Ordering::Less,
            Comparator::LessOrEqual => ordering != Ordering::Greater,
            Comparator::Greater => ordering == Ordering::Greater,
            Comparator::GreaterOrEqual => ordering != Ordering::Less,
            Comparator::Equal => ordering == Ordering::Equal,
            Comparator::NotEqual => ordering != Ordering::Equal,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Comparator::Less),
            "<=" => Ok(Comparator::LessOrEqual),
            ">" => Ok(Comparator::Greater),
            ">=" => Ok(Comparator::GreaterOrEqual),
            "==" => Ok(Comparator::Equal),
            "!=" => Ok(Comparator::NotEqual),
            other => Err(anyhow::anyhow!("unknown comparator '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Int(v) => write!(f, "{v}"),
            Threshold::Float(v) => write!(f, "{v}"),
            Threshold::Text(v) => write!(f, "'{v}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Value and threshold are not comparable (e.g. text against a number).
    TypeMismatch { value: String, threshold: String },
    /// Lists are evaluated element by element, never as a whole.
    Composite,
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationError::TypeMismatch { value, threshold } => {
                write!(f, "cannot compare {value} against {threshold}")
            }
            EvaluationError::Composite => write!(f, "lists cannot be compared directly"),
        }
    }
}

impl std::error::Error for EvaluationError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub comparator: Comparator,
    pub threshold: Threshold,
}

impl Rule {
    pub fn new(comparator: Comparator, threshold: Threshold) -> Self {
        Self {
            comparator,
            threshold,
        }
    }

    pub fn holds(&self, value: &ResultValue) -> Result<bool, EvaluationError> {
        let ordering = match (value, &self.threshold) {
            (ResultValue::Int(v), Threshold::Int(t)) => Some(v.cmp(t)),
            (ResultValue::Int(v), Threshold::Float(t)) => (*v as f64).partial_cmp(t),
            (ResultValue::Float(v), Threshold::Int(t)) => v.partial_cmp(&(*t as f64)),
            (ResultValue::Float(v), Threshold::Float(t)) => v.partial_cmp(t),
            (ResultValue::Text(v), Threshold::Text(t)) => Some(v.as_str().cmp(t.as_str())),
            (ResultValue::List(_), _) => return Err(EvaluationError::Composite),
            (value, threshold) => {
                return Err(EvaluationError::TypeMismatch {
                    value: value.to_string(),
                    threshold: threshold.to_string(),
                });
            }
        };
        // NaN only satisfies `!=`
        Ok(match ordering {
            Some(ordering) => self.comparator.accepts(ordering),
            None => self.comparator == Comparator::NotEqual,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultEvaluation {
    Ok,
    Failing,
    StartsToFail,
    BackToOk,
}

impl ResultEvaluation {
    pub fn evaluate(passed: bool, previously_failing: bool) -> ResultEvaluation {
        match (passed, previously_failing) {
            (true, false) => ResultEvaluation::Ok,
            (true, true) => ResultEvaluation::BackToOk,
            (false, false) => ResultEvaluation::StartsToFail,
            (false, true) => ResultEvaluation::Failing,
        }
    }
}

/// Per-job rules plus the set of jobs currently in violation.
#[derive(Debug, Default)]
pub struct Evaluator {
    rules: HashMap<JobId, Vec<Rule>>,
    failing: HashSet<JobId>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&mut self, job_id: JobId, rules: Vec<Rule>) {
        if rules.is_empty() {
            self.rules.remove(&job_id);
        } else {
            self.rules.insert(job_id, rules);
        }
    }

    pub fn rules(&self, job_id: JobId) -> &[Rule] {
        self.rules.get(&job_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn clear(&mut self, job_id: JobId) {
        self.rules.remove(&job_id);
        self.failing.remove(&job_id);
    }

    pub fn is_failing(&self, job_id: JobId) -> bool {
        self.failing.contains(&job_id)
    }

    /// Evaluates a scalar value. Jobs without rules always evaluate to `Ok`.
    pub fn evaluate(
        &mut self,
        job_id: JobId,
        value: &ResultValue,
    ) -> Result<ResultEvaluation, EvaluationError> {
        let Some(rules) = self.rules.get(&job_id) else {
            return Ok(ResultEvaluation::Ok);
        };

        let mut passed = true;
        for rule in rules {
            passed &= rule.holds(value)?;
        }

        let evaluation = ResultEvaluation::evaluate(passed, self.failing.contains(&job_id));
        match evaluation {
            ResultEvaluation::StartsToFail => {
                self.failing.insert(job_id);
            }
            ResultEvaluation::BackToOk => {
                self.failing.remove(&job_id);
            }
            ResultEvaluation::Ok | ResultEvaluation::Failing => {}
        }
        Ok(evaluation)
    }
}
