//! Condition evaluation shared by if-else nodes and loop break checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::variables::{Segment, Selector, VariablePool};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "all of")]
    AllOf,
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "≠", alias = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "≥", alias = ">=")]
    Ge,
    #[serde(rename = "≤", alias = "<=")]
    Le,
    #[serde(rename = "null", alias = "not exists")]
    Null,
    #[serde(rename = "not null", alias = "exists")]
    NotNull,
}

/// One comparison against a pool variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable_selector: Selector,
    pub comparison_operator: ComparisonOperator,
    /// Expected value; strings may contain `{{#node.var#}}` placeholders.
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn evaluate(&self, pool: &VariablePool) -> bool {
        let actual = pool.get(&self.variable_selector);
        compare(self.comparison_operator, actual.as_ref(), &self.value, pool)
    }
}

/// Evaluate a condition group, short-circuiting like `&&`/`||`.
///
/// An empty group is true under `and` and false under `or`.
pub fn evaluate_all(pool: &VariablePool, conditions: &[Condition], op: LogicalOperator) -> bool {
    match op {
        LogicalOperator::And => conditions.iter().all(|c| c.evaluate(pool)),
        LogicalOperator::Or => conditions.iter().any(|c| c.evaluate(pool)),
    }
}

/// Every selector a condition group reads, including ones inside expected values.
pub fn selectors(conditions: &[Condition]) -> Vec<Selector> {
    let mut out = Vec::new();
    for c in conditions {
        out.push(c.variable_selector.clone());
        if let Value::String(s) = &c.value {
            out.extend(strand_core::variables::template::selectors(s));
        }
    }
    out
}

fn expected_text(value: &Value, pool: &VariablePool) -> String {
    match value {
        Value::String(s) => pool.convert_template(s),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn expected_list(value: &Value, pool: &VariablePool) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(|v| expected_text(v, pool)).collect(),
        Value::String(s) => {
            let rendered = pool.convert_template(s);
            match serde_json::from_str::<Vec<Value>>(&rendered) {
                Ok(items) => items.iter().map(|v| expected_text(v, pool)).collect(),
                Err(_) => vec![rendered],
            }
        }
        Value::Null => vec![],
        other => vec![other.to_string()],
    }
}

fn item_texts(actual: &Segment) -> Option<Vec<String>> {
    actual
        .items()
        .map(|items| items.iter().map(Segment::text).collect())
}

fn compare(op: ComparisonOperator, actual: Option<&Segment>, expected: &Value, pool: &VariablePool) -> bool {
    use ComparisonOperator::*;

    let actual = actual.filter(|a| !a.is_none());
    match op {
        Null => return actual.is_none(),
        NotNull => return actual.is_some(),
        Empty => return actual.map(Segment::is_empty).unwrap_or(true),
        NotEmpty => return actual.map(|a| !a.is_empty()).unwrap_or(false),
        NotContains => {
            return actual
                .map(|a| !contains(a, &expected_text(expected, pool)))
                .unwrap_or(true)
        }
        _ => {}
    }
    let Some(actual) = actual else {
        return false;
    };

    match op {
        Contains => contains(actual, &expected_text(expected, pool)),
        StartWith => actual
            .as_str()
            .is_some_and(|s| s.starts_with(&expected_text(expected, pool))),
        EndWith => actual
            .as_str()
            .is_some_and(|s| s.ends_with(&expected_text(expected, pool))),
        Is => equals(actual, &expected_text(expected, pool)),
        IsNot => !equals(actual, &expected_text(expected, pool)),
        In => expected_list(expected, pool).contains(&actual.text()),
        NotIn => !expected_list(expected, pool).contains(&actual.text()),
        AllOf => {
            let have = item_texts(actual).unwrap_or_else(|| vec![actual.text()]);
            expected_list(expected, pool).iter().all(|e| have.contains(e))
        }
        Eq | Ne | Gt | Lt | Ge | Le => {
            if let Some(b) = actual.as_bool() {
                let want = expected_text(expected, pool).trim().eq_ignore_ascii_case("true");
                return match op {
                    Eq => b == want,
                    Ne => b != want,
                    _ => false,
                };
            }
            let (Some(a), Ok(e)) = (
                actual.as_f64(),
                expected_text(expected, pool).trim().parse::<f64>(),
            ) else {
                return false;
            };
            match op {
                Eq => a == e,
                Ne => a != e,
                Gt => a > e,
                Lt => a < e,
                Ge => a >= e,
                _ => a <= e,
            }
        }
        Null | NotNull | Empty | NotEmpty | NotContains => false,
    }
}

fn contains(actual: &Segment, needle: &str) -> bool {
    match actual {
        Segment::String(s) => s.contains(needle),
        other => item_texts(other)
            .map(|items| items.iter().any(|i| i == needle))
            .unwrap_or(false),
    }
}

fn equals(actual: &Segment, expected: &str) -> bool {
    match actual {
        Segment::Boolean(b) => b.to_string() == expected.trim().to_lowercase(),
        other => other.text() == expected,
    }
}
