use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Vars;

/// Filter over a set of named values, written as a MongoDB-like query.
///
/// ```text
/// {"num_cores": {"$gte": 4}}                 # comparison
/// {"efficiency": 1.0}                        # equality
/// {"$or": [{"mpi_procs": 1}, {"npkpt": 2}]}  # combinators
/// ```
///
/// An empty condition accepts everything. Several keys in the same map must all match.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vars", into = "Vars")]
pub struct Condition {
    cmap: Vars,
}

const FIELD_OPERATORS: &[&str] = &[
    "$eq",
    "$ne",
    "$gt",
    "$ge",
    "$gte",
    "$lt",
    "$le",
    "$lte",
    "$divisible",
    "$in",
    "$nin",
];

impl TryFrom<Vars> for Condition {
    type Error = crate::Error;

    fn try_from(cmap: Vars) -> Result<Self, Self::Error> {
        Condition::new(cmap)
    }
}

impl From<Condition> for Vars {
    fn from(condition: Condition) -> Self {
        condition.cmap
    }
}

impl Condition {
    pub fn new(cmap: Vars) -> crate::Result<Self> {
        validate_map(&cmap)?;
        Ok(Condition { cmap })
    }

    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(cmap) => Self::new(cmap),
            Value::Null => Ok(Self::default()),
            other => Err(crate::Error::ConditionError(format!(
                "condition must be a mapping, found {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cmap.is_empty()
    }

    /// Evaluates the condition. Evaluation errors count as a mismatch.
    pub fn evaluate(&self, obj: &Vars) -> bool {
        if self.is_empty() {
            return true;
        }
        match eval_map(&self.cmap, obj) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Condition {} raised an error: {e}", Value::Object(self.cmap.clone()));
                false
            }
        }
    }
}

fn validate_map(cmap: &Vars) -> crate::Result<()> {
    for (key, value) in cmap {
        match key.as_str() {
            "$and" | "$or" => match value {
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::Object(m) => validate_map(m)?,
                            _ => {
                                return Err(crate::Error::ConditionError(format!(
                                    "{key} expects a list of mappings"
                                )));
                            }
                        }
                    }
                }
                _ => {
                    return Err(crate::Error::ConditionError(format!("{key} expects a list")));
                }
            },
            "$not" => match value {
                Value::Object(m) => validate_map(m)?,
                _ => {
                    return Err(crate::Error::ConditionError(
                        "$not expects a mapping".to_string(),
                    ));
                }
            },
            op if op.starts_with('$') => {
                return Err(crate::Error::ConditionError(format!(
                    "operator {op} is not valid at this level"
                )));
            }
            _ => {
                if let Value::Object(ops) = value {
                    for op in ops.keys() {
                        if !FIELD_OPERATORS.contains(&op.as_str()) {
                            return Err(crate::Error::ConditionError(format!(
                                "unknown operator {op}"
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn eval_map(cmap: &Vars, obj: &Vars) -> crate::Result<bool> {
    for (key, value) in cmap {
        let result = match key.as_str() {
            "$and" => {
                let mut result = true;
                for item in as_maps(value)? {
                    result &= eval_map(item, obj)?;
                }
                result
            }
            "$or" => {
                let mut result = false;
                for item in as_maps(value)? {
                    result |= eval_map(item, obj)?;
                }
                result
            }
            "$not" => match value {
                Value::Object(m) => !eval_map(m, obj)?,
                _ => return Err(crate::Error::ConditionError("$not expects a mapping".into())),
            },
            field => {
                let lhs = obj.get(field).ok_or_else(|| {
                    crate::Error::ConditionError(format!("object has no field `{field}`"))
                })?;
                match value {
                    Value::Object(ops) => {
                        let mut result = true;
                        for (op, rhs) in ops {
                            result &= apply_op(op, lhs, resolve(rhs, obj))?;
                        }
                        result
                    }
                    rhs => apply_op("$eq", lhs, resolve(rhs, obj))?,
                }
            }
        };
        if !result {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_maps(value: &Value) -> crate::Result<impl Iterator<Item = &Vars>> {
    match value {
        Value::Array(items) => Ok(items.iter().filter_map(|item| item.as_object())),
        _ => Err(crate::Error::ConditionError("expected a list".into())),
    }
}

/// String operands naming a field of the object refer to the value of that field.
fn resolve<'a>(value: &'a Value, obj: &'a Vars) -> &'a Value {
    match value {
        Value::String(name) => obj.get(name).unwrap_or(value),
        _ => value,
    }
}

fn as_number(value: &Value) -> crate::Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| crate::Error::ConditionError(format!("{value} is not a number")))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn apply_op(op: &str, lhs: &Value, rhs: &Value) -> crate::Result<bool> {
    Ok(match op {
        "$eq" => values_equal(lhs, rhs),
        "$ne" => !values_equal(lhs, rhs),
        "$gt" => as_number(lhs)? > as_number(rhs)?,
        "$ge" | "$gte" => as_number(lhs)? >= as_number(rhs)?,
        "$lt" => as_number(lhs)? < as_number(rhs)?,
        "$le" | "$lte" => as_number(lhs)? <= as_number(rhs)?,
        "$divisible" => {
            let divisor = as_number(rhs)?;
            if divisor == 0.0 {
                return Err(crate::Error::ConditionError("division by zero".into()));
            }
            as_number(lhs)? % divisor == 0.0
        }
        "$in" | "$nin" => {
            let items = rhs
                .as_array()
                .ok_or_else(|| crate::Error::ConditionError(format!("{op} expects a list")))?;
            let found = items.iter().any(|item| values_equal(lhs, item));
            if op == "$in" { found } else { !found }
        }
        _ => {
            return Err(crate::Error::ConditionError(format!("unknown operator {op}")));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::Condition;
    use crate::Vars;
    use serde_json::{Value, json};

    fn cond(value: Value) -> Condition {
        Condition::from_value(value).unwrap()
    }

    fn obj(value: Value) -> Vars {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_empty_condition() {
        assert!(cond(json!({})).evaluate(&Vars::new()));
        assert!(cond(Value::Null).is_empty());
    }

    #[test]
    fn test_comparisons() {
        let o = obj(json!({"num_cores": 4, "efficiency": 0.8}));
        assert!(cond(json!({"num_cores": 4})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$gte": 4}})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$ge": 4, "$lt": 5}})).evaluate(&o));
        assert!(!cond(json!({"num_cores": {"$gt": 4}})).evaluate(&o));
        assert!(cond(json!({"efficiency": {"$le": 0.8}})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$ne": 3}})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$divisible": 2}})).evaluate(&o));
        assert!(!cond(json!({"num_cores": {"$divisible": 3}})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$in": [1, 4]}})).evaluate(&o));
        assert!(cond(json!({"num_cores": {"$nin": [1, 2]}})).evaluate(&o));
    }

    #[test]
    fn test_combinators() {
        let o = obj(json!({"mpi_procs": 2, "omp_threads": 1}));
        assert!(cond(json!({"$and": [{"mpi_procs": 2}, {"omp_threads": 1}]})).evaluate(&o));
        assert!(cond(json!({"$or": [{"mpi_procs": 3}, {"omp_threads": 1}]})).evaluate(&o));
        assert!(!cond(json!({"$not": {"mpi_procs": 2}})).evaluate(&o));
        assert!(!cond(json!({"mpi_procs": 2, "omp_threads": 2})).evaluate(&o));
    }

    #[test]
    fn test_field_reference() {
        let o = obj(json!({"mpi_procs": 2, "npkpt": 2}));
        assert!(cond(json!({"mpi_procs": {"$eq": "npkpt"}})).evaluate(&o));
    }

    #[test]
    fn test_missing_field_is_false() {
        let o = obj(json!({"mpi_procs": 2}));
        assert!(!cond(json!({"npband": 2})).evaluate(&o));
    }

    #[test]
    fn test_invalid_operator() {
        assert!(Condition::from_value(json!({"x": {"$foo": 1}})).is_err());
        assert!(Condition::from_value(json!({"$foo": 1})).is_err());
        assert!(Condition::from_value(json!({"$and": 1})).is_err());
        assert!(Condition::from_value(json!([1])).is_err());
    }
}
