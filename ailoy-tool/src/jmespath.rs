//! A minimal JMESPath evaluator over the value tree.
//!
//! Supported subset: identifiers, dotted sub-expressions, `[n]` indexing
//! (negative from the end), `[*]` list projection, and `|` pipes. This is
//! the declared contract for tool `outputPath` projections, not a full
//! JMESPath implementation.

use ailoy_types::Value;

use crate::ToolError;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Wildcard,
}

/// Evaluate `expression` against `value`.
pub fn search(expression: &str, value: &Value) -> Result<Value, ToolError> {
    let mut current = value.clone();
    for segment in expression.split('|') {
        let steps = parse_segment(segment.trim())?;
        current = eval_steps(&steps, current);
    }
    Ok(current)
}

fn parse_segment(segment: &str) -> Result<Vec<Step>, ToolError> {
    if segment.is_empty() {
        return Err(ToolError::OutputPath("empty expression".into()));
    }
    let mut steps = Vec::new();
    let mut chars = segment.chars().peekable();
    let mut ident = String::new();

    let flush = |ident: &mut String, steps: &mut Vec<Step>| {
        if !ident.is_empty() {
            steps.push(Step::Field(std::mem::take(ident)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut ident, &mut steps),
            '[' => {
                flush(&mut ident, &mut steps);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                if inner == "*" {
                    steps.push(Step::Wildcard);
                } else {
                    let index: i64 = inner.trim().parse().map_err(|_| {
                        ToolError::OutputPath(format!("bad index [{inner}]"))
                    })?;
                    steps.push(Step::Index(index));
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => ident.push(c),
            c if c.is_whitespace() => {}
            other => {
                return Err(ToolError::OutputPath(format!(
                    "unsupported character {other:?} in {segment:?}"
                )));
            }
        }
    }
    flush(&mut ident, &mut steps);
    Ok(steps)
}

fn eval_steps(steps: &[Step], value: Value) -> Value {
    let mut projected = false;
    let mut current = value;
    for step in steps {
        if projected {
            let items = match current {
                Value::Array(items) => items,
                _ => return Value::Null,
            };
            let mapped: Vec<Value> = items
                .into_iter()
                .map(|item| apply(step, item))
                .filter(|v| !v.is_null())
                .collect();
            current = Value::Array(mapped);
        } else if matches!(step, Step::Wildcard) {
            match current {
                Value::Array(items) => {
                    projected = true;
                    current = Value::Array(items);
                }
                _ => return Value::Null,
            }
        } else {
            current = apply(step, current);
            if current.is_null() {
                return Value::Null;
            }
        }
    }
    current
}

fn apply(step: &Step, value: Value) -> Value {
    match step {
        Step::Field(name) => value.get(name).cloned().unwrap_or(Value::Null),
        Step::Index(index) => {
            let items = match value.as_array() {
                Some(items) => items,
                None => return Value::Null,
            };
            let len = items.len() as i64;
            let resolved = if *index < 0 { len + index } else { *index };
            if resolved < 0 || resolved >= len {
                Value::Null
            } else {
                items[resolved as usize].clone()
            }
        }
        Step::Wildcard => Value::Null,
    }
}
