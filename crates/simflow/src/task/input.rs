use serde_json::Value;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::Vars;

/// Input of the external program. Only variables are visible to the task, the
/// textual format is produced by `make_input`.
pub trait InputSpec: Debug {
    fn get(&self, name: &str) -> Option<&Value>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn set_var(&mut self, name: &str, value: Value);

    fn set_vars(&mut self, vars: &Vars) {
        for (name, value) in vars {
            self.set_var(name, value.clone());
        }
    }

    /// Removes the variables and returns the ones that were present.
    fn remove_vars(&mut self, names: &[&str]) -> Vars;

    /// Pseudopotentials in the order of the atomic species.
    fn pseudos(&self) -> &[PathBuf];

    fn make_input(&self) -> String;
}

/// Input made of `name value...` lines, `#` starts a comment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AbinitInput {
    vars: Vars,
    pseudos: Vec<PathBuf>,
}

impl AbinitInput {
    pub fn new(vars: Vars, pseudos: Vec<PathBuf>) -> Self {
        AbinitInput { vars, pseudos }
    }

    pub fn parse(text: &str) -> crate::Result<Self> {
        let mut input = AbinitInput::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((content, _)) => content,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (name, rest) = match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest.trim()),
                None => {
                    return Err(crate::Error::GenericError(format!(
                        "line {}: variable `{line}` has no value",
                        lineno + 1
                    )));
                }
            };
            if name == "pseudos" {
                input.pseudos = rest
                    .trim_matches('"')
                    .split(',')
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect();
                continue;
            }
            input.vars.insert(name.to_string(), parse_value(rest));
        }
        Ok(input)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }
}

fn parse_token(token: &str) -> Value {
    if let Ok(value) = token.parse::<i64>() {
        return value.into();
    }
    // Fortran exponents, e.g. 1.0d-8
    let float = token.replace(['d', 'D'], "e");
    match float.parse::<f64>() {
        Ok(value) if value.is_finite() => value.into(),
        _ => Value::String(token.to_string()),
    }
}

fn parse_value(text: &str) -> Value {
    if let Some(quoted) = text.strip_prefix('"') {
        return Value::String(quoted.trim_end_matches('"').to_string());
    }
    let mut tokens: Vec<Value> = text.split_whitespace().map(parse_token).collect();
    if tokens.len() == 1 {
        tokens.remove(0)
    } else {
        Value::Array(tokens)
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if s.contains(char::is_whitespace) || s.contains(',') => {
            format!("\"{s}\"")
        }
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}

impl InputSpec for AbinitInput {
    fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    fn remove_vars(&mut self, names: &[&str]) -> Vars {
        names
            .iter()
            .filter_map(|name| self.vars.remove(*name).map(|v| (name.to_string(), v)))
            .collect()
    }

    fn pseudos(&self) -> &[PathBuf] {
        &self.pseudos
    }

    fn make_input(&self) -> String {
        let mut names: Vec<&String> = self.vars.keys().collect();
        names.sort();
        let mut lines: Vec<String> = names
            .into_iter()
            .filter_map(|name| self.vars.get(name).map(|value| (name, value)))
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| format!("{name} {}", format_value(value)))
            .collect();
        if !self.pseudos.is_empty() {
            let pseudos = self
                .pseudos
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("pseudos \"{pseudos}\""));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}
