//! Script Evaluator
//!
//! Line-oriented language understood by [`super::MemoryRuntime`] for
//! run-arbitrary-code. One statement per line, `#` starts a comment, and the
//! value of the last statement is the result.
//!
//! ```text
//! import numpy, sisl
//! from graph_engine import Session
//! exists("model.fdf")
//! read("model.fdf")
//! files()
//! session.node_count()
//! "text" | 42 | None
//! ```

use crate::error::RuntimeError;
use crate::marshal::NativeValue;

/// A parsed statement
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// `import a, b` or `from a import b`; holds the modules to load
    Import(Vec<String>),
    /// Expression whose value becomes the current result
    Expr(Expr),
}

/// A parsed expression
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(NativeValue),
    /// `read("path")`
    Read(String),
    /// `exists("path")`
    Exists(String),
    /// `files()`
    Files,
    /// `session.node_count()`
    NodeCount,
}

/// What a script can reach inside its runtime
pub trait ScriptContext {
    /// Import a module
    fn import(&mut self, module: &str) -> Result<(), RuntimeError>;
    /// Read a staged file
    fn read_file(&self, name: &str) -> Result<Vec<u8>, RuntimeError>;
    /// Whether a file is staged
    fn file_exists(&self, name: &str) -> bool;
    /// Names of staged files, sorted
    fn file_names(&self) -> Vec<String>;
    /// Node count of the session
    fn node_count(&self) -> Result<usize, RuntimeError>;
}

/// Parse a whole script
pub fn parse(code: &str) -> Result<Vec<Statement>, RuntimeError> {
    let mut statements = Vec::new();
    for (index, raw) in code.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let statement = parse_statement(line).map_err(|reason| RuntimeError::Syntax {
            line: index + 1,
            reason,
        })?;
        statements.push(statement);
    }
    Ok(statements)
}

/// Top-level packages named by import statements; lines that fail to parse
/// are skipped
pub fn imported_modules(code: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for raw in code.lines() {
        let Ok(Statement::Import(found)) = parse_statement(strip_comment(raw).trim()) else {
            continue;
        };
        for module in found {
            let root = module.split('.').next().unwrap_or_default().to_string();
            if !modules.contains(&root) {
                modules.push(root);
            }
        }
    }
    modules
}

/// Run a script against a context
pub fn evaluate(code: &str, ctx: &mut dyn ScriptContext) -> Result<NativeValue, RuntimeError> {
    let mut last = NativeValue::None;
    for statement in parse(code)? {
        last = match statement {
            Statement::Import(modules) => {
                for module in modules {
                    ctx.import(&module)?;
                }
                NativeValue::None
            }
            Statement::Expr(expr) => eval_expr(expr, ctx)?,
        };
    }
    Ok(last)
}

fn eval_expr(expr: Expr, ctx: &mut dyn ScriptContext) -> Result<NativeValue, RuntimeError> {
    match expr {
        Expr::Literal(value) => Ok(value),
        Expr::Read(path) => {
            let bytes = ctx.read_file(&path)?;
            Ok(NativeValue::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Expr::Exists(path) => Ok(NativeValue::Bool(ctx.file_exists(&path))),
        Expr::Files => Ok(NativeValue::List(
            ctx.file_names().into_iter().map(NativeValue::Str).collect(),
        )),
        Expr::NodeCount => {
            let count = ctx.node_count()?;
            Ok(NativeValue::Int(i64::try_from(count).unwrap_or(i64::MAX)))
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_module_path(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

fn name_list(list: &str, check: fn(&str) -> bool) -> Result<Vec<String>, String> {
    list.split(',')
        .map(str::trim)
        .map(|name| {
            if check(name) {
                Ok(name.to_string())
            } else {
                Err(format!("invalid name '{name}'"))
            }
        })
        .collect()
}

fn parse_statement(line: &str) -> Result<Statement, String> {
    if let Some(rest) = line.strip_prefix("import ") {
        return name_list(rest, is_module_path).map(Statement::Import);
    }

    if let Some(rest) = line.strip_prefix("from ") {
        let (module, names) = rest
            .split_once(" import ")
            .ok_or_else(|| "expected 'from <module> import <names>'".to_string())?;
        let module = module.trim();
        if !is_module_path(module) {
            return Err(format!("invalid module '{module}'"));
        }
        name_list(names, is_identifier)?;
        return Ok(Statement::Import(vec![module.to_string()]));
    }

    parse_expr(line).map(Statement::Expr)
}

fn parse_expr(text: &str) -> Result<Expr, String> {
    match text {
        "None" => return Ok(Expr::Literal(NativeValue::None)),
        "files()" => return Ok(Expr::Files),
        "session.node_count()" => return Ok(Expr::NodeCount),
        _ => {}
    }

    if text.starts_with('"') {
        return parse_string(text).map(|s| Expr::Literal(NativeValue::Str(s)));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Expr::Literal(NativeValue::Int(i)));
    }
    if let Some(arg) = call_argument(text, "read") {
        return parse_string(arg).map(Expr::Read);
    }
    if let Some(arg) = call_argument(text, "exists") {
        return parse_string(arg).map(Expr::Exists);
    }

    Err(format!("cannot evaluate '{text}'"))
}

fn call_argument<'a>(text: &'a str, function: &str) -> Option<&'a str> {
    text.strip_prefix(function)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn parse_string(text: &str) -> Result<String, String> {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .filter(|inner| !inner.contains('"'))
        .map(str::to_string)
        .ok_or_else(|| format!("malformed string {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Fake {
        imported: Vec<String>,
        files: BTreeMap<String, Vec<u8>>,
    }

    impl ScriptContext for Fake {
        fn import(&mut self, module: &str) -> Result<(), RuntimeError> {
            if module == "missing" {
                return Err(RuntimeError::ModuleNotFound(module.into()));
            }
            self.imported.push(module.into());
            Ok(())
        }

        fn read_file(&self, name: &str) -> Result<Vec<u8>, RuntimeError> {
            self.files
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::FileNotFound(name.into()))
        }

        fn file_exists(&self, name: &str) -> bool {
            self.files.contains_key(name)
        }

        fn file_names(&self) -> Vec<String> {
            self.files.keys().cloned().collect()
        }

        fn node_count(&self) -> Result<usize, RuntimeError> {
            Ok(3)
        }
    }

    #[test]
    fn test_last_statement_is_result() {
        let mut ctx = Fake::default();
        ctx.files.insert("a.txt".into(), b"hello".to_vec());

        let code = "import numpy, sisl.io  # comment\n\nexists(\"a.txt\")\nread(\"a.txt\")";
        assert_eq!(evaluate(code, &mut ctx).unwrap(), NativeValue::Str("hello".into()));
        assert_eq!(ctx.imported, vec!["numpy", "sisl.io"]);
    }

    #[test]
    fn test_literals() {
        let mut ctx = Fake::default();
        assert_eq!(evaluate("42", &mut ctx).unwrap(), NativeValue::Int(42));
        assert_eq!(evaluate("None", &mut ctx).unwrap(), NativeValue::None);
        assert_eq!(
            evaluate("\"a # b\"", &mut ctx).unwrap(),
            NativeValue::Str("a # b".into())
        );
        assert_eq!(
            evaluate("from graph_engine import Session", &mut ctx).unwrap(),
            NativeValue::None
        );
        assert_eq!(ctx.imported, vec!["graph_engine"]);
        assert_eq!(evaluate("session.node_count()", &mut ctx).unwrap(), NativeValue::Int(3));
    }

    #[test]
    fn test_errors() {
        let mut ctx = Fake::default();
        assert_eq!(
            evaluate("1\nx = 2", &mut ctx).unwrap_err(),
            RuntimeError::Syntax {
                line: 2,
                reason: "cannot evaluate 'x = 2'".into()
            }
        );
        assert_eq!(
            evaluate("read(\"nope\")", &mut ctx).unwrap_err(),
            RuntimeError::FileNotFound("nope".into())
        );
        assert_eq!(
            evaluate("import missing", &mut ctx).unwrap_err(),
            RuntimeError::ModuleNotFound("missing".into())
        );
    }

    #[test]
    fn test_imported_modules() {
        let code = "import numpy, sisl.io\nfrom scipy.linalg import eigh\n!!\nimport numpy";
        assert_eq!(imported_modules(code), vec!["numpy", "sisl", "scipy"]);
    }
}
