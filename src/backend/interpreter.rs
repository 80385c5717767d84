use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::ast::{BinaryOperator, Expression, FunctionDef, Program, Statement, UnaryOperator};
use crate::backend::Backend;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    String(String),
    None,
}

impl Value {
    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(value) => Ok(*value),
            Value::Boolean(_) | Value::String(_) | Value::None => {
                bail!("Expected integer, got {self:?}")
            }
        }
    }

    pub fn as_string(&self) -> Result<&str> {
        match self {
            Value::String(value) => Ok(value),
            Value::Integer(_) | Value::Boolean(_) | Value::None => {
                bail!("Expected string, got {self:?}")
            }
        }
    }

    /// Lua truthiness with integer coercion: booleans are themselves,
    /// integers are non-zero, everything else (strings, nil) is true.
    pub fn as_boolean(&self) -> bool {
        match self {
            Value::Boolean(value) => *value,
            Value::Integer(value) => *value != 0,
            Value::String(_) | Value::None => true,
        }
    }

    pub fn to_output(&self) -> String {
        match self {
            Value::Integer(value) => value.to_string(),
            Value::Boolean(value) => {
                if *value {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
            Value::String(value) => value.clone(),
            Value::None => "nil".to_string(),
        }
    }
}

pub(crate) enum ExecResult {
    Continue,
    Return(Value),
}

/// Tree-walking evaluator. `variables` is a single flat map; function calls
/// snapshot and restore it around the callee body (the language has no
/// nested lexical scopes).
pub struct Interpreter {
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) functions: HashMap<String, Rc<FunctionDef>>,
    pub(crate) output: String,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
            functions: HashMap::new(),
            output: String::new(),
        }
    }

    pub(crate) fn register_function(&mut self, def: &FunctionDef) {
        self.functions
            .insert(def.name.clone(), Rc::new(def.clone()));
    }

    pub(crate) fn exec_statement(&mut self, statement: &Statement) -> Result<ExecResult> {
        match statement {
            Statement::Assign { name, value, .. } => {
                let value = self.evaluate(value)?;
                self.variables.insert(name.clone(), value);
                Ok(ExecResult::Continue)
            }
            Statement::FunctionDef(def) => {
                self.register_function(def);
                Ok(ExecResult::Continue)
            }
            Statement::Call { name, args } => {
                self.call_function(name, args)?;
                Ok(ExecResult::Continue)
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                let body = if self.evaluate(condition)?.as_boolean() {
                    then_body
                } else {
                    else_body
                };
                self.exec_block(body)
            }
            Statement::While { condition, body } => {
                while self.evaluate(condition)?.as_boolean() {
                    match self.exec_block(body)? {
                        ExecResult::Continue => {}
                        returned => return Ok(returned),
                    }
                }
                Ok(ExecResult::Continue)
            }
            Statement::Return(value) => {
                let value = match value {
                    Some(value) => self.evaluate(value)?,
                    None => Value::None,
                };
                Ok(ExecResult::Return(value))
            }
            Statement::Print(args) => {
                let values = args
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>>>()?;
                self.print_values(&values);
                Ok(ExecResult::Continue)
            }
        }
    }

    pub(crate) fn exec_block(&mut self, statements: &[Statement]) -> Result<ExecResult> {
        for statement in statements {
            match self.exec_statement(statement)? {
                ExecResult::Continue => {}
                returned => return Ok(returned),
            }
        }
        Ok(ExecResult::Continue)
    }

    pub(crate) fn evaluate(&mut self, expr: &Expression) -> Result<Value> {
        match expr {
            Expression::Integer(value) => Ok(Value::Integer(*value)),
            Expression::Boolean(value) => Ok(Value::Boolean(*value)),
            Expression::String(value) => Ok(Value::String(value.clone())),
            Expression::Variable(name) => match self.variables.get(name) {
                Some(value) => Ok(value.clone()),
                None => bail!("Undefined variable: {name}"),
            },
            Expression::BinaryOp { op, left, right } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                binary_op(*op, &left, &right)
            }
            Expression::UnaryOp { op, operand } => {
                let operand = self.evaluate(operand)?;
                match op {
                    UnaryOperator::Not => Ok(Value::Boolean(!operand.as_boolean())),
                    UnaryOperator::Neg => Ok(Value::Integer(operand.as_integer()?.wrapping_neg())),
                }
            }
            Expression::Call { name, args } => self.call_function(name, args),
        }
    }

    fn call_function(&mut self, name: &str, args: &[Expression]) -> Result<Value> {
        let Some(def) = self.functions.get(name).cloned() else {
            bail!("Undefined function: {name}")
        };

        let mut evaluated_args = Vec::with_capacity(args.len());
        for arg in args {
            evaluated_args.push(self.evaluate(arg)?);
        }

        // Missing arguments bind nil; extra arguments are ignored.
        let saved = self.variables.clone();
        for (i, param) in def.params.iter().enumerate() {
            let value = evaluated_args.get(i).cloned().unwrap_or(Value::None);
            self.variables.insert(param.name.clone(), value);
        }

        // Restore the caller's snapshot on every exit path, aborts included.
        let outcome = self.exec_block(&def.body);
        self.variables = saved;

        Ok(match outcome? {
            ExecResult::Return(value) => value,
            ExecResult::Continue => Value::None,
        })
    }

    pub(crate) fn print_values(&mut self, values: &[Value]) {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.output.push('\t');
            }
            let _ = write!(self.output, "{}", value.to_output());
        }
        self.output.push('\n');
    }
}

pub(crate) fn binary_op(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOperator::Add => {
            // `+` concatenates when either side is a string, converting the
            // integer side to its decimal form.
            if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
                let left = stringify_for_concat(left)?;
                let right = stringify_for_concat(right)?;
                return Ok(Value::String(left + &right));
            }
            Ok(Value::Integer(
                left.as_integer()?.wrapping_add(right.as_integer()?),
            ))
        }
        BinaryOperator::Sub => Ok(Value::Integer(
            left.as_integer()?.wrapping_sub(right.as_integer()?),
        )),
        BinaryOperator::Mul => Ok(Value::Integer(
            left.as_integer()?.wrapping_mul(right.as_integer()?),
        )),
        BinaryOperator::Div => {
            let divisor = right.as_integer()?;
            if divisor == 0 {
                bail!("Division by zero");
            }
            Ok(Value::Integer(left.as_integer()?.wrapping_div(divisor)))
        }
        BinaryOperator::Mod => {
            let divisor = right.as_integer()?;
            if divisor == 0 {
                bail!("Modulo by zero");
            }
            Ok(Value::Integer(left.as_integer()?.wrapping_rem(divisor)))
        }
        BinaryOperator::Eq => Ok(Value::Boolean(values_equal(left, right))),
        BinaryOperator::Ne => Ok(Value::Boolean(!values_equal(left, right))),
        BinaryOperator::Lt => Ok(Value::Boolean(left.as_integer()? < right.as_integer()?)),
        BinaryOperator::Le => Ok(Value::Boolean(left.as_integer()? <= right.as_integer()?)),
        BinaryOperator::Gt => Ok(Value::Boolean(left.as_integer()? > right.as_integer()?)),
        BinaryOperator::Ge => Ok(Value::Boolean(left.as_integer()? >= right.as_integer()?)),
        // Both operands are already evaluated; `and`/`or` do not short-circuit.
        BinaryOperator::And => Ok(Value::Boolean(left.as_boolean() && right.as_boolean())),
        BinaryOperator::Or => Ok(Value::Boolean(left.as_boolean() || right.as_boolean())),
    }
}

fn stringify_for_concat(value: &Value) -> Result<String> {
    match value {
        Value::String(value) => Ok(value.clone()),
        other => Ok(other.as_integer()?.to_string()),
    }
}

/// Equality compares payloads within a tag; mismatched tags (and nil, which
/// carries no payload) are never equal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Integer(l), Value::Integer(r)) => l == r,
        (Value::Boolean(l), Value::Boolean(r)) => l == r,
        (Value::String(l), Value::String(r)) => l == r,
        _ => false,
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn run(&mut self, program: &Program) -> Result<String> {
        self.variables.clear();
        self.functions.clear();
        self.output.clear();

        for statement in &program.statements {
            match self.exec_statement(statement)? {
                ExecResult::Continue => {}
                ExecResult::Return(_) => bail!("Return outside of function"),
            }
        }
        Ok(std::mem::take(&mut self.output))
    }
}
