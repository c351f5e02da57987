//! The expression AST.
//!
//! Expressions are tagged variants with an explicit `type` discriminator
//! on the wire, matching the record lexicons. Evaluation semantics live
//! in `avaast-query`; this module only defines shape.

use serde::{Deserialize, Serialize};

use crate::types::ResourceRef;

/// Comparison operators. `IsNull`/`IsNotNull` take no right operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

/// One `when`/`then` arm of a case expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseBranch {
    pub when: Expression,
    pub then: Expression,
}

/// A query expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Expression {
    /// Reference to a field of a source row. `source_alias == "$params"`
    /// reads from the query parameters instead.
    FieldRef {
        source_alias: String,
        /// Dot-segmented path within the source record.
        field_path: String,
    },

    /// Constant value; exactly one of the payload fields is set, or the
    /// literal is null.
    Literal {
        #[serde(skip_serializing_if = "Option::is_none")]
        string_value: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        integer_value: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        boolean_value: Option<bool>,
    },

    Comparison {
        op: ComparisonOp,
        left: Box<Expression>,
        #[serde(skip_serializing_if = "Option::is_none")]
        right: Option<Box<Expression>>,
    },

    /// `not` takes exactly one operand; `and`/`or` short-circuit.
    LogicalOp {
        op: LogicalOp,
        operands: Vec<Expression>,
    },

    ArithmeticOp {
        op: ArithmeticOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    /// Call to a built-in: aggregates, string helpers, math, `coalesce`, `now`.
    BuiltinCall { name: String, args: Vec<Expression> },

    /// Call into user code. Only supported by engines with an async
    /// evaluation path; the synchronous engine rejects it.
    FunctionCall {
        #[serde(rename = "ref")]
        function: ResourceRef,
        args: Vec<Expression>,
    },

    /// Branches evaluate in order; the first truthy `when` wins.
    CaseExpression {
        branches: Vec<CaseBranch>,
        #[serde(skip_serializing_if = "Option::is_none")]
        else_value: Option<Box<Expression>>,
    },
}

impl Expression {
    /// Shorthand for a string literal.
    pub fn string(v: impl Into<String>) -> Self {
        Expression::Literal {
            string_value: Some(v.into()),
            integer_value: None,
            boolean_value: None,
        }
    }

    /// Shorthand for an integer literal.
    pub fn integer(v: i64) -> Self {
        Expression::Literal {
            string_value: None,
            integer_value: Some(v),
            boolean_value: None,
        }
    }

    /// Shorthand for a boolean literal.
    pub fn boolean(v: bool) -> Self {
        Expression::Literal {
            string_value: None,
            integer_value: None,
            boolean_value: Some(v),
        }
    }

    /// Shorthand for a null literal.
    pub fn null() -> Self {
        Expression::Literal {
            string_value: None,
            integer_value: None,
            boolean_value: None,
        }
    }

    /// Shorthand for a field reference.
    pub fn field(alias: impl Into<String>, path: impl Into<String>) -> Self {
        Expression::FieldRef {
            source_alias: alias.into(),
            field_path: path.into(),
        }
    }
}
