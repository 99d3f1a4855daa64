//! Scalar expressions, sort orders and their bound (index-resolved) forms.
//!
//! [`Expr`] refers to columns by name and is what plans, partitionings and
//! distributions carry; two partitionings are compared by comparing their
//! expressions structurally. Before evaluation an expression is bound against
//! the input [`Schema`], producing a [`BoundExpr`] that reads fields by index
//! straight out of a [`RowRef`], packed or boxed.

use crate::error::{data_err, planning_err};
use crate::row::RowRef;
use crate::types::{DataType, Schema, Value};
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
        }
    }

    const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }
}

/// A set of values known only at run time, typically the join keys produced by
/// the build side of a join. Scans use it to prune partitions.
///
/// Identity is the allocation: two filters are equal only if they are the same
/// shared instance.
#[derive(Debug)]
pub struct RuntimeFilter {
    name: String,
    values: OnceLock<HashSet<Value>>,
}

impl RuntimeFilter {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            values: OnceLock::new(),
        })
    }

    /// Publish the filter values. May be called once.
    ///
    /// # Errors
    ///
    /// Returns a planning error if the filter was already resolved.
    pub fn resolve(&self, values: impl IntoIterator<Item = Value>) -> Result<()> {
        if self.values.set(values.into_iter().collect()).is_err() {
            return planning_err(format!("runtime filter '{}' resolved twice", self.name));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.values.get().is_some()
    }

    #[must_use]
    pub fn values(&self) -> Option<&HashSet<Value>> {
        self.values.get()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for RuntimeFilter {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for RuntimeFilter {}

impl Hash for RuntimeFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Vec<Value>,
    },
    /// `expr IN <runtime filter>`; true for every row until the filter resolves.
    DynamicPruning {
        expr: Box<Expr>,
        filter: Arc<RuntimeFilter>,
    },
    Alias(Box<Expr>, String),
}

#[must_use]
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

#[must_use]
pub fn lit(v: impl Into<Value>) -> Expr {
    Expr::Literal(v.into())
}

impl Expr {
    fn binary(self, op: BinaryOp, other: Self) -> Self {
        Self::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    #[must_use]
    pub fn equal(self, other: Self) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    #[must_use]
    pub fn not_equal(self, other: Self) -> Self {
        self.binary(BinaryOp::NotEq, other)
    }

    #[must_use]
    pub fn lt(self, other: Self) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    #[must_use]
    pub fn lt_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::LtEq, other)
    }

    #[must_use]
    pub fn gt(self, other: Self) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    #[must_use]
    pub fn gt_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::GtEq, other)
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        self.binary(BinaryOp::And, other)
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    #[must_use]
    pub fn minus(self, other: Self) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    #[must_use]
    pub fn times(self, other: Self) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    #[must_use]
    pub fn is_not_null(self) -> Self {
        Self::IsNotNull(Box::new(self))
    }

    #[must_use]
    pub fn in_list(self, list: Vec<Value>) -> Self {
        Self::InList {
            expr: Box::new(self),
            list,
        }
    }

    #[must_use]
    pub fn in_runtime_filter(self, filter: Arc<RuntimeFilter>) -> Self {
        Self::DynamicPruning {
            expr: Box::new(self),
            filter,
        }
    }

    #[must_use]
    pub fn alias(self, name: impl Into<String>) -> Self {
        Self::Alias(Box::new(self), name.into())
    }

    /// Column name this expression produces in a projection.
    #[must_use]
    pub fn output_name(&self) -> String {
        match self {
            Self::Column(name) | Self::Alias(_, name) => name.clone(),
            other => other.to_string(),
        }
    }

    /// Names of every column the expression reads.
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Column(name) => {
                out.insert(name.clone());
            }
            Self::Literal(_) => {}
            Self::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Self::Not(e)
            | Self::IsNull(e)
            | Self::IsNotNull(e)
            | Self::InList { expr: e, .. }
            | Self::DynamicPruning { expr: e, .. }
            | Self::Alias(e, _) => e.collect_references(out),
        }
    }

    /// Whether this expression (or any sub-expression) is a runtime filter.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::DynamicPruning { .. } => true,
            Self::Column(_) | Self::Literal(_) => false,
            Self::Binary { left, right, .. } => left.is_dynamic() || right.is_dynamic(),
            Self::Not(e)
            | Self::IsNull(e)
            | Self::IsNotNull(e)
            | Self::InList { expr: e, .. }
            | Self::Alias(e, _) => e.is_dynamic(),
        }
    }

    /// Whether every runtime filter inside this expression has its values.
    #[must_use]
    pub fn runtime_filters_resolved(&self) -> bool {
        match self {
            Self::DynamicPruning { expr, filter } => {
                filter.is_resolved() && expr.runtime_filters_resolved()
            }
            Self::Column(_) | Self::Literal(_) => true,
            Self::Binary { left, right, .. } => {
                left.runtime_filters_resolved() && right.runtime_filters_resolved()
            }
            Self::Not(e)
            | Self::IsNull(e)
            | Self::IsNotNull(e)
            | Self::InList { expr: e, .. }
            | Self::Alias(e, _) => e.runtime_filters_resolved(),
        }
    }

    /// Result type of the expression over `schema`.
    ///
    /// # Errors
    ///
    /// Returns a planning error for unknown columns.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Self::Column(name) => Ok(schema.fields[schema.index_of(name)?].data_type.clone()),
            Self::Literal(v) => Ok(literal_type(v)),
            Self::Binary { op, left, right } => {
                if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                    return Ok(DataType::Boolean);
                }
                let (l, r) = (left.data_type(schema)?, right.data_type(schema)?);
                Ok(wider_numeric(&l, &r))
            }
            Self::Not(_)
            | Self::IsNull(_)
            | Self::IsNotNull(_)
            | Self::InList { .. }
            | Self::DynamicPruning { .. } => Ok(DataType::Boolean),
            Self::Alias(e, _) => e.data_type(schema),
        }
    }

    /// Resolve column names to indices.
    ///
    /// # Errors
    ///
    /// Returns a planning error for unknown columns.
    pub fn bind(&self, schema: &Schema) -> Result<BoundExpr> {
        Ok(match self {
            Self::Column(name) => {
                let index = schema.index_of(name)?;
                BoundExpr::Column {
                    index,
                    data_type: schema.fields[index].data_type.clone(),
                }
            }
            Self::Literal(v) => BoundExpr::Literal(v.clone()),
            Self::Binary { op, left, right } => BoundExpr::Binary {
                op: *op,
                left: Box::new(left.bind(schema)?),
                right: Box::new(right.bind(schema)?),
            },
            Self::Not(e) => BoundExpr::Not(Box::new(e.bind(schema)?)),
            Self::IsNull(e) => BoundExpr::IsNull(Box::new(e.bind(schema)?)),
            Self::IsNotNull(e) => BoundExpr::IsNotNull(Box::new(e.bind(schema)?)),
            Self::InList { expr, list } => BoundExpr::InList {
                expr: Box::new(expr.bind(schema)?),
                set: list.iter().cloned().collect(),
            },
            Self::DynamicPruning { expr, filter } => BoundExpr::DynamicPruning {
                expr: Box::new(expr.bind(schema)?),
                filter: Arc::clone(filter),
            },
            Self::Alias(e, _) => e.bind(schema)?,
        })
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Literal(Value::String(s)) => write!(f, "'{s}'"),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::Not(e) => write!(f, "NOT {e}"),
            Self::IsNull(e) => write!(f, "{e} IS NULL"),
            Self::IsNotNull(e) => write!(f, "{e} IS NOT NULL"),
            Self::InList { expr, list } => {
                let items: Vec<String> = list.iter().map(ToString::to_string).collect();
                write!(f, "{expr} IN ({})", items.join(", "))
            }
            Self::DynamicPruning { expr, filter } => {
                write!(f, "{expr} IN dynamicpruning#{}", filter.name())
            }
            Self::Alias(e, name) => write!(f, "{e} AS {name}"),
        }
    }
}

fn literal_type(v: &Value) -> DataType {
    match v {
        Value::Boolean(_) => DataType::Boolean,
        Value::Byte(_) => DataType::Byte,
        Value::Short(_) => DataType::Short,
        Value::Int(_) => DataType::Int,
        Value::Long(_) => DataType::Long,
        Value::Float(_) => DataType::Float,
        Value::Double(_) => DataType::Double,
        Value::Date(_) => DataType::Date,
        Value::Timestamp(_) => DataType::Timestamp,
        Value::Binary(_) => DataType::Binary,
        Value::Array(items) => DataType::Array(Box::new(
            items.first().map_or(DataType::String, literal_type),
        )),
        Value::External(_) => DataType::External("literal".into()),
        Value::Null | Value::String(_) | Value::Struct(_) => DataType::String,
    }
}

fn wider_numeric(l: &DataType, r: &DataType) -> DataType {
    match (l, r) {
        (DataType::Double | DataType::Float, _) | (_, DataType::Double | DataType::Float) => {
            DataType::Double
        }
        (DataType::Long, _) | (_, DataType::Long) => DataType::Long,
        _ => DataType::Int,
    }
}

const fn is_float(v: &Value) -> bool {
    matches!(v, Value::Float(_) | Value::Double(_))
}

/// Order two non-null values, comparing numbers by magnitude across widths.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    if !is_float(a) && !is_float(b) {
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            return x.cmp(&y);
        }
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.total_cmp(&y);
    }
    a.cmp(b)
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    if is_float(a) || is_float(b) {
        let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
            return data_err(format!("cannot apply {} to {a} and {b}", op.symbol()));
        };
        let r = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            _ => x * y,
        };
        return Ok(Value::double(r));
    }
    let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) else {
        return data_err(format!("cannot apply {} to {a} and {b}", op.symbol()));
    };
    let r = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        _ => x.wrapping_mul(y),
    };
    let wide = matches!(a, Value::Long(_) | Value::Timestamp(_))
        || matches!(b, Value::Long(_) | Value::Timestamp(_));
    Ok(if wide {
        Value::Long(r)
    } else {
        Value::Int(r as i32)
    })
}

/// An expression with columns resolved to row positions.
#[derive(Clone, Debug)]
pub enum BoundExpr {
    Column { index: usize, data_type: DataType },
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    Not(Box<BoundExpr>),
    IsNull(Box<BoundExpr>),
    IsNotNull(Box<BoundExpr>),
    InList {
        expr: Box<BoundExpr>,
        set: HashSet<Value>,
    },
    DynamicPruning {
        expr: Box<BoundExpr>,
        filter: Arc<RuntimeFilter>,
    },
}

impl BoundExpr {
    /// Evaluate against one row. SQL three-valued logic: comparisons with null
    /// yield null.
    ///
    /// # Errors
    ///
    /// Returns a data error on malformed rows or ill-typed operands.
    pub fn eval(&self, row: RowRef<'_>) -> Result<Value> {
        match self {
            Self::Column { index, data_type } => row.value_at(*index, data_type),
            Self::Literal(v) => Ok(v.clone()),
            Self::Binary { op, left, right } => {
                let l = left.eval(row)?;
                match op {
                    BinaryOp::And => {
                        if l.as_bool() == Some(false) {
                            return Ok(Value::Boolean(false));
                        }
                        let r = right.eval(row)?;
                        Ok(match (l.as_bool(), r.as_bool()) {
                            (_, Some(false)) => Value::Boolean(false),
                            (Some(true), Some(true)) => Value::Boolean(true),
                            _ => Value::Null,
                        })
                    }
                    BinaryOp::Or => {
                        if l.as_bool() == Some(true) {
                            return Ok(Value::Boolean(true));
                        }
                        let r = right.eval(row)?;
                        Ok(match (l.as_bool(), r.as_bool()) {
                            (_, Some(true)) => Value::Boolean(true),
                            (Some(false), Some(false)) => Value::Boolean(false),
                            _ => Value::Null,
                        })
                    }
                    _ => {
                        let r = right.eval(row)?;
                        if l.is_null() || r.is_null() {
                            return Ok(Value::Null);
                        }
                        if op.is_comparison() {
                            let ord = compare_values(&l, &r);
                            let b = match op {
                                BinaryOp::Eq => ord == Ordering::Equal,
                                BinaryOp::NotEq => ord != Ordering::Equal,
                                BinaryOp::Lt => ord == Ordering::Less,
                                BinaryOp::LtEq => ord != Ordering::Greater,
                                BinaryOp::Gt => ord == Ordering::Greater,
                                _ => ord != Ordering::Less,
                            };
                            Ok(Value::Boolean(b))
                        } else {
                            arithmetic(*op, &l, &r)
                        }
                    }
                }
            }
            Self::Not(e) => Ok(match e.eval(row)?.as_bool() {
                Some(b) => Value::Boolean(!b),
                None => Value::Null,
            }),
            Self::IsNull(e) => Ok(Value::Boolean(e.eval(row)?.is_null())),
            Self::IsNotNull(e) => Ok(Value::Boolean(!e.eval(row)?.is_null())),
            Self::InList { expr, set } => {
                let v = expr.eval(row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Boolean(set.contains(&v)))
            }
            Self::DynamicPruning { expr, filter } => match filter.values() {
                None => Ok(Value::Boolean(true)),
                Some(values) => {
                    let v = expr.eval(row)?;
                    Ok(Value::Boolean(!v.is_null() && values.contains(&v)))
                }
            },
        }
    }

    /// Evaluate as a filter condition; null counts as false.
    ///
    /// # Errors
    ///
    /// Returns a data error if the result is not boolean.
    pub fn eval_predicate(&self, row: RowRef<'_>) -> Result<bool> {
        match self.eval(row)? {
            Value::Boolean(b) => Ok(b),
            Value::Null => Ok(false),
            other => data_err(format!("predicate produced non-boolean value {other}")),
        }
    }
}

/// Bind every expression against the same schema.
///
/// # Errors
///
/// Returns a planning error for unknown columns.
pub fn bind_all(exprs: &[Expr], schema: &Schema) -> Result<Vec<BoundExpr>> {
    exprs.iter().map(|e| e.bind(schema)).collect()
}

/// Evaluate every bound expression against one row.
///
/// # Errors
///
/// Propagates the first evaluation failure.
pub fn eval_all(exprs: &[BoundExpr], row: RowRef<'_>) -> Result<Vec<Value>> {
    exprs.iter().map(|e| e.eval(row)).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortOrder {
    pub expr: Expr,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortOrder {
    /// Ascending, nulls first.
    #[must_use]
    pub const fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
            nulls_first: true,
        }
    }

    /// Descending, nulls last.
    #[must_use]
    pub const fn desc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: false,
            nulls_first: false,
        }
    }
}

impl Display for SortOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let dir = if self.ascending { "ASC" } else { "DESC" };
        let nulls = if self.nulls_first { "NULLS FIRST" } else { "NULLS LAST" };
        write!(f, "{} {dir} {nulls}", self.expr)
    }
}

/// True if `required` is a prefix of `actual`.
#[must_use]
pub fn ordering_satisfies(actual: &[SortOrder], required: &[SortOrder]) -> bool {
    required.len() <= actual.len() && actual.iter().zip(required).all(|(a, r)| a == r)
}

/// Sort orders bound to a schema; extracts comparable keys from rows.
#[derive(Clone, Debug)]
pub struct RowOrdering {
    exprs: Vec<BoundExpr>,
    directions: Vec<(bool, bool)>,
}

impl RowOrdering {
    /// # Errors
    ///
    /// Returns a planning error for unknown columns.
    pub fn new(orders: &[SortOrder], schema: &Schema) -> Result<Self> {
        Ok(Self {
            exprs: orders
                .iter()
                .map(|o| o.expr.bind(schema))
                .collect::<Result<_>>()?,
            directions: orders.iter().map(|o| (o.ascending, o.nulls_first)).collect(),
        })
    }

    /// # Errors
    ///
    /// Propagates evaluation failures.
    pub fn key(&self, row: RowRef<'_>) -> Result<Vec<Value>> {
        eval_all(&self.exprs, row)
    }

    #[must_use]
    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        for ((x, y), (ascending, nulls_first)) in a.iter().zip(b).zip(&self.directions) {
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if *nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, true) => {
                    if *nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, false) => {
                    let o = compare_values(x, y);
                    if *ascending { o } else { o.reverse() }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
