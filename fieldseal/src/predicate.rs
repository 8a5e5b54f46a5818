//! Store predicates over encrypted composite columns.
//!
//! A predicate is built only from [`SearchTerm`]s, so it never carries
//! plaintext. It can be evaluated directly against a [`StorageRow`] or
//! rendered as a parameterized SQL fragment for a relational store that keeps
//! composites in `jsonb` columns.

use crate::error::Error;
use crate::storage::StorageRow;
use crate::terms::{BloomFilter, ReturnForm, SearchTerm, TermValue};
use std::fmt::Write as _;
use subtle::ConstantTimeEq;

/// Structure of a predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Unique index of `column` equals `index`
    Equality {
        /// Column name
        column: String,
        /// Unique index bytes
        index: Vec<u8>,
    },
    /// Match index of `column` contains every position of `filter`
    Pattern {
        /// Column name
        column: String,
        /// Query filter
        filter: BloomFilter,
    },
    /// At least one clause holds
    Any(Vec<Clause>),
    /// Every clause holds
    All(Vec<Clause>),
}

/// Bound parameter of a rendered SQL fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    /// Text parameter
    Text(String),
    /// `jsonb` parameter
    Json(serde_json::Value),
}

/// Parameterized SQL with `$n` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment {
    /// SQL text
    pub sql: String,
    /// Parameters, `params[0]` binds `$1`
    pub params: Vec<SqlParam>,
}

/// A query predicate over one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    table: String,
    clause: Clause,
}

impl Predicate {
    /// Equality on an encrypted column.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicateComposition` if `term` is not an
    /// `Exact` term or was derived for another column.
    pub fn equality(column: &str, term: &SearchTerm) -> Result<Self, Error> {
        check_term(column, term, ReturnForm::Exact, "equality")?;
        let TermValue::Unique(index) = term.value() else {
            return Err(Error::InvalidPredicateComposition(
                "equality needs a unique term".to_string(),
            ));
        };
        Ok(Self {
            table: term.table().to_string(),
            clause: Clause::Equality { column: column.to_string(), index: index.clone() },
        })
    }

    /// Case-insensitive pattern match on an encrypted column.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicateComposition` if `term` is not a
    /// `Pattern` term or was derived for another column.
    pub fn pattern(column: &str, term: &SearchTerm) -> Result<Self, Error> {
        check_term(column, term, ReturnForm::Pattern, "pattern")?;
        let TermValue::Match(filter) = term.value() else {
            return Err(Error::InvalidPredicateComposition(
                "pattern needs a match term".to_string(),
            ));
        };
        Ok(Self {
            table: term.table().to_string(),
            clause: Clause::Pattern { column: column.to_string(), filter: filter.clone() },
        })
    }

    /// Disjunction of predicates on the same table.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicateComposition` if `predicates` is empty
    /// or spans several tables.
    pub fn or(predicates: Vec<Self>) -> Result<Self, Error> {
        Self::combine(predicates, "or", Clause::Any, |c| match c {
            Clause::Any(inner) => Ok(inner),
            other => Err(other),
        })
    }

    /// Conjunction of predicates on the same table.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicateComposition` if `predicates` is empty
    /// or spans several tables.
    pub fn and(predicates: Vec<Self>) -> Result<Self, Error> {
        Self::combine(predicates, "and", Clause::All, |c| match c {
            Clause::All(inner) => Ok(inner),
            other => Err(other),
        })
    }

    fn combine(
        predicates: Vec<Self>,
        op: &str,
        wrap: fn(Vec<Clause>) -> Clause,
        same_op: fn(Clause) -> Result<Vec<Clause>, Clause>,
    ) -> Result<Self, Error> {
        let table = match predicates.first() {
            Some(first) => first.table.clone(),
            None => {
                return Err(Error::InvalidPredicateComposition(format!("empty {op} combination")))
            }
        };

        let mut clauses = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            if predicate.table != table {
                return Err(Error::InvalidPredicateComposition(format!(
                    "{op} combines tables {table} and {}",
                    predicate.table
                )));
            }
            match same_op(predicate.clause) {
                Ok(inner) => clauses.extend(inner),
                Err(clause) => clauses.push(clause),
            }
        }

        let clause = if clauses.len() == 1 { clauses.remove(0) } else { wrap(clauses) };
        Ok(Self { table, clause })
    }

    /// Returns the table the predicate applies to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the predicate structure.
    #[must_use]
    pub const fn clause(&self) -> &Clause {
        &self.clause
    }

    /// Evaluates the predicate against a stored row.
    ///
    /// Unique indexes are compared in constant time.
    #[must_use]
    pub fn matches(&self, row: &StorageRow) -> bool {
        self.eval(&self.clause, row)
    }

    fn eval(&self, clause: &Clause, row: &StorageRow) -> bool {
        match clause {
            Clause::Equality { column, index } => row
                .composite(column)
                .filter(|c| c.ident.table == self.table)
                .and_then(|c| c.unique_index.as_deref())
                .and_then(|hm| hex::decode(hm).ok())
                .is_some_and(|stored| bool::from(stored.ct_eq(index))),
            Clause::Pattern { column, filter } => row
                .composite(column)
                .filter(|c| c.ident.table == self.table)
                .and_then(|c| c.match_index.as_ref())
                .is_some_and(|stored| stored.contains_all(filter)),
            Clause::Any(clauses) => clauses.iter().any(|c| self.eval(c, row)),
            Clause::All(clauses) => clauses.iter().all(|c| self.eval(c, row)),
        }
    }

    /// Renders a `WHERE` condition with `$n` placeholders.
    ///
    /// Composite columns are expected to be `jsonb`. Equality compares the
    /// `hm` member; pattern matching uses `jsonb` containment on `bf`.
    #[must_use]
    pub fn to_sql(&self) -> SqlFragment {
        let mut fragment = SqlFragment { sql: String::new(), params: Vec::new() };
        render(&self.clause, &mut fragment);
        fragment
    }

    /// Renders a complete `SELECT` over the predicate's table.
    #[must_use]
    pub fn to_select_sql(&self) -> SqlFragment {
        let condition = self.to_sql();
        SqlFragment {
            sql: format!("SELECT * FROM {} WHERE {}", quote_ident(&self.table), condition.sql),
            params: condition.params,
        }
    }
}

fn check_term(column: &str, term: &SearchTerm, form: ReturnForm, op: &str) -> Result<(), Error> {
    if term.form() != form {
        return Err(Error::InvalidPredicateComposition(format!(
            "{op} on {column} needs a {form:?} term, got {:?}",
            term.form()
        )));
    }
    if term.column() != column {
        return Err(Error::InvalidPredicateComposition(format!(
            "term derived for {}.{} used on column {column}",
            term.table(),
            term.column()
        )));
    }
    Ok(())
}

fn render(clause: &Clause, out: &mut SqlFragment) {
    match clause {
        Clause::Equality { column, index } => {
            out.params.push(SqlParam::Text(hex::encode(index)));
            let _ = write!(out.sql, "({}->>'hm') = ${}", quote_ident(column), out.params.len());
        }
        Clause::Pattern { column, filter } => {
            let positions: Vec<u16> = filter.positions().collect();
            out.params.push(SqlParam::Json(serde_json::Value::from(positions)));
            let column = quote_ident(column);
            let _ = write!(out.sql, "({column}->'bf') @> ${}::jsonb", out.params.len());
        }
        Clause::Any(clauses) => render_list(clauses, " OR ", out),
        Clause::All(clauses) => render_list(clauses, " AND ", out),
    }
}

fn render_list(clauses: &[Clause], sep: &str, out: &mut SqlFragment) {
    out.sql.push('(');
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            out.sql.push_str(sep);
        }
        render(clause, out);
    }
    out.sql.push(')');
}

/// Quotes an SQL identifier, doubling embedded quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
