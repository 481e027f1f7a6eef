//! A typed rendition of the Mongo-style comparison mini-DSL.
//!
//! `filter`, `take_while`, `take_until`, `every` and `some` accept plain
//! closures; a [`Query`] describes the same decisions declaratively and is
//! handed to those combinators through [`Query::predicate`].
//!
//! ```rust
//! use pullstream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pullstream::Result<()> {
//! let small = IterReader::new(0..10)
//!     .filter(Query::lt(4).predicate())
//!     .to_array()
//!     .await?;
//! assert_eq!(small, vec![0, 1, 2, 3]);
//! # Ok(())
//! # }
//! ```

/// A comparison query over values of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<T> {
    /// Strictly less than the operand (`$lt`)
    Lt(T),
    /// Less than or equal (`$lte`)
    Lte(T),
    /// Strictly greater than (`$gt`)
    Gt(T),
    /// Greater than or equal (`$gte`)
    Gte(T),
    /// Equal (`$eq`)
    Eq(T),
    /// Not equal (`$ne`)
    Ne(T),
    /// Member of the operand set (`$in`)
    In(Vec<T>),
    /// Not a member of the operand set (`$nin`)
    Nin(Vec<T>),
    /// Conjunction of sub-queries, the way a multi-operator query object
    /// combines its clauses
    And(Vec<Query<T>>),
}

impl<T: PartialOrd> Query<T> {
    pub fn lt(operand: T) -> Self {
        Query::Lt(operand)
    }

    pub fn lte(operand: T) -> Self {
        Query::Lte(operand)
    }

    pub fn gt(operand: T) -> Self {
        Query::Gt(operand)
    }

    pub fn gte(operand: T) -> Self {
        Query::Gte(operand)
    }

    pub fn eq(operand: T) -> Self {
        Query::Eq(operand)
    }

    pub fn ne(operand: T) -> Self {
        Query::Ne(operand)
    }

    pub fn is_in(operands: Vec<T>) -> Self {
        Query::In(operands)
    }

    pub fn not_in(operands: Vec<T>) -> Self {
        Query::Nin(operands)
    }

    pub fn and(queries: Vec<Query<T>>) -> Self {
        Query::And(queries)
    }

    /// Evaluate the query against a single value.
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Query::Lt(b) => value < b,
            Query::Lte(b) => value <= b,
            Query::Gt(b) => value > b,
            Query::Gte(b) => value >= b,
            Query::Eq(b) => value == b,
            Query::Ne(b) => value != b,
            Query::In(set) => set.iter().any(|x| x == value),
            Query::Nin(set) => set.iter().all(|x| x != value),
            Query::And(queries) => queries.iter().all(|q| q.matches(value)),
        }
    }

    /// Turn the query into a predicate closure accepted by the
    /// combinators and reducers.
    pub fn predicate(self) -> impl FnMut(&T) -> bool + Send
    where
        T: Send,
    {
        move |value| self.matches(value)
    }
}
