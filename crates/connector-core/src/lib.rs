//! Small, Cloud-SQL-agnostic primitives shared by the connector crate.

pub mod wake;
