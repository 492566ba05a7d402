//! Credit-metered property search engine.
//!
//! The [`search`] module sequences a paid property lookup against a per-account
//! credit ledger so that every request ends either with nothing committed or with
//! a search history record and its matching debit.

pub mod config;
pub mod error;
pub mod search;
pub mod telemetry;
