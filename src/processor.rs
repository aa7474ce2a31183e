//! Processor orchestration covering the range loops, the follow-up fetchers,
//! head tracking, and run lifecycle management.

pub mod backoff;
pub mod balances;
pub mod fetcher;
pub mod internal_transactions;
pub mod lifecycle;
pub(crate) mod pending;
pub mod tip;

#[cfg(test)]
pub(crate) mod test_support;
