//! Behavioural suites and shared test fixtures.

mod listener_behaviour;
pub(crate) mod support;
