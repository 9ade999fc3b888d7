//! Test suites exercising the daemon through its dispatch loop.

mod round_trip;
mod support;
