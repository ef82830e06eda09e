//! Crash-safe build-and-repair loop.
//!
//! Given a specification, `repairloop` asks an external generator for a
//! project, verifies it with an external test command, and requests patches
//! until the tests pass or the retry budget runs out. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (phase table, fingerprints,
//!   path normalization, output capping). No I/O.
//! - **[`io`]**: Side-effecting operations (state document, workspace writes,
//!   process execution, the generator collaborator).
//!
//! [`start`] and [`looping`] coordinate the two to implement `repairloop run`;
//! [`status`] implements `repairloop status`.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod shutdown;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
