// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logger construction for binaries and tests.
//!
//! Library code in this workspace never installs a global logger; it takes
//! a `slog::Logger` in its constructors. These helpers build the root
//! logger those constructors are handed.

use slog::Drain;

/// A terminal drain filtered through the given environment variable
/// (`RUST_LOG` syntax). Defaults to the info level when the variable is
/// unset.
pub fn stderr_env_drain(
    env_var: &str,
) -> impl Drain<Ok = (), Err = slog::Never> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        builder = builder.filter(None, slog::FilterLevel::Info);
    }
    builder.build()
}

/// Root logger for command-line entry points: asynchronous stderr drain,
/// level controlled by `RUST_LOG`.
pub fn stderr_logger() -> slog::Logger {
    let drain = slog_async::Async::new(stderr_env_drain("RUST_LOG").fuse())
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Logger for tests: synchronous, so output interleaves correctly with
/// panic backtraces. Level controlled by `RUST_LOG`, info by default.
pub fn test_logger() -> slog::Logger {
    let drain = std::sync::Mutex::new(stderr_env_drain("RUST_LOG")).fuse();
    slog::Logger::root(drain, slog::o!())
}
