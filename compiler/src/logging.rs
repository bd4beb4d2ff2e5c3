//! Logging setup
//!
//! The phase reports through `tracing` macros. With the `log` feature of
//! `tracing` and no subscriber installed, those events are forwarded to the
//! `log` facade, so installing `env_logger` here is all a binary needs.
//!
//! Levels used by the phase:
//!
//! - `warn!` - the phase gave up on a graph (a loop did not converge)
//! - `info!` - one summary line per graph
//! - `debug!` - sweeps, loop fixed points, merges
//! - `trace!` - single materializations, virtualized nodes, applied effects
//!
//! ```bash
//! RUST_LOG=debug pea_dump run counter
//! RUST_LOG=pea_compiler::pea::merge=trace pea_dump run branch
//! ```

use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

const CRATE_PREFIX: &str = "pea_compiler::";

/// Drop the crate name from a log target: `pea_compiler::pea::merge`
/// prints as `pea::merge`.
fn short_target(target: &str) -> &str {
    target.strip_prefix(CRATE_PREFIX).unwrap_or(target)
}

fn formatted(mut builder: Builder) -> Builder {
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{:5}] {} - {}",
            record.level(),
            short_target(record.target()),
            record.args()
        )
    });
    builder
}

/// Install the logger at `Warn`. Later calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Install the logger at `level`. Later calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = formatted(Builder::new());
        builder.filter_level(level).init();
    });
}

/// Install the logger from `RUST_LOG`, defaulting to `warn`.
pub fn init_from_env() {
    INIT.call_once(|| {
        formatted(Builder::from_env(Env::default().default_filter_or("warn"))).init();
    });
}

/// Logger for unit and integration tests; output is captured by the
/// harness. Safe to call from every test.
pub fn init_test() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}
