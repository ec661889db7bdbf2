#![allow(clippy::too_many_arguments)]

mod prelude;
pub mod buffer;
pub mod comm;
pub mod dataflow;
pub mod network;
pub mod operation;
pub mod progress;
pub mod receiver;
pub mod routing;
pub mod serialize;
pub mod store;
pub mod types;

pub use comm::{Communicator, OperationKind};
pub use dataflow::DataFlow;
pub use operation::DataFlowOperation;

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    let _ = env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.06}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .try_init();
}
