//! The main entrypoint for vinstall, which just performs global initialization
//! and then calls out into the library.

use anyhow::Result;

fn run() -> Result<()> {
    vinstall_utils::initialize_tracing();
    tracing::trace!("starting");
    vinstall_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
