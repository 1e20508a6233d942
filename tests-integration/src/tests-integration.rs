//! Integration tests run against real install trees.

use camino::Utf8PathBuf;
use clap::Parser;

mod urls;

#[derive(Debug, Parser)]
#[clap(name = "vinstall-integration-tests", version, rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Detect every install tree listed in a test data file.
    Urls {
        /// Test data, one TOML table per tree
        #[clap(long, default_value = "tests-integration/test_urls.toml")]
        data: Utf8PathBuf,
        #[clap(flatten)]
        testargs: libtest_mimic::Arguments,
    },
}

fn main() {
    vinstall_utils::initialize_tracing();
    let opt = Opt::parse();
    let r = match opt {
        Opt::Urls { data, testargs } => urls::run(&data, testargs),
    };
    if let Err(e) = r {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}
