use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use indicatif::ProgressBar;
use libtest_mimic::Trial;
use regex::Regex;
use serde::Deserialize;
use vinstall_lib::detect::Detector;
use vinstall_lib::distro::{DistroDescriptor, Family, GuestShape};
use vinstall_lib::fetch::{self, Fetcher, Location};
use vinstall_lib::osdb::BuiltinOsCatalog;

const BAD_URL: &str = "http://aksdkakskdfa-idontexist.com/foo/tree";

/// One install tree. `distro` and `kernelarg` use the literal `none` for
/// "expected to be absent"; an omitted `kernelarg` is not checked.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UrlCase {
    url: String,
    distro: String,
    #[serde(default)]
    testxen: bool,
    /// Pass the expected variant in, so only its family is checked.
    #[serde(default)]
    testshortcircuit: bool,
    /// The kernel argument name, e.g. `inst.repo`.
    kernelarg: Option<String>,
    /// Matched against the start of the tree-relative kernel path.
    kernelregex: Option<String>,
}

fn none_is_absent(v: &str) -> Option<&str> {
    (!v.eq_ignore_ascii_case("none")).then_some(v)
}

/// The families a test name may resolve to.
fn families_for_name(name: &str) -> Result<&'static [Family]> {
    let table: &[(&str, &'static [Family])] = &[
        ("fedora", &[Family::Fedora]),
        ("centos", &[Family::Centos]),
        ("rhel", &[Family::Rhel]),
        ("suse", &[Family::Sles, Family::Sled, Family::Opensuse]),
        ("debian", &[Family::Debian]),
        ("ubuntu", &[Family::Ubuntu]),
        ("mageia", &[Family::Mandriva]),
        ("altlinux", &[Family::AltLinux]),
        ("generic", &[Family::GenericTreeinfo]),
    ];
    table
        .iter()
        .find(|(k, _)| name.contains(k))
        .map(|(_, v)| *v)
        .ok_or_else(|| anyhow::anyhow!("name={name} didn't map to any distro family"))
}

fn find_arch(url: &str) -> &'static str {
    let has = |s: &[&str]| s.iter().any(|s| url.contains(s));
    if has(&["i686", "i386", "i586"]) {
        "i686"
    } else if has(&["arm64", "aarch64"]) {
        "aarch64"
    } else if has(&["ppc64el", "ppc64le"]) {
        "ppc64le"
    } else if has(&["s390"]) {
        "s390x"
    } else {
        "x86_64"
    }
}

fn with_fetcher<T>(url: &str, f: impl FnOnce(&dyn Fetcher) -> Result<T>) -> Result<T> {
    let td = tempfile::tempdir()?;
    let scratch = Utf8Path::from_path(td.path()).context("non-UTF8 tempdir")?;
    let fetcher = fetch::open(&Location::parse(url)?, scratch, ProgressBar::hidden())?;
    let r = f(&*fetcher);
    fetcher.close()?;
    r
}

fn check_descriptor(
    d: &DistroDescriptor,
    families: &[Family],
    distro: Option<&str>,
) -> Result<()> {
    if !families.contains(&d.family) {
        anyhow::bail!(
            "Unexpected family: found={} expected={families:?}",
            d.family
        );
    }
    if d.os_variant.as_deref() != distro {
        anyhow::bail!(
            "Detected OS did not match expected values: found={:?} expected={distro:?}",
            d.os_variant
        );
    }
    Ok(())
}

#[context("Testing {name}")]
fn test_url(name: &str, case: &UrlCase) -> Result<()> {
    let families = families_for_name(name)?;
    let arch = find_arch(&case.url);
    let distro = none_is_absent(&case.distro);
    let catalog = BuiltinOsCatalog::new();
    let detector = Detector::new(&catalog);
    let mut hvm = GuestShape::hvm(arch);
    let mut xen = GuestShape::paravirt(arch);
    if let Some(v) = distro.filter(|_| case.testshortcircuit) {
        hvm = hvm.with_os_variant(v);
        xen = xen.with_os_variant(v);
    }

    with_fetcher(&case.url, |fetcher| {
        let d = detector.detect(fetcher, &hvm)?;
        check_descriptor(&d, families, distro)?;
        if case.testxen {
            let d = detector.detect(fetcher, &xen)?;
            check_descriptor(&d, families, distro)?;
        }

        if let Some(re) = case.kernelregex.as_deref() {
            let re = Regex::new(&format!("^(?:{re})"))?;
            if !re.is_match(&d.kernel) {
                anyhow::bail!("kernel={} but kernelregex='{re}'", d.kernel);
            }
        }
        let argname = d
            .kernel_args
            .as_deref()
            .map(|a| a.split_once('=').map_or(a, |(k, _)| k));
        match case.kernelarg.as_deref() {
            Some(expected) if argname != none_is_absent(expected) => {
                anyhow::bail!("kernelargs={:?} but kernelarg='{expected}'", d.kernel_args)
            }
            _ => Ok(()),
        }
    })
}

fn test_bad_url() -> Result<()> {
    let catalog = BuiltinOsCatalog::new();
    let r = with_fetcher(BAD_URL, |fetcher| {
        Detector::new(&catalog).detect(fetcher, &GuestShape::hvm("x86_64"))
    });
    match r {
        Ok(d) => anyhow::bail!("Expected URL failure, found {d:?}"),
        Err(e) if format!("{e:#}").contains("maybe you mistyped") => Ok(()),
        Err(e) => Err(e.context("Unexpected failure")),
    }
}

#[context("URL tests")]
pub(crate) fn run(data: &Utf8Path, testargs: libtest_mimic::Arguments) -> Result<()> {
    let buf = std::fs::read_to_string(data).with_context(|| format!("Reading {data}"))?;
    let cases: BTreeMap<String, UrlCase> =
        toml::from_str(&buf).with_context(|| format!("Parsing {data}"))?;

    let mut tests = vec![Trial::test("bad-url", || test_bad_url().map_err(Into::into))];
    for (name, case) in cases {
        tests.push(Trial::test(format!("url-{name}"), move || {
            test_url(&name, &case).map_err(|e| format!("{e:#}").into())
        }));
    }
    libtest_mimic::run(&testargs, tests).exit()
}

#[test]
fn test_find_arch() {
    for (url, arch) in [
        ("http://example.com/debian/dists/stretch/main/installer-i386/", "i686"),
        ("http://example.com/debian/dists/stretch/main/installer-arm64/", "aarch64"),
        ("http://example.com/ubuntu/dists/bionic/main/installer-ppc64el/", "ppc64le"),
        ("http://example.com/sles/12/s390x/", "s390x"),
        ("http://example.com/fedora/29/Server/x86_64/os/", "x86_64"),
    ] {
        assert_eq!(find_arch(url), arch, "{url}");
    }
    assert_eq!(families_for_name("opensuse-leap15").unwrap().len(), 3);
    assert!(families_for_name("windows").is_err());
    assert_eq!(none_is_absent("None"), None);
    assert_eq!(none_is_absent("inst.repo"), Some("inst.repo"));
}
