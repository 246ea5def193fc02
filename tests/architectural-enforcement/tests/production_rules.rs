//! Production code rules for the bridge crates

use architectural_enforcement::{find_violations, production_sources, Violation};

const PRODUCTION_DIRS: &[&str] = &["bridge/core/src", "bridge/daemon/src"];

fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    let listing: Vec<String> = violations.iter().map(ToString::to_string).collect();
    panic!("{rule}:\n{}", listing.join("\n"));
}

#[test]
fn sources_are_found() {
    let files = production_sources(PRODUCTION_DIRS);
    assert!(files.iter().any(|f| f.path.ends_with("lib.rs")));
    assert!(files.iter().any(|f| f.path.ends_with("main.rs")));
}

#[test]
fn no_unwrap_or_expect_in_production_code() {
    let files = production_sources(PRODUCTION_DIRS);
    report(
        "unwrap()/expect() in production code",
        &find_violations(&files, &[".unwrap()", ".expect("]),
    );
}

#[test]
fn no_blocking_sleep() {
    let files = production_sources(PRODUCTION_DIRS);
    report(
        "blocking sleep in production code",
        &find_violations(&files, &["thread::sleep"]),
    );
}

#[test]
fn no_stdout_printing() {
    let files = production_sources(PRODUCTION_DIRS);
    report(
        "printing instead of tracing",
        &find_violations(&files, &["println!", "eprintln!", "dbg!"]),
    );
}

#[test]
fn no_placeholder_macros() {
    let files = production_sources(PRODUCTION_DIRS);
    report(
        "placeholder macro in production code",
        &find_violations(&files, &["todo!(", "unimplemented!("]),
    );
}
