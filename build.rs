//! Get the version string using `git describe --dirty` or, if it fails, using the
//! `CARGO_PKG_VERSION`.
//!
//! The `GIT` environment variable can be used to set an alternative path to the git executable.

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not set");
    let dest_path = Path::new(&out_dir).join("version.rs");

    let git = env::var("GIT").unwrap_or_else(|_| "git".into());
    let cargo_version = env!("CARGO_PKG_VERSION").to_owned();

    let mut version = Command::new(git)
        .arg("describe")
        .arg("--dirty")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| format!("git-{}", s))
        .unwrap_or(cargo_version);

    // Make sure version is on a single line
    if let Some(l) = version.find('\n') {
        version.truncate(l);
    }

    fs::write(
        &dest_path,
        format!("pub const VERSION: &str = \"{}\";\n", version),
    )
    .expect("Failed to write version.rs");

    println!("cargo:rerun-if-env-changed=GIT");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
