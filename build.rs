//! Build script for shellgate.
//!
//! Embeds the git version so `--version` reports the exact build.

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");

    // Get git version: tag if on tag, otherwise tag-commits-hash
    let git_version = std::process::Command::new("git")
        .args(["describe", "--tags", "--always"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    println!("cargo:rustc-env=GIT_VERSION={}", git_version);

    // The built-in rule layer ships as data; rebuild when it changes so
    // include_str! picks it up.
    println!("cargo:rerun-if-changed=rules/defaults.yaml");
}
