// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=CAMERA_HAL_VERSION");

    // Packagers may pin the version string
    let version = std::env::var("CAMERA_HAL_VERSION")
        .ok()
        .or_else(describe)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `git describe` output without the tag's `v` prefix, e.g. `0.3.0-4-g1a2b3c4-dirty`
fn describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty", "--match", "v*"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let described = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let version = described.strip_prefix('v').unwrap_or(&described);
    (!version.is_empty()).then(|| version.to_string())
}
