fn main() {
    set_git_revision_hash();
}

/// Make the current git hash available to the build as the environment
/// variable `SPEEDCHECK_BUILD_GIT_HASH`, falling back to the package
/// version outside a checkout.
fn set_git_revision_hash() {
    use std::process::Command;

    println!("cargo:rerun-if-changed=.git/HEAD");

    let version = env!("CARGO_PKG_VERSION");
    let args = &["rev-parse", "--short=10", "HEAD"];
    let rev = Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        })
        .unwrap_or_default();

    let value = if rev.is_empty() {
        version.to_string()
    } else {
        format!("{} ({})", version, rev)
    };
    println!("cargo:rustc-env=SPEEDCHECK_BUILD_GIT_HASH={}", value);
}
