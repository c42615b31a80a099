use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let value = String::from_utf8(output.stdout).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// `COCKPIT_TASKS_VERSION` as given, else the package version tagged with
/// the short commit, e.g. `0.1.0+1a2b3c4.dirty`.
fn build_version() -> String {
    if let Some(release) = std::env::var("COCKPIT_TASKS_VERSION")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        return release;
    }

    let package = env!("CARGO_PKG_VERSION");
    let Some(commit) = git(&["rev-parse", "--short", "HEAD"]) else {
        return package.to_string();
    };
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"]).is_some();
    format!("{package}+{commit}{}", if dirty { ".dirty" } else { "" })
}

fn main() {
    println!("cargo:rerun-if-env-changed=COCKPIT_TASKS_VERSION");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    println!("cargo:rustc-env=COCKPIT_TASKS_BUILD_VERSION={}", build_version());
}
