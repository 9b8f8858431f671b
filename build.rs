use std::process::Command;

/// Trimmed stdout of a command, or "unknown".
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

fn main() {
    // Reported by the /health endpoint.
    let built_at = command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]);
    let git_sha = command_output("git", &["rev-parse", "--short", "HEAD"]);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
