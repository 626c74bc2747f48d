use std::process::Command;

/// 执行命令并返回去掉首尾空白的 stdout，失败时返回 "unknown"
fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let commit = capture("git", &["rev-parse", "--short", "HEAD"]);
    let dirty = !capture("git", &["status", "--porcelain", "--untracked-files=no"]).is_empty()
        && commit != "unknown";
    let commit = if dirty { format!("{commit}-dirty") } else { commit };

    let build_time = capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]);
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=EXPO_BUILD_COMMIT={commit}");
    println!("cargo:rustc-env=EXPO_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=EXPO_BUILD_TARGET={target}");
    println!("cargo:rustc-env=EXPO_BUILD_PROFILE={profile}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
