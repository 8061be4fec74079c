use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    let hash = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => {
            let clean = git(&["status", "--porcelain"])
                .map(|s| s.is_empty())
                .unwrap_or(true);
            if clean { hash } else { format!("{}-dirty", hash) }
        }
        None => "unknown".to_string(),
    };

    println!("cargo:rustc-env=GIT_HASH={}", hash);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
