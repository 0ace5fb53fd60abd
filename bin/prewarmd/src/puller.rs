//! Node-side pull helper.
//!
//! Runs inside a worker with `IMAGES`, `CRI_SOCKET_PATH`, and optionally
//! `REGISTRY_CREDS` in the environment. Pulls each image sequentially via
//! the runtime CLI, then writes `{image: 1|0}` into the pod termination
//! message. Pull failures do not change the exit code: the control plane
//! reads the verdict from the termination message.

use std::collections::BTreeMap;
use std::process::Command;

use prewarm_core::config::DEFAULT_CRI_SOCKET;

const TERMINATION_LOG: &str = "/dev/termination-log";

/// Split the comma-joined `IMAGES` value.
pub fn parse_images(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn run() -> anyhow::Result<()> {
    let images_env = std::env::var("IMAGES").unwrap_or_default();
    let images = parse_images(&images_env);
    if images.is_empty() {
        anyhow::bail!("IMAGES environment variable is required");
    }
    let socket = std::env::var("CRI_SOCKET_PATH")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CRI_SOCKET.to_string());
    let creds = std::env::var("REGISTRY_CREDS")
        .ok()
        .filter(|c| !c.is_empty());

    println!(
        "starting pre-warm for {} images using socket {socket}",
        images.len()
    );
    if creds.is_some() {
        println!("using registry credentials for authentication");
    }

    let mut results: BTreeMap<String, i64> = BTreeMap::new();
    for image in &images {
        println!("pulling {image}...");
        let mut cmd = Command::new("crictl");
        cmd.arg("--image-endpoint")
            .arg(format!("unix://{socket}"))
            .arg("pull");
        if let Some(creds) = &creds {
            cmd.arg("--creds").arg(creds);
        }
        cmd.arg(image);

        match cmd.output() {
            Ok(output) if output.status.success() => {
                println!("successfully pulled {image}");
                results.insert(image.clone(), 1);
            }
            Ok(output) => {
                eprintln!(
                    "failed to pull {image}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                results.insert(image.clone(), 0);
            }
            Err(e) => {
                eprintln!("failed to run pull for {image}: {e}");
                results.insert(image.clone(), 0);
            }
        }
    }

    let message = serde_json::to_string(&results)?;
    if let Err(e) = std::fs::write(TERMINATION_LOG, &message) {
        eprintln!("failed to write termination log: {e}");
        println!("FINAL_RESULT: {message}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_images_splits_and_trims() {
        assert_eq!(
            parse_images("nginx:1, redis:7 ,alpine:3.20"),
            vec!["nginx:1", "redis:7", "alpine:3.20"]
        );
        assert_eq!(parse_images("nginx:1"), vec!["nginx:1"]);
        assert!(parse_images("").is_empty());
        assert!(parse_images(" , ,").is_empty());
    }
}
