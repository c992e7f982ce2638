//! User-configured external commands
//!
//! Neither of these is allowed to fail the connection: a browser that does not
//! start means the user opens the link by hand, and the connection-lost hook
//! is informational.

use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Placeholder in `browser_command` that is replaced by the URL.
pub const URL_PLACEHOLDER: &str = "%s";

/// Build the browser argv for `url`. The first argument containing `%s` gets
/// the URL substituted; if none does, the URL is appended.
pub fn browser_argv(command: &[String], url: &str) -> Option<Vec<String>> {
    if command.is_empty() {
        return None;
    }

    let mut argv = command.to_vec();
    match argv.iter_mut().find(|arg| arg.contains(URL_PLACEHOLDER)) {
        Some(arg) => *arg = arg.replacen(URL_PLACEHOLDER, url, 1),
        None => argv.push(url.to_string()),
    }
    Some(argv)
}

/// Open `url` with the configured browser, or print it.
pub async fn open_browser(command: &[String], url: &str) {
    let Some(argv) = browser_argv(command, url) else {
        info!("Open this: {}", url);
        return;
    };

    info!("Launching {}", argv[0]);
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let said = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if !said.trim().is_empty() {
                info!("Your browser said: {}", said.trim());
            }
        }
        Ok(output) => {
            warn!(
                "Browser exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            info!("Open this manually: {}", url);
        }
        Err(e) => {
            warn!("Could not open URL in browser: {}", e);
            info!("Open this manually: {}", url);
        }
    }
}

/// Run the connection-lost hook with the terminal attached. Returns whether
/// it ran successfully; a missing hook counts as success.
pub async fn run_connection_lost(command: &[String]) -> bool {
    let Some((program, args)) = command.split_first() else {
        return true;
    };

    info!("Running connection-lost command {}", program);
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("Connection-lost command exited with {}", status);
            false
        }
        Err(e) => {
            warn!("Connection-lost command did not execute correctly: {}", e);
            false
        }
    }
}
