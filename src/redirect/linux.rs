//! iptables/ipset rule provisioning (Linux)
//!
//! The bypass ranges live in an ipset so the iptables side stays a fixed
//! three rules: jump into our chain, RETURN for bypass destinations,
//! REDIRECT everything else to the proxy port. `Local` mode hooks only the
//! host's own traffic (`OUTPUT`); `Router` mode additionally hooks
//! forwarded traffic (`PREROUTING`).

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RedirectMode;
use crate::error::RedirectError;

use super::{Redirector, RESERVED_CIDRS};

/// Name of the nat-table chain holding our rules
const CHAIN: &str = "TPROXY_RELAY";

/// Name of the ipset holding bypass CIDRs
const BYPASS_SET: &str = "tproxy_relay_bypass";

/// Redirection via iptables REDIRECT with an ipset bypass table.
pub struct IptablesRedirector {
    bypass: Vec<String>,
    installed_mode: Option<RedirectMode>,
}

impl IptablesRedirector {
    #[must_use]
    pub fn new(bypass: &[String]) -> Self {
        Self {
            bypass: bypass.to_vec(),
            installed_mode: None,
        }
    }

    /// The `ipset restore` script creating and filling the bypass set.
    ///
    /// `-exist` makes the script idempotent across restarts.
    fn ipset_script(&self) -> String {
        let mut script = format!("create {BYPASS_SET} hash:net -exist\n");
        for cidr in RESERVED_CIDRS.iter().copied().chain(self.bypass.iter().map(String::as_str)) {
            script.push_str(&format!("add {BYPASS_SET} {cidr} -exist\n"));
        }
        script
    }
}

#[async_trait::async_trait]
impl Redirector for IptablesRedirector {
    async fn install(&mut self, proxy_port: u16, mode: RedirectMode) -> Result<(), RedirectError> {
        let port = proxy_port.to_string();

        run_with_stdin("ipset", &["restore"], &self.ipset_script()).await?;

        // A leftover chain from an unclean shutdown is flushed, not an error
        if run("iptables", &["-t", "nat", "-N", CHAIN]).await.is_err() {
            debug!("Chain {} already exists, flushing", CHAIN);
            run("iptables", &["-t", "nat", "-F", CHAIN]).await?;
        }

        run(
            "iptables",
            &[
                "-t", "nat", "-A", CHAIN, "-p", "tcp", "-m", "set", "--match-set", BYPASS_SET,
                "dst", "-j", "RETURN",
            ],
        )
        .await?;
        run(
            "iptables",
            &[
                "-t", "nat", "-A", CHAIN, "-p", "tcp", "-j", "REDIRECT", "--to-ports", &port,
            ],
        )
        .await?;

        run("iptables", &["-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-j", CHAIN]).await?;
        if mode == RedirectMode::Router {
            run(
                "iptables",
                &["-t", "nat", "-A", "PREROUTING", "-p", "tcp", "-j", CHAIN],
            )
            .await?;
        }

        self.installed_mode = Some(mode);
        info!(
            "Redirection rules installed: chain {} -> port {} ({:?} mode)",
            CHAIN, proxy_port, mode
        );
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), RedirectError> {
        // Unhook first, then dismantle; each step is attempted even if an
        // earlier one fails so partial installs still get cleaned up
        let mut first_err = None;
        let mut record = |r: Result<(), RedirectError>| {
            if let Err(e) = r {
                warn!("Cleanup step failed: {}", e);
                first_err.get_or_insert(e);
            }
        };

        record(run("iptables", &["-t", "nat", "-D", "OUTPUT", "-p", "tcp", "-j", CHAIN]).await);
        if self.installed_mode == Some(RedirectMode::Router) {
            record(
                run(
                    "iptables",
                    &["-t", "nat", "-D", "PREROUTING", "-p", "tcp", "-j", CHAIN],
                )
                .await,
            );
        }
        record(run("iptables", &["-t", "nat", "-F", CHAIN]).await);
        record(run("iptables", &["-t", "nat", "-X", CHAIN]).await);
        record(run("ipset", &["destroy", BYPASS_SET]).await);

        self.installed_mode = None;

        match first_err {
            None => {
                info!("Redirection rules removed");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

/// Run an external rule-management command, failing on non-zero exit.
async fn run(program: &str, args: &[&str]) -> Result<(), RedirectError> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| RedirectError::Spawn {
            program: program.into(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RedirectError::command(
            program,
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }

    Ok(())
}

/// Run an external command feeding `input` on stdin.
async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), RedirectError> {
    debug!("Running {} {} with stdin script", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RedirectError::Spawn {
            program: program.into(),
            source: e,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| RedirectError::Spawn {
                program: program.into(),
                source: e,
            })?;
    }

    let output = child.wait_with_output().await.map_err(|e| RedirectError::Spawn {
        program: program.into(),
        source: e,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RedirectError::command(
            program,
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipset_script_contains_reserved_and_custom() {
        let redirector = IptablesRedirector::new(&["198.51.100.0/24".into()]);
        let script = redirector.ipset_script();

        assert!(script.starts_with(&format!("create {BYPASS_SET} hash:net -exist\n")));
        assert!(script.contains(&format!("add {BYPASS_SET} 127.0.0.0/8 -exist")));
        assert!(script.contains(&format!("add {BYPASS_SET} 198.51.100.0/24 -exist")));

        // One create line plus one add per CIDR
        assert_eq!(script.lines().count(), 1 + RESERVED_CIDRS.len() + 1);
    }

    #[test]
    fn test_ipset_script_without_custom_cidrs() {
        let redirector = IptablesRedirector::new(&[]);
        let script = redirector.ipset_script();
        assert_eq!(script.lines().count(), 1 + RESERVED_CIDRS.len());
    }
}
