//! pf rule provisioning (macOS)
//!
//! Renders a pf ruleset that rdr's TCP on loopback to the proxy port and
//! route-to's outgoing TCP through loopback so it hits that rdr, then loads
//! it with `pfctl -f -`. The bypass ranges go into a pf table referenced by
//! the pass rule, so redirected traffic never includes reserved space.
//!
//! Only `Local` mode exists here: pf on macOS has no practical equivalent
//! of hooking forwarded traffic the way a PREROUTING chain does.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RedirectMode;
use crate::error::RedirectError;

use super::{Redirector, RESERVED_CIDRS};

/// Name of the pf table holding bypass CIDRs
const BYPASS_TABLE: &str = "tproxy_relay_bypass";

/// Redirection via pf rdr/route-to rules loaded through pfctl.
pub struct PfRedirector {
    bypass: Vec<String>,
    installed: bool,
}

impl PfRedirector {
    #[must_use]
    pub fn new(bypass: &[String]) -> Self {
        Self {
            bypass: bypass.to_vec(),
            installed: false,
        }
    }
}

/// Render the complete pf ruleset for the given egress interface and proxy
/// port.
pub(crate) fn build_ruleset(bypass: &[String], interface: &str, proxy_port: u16) -> String {
    let cidrs: Vec<&str> = RESERVED_CIDRS
        .iter()
        .copied()
        .chain(bypass.iter().map(String::as_str))
        .collect();

    format!(
        "table <{BYPASS_TABLE}> const {{ {} }}\n\
         rdr pass on lo0 proto tcp from any to any -> 127.0.0.1 port {proxy_port}\n\
         pass out on {interface} route-to lo0 proto tcp from any to !<{BYPASS_TABLE}> keep state\n",
        cidrs.join(", "),
    )
}

/// Pull the egress interface name out of `route -n get default` output.
pub(crate) fn parse_default_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() == "interface" {
            let iface = value.trim();
            (!iface.is_empty()).then(|| iface.to_string())
        } else {
            None
        }
    })
}

/// Ask the routing table which interface carries the default route.
async fn default_interface() -> Result<String, RedirectError> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| RedirectError::Spawn {
            program: "route".into(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RedirectError::command(
            "route",
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }

    parse_default_interface(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        RedirectError::command("route", "no default interface in routing table")
    })
}

/// Run pfctl with a ruleset (or nothing) on stdin.
///
/// `tolerate` lists stderr fragments that indicate harmless state ("pf
/// already enabled" and the like) rather than failure.
async fn pfctl(args: &[&str], input: Option<&str>, tolerate: &[&str]) -> Result<(), RedirectError> {
    debug!("Running pfctl {}", args.join(" "));

    let mut child = Command::new("pfctl")
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RedirectError::Spawn {
            program: "pfctl".into(),
            source: e,
        })?;

    if let Some(ruleset) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(ruleset.as_bytes())
                .await
                .map_err(|e| RedirectError::Spawn {
                    program: "pfctl".into(),
                    source: e,
                })?;
        }
    }

    let output = child.wait_with_output().await.map_err(|e| RedirectError::Spawn {
        program: "pfctl".into(),
        source: e,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if tolerate.iter().any(|frag| stderr.contains(frag)) {
            debug!("pfctl reported tolerable state: {}", stderr.trim());
            return Ok(());
        }
        return Err(RedirectError::command(
            "pfctl",
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }

    Ok(())
}

#[async_trait::async_trait]
impl Redirector for PfRedirector {
    async fn install(&mut self, proxy_port: u16, mode: RedirectMode) -> Result<(), RedirectError> {
        if mode == RedirectMode::Router {
            warn!("Router mode is not supported with pf; use local mode");
            return Err(RedirectError::Unsupported);
        }

        let interface = default_interface().await?;
        let ruleset = build_ruleset(&self.bypass, &interface, proxy_port);

        pfctl(&["-e"], None, &["pf already enabled"]).await?;
        pfctl(&["-f", "-"], Some(&ruleset), &[]).await?;

        self.installed = true;
        info!(
            "pf redirection rules loaded: {} -> port {}",
            interface, proxy_port
        );
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), RedirectError> {
        if !self.installed {
            return Ok(());
        }

        pfctl(&["-d"], None, &["pf not enabled"]).await?;
        self.installed = false;
        info!("pf disabled, redirection rules removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ruleset_shape() {
        let ruleset = build_ruleset(&[], "en0", 7893);
        let lines: Vec<&str> = ruleset.lines().collect();
        assert_eq!(lines.len(), 3);

        assert!(lines[0].starts_with(&format!("table <{BYPASS_TABLE}> const {{")));
        assert!(lines[0].contains("127.0.0.0/8"));
        assert!(lines[0].contains("224.0.0.0/4"));

        assert_eq!(
            lines[1],
            "rdr pass on lo0 proto tcp from any to any -> 127.0.0.1 port 7893"
        );
        assert!(lines[2].starts_with("pass out on en0 route-to lo0"));
        assert!(lines[2].contains(&format!("!<{BYPASS_TABLE}>")));
    }

    #[test]
    fn test_ruleset_includes_custom_bypass() {
        let bypass = vec!["198.51.100.0/24".to_string()];
        let ruleset = build_ruleset(&bypass, "en1", 8080);
        assert!(ruleset.lines().next().unwrap().contains("198.51.100.0/24"));
        assert!(ruleset.contains("port 8080"));
        assert!(ruleset.contains("on en1 "));
    }

    #[test]
    fn test_parse_default_interface() {
        let output = "\
   route to: default
destination: default
       mask: default
    gateway: 192.168.1.1
  interface: en0
      flags: <UP,GATEWAY,DONE,STATIC,PRCLONING,GLOBAL>
";
        assert_eq!(parse_default_interface(output), Some("en0".to_string()));
    }

    #[test]
    fn test_parse_default_interface_missing() {
        assert_eq!(parse_default_interface("route to: default\n"), None);
        assert_eq!(parse_default_interface(""), None);
    }
}
