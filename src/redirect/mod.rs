//! OS redirection rule provisioning
//!
//! Optional: the proxy works fine against rules installed by hand, but with
//! `redirect.enabled` it drives the platform firewall itself so that
//! outgoing TCP lands on its own listener. Linux uses iptables with an
//! ipset bypass set; macOS uses a pf anchor loaded through `pfctl`.
//!
//! Reserved and special-purpose ranges are always excluded from
//! redirection. Without that, the proxy's own loopback traffic and
//! link-local chatter would be pulled into the listener.

// Both backends compile everywhere (they only shell out to external
// tools), keeping the rule rendering unit-testable on any host; only
// `new_redirector` picks per target OS.
pub mod darwin;
pub mod linux;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RedirectMode;
use crate::error::RedirectError;

/// Address ranges never redirected: loopback, RFC 1918, link-local,
/// carrier-grade NAT, documentation nets, multicast, and the other
/// special-purpose IPv4 blocks.
pub const RESERVED_CIDRS: [&str; 15] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.2.0/24",
    "192.18.0.0/15",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "192.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

/// Installs and removes the OS rules that steer TCP traffic into the proxy.
///
/// Implementations must make `remove` safe to call whether or not `install`
/// succeeded, so shutdown paths can always attempt cleanup.
#[async_trait]
pub trait Redirector: Send {
    /// Install redirection rules pointing at `proxy_port`.
    ///
    /// # Errors
    ///
    /// Returns `RedirectError` if the platform tooling fails or the mode is
    /// not supported on this platform.
    async fn install(&mut self, proxy_port: u16, mode: RedirectMode) -> Result<(), RedirectError>;

    /// Remove previously installed rules. Best-effort: partial rule state
    /// is cleaned up as far as possible.
    ///
    /// # Errors
    ///
    /// Returns `RedirectError` if cleanup commands fail outright.
    async fn remove(&mut self) -> Result<(), RedirectError>;
}

/// Install rules, rolling back any partial state if installation fails.
///
/// A multi-step install can fail with earlier steps already applied,
/// leaving traffic redirected into a proxy that never starts serving it.
/// This wrapper runs the redirector's cleanup before surfacing the install
/// error; a cleanup failure on top of that is logged, not returned.
///
/// # Errors
///
/// Returns the original install error.
pub async fn install_or_rollback(
    redirector: &mut dyn Redirector,
    proxy_port: u16,
    mode: RedirectMode,
) -> Result<(), RedirectError> {
    if let Err(install_err) = redirector.install(proxy_port, mode).await {
        if let Err(cleanup_err) = redirector.remove().await {
            warn!(
                "Cleanup after failed rule install also failed: {}",
                cleanup_err
            );
        }
        return Err(install_err);
    }
    Ok(())
}

/// Build the redirector for this platform.
///
/// `bypass` lists extra CIDRs to exclude on top of [`RESERVED_CIDRS`].
#[cfg(target_os = "linux")]
#[must_use]
pub fn new_redirector(bypass: &[String]) -> Box<dyn Redirector> {
    Box::new(linux::IptablesRedirector::new(bypass))
}

/// Build the redirector for this platform.
#[cfg(target_os = "macos")]
#[must_use]
pub fn new_redirector(bypass: &[String]) -> Box<dyn Redirector> {
    Box::new(darwin::PfRedirector::new(bypass))
}

/// No rule provisioning backend exists for this platform; the returned
/// redirector fails on `install` and no-ops on `remove`.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[must_use]
pub fn new_redirector(_bypass: &[String]) -> Box<dyn Redirector> {
    struct Unsupported;

    #[async_trait]
    impl Redirector for Unsupported {
        async fn install(
            &mut self,
            _proxy_port: u16,
            _mode: RedirectMode,
        ) -> Result<(), RedirectError> {
            Err(RedirectError::Unsupported)
        }

        async fn remove(&mut self) -> Result<(), RedirectError> {
            Ok(())
        }
    }

    Box::new(Unsupported)
}
