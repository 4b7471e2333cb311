//! SSRF guard for remote logo fetches
//!
//! Logo URLs come from album configuration, which is user-controlled.
//! Every URL is validated before any network call: scheme allow-list,
//! then resolution of the host with a check of every resolved address
//! against loopback, private, link-local and similar internal ranges.

use crate::error::{AppError, Result};
use std::net::IpAddr;
use url::Url;

/// Validate a logo URL. Returns the parsed URL only if the scheme is
/// http(s) and no resolved address falls in a forbidden range.
pub async fn validate_logo_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("invalid logo URL {raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "logo URL scheme {} not allowed",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| AppError::Validation(format!("logo URL {raw} has no host")))?;

    match host {
        url::Host::Ipv4(ip) => check_ip(IpAddr::V4(ip))?,
        url::Host::Ipv6(ip) => check_ip(IpAddr::V6(ip))?,
        url::Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(AppError::Validation(
                    "logo URL resolves to loopback".to_string(),
                ));
            }
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<_> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| {
                    AppError::Network(format!("failed to resolve logo host {domain}: {e}"))
                })?
                .collect();

            if addrs.is_empty() {
                return Err(AppError::Validation(format!(
                    "logo host {domain} resolved to no addresses"
                )));
            }
            // Every address must be safe; a single internal A record
            // is enough to reject.
            for addr in addrs {
                check_ip(addr.ip())?;
            }
        }
    }

    Ok(url)
}

fn check_ip(ip: IpAddr) -> Result<()> {
    if ip_is_forbidden(ip) {
        return Err(AppError::Validation(format!(
            "logo URL resolves to forbidden address {ip}"
        )));
    }
    Ok(())
}

fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                // "this network" 0.0.0.0/8
                || octets[0] == 0
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_is_forbidden(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // unique local fc00::/7
                || (seg[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_loopback_and_localhost() {
        assert!(validate_logo_url("http://127.0.0.1/logo.png").await.is_err());
        assert!(validate_logo_url("http://127.8.9.1:8080/logo.png").await.is_err());
        assert!(validate_logo_url("http://localhost/logo.png").await.is_err());
        assert!(validate_logo_url("http://[::1]/logo.png").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_private_and_link_local_ranges() {
        for url in [
            "http://10.0.0.5/logo.png",
            "http://172.16.1.1/logo.png",
            "http://192.168.1.10/logo.png",
            "http://169.254.169.254/latest/meta-data", // cloud metadata endpoint
            "http://100.64.0.1/logo.png",
            "http://0.0.0.0/logo.png",
            "http://[fe80::1]/logo.png",
            "http://[fd00::1]/logo.png",
        ] {
            assert!(validate_logo_url(url).await.is_err(), "should reject {url}");
        }
    }

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        assert!(validate_logo_url("file:///etc/passwd").await.is_err());
        assert!(validate_logo_url("ftp://example.com/logo.png").await.is_err());
        assert!(validate_logo_url("gopher://example.com/x").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        assert!(validate_logo_url("not a url").await.is_err());
        assert!(validate_logo_url("http://").await.is_err());
    }

    #[test]
    fn test_public_addresses_allowed() {
        assert!(!ip_is_forbidden("93.184.216.34".parse().unwrap()));
        assert!(!ip_is_forbidden("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
    }

    #[test]
    fn test_v4_mapped_v6_checked_as_v4() {
        assert!(ip_is_forbidden("::ffff:192.168.0.1".parse().unwrap()));
        assert!(ip_is_forbidden("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!ip_is_forbidden("::ffff:93.184.216.34".parse().unwrap()));
    }
}
