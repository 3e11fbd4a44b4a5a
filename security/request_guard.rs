//! Request-layer guards
//!
//! The framework-neutral request view plus the guards that run on it:
//! double-submit CSRF, host-and-resolved-IP SSRF allowlisting, and tenant
//! resolution. Each guard either passes or terminates the request with the
//! narrowest safe error; none of them logs on its own — the controller owns
//! event emission.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Result, SecurityError};
use crate::session::Claims;

/// Header carrying an explicit tenant identifier.
pub const TENANT_HEADER: &str = "x-atrium-tenant";

/// Framework-neutral view of an inbound request. Header and cookie names are
/// stored lowercased.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method, uppercased.
    pub method: String,
    /// Path including any query string.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request cookies.
    pub cookies: HashMap<String, String>,
    /// Request body as text.
    pub body: String,
    /// Peer address the request arrived from.
    pub source_ip: IpAddr,
}

impl RequestContext {
    /// Create a context for `method` and `path` from `source_ip`.
    pub fn new(method: &str, path: &str, source_ip: IpAddr) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            body: String::new(),
            source_ip,
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    /// Attach a cookie.
    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Whether the method can change state.
    pub fn is_mutating(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
    }
}

/// Double-submit-cookie CSRF guard. The same random token must arrive in
/// both the cookie and the header; the comparison runs over digests so the
/// token values themselves are never compared byte-by-byte.
#[derive(Debug, Clone)]
pub struct CsrfGuard {
    /// Cookie holding the token.
    pub cookie_name: String,
    /// Header the client must echo the token into.
    pub header_name: String,
}

impl CsrfGuard {
    /// Guard with the platform's default cookie/header names.
    pub fn new() -> Self {
        Self {
            cookie_name: "atrium_csrf".to_string(),
            header_name: "x-csrf-token".to_string(),
        }
    }

    /// Mint a fresh CSRF token for the client to double-submit.
    pub fn issue_token(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Check a request. Safe methods pass; mutating methods need matching
    /// cookie and header tokens.
    pub fn check(&self, ctx: &RequestContext) -> Result<()> {
        if !ctx.is_mutating() {
            return Ok(());
        }

        let cookie = ctx.cookie(&self.cookie_name).ok_or(SecurityError::CsrfMismatch)?;
        let header = ctx.header(&self.header_name).ok_or(SecurityError::CsrfMismatch)?;

        if Sha256::digest(cookie.as_bytes()) != Sha256::digest(header.as_bytes()) {
            return Err(SecurityError::CsrfMismatch);
        }

        Ok(())
    }
}

impl Default for CsrfGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound destination cleared by the SSRF guard.
#[derive(Debug, Clone)]
pub struct SsrfClearance {
    /// Allowlisted host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Resolved addresses, all verified public. Connect to one of these,
    /// not to the name, or a second resolution can rebind.
    pub addrs: Vec<IpAddr>,
}

/// Allowlist-based SSRF guard. A destination must be allowlisted by host
/// AND every address the host resolves to must be public; checking the
/// resolved addresses (not the name) is what defeats DNS rebinding.
#[derive(Debug, Clone)]
pub struct SsrfGuard {
    allowed_hosts: HashSet<String>,
}

impl SsrfGuard {
    /// Guard over a configured host allowlist.
    pub fn new(allowed_hosts: &[String]) -> Self {
        Self {
            allowed_hosts: allowed_hosts.iter().map(|h| h.to_lowercase()).collect(),
        }
    }

    /// Validate an outbound URL. Returns the resolved, verified destination.
    pub fn check_url(&self, url: &str) -> Result<SsrfClearance> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| SecurityError::SsrfBlocked("malformed URL".to_string()))?;

        let default_port = match scheme {
            "http" => 80,
            "https" => 443,
            other => {
                return Err(SecurityError::SsrfBlocked(format!(
                    "scheme {} not permitted",
                    other
                )))
            }
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        if authority.contains('@') {
            return Err(SecurityError::SsrfBlocked(
                "userinfo in URL not permitted".to_string(),
            ));
        }

        let (host, port) = split_host_port(authority, default_port)?;
        let host = host.to_lowercase();

        if !self.allowed_hosts.contains(&host) {
            return Err(SecurityError::SsrfBlocked(format!(
                "host {} is not allowlisted",
                host
            )));
        }

        let addrs = resolve(&host, port)?;
        for addr in &addrs {
            if !is_public_ip(addr) {
                return Err(SecurityError::SsrfBlocked(format!(
                    "{} resolves to non-public address {}",
                    host, addr
                )));
            }
        }

        Ok(SsrfClearance { host, port, addrs })
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(SecurityError::SsrfBlocked("empty host".to_string()));
    }

    // Bracketed IPv6 literal.
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, rest) = stripped
            .split_once(']')
            .ok_or_else(|| SecurityError::SsrfBlocked("malformed IPv6 literal".to_string()))?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| SecurityError::SsrfBlocked("invalid port".to_string()))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| SecurityError::SsrfBlocked("invalid port".to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<IpAddr>> {
    // IP literals skip DNS but still get range-checked.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs: Vec<IpAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SecurityError::SsrfBlocked(format!("resolution failed: {}", e)))?
        .map(|sa| sa.ip())
        .collect();

    if addrs.is_empty() {
        return Err(SecurityError::SsrfBlocked(format!(
            "{} resolved to no addresses",
            host
        )));
    }

    Ok(addrs)
}

/// Whether an address is publicly routable. Loopback, RFC1918, link-local,
/// CGNAT, unspecified and documentation ranges are all rejected.
pub fn is_public_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

fn is_public_v4(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || octets[0] == 0
        || (octets[0] == 100 && (64..128).contains(&octets[1]))
        || octets[0] >= 240)
}

fn is_public_v6(addr: &Ipv6Addr) -> bool {
    let segments = addr.segments();

    // IPv4-mapped (::ffff:a.b.c.d) defers to the IPv4 rules.
    if segments[..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let mapped = Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        );
        return is_public_v4(&mapped);
    }

    !(addr.is_unspecified()
        || addr.is_loopback()
        || (segments[0] & 0xfe00) == 0xfc00
        || (segments[0] & 0xffc0) == 0xfe80
        || (segments[0] == 0x2001 && segments[1] == 0x0db8))
}

/// Resolves the single tenant a request belongs to. Candidates — host
/// subdomain, explicit header, token claim — must agree; ambiguity is a
/// validation failure, not a guess.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    base_domain: Option<String>,
}

impl TenantResolver {
    /// Resolver with an optional tenant base domain.
    pub fn new(base_domain: Option<String>) -> Self {
        Self {
            base_domain: base_domain.map(|d| d.to_lowercase()),
        }
    }

    /// Resolve exactly one tenant identifier for the request.
    pub fn resolve(&self, ctx: &RequestContext, claims: Option<&Claims>) -> Result<String> {
        let mut candidates: Vec<String> = Vec::new();

        if let Some(tenant) = self.from_host(ctx) {
            candidates.push(tenant);
        }
        if let Some(tenant) = ctx.header(TENANT_HEADER) {
            candidates.push(tenant.to_lowercase());
        }
        if let Some(claims) = claims {
            candidates.push(claims.tenant.to_lowercase());
        }

        let mut distinct: Vec<&String> = candidates.iter().collect();
        distinct.sort();
        distinct.dedup();

        match distinct.len() {
            0 => Err(SecurityError::ValidationFailure(
                "no tenant identifier in request".to_string(),
            )),
            1 => Ok(distinct[0].clone()),
            _ => Err(SecurityError::ValidationFailure(
                "conflicting tenant identifiers".to_string(),
            )),
        }
    }

    fn from_host(&self, ctx: &RequestContext) -> Option<String> {
        let base = self.base_domain.as_deref()?;
        let host = ctx.header("host")?.to_lowercase();
        let host = host.split(':').next()?;

        let prefix = host.strip_suffix(base)?.strip_suffix('.')?;
        if prefix.is_empty() || prefix == "www" || prefix.contains('.') {
            return None;
        }
        Some(prefix.to_string())
    }
}
