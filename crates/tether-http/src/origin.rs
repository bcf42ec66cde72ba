//! Browser-visible host and cookie-domain resolution.

use hyper::Request;

/// Returns the host the browser sees, considering proxies: RFC 7239
/// `Forwarded`, then `X-Forwarded-Host`, then the `Host` header.
pub fn client_host<T>(req: &Request<T>) -> String {
    if let Some(forwarded) = header(req, "forwarded") {
        for part in forwarded.split(';').flat_map(|p| p.split(',')) {
            let part = part.trim();
            if let Some(host) = part
                .strip_prefix("host=")
                .or_else(|| part.strip_prefix("Host="))
            {
                let host = host.trim_matches('"');
                if !host.is_empty() {
                    return strip_port(host).to_string();
                }
            }
        }
    }
    if let Some(xfh) = header(req, "x-forwarded-host") {
        if let Some(first) = xfh.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return strip_port(first).to_string();
            }
        }
    }
    header(req, "host")
        .map(|h| strip_port(&h).to_string())
        .unwrap_or_default()
}

/// Returns the registrable domain (eTLD+1) for a host, e.g.
/// `app.example.co.uk` -> `example.co.uk`. IPs, localhost and bare public
/// suffixes yield `None`.
pub fn top_domain(host: &str) -> Option<String> {
    let host = strip_port(host);
    if host.is_empty() || is_ip(host) || is_localhost(host) {
        return None;
    }
    let domain = psl::domain_str(host)?;
    if domain.is_empty() || psl::suffix_str(host) == Some(domain) {
        return None;
    }
    Some(domain.to_string())
}

fn header<T>(req: &Request<T>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        // leave IPv6 literals like [::1]:8080 intact up to the bracket
        Some(i) if !host[i..].contains(']') => &host[..i],
        _ => host,
    }
}

fn is_ip(host: &str) -> bool {
    host.trim_matches(['[', ']']).parse::<std::net::IpAddr>().is_ok()
}

fn is_localhost(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}
