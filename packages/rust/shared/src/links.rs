//! Link normalization: resolve raw hrefs into absolute, same-site URLs.
//!
//! Pure and deterministic. Rejections carry a reason so callers can count
//! them without treating them as errors.

use url::Url;

/// Why a raw href was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRejection {
    /// Empty or whitespace-only href.
    Empty,
    /// `#` or `#...` — a fragment with no navigation target.
    FragmentOnly,
    /// `mailto:`, `tel:`, `javascript:` or any non-http(s) scheme.
    Scheme,
    /// The href could not be parsed or resolved against the base.
    Unparseable,
    /// Resolved host is not on the same registrable domain as the base.
    CrossSite,
}

impl std::fmt::Display for LinkRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Empty => "empty href",
            Self::FragmentOnly => "fragment-only link",
            Self::Scheme => "non-http scheme",
            Self::Unparseable => "unparseable href",
            Self::CrossSite => "cross-site link",
        };
        f.write_str(s)
    }
}

/// Same-site policy for link normalization.
#[derive(Debug, Clone, Default)]
pub struct LinkPolicy {
    /// Extra hosts accepted as same-site (explicit subdomain allow-list,
    /// e.g. `shop.example.com` when the base is `example.com`).
    pub allowed_hosts: Vec<String>,
}

impl LinkPolicy {
    /// Resolve `raw` against `base` and validate it is a same-site,
    /// fragmentless, absolute http(s) URL.
    pub fn normalize(&self, base: &Url, raw: &str) -> Result<Url, LinkRejection> {
        let href = raw.trim();
        if href.is_empty() {
            return Err(LinkRejection::Empty);
        }
        if href.starts_with('#') {
            return Err(LinkRejection::FragmentOnly);
        }

        let lowered = href.to_ascii_lowercase();
        if lowered.starts_with("mailto:")
            || lowered.starts_with("tel:")
            || lowered.starts_with("javascript:")
            || lowered.starts_with("data:")
        {
            return Err(LinkRejection::Scheme);
        }

        let mut resolved = base.join(href).map_err(|_| LinkRejection::Unparseable)?;
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            return Err(LinkRejection::Scheme);
        }
        resolved.set_fragment(None);

        let base_host = base.host_str().ok_or(LinkRejection::Unparseable)?;
        let host = resolved.host_str().ok_or(LinkRejection::Unparseable)?;

        if base_domain(host) != base_domain(base_host)
            && !self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        {
            return Err(LinkRejection::CrossSite);
        }

        Ok(resolved)
    }
}

/// Registrable domain of a host: the host with a single leading `www.`
/// stripped, so `www.example.com` and `example.com` compare equal.
pub fn base_domain(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Registrable domain of a full URL (empty string if the URL has no host).
pub fn url_base_domain(url: &Url) -> &str {
    base_domain(url.host_str().unwrap_or(""))
}
