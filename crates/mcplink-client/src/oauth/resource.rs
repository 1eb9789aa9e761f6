//! Resource indicator helpers (RFC 8707).

use url::Url;

/// Canonical resource URL for an MCP server: the server URL minus its fragment.
pub fn resource_url_from_server_url(server_url: &Url) -> Url {
    let mut resource = server_url.clone();
    resource.set_fragment(None);
    resource
}

/// Whether `configured` covers `requested`.
///
/// Both must share scheme, host and effective port, and the configured path
/// must be a prefix of the requested path on a segment boundary.
pub fn check_resource_allowed(requested: &Url, configured: &Url) -> bool {
    if requested.scheme() != configured.scheme()
        || requested.host_str() != configured.host_str()
        || requested.port_or_known_default() != configured.port_or_known_default()
    {
        return false;
    }
    // A shorter path cannot sit under the configured one
    if requested.path().len() < configured.path().len() {
        return false;
    }

    let with_slash = |path: &str| {
        if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        }
    };
    with_slash(requested.path()).starts_with(&with_slash(configured.path()))
}
