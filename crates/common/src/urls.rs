// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Public site URL helpers

use crate::types::ServerKind;

/// Fully qualified public hostname of a site, e.g. `myapp.loophole.site`
pub fn site_fqdn(site_id: &str, domain: &str) -> String {
    format!("{}.{}", site_id, domain)
}

/// Every URL a site is reachable at, HTTPS first
pub fn public_urls(site_id: &str, domain: &str, kind: ServerKind) -> Vec<String> {
    let host = site_fqdn(site_id, domain);
    let mut urls = vec![format!("https://{}", host)];
    if kind == ServerKind::WebDav {
        urls.push(format!("davs://{}", host));
        urls.push(format!("webdav://{}", host));
    }
    urls
}

/// Extract the site ID from a public URL (`https://{siteID}.{domain}`)
pub fn site_id_from_url<'a>(url: &'a str, domain: &str) -> Option<&'a str> {
    let (_, rest) = url.split_once("://")?;
    let host = rest.split(['/', ':']).next()?;
    let site = host.strip_suffix(domain)?.strip_suffix('.')?;
    if site.is_empty() || site.contains('.') {
        return None;
    }
    Some(site)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_tunnel_urls() {
        let urls = public_urls("myapp1", "loophole.site", ServerKind::Proxy);
        assert_eq!(urls, vec!["https://myapp1.loophole.site"]);

        let urls = public_urls("myfiles", "loophole.site", ServerKind::StaticFiles);
        assert_eq!(urls, vec!["https://myfiles.loophole.site"]);
    }

    #[test]
    fn test_webdav_urls() {
        let urls = public_urls("share1", "loophole.site", ServerKind::WebDav);
        assert_eq!(
            urls,
            vec![
                "https://share1.loophole.site",
                "davs://share1.loophole.site",
                "webdav://share1.loophole.site",
            ]
        );
    }

    #[test]
    fn test_site_id_from_url() {
        assert_eq!(
            site_id_from_url("https://alpha1.loophole.site", "loophole.site"),
            Some("alpha1")
        );
        assert_eq!(
            site_id_from_url("davs://alpha1.loophole.site/some/path", "loophole.site"),
            Some("alpha1")
        );
        assert_eq!(site_id_from_url("https://loophole.site", "loophole.site"), None);
        assert_eq!(site_id_from_url("https://a.b.loophole.site", "loophole.site"), None);
        assert_eq!(site_id_from_url("https://alpha1.other.site", "loophole.site"), None);
    }
}
