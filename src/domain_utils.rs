use url::{Host, Url};

/// Maps a URL to the registrable domain it belongs to.
pub trait DomainResolver: Send + Sync {
    fn registrable_domain(&self, url: &str) -> Option<String>;
}

/// Second-level labels under which registrations happen one level deeper
/// (`example.co.uk`, not `co.uk`).
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "ac", "co", "com", "edu", "gov", "gv", "ltd", "me", "mil", "net", "nhs", "nic", "or",
    "org", "plc", "sch",
];

/// Minimal registrable-domain resolver backed by the `url` parser.
///
/// Hosts are lowercased and IDNs come out in punycode form. Anything beyond
/// the common two-letter ccTLD second levels needs a full public suffix list,
/// which callers can plug in through [`DomainResolver`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainUtils;

impl DomainUtils {
    /// Host of a URL, lowercased, without a trailing root dot.
    pub fn host(url: &str) -> Option<Host<String>> {
        let parsed = Url::parse(url).ok()?;
        match parsed.host()? {
            Host::Domain(domain) => Some(Host::Domain(
                domain.trim_end_matches('.').to_lowercase(),
            )),
            Host::Ipv4(ip) => Some(Host::Ipv4(ip)),
            Host::Ipv6(ip) => Some(Host::Ipv6(ip)),
        }
    }

    /// Collapse a hostname to its registrable part.
    pub fn registrable_part(host: &str) -> String {
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() <= 2 {
            return labels.join(".");
        }

        let tld = labels[labels.len() - 1];
        let second = labels[labels.len() - 2];
        let keep = if tld.len() == 2 && MULTI_LABEL_SUFFIXES.contains(&second) {
            3
        } else {
            2
        };
        labels[labels.len() - keep..].join(".")
    }
}

impl DomainResolver for DomainUtils {
    fn registrable_domain(&self, url: &str) -> Option<String> {
        match Self::host(url)? {
            Host::Domain(domain) => {
                let registrable = Self::registrable_part(&domain);
                (!registrable.is_empty()).then_some(registrable)
            }
            Host::Ipv4(ip) => Some(ip.to_string()),
            Host::Ipv6(ip) => Some(ip.to_string()),
        }
    }
}
