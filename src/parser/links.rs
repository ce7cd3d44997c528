use crate::domain_utils::DomainUtils;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use url::Url;

lazy_static! {
    static ref URL_REGEX: Regex = Regex::new(r#"(?i)https?://[^\s<>"'`()\[\]{}|\\^]+"#).unwrap();
}

pub fn default_link_hosts() -> Vec<String> {
    vec!["tlscontact.com".to_string()]
}

pub fn default_ignored_link_patterns() -> Vec<String> {
    [
        r"unsubscribe",
        r"d[ée]sinscri",
        r"opt-?out",
        r"tracking",
        r"/track(?:/|\?)",
        r"/click(?:/|\?)",
        r"pixel",
        r"list-manage",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Picks the confirmation link out of a message.
pub struct LinkSelector {
    link_hosts: Vec<String>,
    ignored: Vec<Regex>,
}

impl LinkSelector {
    pub fn new(link_hosts: &[String], ignored_patterns: &[String]) -> Self {
        let ignored = ignored_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(&format!("(?i){pattern}")) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Ignoring invalid link pattern '{pattern}': {e}");
                    None
                }
            })
            .collect();

        Self {
            link_hosts: link_hosts.to_vec(),
            ignored,
        }
    }

    /// First acceptable URL, scanning each source in the order given.
    pub fn select(&self, sources: &[&str]) -> Option<String> {
        sources
            .iter()
            .flat_map(|source| URL_REGEX.find_iter(source))
            .map(|m| m.as_str().trim_end_matches(['.', '!', '?', ',', ';', ':']))
            .find(|candidate| self.accepts(candidate))
            .map(str::to_string)
    }

    fn accepts(&self, candidate: &str) -> bool {
        if Url::parse(candidate).is_err() {
            return false;
        }
        let Some(host) = DomainUtils::url_host(candidate) else {
            return false;
        };
        DomainUtils::matches_domain_list(&host, &self.link_hosts)
            && !self.ignored.iter().any(|re| re.is_match(candidate))
    }
}
