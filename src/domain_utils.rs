use url::Url;

/// Domain helpers shared by the sender filter and link selection.
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the lowercased domain of a `From` style address.
    ///
    /// Accepts bare addresses (`a@b.com`) as well as display forms
    /// (`"Visa Centre" <noreply@tlscontact.com>`).
    pub fn sender_domain(sender: &str) -> Option<String> {
        let address = match (sender.rfind('<'), sender.rfind('>')) {
            (Some(start), Some(end)) if start < end => &sender[start + 1..end],
            _ => sender,
        };
        let address = address.trim();
        let at = address.rfind('@')?;
        let domain = address[at + 1..]
            .trim()
            .trim_end_matches(['>', '.', ';', ','])
            .to_lowercase();
        if domain.is_empty() || domain.contains(char::is_whitespace) {
            None
        } else {
            Some(domain)
        }
    }

    /// Exact or subdomain match against a list of domains.
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.trim_end_matches('.').to_lowercase();

        domain_list.iter().any(|pattern| {
            let pattern_lower = pattern.trim_start_matches('.').to_lowercase();
            domain_lower == pattern_lower || domain_lower.ends_with(&format!(".{pattern_lower}"))
        })
    }

    /// Lowercased host of an absolute http(s) URL.
    pub fn url_host(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        parsed.host_str().map(|h| h.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_domain() {
        assert_eq!(
            DomainUtils::sender_domain("noreply@tlscontact.com"),
            Some("tlscontact.com".to_string())
        );
        assert_eq!(
            DomainUtils::sender_domain("\"TLScontact\" <NoReply@TLScontact.COM>"),
            Some("tlscontact.com".to_string())
        );
        assert_eq!(DomainUtils::sender_domain("Visa Centre"), None);
        assert_eq!(DomainUtils::sender_domain(""), None);
    }

    #[test]
    fn test_matches_domain_list() {
        let domains = vec!["tlscontact.com".to_string(), "tlsvisa.com".to_string()];

        assert!(DomainUtils::matches_domain_list("tlscontact.com", &domains));
        assert!(DomainUtils::matches_domain_list("fr.tlscontact.com", &domains));
        assert!(DomainUtils::matches_domain_list("TLSVISA.com", &domains));
        assert!(!DomainUtils::matches_domain_list("nottlscontact.com", &domains));
        assert!(!DomainUtils::matches_domain_list("tlscontact.com.evil.org", &domains));
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            DomainUtils::url_host("https://Visas-FR.tlscontact.com/confirm?id=1"),
            Some("visas-fr.tlscontact.com".to_string())
        );
        assert_eq!(DomainUtils::url_host("mailto:a@b.com"), None);
        assert_eq!(DomainUtils::url_host("not a url"), None);
    }
}
