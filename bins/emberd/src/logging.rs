use tracing_subscriber::EnvFilter;

const SERVICES: [&str; 4] = ["dhcp", "tftp", "http", "nbd"];

/// Is `service` selected by a comma separated tag list? `all` selects
/// everything and a leading `-` excludes, so `all,-dhcp` is every
/// service except DHCP.
fn tag_enabled(tags: &str, service: &str) -> bool {
    let tags = tags.to_lowercase();
    let mut listed = false;
    let mut excluded = false;
    for tag in tags.split(',').map(str::trim) {
        if tag == service || tag == "all" {
            listed = true;
        }
        if tag.strip_prefix('-') == Some(service) {
            excluded = true;
        }
    }
    listed && !excluded
}

/// Wire the service tag lists into one subscriber: everything defaults
/// to warn, the supervisor and binary speak at info, and tagged
/// services are raised to info (verbose) or debug.
pub fn init(debug: &str, verbose: &str) {
    let mut directives = vec![
        "warn".to_string(),
        "emberd=info".to_string(),
        "netboot::server=info".to_string(),
    ];
    for service in SERVICES {
        if tag_enabled(debug, service) {
            directives.push(format!("netboot::{service}=debug"));
        } else if tag_enabled(verbose, service) {
            directives.push(format!("netboot::{service}=info"));
        }
    }

    let filter = EnvFilter::new(directives.join(","));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tags_select_services() {
        assert!(tag_enabled("dhcp,tftp", "dhcp"));
        assert!(tag_enabled("dhcp,tftp", "tftp"));
        assert!(!tag_enabled("dhcp,tftp", "http"));
        assert!(!tag_enabled("", "dhcp"));
    }

    #[test]
    fn all_selects_everything_except_exclusions() {
        assert!(tag_enabled("all", "nbd"));
        assert!(tag_enabled("all,-dhcp", "tftp"));
        assert!(!tag_enabled("all,-dhcp", "dhcp"));
    }

    #[test]
    fn tags_are_case_insensitive() {
        assert!(tag_enabled("DHCP", "dhcp"));
        assert!(tag_enabled("All", "http"));
    }
}
