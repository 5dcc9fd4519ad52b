//! Service name lookup through the platform services database.

use std::sync::OnceLock;

const SERVICES_PATH: &str = "/etc/services";

/// Used when the services database is missing or does not list the service.
const WELL_KNOWN: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("pop3", 110),
    ("imap", 143),
    ("https", 443),
];

#[derive(Debug)]
struct ServiceEntry {
    names: Vec<String>,
    port: u16,
    protocol: String,
}

fn database() -> &'static [ServiceEntry] {
    static DATABASE: OnceLock<Vec<ServiceEntry>> = OnceLock::new();
    DATABASE.get_or_init(|| match std::fs::read_to_string(SERVICES_PATH) {
        Ok(contents) => parse(&contents),
        Err(error) => {
            tracing::debug!(?error, path = SERVICES_PATH, "services database unavailable");
            Vec::new()
        }
    })
}

/// Parses `services(5)` formatted text: `name port/protocol [aliases...] [# comment]`.
fn parse(contents: &str) -> Vec<ServiceEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split_once('#').map_or(line, |(data, _)| data);
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let (port, protocol) = fields.next()?.split_once('/')?;
            let port = port.parse().ok()?;
            let names = std::iter::once(name)
                .chain(fields)
                .map(str::to_owned)
                .collect();
            Some(ServiceEntry {
                names,
                port,
                protocol: protocol.to_owned(),
            })
        })
        .collect()
}

fn find(entries: &[ServiceEntry], service: &str, protocol: &str) -> Option<u16> {
    entries
        .iter()
        .find(|entry| {
            entry.protocol.eq_ignore_ascii_case(protocol)
                && entry.names.iter().any(|name| name == service)
        })
        .map(|entry| entry.port)
}

/// Resolves `service` for `protocol` (`"tcp"` or `"udp"`) to a port number.
///
/// A numeric `service` is accepted as the port itself.
pub(crate) fn lookup(service: &str, protocol: &str) -> Option<u16> {
    find(database(), service, protocol)
        .or_else(|| {
            WELL_KNOWN
                .iter()
                .find(|(name, _)| *name == service)
                .map(|(_, port)| *port)
        })
        .or_else(|| service.parse().ok())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::{find, lookup, parse};

    const SAMPLE: &str = "\
# Network services, Internet style
echo            7/tcp
echo            7/udp
http            80/tcp          www             # WorldWideWeb HTTP
syslog          514/udp
broken          notaport/tcp
";

    #[test]
    fn parses_names_aliases_and_protocols() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(find(&entries, "echo", "udp"), Some(7));
        assert_eq!(find(&entries, "www", "tcp"), Some(80));
        assert_eq!(find(&entries, "syslog", "tcp"), None);
        assert_eq!(find(&entries, "broken", "tcp"), None);
    }

    #[test]
    fn numeric_and_well_known_fallbacks() {
        assert_eq!(lookup("8080", "tcp"), Some(8080));
        assert_eq!(lookup("https", "tcp"), Some(443));
        assert_eq!(lookup("no-such-service", "tcp"), None);
        assert_eq!(lookup("70000", "tcp"), None);
    }
}
