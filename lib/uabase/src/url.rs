use crate::status::StatusCode;
use crate::DEFAULT_PORT;

/// Transport scheme of an endpoint url.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Scheme {
    OpcTcp,
    OpcUdp,
    OpcEth,
    OpcMqtt,
}

impl Scheme {
    fn parse(text: &str) -> Option<Scheme> {
        match text {
            "opc.tcp" => Some(Scheme::OpcTcp),
            "opc.udp" => Some(Scheme::OpcUdp),
            "opc.eth" => Some(Scheme::OpcEth),
            "opc.mqtt" => Some(Scheme::OpcMqtt),
            _ => None,
        }
    }
}

/// A parsed `opc.tcp://host[:port][/path]` endpoint url. The hostname may be
/// an IPv6 literal in brackets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<EndpointUrl, StatusCode> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID)?;
        let scheme =
            Scheme::parse(scheme_str).ok_or(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID)?;

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, ""),
        };

        // IPv6 literals are bracketed so the colons inside do not clash with
        // the port separator
        let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID)?;
            let port_str = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => return Err(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID),
            };
            (host, port_str)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
        }

        let port = match port_str {
            Some(text) => text
                .parse::<u16>()
                .map_err(|_| StatusCode::BAD_TCP_ENDPOINT_URL_INVALID)?,
            None => DEFAULT_PORT,
        };

        Ok(EndpointUrl {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let url = EndpointUrl::parse("opc.tcp://example.com:4841/server/one").unwrap();
        assert_eq!(url.scheme, Scheme::OpcTcp);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 4841);
        assert_eq!(url.path, "/server/one");
    }

    #[test]
    fn test_parse_default_port() {
        let url = EndpointUrl::parse("opc.tcp://example.com").unwrap();
        assert_eq!(url.port, 4840);
        assert_eq!(url.path, "");
    }

    #[test]
    fn test_parse_ipv6() {
        let url = EndpointUrl::parse("opc.tcp://[fe80::1]:4840/x").unwrap();
        assert_eq!(url.host, "fe80::1");
        assert_eq!(url.port, 4840);

        let url = EndpointUrl::parse("opc.udp://[::1]").unwrap();
        assert_eq!(url.scheme, Scheme::OpcUdp);
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 4840);
    }

    #[test]
    fn test_parse_other_schemes() {
        assert_eq!(
            EndpointUrl::parse("opc.eth://00-0C-29-12-34-56").unwrap().scheme,
            Scheme::OpcEth
        );
        assert_eq!(
            EndpointUrl::parse("opc.mqtt://broker:1883").unwrap().scheme,
            Scheme::OpcMqtt
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "http://x", "opc.tcp:/missing", "opc.tcp://", "opc.tcp://host:notaport"] {
            assert_eq!(
                EndpointUrl::parse(bad).unwrap_err(),
                StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
                "{}",
                bad
            );
        }
    }
}
