use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("IPv6 destinations are not supported by NAT gateways: {0}")]
    UnsupportedFamily(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Parses a destination network in `address/prefix` notation.
///
/// Host bits are cleared, so `10.0.0.1/24` yields `10.0.0.0/24`. A bare
/// address without prefix length is rejected, as are IPv6 networks.
pub fn parse_destination(value: &str) -> ValidationResult<IpNet> {
    let trimmed = value.trim();
    let net: IpNet = trimmed
        .parse()
        .map_err(|_| ValidationError::InvalidCidr(trimmed.to_string()))?;

    match net {
        IpNet::V4(_) => Ok(net.trunc()),
        IpNet::V6(_) => Err(ValidationError::UnsupportedFamily(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_cidr() {
        let net = parse_destination("213.95.138.236/32").unwrap();
        assert_eq!(net.to_string(), "213.95.138.236/32");
    }

    #[test]
    fn test_parse_clears_host_bits() {
        let net = parse_destination("10.0.0.1/24").unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let net = parse_destination("  10.1.0.0/16\n").unwrap();
        assert_eq!(net.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_parse_rejects_bare_address() {
        assert_eq!(
            parse_destination("10.0.0.1"),
            Err(ValidationError::InvalidCidr("10.0.0.1".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_destination("not-a-network").is_err());
        assert!(parse_destination("").is_err());
        assert!(parse_destination("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_parse_rejects_ipv6() {
        assert!(matches!(
            parse_destination("2001:db8::/32"),
            Err(ValidationError::UnsupportedFamily(_))
        ));
    }
}
