/*!
Trusted-subnet filtering by caller IP address.
*/

use crate::{Result, TallyError};
use std::fmt;
use std::net::IpAddr;

/// An optional CIDR block callers must originate from
///
/// An unconfigured subnet admits everyone.
///
/// # Example
/// ```rust
/// use tally_core::TrustedSubnet;
///
/// let subnet = TrustedSubnet::parse("10.0.0.0/8")?;
/// assert!(subnet.allows("10.1.2.3"));
/// assert!(!subnet.allows("192.168.1.1"));
/// assert!(!subnet.allows("not-an-ip"));
/// # Ok::<(), tally_core::TallyError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustedSubnet {
    network: Option<(IpAddr, u8)>,
}

impl TrustedSubnet {
    /// Admit every caller
    pub fn any() -> Self {
        Self::default()
    }

    /// Parse a CIDR such as `192.168.0.0/16`; blank input admits everyone
    ///
    /// # Errors
    /// Returns a configuration error for a malformed address or prefix.
    pub fn parse(cidr: &str) -> Result<Self> {
        let cidr = cidr.trim();
        if cidr.is_empty() {
            return Ok(Self::any());
        }

        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| TallyError::config(format!("trusted subnet '{cidr}' is not a CIDR")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| TallyError::config(format!("trusted subnet '{cidr}': {e}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| TallyError::config(format!("trusted subnet '{cidr}': {e}")))?;

        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(TallyError::config(format!(
                "trusted subnet '{cidr}': prefix must be at most {max}"
            )));
        }

        Ok(Self {
            network: Some((mask(addr, prefix), prefix)),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.network.is_some()
    }

    /// Whether `ip` lies inside the subnet
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4. Families never match
    /// each other otherwise.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let Some((network, prefix)) = self.network else {
            return true;
        };
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        match (network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, prefix) == network
            }
            _ => false,
        }
    }

    /// Textual check used for header-supplied addresses; unparseable text is
    /// rejected whenever a subnet is configured
    pub fn allows(&self, ip: &str) -> bool {
        if !self.is_configured() {
            return true;
        }
        match ip.trim().parse::<IpAddr>() {
            Ok(ip) => self.contains(ip),
            Err(_) => false,
        }
    }
}

impl fmt::Display for TrustedSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Some((network, prefix)) => write!(f, "{network}/{prefix}"),
            None => f.write_str("any"),
        }
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}
