use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{bail, Error};
use regex::Regex;

/// An XMPP address ("Jabber ID"): `[local@]domain[/resource]`.
///
/// Stringprep normalization of each part is out of scope here — this
/// type only parses, stores, and re-renders the three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<String>, domain: String, resource: Option<String>) -> Self {
        Self {
            local,
            domain,
            resource,
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Drops the resource part, yielding the bare JID.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a new JID with the given resource attached (used by
    /// resource binding once SASL authentication completes).
    pub fn bind(&self, resource: String) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource),
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let regex =
            Regex::new("^(?:(?P<local>[^@/]+)@)?(?P<domain>[^@/]+)(?:/(?P<resource>.+))?$")
                .unwrap();
        match regex.captures(s) {
            Some(captures) => {
                let local = captures.name("local").map(|m| m.as_str().to_string());
                let domain = captures
                    .name("domain")
                    .map(|m| m.as_str().to_string())
                    .unwrap();
                let resource = captures.name("resource").map(|m| m.as_str().to_string());

                Ok(Jid {
                    local,
                    domain,
                    resource,
                })
            }
            None => bail!("could not parse JID: \"{s}\""),
        }
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{}@{}", local, self.domain)?,
            None => write!(f, "{}", self.domain)?,
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Jid;

    #[test]
    fn fail_on_empty_string() {
        let result = "".parse::<Jid>();
        assert!(result.is_err());
    }

    #[test]
    fn parse_bare() {
        let jid = "juliet@example.com".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("juliet"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn parse_full() {
        let jid = "juliet@example.com/balcony".parse::<Jid>().unwrap();
        assert_eq!(jid.resource(), Some("balcony"));
        assert_eq!(jid.to_string(), "juliet@example.com/balcony");
    }

    #[test]
    fn parse_domain_only() {
        let jid = "example.com".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.to_string(), "example.com");
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid = "juliet@example.com/balcony".parse::<Jid>().unwrap();
        assert_eq!(jid.to_bare().to_string(), "juliet@example.com");
    }

    #[test]
    fn bind_attaches_resource() {
        let jid = "juliet@example.com".parse::<Jid>().unwrap();
        let bound = jid.bind("balcony".to_string());
        assert_eq!(bound.to_string(), "juliet@example.com/balcony");
        assert!(!bound.is_bare());
    }
}
