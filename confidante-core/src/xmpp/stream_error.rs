use crate::xml::{namespaces, Element};

/// Stream-error conditions the connection state machine can raise.
/// Each variant names the defined-condition element that goes inside
/// `<stream:error>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    BadFormat,
    ConnectionTimeout,
    Conflict,
    HostUnknown,
    InternalServerError,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    SystemShutdown,
}

impl StreamError {
    pub fn condition(&self) -> &'static str {
        match self {
            StreamError::BadFormat => "bad-format",
            StreamError::ConnectionTimeout => "connection-timeout",
            StreamError::Conflict => "conflict",
            StreamError::HostUnknown => "host-unknown",
            StreamError::InternalServerError => "internal-server-error",
            StreamError::InvalidNamespace => "invalid-namespace",
            StreamError::InvalidXml => "invalid-xml",
            StreamError::NotAuthorized => "not-authorized",
            StreamError::PolicyViolation => "policy-violation",
            StreamError::RemoteConnectionFailed => "remote-connection-failed",
            StreamError::SystemShutdown => "system-shutdown",
        }
    }

    /// Renders `<stream:error><condition xmlns='...streams'/></stream:error>`.
    pub fn to_element(self) -> Element {
        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.with_child(self.condition(), Some(namespaces::XMPP_STREAM_ERRORS), |el| {
            el.set_attribute("xmlns", None, namespaces::XMPP_STREAM_ERRORS);
        });
        error
    }
}

/// Maps an error reported by the session manager to the stream-error the
/// client should see.
pub fn from_sm_error(reason: &str, is_open: bool) -> StreamError {
    match (is_open, reason) {
        (true, "Disconnected") => StreamError::Conflict,
        (true, _) => StreamError::InternalServerError,
        (false, "Internal Timeout") => StreamError::RemoteConnectionFailed,
        (false, _) => StreamError::NotAuthorized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_disconnected_is_conflict() {
        assert_eq!(from_sm_error("Disconnected", true), StreamError::Conflict);
    }

    #[test]
    fn open_other_is_internal_server_error() {
        assert_eq!(
            from_sm_error("anything else", true),
            StreamError::InternalServerError
        );
    }

    #[test]
    fn pre_open_internal_timeout_is_remote_connection_failed() {
        assert_eq!(
            from_sm_error("Internal Timeout", false),
            StreamError::RemoteConnectionFailed
        );
    }

    #[test]
    fn pre_open_other_is_not_authorized() {
        assert_eq!(from_sm_error("anything else", false), StreamError::NotAuthorized);
    }

    #[test]
    fn condition_strings_match_spec() {
        assert_eq!(StreamError::HostUnknown.condition(), "host-unknown");
        assert_eq!(StreamError::InvalidNamespace.condition(), "invalid-namespace");
        assert_eq!(
            StreamError::ConnectionTimeout.condition(),
            "connection-timeout"
        );
    }
}
