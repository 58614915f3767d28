//! Decides whether a failed exchange is worth retrying.
//!
//! Only transport flakiness is recoverable. Well-formed error responses,
//! undecodable 2xx bodies and cancellation are application outcomes and are
//! returned to the caller untouched.

use crate::error::{SidecarError, TransportError, TransportErrorKind};
use std::error::Error as StdError;
use std::io;

pub fn is_recoverable(error: &SidecarError) -> bool {
    match error {
        SidecarError::Transport(transport) => is_recoverable_kind(transport.kind),
        _ => false,
    }
}

pub fn is_recoverable_kind(kind: TransportErrorKind) -> bool {
    !matches!(kind, TransportErrorKind::Other)
}

impl From<reqwest::Error> for SidecarError {
    fn from(err: reqwest::Error) -> Self {
        SidecarError::Transport(TransportError::from_reqwest(&err))
    }
}

impl TransportError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let chain = error_chain_text(err);
        let kind = classify_parts(ReqwestFlags {
            timeout: err.is_timeout(),
            connect: err.is_connect(),
            request_or_body: err.is_request() || err.is_body(),
            decode: err.is_decode(),
            io_kind: io_kind_in_chain(err),
            chain: &chain,
        });
        TransportError::new(kind, chain)
    }

    pub fn from_io(err: &io::Error) -> Self {
        TransportError::new(kind_for_io(err.kind()), err.to_string())
    }
}

struct ReqwestFlags<'a> {
    timeout: bool,
    connect: bool,
    request_or_body: bool,
    decode: bool,
    io_kind: Option<io::ErrorKind>,
    /// Lower-cased display text of the whole source chain.
    chain: &'a str,
}

fn classify_parts(flags: ReqwestFlags<'_>) -> TransportErrorKind {
    if flags.timeout || flags.io_kind == Some(io::ErrorKind::TimedOut) {
        return TransportErrorKind::TimedOut;
    }
    if is_dns_text(flags.chain) {
        return TransportErrorKind::DnsFailure;
    }
    if let Some(kind) = flags.io_kind {
        let mapped = kind_for_io(kind);
        if mapped != TransportErrorKind::Other {
            return mapped;
        }
    }
    if flags.chain.contains("unreachable") || flags.chain.contains("not connected") {
        return TransportErrorKind::NotConnected;
    }
    if is_malformed_text(flags.chain) {
        return TransportErrorKind::MalformedResponse;
    }
    if flags.connect {
        return TransportErrorKind::ConnectionRefused;
    }
    if flags.decode {
        return TransportErrorKind::MalformedResponse;
    }
    if flags.request_or_body {
        return TransportErrorKind::ConnectionLost;
    }
    TransportErrorKind::Other
}

fn kind_for_io(kind: io::ErrorKind) -> TransportErrorKind {
    match kind {
        io::ErrorKind::TimedOut => TransportErrorKind::TimedOut,
        io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionLost,
        io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
            TransportErrorKind::NotConnected
        }
        io::ErrorKind::InvalidData => TransportErrorKind::MalformedResponse,
        _ => TransportErrorKind::Other,
    }
}

fn is_dns_text(chain: &str) -> bool {
    chain.contains("dns error")
        || chain.contains("failed to lookup address")
        || chain.contains("name or service not known")
        || chain.contains("nodename nor servname")
        || chain.contains("no such host")
}

fn is_malformed_text(chain: &str) -> bool {
    chain.contains("invalid http")
        || chain.contains("error parsing")
        || chain.contains("invalid status")
        || chain.contains("invalid header")
        || chain.contains("message head is too large")
}

fn io_kind_in_chain(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(kind: TransportErrorKind) -> SidecarError {
        SidecarError::Transport(TransportError::new(kind, "x"))
    }

    fn flags(chain: &str) -> ReqwestFlags<'_> {
        ReqwestFlags {
            timeout: false,
            connect: false,
            request_or_body: false,
            decode: false,
            io_kind: None,
            chain,
        }
    }

    #[test]
    fn recoverable_table() {
        for kind in [
            TransportErrorKind::TimedOut,
            TransportErrorKind::ConnectionLost,
            TransportErrorKind::ConnectionRefused,
            TransportErrorKind::DnsFailure,
            TransportErrorKind::NotConnected,
            TransportErrorKind::MalformedResponse,
        ] {
            assert!(is_recoverable(&transport(kind)), "{kind:?}");
        }
    }

    #[test]
    fn non_recoverable_table() {
        let cases = [
            SidecarError::Api {
                status: 400,
                message: "bad prompt".into(),
            },
            SidecarError::Http { status: 500 },
            SidecarError::StaleVersion("/prompt".into()),
            SidecarError::UnexpectedResponse("not json".into()),
            SidecarError::Cancelled,
            SidecarError::Config("missing".into()),
            transport(TransportErrorKind::Other),
        ];
        for case in cases {
            assert!(!is_recoverable(&case), "{case:?}");
        }
    }

    #[test]
    fn classify_by_flags_and_text() {
        assert_eq!(
            classify_parts(ReqwestFlags {
                timeout: true,
                ..flags("operation timed out")
            }),
            TransportErrorKind::TimedOut
        );
        assert_eq!(
            classify_parts(ReqwestFlags {
                connect: true,
                ..flags("error sending request: dns error: failed to lookup address information")
            }),
            TransportErrorKind::DnsFailure
        );
        assert_eq!(
            classify_parts(ReqwestFlags {
                connect: true,
                io_kind: Some(io::ErrorKind::ConnectionRefused),
                ..flags("tcp connect error: connection refused")
            }),
            TransportErrorKind::ConnectionRefused
        );
        assert_eq!(
            classify_parts(ReqwestFlags {
                request_or_body: true,
                ..flags("connection closed before message completed")
            }),
            TransportErrorKind::ConnectionLost
        );
        assert_eq!(
            classify_parts(ReqwestFlags {
                request_or_body: true,
                ..flags("error sending request: invalid http version parsed")
            }),
            TransportErrorKind::MalformedResponse
        );
        assert_eq!(
            classify_parts(flags("builder error: relative url without a base")),
            TransportErrorKind::Other
        );
    }

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(
            TransportError::from_io(&reset).kind,
            TransportErrorKind::ConnectionLost
        );
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(TransportError::from_io(&denied).kind, TransportErrorKind::Other);
    }

    #[tokio::test]
    async fn closed_port_is_connection_refused() {
        let port = crate::test_support::closed_port();
        let err = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .unwrap_err();
        let sidecar_err = SidecarError::from(err);
        assert!(
            matches!(
                &sidecar_err,
                SidecarError::Transport(t) if t.kind == TransportErrorKind::ConnectionRefused
            ),
            "{sidecar_err:?}"
        );
        assert!(is_recoverable(&sidecar_err));
    }
}
