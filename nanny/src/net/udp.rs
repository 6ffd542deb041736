//! UDP multicast announcements and query-by-example.
//!
//! Two sockets: a multicast-joined listener on the well-known group, and an
//! anonymous unicast socket that both sends announcements to the group and
//! answers queries back to whoever asked.
//!
//! Queries are datagrams starting with `?`, holding whitespace-separated
//! tokens: `KEY` requests a value, `KEY=V` / `KEY<V` / `KEY>V` assert one.
//! If every assertion holds, the reply lists `KEY=VALUE` for each token;
//! otherwise, silence.

// Layer 1: Standard library imports
use std::cmp::Ordering;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

// Layer 2: Third-party crate imports
use nix::sys::socket::sockopt::{IpAddMembership, ReuseAddr};
use nix::sys::socket::{
    bind, setsockopt, socket, AddressFamily, IpMembershipRequest, SockFlag, SockType, SockaddrIn,
};
use tracing::{debug, warn};

// Layer 3: Internal module imports
use crate::error::{NannyError, NannyResult};
use crate::variables::{self, VariableSource};

/// Outbound side: an anonymous unicast socket aimed at the multicast group.
#[derive(Debug)]
pub struct UdpAnnouncer {
    sock: UdpSocket,
    group: SocketAddrV4,
}

impl UdpAnnouncer {
    /// Binds the anonymous unicast socket.
    pub fn new(group: Ipv4Addr, port: u16) -> NannyResult<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| NannyError::net("udp bind", e))?;
        Ok(Self {
            sock,
            group: SocketAddrV4::new(group, port),
        })
    }

    /// Sends one datagram to the multicast group.
    pub fn announce(&self, msg: &str) {
        if let Err(err) = self.sock.send_to(msg.as_bytes(), self.group) {
            warn!(error = %err, "multicast announce failed");
        }
    }

    /// Sends a query reply back to the requester.
    pub fn reply(&self, msg: &str, to: SocketAddr) {
        if let Err(err) = self.sock.send_to(msg.as_bytes(), to) {
            warn!(error = %err, "query reply failed");
        }
    }
}

/// Inbound side: the multicast-joined listener.
#[derive(Debug)]
pub struct UdpListener {
    sock: UdpSocket,
}

impl UdpListener {
    /// Binds `0.0.0.0:port` with `SO_REUSEADDR` and joins the group.
    pub fn bind_multicast(group: Ipv4Addr, port: u16) -> NannyResult<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(|e| NannyError::net("udp socket", e))?;
        setsockopt(&fd, ReuseAddr, &true).map_err(|e| NannyError::net("SO_REUSEADDR", e))?;
        bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, port))
            .map_err(|e| NannyError::net("multicast bind", e))?;
        let membership = IpMembershipRequest::new(group, None);
        setsockopt(&fd, IpAddMembership, &membership)
            .map_err(|e| NannyError::net("IP_ADD_MEMBERSHIP", e))?;

        let sock = UdpSocket::from(fd);
        sock.set_nonblocking(true)
            .map_err(|e| NannyError::net("udp nonblocking", e))?;
        Ok(Self { sock })
    }

    /// Descriptor for reactor registration.
    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Receives one datagram and answers it if it is a passing query.
    pub fn handle_datagram(&self, source: &dyn VariableSource, announcer: &UdpAnnouncer) {
        let mut buf = [0u8; 16384];
        let (len, from) = match self.sock.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(error = %err, "udp recv failed");
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            return;
        };
        if let Some(query) = text.strip_prefix('?') {
            if let Some(reply) = answer_query(source, query) {
                debug!(from = %from, reply = reply.as_str(), "query answered");
                announcer.reply(&reply, from);
            }
        }
        // Announcements from peers are ignored.
    }
}

/// Evaluates a query-by-example string against a variable source.
///
/// Returns the `KEY=VALUE` reply when every assertion holds and every key
/// resolves, `None` for silence. The reply always uses `KEY=VALUE` form
/// regardless of how a token was written.
pub fn answer_query(source: &dyn VariableSource, query: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    for token in query.split_whitespace() {
        let split = token.find(['=', '<', '>']);
        let (key, assertion) = match split {
            Some(i) => {
                let (key, rest) = token.split_at(i);
                let op = rest.chars().next()?;
                (key, Some((op, &rest[1..])))
            }
            None => (token, None),
        };
        if key.is_empty() {
            return None;
        }

        let current = source.lookup(key)?;
        if let Some((op, given)) = assertion {
            let ordering = variables::compare(source, key, given)?;
            let holds = match op {
                '=' => ordering == Ordering::Equal,
                '>' => ordering == Ordering::Greater,
                '<' => ordering == Ordering::Less,
                _ => false,
            };
            if !holds {
                return None;
            }
        }
        parts.push(format!("{key}={current}"));
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource {
        ints: HashMap<&'static str, i64>,
        strs: HashMap<&'static str, &'static str>,
    }

    impl VariableSource for MapSource {
        fn integer(&self, key: &str) -> Option<i64> {
            self.ints.get(key).copied()
        }

        fn lookup(&self, key: &str) -> Option<String> {
            if let Some(v) = self.ints.get(key) {
                return Some(v.to_string());
            }
            self.strs.get(key).map(|v| (*v).to_string())
        }
    }

    fn running_source() -> MapSource {
        MapSource {
            ints: HashMap::from([("PID", 4242), ("HTTP_PORT", 51717)]),
            strs: HashMap::from([("POD", "p01"), ("INSTANCE", "gd#1")]),
        }
    }

    fn idle_source() -> MapSource {
        MapSource {
            ints: HashMap::from([("HTTP_PORT", 51717)]),
            strs: HashMap::new(),
        }
    }

    #[test]
    fn test_bare_key_round_trip() {
        let src = running_source();
        assert_eq!(
            answer_query(&src, "HTTP_PORT").as_deref(),
            Some("HTTP_PORT=51717")
        );
    }

    #[test]
    fn test_assertion_gate_with_request() {
        let src = running_source();
        assert_eq!(
            answer_query(&src, "HTTP_PORT PID>0").as_deref(),
            Some("HTTP_PORT=51717 PID=4242")
        );
    }

    #[test]
    fn test_no_reply_when_child_not_running() {
        let src = idle_source();
        assert_eq!(answer_query(&src, "HTTP_PORT PID>0"), None);
    }

    #[test]
    fn test_failed_equality_is_silent() {
        let src = running_source();
        assert_eq!(answer_query(&src, "POD=p02 INSTANCE"), None);
        assert_eq!(
            answer_query(&src, "POD=p01 INSTANCE").as_deref(),
            Some("POD=p01 INSTANCE=gd#1")
        );
    }

    #[test]
    fn test_numeric_comparison_operators() {
        let src = running_source();
        assert!(answer_query(&src, "HTTP_PORT<60000").is_some());
        assert!(answer_query(&src, "HTTP_PORT>60000").is_none());
        assert!(answer_query(&src, "HTTP_PORT=51717").is_some());
        // Numeric, not lexicographic: 9999 < 51717.
        assert!(answer_query(&src, "HTTP_PORT<9999").is_none());
    }

    #[test]
    fn test_unknown_key_request_is_silent() {
        let src = running_source();
        assert_eq!(answer_query(&src, "NO_SUCH_KEY_EXISTS_HERE"), None);
    }

    #[test]
    fn test_empty_query_is_silent() {
        let src = running_source();
        assert_eq!(answer_query(&src, ""), None);
        assert_eq!(answer_query(&src, "   "), None);
    }

    #[test]
    fn test_malformed_token_is_silent() {
        let src = running_source();
        assert_eq!(answer_query(&src, "=oops"), None);
    }
}
