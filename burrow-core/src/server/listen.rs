//! Opens the set of listening sockets for the configured interfaces.
//!
//! Every `(interface, transport)` combination yields one bound non-blocking
//! socket tagged with its transport type. IPv6 sockets are bound v6-only;
//! IPv4 is always served by a separate socket. Failures tear down every
//! socket opened so far, except "IPv6 not available" which demotes to a
//! warning and a skip.
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::unix::io::AsRawFd,
};

use crate::config::cli::Config;

/// number of queued TCP connections for listen()
const TCP_BACKLOG: i32 = 5;

/// How a listening socket is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenType {
    /// plain datagram socket
    Udp,
    /// datagram socket that reports each packet's destination address,
    /// used with interface-automatic wildcard binds
    UdpAncil,
    /// stream socket accepting connections
    TcpAccept,
}

/// One bound listening socket
#[derive(Debug)]
pub struct ListenPort {
    /// the bound, non-blocking socket
    pub socket: Socket,
    /// transport tag
    pub ftype: ListenType,
    /// actual bound address (relevant when the configured port is 0)
    pub addr: SocketAddr,
}

/// Listener setup failures. Apart from the demoted IPv6 cases these are
/// fatal: the caller gets no ports and the process exits at a higher layer.
#[derive(Debug, Error)]
pub enum ListenError {
    /// both address families disabled
    #[error("do-ip4 and do-ip6 are both disabled, nothing to listen on")]
    NoFamilies,
    /// every socket was skipped
    #[error("could not open sockets to accept queries")]
    NoSockets,
    /// listening interfaces are numeric addresses, never hostnames
    #[error("interface {0:?} is not a numeric ip address")]
    BadInterface(String),
    /// something else is bound there
    #[error("bind {0}: address already in use")]
    AddressInUse(SocketAddr),
    /// socket creation failed
    #[error("can't create socket for {addr}: {source}")]
    Create {
        addr: SocketAddr,
        source: io::Error,
    },
    /// bind failed for a reason other than the cases above
    #[error("can't bind socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    /// setsockopt failed
    #[error("socket option on {addr}: {source}")]
    SockOpt {
        addr: SocketAddr,
        source: io::Error,
    },
    /// listen() failed
    #[error("can't listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: io::Error,
    },
    /// no usable packet-info option on this platform or socket
    #[error("interface-automatic unsupported: {0}; disable if-automatic")]
    AncilUnsupported(io::Error),
}

/// Open all listening ports for the config. On any hard failure the
/// already-opened sockets are closed and the error is returned.
pub fn listening_ports_open(cfg: &Config) -> Result<Vec<ListenPort>, ListenError> {
    let mut do_tcp = cfg.do_tcp;
    let mut do_auto = cfg.if_automatic && cfg.do_udp;
    if cfg.incoming_num_tcp == 0 {
        do_tcp = false;
    }
    if !cfg.do_ip4 && !cfg.do_ip6 {
        return Err(ListenError::NoFamilies);
    }
    if do_auto && (!cfg.do_ip4 || !cfg.do_ip6) {
        warn!(
            "interface-automatic does not work when either do-ip4 or do-ip6 \
             is disabled, disabling the option"
        );
        do_auto = false;
    }

    let mut list = Vec::new();
    open_all(cfg, do_auto, do_tcp, &mut list)?;
    if list.is_empty() {
        return Err(ListenError::NoSockets);
    }
    Ok(list)
}

fn open_all(
    cfg: &Config,
    do_auto: bool,
    do_tcp: bool,
    list: &mut Vec<ListenPort>,
) -> Result<(), ListenError> {
    if do_auto || cfg.interface.is_empty() {
        // ip6 then ip4 so return addresses are nice
        if cfg.do_ip6 {
            let ip = if do_auto {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            };
            ports_create_if(ip, do_auto, cfg.do_udp, do_tcp, cfg.port, list)?;
        }
        if cfg.do_ip4 {
            let ip = if do_auto {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            };
            ports_create_if(ip, do_auto, cfg.do_udp, do_tcp, cfg.port, list)?;
        }
    } else {
        for ifname in &cfg.interface {
            // numeric only, no name lookups on our listening addresses
            let ip = ifname
                .parse::<IpAddr>()
                .map_err(|_| ListenError::BadInterface(ifname.clone()))?;
            if (ip.is_ipv6() && !cfg.do_ip6) || (ip.is_ipv4() && !cfg.do_ip4) {
                continue;
            }
            ports_create_if(ip, false, cfg.do_udp, do_tcp, cfg.port, list)?;
        }
    }
    Ok(())
}

/// Create the sockets for one interface address. Returns without adding
/// anything when IPv6 turns out unavailable for it.
fn ports_create_if(
    ip: IpAddr,
    do_auto: bool,
    do_udp: bool,
    do_tcp: bool,
    port: u16,
    list: &mut Vec<ListenPort>,
) -> Result<(), ListenError> {
    let addr = SocketAddr::new(ip, port);
    if do_auto {
        let Some(socket) = create_udp_sock(addr)? else {
            return Ok(());
        };
        // getting source addr packet info is highly non-portable
        set_recvpktinfo(&socket, addr).map_err(ListenError::AncilUnsupported)?;
        push_port(list, socket, ListenType::UdpAncil, addr);
    } else if do_udp {
        let Some(socket) = create_udp_sock(addr)? else {
            return Ok(());
        };
        push_port(list, socket, ListenType::Udp, addr);
    }
    if do_tcp {
        let Some(socket) = create_tcp_accept_sock(addr)? else {
            return Ok(());
        };
        push_port(list, socket, ListenType::TcpAccept, addr);
    }
    Ok(())
}

fn push_port(list: &mut Vec<ListenPort>, socket: Socket, ftype: ListenType, addr: SocketAddr) {
    let addr = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or(addr);
    debug!(%addr, ?ftype, "created listening socket");
    list.push(ListenPort {
        socket,
        ftype,
        addr,
    });
}

/// was socket creation refused because the protocol family is unavailable?
fn is_noproto(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAFNOSUPPORT) | Some(libc::EPROTONOSUPPORT)
    )
}

/// Create a bound non-blocking datagram socket, or `None` when IPv6 is not
/// available on this host for the given address.
fn create_udp_sock(addr: SocketAddr) -> Result<Option<Socket>, ListenError> {
    let domain = Domain::for_address(addr);
    let socket = match Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(s) => s,
        Err(err) if addr.is_ipv6() && is_noproto(&err) => {
            warn!(%addr, "IPv6 protocol not available");
            return Ok(None);
        }
        Err(err) => return Err(ListenError::Create { addr, source: err }),
    };
    if addr.is_ipv6() {
        // the IPv6 socket never also serves v4-mapped traffic; v4 gets its
        // own socket
        socket
            .set_only_v6(true)
            .map_err(|source| ListenError::SockOpt { addr, source })?;
        set_min_mtu(&socket, addr)?;
    }
    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            return Err(ListenError::AddressInUse(addr));
        }
        // FreeBSD jail without IPv6 permission reports EINVAL here
        Err(err) if addr.is_ipv6() && err.raw_os_error() == Some(libc::EINVAL) => {
            warn!(%addr, "IPv6 protocol not available");
            return Ok(None);
        }
        Err(err) => return Err(ListenError::Bind { addr, source: err }),
    }
    socket
        .set_nonblocking(true)
        .map_err(|source| ListenError::SockOpt { addr, source })?;
    Ok(Some(socket))
}

/// Create a bound, listening, non-blocking stream socket, or `None` when
/// IPv6 is not available on this host for the given address.
fn create_tcp_accept_sock(addr: SocketAddr) -> Result<Option<Socket>, ListenError> {
    let domain = Domain::for_address(addr);
    let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(err) if addr.is_ipv6() && is_noproto(&err) => {
            warn!(%addr, "IPv6 protocol not available");
            return Ok(None);
        }
        Err(err) => return Err(ListenError::Create { addr, source: err }),
    };
    socket
        .set_reuse_address(true)
        .map_err(|source| ListenError::SockOpt { addr, source })?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .map_err(|source| ListenError::SockOpt { addr, source })?;
    }
    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            return Err(ListenError::AddressInUse(addr));
        }
        Err(err) if addr.is_ipv6() && err.raw_os_error() == Some(libc::EINVAL) => {
            warn!(%addr, "IPv6 protocol not available");
            return Ok(None);
        }
        Err(err) => return Err(ListenError::Bind { addr, source: err }),
    }
    socket
        .set_nonblocking(true)
        .map_err(|source| ListenError::SockOpt { addr, source })?;
    socket
        .listen(TCP_BACKLOG)
        .map_err(|source| ListenError::Listen { addr, source })?;
    Ok(Some(socket))
}

fn sockopt_int(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: the fd stays open for the life of `socket` and the option
    // value is a plain c_int
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// There is no fragmentation of IPv6 datagrams during forwarding in the
/// network, so responses stay within the minimum IPv6 MTU of 1280 octets.
#[cfg(target_os = "linux")]
fn set_min_mtu(socket: &Socket, addr: SocketAddr) -> Result<(), ListenError> {
    sockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_MTU, 1280)
        .map_err(|source| ListenError::SockOpt { addr, source })
}

#[cfg(not(target_os = "linux"))]
fn set_min_mtu(_socket: &Socket, _addr: SocketAddr) -> Result<(), ListenError> {
    Ok(())
}

/// Enable per-packet destination-address reporting. Exactly one platform
/// variant is selected per family.
fn set_recvpktinfo(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    if addr.is_ipv6() {
        sockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)
    } else {
        pktinfo_v4(socket)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pktinfo_v4(socket: &Socket) -> io::Result<()> {
    sockopt_int(socket, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn pktinfo_v4(socket: &Socket) -> io::Result<()> {
    sockopt_int(socket, libc::IPPROTO_IP, libc::IP_RECVDSTADDR, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    fn v6_loopback_available() -> bool {
        std::net::UdpSocket::bind("[::1]:0").is_ok()
    }

    #[test]
    fn defaults_open_loopback_pairs() {
        if !v6_loopback_available() {
            return;
        }
        let cfg = test_config();
        let ports = listening_ports_open(&cfg).unwrap();
        let summary = ports
            .iter()
            .map(|p| (p.addr.ip(), p.ftype))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (IpAddr::V6(Ipv6Addr::LOCALHOST), ListenType::Udp),
                (IpAddr::V6(Ipv6Addr::LOCALHOST), ListenType::TcpAccept),
                (IpAddr::V4(Ipv4Addr::LOCALHOST), ListenType::Udp),
                (IpAddr::V4(Ipv4Addr::LOCALHOST), ListenType::TcpAccept),
            ]
        );
        for p in &ports {
            assert_ne!(p.addr.port(), 0, "bound to a real port");
        }
    }

    #[test]
    fn automatic_needs_both_families() {
        let cfg = Config {
            if_automatic: true,
            do_ip6: false,
            ..test_config()
        };
        let ports = listening_ports_open(&cfg).unwrap();
        // the option is silently disabled: plain loopback udp/tcp, no ancil
        assert!(!ports.is_empty());
        for p in &ports {
            assert!(p.addr.is_ipv4());
            assert_ne!(p.ftype, ListenType::UdpAncil);
        }
    }

    #[test]
    fn automatic_uses_wildcards_with_ancillary_udp() {
        if !v6_loopback_available() {
            return;
        }
        let cfg = Config {
            if_automatic: true,
            ..test_config()
        };
        let ports = listening_ports_open(&cfg).unwrap();
        let udp = ports
            .iter()
            .filter(|p| p.ftype != ListenType::TcpAccept)
            .collect::<Vec<_>>();
        assert!(!udp.is_empty());
        for p in udp {
            assert_eq!(p.ftype, ListenType::UdpAncil);
            assert!(p.addr.ip().is_unspecified());
        }
    }

    #[test]
    fn zero_tcp_pool_disables_tcp() {
        let cfg = Config {
            incoming_num_tcp: 0,
            do_ip6: false,
            ..test_config()
        };
        let ports = listening_ports_open(&cfg).unwrap();
        assert!(!ports.is_empty());
        assert!(ports.iter().all(|p| p.ftype == ListenType::Udp));
    }

    #[test]
    fn explicit_interface_filters_families() {
        let cfg = Config {
            interface: vec!["127.0.0.1".into()],
            ..test_config()
        };
        let ports = listening_ports_open(&cfg).unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.addr.is_ipv4()));
    }

    #[test]
    fn interface_must_be_numeric() {
        let cfg = Config {
            interface: vec!["eth0".into()],
            ..test_config()
        };
        assert!(matches!(
            listening_ports_open(&cfg),
            Err(ListenError::BadInterface(_))
        ));
    }

    #[test]
    fn no_families_is_an_error() {
        let cfg = Config {
            do_ip4: false,
            do_ip6: false,
            ..test_config()
        };
        assert!(matches!(
            listening_ports_open(&cfg),
            Err(ListenError::NoFamilies)
        ));
    }

    #[test]
    fn address_in_use_is_fatal() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let cfg = Config {
            port,
            interface: vec!["127.0.0.1".into()],
            do_tcp: false,
            ..Config::default()
        };
        assert!(matches!(
            listening_ports_open(&cfg),
            Err(ListenError::AddressInUse(_))
        ));
    }
}
