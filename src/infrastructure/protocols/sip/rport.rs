/// RPORT support for NAT traversal (RFC 3581)
///
/// Devices usually sit behind NAT, so the address requests are sent back to
/// is learned from the top Via of their REGISTER rather than from Contact.

use std::net::SocketAddr;
use tracing::debug;

/// Extract rport value from Via header
///
/// Returns the port number if rport parameter is present with a value
pub fn extract_rport_from_via(via_header: &str) -> Option<u16> {
    via_header.split(';').find_map(|param| {
        let port = param.trim().strip_prefix("rport=")?.trim().parse::<u16>().ok()?;
        (port != 0).then_some(port)
    })
}

/// Extract received parameter from Via header
pub fn extract_received_from_via(via_header: &str) -> Option<String> {
    via_header.split(';').find_map(|param| {
        param
            .trim()
            .strip_prefix("received=")
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
    })
}

/// Check if Via header has rport parameter
pub fn has_rport_parameter(via_header: &str) -> bool {
    via_header
        .split(';')
        .skip(1)
        .any(|p| p.trim() == "rport" || p.trim().starts_with("rport="))
}

/// `(transport, host, port)` of the Via sent-by
pub fn parse_sent_by(via_header: &str) -> Option<(String, String, Option<u16>)> {
    let head = via_header.split(';').next()?.trim();
    let (protocol, sent_by) = head.split_once(char::is_whitespace)?;
    let transport = protocol.rsplit('/').next()?.to_ascii_uppercase();
    let sent_by = sent_by.trim();

    // [v6]:port
    if let Some(rest) = sent_by.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some((transport, format!("[{}]", host), port));
    }

    match sent_by.rsplit_once(':') {
        Some((host, port)) => Some((transport, host.to_string(), port.parse().ok())),
        None => Some((transport, sent_by.to_string(), None)),
    }
}

/// Address to send requests to a device, from the top Via of its REGISTER.
///
/// `received` and `rport` win when present. A bare `rport` flag means the
/// device asked for symmetric response routing, so the packet's source
/// address is used. Otherwise the sent-by host and port apply, the port
/// defaulting to 5060 over UDP and 5061 otherwise.
pub fn resolve_send_addr(via_header: &str, source: SocketAddr) -> String {
    let (transport, via_host, via_port) = match parse_sent_by(via_header) {
        Some(parts) => parts,
        None => return source.to_string(),
    };

    let rport = extract_rport_from_via(via_header);
    let received = extract_received_from_via(via_header);
    let bare_rport = rport.is_none() && has_rport_parameter(via_header);

    let host = match (received, bare_rport) {
        (Some(ip), _) => ip,
        (None, true) => source.ip().to_string(),
        (None, false) => via_host,
    };
    let port = match (rport, bare_rport) {
        (Some(port), _) => port,
        (None, true) => source.port(),
        (None, false) => via_port.unwrap_or(if transport == "UDP" { 5060 } else { 5061 }),
    };

    let addr = format!("{}:{}", host, port);
    debug!("Resolved send address {} from Via", addr);
    addr
}
