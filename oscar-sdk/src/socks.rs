//! SOCKS5 client handshake.
//!
//! Method negotiation (no-auth, plus username/password when credentials are
//! configured), the version-1 username/password sub-negotiation, then a
//! CONNECT request with a domain-name or IPv4 address type. Any byte the
//! protocol does not allow aborts the handshake with a typed error.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SocksProxy;

pub const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("proxy rejected every offered auth method")]
    NoAcceptableMethod,
    #[error("proxy rejected credentials")]
    AuthRejected,
    #[error("proxy refused CONNECT (reply code {0})")]
    ConnectRefused(u8),
    #[error("malformed proxy response")]
    Malformed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Build the method-selection greeting.
fn method_request(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![SOCKS_VERSION, 0x02, METHOD_NONE, METHOD_USERPASS]
    } else {
        vec![SOCKS_VERSION, 0x01, METHOD_NONE]
    }
}

/// Build the username/password sub-negotiation request (version 1).
fn auth_request(username: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

/// Build the CONNECT request for `host:port`. A dotted-quad host is encoded
/// as an IPv4 address, anything else as a domain name.
fn connect_request(host: &str, port: u16) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Run the full SOCKS5 client handshake on an already-connected proxy
/// stream, asking it to connect onward to `host:port`.
pub async fn handshake(
    stream: &mut TcpStream,
    proxy: &SocksProxy,
    host: &str,
    port: u16,
) -> Result<(), SocksError> {
    let creds = proxy
        .username
        .as_deref()
        .map(|u| (u, proxy.password.as_deref().unwrap_or("")));

    stream.write_all(&method_request(creds.is_some())).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] == METHOD_UNACCEPTABLE {
        return Err(SocksError::NoAcceptableMethod);
    }

    if reply[1] == METHOD_USERPASS {
        let (user, pass) = creds.ok_or(SocksError::NoAcceptableMethod)?;
        stream.write_all(&auth_request(user, pass)).await?;
        let mut auth_reply = [0u8; 2];
        stream.read_exact(&mut auth_reply).await?;
        if auth_reply[0] != 0x01 || auth_reply[1] != 0x00 {
            return Err(SocksError::AuthRejected);
        }
    } else if reply[1] != METHOD_NONE {
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&connect_request(host, port)).await?;

    // Reply: ver, rep, rsv, atyp, bound addr, bound port.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Malformed);
    }
    if head[1] != 0x00 {
        return Err(SocksError::ConnectRefused(head[1]));
    }
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        0x04 => 16, // IPv6
        _ => return Err(SocksError::Malformed),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;

    debug!(host, port, "SOCKS5 tunnel established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_offers_userpass_only_with_creds() {
        assert_eq!(method_request(false), vec![0x05, 0x01, 0x00]);
        assert_eq!(method_request(true), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn auth_request_layout() {
        let buf = auth_request("user", "pw");
        assert_eq!(buf, b"\x01\x04user\x02pw");
    }

    #[test]
    fn connect_encodes_domain_and_ipv4() {
        let domain = connect_request("login.example.net", 5190);
        assert_eq!(&domain[..4], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(domain[4] as usize, "login.example.net".len());
        assert_eq!(&domain[domain.len() - 2..], &5190u16.to_be_bytes());

        let ip = connect_request("10.0.0.5", 4443);
        assert_eq!(&ip[..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&ip[4..8], &[10, 0, 0, 5]);
        assert_eq!(&ip[8..], &4443u16.to_be_bytes());
    }
}
