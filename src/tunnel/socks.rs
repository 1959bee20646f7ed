use crate::error::{AppError, AppResult};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent after the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn protocol_error(err: io::Error) -> AppError {
    AppError::Tunnel(format!("SOCKS5 handshake failed: {}", err))
}

/// Run method selection and read the CONNECT request.
///
/// Unsupported requests are answered with the matching reply code before the
/// error is returned; on success the caller must send the final reply.
pub async fn negotiate<S>(stream: &mut S) -> AppResult<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(protocol_error)?;
    if header[0] != SOCKS_VERSION {
        return Err(AppError::Tunnel(format!(
            "Unsupported SOCKS version {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await.map_err(protocol_error)?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await
            .map_err(protocol_error)?;
        return Err(AppError::Tunnel(
            "SOCKS client offered no supported auth method".to_string(),
        ));
    }
    stream
        .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
        .await
        .map_err(protocol_error)?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await.map_err(protocol_error)?;
    if request[0] != SOCKS_VERSION {
        return Err(AppError::Tunnel(format!(
            "Unsupported SOCKS version {}",
            request[0]
        )));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(AppError::Tunnel(format!(
            "Unsupported SOCKS command {}",
            request[1]
        )));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(protocol_error)?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await.map_err(protocol_error)?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await.map_err(protocol_error)?;
            String::from_utf8(name)
                .map_err(|_| AppError::Tunnel("SOCKS domain is not valid UTF-8".to_string()))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(protocol_error)?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(AppError::Tunnel(format!(
                "Unsupported SOCKS address type {}",
                other
            )));
        }
    };
    let port = stream.read_u16().await.map_err(protocol_error)?;

    Ok(Destination { host, port })
}

/// Send the request reply; the bound address is always reported as 0.0.0.0:0
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    let packet = [SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&packet).await.map_err(protocol_error)?;
    stream.flush().await.map_err(protocol_error)
}
