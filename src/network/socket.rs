//! Low-level TCP socket handling
//!
//! Every channel listener is created through socket2 so buffer sizes and
//! address reuse come from [`NetworkConfig`].

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Create a non-blocking listener on `config.bind_address:port`
pub fn create_listener(config: &NetworkConfig, port: u16) -> Result<TcpListener, NetworkError> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, port)
        .parse()
        .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    socket
        .listen(128)
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let listener: TcpListener = socket.into();
    listener
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(listener)
}

fn configure_socket(socket: &Socket, config: &NetworkConfig) -> Result<(), NetworkError> {
    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    // Accepted streams inherit these on most platforms
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

/// Dial a remote channel with a bounded connect timeout
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| NetworkError::ConnectFailed(format!("{}: {}", addr, e)))?;
    prepare_stream(&stream)?;
    Ok(stream)
}

/// Put an accepted or dialed stream into the mode every channel expects
pub fn prepare_stream(stream: &TcpStream) -> Result<(), NetworkError> {
    stream
        .set_nonblocking(false)
        .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
    stream
        .set_nodelay(true)
        .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
    Ok(())
}
