//! TCP transport for network-attached readers

use crate::transport::Transport;
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, std::io::Error> {
        self.stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "tcp stream not open"))
    }
}

fn timeout(timeout_ms: u32) -> Option<Duration> {
    // A zero duration is rejected by the socket options.
    Some(Duration::from_millis(timeout_ms.max(1) as u64))
}

impl Transport for TcpTransport {
    type Error = std::io::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::AddrNotAvailable, "no address for host"))?;
        debug!("Connecting to {}", addr);
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8], timeout_ms: u32) -> Result<(), Self::Error> {
        let stream = self.stream()?;
        stream.set_write_timeout(timeout(timeout_ms))?;
        stream.write_all(data)
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        let stream = self.stream()?;
        stream.set_read_timeout(timeout(timeout_ms))?;
        match stream.read(buf) {
            Ok(0) => Err(std::io::Error::new(ErrorKind::ConnectionAborted, "reader closed the connection")),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baud_rate(&mut self, _rate: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        drained
    }

    fn shutdown(&mut self) -> Result<(), Self::Error> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both)?;
        }
        Ok(())
    }
}
