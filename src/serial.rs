//! Serial port transport for desktop using serialport crate

use crate::transport::Transport;
use std::io::{Read, Write};
use std::time::Duration;

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Describe a serial port. Nothing is opened until [`Transport::open`].
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            port: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, std::io::Error> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "serial port not open"))
    }
}

impl Transport for SerialTransport {
    type Error = std::io::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(std::io::Error::other)?;
        std::thread::sleep(Duration::from_millis(500));
        port.clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::other)?;
        self.port = Some(port);
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8], timeout_ms: u32) -> Result<(), Self::Error> {
        let port = self.port()?;
        port.set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(std::io::Error::other)?;
        port.write_all(data)
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        let port = self.port()?;
        port.set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(std::io::Error::other)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), Self::Error> {
        self.baud_rate = rate;
        match self.port.as_mut() {
            Some(port) => port.set_baud_rate(rate).map_err(std::io::Error::other),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.port()?
            .clear(serialport::ClearBuffer::All)
            .map_err(std::io::Error::other)
    }

    fn shutdown(&mut self) -> Result<(), Self::Error> {
        self.port = None;
        Ok(())
    }
}
