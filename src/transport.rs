/// Trait for reader communication backends.
/// Implement this trait for different transports (UART, serial port, TCP, etc.)
///
/// Every call takes its own timeout; there is no global one.
pub trait Transport {
    /// Error type for transport operations
    type Error: std::fmt::Debug;

    /// Open the underlying channel. Calling it on an open transport is a no-op.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Write all of `data` to the transport
    fn send_bytes(&mut self, data: &[u8], timeout_ms: u32) -> Result<(), Self::Error>;

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` when nothing arrived before the timeout.
    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;

    /// Change the line rate (no-op for network transports)
    fn set_baud_rate(&mut self, rate: u32) -> Result<(), Self::Error>;

    /// Discard anything buffered in either direction
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Close the channel
    fn shutdown(&mut self) -> Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    type Error = T::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        (**self).open()
    }

    fn send_bytes(&mut self, data: &[u8], timeout_ms: u32) -> Result<(), Self::Error> {
        (**self).send_bytes(data, timeout_ms)
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        (**self).receive_bytes(buf, timeout_ms)
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), Self::Error> {
        (**self).set_baud_rate(rate)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        (**self).flush()
    }

    fn shutdown(&mut self) -> Result<(), Self::Error> {
        (**self).shutdown()
    }
}

/// Transport object as produced by the URI registry.
pub type BoxedTransport = Box<dyn Transport<Error = std::io::Error> + Send>;
