//! UART transport for ESP32 using esp-idf-svc

use crate::transport::Transport;
use esp_idf_svc::hal::gpio::{self, InputPin, OutputPin};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::uart::{self, UartDriver};
use esp_idf_svc::hal::units::Hertz;
use std::time::Duration;

pub struct UartTransport<'a> {
    uart: UartDriver<'a>,
}

impl<'a> UartTransport<'a> {
    pub fn new(
        uart: impl Peripheral<P = impl uart::Uart> + 'a,
        tx: impl Peripheral<P = impl OutputPin> + 'a,
        rx: impl Peripheral<P = impl InputPin> + 'a,
        baud_rate: u32,
    ) -> Result<Self, esp_idf_svc::sys::EspError> {
        let config = uart::config::Config::default().baudrate(baud_rate.into());
        let uart = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<gpio::Gpio0>::None,
            Option::<gpio::Gpio0>::None,
            &config,
        )?;

        Ok(Self { uart })
    }
}

impl Transport for UartTransport<'_> {
    type Error = esp_idf_svc::sys::EspError;

    // The driver is live from `new`; opening only lets the module settle.
    fn open(&mut self) -> Result<(), Self::Error> {
        std::thread::sleep(Duration::from_millis(500));
        self.uart.clear_rx()
    }

    fn send_bytes(&mut self, data: &[u8], _timeout_ms: u32) -> Result<(), Self::Error> {
        let mut written = 0;
        while written < data.len() {
            written += self.uart.write(&data[written..])?;
        }
        Ok(())
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        self.uart.read(buf, timeout_ms)
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), Self::Error> {
        self.uart.change_baudrate(Hertz(rate)).map(|_| ())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart.clear_rx()
    }

    fn shutdown(&mut self) -> Result<(), Self::Error> {
        self.uart.clear_rx()
    }
}
