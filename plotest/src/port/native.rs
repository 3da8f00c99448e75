//! Serial line transport for physical boards.
//!
//! The console of a board is an 8N1 line without flow control. Boards with a
//! USB CDC console drop off the bus while they reset, so [`NativePort`] can be
//! reopened: it waits for the device node to come back and opens it again
//! with the same settings.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType},
    std::{
        io::{self, Read, Write},
        thread,
        time::{Duration, Instant},
    },
};

/// How long [`NativePort::reopen`] waits for the device to reappear.
pub const REOPEN_TIMEOUT: Duration = Duration::from_secs(10);

const REOPEN_POLL: Duration = Duration::from_millis(200);

/// Console of a physical board.
pub struct NativePort {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    reopen_timeout: Duration,
}

fn open_line(config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(&config.port_name, config.baud_rate)
        .timeout(config.timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()?;
    Ok(port)
}

impl NativePort {
    /// Open the console described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);
        Ok(Self {
            port: Some(open_line(config)?),
            config: config.clone(),
            reopen_timeout: REOPEN_TIMEOUT,
        })
    }

    /// Bound the wait for the device node in [`Port::reopen`].
    #[must_use]
    pub fn with_reopen_timeout(mut self, timeout: Duration) -> Self {
        self.reopen_timeout = timeout;
        self
    }

    fn line(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout == self.config.timeout {
            return Ok(());
        }
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        self.config.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        trace!("Clearing buffers of {}", self.config.port_name);
        if let Some(port) = self.port.as_mut() {
            port.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn reopen(&mut self) -> Result<()> {
        self.port = None;
        let start = Instant::now();
        loop {
            match open_line(&self.config) {
                Ok(port) => {
                    debug!(
                        "Reopened {} after {:?}",
                        self.config.port_name,
                        start.elapsed()
                    );
                    self.port = Some(port);
                    return Ok(());
                },
                Err(e) if start.elapsed() >= self.reopen_timeout => {
                    debug!(
                        "{} did not come back within {:?}",
                        self.config.port_name, self.reopen_timeout
                    );
                    return Err(e);
                },
                Err(e) => {
                    trace!("{} not back yet: {e}", self.config.port_name);
                    thread::sleep(REOPEN_POLL);
                },
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.line()?
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line()?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.line()?
            .flush()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self {
            name: info.port_name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Lists the host's serial ports.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let mut ports: Vec<PortInfo> = serialport::available_ports()
            .map_err(Error::Serial)?
            .into_iter()
            .map(PortInfo::from)
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }
}
