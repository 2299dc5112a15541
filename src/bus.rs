use spidev::{SpiModeFlags, Spidev, SpidevOptions};
use std::io::{self, Read, Write};
use tracing::debug;

pub const SPI_CLOCK_HZ: u32 = 488_000;

/// Half-duplex, single-master transport to the coprocessor. A session spans
/// one `open` .. `close` pair; every transaction opens its own session.
pub trait SpiBus: Send {
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self);
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Reads up to `buf.len()` bytes and returns how many arrived.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Linux spidev character device, fixed clock, mode 1.
#[derive(Debug)]
pub struct SpidevBus {
    path: String,
    device: Option<Spidev>,
}

impl SpidevBus {
    pub fn new(bus: u8, device: u8) -> Self {
        Self {
            path: format!("/dev/spidev{}.{}", bus, device),
            device: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn device(&mut self) -> io::Result<&mut Spidev> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "SPI session not open"))
    }
}

impl SpiBus for SpidevBus {
    fn open(&mut self) -> io::Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let mut spi = Spidev::open(&self.path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(SPI_CLOCK_HZ)
            .mode(SpiModeFlags::SPI_MODE_1)
            .build();
        spi.configure(&options)?;

        debug!(path = %self.path, "SPI session opened");
        self.device = Some(spi);
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(path = %self.path, "SPI session closed");
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.device()?.write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let device = self.device()?;
        let mut filled = 0;
        while filled < buf.len() {
            match device.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }
}

/// Closes the bus session when dropped, on every exit path.
pub struct BusSession<'a, B: SpiBus + ?Sized> {
    bus: &'a mut B,
}

impl<'a, B: SpiBus + ?Sized> BusSession<'a, B> {
    pub fn open(bus: &'a mut B) -> io::Result<Self> {
        bus.open()?;
        Ok(Self { bus })
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bus.write(bytes)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bus.read(buf)
    }
}

impl<B: SpiBus + ?Sized> Drop for BusSession<'_, B> {
    fn drop(&mut self) {
        self.bus.close();
    }
}
