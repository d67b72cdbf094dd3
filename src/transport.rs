//! The byte-stream transport the device client talks through.
//!
//! The client only depends on the [`Transport`] trait: raw writes, counted
//! or line-terminated reads, and the three GPIB bus services the adapter
//! provides (selected device clear, serial poll, return-to-local). Socket
//! handling, addressing and escape sequencing are the adapter driver's
//! business.
//!
//! [`PrologixTransport`] is the bundled driver for the Prologix
//! GPIB-Ethernet controller, which multiplexes adapter commands (lines
//! starting with `++`) and instrument data over one TCP connection.

use log::{debug, trace};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};

/// A GPIB connection to a single instrument.
///
/// Implementations must deliver writes unmodified and must not reorder or
/// merge replies: the instrument has no request correlation, replies are
/// matched to commands purely by send order.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Writes raw bytes to the instrument.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads a reply. `Some(n)` reads exactly `n` bytes (for the
    /// unterminated binary replies); `None` reads one line up to and
    /// including the `\n` terminator.
    async fn read(&mut self, length: Option<usize>) -> io::Result<Vec<u8>>;

    /// Issues the Selected Device Clear bus event.
    async fn selected_device_clear(&mut self) -> io::Result<()>;

    /// Serial-polls the instrument and returns the raw status byte.
    async fn serial_poll(&mut self) -> io::Result<u8>;

    /// Returns the instrument to local (front panel) control.
    async fn set_local(&mut self) -> io::Result<()>;
}

/// The escape character of the Prologix data channel.
const ESC: u8 = 0x1B;

/// Driver for the Prologix GPIB-Ethernet controller.
#[derive(Debug)]
pub struct PrologixTransport {
    stream: BufReader<TcpStream>,
}

impl PrologixTransport {
    /// Connects to the adapter and configures it for a single instrument
    /// at the given primary address: controller mode, no read-after-write,
    /// EOI asserted on write, no termination appended to instrument data.
    pub async fn connect(addr: impl ToSocketAddrs, pad: u8) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut transport = Self {
            stream: BufReader::new(stream),
        };
        transport.adapter_command(b"++mode 1").await?;
        transport.adapter_command(b"++auto 0").await?;
        transport.adapter_command(b"++eoi 1").await?;
        transport.adapter_command(b"++eos 3").await?;
        transport
            .adapter_command(format!("++addr {pad}").as_bytes())
            .await?;
        debug!("connected to Prologix adapter, instrument address {pad}");
        Ok(transport)
    }

    /// Sends a `++` command to the adapter itself. No escaping applies.
    async fn adapter_command(&mut self, command: &[u8]) -> io::Result<()> {
        trace!("adapter command: {}", String::from_utf8_lossy(command));
        self.stream.write_all(command).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await
    }

    /// Reads one `\n`-terminated reply line from the adapter.
    async fn adapter_reply(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = self.stream.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(line)
    }
}

/// CR, LF, ESC and '+' are special on the data channel and must be escaped
/// so the adapter forwards them verbatim. The terminating newline hands the
/// buffered data to the instrument.
fn escape_data(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len() + 1);
    for &byte in data {
        if matches!(byte, b'\r' | b'\n' | b'+' | ESC) {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped.push(b'\n');
    escaped
}

impl Transport for PrologixTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        trace!("write: {data:02x?}");
        self.stream.write_all(&escape_data(data)).await?;
        self.stream.flush().await
    }

    async fn read(&mut self, length: Option<usize>) -> io::Result<Vec<u8>> {
        // With read-after-write disabled the adapter only addresses the
        // instrument to talk when asked to.
        self.adapter_command(b"++read eoi").await?;
        let reply = match length {
            Some(length) => {
                let mut buffer = vec![0u8; length];
                self.stream.read_exact(&mut buffer).await?;
                buffer
            }
            None => self.adapter_reply().await?,
        };
        trace!("read: {reply:02x?}");
        Ok(reply)
    }

    async fn selected_device_clear(&mut self) -> io::Result<()> {
        self.adapter_command(b"++clr").await
    }

    async fn serial_poll(&mut self) -> io::Result<u8> {
        self.adapter_command(b"++spoll").await?;
        let reply = self.adapter_reply().await?;
        std::str::from_utf8(&reply)
            .ok()
            .and_then(|text| text.trim().parse::<u8>().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid serial poll reply: {reply:?}"),
                )
            })
    }

    async fn set_local(&mut self) -> io::Result<()> {
        self.adapter_command(b"++loc").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_data_is_only_terminated() {
        assert_eq!(escape_data(b"F1"), b"F1\n");
        assert_eq!(escape_data(&[b'W', 0x42]), [b'W', 0x42, b'\n']);
    }

    #[test]
    fn special_bytes_are_escaped() {
        // A calibration write can legitimately contain any byte value.
        assert_eq!(
            escape_data(&[b'X', b'\n', b'+']),
            [b'X', ESC, b'\n', ESC, b'+', b'\n']
        );
        assert_eq!(escape_data(&[ESC]), [ESC, ESC, b'\n']);
        assert_eq!(escape_data(&[b'\r']), [ESC, b'\r', b'\n']);
    }
}
