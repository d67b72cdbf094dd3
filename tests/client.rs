//! Integration tests for the asynchronous client, driven through a
//! scripted in-memory transport.

use assert_matches::assert_matches;
use futures::StreamExt;
use hp3478a_lib::protocol as proto;
use hp3478a_lib::tokio_async_client::Hp3478a;
use hp3478a_lib::tokio_common::Error;
use hp3478a_lib::transport::Transport;
use hp3478a_lib::{calram, tokio_async_safe_client::SafeClient};
use std::collections::VecDeque;
use std::io;

/// Records every write and plays back scripted replies.
#[derive(Debug, Default)]
struct MockTransport {
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    spoll_replies: VecDeque<u8>,
    device_clears: usize,
    locals: usize,
    /// When set, reads never complete; used to exercise the timeout path.
    hang_on_read: bool,
}

impl MockTransport {
    fn with_replies<const N: usize>(replies: [&[u8]; N]) -> Self {
        Self {
            replies: replies.iter().map(|r| r.to_vec()).collect(),
            ..Self::default()
        }
    }
}

impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.written.push(data.to_vec());
        Ok(())
    }

    async fn read(&mut self, length: Option<usize>) -> io::Result<Vec<u8>> {
        if self.hang_on_read {
            std::future::pending::<()>().await;
        }
        let reply = self.replies.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted reply left")
        })?;
        if let Some(length) = length {
            assert_eq!(reply.len(), length, "scripted reply length mismatch");
        }
        Ok(reply)
    }

    async fn selected_device_clear(&mut self) -> io::Result<()> {
        self.device_clears += 1;
        Ok(())
    }

    async fn serial_poll(&mut self) -> io::Result<u8> {
        self.spoll_replies.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted poll reply left")
        })
    }

    async fn set_local(&mut self) -> io::Result<()> {
        self.locals += 1;
        Ok(())
    }
}

async fn connected_client(transport: MockTransport) -> Hp3478a<MockTransport> {
    let mut client = Hp3478a::new(transport);
    client.connect().await.expect("connect failed");
    client
}

/// Status reply: DCV, 30 V range, 5.5 digits, internal trigger with
/// auto-zero, no SRQs, no errors.
const STATUS_DCV_30V_5DIGITS: &[u8] = &[0x31, 0x05, 0x00, 0x00, 0x42];

#[tokio::test]
async fn connect_resets_and_applies_defaults() {
    let client = connected_client(MockTransport::default()).await;
    assert_eq!(client.transport_ref().device_clears, 1);
    let written = &client.transport_ref().written;
    assert_eq!(written, &[b"D1".to_vec(), b"M00".to_vec()]);
}

#[tokio::test]
async fn operations_fail_fast_when_not_connected() {
    let mut client = Hp3478a::new(MockTransport::default());
    assert_matches!(client.read().await, Err(Error::NotConnected));
    assert_matches!(
        client.set_function(proto::FunctionType::Dcv).await,
        Err(Error::NotConnected)
    );
    // Nothing must have reached the wire.
    assert!(client.transport_ref().written.is_empty());
}

#[tokio::test]
async fn read_decodes_a_measurement() {
    let transport = MockTransport::with_replies([b"+1.23456E+0\r\n"]);
    let mut client = connected_client(transport).await;
    let value = client.read().await.expect("read failed");
    assert_eq!(value, 1.23456);
}

#[tokio::test]
async fn read_reports_overload() {
    let transport = MockTransport::with_replies([b"+9.99999E+9\r\n"]);
    let mut client = connected_client(transport).await;
    assert_matches!(client.read().await, Err(Error::Overload));
}

#[tokio::test(start_paused = true)]
async fn read_times_out_when_the_instrument_stays_silent() {
    let transport = MockTransport {
        hang_on_read: true,
        ..MockTransport::default()
    };
    let mut client = connected_client(transport).await;
    assert_matches!(client.read().await, Err(Error::Timeout));
}

#[tokio::test]
async fn ntc_function_converts_resistance_to_temperature() {
    let transport = MockTransport::with_replies([b"+1.00000E+4\r\n"]);
    let mut client = connected_client(transport).await;
    client
        .set_function(proto::FunctionType::Ntc)
        .await
        .expect("set_function failed");
    // The pseudo-function selects 2-wire resistance on the wire.
    assert_eq!(client.transport_ref().written.last().unwrap(), b"F3");

    let temperature = client.read().await.expect("read failed");
    let expected = proto::NtcParameters::default()
        .temperature_from_resistance(10_000.0)
        .unwrap();
    assert!((temperature - expected).abs() < 1e-9);
    // 10 kOhm is the thermistor's resistance at 25 degrees C.
    assert!((temperature - 298.15).abs() < 0.5);
}

#[tokio::test]
async fn status_is_decoded_and_queried_with_b() {
    let transport = MockTransport::with_replies([STATUS_DCV_30V_5DIGITS]);
    let mut client = connected_client(transport).await;
    let status = client.get_status().await.expect("get_status failed");

    assert_eq!(client.transport_ref().written.last().unwrap(), b"B");
    assert_eq!(status.function, proto::FunctionType::Dcv);
    assert_eq!(status.range, proto::Range::Range30);
    assert_eq!(status.ndigits, 5);
    assert!(status.status.contains(proto::StatusFlags::AUTO_ZERO_ENABLED));
    assert!(!status.status.contains(proto::StatusFlags::CAL_RAM_ENABLED));
    assert_eq!(status.dac_value, 0x42);
}

#[tokio::test]
async fn status_reports_active_ntc_pseudo_function() {
    // Function field 4 is 4-wire resistance, the mode NTCF selects.
    let status_ohmf: &[u8] = &[0x95, 0x05, 0x00, 0x00, 0x00];
    let transport = MockTransport::with_replies([status_ohmf]);
    let mut client = connected_client(transport).await;
    client
        .set_function(proto::FunctionType::Ntcf)
        .await
        .expect("set_function failed");

    let status = client.get_status().await.expect("get_status failed");
    assert_eq!(status.function, proto::FunctionType::Ntcf);
}

#[tokio::test]
async fn read_all_paces_on_the_data_ready_srq() {
    let mut transport = MockTransport::with_replies([b"+1.00000E+0\r\n", b"+2.00000E+0\r\n"]);
    // First poll: service requested with data ready. Second poll: service
    // requested for another reason, which must end the stream with an error.
    transport.spoll_replies = VecDeque::from([0x41, 0x44]);
    let mut client = connected_client(transport).await;

    let (first, second) = {
        let stream = client.read_all();
        futures::pin_mut!(stream);
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        (first, second)
    };

    assert_matches!(first, Ok(value) if value == 1.0);
    assert_matches!(second, Err(Error::NotReady(_)));
    // The data-ready mask was set up before the first poll.
    assert!(client.transport_ref().written.contains(&b"M01".to_vec()));
}

#[tokio::test]
async fn set_cal_ram_is_refused_while_the_switch_protects_the_nvram() {
    // CAL_RAM_ENABLED (bit 5 of the status flags) is clear.
    let transport = MockTransport::with_replies([STATUS_DCV_30V_5DIGITS]);
    let mut client = connected_client(transport).await;

    let block = vec![0x40u8; calram::BLOCK_LENGTH];
    assert_matches!(
        client.set_cal_ram_raw(&block).await,
        Err(Error::CalRamProtected)
    );
    // The status query went out, but not a single calibration write.
    assert!(
        client
            .transport_ref()
            .written
            .iter()
            .all(|w| w.first() != Some(&b'X'))
    );
}

#[tokio::test]
async fn set_cal_ram_writes_every_address_when_unprotected() {
    // Same status, but with CAL_RAM_ENABLED set.
    let status: &[u8] = &[0x31, 0x25, 0x00, 0x00, 0x42];
    let transport = MockTransport::with_replies([status]);
    let mut client = connected_client(transport).await;

    let block = vec![0x40u8; calram::BLOCK_LENGTH];
    client
        .set_cal_ram_raw(&block)
        .await
        .expect("set_cal_ram_raw failed");

    let writes: Vec<_> = client
        .transport_ref()
        .written
        .iter()
        .filter(|w| w.first() == Some(&b'X'))
        .collect();
    assert_eq!(writes.len(), calram::BLOCK_LENGTH);
    assert_eq!(writes[0].as_slice(), &[b'X', 0, 0x40]);
    assert_eq!(writes[255].as_slice(), &[b'X', 255, 0x40]);
}

/// Answers every read with an empty buffer, violating the counted-read
/// contract the way a buggy adapter driver might.
#[derive(Debug)]
struct EmptyReplyTransport;

impl Transport for EmptyReplyTransport {
    async fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn read(&mut self, _length: Option<usize>) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn selected_device_clear(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn serial_poll(&mut self) -> io::Result<u8> {
        Ok(0)
    }

    async fn set_local(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn cal_dump_rejects_an_empty_reply_instead_of_panicking() {
    let mut client = Hp3478a::new(EmptyReplyTransport);
    client.connect().await.expect("connect failed");
    assert_matches!(
        client.get_cal_ram_raw().await,
        Err(Error::Protocol(proto::Error::ReplyLength {
            expected: 1,
            actual: 0
        }))
    );
}

#[tokio::test]
async fn get_cal_ram_reads_and_decodes_the_block() {
    // An all-zero-nibble block: switch enabled, every record checksum
    // 0xFF, stored big-endian in the trailing nibbles.
    let mut block = vec![0x40u8; calram::BLOCK_LENGTH];
    for entry in 0..calram::ENTRY_COUNT {
        let base = 1 + entry * 13;
        block[base + 11] = 0x4F;
        block[base + 12] = 0x4F;
    }
    let replies: Vec<Vec<u8>> = block.iter().map(|b| vec![*b]).collect();
    let mut transport = MockTransport::default();
    transport.replies = replies.into();
    let mut client = connected_client(transport).await;

    let memory = client.get_cal_ram().await.expect("get_cal_ram failed");
    assert!(memory.cal_enabled);
    assert_eq!(memory.entries.len(), calram::ENTRY_COUNT);
    for entry in &memory.entries {
        assert!(entry.is_valid);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.gain, 1.0);
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_to_local_and_is_idempotent() {
    let mut client = connected_client(MockTransport::default()).await;
    client.disconnect().await.expect("disconnect failed");
    client.disconnect().await.expect("second disconnect failed");
    assert_eq!(client.transport_ref().locals, 1);
    // Once disconnected, commands fail fast again.
    assert_matches!(client.read().await, Err(Error::NotConnected));
}

#[tokio::test]
async fn safe_client_serializes_access() {
    let transport = MockTransport::with_replies([b"+5.00000E+0\r\n"]);
    let mut inner = Hp3478a::new(transport);
    inner.connect().await.expect("connect failed");
    let client = SafeClient::new(inner);

    let clone = client.clone();
    let value = clone.read().await.expect("read failed");
    assert_eq!(value, 5.0);
    clone
        .set_trigger(proto::TriggerType::Internal)
        .await
        .expect("set_trigger failed");
}
