//! CCID bulk message framing.
//!
//! Every exchange with the reader is a 10-byte header followed by a payload:
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Message type (0x6F = XfrBlock, 0x80 = DataBlock)
//! 1       4     Payload length (little-endian)
//! 5       1     Slot number (always 0)
//! 6       1     Sequence number
//! 7       3     Type-specific parameters (bStatus, bError, ... on replies)
//! 10      N     Payload
//! ```
//!
//! The framer knows nothing about USB itself; it drives any [`BulkPipe`].

use crate::adapters::transport::{Transport, TransportKind};
use crate::domain::constants::{
    ccid_message, CCID_COMMAND_STATUS_MASK, CCID_DEFAULT_TIME_EXTENSION_MS, CCID_HEADER_SIZE,
    CCID_SLOT, CCID_STATUS_FAILED, CCID_STATUS_TIME_EXTENSION,
};
use crate::infra::error::{OathError, OathResult};
use std::time::{Duration, Instant};

/// A pair of bulk endpoints moving whole USB packets.
pub trait BulkPipe: Send {
    /// Largest packet either endpoint accepts.
    fn max_packet_size(&self) -> usize;

    /// Write one packet (possibly empty) to the bulk-OUT endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] when the write fails or times out.
    fn write_packet(&mut self, packet: &[u8]) -> OathResult<usize>;

    /// Read one packet from the bulk-IN endpoint, returning its length.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] when the read fails or times out.
    fn read_packet(&mut self, buf: &mut [u8]) -> OathResult<usize>;
}

/// Decoded reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplyHeader {
    message_type: u8,
    length: usize,
    slot: u8,
    sequence: u8,
    status: u8,
    error: u8,
}

impl ReplyHeader {
    fn parse(packet: &[u8]) -> OathResult<Self> {
        if packet.len() < CCID_HEADER_SIZE {
            return Err(OathError::Transport(format!(
                "CCID reply too short: {} bytes",
                packet.len()
            )));
        }
        Ok(Self {
            message_type: packet[0],
            length: u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]) as usize,
            slot: packet[5],
            sequence: packet[6],
            status: packet[7],
            error: packet[8],
        })
    }

    fn command_status(&self) -> u8 {
        self.status & CCID_COMMAND_STATUS_MASK
    }

    fn is_time_extension(&self) -> bool {
        self.command_status() == CCID_STATUS_TIME_EXTENSION
    }
}

/// CCID message framer owning a bulk pipe and the running sequence counter.
pub struct CcidFramer<P: BulkPipe> {
    pipe: P,
    sequence: u8,
    read_retries: usize,
    time_extension_budget: Duration,
    atr: Vec<u8>,
    powered: bool,
    closed: bool,
}

impl<P: BulkPipe> CcidFramer<P> {
    /// Wrap `pipe`. Stale replies are skipped at most `read_retries` times
    /// per transaction.
    pub fn new(pipe: P, read_retries: usize) -> Self {
        Self {
            pipe,
            sequence: 0,
            read_retries,
            time_extension_budget: Duration::from_millis(CCID_DEFAULT_TIME_EXTENSION_MS),
            atr: Vec::new(),
            powered: false,
            closed: false,
        }
    }

    /// Limit how long the card may keep answering with time extensions.
    #[must_use]
    pub fn with_time_extension_budget(mut self, budget: Duration) -> Self {
        self.time_extension_budget = budget;
        self
    }

    /// Power the ICC and keep its Answer-To-Reset.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] if the reader does not answer with a
    /// data block.
    pub fn power_on(&mut self) -> OathResult<Vec<u8>> {
        self.ensure_open()?;
        let atr = self.transaction(
            ccid_message::PC_TO_RDR_ICC_POWER_ON,
            &[],
            ccid_message::RDR_TO_PC_DATA_BLOCK,
        )?;
        log::debug!("ICC powered on, ATR: {}", hex::encode(&atr));
        self.atr.clone_from(&atr);
        self.powered = true;
        Ok(atr)
    }

    /// Answer-To-Reset from the last power on.
    #[must_use]
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Current sequence byte, used by the next transaction.
    #[must_use]
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send an APDU inside a `PC_to_RDR_XfrBlock` and return the reply data.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] on pipe failures, framing errors or
    /// reader-reported errors, or when the framer is closed.
    pub fn transmit(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        self.ensure_open()?;
        self.transaction(
            ccid_message::PC_TO_RDR_XFR_BLOCK,
            apdu,
            ccid_message::RDR_TO_PC_DATA_BLOCK,
        )
    }

    /// Power the ICC off.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] if the reader does not acknowledge.
    pub fn power_off(&mut self) -> OathResult<()> {
        self.ensure_open()?;
        self.transaction(
            ccid_message::PC_TO_RDR_ICC_POWER_OFF,
            &[],
            ccid_message::RDR_TO_PC_SLOT_STATUS,
        )?;
        self.powered = false;
        log::debug!("ICC powered off");
        Ok(())
    }

    /// Power off if needed and refuse further traffic.
    ///
    /// # Errors
    ///
    /// Returns the power-off failure; the framer is closed either way.
    pub fn shutdown(&mut self) -> OathResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.powered {
            self.power_off()
        } else {
            Ok(())
        };
        self.closed = true;
        result
    }

    fn ensure_open(&self) -> OathResult<()> {
        if self.closed {
            return Err(OathError::Transport("CCID channel is closed".to_string()));
        }
        Ok(())
    }

    fn transaction(&mut self, message_type: u8, payload: &[u8], expected: u8) -> OathResult<Vec<u8>> {
        let sequence = self.sequence;
        let message = encode_message(message_type, sequence, payload)?;
        log::trace!("CCID TX: {}", hex::encode(&message));
        let result = self
            .write_message(&message)
            .and_then(|()| self.read_reply(sequence, expected));
        self.sequence = self.sequence.wrapping_add(1);
        result
    }

    fn write_message(&mut self, message: &[u8]) -> OathResult<()> {
        let packet_size = self.packet_size()?;
        for chunk in message.chunks(packet_size) {
            self.write_packet(chunk)?;
        }
        if message.len() % packet_size == 0 {
            // The reader only sees the end of a transfer on a short packet.
            self.write_packet(&[])?;
        }
        Ok(())
    }

    fn write_packet(&mut self, packet: &[u8]) -> OathResult<()> {
        let written = self.pipe.write_packet(packet)?;
        if written != packet.len() {
            return Err(OathError::Transport(format!(
                "Incomplete USB write: {written}/{} bytes",
                packet.len()
            )));
        }
        Ok(())
    }

    fn read_reply(&mut self, sequence: u8, expected: u8) -> OathResult<Vec<u8>> {
        let packet_size = self.packet_size()?;
        let mut buf = vec![0u8; packet_size];
        let mut stale = 0usize;
        let mut extension_start: Option<Instant> = None;

        let (read, header) = loop {
            let read = self.pipe.read_packet(&mut buf)?;
            let header = ReplyHeader::parse(&buf[..read])?;
            if header.slot != CCID_SLOT
                || header.sequence != sequence
                || header.message_type != expected
            {
                if read == packet_size {
                    self.drain_message(&mut buf)?;
                }
                stale += 1;
                log::warn!(
                    "Ignoring CCID reply type=0x{:02x} slot={} seq={} (expected seq {sequence})",
                    header.message_type,
                    header.slot,
                    header.sequence
                );
                if stale > self.read_retries {
                    return Err(OathError::Transport(format!(
                        "No CCID reply for sequence {sequence} after {stale} messages"
                    )));
                }
                continue;
            }
            if header.is_time_extension() {
                let started = *extension_start.get_or_insert_with(Instant::now);
                if started.elapsed() >= self.time_extension_budget {
                    return Err(OathError::Transport(format!(
                        "Card kept requesting time extensions for more than {} ms",
                        self.time_extension_budget.as_millis()
                    )));
                }
                log::debug!("CCID time extension requested (seq {sequence})");
                continue;
            }
            break (read, header);
        };

        if header.command_status() == CCID_STATUS_FAILED
            || (expected == ccid_message::RDR_TO_PC_DATA_BLOCK
                && (header.status != 0 || header.error != 0))
        {
            return Err(OathError::Transport(format!(
                "CCID error: status=0x{:02x} error=0x{:02x}",
                header.status, header.error
            )));
        }

        let mut data = buf[CCID_HEADER_SIZE..read].to_vec();
        let mut last = read;
        while last == packet_size {
            last = self.pipe.read_packet(&mut buf)?;
            data.extend_from_slice(&buf[..last]);
        }
        log::trace!("CCID RX: {}", hex::encode(&data));

        if data.len() < header.length {
            return Err(OathError::Transport(format!(
                "CCID reply truncated: expected {} bytes, got {}",
                header.length,
                data.len()
            )));
        }
        data.truncate(header.length);
        Ok(data)
    }

    /// Discard the rest of a multi-packet message up to its short packet.
    fn drain_message(&mut self, buf: &mut [u8]) -> OathResult<()> {
        while self.pipe.read_packet(buf)? == buf.len() {}
        Ok(())
    }

    fn packet_size(&self) -> OathResult<usize> {
        match self.pipe.max_packet_size() {
            0 => Err(OathError::Transport(
                "Bulk endpoint reports zero packet size".to_string(),
            )),
            size if size < CCID_HEADER_SIZE => Err(OathError::Transport(format!(
                "Bulk packet size {size} cannot hold a CCID header"
            ))),
            size => Ok(size),
        }
    }
}

impl<P: BulkPipe> Transport for CcidFramer<P> {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        self.transmit(apdu)
    }

    fn close(&mut self) -> OathResult<()> {
        self.shutdown()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}

impl<P: BulkPipe> Drop for CcidFramer<P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Failed to power off ICC: {e}");
        }
    }
}

/// Build a host-to-reader message with the given sequence number.
fn encode_message(message_type: u8, sequence: u8, payload: &[u8]) -> OathResult<Vec<u8>> {
    let length = u32::try_from(payload.len()).map_err(|_| OathError::ValueTooLarge(payload.len()))?;
    let mut message = Vec::with_capacity(CCID_HEADER_SIZE + payload.len());
    message.push(message_type);
    message.extend_from_slice(&length.to_le_bytes());
    message.push(CCID_SLOT);
    message.push(sequence);
    message.extend_from_slice(&[0, 0, 0]);
    message.extend_from_slice(payload);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct PipeState {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    #[derive(Clone)]
    struct MockPipe {
        packet_size: usize,
        state: Arc<Mutex<PipeState>>,
    }

    impl MockPipe {
        fn new(packet_size: usize) -> Self {
            Self {
                packet_size,
                state: Arc::new(Mutex::new(PipeState::default())),
            }
        }

        fn queue(&self, packet: Vec<u8>) {
            self.state.lock().unwrap().replies.push_back(packet);
        }

        /// Queue a reply message split into packets the way a reader sends it.
        fn queue_message(&self, message: &[u8]) {
            for chunk in message.chunks(self.packet_size) {
                self.queue(chunk.to_vec());
            }
            if message.len() % self.packet_size == 0 {
                self.queue(Vec::new());
            }
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }
    }

    impl BulkPipe for MockPipe {
        fn max_packet_size(&self) -> usize {
            self.packet_size
        }

        fn write_packet(&mut self, packet: &[u8]) -> OathResult<usize> {
            self.state.lock().unwrap().written.push(packet.to_vec());
            Ok(packet.len())
        }

        fn read_packet(&mut self, buf: &mut [u8]) -> OathResult<usize> {
            let packet = self
                .state
                .lock()
                .unwrap()
                .replies
                .pop_front()
                .ok_or_else(|| OathError::Transport("read timed out".to_string()))?;
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }
    }

    fn reply(message_type: u8, sequence: u8, status: u8, error: u8, payload: &[u8]) -> Vec<u8> {
        let mut message = vec![message_type];
        message.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        message.extend_from_slice(&[0, sequence, status, error, 0]);
        message.extend_from_slice(payload);
        message
    }

    fn data_block(sequence: u8, payload: &[u8]) -> Vec<u8> {
        reply(ccid_message::RDR_TO_PC_DATA_BLOCK, sequence, 0, 0, payload)
    }

    #[test]
    fn test_power_on_reads_atr() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(0, &[0x3B, 0xFD, 0x13]));
        let mut framer = CcidFramer::new(pipe.clone(), 5);

        let atr = framer.power_on().unwrap();
        assert_eq!(atr, vec![0x3B, 0xFD, 0x13]);
        assert_eq!(framer.atr(), &[0x3B, 0xFD, 0x13]);
        assert_eq!(
            pipe.written()[0],
            vec![ccid_message::PC_TO_RDR_ICC_POWER_ON, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(framer.sequence(), 1);
    }

    #[test]
    fn test_xfr_block_header_and_sequence() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(0, &[0x90, 0x00]));
        pipe.queue(data_block(1, &[0x6A, 0x82]));
        let mut framer = CcidFramer::new(pipe.clone(), 5);

        assert_eq!(framer.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap(), vec![0x90, 0x00]);
        assert_eq!(framer.transmit(&[0x00, 0xA1, 0x00, 0x00]).unwrap(), vec![0x6A, 0x82]);

        let written = pipe.written();
        assert_eq!(
            written[0],
            vec![0x6F, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0xA4, 0x04, 0x00]
        );
        assert_eq!(written[1][6], 1);
    }

    #[test]
    fn test_sequence_wraps() {
        let pipe = MockPipe::new(64);
        let mut framer = CcidFramer::new(pipe.clone(), 5);
        for sequence in 0..=256u32 {
            pipe.queue(data_block(sequence as u8, &[0x90, 0x00]));
            framer.transmit(&[0x00]).unwrap();
        }
        assert_eq!(framer.sequence(), 1);
    }

    #[test]
    fn test_empty_packet_at_packet_size_multiples() {
        let packet_size = 64;
        for (apdu_len, expected) in [
            (53usize, vec![63usize]),
            (54, vec![64, 0]),
            (55, vec![64, 1]),
            (118, vec![64, 64, 0]),
            (119, vec![64, 64, 1]),
        ] {
            let pipe = MockPipe::new(packet_size);
            pipe.queue(data_block(0, &[0x90, 0x00]));
            let mut framer = CcidFramer::new(pipe.clone(), 5);
            framer.transmit(&vec![0xAB; apdu_len]).unwrap();

            let sizes: Vec<usize> = pipe.written().iter().map(Vec::len).collect();
            assert_eq!(sizes, expected, "APDU of {apdu_len} bytes");
        }
    }

    #[test]
    fn test_multi_packet_reply() {
        let pipe = MockPipe::new(64);
        let payload: Vec<u8> = (0..100u8).collect();
        pipe.queue_message(&data_block(0, &payload));
        let mut framer = CcidFramer::new(pipe, 5);
        assert_eq!(framer.transmit(&[0x00]).unwrap(), payload);
    }

    #[test]
    fn test_reply_filling_whole_packets() {
        let pipe = MockPipe::new(64);
        let payload = vec![0x5A; 118];
        pipe.queue_message(&data_block(0, &payload));
        let mut framer = CcidFramer::new(pipe, 5);
        assert_eq!(framer.transmit(&[0x00]).unwrap(), payload);
    }

    #[test]
    fn test_stale_sequence_is_skipped() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(7, &[0xDE, 0xAD]));
        pipe.queue(data_block(9, &[0xBE, 0xEF]));
        pipe.queue(data_block(0, &[0x90, 0x00]));
        let mut framer = CcidFramer::new(pipe, 5);
        assert_eq!(framer.transmit(&[0x00]).unwrap(), vec![0x90, 0x00]);
    }

    #[test]
    fn test_sequence_mismatch_exhausts_retries() {
        let pipe = MockPipe::new(64);
        for _ in 0..3 {
            pipe.queue(data_block(42, &[0x90, 0x00]));
        }
        pipe.queue(data_block(0, &[0x90, 0x00]));
        let mut framer = CcidFramer::new(pipe, 2);

        let err = framer.transmit(&[0x00]).unwrap_err();
        assert!(matches!(err, OathError::Transport(_)));
        assert_eq!(framer.sequence(), 1);
    }

    #[test]
    fn test_time_extension_does_not_use_retries() {
        let pipe = MockPipe::new(64);
        for _ in 0..4 {
            pipe.queue(reply(ccid_message::RDR_TO_PC_DATA_BLOCK, 0, 0x80, 0x01, &[]));
        }
        pipe.queue(data_block(0, &[0x90, 0x00]));
        let mut framer = CcidFramer::new(pipe, 0);
        assert_eq!(framer.transmit(&[0x00]).unwrap(), vec![0x90, 0x00]);
    }

    #[test]
    fn test_reader_error_is_transport_error() {
        let pipe = MockPipe::new(64);
        pipe.queue(reply(ccid_message::RDR_TO_PC_DATA_BLOCK, 0, 0x42, 0xFE, &[]));
        let mut framer = CcidFramer::new(pipe, 5);
        let err = framer.transmit(&[0x00]).unwrap_err();
        match err {
            OathError::Transport(message) => {
                assert!(message.contains("0x42"));
                assert!(message.contains("0xfe"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_short_and_missing_replies() {
        let pipe = MockPipe::new(64);
        pipe.queue(vec![0x80, 0x02, 0x00]);
        let mut framer = CcidFramer::new(pipe, 5);
        assert!(matches!(framer.transmit(&[0x00]), Err(OathError::Transport(_))));
        assert!(matches!(framer.transmit(&[0x00]), Err(OathError::Transport(_))));
    }

    #[test]
    fn test_close_powers_off_once() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(0, &[0x3B]));
        pipe.queue(reply(ccid_message::RDR_TO_PC_SLOT_STATUS, 1, 0, 0, &[]));
        let mut framer = CcidFramer::new(pipe.clone(), 5);
        framer.power_on().unwrap();

        Transport::close(&mut framer).unwrap();
        Transport::close(&mut framer).unwrap();
        assert!(framer.is_closed());

        let written = pipe.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1][0], ccid_message::PC_TO_RDR_ICC_POWER_OFF);
        assert!(matches!(
            framer.transmit(&[0x00]),
            Err(OathError::Transport(_))
        ));
        assert_eq!(pipe.written().len(), 2);
    }

    #[test]
    fn test_power_off_accepts_inactive_icc_status() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(0, &[0x3B]));
        // bmICCStatus = 1: ICC present and inactive after power off.
        pipe.queue(reply(ccid_message::RDR_TO_PC_SLOT_STATUS, 1, 0x01, 0, &[]));
        let mut framer = CcidFramer::new(pipe, 5);
        framer.power_on().unwrap();

        framer.shutdown().unwrap();
        assert!(framer.is_closed());
    }

    #[test]
    fn test_failed_power_off_is_reported() {
        let pipe = MockPipe::new(64);
        pipe.queue(data_block(0, &[0x3B]));
        pipe.queue(reply(ccid_message::RDR_TO_PC_SLOT_STATUS, 1, 0x41, 0xFB, &[]));
        let mut framer = CcidFramer::new(pipe, 5);
        framer.power_on().unwrap();

        assert!(matches!(framer.shutdown(), Err(OathError::Transport(_))));
        assert!(framer.is_closed());
    }

    #[test]
    fn test_stale_multi_packet_reply_is_drained() {
        let pipe = MockPipe::new(64);
        pipe.queue_message(&data_block(7, &[0xEE; 100]));
        pipe.queue_message(&data_block(8, &[0xEE; 54]));
        pipe.queue(data_block(0, &[0x90, 0x00]));
        let mut framer = CcidFramer::new(pipe, 2);
        assert_eq!(framer.transmit(&[0x00]).unwrap(), vec![0x90, 0x00]);
    }

    #[test]
    fn test_time_extension_budget_is_enforced() {
        let pipe = MockPipe::new(64);
        for _ in 0..3 {
            pipe.queue(reply(ccid_message::RDR_TO_PC_DATA_BLOCK, 0, 0x80, 0x01, &[]));
        }
        pipe.queue(data_block(0, &[0x90, 0x00]));
        let mut framer = CcidFramer::new(pipe, 5).with_time_extension_budget(Duration::ZERO);

        let err = framer.transmit(&[0x00]).unwrap_err();
        assert!(matches!(err, OathError::Transport(ref message) if message.contains("time extension")));
        assert_eq!(framer.sequence(), 1);
    }
}
