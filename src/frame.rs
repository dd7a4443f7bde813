//! Self-delimiting frame parser: turns a byte stream from a single
//! connection into a sequence of complete [`Message`] values, resynchronising
//! after corruption using a 4-byte all-zero start-of-message sentinel.

use crate::codec::{self, Cursor, FloatWidth};
use crate::error::DecodeError;

pub const SOM: [u8; 4] = [0, 0, 0, 0];
pub const MIN_HEADER_LEN: usize = 17;

/// Wire-level message type discriminant, per the egress/ingress table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ProcessInit,
    ProcessShutdown,
    RequestInit,
    RequestShutdown,
    TraceExport,
    MeasureCreate,
    ViewReportingPeriod,
    ViewRegister,
    ViewUnregister,
    StatsRecord,
    Unknown(u8),
}

impl MessageType {
    pub fn from_wire(tag: u8) -> Self {
        match tag {
            1 => MessageType::ProcessInit,
            2 => MessageType::ProcessShutdown,
            3 => MessageType::RequestInit,
            4 => MessageType::RequestShutdown,
            20 => MessageType::TraceExport,
            40 => MessageType::MeasureCreate,
            41 => MessageType::ViewReportingPeriod,
            42 => MessageType::ViewRegister,
            43 => MessageType::ViewUnregister,
            44 => MessageType::StatsRecord,
            other => MessageType::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageType::ProcessInit => "ProcessInit",
            MessageType::ProcessShutdown => "ProcessShutdown",
            MessageType::RequestInit => "RequestInit",
            MessageType::RequestShutdown => "RequestShutdown",
            MessageType::TraceExport => "TraceExport",
            MessageType::MeasureCreate => "MeasureCreate",
            MessageType::ViewReportingPeriod => "ViewReportingPeriod",
            MessageType::ViewRegister => "ViewRegister",
            MessageType::ViewUnregister => "ViewUnregister",
            MessageType::StatsRecord => "StatsRecord",
            MessageType::Unknown(_) => "Unknown",
        }
    }
}

/// A fully decoded frame header plus its raw payload bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub seq: u64,
    pub pid: u64,
    pub tid: u64,
    pub start_time: f64,
    pub payload: Vec<u8>,
    /// Stamped by the parser the instant the payload finishes accumulating.
    pub receive_time: std::time::Instant,
    /// The connection's sniffed float width, carried along so payload
    /// decoders downstream don't need to re-derive it.
    pub float_width: FloatWidth,
}

/// Events produced by one call to [`FrameParser::feed`]. The parser itself
/// never logs; the connection handler owns turning these into log lines with
/// peer context attached.
#[derive(Debug)]
pub enum ParseEvent {
    Delivered(Message),
    LingeringData,
    FrameDropped { reason: String },
    DecodeError { reason: String },
}

#[derive(Debug)]
struct PartialHeader {
    msg_type: MessageType,
    seq: u64,
    pid: u64,
    tid: u64,
    start_time: f64,
    payload_len: usize,
}

#[derive(Debug)]
struct PartialMessage {
    header: PartialHeader,
    payload: Vec<u8>,
}

#[derive(Debug)]
enum State {
    Idle,
    Body(PartialMessage),
}

/// Per-connection frame parser. Owns an accumulation buffer and the
/// connection's sniffed float width, which is resolved once and then sticky.
pub struct FrameParser {
    buf: Vec<u8>,
    state: State,
    float_width: FloatWidth,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            state: State::Idle,
            float_width: FloatWidth::Unknown,
        }
    }

    pub fn float_width(&self) -> FloatWidth {
        self.float_width
    }

    /// Feed newly-read bytes from the socket and drain as many events as the
    /// accumulated buffer now supports. May be called with chunks of any
    /// size and any split point; repeated calls with an arbitrary
    /// re-chunking of the same overall stream yield the same events.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();

        let restart_mid_body = matches!(self.state, State::Body(_))
            && data.len() >= 4
            && data[0..4] == SOM;

        if restart_mid_body {
            self.state = State::Idle;
            events.push(ParseEvent::FrameDropped {
                reason: "new SOM observed while payload still incomplete".to_string(),
            });
            self.buf.extend_from_slice(data);
        } else if let State::Body(partial) = &mut self.state {
            let need = partial.header.payload_len - partial.payload.len();
            let take = need.min(data.len());
            partial.payload.extend_from_slice(&data[..take]);
            self.buf.extend_from_slice(&data[take..]);
            if partial.payload.len() == partial.header.payload_len {
                let partial = match std::mem::replace(&mut self.state, State::Idle) {
                    State::Body(p) => p,
                    State::Idle => unreachable!(),
                };
                events.push(ParseEvent::Delivered(finish_message(partial, self.float_width)));
            }
        } else {
            self.buf.extend_from_slice(data);
        }

        self.drain_idle(&mut events);
        events
    }

    fn drain_idle(&mut self, events: &mut Vec<ParseEvent>) {
        loop {
            if !matches!(self.state, State::Idle) {
                return;
            }

            if self.buf.len() < MIN_HEADER_LEN {
                return;
            }

            if &self.buf[0..4] != SOM {
                let consumed = self.resync(events);
                if consumed == 0 {
                    return;
                }
                continue;
            }

            match self.decode_header(&self.buf[4..]) {
                Ok((header, header_len, width)) => {
                    self.commit_float_width(width);
                    let total_header = 4 + header_len;
                    let mut partial = PartialMessage {
                        header,
                        payload: Vec::new(),
                    };
                    let available_payload = self.buf.len() - total_header;
                    let take = partial.header.payload_len.min(available_payload);
                    partial
                        .payload
                        .extend_from_slice(&self.buf[total_header..total_header + take]);
                    let consumed_total = total_header + take;
                    self.buf.drain(0..consumed_total);

                    if partial.payload.len() == partial.header.payload_len {
                        events.push(ParseEvent::Delivered(finish_message(partial, width)));
                    } else {
                        self.state = State::Body(partial);
                        return;
                    }
                }
                Err(DecodeError::Truncated { .. }) => {
                    return;
                }
                Err(DecodeError::Invalid { reason, .. }) => {
                    events.push(ParseEvent::DecodeError { reason });
                    self.drop_leading_zero_guarded(4);
                }
            }
        }
    }

    /// Decode the fixed+variable header that follows the 4-byte SOM.
    /// Returns the header, how many bytes (after the SOM) it consumed, and
    /// the float width used — the caller is responsible for pinning it.
    fn decode_header(&self, rest: &[u8]) -> Result<(PartialHeader, usize, FloatWidth), DecodeError> {
        let mut cur = Cursor::new(rest);
        let type_byte = cur.u8()?;
        let seq = cur.varuint()?;
        let pid = cur.varuint()?;
        let tid = cur.varuint()?;
        let tstart: [u8; 8] = cur.bytes(8)?.try_into().unwrap();
        let paylen = cur.varuint()? as usize;

        let width = if self.float_width == FloatWidth::Unknown {
            codec::sniff_float_width(&tstart)
        } else {
            self.float_width
        };
        let start_time = codec::decode_tstart(&tstart, width);

        Ok((
            PartialHeader {
                msg_type: MessageType::from_wire(type_byte),
                seq,
                pid,
                tid,
                start_time,
                payload_len: paylen,
            },
            cur.offset(),
            width,
        ))
    }

    /// Called once we know `self.buf` doesn't start with a SOM. Skips
    /// non-SOM bytes, retaining up to 3 trailing zero bytes that could be
    /// the prefix of an SOM split across reads. Returns bytes consumed.
    fn resync(&mut self, events: &mut Vec<ParseEvent>) -> usize {
        let zero_run = trailing_zero_run(&self.buf, 3);
        let keep_from = self.buf.len() - zero_run;

        if let Some(som_at) = find_som(&self.buf[..keep_from]) {
            if som_at > 0 {
                self.buf.drain(0..som_at);
                events.push(ParseEvent::LingeringData);
                return som_at;
            }
            return 0;
        }

        if keep_from == 0 {
            return 0;
        }
        self.buf.drain(0..keep_from);
        events.push(ParseEvent::LingeringData);
        keep_from
    }

    fn drop_leading_zero_guarded(&mut self, min_consume: usize) {
        let zero_run = trailing_zero_run(&self.buf, 3);
        let keep_from = self.buf.len().saturating_sub(zero_run).max(min_consume);
        let keep_from = keep_from.min(self.buf.len());
        self.buf.drain(0..keep_from);
    }

    fn commit_float_width(&mut self, width: FloatWidth) {
        if self.float_width == FloatWidth::Unknown {
            self.float_width = width;
        }
    }
}

fn finish_message(partial: PartialMessage, float_width: FloatWidth) -> Message {
    Message {
        msg_type: partial.header.msg_type,
        seq: partial.header.seq,
        pid: partial.header.pid,
        tid: partial.header.tid,
        start_time: partial.header.start_time,
        payload: partial.payload,
        receive_time: std::time::Instant::now(),
        float_width,
    }
}

fn find_som(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == SOM)
}

fn trailing_zero_run(buf: &[u8], max: usize) -> usize {
    let mut n = 0;
    while n < max && n < buf.len() && buf[buf.len() - 1 - n] == 0 {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_varuint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn encode_message(msg_type: u8, seq: u64, pid: u64, tid: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SOM);
        out.push(msg_type);
        encode_varuint(seq, &mut out);
        encode_varuint(pid, &mut out);
        encode_varuint(tid, &mut out);
        out.extend_from_slice(&[0u8; 8]); // tstart, sniffed as 32-bit
        encode_varuint(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn feed_all_at_once(stream: &[u8]) -> Vec<(MessageType, u64, u64, u64, Vec<u8>)> {
        let mut parser = FrameParser::new();
        collect_delivered(parser.feed(stream))
    }

    fn feed_in_chunks(stream: &[u8], chunk_sizes: &[usize]) -> Vec<(MessageType, u64, u64, u64, Vec<u8>)> {
        let mut parser = FrameParser::new();
        let mut delivered = Vec::new();
        let mut pos = 0;
        let mut idx = 0;
        while pos < stream.len() {
            let size = if chunk_sizes.is_empty() {
                1
            } else {
                chunk_sizes[idx % chunk_sizes.len()].max(1)
            };
            let end = (pos + size).min(stream.len());
            delivered.extend(collect_delivered(parser.feed(&stream[pos..end])));
            pos = end;
            idx += 1;
        }
        delivered
    }

    fn collect_delivered(events: Vec<ParseEvent>) -> Vec<(MessageType, u64, u64, u64, Vec<u8>)> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ParseEvent::Delivered(message) => Some((
                    message.msg_type,
                    message.seq,
                    message.pid,
                    message.tid,
                    message.payload,
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_message_in_one_feed_is_delivered() {
        let frame = encode_message(1, 1, 7, 1, &[]);
        let delivered = feed_all_at_once(&frame);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, MessageType::ProcessInit);
        assert_eq!(delivered[0].1, 1);
    }

    #[test]
    fn message_split_across_many_single_byte_reads_still_delivers() {
        let frame = encode_message(44, 5, 9, 2, b"hello");
        let delivered = feed_in_chunks(&frame, &[1]);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, MessageType::StatsRecord);
        assert_eq!(delivered[0].4, b"hello");
    }

    #[test]
    fn new_som_mid_body_drops_partial_and_resyncs() {
        let mut parser = FrameParser::new();
        let first = encode_message(1, 1, 1, 1, b"0123456789");
        // Feed header plus a few payload bytes, leaving the message incomplete.
        let split = first.len() - 5;
        let events = parser.feed(&first[..split]);
        assert!(collect_delivered(events).is_empty());

        let second = encode_message(2, 2, 2, 2, b"ok");
        let events = parser.feed(&second);
        assert!(matches!(events[0], ParseEvent::FrameDropped { .. }));
        let delivered = collect_delivered(events);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, MessageType::ProcessShutdown);
    }

    #[test]
    fn garbage_before_som_is_reported_and_skipped() {
        let mut parser = FrameParser::new();
        let mut stream = vec![1, 2, 3, 4, 5];
        stream.extend_from_slice(&encode_message(1, 1, 1, 1, &[]));
        let events = parser.feed(&stream);
        assert!(matches!(events[0], ParseEvent::LingeringData));
        let delivered = collect_delivered(events);
        assert_eq!(delivered.len(), 1);
    }

    proptest! {
        /// Invariant 1: feeding the same overall byte stream to the parser
        /// in any re-chunking yields the same sequence of delivered messages.
        #[test]
        fn rechunking_does_not_change_delivered_messages(
            messages in proptest::collection::vec(
                (1u8..=44u8, 0u64..10_000, 0u64..10_000, 0u64..10_000, proptest::collection::vec(any::<u8>(), 0..32)),
                1..8,
            ),
            chunk_sizes in proptest::collection::vec(1usize..17, 1..10),
        ) {
            let mut stream = Vec::new();
            for (msg_type, seq, pid, tid, payload) in &messages {
                stream.extend_from_slice(&encode_message(*msg_type, *seq, *pid, *tid, payload));
            }

            let whole = feed_all_at_once(&stream);
            let chunked = feed_in_chunks(&stream, &chunk_sizes);
            let byte_by_byte = feed_in_chunks(&stream, &[1]);

            prop_assert_eq!(&whole, &chunked);
            prop_assert_eq!(&whole, &byte_by_byte);
            prop_assert_eq!(whole.len(), messages.len());
        }
    }
}
