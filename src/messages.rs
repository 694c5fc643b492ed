//! Mapping and serialization/deserialization of CA message types.
//!
//! Every CA message is a fixed-size [`Header`] optionally followed by a payload
//! whose length is declared in the header and padded out to an eight-byte
//! boundary. All integer fields are big-endian. Messages that declare a payload
//! of `0xFFFF` or more bytes, or an element count above `0xFFFF`, use the
//! 24-byte extended header form.
//!
//! Each message kind is a struct implementing [`CAMessage`]. Messages travelling
//! server→client on a virtual circuit are decoded by [`ClientMessageDecoder`]
//! into [`ClientMessage`]; the opposite direction is decoded by
//! [`ServerMessageDecoder`] into [`ServerMessage`]. Both decoders enforce a
//! maximum payload size before reserving any buffer space for it.

use std::{
    fmt::Display,
    io::{self, Cursor, Write as IoWrite},
    net::Ipv4Addr,
};

use bytes::{Buf, BytesMut};
use nom::{
    Err, IResult, Parser,
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::dbr::{DbrBasicType, DbrType};

/// The minor protocol revision spoken by this client
pub const CA_MINOR_PROTOCOL_REVISION: u16 = 13;
/// Oldest server revision we will hold a virtual circuit open with
pub const MINIMUM_SERVER_REVISION: u16 = 11;
/// Size of the standard message header
pub const HEADER_SIZE: usize = 16;
/// Size of the header when large payloads/counts are in use
pub const EXTENDED_HEADER_SIZE: usize = 24;
/// Default for `EPICS_CA_MAX_ARRAY_BYTES`
pub const DEFAULT_MAX_PAYLOAD: usize = 16384;

/// Flag in the UDP version header that marks the sequence number as present
pub const SEQUENCE_NUMBER_VALID: u16 = 1;

/// Search flag: the server must not answer if it does not host the name
const SEARCH_DONT_REPLY: u16 = 5;
/// Search flag: the server should send a NOT_FOUND if it does not host the name
const SEARCH_DO_REPLY: u16 = 10;

/// Command identifiers used on the wire
pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const WRITE: u16 = 4;
    pub const SEARCH: u16 = 6;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const RSRV_IS_UP: u16 = 13;
    pub const NOT_FOUND: u16 = 14;
    pub const READ_NOTIFY: u16 = 15;
    pub const CREATE_CHAN: u16 = 18;
    pub const WRITE_NOTIFY: u16 = 19;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ACCESS_RIGHTS: u16 = 22;
    pub const ECHO: u16 = 23;
    pub const CREATE_CH_FAIL: u16 = 26;
    pub const SERVER_DISCONN: u16 = 27;
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Message header is truncated or malformed")]
    MalformedHeader,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Message command ID does not match expected")]
    IncorrectCommandId(u16, u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// The fixed-size part of every CA message.
///
/// The meaning of the four generic fields depends on the command; the names
/// here follow the protocol documentation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    /// Size of the payload following the header, including padding
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
}

impl Header {
    /// Parse a header from the start of the input, standard or extended
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, (command, payload_size, data_type, data_count, parameter_1, parameter_2)) =
            (be_u16, be_u16, be_u16, be_u16, be_u32, be_u32).parse(input)?;

        if payload_size == 0xFFFF && data_count == 0 {
            let (input, (payload_size, data_count)) = (be_u32, be_u32).parse(input)?;
            Ok((
                input,
                Header {
                    command,
                    payload_size,
                    data_type,
                    data_count,
                    parameter_1,
                    parameter_2,
                },
            ))
        } else {
            Ok((
                input,
                Header {
                    command,
                    payload_size: payload_size as u32,
                    data_type,
                    data_count: data_count as u32,
                    parameter_1,
                    parameter_2,
                },
            ))
        }
    }

    /// Decode a header from a complete byte slice
    pub fn decode(input: &[u8]) -> Result<Header, MessageError> {
        Header::parse(input)
            .map(|(_, header)| header)
            .map_err(|_| MessageError::MalformedHeader)
    }

    /// Try to read a header from a partially received stream.
    ///
    /// Returns the header and the number of bytes it occupies, or `None` if
    /// more bytes are needed.
    pub fn peek(input: &[u8]) -> Option<(Header, usize)> {
        let (rest, header) = Header::parse(input).ok()?;
        Some((header, input.len() - rest.len()))
    }

    /// Does this header need the 24-byte form to represent?
    pub fn is_extended(&self) -> bool {
        self.payload_size >= 0xFFFF || self.data_count > 0xFFFF
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Refuse payloads larger than the agreed maximum
    pub fn check_payload_size(&self, max_payload: usize) -> Result<(), MessageError> {
        if self.payload_size as usize > max_payload {
            Err(MessageError::ProtocolViolation(format!(
                "command {} declares {} byte payload, limit is {max_payload}",
                self.command, self.payload_size
            )))
        } else {
            Ok(())
        }
    }

    pub fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.command.to_be_bytes())?;
        if self.is_extended() {
            writer.write_all(&0xFFFFu16.to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
            writer.write_all(&self.payload_size.to_be_bytes())?;
            writer.write_all(&self.data_count.to_be_bytes())?;
        } else {
            writer.write_all(&(self.payload_size as u16).to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&(self.data_count as u16).to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
        }
        Ok(())
    }
}

/// A header plus its (unpadded or padded) payload bytes
#[derive(Debug, Default, Clone)]
pub struct RawMessage {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: u16) -> Self {
        RawMessage {
            header: Header {
                command,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }

    /// Parse an entire message from complete input
    pub fn parse(input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, header) = Header::parse(input)?;
        let (input, payload) = take(header.payload_size as usize).parse(input)?;
        Ok((
            input,
            RawMessage {
                header,
                payload: payload.to_vec(),
            },
        ))
    }

    /// Parse an entire message, but check that it matches the expected tag
    fn parse_id(command_id: u16, input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, result) = RawMessage::parse(input)?;
        if result.header.command != command_id {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }
        Ok((input, result))
    }

    /// Split a datagram into all the messages it contains
    pub fn parse_many(mut input: &[u8]) -> Result<Vec<RawMessage>, MessageError> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (rest, message) = RawMessage::parse(input)?;
            messages.push(message);
            input = rest;
        }
        Ok(messages)
    }

    fn payload_as_string(&self) -> String {
        let strlen = self
            .payload
            .iter()
            .position(|&c| c == 0x00)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..strlen]).into_owned()
    }

    fn expect_id(&self, id: u16) -> Result<(), MessageError> {
        if self.header.command == id {
            Ok(())
        } else {
            Err(MessageError::IncorrectCommandId(self.header.command, id))
        }
    }

    pub fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        // The protocol requires payloads padded out to an 8 byte multiple
        let padded_size = self.payload.len().div_ceil(8) * 8;
        let header = Header {
            payload_size: padded_size as u32,
            ..self.header
        };
        header.write(writer)?;
        writer.write_all(&self.payload)?;
        let extra_bytes = padded_size - self.payload.len();
        if extra_bytes > 0 {
            writer.write_all(&[0u8; 8][..extra_bytes])?;
        }
        Ok(())
    }
}

/// A basic trait to tie parseability to the struct without a plethora of
/// named functions. Also adds common interface for writing a message struct
/// to a writer.
pub trait CAMessage: TryFrom<RawMessage, Error = MessageError> {
    const COMMAND: u16;

    fn to_raw(&self) -> RawMessage;

    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (rest, raw) = RawMessage::parse_id(Self::COMMAND, input)?;
        let message =
            Self::try_from(raw).map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?;
        Ok((rest, message))
    }

    fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}

impl<T> AsBytes for T
where
    T: CAMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        // Writing into a Vec cannot fail
        let _ = self.write(&mut buffer);
        buffer.into_inner()
    }
}

/// Encode a string as a NUL-terminated payload
fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn data_type_field(value: u16) -> Result<DbrType, MessageError> {
    value
        .try_into()
        .map_err(|_| MessageError::InvalidField("data_type".to_owned(), value.to_string()))
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established. It is
/// also sent as the first message in UDP search messages, where it
/// carries the datagram sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Circuit priority on TCP, sequence flags on UDP
    pub priority: u16,
    pub protocol_version: u16,
    pub sequence_number: u32,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
            sequence_number: 0,
        }
    }
}

impl Version {
    /// Version header for a search datagram carrying a sequence number
    pub fn with_sequence(sequence_number: u32) -> Self {
        Version {
            priority: SEQUENCE_NUMBER_VALID,
            sequence_number,
            ..Default::default()
        }
    }
    /// The sequence number, if this came from a UDP datagram that set one
    pub fn search_sequence(&self) -> Option<u32> {
        (self.priority & SEQUENCE_NUMBER_VALID != 0).then_some(self.sequence_number)
    }
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_SERVER_REVISION
    }
}

impl TryFrom<RawMessage> for Version {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::VERSION)?;
        Ok(Version {
            priority: value.header.data_type,
            protocol_version: value.header.data_count as u16,
            sequence_number: value.header.parameter_1,
        })
    }
}

impl CAMessage for Version {
    const COMMAND: u16 = command::VERSION;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.priority,
                data_count: self.protocol_version as u32,
                parameter_1: self.sequence_number,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_RSRV_IS_UP.
///
/// Beacon sent by a server when it becomes available. Beacons are also
/// sent out periodically to announce the server is still alive. Another
/// function of beacons is to allow detection of changes in network
/// topology. Sent over UDP.
#[derive(Debug, Default, Clone)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}

impl TryFrom<RawMessage> for RsrvIsUp {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::RSRV_IS_UP)?;
        Ok(RsrvIsUp {
            server_port: value.header.data_count as u16,
            beacon_id: value.header.parameter_1,
            server_ip: match value.header.parameter_2 {
                0u32 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            protocol_version: value.header.data_type,
        })
    }
}

impl CAMessage for RsrvIsUp {
    const COMMAND: u16 = command::RSRV_IS_UP;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.protocol_version,
                data_count: self.server_port as u32,
                parameter_1: self.beacon_id,
                parameter_2: self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0),
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. Sent over UDP or TCP.
#[derive(Debug, Clone)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
    }
}

impl Search {
    /// Construct a search response. is_udp required because field is
    /// only present when the intended target is UDP.
    pub fn respond(
        &self,
        server_ip: Option<Ipv4Addr>,
        port_number: u16,
        is_udp: bool,
    ) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: is_udp.then_some(CA_MINOR_PROTOCOL_REVISION),
        }
    }
}

impl TryFrom<RawMessage> for Search {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::SEARCH)?;
        Ok(Search {
            should_reply: value.header.data_type == SEARCH_DO_REPLY,
            protocol_version: value.header.data_count as u16,
            search_id: value.header.parameter_1,
            channel_name: value.payload_as_string(),
        })
    }
}

impl CAMessage for Search {
    const COMMAND: u16 = command::SEARCH;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: if self.should_reply {
                    SEARCH_DO_REPLY
                } else {
                    SEARCH_DONT_REPLY
                },
                data_count: self.protocol_version as u32,
                parameter_1: self.search_id,
                parameter_2: self.search_id,
                ..Default::default()
            },
            payload: pad_string(&self.channel_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub port_number: u16,
    pub search_id: u32,
    /// Server to connect to, if different from the message sender
    pub server_ip: Option<Ipv4Addr>,
    /// Protocol version only present if this is being sent as UDP
    pub protocol_version: Option<u16>,
}

impl TryFrom<RawMessage> for SearchResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::SEARCH)?;
        let protocol_version = match value.payload.as_slice() {
            [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
            _ => None,
        };
        Ok(SearchResponse {
            port_number: value.header.data_type,
            server_ip: match value.header.parameter_1 {
                0xFFFFFFFFu32 => None,
                i => Some(Ipv4Addr::from(i)),
            },
            search_id: value.header.parameter_2,
            protocol_version,
        })
    }
}

impl CAMessage for SearchResponse {
    const COMMAND: u16 = command::SEARCH;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.port_number,
                parameter_1: self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0xFFFFFFFF),
                parameter_2: self.search_id,
                ..Default::default()
            },
            payload: self
                .protocol_version
                .map(|v| v.to_be_bytes().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Parse a search datagram sent by a client
pub fn parse_search_packet(input: &[u8]) -> Result<(Version, Vec<Search>), MessageError> {
    let mut messages = RawMessage::parse_many(input)?.into_iter();
    // Starts with a version packet
    let version: Version = messages
        .next()
        .ok_or(MessageError::MalformedHeader)?
        .try_into()?;
    // Then a stream of multiple search messages
    let searches = messages
        .map(Search::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((version, searches))
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl Default for CreateChannel {
    fn default() -> Self {
        CreateChannel {
            client_id: 0,
            protocol_version: CA_MINOR_PROTOCOL_REVISION as u32,
            channel_name: String::new(),
        }
    }
}

impl TryFrom<RawMessage> for CreateChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::CREATE_CHAN)?;
        Ok(CreateChannel {
            client_id: value.header.parameter_1,
            protocol_version: value.header.parameter_2,
            channel_name: value.payload_as_string(),
        })
    }
}

impl CAMessage for CreateChannel {
    const COMMAND: u16 = command::CREATE_CHAN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.client_id,
                parameter_2: self.protocol_version,
                ..Default::default()
            },
            payload: pad_string(&self.channel_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateChannelResponse {
    pub native_type: DbrBasicType,
    pub native_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::CREATE_CHAN)?;
        Ok(CreateChannelResponse {
            native_type: value.header.data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "native_type".to_owned(),
                    value.header.data_type.to_string(),
                )
            })?,
            native_count: value.header.data_count,
            client_id: value.header.parameter_1,
            server_id: value.header.parameter_2,
        })
    }
}

impl CAMessage for CreateChannelResponse {
    const COMMAND: u16 = command::CREATE_CHAN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.native_type as u16,
                data_count: self.native_count,
                parameter_1: self.client_id,
                parameter_2: self.server_id,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL: the server could not create the channel
#[derive(Debug, Clone)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelFailure {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::CREATE_CH_FAIL)?;
        Ok(CreateChannelFailure {
            client_id: value.header.parameter_1,
        })
    }
}

impl CAMessage for CreateChannelFailure {
    const COMMAND: u16 = command::CREATE_CH_FAIL;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.client_id,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl From<u32> for Access {
    fn from(value: u32) -> Self {
        match value & 0b11 {
            1 => Access::Read,
            2 => Access::Write,
            3 => Access::ReadWrite,
            _ => Access::None,
        }
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Access::None => "NoAccess",
                Access::Read => "Read",
                Access::Write => "Write",
                Access::ReadWrite => "ReadWrite",
            }
        )
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS
///
/// Notifies of access rights for a channel. This value is determined
/// based on host and client name and may change during runtime. Client
/// cannot change access rights nor can it explicitly query its value,
/// so last received value must be stored.
#[derive(Debug, Clone)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

impl TryFrom<RawMessage> for AccessRights {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::ACCESS_RIGHTS)?;
        Ok(Self {
            client_id: value.header.parameter_1,
            access_rights: value.header.parameter_2.into(),
        })
    }
}

impl CAMessage for AccessRights {
    const COMMAND: u16 = command::ACCESS_RIGHTS;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.client_id,
                parameter_2: self.access_rights as u32,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY, from the client
#[derive(Debug, Clone)]
pub struct ReadNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl TryFrom<RawMessage> for ReadNotify {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::READ_NOTIFY)?;
        Ok(ReadNotify {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            server_id: value.header.parameter_1,
            client_ioid: value.header.parameter_2,
        })
    }
}

impl CAMessage for ReadNotify {
    const COMMAND: u16 = command::READ_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.server_id,
                parameter_2: self.client_ioid,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY, the server reply carrying the value
#[derive(Debug, Clone)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl TryFrom<RawMessage> for ReadNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::READ_NOTIFY)?;
        Ok(ReadNotifyResponse {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            status_code: value.header.parameter_1,
            client_ioid: value.header.parameter_2,
            data: value.payload,
        })
    }
}

impl CAMessage for ReadNotifyResponse {
    const COMMAND: u16 = command::READ_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.status_code,
                parameter_2: self.client_ioid,
                ..Default::default()
            },
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_WRITE: a put with no completion reply
#[derive(Debug, Clone)]
pub struct Write {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl TryFrom<RawMessage> for Write {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::WRITE)?;
        Ok(Write {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            server_id: value.header.parameter_1,
            client_ioid: value.header.parameter_2,
            data: value.payload,
        })
    }
}

impl CAMessage for Write {
    const COMMAND: u16 = command::WRITE;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.server_id,
                parameter_2: self.client_ioid,
                ..Default::default()
            },
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_WRITE_NOTIFY: a put that the server acknowledges
#[derive(Debug, Clone)]
pub struct WriteNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl TryFrom<RawMessage> for WriteNotify {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::WRITE_NOTIFY)?;
        Ok(WriteNotify {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            server_id: value.header.parameter_1,
            client_ioid: value.header.parameter_2,
            data: value.payload,
        })
    }
}

impl CAMessage for WriteNotify {
    const COMMAND: u16 = command::WRITE_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.server_id,
                parameter_2: self.client_ioid,
                ..Default::default()
            },
            payload: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
}

impl TryFrom<RawMessage> for WriteNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::WRITE_NOTIFY)?;
        Ok(WriteNotifyResponse {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            status_code: value.header.parameter_1,
            client_ioid: value.header.parameter_2,
        })
    }
}

impl CAMessage for WriteNotifyResponse {
    const COMMAND: u16 = command::WRITE_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.status_code,
                parameter_2: self.client_ioid,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Which kinds of change trigger a subscription update
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub archive: bool,
    pub alarm: bool,
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            archive: false,
            alarm: true,
            property: false,
        }
    }
}

impl From<u16> for MonitorMask {
    fn from(value: u16) -> Self {
        MonitorMask {
            value: value & 0x01 != 0,
            archive: value & 0x02 != 0,
            alarm: value & 0x04 != 0,
            property: value & 0x08 != 0,
        }
    }
}

impl From<MonitorMask> for u16 {
    fn from(value: MonitorMask) -> Self {
        (value.value as u16)
            | (value.archive as u16) << 1
            | (value.alarm as u16) << 2
            | (value.property as u16) << 3
    }
}

/// Message CA_PROTO_EVENT_ADD, from the client: start a subscription
#[derive(Debug, Clone)]
pub struct EventAdd {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

impl TryFrom<RawMessage> for EventAdd {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::EVENT_ADD)?;
        // Three unused f32 deadband fields precede the mask
        let mask = match value.payload.get(12..14) {
            Some([a, b]) => u16::from_be_bytes([*a, *b]),
            _ => {
                return Err(MessageError::InvalidField(
                    "EventAdd payload".to_owned(),
                    format!("{} bytes", value.payload.len()),
                ));
            }
        };
        Ok(EventAdd {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            server_id: value.header.parameter_1,
            subscription_id: value.header.parameter_2,
            mask: mask.into(),
        })
    }
}

impl CAMessage for EventAdd {
    const COMMAND: u16 = command::EVENT_ADD;
    fn to_raw(&self) -> RawMessage {
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(&u16::from(self.mask).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.server_id,
                parameter_2: self.subscription_id,
                ..Default::default()
            },
            payload,
        }
    }
}

/// Message CA_PROTO_EVENT_ADD, from the server: a subscription update.
///
/// An update with an empty payload confirms a cancelled subscription.
#[derive(Debug, Clone)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

impl EventAddResponse {
    pub fn is_cancel_confirmation(&self) -> bool {
        self.data.is_empty()
    }
}

impl TryFrom<RawMessage> for EventAddResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::EVENT_ADD)?;
        Ok(EventAddResponse {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            status_code: value.header.parameter_1,
            subscription_id: value.header.parameter_2,
            data: value.payload,
        })
    }
}

impl CAMessage for EventAddResponse {
    const COMMAND: u16 = command::EVENT_ADD;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.status_code,
                parameter_2: self.subscription_id,
                ..Default::default()
            },
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_EVENT_CANCEL
#[derive(Debug, Clone)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl EventCancel {
    /// The empty update a server sends to confirm this cancellation
    pub fn confirmation(&self) -> EventAddResponse {
        EventAddResponse {
            data_type: self.data_type,
            data_count: 0,
            status_code: ErrorCondition::Normal.status_code(),
            subscription_id: self.subscription_id,
            data: Vec::new(),
        }
    }
}

impl TryFrom<RawMessage> for EventCancel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::EVENT_CANCEL)?;
        Ok(EventCancel {
            data_type: data_type_field(value.header.data_type)?,
            data_count: value.header.data_count,
            server_id: value.header.parameter_1,
            subscription_id: value.header.parameter_2,
        })
    }
}

impl CAMessage for EventCancel {
    const COMMAND: u16 = command::EVENT_CANCEL;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                data_type: self.data_type.into(),
                data_count: self.data_count,
                parameter_1: self.server_id,
                parameter_2: self.subscription_id,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL. Sent by the client, echoed by the server.
#[derive(Debug, Clone)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

impl TryFrom<RawMessage> for ClearChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::CLEAR_CHANNEL)?;
        Ok(ClearChannel {
            server_id: value.header.parameter_1,
            client_id: value.header.parameter_2,
        })
    }
}

impl CAMessage for ClearChannel {
    const COMMAND: u16 = command::CLEAR_CHANNEL;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.server_id,
                parameter_2: self.client_id,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl TryFrom<RawMessage> for Echo {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::ECHO)?;
        Ok(Echo {})
    }
}

impl CAMessage for Echo {
    const COMMAND: u16 = command::ECHO;
    fn to_raw(&self) -> RawMessage {
        RawMessage::new(Self::COMMAND)
    }
}

#[derive(Debug, Clone)]
pub struct ClientName {
    pub name: String,
}

impl ClientName {
    pub fn new(name: &str) -> Self {
        ClientName {
            name: name.to_owned(),
        }
    }
}

impl TryFrom<RawMessage> for ClientName {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::CLIENT_NAME)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}

impl CAMessage for ClientName {
    const COMMAND: u16 = command::CLIENT_NAME;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                ..Default::default()
            },
            payload: pad_string(&self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostName {
    pub name: String,
}

impl HostName {
    pub fn new(name: &str) -> Self {
        HostName {
            name: name.to_owned(),
        }
    }
}

impl TryFrom<RawMessage> for HostName {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::HOST_NAME)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}

impl CAMessage for HostName {
    const COMMAND: u16 = command::HOST_NAME;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                ..Default::default()
            },
            payload: pad_string(&self.name),
        }
    }
}

/// Message CA_PROTO_SERVER_DISCONN: the server dropped one channel
#[derive(Debug, Clone)]
pub struct ServerDisconnect {
    pub client_id: u32,
}

impl TryFrom<RawMessage> for ServerDisconnect {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::SERVER_DISCONN)?;
        Ok(Self {
            client_id: value.header.parameter_1,
        })
    }
}

impl CAMessage for ServerDisconnect {
    const COMMAND: u16 = command::SERVER_DISCONN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.client_id,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }
}

/// Message CA_PROTO_ERROR.
///
/// Reports that a specific earlier request failed. The payload carries a
/// copy of the header of the failing request, followed by a message.
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub client_id: u32,
    pub condition: ErrorCondition,
    pub original_request: Header,
    pub message: String,
}

impl ErrorMessage {
    /// The request id the failing request carried, if its kind has one
    pub fn original_ioid(&self) -> Option<u32> {
        match self.original_request.command {
            command::READ_NOTIFY
            | command::WRITE_NOTIFY
            | command::EVENT_ADD
            | command::EVENT_CANCEL => Some(self.original_request.parameter_2),
            _ => None,
        }
    }
}

impl TryFrom<RawMessage> for ErrorMessage {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(command::ERROR)?;
        let (rest, original_request) =
            Header::parse(&value.payload).map_err(|_| MessageError::MalformedHeader)?;
        let strlen = rest.iter().position(|&c| c == 0).unwrap_or(rest.len());
        Ok(ErrorMessage {
            client_id: value.header.parameter_1,
            condition: ErrorCondition::from_status_code(value.header.parameter_2).ok_or_else(
                || {
                    MessageError::InvalidField(
                        "status".to_owned(),
                        value.header.parameter_2.to_string(),
                    )
                },
            )?,
            original_request,
            message: String::from_utf8_lossy(&rest[..strlen]).into_owned(),
        })
    }
}

impl CAMessage for ErrorMessage {
    const COMMAND: u16 = command::ERROR;
    fn to_raw(&self) -> RawMessage {
        let mut payload = Vec::new();
        let _ = self.original_request.write(&mut payload);
        payload.extend_from_slice(&pad_string(&self.message));
        RawMessage {
            header: Header {
                command: Self::COMMAND,
                parameter_1: self.client_id,
                parameter_2: self.condition.status_code(),
                ..Default::default()
            },
            payload,
        }
    }
}

/// Messages a client can receive over a virtual circuit
#[derive(Debug)]
pub enum ClientMessage {
    Version(Version),
    SearchResponse(SearchResponse),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAddResponse(EventAddResponse),
    ClearChannel(ClearChannel),
    ServerDisconnect(ServerDisconnect),
    Error(ErrorMessage),
    Echo,
}

impl TryFrom<RawMessage> for ClientMessage {
    type Error = MessageError;
    fn try_from(message: RawMessage) -> Result<Self, MessageError> {
        Ok(match message.header.command {
            command::VERSION => Self::Version(message.try_into()?),
            command::SEARCH => Self::SearchResponse(message.try_into()?),
            command::CREATE_CHAN => Self::CreateChannelResponse(message.try_into()?),
            command::CREATE_CH_FAIL => Self::CreateChannelFailure(message.try_into()?),
            command::ACCESS_RIGHTS => Self::AccessRights(message.try_into()?),
            command::READ_NOTIFY => Self::ReadNotifyResponse(message.try_into()?),
            command::WRITE_NOTIFY => Self::WriteNotifyResponse(message.try_into()?),
            command::EVENT_ADD => Self::EventAddResponse(message.try_into()?),
            command::CLEAR_CHANNEL => Self::ClearChannel(message.try_into()?),
            command::SERVER_DISCONN => Self::ServerDisconnect(message.try_into()?),
            command::ERROR => Self::Error(message.try_into()?),
            command::ECHO => Self::Echo,
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }
}

/// Messages a server can receive over a virtual circuit
#[derive(Debug)]
pub enum ServerMessage {
    Version(Version),
    Search(Search),
    CreateChannel(CreateChannel),
    ClientName(ClientName),
    HostName(HostName),
    ReadNotify(ReadNotify),
    Write(Write),
    WriteNotify(WriteNotify),
    EventAdd(EventAdd),
    EventCancel(EventCancel),
    ClearChannel(ClearChannel),
    Echo,
}

impl TryFrom<RawMessage> for ServerMessage {
    type Error = MessageError;
    fn try_from(message: RawMessage) -> Result<Self, MessageError> {
        Ok(match message.header.command {
            command::VERSION => Self::Version(message.try_into()?),
            command::SEARCH => Self::Search(message.try_into()?),
            command::CREATE_CHAN => Self::CreateChannel(message.try_into()?),
            command::CLIENT_NAME => Self::ClientName(message.try_into()?),
            command::HOST_NAME => Self::HostName(message.try_into()?),
            command::READ_NOTIFY => Self::ReadNotify(message.try_into()?),
            command::WRITE => Self::Write(message.try_into()?),
            command::WRITE_NOTIFY => Self::WriteNotify(message.try_into()?),
            command::EVENT_ADD => Self::EventAdd(message.try_into()?),
            command::EVENT_CANCEL => Self::EventCancel(message.try_into()?),
            command::CLEAR_CHANNEL => Self::ClearChannel(message.try_into()?),
            command::ECHO => Self::Echo,
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }
}

/// Pull one complete raw message off the front of a stream buffer.
///
/// Partial headers and payloads are left in place until enough bytes have
/// arrived. The declared size is checked before reserving space for it.
fn decode_raw(src: &mut BytesMut, max_payload: usize) -> Result<Option<RawMessage>, MessageError> {
    let Some((header, header_len)) = Header::peek(src) else {
        return Ok(None);
    };
    header.check_payload_size(max_payload)?;
    let total = header_len + header.payload_size as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(header_len);
    let payload = src.split_to(header.payload_size as usize).to_vec();
    Ok(Some(RawMessage { header, payload }))
}

/// Frames the server→client byte stream of a virtual circuit
#[derive(Debug, Clone, Copy)]
pub struct ClientMessageDecoder {
    max_payload: usize,
}

impl ClientMessageDecoder {
    pub fn new(max_payload: usize) -> Self {
        ClientMessageDecoder { max_payload }
    }
}

impl Default for ClientMessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for ClientMessageDecoder {
    type Item = ClientMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_raw(src, self.max_payload)?
            .map(ClientMessage::try_from)
            .transpose()
    }
}

/// Frames the client→server byte stream of a virtual circuit
#[derive(Debug, Clone, Copy)]
pub struct ServerMessageDecoder {
    max_payload: usize,
}

impl ServerMessageDecoder {
    pub fn new(max_payload: usize) -> Self {
        ServerMessageDecoder { max_payload }
    }
}

impl Default for ServerMessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for ServerMessageDecoder {
    type Item = ServerMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_raw(src, self.max_payload)?
            .map(ServerMessage::try_from)
            .transpose()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// CA status conditions, as carried in replies and CA_PROTO_ERROR
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    DblClFail = 18,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    IoDone = 42,
    IoInProgress = 43,
    BadSyncGrp = 44,
    PutCbInProg = 45,
    NoRdAccess = 46,
    NoWtAccess = 47,
    Anachronism = 48,
    NoSearchAddr = 49,
    NoConvert = 50,
    BadChId = 51,
    BadFuncPtr = 52,
    IsAttached = 53,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
    NotThreaded = 57,
    Array16kClient = 58,
    ConnSeqTmo = 59,
    UnrespTmo = 60,
}

impl ErrorCondition {
    const ALL: [ErrorCondition; 34] = [
        Self::Normal,
        Self::AllocMem,
        Self::TooLarge,
        Self::Timeout,
        Self::BadType,
        Self::Internal,
        Self::DblClFail,
        Self::GetFail,
        Self::PutFail,
        Self::BadCount,
        Self::BadStr,
        Self::Disconn,
        Self::EvDisallow,
        Self::BadMonId,
        Self::BadMask,
        Self::IoDone,
        Self::IoInProgress,
        Self::BadSyncGrp,
        Self::PutCbInProg,
        Self::NoRdAccess,
        Self::NoWtAccess,
        Self::Anachronism,
        Self::NoSearchAddr,
        Self::NoConvert,
        Self::BadChId,
        Self::BadFuncPtr,
        Self::IsAttached,
        Self::UnavailInServ,
        Self::ChanDestroy,
        Self::BadPriority,
        Self::NotThreaded,
        Self::Array16kClient,
        Self::ConnSeqTmo,
        Self::UnrespTmo,
    ];

    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::AllocMem => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::DblClFail => ErrorSeverity::Warning,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::EvDisallow => ErrorSeverity::Error,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::IoDone => ErrorSeverity::Info,
            Self::IoInProgress => ErrorSeverity::Info,
            Self::BadSyncGrp => ErrorSeverity::Error,
            Self::PutCbInProg => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::Anachronism => ErrorSeverity::Error,
            Self::NoSearchAddr => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::BadFuncPtr => ErrorSeverity::Error,
            Self::IsAttached => ErrorSeverity::Warning,
            Self::UnavailInServ => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
            Self::BadPriority => ErrorSeverity::Error,
            Self::NotThreaded => ErrorSeverity::Error,
            Self::Array16kClient => ErrorSeverity::Warning,
            Self::ConnSeqTmo => ErrorSeverity::Warning,
            Self::UnrespTmo => ErrorSeverity::Warning,
        }
    }

    /// The on-wire status: message number shifted over the severity bits
    pub fn status_code(&self) -> u32 {
        ((*self as u32) << 3) | self.get_severity() as u32
    }

    /// Decode an on-wire status code
    pub fn from_status_code(code: u32) -> Option<Self> {
        let number = code >> 3;
        Self::ALL.into_iter().find(|c| *c as u32 == number)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.get_severity(),
            ErrorSeverity::Success | ErrorSeverity::Info
        )
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::DblClFail => "The requested local DB operation failed",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::EvDisallow => "Request inappropriate within subscription (monitor) update callback",
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::IoDone => "IO operations have completed",
            Self::IoInProgress => "IO operations are in progress",
            Self::BadSyncGrp => "Invalid synchronous group identifier",
            Self::PutCbInProg => "Put callback timed out",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::Anachronism => "Requested feature is no longer supported",
            Self::NoSearchAddr => "Empty PV search address list",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::BadFuncPtr => "Invalid function pointer",
            Self::IsAttached => "Thread is already attached to a client context",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
            Self::BadPriority => "Invalid channel priority",
            Self::NotThreaded => "Preemptive callback not enabled - additional threads may not join context",
            Self::Array16kClient => "Client’s protocol revision does not support transfers exceeding 16k bytes",
            Self::ConnSeqTmo => "Virtual circuit connection sequence aborted",
            Self::UnrespTmo => "Virtual circuit unresponsive",
        })
    }
}
