//! Mapping and serialization/deserialization of CA protocol messages.
//!
//! Every message is a 16-byte header (24 bytes in the extended form used for
//! large payloads) followed by an optional 8-byte-padded payload. [`RawMessage`]
//! handles the header framing generically, and each protocol message gets a
//! struct implementing [`CAMessage`] for typed parse/write. The [`ClientMessage`]
//! and [`ServerMessage`] enums cover the messages each end of a circuit can
//! receive, and double as [`tokio_util::codec::Decoder`] implementations so a
//! TCP stream can be read through [`tokio_util::codec::FramedRead`].

use std::{
    io::{self, Cursor, Write},
    net::Ipv4Addr,
};

use nom::{
    Err, Finish, IResult, Parser,
    bytes::complete::take,
    combinator::all_consuming,
    error::{Error, ErrorKind},
    multi::many0,
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::{
    bytes::{Buf, BytesMut},
    codec::Decoder,
};

use crate::dbr::{DbrType, MonitorMask};

/// The protocol version this implementation speaks.
pub const EPICS_VERSION: u16 = 13;

/// Oldest peer version we know how to talk to. Everything we rely on
/// (notify read/write, subscriptions, access rights) settled well before
/// this.
const MINIMUM_SUPPORTED_VERSION: u16 = 12;

/// A basic trait to tie nom parseability to the struct without a
/// plethora of named functions.
/// Also adds common interface for writing a message struct to a writer.
pub trait CAMessage: TryFrom<RawMessage> {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized;

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

/// Convenience for encoding any message to an owned buffer.
pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}
impl<T> AsBytes for T
where
    T: CAMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        self.write(&mut buffer).unwrap();
        buffer.into_inner()
    }
}

#[derive(Default, Debug, Clone)]
pub struct RawMessage {
    pub command: u16,
    pub field_1_data_type: u16,
    pub field_2_data_count: u32,
    pub field_3_parameter_1: u32,
    pub field_4_parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Parse an entire message, but check that it matches the expected tag
    fn parse_id(command_id: u16, input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, result) = RawMessage::parse(input)?;
        if result.command != command_id {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }
        Ok((input, result))
    }

    fn payload_as_string(&self) -> String {
        let input = self.payload.as_slice();
        padded_string(input.len())(input).unwrap().1
    }

    fn payload_size(&self) -> usize {
        self.payload.len()
    }

    fn expect_id(&self, id: u16) -> Result<(), MessageError> {
        if self.command == id {
            Ok(())
        } else {
            Err(MessageError::IncorrectCommandId(self.command))
        }
    }

    /// Total wire size of the message starting at `buf`, if enough bytes
    /// have arrived to know it. Used by the stream codecs for framing.
    fn complete_length(buf: &[u8]) -> Option<usize> {
        if buf.len() < 16 {
            return None;
        }
        let payload_size = u16::from_be_bytes([buf[2], buf[3]]);
        if payload_size == 0xFFFF {
            if buf.len() < 24 {
                return None;
            }
            let payload_size = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
            let total = 24 + payload_size;
            (buf.len() >= total).then_some(total)
        } else {
            let total = 16 + payload_size as usize;
            (buf.len() >= total).then_some(total)
        }
    }
}

impl CAMessage for RawMessage {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // The protocol requires the payload padded out to an 8-byte multiple
        let payload_size = self.payload.len().div_ceil(8) * 8;

        writer.write_all(&self.command.to_be_bytes())?;
        if payload_size < 0xFFFF && self.field_2_data_count <= 0xFFFF {
            writer.write_all(&(payload_size as u16).to_be_bytes())?;
            writer.write_all(&self.field_1_data_type.to_be_bytes())?;
            writer.write_all(&(self.field_2_data_count as u16).to_be_bytes())?;
            writer.write_all(&self.field_3_parameter_1.to_be_bytes())?;
            writer.write_all(&self.field_4_parameter_2.to_be_bytes())?;
        } else {
            // Extended header: marker size and count in the standard
            // positions, real values appended after the parameters
            writer.write_all(&0xFFFFu16.to_be_bytes())?;
            writer.write_all(&self.field_1_data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.field_3_parameter_1.to_be_bytes())?;
            writer.write_all(&self.field_4_parameter_2.to_be_bytes())?;
            writer.write_all(&(payload_size as u32).to_be_bytes())?;
            writer.write_all(&self.field_2_data_count.to_be_bytes())?;
        }
        writer.write_all(&self.payload)?;
        let extra_bytes = payload_size - self.payload.len();
        if extra_bytes > 0 {
            writer.write_all(&vec![0; extra_bytes])?;
        }

        Ok(())
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, command) = be_u16(input)?;
        let (input, payload_size) = be_u16(input)?;
        // "Data Type" is always here, even in large packet headers
        let (input, field_1) = be_u16(input)?;

        // Handle packets that could be large
        if payload_size == 0xFFFF {
            let (input, _) = take(2usize)(input)?;
            let (input, field_3) = be_u32(input)?;
            let (input, field_4) = be_u32(input)?;
            let (input, payload_size) = be_u32(input)?;
            let (input, field_2) = be_u32(input)?;
            let (input, payload) = take(payload_size)(input)?;

            Ok((
                input,
                RawMessage {
                    command,
                    field_1_data_type: field_1,
                    field_2_data_count: field_2,
                    field_3_parameter_1: field_3,
                    field_4_parameter_2: field_4,
                    payload: payload.to_vec(),
                },
            ))
        } else {
            let (input, field_2) = be_u16(input)?;
            let (input, field_3) = be_u32(input)?;
            let (input, field_4) = be_u32(input)?;
            let (input, payload) = take(payload_size)(input)?;
            Ok((
                input,
                RawMessage {
                    command,
                    field_1_data_type: field_1,
                    field_2_data_count: field_2 as u32,
                    field_3_parameter_1: field_3,
                    field_4_parameter_2: field_4,
                    payload: payload.to_vec(),
                },
            ))
        }
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Message command ID does not match expected: {0}")]
    IncorrectCommandId(u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// Any message either side of a circuit can send.
#[derive(Debug, Clone)]
pub enum Message {
    Version(Version),
    RsrvIsUp(RsrvIsUp),
    Search(Search),
    SearchResponse(SearchResponse),
    CreateChannel(CreateChannel),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ClientName(ClientName),
    HostName(HostName),
    ReadNotify(ReadNotify),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotify(WriteNotify),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAdd(EventAdd),
    EventAddResponse(EventAddResponse),
    EventCancel(EventCancel),
    EventCancelResponse(EventCancelResponse),
    EventsOff,
    EventsOn,
    ClearChannel(ClearChannel),
    ECAError(ECAError),
    ServerDisconnect(ServerDisconnect),
    Echo,
}

macro_rules! impl_into_message {
    ($($kind:ident),+ $(,)?) => {
        $(impl From<$kind> for Message {
            fn from(value: $kind) -> Self {
                Message::$kind(value)
            }
        })+
    };
}
impl_into_message!(
    Version,
    RsrvIsUp,
    Search,
    SearchResponse,
    CreateChannel,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ClientName,
    HostName,
    ReadNotify,
    ReadNotifyResponse,
    WriteNotify,
    WriteNotifyResponse,
    EventAdd,
    EventAddResponse,
    EventCancel,
    EventCancelResponse,
    ClearChannel,
    ECAError,
    ServerDisconnect,
);

impl Message {
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Echo => Echo.write(writer),
            Self::EventsOff => EventsOff.write(writer),
            Self::EventsOn => EventsOn.write(writer),
            Self::Version(msg) => msg.write(writer),
            Self::RsrvIsUp(msg) => msg.write(writer),
            Self::Search(msg) => msg.write(writer),
            Self::SearchResponse(msg) => msg.write(writer),
            Self::CreateChannel(msg) => msg.write(writer),
            Self::CreateChannelResponse(msg) => msg.write(writer),
            Self::CreateChannelFailure(msg) => msg.write(writer),
            Self::AccessRights(msg) => msg.write(writer),
            Self::ClientName(msg) => msg.write(writer),
            Self::HostName(msg) => msg.write(writer),
            Self::ReadNotify(msg) => msg.write(writer),
            Self::ReadNotifyResponse(msg) => msg.write(writer),
            Self::WriteNotify(msg) => msg.write(writer),
            Self::WriteNotifyResponse(msg) => msg.write(writer),
            Self::EventAdd(msg) => msg.write(writer),
            Self::EventAddResponse(msg) => msg.write(writer),
            Self::EventCancel(msg) => msg.write(writer),
            Self::EventCancelResponse(msg) => msg.write(writer),
            Self::ClearChannel(msg) => msg.write(writer),
            Self::ECAError(msg) => msg.write(writer),
            Self::ServerDisconnect(msg) => msg.write(writer),
        }
    }

    /// Encode a batch of messages into one buffer and write it to an
    /// async stream. The protocol expects logically grouped messages
    /// (e.g. the version/name handshake) to arrive together, so batching
    /// them into a single write keeps the framing tidy.
    pub async fn write_all_messages<W: AsyncWrite + Unpin>(
        messages: &[Message],
        writer: &mut W,
    ) -> io::Result<()> {
        let mut buffer = Cursor::new(Vec::new());
        for message in messages {
            message.write(&mut buffer)?;
        }
        writer.write_all(&buffer.into_inner()).await?;
        writer.flush().await
    }
}

/// Messages a client can receive over an open circuit.
///
/// Some responses share a command ID with their request, so what a raw
/// message decodes to depends on which end of the circuit you are. This
/// enum is the client's view, and acts as its stream codec.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Version(Version),
    SearchResponse(SearchResponse),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAddResponse(EventAddResponse),
    ECAError(ECAError),
    ServerDisconnect(ServerDisconnect),
    Echo,
}

impl Default for ClientMessage {
    fn default() -> Self {
        ClientMessage::Echo
    }
}

impl TryFrom<RawMessage> for ClientMessage {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        Ok(match value.command {
            0 => Self::Version(value.try_into()?),
            1 => Self::EventAddResponse(value.try_into()?),
            6 => Self::SearchResponse(value.try_into()?),
            11 => Self::ECAError(value.try_into()?),
            15 => Self::ReadNotifyResponse(value.try_into()?),
            18 => Self::CreateChannelResponse(value.try_into()?),
            19 => Self::WriteNotifyResponse(value.try_into()?),
            22 => Self::AccessRights(value.try_into()?),
            23 => Self::Echo,
            26 => Self::CreateChannelFailure(value.try_into()?),
            27 => Self::ServerDisconnect(value.try_into()?),
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }
}

impl Decoder for ClientMessage {
    type Item = ClientMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = RawMessage::complete_length(src.as_ref()) else {
            return Ok(None);
        };
        let (_, raw) = RawMessage::parse(&src[..length]).map_err(MessageError::from)?;
        src.advance(length);
        Ok(Some(raw.try_into()?))
    }
}

/// Messages a server can receive, as the serving-side stream codec.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Version(Version),
    Search(Search),
    ClientName(ClientName),
    HostName(HostName),
    CreateChannel(CreateChannel),
    ReadNotify(ReadNotify),
    WriteNotify(WriteNotify),
    EventAdd(EventAdd),
    EventCancel(EventCancel),
    EventsOff,
    EventsOn,
    ClearChannel(ClearChannel),
    Echo,
}

impl Default for ServerMessage {
    fn default() -> Self {
        ServerMessage::Echo
    }
}

impl TryFrom<RawMessage> for ServerMessage {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        Ok(match value.command {
            0 => Self::Version(value.try_into()?),
            1 => Self::EventAdd(value.try_into()?),
            2 => Self::EventCancel(value.try_into()?),
            6 => Self::Search(value.try_into()?),
            8 => Self::EventsOff,
            9 => Self::EventsOn,
            12 => Self::ClearChannel(value.try_into()?),
            15 => Self::ReadNotify(value.try_into()?),
            18 => Self::CreateChannel(value.try_into()?),
            19 => Self::WriteNotify(value.try_into()?),
            20 => Self::ClientName(value.try_into()?),
            21 => Self::HostName(value.try_into()?),
            23 => Self::Echo,
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }
}

impl Decoder for ServerMessage {
    type Item = ServerMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = RawMessage::complete_length(src.as_ref()) else {
            return Ok(None);
        };
        let (_, raw) = RawMessage::parse(&src[..length]).map_err(MessageError::from)?;
        src.advance(length);
        Ok(Some(raw.try_into()?))
    }
}

fn padded_string(length: usize) -> impl for<'a> FnMut(&'a [u8]) -> IResult<&'a [u8], String> {
    move |input| {
        let (input, raw_string) = take(length)(input)?;
        let strlen = raw_string.iter().position(|&c| c == 0x00).unwrap_or(length);
        Ok((
            input,
            String::from_utf8_lossy(&raw_string[0..strlen]).into_owned(),
        ))
    }
}

fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    // Always at least one trailing NUL, then out to an 8-byte boundary
    let padded_len = (bytes.len() + 1).div_ceil(8) * 8;
    bytes.resize(padded_len, 0);
    bytes
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
        value.expect_id(13)?;
        Ok(RsrvIsUp {
            server_port: value.field_2_data_count as u16,
            beacon_id: value.field_3_parameter_1,
            server_ip: match value.field_4_parameter_2 {
                0u32 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            protocol_version: value.field_1_data_type,
        })
    }
}

impl CAMessage for RsrvIsUp {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, raw) = RawMessage::parse_id(0x0D, input)?;
        Ok((
            input,
            RsrvIsUp {
                server_port: raw.field_2_data_count as u16,
                beacon_id: raw.field_3_parameter_1,
                server_ip: match raw.field_4_parameter_2 {
                    0u32 => None,
                    ip => Some(Ipv4Addr::from(ip)),
                },
                protocol_version: raw.field_1_data_type,
            },
        ))
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&13_u16.to_be_bytes())?;
        writer.write_all(&0_u16.to_be_bytes())?;
        writer.write_all(&EPICS_VERSION.to_be_bytes())?;
        writer.write_all(&self.server_port.to_be_bytes())?;
        writer.write_all(&self.beacon_id.to_be_bytes())?;
        if let Some(ip) = &self.server_ip {
            writer.write_all(&ip.octets())?;
        } else {
            writer.write_all(&0u32.to_be_bytes())?;
        }
        Ok(())
    }
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established. It is
/// also sent as the first message in UDP search messages.
#[derive(Debug, Clone)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}
impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: EPICS_VERSION,
        }
    }
}
impl Version {
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_SUPPORTED_VERSION
    }
}
impl TryFrom<RawMessage> for Version {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(0)?;
        Ok(Version {
            priority: value.field_1_data_type,
            protocol_version: value.field_2_data_count as u16,
        })
    }
}
impl CAMessage for Version {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(0x00, input)?;
        Ok((
            input,
            Version {
                priority: header.field_1_data_type,
                protocol_version: header.field_2_data_count as u16,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 0,
            field_1_data_type: self.priority,
            field_2_data_count: self.protocol_version as u32,
            ..Default::default()
        }
        .write(writer)
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
impl Search {
    /// Construct a search response. is_udp required because the version
    /// field is only present when the intended target is UDP.
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
            protocol_version: if is_udp { Some(EPICS_VERSION) } else { None },
        }
    }
}
impl TryFrom<RawMessage> for Search {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(6)?;
        Ok(Search {
            should_reply: value.field_1_data_type == 10,
            protocol_version: value.field_2_data_count as u16,
            search_id: value.field_3_parameter_1,
            channel_name: value.payload_as_string(),
        })
    }
}
impl CAMessage for Search {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 6,
            field_1_data_type: if self.should_reply { 10 } else { 5 },
            field_2_data_count: self.protocol_version as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            payload: pad_string(&self.channel_name),
        }
        .write(writer)
    }
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, raw) = RawMessage::parse_id(0x06, input)?;
        Ok((
            input,
            Search {
                should_reply: raw.field_1_data_type == 10,
                protocol_version: raw.field_2_data_count as u16,
                search_id: raw.field_3_parameter_1,
                channel_name: raw.payload_as_string(),
            },
        ))
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
        value.expect_id(6)?;
        if value.payload_size() != 0 && value.payload_size() != 8 {
            return Err(MessageError::InvalidField(
                "payload_size".to_owned(),
                format!("{}", value.payload_size()),
            ));
        }
        Ok(SearchResponse {
            port_number: value.field_1_data_type,
            server_ip: match value.field_3_parameter_1 {
                0xFFFFFFFFu32 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            search_id: value.field_4_parameter_2,
            protocol_version: if value.payload_size() == 0 {
                None
            } else {
                Some(
                    be_u16::<&[u8], nom::error::Error<&[u8]>>(value.payload.as_slice())
                        .unwrap()
                        .1,
                )
            },
        })
    }
}

impl CAMessage for SearchResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(0x06, input)?;

        let mut response = SearchResponse {
            port_number: header.field_1_data_type,
            server_ip: match header.field_3_parameter_1 {
                0xFFFFFFFFu32 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            search_id: header.field_4_parameter_2,
            protocol_version: None,
        };
        if header.payload_size() >= 2 {
            let (_, version) =
                be_u16::<&[u8], nom::error::Error<&[u8]>>(header.payload.as_slice()).unwrap();
            response.protocol_version = Some(version);
        }
        Ok((input, response))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 0x06,
            field_1_data_type: self.port_number,
            field_2_data_count: 0,
            field_3_parameter_1: match self.server_ip {
                None => 0xFFFFFFFFu32,
                Some(ip) => ip.to_bits(),
            },
            field_4_parameter_2: self.search_id,
            payload: match self.protocol_version {
                None => Vec::new(),
                Some(version) => version.to_be_bytes().to_vec(),
            },
        }
        .write(writer)
    }
}

/// Parse one UDP search datagram: a version message, then searches.
pub fn parse_search_packet(input: &[u8]) -> Result<Vec<Search>, nom::error::Error<&[u8]>> {
    // Starts with a version packet
    let (input, _) = Version::parse(input).finish()?;
    // Then a stream of multiple messages
    let (_, messages) = all_consuming(many0(Search::parse)).parse(input).finish()?;

    Ok(messages)
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
            protocol_version: EPICS_VERSION as u32,
            channel_name: String::new(),
        }
    }
}

impl TryFrom<RawMessage> for CreateChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(18)?;
        Ok(CreateChannel {
            client_id: value.field_3_parameter_1,
            protocol_version: value.field_4_parameter_2,
            channel_name: value.payload_as_string(),
        })
    }
}
impl CAMessage for CreateChannel {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(18, input)?;
        Ok((
            input,
            CreateChannel {
                client_id: header.field_3_parameter_1,
                protocol_version: header.field_4_parameter_2,
                channel_name: header.payload_as_string(),
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 18,
            field_1_data_type: 0,
            field_2_data_count: 0,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.protocol_version,
            payload: pad_string(&self.channel_name),
        }
        .write(writer)
    }
}

#[derive(Debug, Clone)]
pub struct CreateChannelResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(18)?;
        Ok(CreateChannelResponse {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            client_id: value.field_3_parameter_1,
            server_id: value.field_4_parameter_2,
        })
    }
}

impl CAMessage for CreateChannelResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(18, input)?;
        Ok((
            input,
            CreateChannelResponse {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                client_id: header.field_3_parameter_1,
                server_id: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 18,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.server_id,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL.
///
/// Reports that channel creation failed, in response to
/// CA_PROTO_CREATE_CHAN for a name the server does not serve.
#[derive(Debug, Clone)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelFailure {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(26)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
        })
    }
}
impl CAMessage for CreateChannelFailure {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(26, input)?;
        Ok((
            input,
            CreateChannelFailure {
                client_id: header.field_3_parameter_1,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 26,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Channel permissions, as granted by the server's ACCESS_RIGHTS message.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    #[default]
    Deny = 0,
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

impl TryFrom<u32> for Access {
    type Error = MessageError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Access::Deny),
            1 => Ok(Access::Read),
            2 => Ok(Access::Write),
            3 => Ok(Access::ReadWrite),
            _ => Err(MessageError::InvalidField(
                "access_rights".to_owned(),
                format!("{value}"),
            )),
        }
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Access::Deny => "none",
                Access::Read => "read-only",
                Access::Write => "write-only",
                Access::ReadWrite => "read/write",
            }
        )
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS.
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
        value.expect_id(22)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
            access_rights: value.field_4_parameter_2.try_into()?,
        })
    }
}

impl CAMessage for AccessRights {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(22, input)?;
        Ok((
            input,
            AccessRights {
                client_id: header.field_3_parameter_1,
                access_rights: header
                    .field_4_parameter_2
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 22,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.access_rights as u32,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_READ_NOTIFY.
///
/// Read value of a channel, with server confirmation. Sent over TCP.
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
        value.expect_id(15)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for ReadNotify {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(15, input)?;
        Ok((
            input,
            ReadNotify {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                server_id: header.field_3_parameter_1,
                client_ioid: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 15,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Response to [`ReadNotify`]. The status parameter carries an ECA code;
/// the payload is the requested DBR-encoded value on success.
#[derive(Debug, Clone)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl ReadNotifyResponse {
    pub fn condition(&self) -> ErrorCondition {
        ErrorCondition::from_eca(self.status)
    }
}

impl TryFrom<RawMessage> for ReadNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(15)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            status: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for ReadNotifyResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(15, input)?;
        Ok((
            input,
            ReadNotifyResponse {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                status: header.field_3_parameter_1,
                client_ioid: header.field_4_parameter_2,
                data: header.payload,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 15,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
        .write(writer)
    }
}

/// Message CA_PROTO_WRITE_NOTIFY.
///
/// Write value to a channel, with server confirmation once the value has
/// been applied (or refused). Sent over TCP.
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
        value.expect_id(19)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for WriteNotify {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(19, input)?;
        Ok((
            input,
            WriteNotify {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                server_id: header.field_3_parameter_1,
                client_ioid: header.field_4_parameter_2,
                data: header.payload,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 19,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
        .write(writer)
    }
}

/// Response to [`WriteNotify`], carrying the outcome as an ECA code.
#[derive(Debug, Clone)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: u32,
    pub client_ioid: u32,
}

impl WriteNotifyResponse {
    pub fn condition(&self) -> ErrorCondition {
        ErrorCondition::from_eca(self.status)
    }
}

impl TryFrom<RawMessage> for WriteNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(19)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            status: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for WriteNotifyResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(19, input)?;
        Ok((
            input,
            WriteNotifyResponse {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                status: header.field_3_parameter_1,
                client_ioid: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 19,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENT_ADD.
///
/// Creates a subscription on a channel, causing the server to send the
/// current value immediately and then again on every change matching the
/// monitor mask. Sent over TCP.
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
        value.expect_id(1)?;
        // Payload: three obsolete deadband floats, then the mask
        let mask = if value.payload.len() >= 14 {
            let raw = u16::from_be_bytes([value.payload[12], value.payload[13]]);
            MonitorMask::from_bits(raw)
        } else {
            MonitorMask::default()
        };
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
            mask,
        })
    }
}
impl CAMessage for EventAdd {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(1, input)?;
        let mask = if header.payload.len() >= 14 {
            let raw = u16::from_be_bytes([header.payload[12], header.payload[13]]);
            MonitorMask::from_bits(raw)
        } else {
            MonitorMask::default()
        };
        Ok((
            input,
            EventAdd {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                server_id: header.field_3_parameter_1,
                subscription_id: header.field_4_parameter_2,
                mask,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Three obsolete deadband floats, the mask, then two pad bytes
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&self.mask.to_bits().to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        RawMessage {
            command: 1,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            payload,
        }
        .write(writer)
    }
}

/// Subscription update sent by the server for an active [`EventAdd`].
///
/// An empty payload is the server confirming subscription shutdown; the
/// client should drop all state for the subscription when it sees one.
#[derive(Debug, Clone)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

impl EventAddResponse {
    pub fn condition(&self) -> ErrorCondition {
        ErrorCondition::from_eca(self.status)
    }
    /// Build the cancel message that would terminate this subscription
    pub fn cancel(&self, server_id: u32) -> EventCancel {
        EventCancel {
            data_type: self.data_type,
            data_count: self.data_count,
            server_id,
            subscription_id: self.subscription_id,
        }
    }
}

impl TryFrom<RawMessage> for EventAddResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(1)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            status: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for EventAddResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(1, input)?;
        Ok((
            input,
            EventAddResponse {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                status: header.field_3_parameter_1,
                subscription_id: header.field_4_parameter_2,
                data: header.payload,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 1,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status,
            field_4_parameter_2: self.subscription_id,
            payload: self.data.clone(),
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENT_CANCEL.
///
/// Clears an event subscription. The server confirms with an empty
/// [`EventAddResponse`] for the same subscription id.
#[derive(Debug, Clone)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl TryFrom<RawMessage> for EventCancel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(2)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for EventCancel {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(2, input)?;
        Ok((
            input,
            EventCancel {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                data_count: header.field_2_data_count,
                server_id: header.field_3_parameter_1,
                subscription_id: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 2,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            ..Default::default()
        }
        .write(writer)
    }
}

/// The server's confirmation of an [`EventCancel`]: an empty update
/// carrying the subscription id, written with the EVENT_ADD command id.
#[derive(Debug, Clone)]
pub struct EventCancelResponse {
    pub data_type: DbrType,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl TryFrom<RawMessage> for EventCancelResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(1)?;
        Ok(Self {
            data_type: value.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField(
                    "data_type".to_owned(),
                    format!("{}", value.field_1_data_type),
                )
            })?,
            server_id: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for EventCancelResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(1, input)?;
        Ok((
            input,
            EventCancelResponse {
                data_type: header
                    .field_1_data_type
                    .try_into()
                    .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?,
                server_id: header.field_3_parameter_1,
                subscription_id: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 1,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: 0,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENTS_OFF: suspend subscription updates on a circuit.
#[derive(Debug, Default, Clone)]
pub struct EventsOff;

impl TryFrom<RawMessage> for EventsOff {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(8)?;
        Ok(EventsOff)
    }
}
impl CAMessage for EventsOff {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, _) = RawMessage::parse_id(8, input)?;
        Ok((input, EventsOff))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 8,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENTS_ON: resume subscription updates on a circuit.
#[derive(Debug, Default, Clone)]
pub struct EventsOn;

impl TryFrom<RawMessage> for EventsOn {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(9)?;
        Ok(EventsOn)
    }
}
impl CAMessage for EventsOn {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, _) = RawMessage::parse_id(9, input)?;
        Ok((input, EventsOn))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 9,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL.
///
/// Clears a channel. Sent by the client to release resources; the server
/// echoes it back to confirm.
#[derive(Debug, Clone)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

impl TryFrom<RawMessage> for ClearChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(12)?;
        Ok(Self {
            server_id: value.field_3_parameter_1,
            client_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for ClearChannel {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(12, input)?;
        Ok((
            input,
            ClearChannel {
                server_id: header.field_3_parameter_1,
                client_id: header.field_4_parameter_2,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 12,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_id,
            ..Default::default()
        }
        .write(writer)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Echo;

impl TryFrom<RawMessage> for Echo {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(23)?;
        Ok(Echo {})
    }
}

impl CAMessage for Echo {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, _) = RawMessage::parse_id(23, input)?;
        Ok((input, Echo))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 23,
            ..Default::default()
        }
        .write(writer)?;
        Ok(())
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
        value.expect_id(20)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}

impl CAMessage for ClientName {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, message) = RawMessage::parse_id(20, input)?;
        // Unwrapping here as otherwise it might return a reference to the (local) message
        // - we _know_ that the data is limited by vec length so this should not be an issue...
        let (_, client_name) = padded_string(message.payload.len())(&message.payload).unwrap();

        Ok((input, ClientName { name: client_name }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 20,
            payload: pad_string(&self.name),
            ..Default::default()
        }
        .write(writer)
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
        value.expect_id(21)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}
impl CAMessage for HostName {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, message) = RawMessage::parse_id(21, input)?;
        let (_, host_name) = padded_string(message.payload.len())(&message.payload).unwrap();

        Ok((input, HostName { name: host_name }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 21,
            payload: pad_string(&self.name),
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_SERVER_DISCONNECT: the server is dropping a channel.
#[derive(Debug, Clone)]
pub struct ServerDisconnect {
    pub client_id: u32,
}
impl TryFrom<RawMessage> for ServerDisconnect {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(27)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
        })
    }
}
impl CAMessage for ServerDisconnect {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(27, input)?;
        Ok((
            input,
            ServerDisconnect {
                client_id: header.field_3_parameter_1,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: 27,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
        .write(writer)
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

/// The ECA message conditions, used as status codes in notify responses
/// and error reports.
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

    /// Encode as the combined ECA status sent on the wire
    pub fn eca_code(&self) -> u32 {
        ((*self as u32) << 3) | self.get_severity() as u32
    }

    /// Decode an on-the-wire ECA status, falling back to Internal for
    /// message numbers we do not recognise
    pub fn from_eca(value: u32) -> ErrorCondition {
        use ErrorCondition::*;
        const CONDITIONS: &[ErrorCondition] = &[
            Normal,
            AllocMem,
            TooLarge,
            Timeout,
            BadType,
            Internal,
            DblClFail,
            GetFail,
            PutFail,
            BadCount,
            BadStr,
            Disconn,
            EvDisallow,
            BadMonId,
            BadMask,
            IoDone,
            IoInProgress,
            BadSyncGrp,
            PutCbInProg,
            NoRdAccess,
            NoWtAccess,
            Anachronism,
            NoSearchAddr,
            NoConvert,
            BadChId,
            BadFuncPtr,
            IsAttached,
            UnavailInServ,
            ChanDestroy,
            BadPriority,
            NotThreaded,
            Array16kClient,
            ConnSeqTmo,
            UnrespTmo,
        ];
        let msg_no = value >> 3;
        CONDITIONS
            .iter()
            .find(|&&c| c as u32 == msg_no)
            .copied()
            .unwrap_or(Internal)
    }
}

impl std::error::Error for ErrorCondition {}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}",         match self {
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
            Self::Array16kClient => "Client's protocol revision does not support transfers exceeding 16k bytes",
            Self::ConnSeqTmo => "Virtual circuit connection sequence aborted",
            Self::UnrespTmo => "Virtual circuit unresponsive",
        })
    }
}

/// Message CA_PROTO_ERROR.
///
/// Sent by the server when a request cannot be processed at all. Carries
/// the header of the offending request plus a description.
#[derive(Debug, Clone)]
pub struct ECAError {
    pub client_id: u32,
    pub condition: ErrorCondition,
    /// Header bytes of the request that triggered the error
    pub original_request: Vec<u8>,
    pub error_message: String,
}

impl ECAError {
    pub fn new(condition: ErrorCondition, client_id: u32, original: &impl CAMessage) -> Self {
        let mut original_request = original.as_bytes();
        original_request.truncate(16);
        ECAError {
            client_id,
            condition,
            original_request,
            error_message: condition.to_string(),
        }
    }

    /// The command id and second parameter of the request that failed,
    /// if the original header was carried intact
    pub fn request_context(&self) -> Option<(u16, u32)> {
        let header = self.original_request.get(..16)?;
        let command = u16::from_be_bytes(header[0..2].try_into().ok()?);
        let parameter_2 = u32::from_be_bytes(header[12..16].try_into().ok()?);
        Some((command, parameter_2))
    }
}

impl TryFrom<RawMessage> for ECAError {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(11)?;
        let (rest, original_request) =
            take::<usize, &[u8], nom::error::Error<&[u8]>>(16usize)(value.payload.as_slice())
                .map_err(MessageError::from)?;
        let (_, error_message) = padded_string(rest.len())(rest).map_err(MessageError::from)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
            condition: ErrorCondition::from_eca(value.field_4_parameter_2),
            original_request: original_request.to_vec(),
            error_message,
        })
    }
}
impl CAMessage for ECAError {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, header) = RawMessage::parse_id(11, input)?;
        // Errors from the payload parse would borrow the local header, so
        // they are re-anchored on `input`
        let (rest, original_request) =
            take::<usize, &[u8], Error<&[u8]>>(16usize)(header.payload.as_slice())
                .map_err(|_| Err::Error(Error::new(input, ErrorKind::Eof)))?;
        let (_, error_message) = padded_string(rest.len())(rest)
            .map_err(|_| Err::Error(Error::new(input, ErrorKind::Eof)))?;
        Ok((
            input,
            ECAError {
                client_id: header.field_3_parameter_1,
                condition: ErrorCondition::from_eca(header.field_4_parameter_2),
                original_request: original_request.to_vec(),
                error_message,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut payload = self.original_request.clone();
        payload.resize(16, 0);
        payload.append(&mut pad_string(&self.error_message));
        RawMessage {
            command: 11,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.condition.eca_code(),
            payload,
            ..Default::default()
        }
        .write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrBasicType, DbrCategory};
    use std::io::{Cursor, Seek};

    #[test]
    fn parse_beacon() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (_, beacon) = RsrvIsUp::parse(raw_beacon).unwrap();
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(
            beacon.server_ip,
            Some("172.23.124.207".parse::<Ipv4Addr>().unwrap())
        );

        // Now try converting it back
        let mut writer = Cursor::new(Vec::new());
        beacon.write(&mut writer).unwrap();
        assert_eq!(writer.stream_position().unwrap(), 16);
        assert_eq!(&writer.into_inner(), raw_beacon);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert!(ver.is_compatible());
        let mut writer = Cursor::new(Vec::new());
        ver.write(&mut writer).unwrap();
        assert_eq!(writer.stream_position().unwrap(), 16);
        assert_eq!(&writer.into_inner(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (_, search) = Search::parse(raw).unwrap();
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        // Check parsing something that isn't a search
        let raw = b"\x00\x00\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00";
        assert!(Search::parse(raw).is_err());
        // A version message followed by one search
        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1,
            0x73, 0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let searches = parse_search_packet(&raw).unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].channel_name, "some");
    }

    #[test]
    fn string_padding() {
        // Always a trailing NUL, out to an 8-byte boundary
        assert_eq!(pad_string("1234567").len(), 8);
        assert_eq!(pad_string("12345678").len(), 16);
        assert_eq!(pad_string("").len(), 8);
        assert_eq!(pad_string("some"), b"some\x00\x00\x00\x00");
    }

    #[test]
    fn notify_roundtrips() {
        let read = ReadNotify {
            data_type: DbrType {
                basic_type: DbrBasicType::Double,
                category: DbrCategory::Control,
            },
            data_count: 1,
            server_id: 42,
            client_ioid: 7,
        };
        let bytes = read.as_bytes();
        assert_eq!(bytes.len(), 16);
        let (_, reparsed) = ReadNotify::parse(&bytes).unwrap();
        assert_eq!(reparsed.data_type, read.data_type);
        assert_eq!(reparsed.server_id, 42);
        assert_eq!(reparsed.client_ioid, 7);

        let write = WriteNotify {
            data_type: DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Basic,
            },
            data_count: 1,
            server_id: 3,
            client_ioid: 9,
            data: vec![0, 0, 0, 42],
        };
        let bytes = write.as_bytes();
        // Payload padded out to 8 bytes
        assert_eq!(bytes.len(), 24);
        let (_, reparsed) = WriteNotify::parse(&bytes).unwrap();
        assert_eq!(reparsed.data[..4], [0, 0, 0, 42]);

        let response = WriteNotifyResponse {
            data_type: write.data_type,
            data_count: 1,
            status: ErrorCondition::Normal.eca_code(),
            client_ioid: 9,
        };
        let (_, reparsed) = WriteNotifyResponse::parse(&response.as_bytes()).unwrap();
        assert_eq!(reparsed.condition(), ErrorCondition::Normal);
    }

    #[test]
    fn event_add_roundtrip() {
        let msg = EventAdd {
            data_type: DbrType {
                basic_type: DbrBasicType::Float,
                category: DbrCategory::Time,
            },
            data_count: 4,
            server_id: 1,
            subscription_id: 88,
            mask: MonitorMask::default(),
        };
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 32);
        let (_, reparsed) = EventAdd::parse(&bytes).unwrap();
        assert_eq!(reparsed.subscription_id, 88);
        assert_eq!(reparsed.mask, MonitorMask::default());
    }

    #[test]
    fn eca_codes() {
        assert_eq!(ErrorCondition::Normal.eca_code(), 1);
        assert_eq!(
            ErrorCondition::from_eca(ErrorCondition::PutFail.eca_code()),
            ErrorCondition::PutFail
        );
        assert_eq!(
            ErrorCondition::from_eca(ErrorCondition::NoWtAccess.eca_code()),
            ErrorCondition::NoWtAccess
        );
    }

    #[test]
    fn eca_error_roundtrip() {
        let failed = WriteNotify {
            data_type: DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Basic,
            },
            data_count: 1,
            server_id: 3,
            client_ioid: 9,
            data: vec![0, 0, 0, 42],
        };
        let err = ECAError::new(ErrorCondition::NoWtAccess, 12, &failed);
        let bytes = err.as_bytes();
        let (rest, reparsed) = ECAError::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(reparsed.client_id, 12);
        assert_eq!(reparsed.condition, ErrorCondition::NoWtAccess);
        assert_eq!(
            reparsed.error_message,
            ErrorCondition::NoWtAccess.to_string()
        );
        // The carried header names the failed command and its ioid
        assert_eq!(reparsed.request_context(), Some((19, 9)));

        // A payload too short to hold the original request header is a
        // parse error, not a panic
        let truncated = RawMessage {
            command: 11,
            field_3_parameter_1: 12,
            field_4_parameter_2: ErrorCondition::BadType.eca_code(),
            payload: vec![0u8; 8],
            ..Default::default()
        }
        .as_bytes();
        assert!(ECAError::parse(&truncated).is_err());
    }

    #[test]
    fn large_header_roundtrip() {
        let msg = RawMessage {
            command: 1,
            field_1_data_type: 6,
            field_2_data_count: 10000,
            field_3_parameter_1: 1,
            field_4_parameter_2: 2,
            payload: vec![7u8; 80000],
        };
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 24 + 80000);
        let (_, reparsed) = RawMessage::parse(&bytes).unwrap();
        assert_eq!(reparsed.command, 1);
        assert_eq!(reparsed.field_2_data_count, 10000);
        assert_eq!(reparsed.payload.len(), 80000);
        assert_eq!(reparsed.payload[79999], 7);
    }

    #[test]
    fn decode_stream() {
        use tokio_util::bytes::BufMut;
        let mut codec = ClientMessage::default();
        let mut buf = BytesMut::new();
        // A partial header decodes to nothing
        buf.put_slice(&[0u8; 10]);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
        buf.clear();
        let mut bytes = Version::default().as_bytes();
        bytes.extend(
            AccessRights {
                client_id: 1,
                access_rights: Access::Read,
            }
            .as_bytes(),
        );
        buf.put_slice(&bytes);
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(ClientMessage::Version(_)))
        ));
        let Ok(Some(ClientMessage::AccessRights(rights))) = codec.decode(&mut buf) else {
            panic!("Expected access rights message");
        };
        assert_eq!(rights.access_rights, Access::Read);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }
}
