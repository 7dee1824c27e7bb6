//! Channel Access wire messages.
//!
//! Every CA message is a 16-byte big-endian header followed by a payload padded
//! to a multiple of eight bytes. Peers at protocol revision 4.9 or later also
//! accept an extended 24-byte header, used when the payload or element count
//! will not fit in the 16-bit header fields.
//!
//! Each message kind here converts to and from [`RawMessage`]; the
//! [`CAMessage`] trait ties that conversion to nom parsing and to writing.

use std::{
    fmt,
    io,
    net::Ipv4Addr,
};

use nom::{
    Err, Finish, IResult,
    bytes::complete::take,
    combinator::all_consuming,
    error::{Error, ErrorKind},
    multi::many0,
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;

/// The minor protocol revision this client speaks
pub const CA_MINOR_PROTOCOL_REVISION: u16 = 13;
/// Minor revision assumed until a peer tells us otherwise
pub const CA_UNKNOWN_MINOR_VERSION: u16 = 0;

/// Search flag asking servers to stay quiet when they do not host a name
pub const DONT_REPLY: u16 = 5;
/// Search flag asking servers to answer even when they do not host a name
pub const DO_REPLY: u16 = 10;

const PADDING: [u8; 8] = [0; 8];

pub(crate) const fn is_v41(minor: u16) -> bool {
    minor >= 1
}
pub(crate) const fn is_v42(minor: u16) -> bool {
    minor >= 2
}
pub(crate) const fn is_v43(minor: u16) -> bool {
    minor >= 3
}
pub(crate) const fn is_v44(minor: u16) -> bool {
    minor >= 4
}
pub(crate) const fn is_v45(minor: u16) -> bool {
    minor >= 5
}
pub(crate) const fn is_v48(minor: u16) -> bool {
    minor >= 8
}
pub(crate) const fn is_v49(minor: u16) -> bool {
    minor >= 9
}
pub(crate) const fn is_v410(minor: u16) -> bool {
    minor >= 10
}

/// Every opcode a client sends or understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Version = 0,
    EventAdd = 1,
    EventCancel = 2,
    Read = 3,
    Write = 4,
    Search = 6,
    EventsOff = 8,
    EventsOn = 9,
    ReadSync = 10,
    Error = 11,
    ClearChannel = 12,
    RsrvIsUp = 13,
    NotFound = 14,
    ReadNotify = 15,
    RepeaterConfirm = 17,
    CreateChannel = 18,
    WriteNotify = 19,
    ClientName = 20,
    HostName = 21,
    AccessRights = 22,
    Echo = 23,
    RepeaterRegister = 24,
    CreateChannelFailure = 26,
    ServerDisconnect = 27,
}

impl TryFrom<u16> for Command {
    type Error = MessageError;
    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        Ok(match value {
            0 => Self::Version,
            1 => Self::EventAdd,
            2 => Self::EventCancel,
            3 => Self::Read,
            4 => Self::Write,
            6 => Self::Search,
            8 => Self::EventsOff,
            9 => Self::EventsOn,
            10 => Self::ReadSync,
            11 => Self::Error,
            12 => Self::ClearChannel,
            13 => Self::RsrvIsUp,
            14 => Self::NotFound,
            15 => Self::ReadNotify,
            17 => Self::RepeaterConfirm,
            18 => Self::CreateChannel,
            19 => Self::WriteNotify,
            20 => Self::ClientName,
            21 => Self::HostName,
            22 => Self::AccessRights,
            23 => Self::Echo,
            24 => Self::RepeaterRegister,
            26 => Self::CreateChannelFailure,
            27 => Self::ServerDisconnect,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
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
    #[error("Message needs an extended header the peer does not accept")]
    OutOfBounds,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// A basic trait to tie nom parseability to the struct without a
/// plethora of named functions.
/// Also adds common interface for writing a message struct to a writer.
pub trait CAMessage: TryFrom<RawMessage, Error = MessageError> + Sized {
    const COMMAND: Command;

    fn to_raw(&self) -> RawMessage;

    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, raw) = RawMessage::parse_id(Self::COMMAND as u16, input)?;
        let message =
            Self::try_from(raw).map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?;
        Ok((rest, message))
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
        self.to_raw().to_bytes()
    }
}

/// A decoded message header, in either the standard or extended form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
    pub extended: bool,
}

impl FrameHeader {
    pub const SIZE: usize = 16;
    pub const EXTENDED_SIZE: usize = 24;

    pub fn size(&self) -> usize {
        if self.extended {
            Self::EXTENDED_SIZE
        } else {
            Self::SIZE
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], FrameHeader> {
        let (input, command) = be_u16(input)?;
        let (input, payload_size) = be_u16(input)?;
        // "Data Type" is always here, even in large packet headers
        let (input, data_type) = be_u16(input)?;
        let (input, data_count) = be_u16(input)?;
        let (input, parameter_1) = be_u32(input)?;
        let (input, parameter_2) = be_u32(input)?;
        if payload_size == 0xFFFF && data_count == 0 {
            let (input, payload_size) = be_u32(input)?;
            let (input, data_count) = be_u32(input)?;
            Ok((
                input,
                FrameHeader {
                    command,
                    payload_size,
                    data_type,
                    data_count,
                    parameter_1,
                    parameter_2,
                    extended: true,
                },
            ))
        } else {
            Ok((
                input,
                FrameHeader {
                    command,
                    payload_size: payload_size as u32,
                    data_type,
                    data_count: data_count as u32,
                    parameter_1,
                    parameter_2,
                    extended: false,
                },
            ))
        }
    }

    /// Decode a header if enough bytes are present
    pub fn peek(input: &[u8]) -> Option<FrameHeader> {
        Self::parse(input).ok().map(|(_, header)| header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.command.to_be_bytes());
        if self.extended {
            out.extend_from_slice(&0xFFFFu16.to_be_bytes());
            out.extend_from_slice(&self.data_type.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
        } else {
            out.extend_from_slice(&(self.payload_size as u16).to_be_bytes());
            out.extend_from_slice(&self.data_type.to_be_bytes());
            out.extend_from_slice(&(self.data_count as u16).to_be_bytes());
        }
        out.extend_from_slice(&self.parameter_1.to_be_bytes());
        out.extend_from_slice(&self.parameter_2.to_be_bytes());
        if self.extended {
            out.extend_from_slice(&self.payload_size.to_be_bytes());
            out.extend_from_slice(&self.data_count.to_be_bytes());
        }
        out
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: u16,
    pub field_1_data_type: u16,
    pub field_2_data_count: u32,
    pub field_3_parameter_1: u32,
    pub field_4_parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn from_parts(header: &FrameHeader, payload: &[u8]) -> Self {
        RawMessage {
            command: header.command,
            field_1_data_type: header.data_type,
            field_2_data_count: header.data_count,
            field_3_parameter_1: header.parameter_1,
            field_4_parameter_2: header.parameter_2,
            payload: payload.to_vec(),
        }
    }

    /// Parse an entire message, but check that it matches the expected tag
    pub fn parse_id(command_id: u16, input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (rest, result) = RawMessage::parse(input)?;
        if result.command != command_id {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }
        Ok((rest, result))
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, header) = FrameHeader::parse(input)?;
        let (input, payload) = take(header.payload_size)(input)?;
        Ok((input, RawMessage::from_parts(&header, payload)))
    }

    fn padded_payload_size(&self) -> usize {
        self.payload.len().next_multiple_of(8)
    }

    /// Whether this message can only be expressed with the 24-byte header
    pub fn needs_extended_header(&self) -> bool {
        self.padded_payload_size() >= 0xFFFF || self.field_2_data_count > 0xFFFF
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            command: self.command,
            payload_size: self.padded_payload_size() as u32,
            data_type: self.field_1_data_type,
            data_count: self.field_2_data_count,
            parameter_1: self.field_3_parameter_1,
            parameter_2: self.field_4_parameter_2,
            extended: self.needs_extended_header(),
        }
    }

    /// Total bytes this message occupies on the wire
    pub fn wire_size(&self) -> usize {
        self.header().size() + self.padded_payload_size()
    }

    pub fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        // The protocol requires payloads padded out to an 8 byte multiple
        let padding = self.padded_payload_size() - self.payload.len();
        writer.write_all(&self.header().to_bytes())?;
        writer.write_all(&self.payload)?;
        writer.write_all(&PADDING[..padding])?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header().to_bytes();
        out.extend_from_slice(&self.payload);
        out.resize(out.len() + self.padded_payload_size() - self.payload.len(), 0);
        out
    }

    pub fn payload_as_string(&self) -> String {
        string_until_nul(&self.payload)
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    fn expect_id(&self, id: Command) -> Result<(), MessageError> {
        if self.command == id as u16 {
            Ok(())
        } else {
            Err(MessageError::IncorrectCommandId(self.command))
        }
    }
}

fn string_until_nul(input: &[u8]) -> String {
    let strlen = input.iter().position(|&c| c == 0x00).unwrap_or(input.len());
    String::from_utf8_lossy(&input[..strlen]).into_owned()
}

/// Encode a string with its NUL terminator, ready for padding
pub(crate) fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    let padded_len = (bytes.len() + 1).next_multiple_of(8);
    bytes.resize(padded_len, 0);
    bytes
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}
impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
    }
}
impl TryFrom<RawMessage> for Version {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::Version)?;
        Ok(Version {
            priority: value.field_1_data_type,
            protocol_version: value.field_2_data_count as u16,
        })
    }
}
impl CAMessage for Version {
    const COMMAND: Command = Command::Version;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::Version as u16,
            field_1_data_type: self.priority,
            field_2_data_count: self.protocol_version as u32,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_VERSION as it leads every search datagram.
///
/// Over UDP the data type field flags whether the parameter field holds a
/// datagram sequence number, which lets search replies be matched to the
/// sweep that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramVersion {
    pub protocol_version: u16,
    pub sequence_number: Option<u32>,
}
impl TryFrom<RawMessage> for DatagramVersion {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::Version)?;
        Ok(DatagramVersion {
            protocol_version: value.field_2_data_count as u16,
            sequence_number: (value.field_1_data_type & 0x1 != 0)
                .then_some(value.field_3_parameter_1),
        })
    }
}
impl CAMessage for DatagramVersion {
    const COMMAND: Command = Command::Version;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::Version as u16,
            field_1_data_type: self.sequence_number.is_some() as u16,
            field_2_data_count: self.protocol_version as u32,
            field_3_parameter_1: self.sequence_number.unwrap_or(0),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_RSRV_IS_UP.
///
/// Beacon sent by a server when it becomes available. Beacons are also
/// sent out periodically to announce the server is still alive. Another
/// function of beacons is to allow detection of changes in network
/// topology. Sent over UDP.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}

impl TryFrom<RawMessage> for RsrvIsUp {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::RsrvIsUp)?;
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
    const COMMAND: Command = Command::RsrvIsUp;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::RsrvIsUp as u16,
            field_1_data_type: self.protocol_version,
            field_2_data_count: self.server_port as u32,
            field_3_parameter_1: self.beacon_id,
            field_4_parameter_2: self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. Sent over UDP or TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}
impl TryFrom<RawMessage> for Search {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::Search)?;
        Ok(Search {
            should_reply: value.field_1_data_type == DO_REPLY,
            protocol_version: value.field_2_data_count as u16,
            search_id: value.field_3_parameter_1,
            channel_name: value.payload_as_string(),
        })
    }
}
impl CAMessage for Search {
    const COMMAND: Command = Command::Search;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::Search as u16,
            field_1_data_type: if self.should_reply { DO_REPLY } else { DONT_REPLY },
            field_2_data_count: self.protocol_version as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            payload: pad_string(&self.channel_name),
        }
    }
}

/// Reply to a [`Search`]; names the server that hosts the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
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
        value.expect_id(Command::Search)?;
        let protocol_version = match value.payload.as_slice() {
            [high, low, ..] => Some(u16::from_be_bytes([*high, *low])),
            _ => None,
        };
        Ok(SearchResponse {
            port_number: value.field_1_data_type,
            server_ip: match value.field_3_parameter_1 {
                0xFFFFFFFFu32 => None,
                i => Some(Ipv4Addr::from(i)),
            },
            search_id: value.field_4_parameter_2,
            protocol_version,
        })
    }
}

impl CAMessage for SearchResponse {
    const COMMAND: Command = Command::Search;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::Search as u16,
            field_1_data_type: self.port_number,
            field_2_data_count: 0,
            field_3_parameter_1: match self.server_ip {
                None => 0xFFFFFFFFu32,
                Some(ip) => ip.to_bits(),
            },
            field_4_parameter_2: self.search_id,
            payload: match self.protocol_version {
                None => Vec::new(),
                Some(v) => v.to_be_bytes().to_vec(),
            },
        }
    }
}

/// Message CA_PROTO_NOT_FOUND, for searches sent with [`DO_REPLY`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub search_id: u32,
}
impl TryFrom<RawMessage> for NotFound {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::NotFound)?;
        Ok(NotFound {
            search_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for NotFound {
    const COMMAND: Command = Command::NotFound;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::NotFound as u16,
            field_1_data_type: DO_REPLY,
            field_2_data_count: CA_MINOR_PROTOCOL_REVISION as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            ..Default::default()
        }
    }
}

/// Split a search datagram into its searches
pub fn parse_search_packet(input: &[u8]) -> Result<Vec<Search>, nom::error::Error<&[u8]>> {
    // Starts with a version packet
    let (input, _) = Version::parse(input).finish()?;
    // Then a stream of multiple messages
    let (_, messages) = all_consuming(many0(Search::parse))(input).finish()?;

    Ok(messages)
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl TryFrom<RawMessage> for CreateChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::CreateChannel)?;
        Ok(CreateChannel {
            client_id: value.field_3_parameter_1,
            protocol_version: value.field_4_parameter_2,
            channel_name: value.payload_as_string(),
        })
    }
}
impl CAMessage for CreateChannel {
    const COMMAND: Command = Command::CreateChannel;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::CreateChannel as u16,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.protocol_version,
            // Servers before 4.4 identify the channel by the search-assigned id alone
            payload: if self.channel_name.is_empty() {
                Vec::new()
            } else {
                pad_string(&self.channel_name)
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::CreateChannel)?;
        Ok(CreateChannelResponse {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            client_id: value.field_3_parameter_1,
            server_id: value.field_4_parameter_2,
        })
    }
}

impl CAMessage for CreateChannelResponse {
    const COMMAND: Command = Command::CreateChannel;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::CreateChannel as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.server_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}
impl TryFrom<RawMessage> for CreateChannelFailure {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::CreateChannelFailure)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
        })
    }
}
impl CAMessage for CreateChannelFailure {
    const COMMAND: Command = Command::CreateChannelFailure;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::CreateChannelFailure as u16,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

/// Access rights a server grants this client on a channel
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
    /// Only the read and write bits are meaningful; anything else is ignored
    fn from(value: u32) -> Self {
        match value & 0x3 {
            1 => Access::Read,
            2 => Access::Write,
            3 => Access::ReadWrite,
            _ => Access::None,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::None => "none",
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "read/write",
        })
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS
///
/// Notifies of access rights for a channel. This value is determined
/// based on host and client name and may change during runtime. Client
/// cannot change access rights nor can it explicitly query its value,
/// so last received value must be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

impl TryFrom<RawMessage> for AccessRights {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::AccessRights)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
            access_rights: value.field_4_parameter_2.into(),
        })
    }
}

impl CAMessage for AccessRights {
    const COMMAND: Command = Command::AccessRights;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::AccessRights as u16,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.access_rights as u32,
            ..Default::default()
        }
    }
}

macro_rules! header_only_message {
    ($(#[$meta:meta])* $name:ident, $command:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl TryFrom<RawMessage> for $name {
            type Error = MessageError;
            fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
                value.expect_id(Command::$command)?;
                Ok($name)
            }
        }

        impl CAMessage for $name {
            const COMMAND: Command = Command::$command;
            fn to_raw(&self) -> RawMessage {
                RawMessage {
                    command: Command::$command as u16,
                    ..Default::default()
                }
            }
        }
    };
}

header_only_message!(
    /// Circuit heartbeat, answered in kind by the server
    Echo,
    Echo
);
header_only_message!(
    /// Heartbeat used with servers older than 4.3
    ReadSync,
    ReadSync
);
header_only_message!(
    /// Asks the server to stop sending subscription updates
    EventsOff,
    EventsOff
);
header_only_message!(
    /// Asks the server to resume subscription updates
    EventsOn,
    EventsOn
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientName {
    pub name: String,
}

impl TryFrom<RawMessage> for ClientName {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::ClientName)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}

impl CAMessage for ClientName {
    const COMMAND: Command = Command::ClientName;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::ClientName as u16,
            payload: pad_string(&self.name),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName {
    pub name: String,
}
impl TryFrom<RawMessage> for HostName {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::HostName)?;
        Ok(Self {
            name: value.payload_as_string(),
        })
    }
}
impl CAMessage for HostName {
    const COMMAND: Command = Command::HostName;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::HostName as u16,
            payload: pad_string(&self.name),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}
impl TryFrom<RawMessage> for ServerDisconnect {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::ServerDisconnect)?;
        Ok(Self {
            client_id: value.field_3_parameter_1,
        })
    }
}
impl CAMessage for ServerDisconnect {
    const COMMAND: Command = Command::ServerDisconnect;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::ServerDisconnect as u16,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL, releasing a channel on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}
impl TryFrom<RawMessage> for ClearChannel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::ClearChannel)?;
        Ok(Self {
            server_id: value.field_3_parameter_1,
            client_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for ClearChannel {
    const COMMAND: Command = Command::ClearChannel;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::ClearChannel as u16,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}
impl TryFrom<RawMessage> for ReadNotify {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::ReadNotify)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for ReadNotify {
    const COMMAND: Command = Command::ReadNotify;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::ReadNotify as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotifyResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}
impl TryFrom<RawMessage> for ReadNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::ReadNotify)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            status_code: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for ReadNotifyResponse {
    const COMMAND: Command = Command::ReadNotify;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::ReadNotify as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status_code,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_WRITE; fire-and-forget, no completion is returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub client_id: u32,
    pub data: Vec<u8>,
}
impl TryFrom<RawMessage> for Write {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::Write)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            client_id: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for Write {
    const COMMAND: Command = Command::Write;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::Write as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_id,
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_WRITE_NOTIFY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}
impl TryFrom<RawMessage> for WriteNotify {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::WriteNotify)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for WriteNotify {
    const COMMAND: Command = Command::WriteNotify;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::WriteNotify as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotifyResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
}
impl TryFrom<RawMessage> for WriteNotifyResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::WriteNotify)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            status_code: value.field_3_parameter_1,
            client_ioid: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for WriteNotifyResponse {
    const COMMAND: Command = Command::WriteNotify;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::WriteNotify as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status_code,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
    }
}

/// Which kinds of change a subscription reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl From<MonitorMask> for u16 {
    fn from(mask: MonitorMask) -> Self {
        mask.value as u16 | (mask.log as u16) << 1 | (mask.alarm as u16) << 2 | (mask.property as u16) << 3
    }
}

impl From<u16> for MonitorMask {
    fn from(bits: u16) -> Self {
        MonitorMask {
            value: bits & 0x1 != 0,
            log: bits & 0x2 != 0,
            alarm: bits & 0x4 != 0,
            property: bits & 0x8 != 0,
        }
    }
}

/// Message CA_PROTO_EVENT_ADD
///
/// The payload carries the obsolete low/high/to deadband floats, always
/// zero, ahead of the selection mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAdd {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}
impl TryFrom<RawMessage> for EventAdd {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::EventAdd)?;
        let mask = match value.payload.get(12..14) {
            Some(&[high, low]) => u16::from_be_bytes([high, low]).into(),
            _ => {
                return Err(MessageError::InvalidField(
                    "EventAdd payload".to_owned(),
                    format!("{} bytes", value.payload.len()),
                ));
            }
        };
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
            mask,
        })
    }
}
impl CAMessage for EventAdd {
    const COMMAND: Command = Command::EventAdd;
    fn to_raw(&self) -> RawMessage {
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(&u16::from(self.mask).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        RawMessage {
            command: Command::EventAdd as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            payload,
        }
    }
}

/// A subscription update. An empty payload confirms cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAddResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}
impl TryFrom<RawMessage> for EventAddResponse {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::EventAdd)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            status_code: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
            data: value.payload,
        })
    }
}
impl CAMessage for EventAddResponse {
    const COMMAND: Command = Command::EventAdd;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::EventAdd as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status_code,
            field_4_parameter_2: self.subscription_id,
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_EVENT_CANCEL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCancel {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}
impl TryFrom<RawMessage> for EventCancel {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::EventCancel)?;
        Ok(Self {
            data_type: value.field_1_data_type,
            data_count: value.field_2_data_count,
            server_id: value.field_3_parameter_1,
            subscription_id: value.field_4_parameter_2,
        })
    }
}
impl CAMessage for EventCancel {
    const COMMAND: Command = Command::EventCancel;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::EventCancel as u16,
            field_1_data_type: self.data_type,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_REPEATER_REGISTER, sent to the local repeater
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterRegister {
    pub client_ip: Ipv4Addr,
}
impl TryFrom<RawMessage> for RepeaterRegister {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::RepeaterRegister)?;
        Ok(Self {
            client_ip: Ipv4Addr::from(value.field_4_parameter_2),
        })
    }
}
impl CAMessage for RepeaterRegister {
    const COMMAND: Command = Command::RepeaterRegister;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::RepeaterRegister as u16,
            field_4_parameter_2: self.client_ip.to_bits(),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_REPEATER_CONFIRM, the repeater's acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterConfirm {
    pub repeater_ip: Ipv4Addr,
}
impl TryFrom<RawMessage> for RepeaterConfirm {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::RepeaterConfirm)?;
        Ok(Self {
            repeater_ip: Ipv4Addr::from(value.field_4_parameter_2),
        })
    }
}
impl CAMessage for RepeaterConfirm {
    const COMMAND: Command = Command::RepeaterConfirm;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Command::RepeaterConfirm as u16,
            field_4_parameter_2: self.repeater_ip.to_bits(),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_ERROR.
///
/// Carries a copy of the header of the request that failed, followed by a
/// free-text context string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ECAError {
    pub client_id: u32,
    pub status_code: u32,
    pub original_request: FrameHeader,
    pub error_message: String,
}
impl TryFrom<RawMessage> for ECAError {
    type Error = MessageError;
    fn try_from(value: RawMessage) -> Result<Self, Self::Error> {
        value.expect_id(Command::Error)?;
        let original_request = FrameHeader::peek(&value.payload).ok_or_else(|| {
            MessageError::InvalidField(
                "ECAError original request".to_owned(),
                format!("{} bytes", value.payload.len()),
            )
        })?;
        let error_message = string_until_nul(&value.payload[original_request.size()..]);
        Ok(Self {
            client_id: value.field_3_parameter_1,
            status_code: value.field_4_parameter_2,
            original_request,
            error_message,
        })
    }
}
impl CAMessage for ECAError {
    const COMMAND: Command = Command::Error;
    fn to_raw(&self) -> RawMessage {
        let mut payload = self.original_request.to_bytes();
        payload.extend_from_slice(&pad_string(&self.error_message));
        RawMessage {
            command: Command::Error as u16,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.status_code,
            payload,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
    Fatal = 6,
}

/// The CA status conditions, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    UnknownChannel = 7,
    TooLarge = 9,
    Timeout = 10,
    NoSupport = 11,
    DisconnChid = 13,
    BadType = 14,
    Internal = 17,
    DblClFail = 18,
    GetFail = 19,
    PutFail = 20,
    AddFail = 21,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    DblChnl = 25,
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

const ALL_CONDITIONS: [ErrorCondition; 39] = [
    ErrorCondition::Normal,
    ErrorCondition::AllocMem,
    ErrorCondition::UnknownChannel,
    ErrorCondition::TooLarge,
    ErrorCondition::Timeout,
    ErrorCondition::NoSupport,
    ErrorCondition::DisconnChid,
    ErrorCondition::BadType,
    ErrorCondition::Internal,
    ErrorCondition::DblClFail,
    ErrorCondition::GetFail,
    ErrorCondition::PutFail,
    ErrorCondition::AddFail,
    ErrorCondition::BadCount,
    ErrorCondition::BadStr,
    ErrorCondition::Disconn,
    ErrorCondition::DblChnl,
    ErrorCondition::EvDisallow,
    ErrorCondition::BadMonId,
    ErrorCondition::BadMask,
    ErrorCondition::IoDone,
    ErrorCondition::IoInProgress,
    ErrorCondition::BadSyncGrp,
    ErrorCondition::PutCbInProg,
    ErrorCondition::NoRdAccess,
    ErrorCondition::NoWtAccess,
    ErrorCondition::Anachronism,
    ErrorCondition::NoSearchAddr,
    ErrorCondition::NoConvert,
    ErrorCondition::BadChId,
    ErrorCondition::BadFuncPtr,
    ErrorCondition::IsAttached,
    ErrorCondition::UnavailInServ,
    ErrorCondition::ChanDestroy,
    ErrorCondition::BadPriority,
    ErrorCondition::NotThreaded,
    ErrorCondition::Array16kClient,
    ErrorCondition::ConnSeqTmo,
    ErrorCondition::UnrespTmo,
];

impl ErrorCondition {
    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::AllocMem => ErrorSeverity::Warning,
            Self::UnknownChannel => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::NoSupport => ErrorSeverity::Warning,
            Self::DisconnChid => ErrorSeverity::Error,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Fatal,
            Self::DblClFail => ErrorSeverity::Warning,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::AddFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::DblChnl => ErrorSeverity::Warning,
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

    /// The 32-bit status code as carried in response headers
    pub fn status(&self) -> u32 {
        ((*self as u32) << 3) & 0xFFF8 | (self.get_severity() as u32) & 0x7
    }

    /// Look up the condition a status code refers to, ignoring severity bits
    pub fn from_status(status: u32) -> Option<Self> {
        let number = (status & 0xFFF8) >> 3;
        ALL_CONDITIONS.into_iter().find(|c| *c as u32 == number)
    }

    pub fn is_success(status: u32) -> bool {
        status == Self::Normal.status()
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::UnknownChannel => "Unknown IO channel",
            Self::TooLarge => "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::NoSupport => "Sorry, that feature is planned but not supported at this time",
            Self::DisconnChid => "The supplied channel identifier was disconnected",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::DblClFail => "The requested local DB operation failed",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::AddFail => "Channel subscription request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::DblChnl => "Identical process variable names on multiple servers",
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

/// Render a status code for logs, falling back to the raw number
pub fn describe_status(status: u32) -> String {
    match ErrorCondition::from_status(status) {
        Some(condition) => condition.to_string(),
        None => format!("unknown status code {status:#x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Seek};

    #[test]
    fn parse_beacon() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (_, beacon) = RsrvIsUp::parse(raw_beacon).unwrap();
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(beacon.protocol_version, 13);
        assert_eq!(
            beacon.server_ip,
            Some("172.23.124.207".parse::<Ipv4Addr>().unwrap())
        );

        // Now try converting it back
        let mut writer = Cursor::new(Vec::new());
        beacon.write(&mut writer).unwrap();
        assert_eq!(writer.stream_position().unwrap(), 16);
        assert_eq!(writer.into_inner(), raw_beacon);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert_eq!(ver.protocol_version, 13);
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn datagram_version_carries_sequence() {
        let version = DatagramVersion {
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
            sequence_number: Some(0x01020304),
        };
        let bytes = version.as_bytes();
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[8..12], &[1, 2, 3, 4]);
        let (_, parsed) = DatagramVersion::parse(&bytes).unwrap();
        assert_eq!(parsed, version);

        // A TCP style version has no sequence flag
        let (_, parsed) = DatagramVersion::parse(&Version::default().as_bytes()).unwrap();
        assert_eq!(parsed.sequence_number, None);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (rest, search) = Search::parse(raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        assert_eq!(search.as_bytes(), raw);
        // Check parsing something that isn't a search
        let raw = b"\x00\x00\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00";
        assert!(Search::parse(raw).is_err());

        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x73,
            0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let searches = parse_search_packet(&raw).unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].channel_name, "some");
    }

    #[test]
    fn payload_padding_is_to_eight_bytes() {
        assert_eq!(pad_string("").len(), 8);
        assert_eq!(pad_string("1234567").len(), 8);
        assert_eq!(pad_string("12345678").len(), 16);

        let raw = RawMessage {
            command: Command::Write as u16,
            payload: vec![0xAA; 3],
            ..Default::default()
        };
        let bytes = raw.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[2..4], &[0, 8]);
        assert_eq!(&bytes[16..], &[0xAA, 0xAA, 0xAA, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn extended_header_for_large_payloads() {
        let message = WriteNotify {
            data_type: 6,
            data_count: 0x12345,
            server_id: 3,
            client_ioid: 4,
            data: vec![1u8; 0x12345 * 8],
        };
        let raw = message.to_raw();
        assert!(raw.needs_extended_header());
        assert_eq!(raw.wire_size(), 24 + 0x12345 * 8);

        let bytes = raw.to_bytes();
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        let (rest, parsed) = WriteNotify::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, message);
    }

    #[test]
    fn extended_header_for_large_counts_only() {
        let raw = ReadNotify {
            data_type: 6,
            data_count: 100_000,
            server_id: 1,
            client_ioid: 2,
        }
        .to_raw();
        assert!(raw.needs_extended_header());
        let header = FrameHeader::peek(&raw.to_bytes()).unwrap();
        assert!(header.extended);
        assert_eq!(header.data_count, 100_000);
        assert_eq!(header.payload_size, 0);
    }

    #[test]
    fn event_add_payload_layout() {
        let add = EventAdd {
            data_type: 14,
            data_count: 1,
            server_id: 7,
            subscription_id: 9,
            mask: MonitorMask::default(),
        };
        let bytes = add.as_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[16..28], &[0u8; 12]);
        assert_eq!(&bytes[28..30], &[0, 5]);
        let (_, parsed) = EventAdd::parse(&bytes).unwrap();
        assert_eq!(parsed, add);
    }

    #[test]
    fn error_message_keeps_original_request() {
        let original = ReadNotify {
            data_type: 1,
            data_count: 1,
            server_id: 5,
            client_ioid: 77,
        }
        .to_raw()
        .header();
        let error = ECAError {
            client_id: 3,
            status_code: ErrorCondition::GetFail.status(),
            original_request: original,
            error_message: "no such record".to_string(),
        };
        let (_, parsed) = ECAError::parse(&error.as_bytes()).unwrap();
        assert_eq!(parsed.original_request.command, Command::ReadNotify as u16);
        assert_eq!(parsed.original_request.parameter_2, 77);
        assert_eq!(parsed.error_message, "no such record");
        assert_eq!(
            ErrorCondition::from_status(parsed.status_code),
            Some(ErrorCondition::GetFail)
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorCondition::Normal.status(), 1);
        assert_eq!(ErrorCondition::Disconn.status(), 24 << 3);
        assert_eq!(ErrorCondition::BadType.status(), (14 << 3) | 2);
        assert_eq!(ErrorCondition::Internal.status(), (17 << 3) | 6);
        assert_eq!(
            ErrorCondition::from_status(ErrorCondition::DblChnl.status()),
            Some(ErrorCondition::DblChnl)
        );
        assert_eq!(ErrorCondition::from_status(1000 << 3), None);
        assert!(ErrorCondition::is_success(1));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(Command::try_from(27).unwrap(), Command::ServerDisconnect);
        assert!(matches!(
            Command::try_from(5),
            Err(MessageError::UnknownCommandId(5))
        ));
        assert!(Command::try_from(0xFFFF).is_err());
    }

    #[test]
    fn access_rights_bits() {
        assert_eq!(Access::from(3), Access::ReadWrite);
        assert_eq!(Access::from(0x7), Access::ReadWrite);
        assert!(Access::from(1).can_read());
        assert!(!Access::from(1).can_write());
    }
}
