//! Connection-phase packets: the server greeting, the client's handshake
//! response, and auth-switch requests.

use sqlwire_core::{ProtocolError, ProtocolErrorKind};

use super::{PacketReader, PacketWriter, capabilities, charset};
use crate::auth::plugins;

/// Initial handshake (protocol v10) sent by the server.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Auth plugin data (scramble), both parts, without trailing NUL
    pub auth_data: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default charset
    pub charset: u8,
    pub status_flags: u16,
    /// Auth plugin the server wants for the first exchange
    pub auth_plugin: String,
}

fn malformed(what: &str) -> ProtocolError {
    ProtocolError {
        kind: ProtocolErrorKind::Malformed,
        message: format!("malformed handshake: {what}"),
        raw_data: None,
    }
}

impl ServerHandshake {
    /// Parse the greeting.
    ///
    /// Layout: protocol version, NUL-terminated server version, connection
    /// id, 8 bytes of scramble, filler, lower capability flags, charset,
    /// status flags, upper capability flags, scramble length, 10 reserved
    /// bytes, rest of the scramble, NUL-terminated plugin name.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| malformed("missing protocol version"))?;
        if protocol_version != 10 {
            return Err(ProtocolError {
                kind: ProtocolErrorKind::UnexpectedPacket,
                message: format!("unsupported protocol version {protocol_version}"),
                raw_data: Some(payload.to_vec()),
            });
        }

        let server_version = reader
            .read_null_string()
            .ok_or_else(|| malformed("missing server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| malformed("missing connection id"))?;
        let auth_data_1 = reader
            .read_bytes(8)
            .ok_or_else(|| malformed("missing auth data"))?;
        if !reader.skip(1) {
            return Err(malformed("missing filler"));
        }
        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| malformed("missing capability flags"))?;

        // Pre-4.1 servers may end the packet here
        let charset = reader.read_u8().unwrap_or(charset::UTF8MB4_GENERAL_CI);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = reader.read_u8().map_or(0, usize::from);
        reader.skip(10);

        let mut auth_data = auth_data_1.to_vec();
        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(len2.min(reader.remaining()))
                .unwrap_or_default();
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            auth_data.extend_from_slice(part2);
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader
                .read_null_string()
                .unwrap_or_else(|| reader.read_rest_string())
        } else {
            String::new()
        };
        let auth_plugin = if auth_plugin.is_empty() {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            auth_plugin
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_data,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Client handshake response (HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    /// Negotiated capabilities (client request masked by server support)
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// Encode the response payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::new();
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            // Scrambles are at most 32 bytes
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }

        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }

        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        writer.into_bytes()
    }
}

/// Auth switch request (0xFE) asking the client to restart authentication
/// with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse the request, including its 0xFE marker.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0xFE) {
            return Err(ProtocolError {
                kind: ProtocolErrorKind::UnexpectedPacket,
                message: "expected auth switch request".to_string(),
                raw_data: Some(payload.to_vec()),
            });
        }

        // An empty body is the old-password switch, which we treat as native
        if reader.is_empty() {
            return Ok(Self {
                plugin: plugins::MYSQL_NATIVE_PASSWORD.to_string(),
                auth_data: Vec::new(),
            });
        }

        let plugin = reader
            .read_null_string()
            .ok_or_else(|| malformed("auth switch without plugin name"))?;
        let data = reader.read_rest();
        let auth_data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
        Ok(Self { plugin, auth_data })
    }
}
