//! Connection phase: HandshakeV10 out, HandshakeResponse41 in, and the
//! COM_CHANGE_USER request which carries the same credentials.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::constants::{
    AUTH_PLUGIN_NAME, PROTOCOL_VERSION, SCRAMBLE_LENGTH, SERVER_VERSION, UTF8MB4_GENERAL_CI,
    capability, status,
};
use super::packet::{get_bytes, get_lenenc_bytes, get_lenenc_int, get_null_str, get_u8, get_u16, get_u32};
use crate::core::ServerError;

/// Random salt for mysql_native_password. Bytes stay printable and non-zero
/// because part of it travels NUL-terminated.
#[must_use]
pub fn generate_scramble() -> [u8; SCRAMBLE_LENGTH] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LENGTH];
    for byte in &mut scramble {
        *byte = rng.gen_range(33u8..127);
    }
    scramble
}

#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub connection_id: u32,
    pub scramble: [u8; SCRAMBLE_LENGTH],
    pub capabilities: u32,
}

impl InitialHandshake {
    #[must_use]
    pub fn new(connection_id: u32) -> Self {
        Self {
            connection_id,
            scramble: generate_scramble(),
            capabilities: capability::SERVER_DEFAULT,
        }
    }

    #[must_use]
    pub fn payload(&self) -> BytesMut {
        let mut p = BytesMut::with_capacity(128);
        p.put_u8(PROTOCOL_VERSION);
        p.put_slice(SERVER_VERSION.as_bytes());
        p.put_u8(0);
        p.put_u32_le(self.connection_id);
        p.put_slice(&self.scramble[..8]);
        p.put_u8(0);
        p.put_u16_le((self.capabilities & 0xFFFF) as u16);
        p.put_u8(UTF8MB4_GENERAL_CI);
        p.put_u16_le(status::AUTOCOMMIT);
        p.put_u16_le((self.capabilities >> 16) as u16);
        p.put_u8((SCRAMBLE_LENGTH + 1) as u8);
        p.put_slice(&[0u8; 10]);
        p.put_slice(&self.scramble[8..]);
        p.put_u8(0);
        p.put_slice(AUTH_PLUGIN_NAME.as_bytes());
        p.put_u8(0);
        p
    }
}

/// Asks the client to redo authentication with mysql_native_password.
#[must_use]
pub fn auth_switch_request(scramble: &[u8]) -> BytesMut {
    let mut p = BytesMut::with_capacity(48);
    p.put_u8(0xFE);
    p.put_slice(AUTH_PLUGIN_NAME.as_bytes());
    p.put_u8(0);
    p.put_slice(scramble);
    p.put_u8(0);
    p
}

#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub connect_attrs: Vec<(String, String)>,
}

impl HandshakeResponse {
    pub fn parse(mut buf: Bytes) -> Result<Self, ServerError> {
        let capabilities = get_u32(&mut buf)?;
        if capabilities & capability::PROTOCOL_41 == 0 {
            // pre-4.1 clients are not supported
            return Err(ServerError::BadHandshake);
        }
        let max_packet_size = get_u32(&mut buf)?;
        let character_set = get_u8(&mut buf)?;
        get_bytes(&mut buf, 23)?;
        let username = get_null_str(&mut buf);

        let auth_response = if capabilities & capability::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            get_lenenc_bytes(&mut buf)?.to_vec()
        } else if capabilities & capability::SECURE_CONNECTION != 0 {
            let len = get_u8(&mut buf)? as usize;
            get_bytes(&mut buf, len)?.to_vec()
        } else {
            get_null_str(&mut buf).into_bytes()
        };

        let database = if capabilities & capability::CONNECT_WITH_DB != 0 && !buf.is_empty() {
            Some(get_null_str(&mut buf)).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capabilities & capability::PLUGIN_AUTH != 0 && !buf.is_empty() {
            Some(get_null_str(&mut buf))
        } else {
            None
        };

        let connect_attrs = if capabilities & capability::CONNECT_ATTRS != 0 && !buf.is_empty() {
            parse_connect_attrs(&mut buf)?
        } else {
            Vec::new()
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    /// True when the client authenticated with some other plugin and needs an
    /// auth switch.
    #[must_use]
    pub fn needs_auth_switch(&self) -> bool {
        self.auth_plugin_name
            .as_deref()
            .is_some_and(|name| !name.is_empty() && name != AUTH_PLUGIN_NAME)
    }
}

fn parse_connect_attrs(buf: &mut Bytes) -> Result<Vec<(String, String)>, ServerError> {
    let total = usize::try_from(get_lenenc_int(buf)?).map_err(|_| ServerError::MalformedPacket)?;
    let mut block = get_bytes(buf, total)?;
    let mut attrs = Vec::new();
    while !block.is_empty() {
        let key = get_lenenc_bytes(&mut block)?;
        let value = get_lenenc_bytes(&mut block)?;
        attrs.push((
            String::from_utf8_lossy(&key).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }
    Ok(attrs)
}

/// COM_CHANGE_USER arguments.
#[derive(Debug, Clone, Default)]
pub struct ChangeUserRequest {
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub character_set: Option<u16>,
}

impl ChangeUserRequest {
    pub fn parse(mut buf: Bytes, capabilities: u32) -> Result<Self, ServerError> {
        if buf.is_empty() {
            return Err(ServerError::MalformedPacket);
        }
        let username = get_null_str(&mut buf);
        let auth_response = if capabilities & capability::SECURE_CONNECTION != 0 {
            let len = get_u8(&mut buf)? as usize;
            get_bytes(&mut buf, len)?.to_vec()
        } else {
            get_null_str(&mut buf).into_bytes()
        };
        let database = Some(get_null_str(&mut buf)).filter(|db| !db.is_empty());
        let character_set = if buf.len() >= 2 {
            Some(get_u16(&mut buf)?)
        } else {
            None
        };
        Ok(Self {
            username,
            auth_response,
            database,
            character_set,
        })
    }
}

/// Splits a COM_QUERY_ATTRS payload into its attribute pairs and query text.
/// Layout: lenenc length of the attribute block, the block of lenenc
/// key/value pairs, then the statement text.
pub fn split_query_attrs(mut buf: Bytes) -> Result<(Vec<(String, String)>, Bytes), ServerError> {
    let attrs = parse_connect_attrs(&mut buf)?;
    Ok((attrs, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{put_lenenc_int, put_lenenc_str, put_null_str};

    fn client_response(user: &str, token: &[u8], db: Option<&str>) -> Bytes {
        let mut caps = capability::PROTOCOL_41
            | capability::SECURE_CONNECTION
            | capability::PLUGIN_AUTH
            | capability::CONNECT_ATTRS;
        if db.is_some() {
            caps |= capability::CONNECT_WITH_DB;
        }
        let mut p = BytesMut::new();
        p.put_u32_le(caps);
        p.put_u32_le(16 * 1024 * 1024);
        p.put_u8(33);
        p.put_slice(&[0u8; 23]);
        put_null_str(&mut p, user);
        p.put_u8(token.len() as u8);
        p.put_slice(token);
        if let Some(db) = db {
            put_null_str(&mut p, db);
        }
        put_null_str(&mut p, AUTH_PLUGIN_NAME);
        let mut attrs = BytesMut::new();
        put_lenenc_str(&mut attrs, b"_client_name");
        put_lenenc_str(&mut attrs, b"libmysql");
        put_lenenc_int(&mut p, attrs.len() as u64);
        p.put_slice(&attrs);
        p.freeze()
    }

    #[test]
    fn test_scramble_is_printable() {
        let scramble = generate_scramble();
        assert!(scramble.iter().all(|b| (33..127).contains(b)));
    }

    #[test]
    fn test_initial_handshake_layout() {
        let hs = InitialHandshake::new(42);
        let p = hs.payload();
        assert_eq!(p[0], PROTOCOL_VERSION);
        let version_end = 1 + SERVER_VERSION.len();
        assert_eq!(p[version_end], 0);
        let id = u32::from_le_bytes([
            p[version_end + 1],
            p[version_end + 2],
            p[version_end + 3],
            p[version_end + 4],
        ]);
        assert_eq!(id, 42);
        assert!(p.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_parse_handshake_response() {
        let token = [9u8; 20];
        let resp = HandshakeResponse::parse(client_response("root", &token, Some("test"))).unwrap();
        assert_eq!(resp.username, "root");
        assert_eq!(resp.auth_response, token.to_vec());
        assert_eq!(resp.database.as_deref(), Some("test"));
        assert_eq!(resp.auth_plugin_name.as_deref(), Some(AUTH_PLUGIN_NAME));
        assert_eq!(
            resp.connect_attrs,
            vec![("_client_name".to_string(), "libmysql".to_string())]
        );
        assert!(!resp.needs_auth_switch());
    }

    #[test]
    fn test_truncated_handshake_is_malformed() {
        let full = client_response("root", &[1u8; 20], None);
        let truncated = full.slice(0..20);
        assert_eq!(
            HandshakeResponse::parse(truncated).unwrap_err(),
            ServerError::MalformedPacket
        );
    }

    #[test]
    fn test_split_query_attrs() {
        let mut p = BytesMut::new();
        let mut attrs = BytesMut::new();
        put_lenenc_str(&mut attrs, b"trace_id");
        put_lenenc_str(&mut attrs, b"abc");
        put_lenenc_int(&mut p, attrs.len() as u64);
        p.put_slice(&attrs);
        p.put_slice(b"SELECT 1");
        let (pairs, query) = split_query_attrs(p.freeze()).unwrap();
        assert_eq!(pairs, vec![("trace_id".to_string(), "abc".to_string())]);
        assert_eq!(&query[..], b"SELECT 1");
    }
}
