use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};

/// The extended handshake (BEP-10), EXTENDED message with id 0.
///
/// Carries the peer's extension-name → message-id table plus a few
/// informational fields. The id table is what later EXTENDED messages
/// are dispatched through.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// Extension name to the message id the *sender* expects for it.
    pub extensions: HashMap<String, u8>,
    /// Client name and version.
    pub client: Option<String>,
    /// The sender's listen port.
    pub port: Option<u16>,
    /// How many outstanding requests the sender queues.
    pub request_queue: Option<u32>,
    /// The address the sender sees us at.
    pub your_ip: Option<IpAddr>,
}

impl ExtensionHandshake {
    /// The handshake this client sends.
    pub fn ours(port: u16, request_queue: u32) -> Self {
        Self {
            extensions: HashMap::new(),
            client: Some(format!("undertow {}", env!("CARGO_PKG_VERSION"))),
            port: Some(port),
            request_queue: Some(request_queue),
            your_ip: None,
        }
    }

    /// Looks up the id the peer assigned to an extension name.
    pub fn id_for(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    pub fn encode(&self) -> Bytes {
        let mut m = Value::dict();
        for (name, id) in &self.extensions {
            m.insert(name, Value::Integer(*id as i64));
        }

        let mut dict = Value::dict();
        dict.insert("m", m);
        if let Some(client) = &self.client {
            dict.insert("v", Value::string(client));
        }
        if let Some(port) = self.port {
            dict.insert("p", Value::Integer(port as i64));
        }
        if let Some(reqq) = self.request_queue {
            dict.insert("reqq", Value::Integer(reqq as i64));
        }
        if let Some(ip) = self.your_ip {
            let bytes = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            dict.insert("yourip", Value::bytes(&bytes));
        }

        Bytes::from(encode(&dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or(PeerError::InvalidMessage("extended handshake not a dict"))?;

        let mut extensions = HashMap::new();
        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (name, id) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) else {
                    continue;
                };
                // id 0 disables an extension the peer previously advertised
                extensions.insert(name.to_string(), id as u8);
            }
        }

        let client = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        let port = dict
            .get(b"p".as_slice())
            .and_then(|v| v.as_int())
            .and_then(|p| u16::try_from(p).ok());
        let request_queue = dict
            .get(b"reqq".as_slice())
            .and_then(|v| v.as_int())
            .and_then(|q| u32::try_from(q).ok());

        let your_ip = dict
            .get(b"yourip".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| match b.len() {
                4 => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(b);
                    Some(IpAddr::from(octets))
                }
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(b);
                    Some(IpAddr::from(octets))
                }
                _ => None,
            });

        Ok(Self {
            extensions,
            client,
            port,
            request_queue,
            your_ip,
        })
    }
}
