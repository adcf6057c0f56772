//! Peer ↔ tracker wire types
//!
//! Announce requests travel as a query string with binary fields in
//! base64url; responses are bencoded dictionaries.

use crate::{Error, InfoHash, Nid, Result, SessionId};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Unpadded on encode; accepts either form on decode
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// At most one byte per possible NID
pub const MAX_FAILED_LEN: usize = 255;

pub fn b64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    B64.decode(s)
        .map_err(|e| Error::InvalidData(format!("bad base64: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    /// Empty string means a regular interval announce
    pub fn parse(s: &str) -> Result<Option<Self>> {
        match s {
            "" => Ok(None),
            "started" => Ok(Some(Event::Started)),
            "completed" => Ok(Some(Event::Completed)),
            "stopped" => Ok(Some(Event::Stopped)),
            other => Err(Error::InvalidData(format!("invalid event {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub port: u16,
    pub event: Option<Event>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub session_id: Option<SessionId>,
    /// NIDs of neighbors we could not reach since the last announce
    pub failed: Vec<Nid>,
    pub ip: Option<String>,
}

impl AnnounceRequest {
    pub fn to_query(&self) -> String {
        let mut q = form_urlencoded::Serializer::new(String::new());
        q.append_pair("info_hash", &b64_encode(&self.info_hash));
        q.append_pair("port", &self.port.to_string());
        if let Some(event) = self.event {
            q.append_pair("event", event.as_str());
        }
        q.append_pair("uploaded", &self.uploaded.to_string());
        q.append_pair("downloaded", &self.downloaded.to_string());
        q.append_pair("left", &self.left.to_string());
        if let Some(session) = &self.session_id {
            q.append_pair("sessionid", &b64_encode(session.as_bytes()));
        }
        if !self.failed.is_empty() {
            let nids: Vec<u8> = self.failed.iter().map(|n| n.0).collect();
            q.append_pair("failed", &b64_encode(&nids));
        }
        if let Some(ip) = &self.ip {
            q.append_pair("ip", ip);
        }
        q.finish()
    }

    /// Parse and validate an announce query string
    pub fn from_query(query: &str) -> Result<Self> {
        let params: BTreeMap<String, String> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let info_hash: InfoHash = b64_decode(required(&params, "info_hash")?)?
            .try_into()
            .map_err(|_| Error::InvalidData("info_hash must be 20 bytes".to_string()))?;

        let port = number(&params, "port")?;
        if port == 0 || port > u16::MAX as u64 {
            return Err(Error::InvalidData(format!("invalid port {}", port)));
        }

        let event = Event::parse(param(&params, "event").unwrap_or(""))?;

        let session_id = match param(&params, "sessionid") {
            Some(s) => Some(
                SessionId::from_slice(&b64_decode(s)?)
                    .ok_or_else(|| Error::InvalidData("sessionid must be 8 bytes".to_string()))?,
            ),
            None => None,
        };
        if event == Some(Event::Started) && session_id.is_none() {
            return Err(Error::InvalidData(
                "sessionid is required on started".to_string(),
            ));
        }

        let failed = match param(&params, "failed") {
            Some(s) => b64_decode(s)?,
            None => Vec::new(),
        };
        if failed.len() > MAX_FAILED_LEN {
            return Err(Error::InvalidData(format!(
                "failed list of {} entries",
                failed.len()
            )));
        }

        Ok(Self {
            info_hash,
            port: port as u16,
            event,
            uploaded: number(&params, "uploaded")?,
            downloaded: number(&params, "downloaded")?,
            left: number(&params, "left")?,
            session_id,
            failed: failed.into_iter().map(Nid).collect(),
            ip: param(&params, "ip").filter(|s| !s.is_empty()).map(str::to_string),
        })
    }
}

fn param<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

fn required<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    param(params, name).ok_or_else(|| Error::InvalidData(format!("missing {}", name)))
}

fn number(params: &BTreeMap<String, String>, name: &str) -> Result<u64> {
    required(params, name)?
        .parse()
        .map_err(|_| Error::InvalidData(format!("{} must be a non-negative integer", name)))
}

/// One neighbor the tracker wants us connected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub ip: String,
    pub port: u16,
    pub nid: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// `(key ‖ iv, onion)` pairs
    #[serde(rename = "tracking codes", default)]
    pub tracking_codes: Vec<(ByteBuf, ByteBuf)>,
    #[serde(rename = "failure reason", default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(rename = "warning message", default, skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(data)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeEntry {
    pub complete: u64,
    pub incomplete: u64,
    pub downloaded: u64,
}

/// Swarm counts keyed by raw infohash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub files: BTreeMap<ByteBuf, ScrapeEntry>,
}

impl ScrapeResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(data)?)
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<&ScrapeEntry> {
        self.files.get(serde_bytes::Bytes::new(info_hash))
    }
}
