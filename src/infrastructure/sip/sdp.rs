//! SDP offer/answer (RFC 3264), single audio m-line
//!
//! The PBX always answers with its own relay address and port; codecs are
//! the intersection of the offer with what we relay (G.711 always, Opus
//! passthrough when offered). Hold re-INVITEs are detected from the
//! direction attribute.

use std::fmt;
use std::net::IpAddr;

use super::message::SipError;

/// Stream direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    /// A re-INVITE with sendonly or inactive puts the call on hold.
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

/// Parsed session description (the parts the relay cares about)
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub origin_user: String,
    pub session_id: String,
    pub session_version: String,
    /// c= connection address
    pub connection: String,
    /// m=audio port
    pub audio_port: u16,
    /// payload types in offer order
    pub payload_types: Vec<u8>,
    /// pt -> encoding, e.g. 101 -> "telephone-event/8000"
    pub rtpmap: Vec<(u8, String)>,
    pub direction: MediaDirection,
}

impl SdpSession {
    pub fn parse(raw: &str) -> Result<Self, SipError> {
        let mut origin_user = "-".to_string();
        let mut session_id = "0".to_string();
        let mut session_version = "0".to_string();
        let mut connection = None;
        let mut audio_port = None;
        let mut payload_types = Vec::new();
        let mut rtpmap = Vec::new();
        let mut direction = MediaDirection::SendRecv;
        let mut in_audio = false;

        for line in raw.lines() {
            let line = line.trim_end();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "o" => {
                    let mut parts = value.split_whitespace();
                    if let Some(user) = parts.next() {
                        origin_user = user.to_string();
                    }
                    if let Some(id) = parts.next() {
                        session_id = id.to_string();
                    }
                    if let Some(version) = parts.next() {
                        session_version = version.to_string();
                    }
                }
                "c" => {
                    // c=IN IP4 <addr>; a session or media level line
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        connection = Some(addr.to_string());
                    }
                }
                "m" => {
                    let mut parts = value.split_whitespace();
                    let media = parts.next().unwrap_or("");
                    if media == "audio" {
                        in_audio = true;
                        audio_port = parts
                            .next()
                            .and_then(|p| p.parse().ok());
                        let _proto = parts.next();
                        for pt in parts {
                            if let Ok(pt) = pt.parse() {
                                payload_types.push(pt);
                            }
                        }
                    } else {
                        in_audio = false;
                    }
                }
                // direction may be session-level (before any m-line) or
                // media-level; other media sections are ignored
                "a" if in_audio || audio_port.is_none() => match value {
                    "sendrecv" => direction = MediaDirection::SendRecv,
                    "sendonly" => direction = MediaDirection::SendOnly,
                    "recvonly" => direction = MediaDirection::RecvOnly,
                    "inactive" => direction = MediaDirection::Inactive,
                    other => {
                        if let Some(rest) = other.strip_prefix("rtpmap:") {
                            let mut parts = rest.splitn(2, ' ');
                            if let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) {
                                if let Ok(pt) = pt.parse() {
                                    rtpmap.push((pt, encoding.to_string()));
                                }
                            }
                        }
                    }
                },
                _ => {}
            }
        }

        Ok(Self {
            origin_user,
            session_id,
            session_version,
            connection: connection
                .ok_or_else(|| SipError::InvalidMessage("SDP has no connection line".into()))?,
            audio_port: audio_port
                .ok_or_else(|| SipError::InvalidMessage("SDP has no audio m-line".into()))?,
            payload_types,
            rtpmap,
            direction,
        })
    }

    pub fn connection_ip(&self) -> Option<IpAddr> {
        self.connection.parse().ok()
    }

    /// Dynamic payload type carrying telephone-event, if offered.
    pub fn telephone_event_pt(&self) -> Option<u8> {
        self.rtpmap
            .iter()
            .find(|(_, enc)| enc.to_ascii_lowercase().starts_with("telephone-event"))
            .map(|(pt, _)| *pt)
    }

    /// Dynamic payload type carrying Opus, if offered.
    pub fn opus_pt(&self) -> Option<u8> {
        self.rtpmap
            .iter()
            .find(|(_, enc)| enc.to_ascii_lowercase().starts_with("opus"))
            .map(|(pt, _)| *pt)
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0\r")?;
        writeln!(
            f,
            "o={} {} {} IN IP4 {}\r",
            self.origin_user, self.session_id, self.session_version, self.connection
        )?;
        writeln!(f, "s=skylark\r")?;
        writeln!(f, "c=IN IP4 {}\r", self.connection)?;
        writeln!(f, "t=0 0\r")?;
        let formats: Vec<String> = self.payload_types.iter().map(|pt| pt.to_string()).collect();
        writeln!(f, "m=audio {} RTP/AVP {}\r", self.audio_port, formats.join(" "))?;
        for (pt, encoding) in &self.rtpmap {
            writeln!(f, "a=rtpmap:{} {}\r", pt, encoding)?;
        }
        writeln!(f, "a={}\r", self.direction.as_str())?;
        Ok(())
    }
}

/// The codecs the relay carries natively.
const SUPPORTED_STATIC: [u8; 2] = [0, 8];

/// Build the answer to an offer: our address and relay port, the
/// intersection of the offered codecs with what we carry, telephone-event
/// and Opus passed through when present.
pub fn build_answer(offer: &SdpSession, public_ip: &str, rtp_port: u16) -> Result<SdpSession, SipError> {
    let mut payload_types: Vec<u8> = offer
        .payload_types
        .iter()
        .copied()
        .filter(|pt| SUPPORTED_STATIC.contains(pt))
        .collect();
    let mut rtpmap = Vec::new();

    if let Some(pt) = offer.opus_pt() {
        if offer.payload_types.contains(&pt) {
            payload_types.push(pt);
            if let Some(entry) = offer.rtpmap.iter().find(|(p, _)| *p == pt) {
                rtpmap.push(entry.clone());
            }
        }
    }
    if payload_types.is_empty() {
        return Err(SipError::InvalidMessage("no common codec in offer".into()));
    }
    for pt in &payload_types {
        match pt {
            0 => rtpmap.insert(0, (0, "PCMU/8000".to_string())),
            8 => rtpmap.push((8, "PCMA/8000".to_string())),
            _ => {}
        }
    }
    if let Some(pt) = offer.telephone_event_pt() {
        payload_types.push(pt);
        rtpmap.push((pt, "telephone-event/8000".to_string()));
    }

    // answer direction mirrors the offer per RFC 3264
    let direction = match offer.direction {
        MediaDirection::SendOnly => MediaDirection::RecvOnly,
        MediaDirection::RecvOnly => MediaDirection::SendOnly,
        other => other,
    };

    Ok(SdpSession {
        origin_user: "skylark".to_string(),
        session_id: offer.session_id.clone(),
        session_version: offer.session_version.clone(),
        connection: public_ip.to_string(),
        audio_port: rtp_port,
        payload_types,
        rtpmap,
        direction,
    })
}

/// Build a fresh offer towards a callee leg.
pub fn build_offer(public_ip: &str, rtp_port: u16, session_id: &str) -> SdpSession {
    SdpSession {
        origin_user: "skylark".to_string(),
        session_id: session_id.to_string(),
        session_version: "1".to_string(),
        connection: public_ip.to_string(),
        audio_port: rtp_port,
        payload_types: vec![0, 8, 101],
        rtpmap: vec![
            (0, "PCMU/8000".to_string()),
            (8, "PCMA/8000".to_string()),
            (101, "telephone-event/8000".to_string()),
        ],
        direction: MediaDirection::SendRecv,
    }
}
