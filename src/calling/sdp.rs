//! Minimal audio-only SDP for the UDP ICE transport.
//!
//! Writes one bundled `m=audio` section carrying ICE credentials, the Opus
//! rtpmap of the local media source and the candidates gathered so far.
//! Parsing extracts only what ICE needs from the remote side.

use std::net::IpAddr;

use super::ice::{Candidate, IceCredentials};
use super::transport::{LocalMedia, TransportError};

/// DTLS-style setup role advertised in the description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    ActPass,
    Active,
}

impl Setup {
    fn as_str(self) -> &'static str {
        match self {
            Self::ActPass => "actpass",
            Self::Active => "active",
        }
    }
}

/// Inputs for `build_audio_sdp`.
pub struct AudioSdp<'a> {
    pub session_id: u64,
    pub version: u64,
    pub address: IpAddr,
    pub credentials: &'a IceCredentials,
    pub setup: Setup,
    pub media: &'a LocalMedia,
    pub candidates: &'a [Candidate],
    /// Append `a=end-of-candidates` once gathering is complete.
    pub complete: bool,
}

pub fn build_audio_sdp(p: &AudioSdp<'_>) -> String {
    let ip_version = if p.address.is_ipv4() { "IP4" } else { "IP6" };
    let port = p.candidates.first().map(|c| c.addr.port()).unwrap_or(9);
    let media = p.media;

    let mut sdp = String::with_capacity(512);
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN {} {}\r\n",
        p.session_id, p.version, ip_version, p.address
    ));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=group:BUNDLE 0\r\n");
    sdp.push_str(&format!("a=msid-semantic: WMS {}\r\n", media.stream_id));
    sdp.push_str(&format!("m=audio {} RTP/AVP {}\r\n", port, media.payload_type));
    sdp.push_str(&format!("c=IN {} {}\r\n", ip_version, p.address));
    sdp.push_str("a=mid:0\r\n");
    sdp.push_str(&format!("a=ice-ufrag:{}\r\n", p.credentials.ufrag));
    sdp.push_str(&format!("a=ice-pwd:{}\r\n", p.credentials.pwd));
    sdp.push_str("a=ice-options:trickle\r\n");
    sdp.push_str(&format!("a=setup:{}\r\n", p.setup.as_str()));
    sdp.push_str("a=sendrecv\r\n");
    sdp.push_str("a=rtcp-mux\r\n");
    sdp.push_str(&format!(
        "a=rtpmap:{} {}/{}/{}\r\n",
        media.payload_type, media.codec, media.clock_rate, media.channels
    ));
    sdp.push_str(&format!("a=msid:{} audio\r\n", media.stream_id));
    for candidate in p.candidates {
        sdp.push_str(&format!("a={}\r\n", candidate));
    }
    if p.complete {
        sdp.push_str("a=end-of-candidates\r\n");
    }
    sdp
}

/// What the transport needs from a remote description.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSdp {
    pub credentials: IceCredentials,
    pub candidates: Vec<Candidate>,
}

/// Extract ICE credentials and usable candidates from the audio section.
///
/// Candidates this transport can't use are skipped. A description without an
/// audio section or without ICE credentials is malformed.
pub fn parse_remote_sdp(sdp: &str) -> Result<RemoteSdp, TransportError> {
    let malformed = |why: &str| TransportError::MalformedDescription(why.to_string());

    if !sdp.trim_start().starts_with("v=0") {
        return Err(malformed("missing v=0 line"));
    }

    let mut in_session = true;
    let mut in_audio = false;
    let mut seen_audio = false;
    let mut session_creds = (None, None);
    let mut audio_creds = (None, None);
    let mut candidates = Vec::new();

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            in_session = false;
            in_audio = media.starts_with("audio") && !seen_audio;
            seen_audio |= in_audio;
            continue;
        }
        let creds = match (in_session, in_audio) {
            (true, _) => &mut session_creds,
            (_, true) => &mut audio_creds,
            _ => continue,
        };
        if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            creds.0 = Some(ufrag.to_string());
        } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
            creds.1 = Some(pwd.to_string());
        } else if in_audio && line.starts_with("a=candidate:") {
            match line.parse::<Candidate>() {
                Ok(c) if c.component == 1 => candidates.push(c),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping remote SDP candidate: {}", e),
            }
        }
    }

    if !seen_audio {
        return Err(malformed("no audio section"));
    }
    let ufrag = audio_creds.0.or(session_creds.0).ok_or_else(|| malformed("missing ice-ufrag"))?;
    let pwd = audio_creds.1.or(session_creds.1).ok_or_else(|| malformed("missing ice-pwd"))?;

    Ok(RemoteSdp {
        credentials: IceCredentials { ufrag, pwd },
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_sdp_parses_back() {
        let creds = IceCredentials::generate();
        let media = LocalMedia::opus("stream-1");
        let host = Candidate::host("192.168.1.10:40000".parse().unwrap());
        let sdp = build_audio_sdp(&AudioSdp {
            session_id: 42,
            version: 2,
            address: "192.168.1.10".parse().unwrap(),
            credentials: &creds,
            setup: Setup::ActPass,
            media: &media,
            candidates: std::slice::from_ref(&host),
            complete: true,
        });

        assert!(sdp.starts_with("v=0\r\no=- 42 2 IN IP4 192.168.1.10\r\n"));
        assert!(sdp.contains("m=audio 40000 RTP/AVP 111\r\n"));
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(sdp.contains("a=setup:actpass\r\n"));
        assert!(sdp.ends_with("a=end-of-candidates\r\n"));

        let remote = parse_remote_sdp(&sdp).unwrap();
        assert_eq!(remote.credentials, creds);
        assert_eq!(remote.candidates, vec![host]);
    }

    #[test]
    fn test_parse_browser_offer() {
        let sdp = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
a=ice-ufrag:sess\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:EsAw\r\n\
a=ice-pwd:P+/aaaaaaaaaaaaaaaaaaaaa\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.23 54400 typ host generation 0\r\n\
a=candidate:2 1 tcp 1518280447 192.168.1.23 9 typ host tcptype active\r\n\
a=candidate:3 2 udp 2122260222 192.168.1.23 54401 typ host\r\n\
a=candidate:4 1 udp 1686052607 203.0.113.7 61000 typ srflx raddr 192.168.1.23 rport 54400\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=candidate:5 1 udp 2122260223 192.168.1.23 54500 typ host\r\n";

        let remote = parse_remote_sdp(sdp).unwrap();
        assert_eq!(remote.credentials.ufrag, "EsAw");
        assert_eq!(remote.candidates.len(), 2);
        assert_eq!(remote.candidates[0].addr.port(), 54400);
        assert_eq!(remote.candidates[1].addr.port(), 61000);
    }

    #[test]
    fn test_session_level_credentials_fallback() {
        let sdp = "v=0\r\na=ice-ufrag:abcd\r\na=ice-pwd:0123456789012345678901\r\nm=audio 9 RTP/AVP 111\r\n";
        let remote = parse_remote_sdp(sdp).unwrap();
        assert_eq!(remote.credentials.ufrag, "abcd");
        assert!(remote.candidates.is_empty());
    }

    #[test]
    fn test_malformed_descriptions() {
        for sdp in [
            "",
            "not sdp at all",
            "v=0\r\nm=video 9 RTP/AVP 96\r\na=ice-ufrag:x\r\na=ice-pwd:y\r\n",
            "v=0\r\nm=audio 9 RTP/AVP 111\r\na=ice-pwd:y\r\n",
        ] {
            assert!(
                matches!(parse_remote_sdp(sdp), Err(TransportError::MalformedDescription(_))),
                "accepted {sdp:?}"
            );
        }
    }
}
