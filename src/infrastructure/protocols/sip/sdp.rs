//! SDP offer for GB28181 stream requests
//!
//! The gateway never carries media itself. The offer points the device at
//! the media server (`c=`/`m=`) and tags the stream with the SSRC the media
//! server allocated (`y=`).

/// Live play or recorded playback of a time range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    Play,
    Playback { start: i64, end: i64 },
}

impl PlayMode {
    /// `start == 0` selects live play.
    pub fn from_range(start: i64, end: i64) -> Self {
        if start == 0 {
            PlayMode::Play
        } else {
            PlayMode::Playback { start, end }
        }
    }

    pub fn session_name(&self) -> &'static str {
        match self {
            PlayMode::Play => "Play",
            PlayMode::Playback { .. } => "Playback",
        }
    }

    /// SSRC carried in `y=`: the media server's channel number behind a
    /// `0` (live) or `1` (playback) prefix.
    pub fn ssrc(&self, allocated: u32) -> String {
        match self {
            PlayMode::Play => format!("0{}", allocated),
            PlayMode::Playback { .. } => format!("1{}", allocated),
        }
    }

    /// Path the media server publishes the stream under
    pub fn stream_path(&self, channel_id: &str) -> String {
        match self {
            PlayMode::Play => channel_id.to_string(),
            PlayMode::Playback { start, end } => format!("{}/{}-{}", channel_id, start, end),
        }
    }

    fn time_range(&self) -> (i64, i64) {
        match self {
            PlayMode::Play => (0, 0),
            PlayMode::Playback { start, end } => (*start, *end),
        }
    }
}

/// Parameters of one INVITE offer
#[derive(Debug, Clone)]
pub struct InviteOffer<'a> {
    pub serial: &'a str,
    pub channel_id: &'a str,
    pub media_ip: &'a str,
    pub media_port: u16,
    pub mode: PlayMode,
    pub ssrc: &'a str,
}

impl InviteOffer<'_> {
    pub fn to_sdp(&self) -> String {
        let (start, end) = self.mode.time_range();
        let lines = [
            "v=0".to_string(),
            format!("o={} 0 0 IN IP4 {}", self.serial, self.media_ip),
            format!("s={}", self.mode.session_name()),
            format!("u={}:0", self.channel_id),
            format!("c=IN IP4 {}", self.media_ip),
            format!("t={} {}", start, end),
            format!("m=video {} RTP/AVP 96 97 98", self.media_port),
            "a=recvonly".to_string(),
            "a=rtpmap:96 PS/90000".to_string(),
            "a=rtpmap:97 MPEG4/90000".to_string(),
            "a=rtpmap:98 H264/90000".to_string(),
            format!("y={}", self.ssrc),
        ];
        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    /// `Subject` header: `<channel>:<ssrc>,<platform>:0`
    pub fn subject(&self) -> String {
        format!("{}:{},{}:0", self.channel_id, self.ssrc, self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(mode: PlayMode, ssrc: &str) -> String {
        InviteOffer {
            serial: "34020000002000000001",
            channel_id: "34020000001320000011",
            media_ip: "10.0.0.5",
            media_port: 9000,
            mode,
            ssrc,
        }
        .to_sdp()
    }

    #[test]
    fn test_live_offer() {
        let mode = PlayMode::from_range(0, 0);
        let ssrc = mode.ssrc(1234);
        assert_eq!(ssrc, "01234");
        let sdp = offer(mode, &ssrc);
        assert!(sdp.starts_with("v=0\r\no=34020000002000000001 0 0 IN IP4 10.0.0.5\r\ns=Play\r\n"));
        assert!(sdp.contains("t=0 0\r\n"));
        assert!(sdp.contains("m=video 9000 RTP/AVP 96 97 98\r\n"));
        assert!(sdp.ends_with("y=01234\r\n"));
        assert_eq!(mode.stream_path("34020000001320000011"), "34020000001320000011");
    }

    #[test]
    fn test_playback_offer() {
        let mode = PlayMode::from_range(1_700_000_000, 1_700_000_600);
        let ssrc = mode.ssrc(7);
        assert_eq!(ssrc, "17");
        let sdp = offer(mode, &ssrc);
        assert!(sdp.contains("s=Playback\r\n"));
        assert!(sdp.contains("t=1700000000 1700000600\r\n"));
        assert_eq!(
            mode.stream_path("34020000001320000011"),
            "34020000001320000011/1700000000-1700000600"
        );
    }
}
