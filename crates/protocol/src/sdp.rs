use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Audio SSRC the camera firmware matches literally.
pub const FIXED_AUDIO_SSRC: u32 = 229_236_353;
/// Video SSRC the camera firmware matches literally.
pub const FIXED_VIDEO_SSRC: u32 = 1_607_797_317;

/// Placeholder RTP port used in the offer so the media server picks its own.
pub const DYNAMIC_PORT: u16 = 9;

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("rewritten SDP missing required attributes: {0}")]
    MissingAttributes(String),
}

/// Fixed values the camera firmware requires in the negotiated SDP.
/// Created once per stream session, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorSdpMetadata {
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub cname: String,
    pub audio_port: u16,
    pub video_port: u16,
}

impl VendorSdpMetadata {
    /// Generate session metadata: the two fixed SSRCs plus a fresh CNAME of
    /// the shape `user{10 digits}@host-{8 hex}` the firmware expects.
    pub fn generate(audio_port: u16, video_port: u16) -> Self {
        let mut rng = rand::thread_rng();
        let user_id: u64 = rng.gen_range(1_000_000_000..=9_999_999_999);
        let host_id = Uuid::new_v4().simple().to_string();
        Self {
            audio_ssrc: FIXED_AUDIO_SSRC,
            video_ssrc: FIXED_VIDEO_SSRC,
            cname: format!("user{}@host-{}", user_id, &host_id[..8]),
            audio_port,
            video_port,
        }
    }
}

/// Build the camera-facing SDP offer submitted to the media server.
///
/// The connection line stays `0.0.0.0` so the media server routes RTCP by
/// where RTP actually arrives from instead of deriving a route from the
/// advertised address. The answer sent to the camera carries the real IP
/// (see [`rewrite_answer`]).
pub fn build_offer(meta: &VendorSdpMetadata) -> String {
    let mut rng = rand::thread_rng();
    let session_id: u64 = rng.gen_range(1_000_000_000..=9_999_999_999);
    let session_version: u64 = rng.gen_range(1_000_000_000..=9_999_999_999);

    let lines = [
        "v=0".to_string(),
        format!("o=- {session_id} {session_version} IN IP4 0.0.0.0"),
        "s=Camera Livestream".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        "t=0 0".to_string(),
        // Audio: bidirectional, opus preferred with PCMU fallback
        format!("m=audio {} RTP/AVPF 96 0", meta.audio_port),
        format!("a=rtcp:{}", meta.audio_port + 1),
        "a=rtpmap:96 opus/48000/2".to_string(),
        "a=rtpmap:0 PCMU/8000".to_string(),
        "a=sendrecv".to_string(),
        // Offer must be active so the answer comes back passive (REMB)
        "a=direction:active".to_string(),
        format!("a=ssrc:{} cname:{}", meta.audio_ssrc, meta.cname),
        // Video: camera sends only
        format!("m=video {} RTP/AVPF 103", meta.video_port),
        format!("a=rtcp:{}", meta.video_port + 1),
        "a=rtpmap:103 H264/90000".to_string(),
        "a=fmtp:103 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        "a=rtcp-fb:103 nack".to_string(),
        "a=rtcp-fb:103 nack pli".to_string(),
        "a=rtcp-fb:103 goog-remb".to_string(),
        "a=rtcp-fb:103 ccm fir".to_string(),
        "a=sendonly".to_string(),
        "a=direction:active".to_string(),
        format!("a=ssrc:{} cname:{}", meta.video_ssrc, meta.cname),
    ];

    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    sdp
}

/// Whether the media server's answer advertises `a=direction:passive`.
/// Without it the server will not emit REMB feedback toward the camera.
pub fn answer_supports_remb(answer: &str) -> bool {
    answer.contains("a=direction:passive")
}

/// Rewrite the media server's answer into the SDP the camera accepts:
///
/// 1. Replace the first `a=ssrc:` of the audio and video sections with the
///    fixed vendor SSRCs and every `cname:` value with the session CNAME.
/// 2. Append the three trailing `x-skl-*` vendor attributes.
/// 3. Substitute every IPv4 literal with the selected external IP.
/// 4. Insert `a=direction:passive` after `a=recvonly` in the video section.
///
/// Direction attributes are otherwise left exactly as the server produced
/// them; the firmware rejects reordered output.
pub fn rewrite_answer(answer: &str, external_ip: &str, meta: &VendorSdpMetadata) -> String {
    let rewritten = substitute_ssrcs_and_cname(answer, meta);
    let rewritten = append_vendor_attributes(&rewritten, meta);
    let rewritten = replace_ipv4_literals(&rewritten, external_ip);
    insert_passive_direction(&rewritten)
}

/// Check the rewritten SDP for everything the camera firmware verifies.
pub fn validate_rewritten(sdp: &str) -> Result<(), SdpError> {
    const REQUIRED: [&str; 7] = [
        "goog-remb",
        "a=x-skl-ssrca:",
        "a=x-skl-ssrcv:",
        "a=x-skl-cname:",
        "m=audio",
        "m=video",
        "H264",
    ];
    let missing: Vec<&str> = REQUIRED
        .iter()
        .filter(|needle| !sdp.contains(*needle))
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SdpError::MissingAttributes(missing.join(", ")))
    }
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Audio,
    Video,
}

fn substitute_ssrcs_and_cname(sdp: &str, meta: &VendorSdpMetadata) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut section = Section::Preamble;
    let mut audio_ssrc_done = false;
    let mut video_ssrc_done = false;

    for line in sdp.split("\r\n") {
        if line.starts_with("m=audio") {
            section = Section::Audio;
        } else if line.starts_with("m=video") {
            section = Section::Video;
        } else if line.starts_with("m=") {
            section = Section::Preamble;
        }

        let mut line = line.to_string();
        if line.starts_with("a=ssrc:") {
            match section {
                Section::Audio if !audio_ssrc_done => {
                    line = replace_ssrc_value(&line, meta.audio_ssrc);
                    audio_ssrc_done = true;
                }
                Section::Video if !video_ssrc_done => {
                    line = replace_ssrc_value(&line, meta.video_ssrc);
                    video_ssrc_done = true;
                }
                _ => {}
            }
        }
        out.push(replace_cname_values(&line, &meta.cname));
    }

    out.join("\r\n")
}

fn replace_ssrc_value(line: &str, ssrc: u32) -> String {
    let tail = &line["a=ssrc:".len()..];
    let digits_end = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    format!("a=ssrc:{}{}", ssrc, &tail[digits_end..])
}

fn replace_cname_values(line: &str, cname: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find("cname:") {
        let value_start = pos + "cname:".len();
        out.push_str(&rest[..value_start]);
        out.push_str(cname);
        let tail = &rest[value_start..];
        let value_end = tail
            .find(|c: char| c.is_whitespace())
            .unwrap_or(tail.len());
        rest = &tail[value_end..];
    }
    out.push_str(rest);
    out
}

fn append_vendor_attributes(sdp: &str, meta: &VendorSdpMetadata) -> String {
    let mut out = sdp.to_string();
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    // Appended verbatim and in this order; the last line carries no
    // terminator, matching what the firmware parses.
    out.push_str(&format!("a=x-skl-ssrca:{}\r\n", meta.audio_ssrc));
    out.push_str(&format!("a=x-skl-ssrcv:{}\r\n", meta.video_ssrc));
    out.push_str(&format!("a=x-skl-cname:{}", meta.cname));
    out
}

/// Substitute every dotted-quad literal in the SDP with `replacement`,
/// scanning left to right.
fn replace_ipv4_literals(input: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(|c: char| c.is_ascii_digit()) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if let Some(len) = match_ipv4(rest.as_bytes()) {
            out.push_str(replacement);
            rest = &rest[len..];
        } else {
            out.push_str(&rest[..1]);
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Match `d{1,3}.d{1,3}.d{1,3}.d{1,3}` at the start of `bytes`, returning the
/// matched length.
fn match_ipv4(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    for octet in 0..4 {
        let start = i;
        while i < bytes.len() && i - start < 3 && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return None;
        }
        if octet < 3 {
            if i < bytes.len() && bytes[i] == b'.' {
                i += 1;
            } else {
                return None;
            }
        }
    }
    Some(i)
}

fn insert_passive_direction(sdp: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_video = false;
    let mut inserted = false;

    for line in sdp.split("\r\n") {
        if line.starts_with("m=video") {
            in_video = true;
            inserted = false;
        } else if line.starts_with("m=") {
            in_video = false;
        }
        out.push(line);
        if in_video && line == "a=recvonly" && !inserted {
            out.push("a=direction:passive");
            inserted = true;
        }
    }

    out.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> VendorSdpMetadata {
        VendorSdpMetadata {
            audio_ssrc: FIXED_AUDIO_SSRC,
            video_ssrc: FIXED_VIDEO_SSRC,
            cname: "user1234567890@host-deadbeef".to_string(),
            audio_port: DYNAMIC_PORT,
            video_port: DYNAMIC_PORT,
        }
    }

    /// A representative answer as the media server's RtpEndpoint produces it.
    fn sample_answer() -> String {
        [
            "v=0",
            "o=- 3923422 3923422 IN IP4 192.168.199.173",
            "s=Kurento Media Server",
            "c=IN IP4 192.168.199.173",
            "t=0 0",
            "m=audio 32414 RTP/AVPF 96 0",
            "a=rtpmap:96 opus/48000/2",
            "a=sendrecv",
            "a=direction:passive",
            "a=rtcp:32415",
            "a=ssrc:981263540 cname:user123@host-abc",
            "m=video 43210 RTP/AVPF 103",
            "a=rtpmap:103 H264/90000",
            "a=rtcp-fb:103 nack",
            "a=rtcp-fb:103 nack pli",
            "a=rtcp-fb:103 goog-remb",
            "a=rtcp-fb:103 ccm fir",
            "a=recvonly",
            "a=direction:passive",
            "a=rtcp:43211",
            "a=ssrc:112233445 cname:user123@host-abc",
            "",
        ]
        .join("\r\n")
    }

    #[test]
    fn generated_cname_has_vendor_shape() {
        let meta = VendorSdpMetadata::generate(9, 9);
        let (user, host) = meta.cname.split_once('@').expect("cname has @");
        assert!(user.starts_with("user"));
        assert_eq!(user.len(), "user".len() + 10);
        assert!(user["user".len()..].chars().all(|c| c.is_ascii_digit()));
        assert!(host.starts_with("host-"));
        assert_eq!(host.len(), "host-".len() + 8);
        assert!(host["host-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_uses_fixed_ssrcs() {
        let meta = VendorSdpMetadata::generate(9, 9);
        assert_eq!(meta.audio_ssrc, 229236353);
        assert_eq!(meta.video_ssrc, 1607797317);
    }

    #[test]
    fn offer_contains_exact_media_lines() {
        let meta = test_meta();
        let offer = build_offer(&meta);

        assert!(offer.starts_with("v=0\r\n"));
        assert!(offer.ends_with("\r\n"));
        assert!(offer.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(offer.contains("m=audio 9 RTP/AVPF 96 0\r\n"));
        assert!(offer.contains("a=rtcp:10\r\n"));
        assert!(offer.contains("a=rtpmap:96 opus/48000/2\r\n"));
        assert!(offer.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(offer.contains("a=sendrecv\r\n"));
        assert!(offer.contains("m=video 9 RTP/AVPF 103\r\n"));
        assert!(offer.contains("a=rtpmap:103 H264/90000\r\n"));
        assert!(offer.contains(
            "a=fmtp:103 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n"
        ));
        assert!(offer.contains("a=rtcp-fb:103 goog-remb\r\n"));
        assert!(offer.contains("a=sendonly\r\n"));
        assert!(offer.contains(&format!(
            "a=ssrc:229236353 cname:{}\r\n",
            meta.cname
        )));
        assert!(offer.contains(&format!(
            "a=ssrc:1607797317 cname:{}\r\n",
            meta.cname
        )));
        // Both sections declare the active direction
        assert_eq!(offer.matches("a=direction:active\r\n").count(), 2);
        // No LF without a preceding CR
        assert!(!offer.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn offer_never_leaks_a_routable_ip() {
        let offer = build_offer(&test_meta());
        for line in offer.split("\r\n") {
            if line.starts_with("c=") || line.starts_with("o=") {
                assert!(line.contains("0.0.0.0"), "unexpected IP in {line:?}");
            }
        }
    }

    #[test]
    fn rewrite_substitutes_fixed_ssrcs_and_cname() {
        let meta = test_meta();
        let out = rewrite_answer(&sample_answer(), "203.0.113.5", &meta);

        assert!(out.contains(&format!("a=ssrc:229236353 cname:{}", meta.cname)));
        assert!(out.contains(&format!("a=ssrc:1607797317 cname:{}", meta.cname)));
        // The server's own SSRC values are gone
        assert!(!out.contains("981263540"));
        assert!(!out.contains("112233445"));
        assert!(!out.contains("host-abc"));
    }

    #[test]
    fn rewrite_appends_vendor_attributes_last() {
        let meta = test_meta();
        let out = rewrite_answer(&sample_answer(), "203.0.113.5", &meta);

        assert!(out.contains("a=x-skl-ssrca:229236353\r\n"));
        assert!(out.contains("a=x-skl-ssrcv:1607797317\r\n"));
        assert!(out.ends_with(&format!("a=x-skl-cname:{}", meta.cname)));
    }

    #[test]
    fn rewrite_replaces_every_ip_with_selected_external_ip() {
        let out = rewrite_answer(&sample_answer(), "203.0.113.5", &test_meta());
        assert!(!out.contains("192.168.199.173"));
        assert_eq!(out.matches("203.0.113.5").count(), 2);
    }

    #[test]
    fn rewrite_inserts_passive_direction_in_video_section_only() {
        let answer = [
            "v=0",
            "m=audio 1000 RTP/AVPF 96",
            "a=recvonly",
            "a=ssrc:1 cname:x",
            "m=video 2000 RTP/AVPF 103",
            "a=rtcp-fb:103 goog-remb",
            "a=recvonly",
            "a=ssrc:2 cname:x",
            "",
        ]
        .join("\r\n");
        let out = rewrite_answer(&answer, "203.0.113.5", &test_meta());

        let lines: Vec<&str> = out.split("\r\n").collect();
        let video_at = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        let passive_at = lines
            .iter()
            .position(|l| *l == "a=direction:passive")
            .unwrap();
        assert!(passive_at > video_at, "passive belongs to the video section");
        assert_eq!(lines[passive_at - 1], "a=recvonly");
        assert_eq!(out.matches("a=direction:passive").count(), 1);
    }

    #[test]
    fn rewritten_sample_passes_validation() {
        let out = rewrite_answer(&sample_answer(), "203.0.113.5", &test_meta());
        validate_rewritten(&out).expect("rewritten SDP should validate");
    }

    #[test]
    fn validation_names_missing_attributes() {
        let err = validate_rewritten("v=0\r\nm=audio 9 RTP/AVPF 96\r\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("goog-remb"));
        assert!(msg.contains("a=x-skl-cname:"));
        assert!(msg.contains("m=video"));
        assert!(!msg.contains("m=audio,"));
    }

    #[test]
    fn json_envelope_round_trip_is_byte_identical() {
        // CRLFs must not be pre-escaped; the JSON encoder escapes and the
        // camera's decoder restores them.
        let meta = test_meta();
        let sdp = rewrite_answer(&sample_answer(), "203.0.113.5", &meta);

        let payload = serde_json::json!({ "sdpOffer": sdp });
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\\r\\n"));
        assert!(!encoded.contains("\\\\r"));

        let decoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["sdpOffer"].as_str().unwrap(), sdp);
    }

    #[test]
    fn ipv4_replacement_handles_adjacent_digits() {
        assert_eq!(
            replace_ipv4_literals("c=IN IP4 10.0.0.1", "203.0.113.5"),
            "c=IN IP4 203.0.113.5"
        );
        // Long leading run: the match starts where four octets line up
        assert_eq!(
            replace_ipv4_literals("x1234.1.2.3", "9.9.9.9"),
            "x19.9.9.9"
        );
        assert_eq!(replace_ipv4_literals("a=rtcp:32415", "9.9.9.9"), "a=rtcp:32415");
        assert_eq!(replace_ipv4_literals("t=0 0", "9.9.9.9"), "t=0 0");
    }

    #[test]
    fn remb_support_detected_from_answer() {
        assert!(answer_supports_remb(&sample_answer()));
        assert!(!answer_supports_remb("v=0\r\nm=video 1 RTP/AVPF 103\r\n"));
    }
}
