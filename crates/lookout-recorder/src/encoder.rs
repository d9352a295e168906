use lookout_capture::CaptureSource;

/// A container/codec combination the recorder can ask a capture source to
/// produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingProfile {
    pub container: &'static str,
    pub codec: &'static str,
    /// Full mime string probed against the source, e.g.
    /// `video/webm;codecs=vp9`.
    pub mime: &'static str,
}

const MP4_H264: EncodingProfile = EncodingProfile {
    container: "mp4",
    codec: "h264",
    mime: "video/mp4;codecs=avc1.42E01E",
};
const WEBM_VP9: EncodingProfile = EncodingProfile {
    container: "webm",
    codec: "vp9",
    mime: "video/webm;codecs=vp9",
};
const WEBM_VP8: EncodingProfile = EncodingProfile {
    container: "webm",
    codec: "vp8",
    mime: "video/webm;codecs=vp8",
};

/// Platform-prioritized list of video profiles. macOS encoders favor mp4,
/// everything else webm.
pub fn video_priorities() -> &'static [EncodingProfile] {
    #[cfg(target_os = "macos")]
    {
        &[MP4_H264, WEBM_VP9, WEBM_VP8]
    }
    #[cfg(not(target_os = "macos"))]
    {
        &[WEBM_VP9, WEBM_VP8, MP4_H264]
    }
}

/// Probe the prioritized profile list against the source and pick the first
/// supported combination. `None` means the kind cannot be recorded on this
/// platform; the caller degrades gracefully.
pub fn negotiate(source: &dyn CaptureSource) -> Option<EncodingProfile> {
    video_priorities()
        .iter()
        .copied()
        .find(|p| source.supports(p.mime))
}
