use std::io::Read;
use std::path::Path;
use crate::media::VideoCodec;

/// How many leading bytes to scan for a video sample-entry fourcc.
/// The `stsd` sample description sits in the `moov` box, which capture
/// devices write at the front of the file.
const SNIFF_WINDOW: usize = 64 * 1024;

/// Determine the video codec of a media file by scanning its leading bytes
/// for MP4 sample-entry fourccs.
///
/// `hvc1`/`hev1` mark HEVC tracks, `avc1`/`avc3` mark AVC tracks. Files
/// carrying neither are reported as [`VideoCodec::Unknown`] and are never
/// candidates for transcoding.
pub fn sniff_codec(path: &Path) -> std::io::Result<VideoCodec> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(sniff_codec_bytes(&buf[..filled]))
}

/// Scan a byte window for a known video sample-entry fourcc. The earliest
/// match wins, so a file whose first video track is HEVC is classified as
/// HEVC even if a fallback AVC track follows it.
pub fn sniff_codec_bytes(data: &[u8]) -> VideoCodec {
    let hevc = earliest_match(data, &[b"hvc1", b"hev1"]);
    let avc = earliest_match(data, &[b"avc1", b"avc3"]);
    match (hevc, avc) {
        (Some(h), Some(a)) if h <= a => VideoCodec::Hevc,
        (Some(_), None) => VideoCodec::Hevc,
        (_, Some(_)) => VideoCodec::Avc,
        (None, None) => VideoCodec::Unknown,
    }
}

fn earliest_match(data: &[u8], needles: &[&[u8]]) -> Option<usize> {
    needles
        .iter()
        .filter_map(|needle| {
            data.windows(needle.len()).position(|window| window == *needle)
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffs_hevc_sample_entry() {
        let data = b"\x00\x00\x00\x20ftypisom....moov....stsd....hvc1 payload";
        assert_eq!(sniff_codec_bytes(data), VideoCodec::Hevc);
    }

    #[test]
    fn test_sniffs_avc_sample_entry() {
        let data = b"\x00\x00\x00\x20ftypisom....moov....stsd....avc1 payload";
        assert_eq!(sniff_codec_bytes(data), VideoCodec::Avc);
    }

    #[test]
    fn test_first_video_track_wins() {
        let data = b"....hvc1........avc1....";
        assert_eq!(sniff_codec_bytes(data), VideoCodec::Hevc);
        let data = b"....avc1........hev1....";
        assert_eq!(sniff_codec_bytes(data), VideoCodec::Avc);
    }

    #[test]
    fn test_unknown_without_fourcc() {
        assert_eq!(sniff_codec_bytes(b"not a video at all"), VideoCodec::Unknown);
        assert_eq!(sniff_codec_bytes(b""), VideoCodec::Unknown);
    }
}
