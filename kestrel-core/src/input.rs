//! Input source descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Device used when a generic camera keyword is given.
pub const DEFAULT_CAMERA_DEVICE: &str = "video=0";

const CAMERA_KEYWORDS: &[&str] = &["camera", "cam", "webcam"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm", "m4v"];

/// Where frames come from. Capture itself is done by a frame source;
/// this only names and classifies the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "lowercase")]
pub enum InputSource {
    File(PathBuf),
    Camera(String),
    Rtsp(String),
    Rtmp(String),
    Screen,
}

impl InputSource {
    /// Classify a user supplied input string.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();

        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            return InputSource::Rtsp(trimmed.to_string());
        }
        if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
            return InputSource::Rtmp(trimmed.to_string());
        }
        if lower == "screen" || lower == "desktop" {
            return InputSource::Screen;
        }
        if CAMERA_KEYWORDS.contains(&lower.as_str()) {
            return InputSource::Camera(DEFAULT_CAMERA_DEVICE.to_string());
        }
        if lower.starts_with("video=") || lower.starts_with("/dev/video") {
            return InputSource::Camera(trimmed.to_string());
        }
        InputSource::File(PathBuf::from(trimmed))
    }

    /// Live sources never end on their own.
    pub fn is_stream(&self) -> bool {
        !matches!(self, InputSource::File(_))
    }

    /// True when the source is a file with a known video extension.
    pub fn is_video_file(&self) -> bool {
        match self {
            InputSource::File(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InputSource::File(_) => "file",
            InputSource::Camera(_) => "camera",
            InputSource::Rtsp(_) => "rtsp",
            InputSource::Rtmp(_) => "rtmp",
            InputSource::Screen => "screen",
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::File(path) => write!(f, "file:{}", path.display()),
            InputSource::Camera(device) => write!(f, "camera:{}", device),
            InputSource::Rtsp(url) | InputSource::Rtmp(url) => f.write_str(url),
            InputSource::Screen => f.write_str("screen"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_streams() {
        assert_eq!(
            InputSource::parse("rtsp://10.0.0.2:554/live"),
            InputSource::Rtsp("rtsp://10.0.0.2:554/live".to_string())
        );
        assert_eq!(
            InputSource::parse("RTMP://host/app/key"),
            InputSource::Rtmp("RTMP://host/app/key".to_string())
        );
        assert_eq!(InputSource::parse("screen"), InputSource::Screen);
    }

    #[test]
    fn test_parse_camera_keywords() {
        for kw in ["camera", "Cam", "WEBCAM"] {
            assert_eq!(InputSource::parse(kw), InputSource::Camera(DEFAULT_CAMERA_DEVICE.to_string()));
        }
        assert_eq!(
            InputSource::parse("/dev/video2"),
            InputSource::Camera("/dev/video2".to_string())
        );
    }

    #[test]
    fn test_parse_files() {
        let src = InputSource::parse("clips/street.MP4");
        assert!(src.is_video_file());
        assert!(!src.is_stream());
        assert_eq!(src.kind(), "file");

        let img = InputSource::parse("photo.jpg");
        assert!(!img.is_video_file());
        assert!(InputSource::Screen.is_stream());
    }
}
