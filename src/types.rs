//! Frame and stream configuration types shared by providers and backends.

use crate::errors::DeviceError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Video stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoFormat {
    None,
    H264,
    H265,
    Jpeg,
    Yuv,
    Bayer,
    Ivs,
    Raw,
    Rgba,
    Rgb,
    PlanarRgb,
}

impl VideoFormat {
    /// H.264, H.265 and JPEG are encoded formats.
    pub fn is_encoded(&self) -> bool {
        matches!(self, VideoFormat::H264 | VideoFormat::H265 | VideoFormat::Jpeg)
    }

    /// Encoded formats with inter-frame prediction.
    pub fn is_motion_encoded(&self) -> bool {
        self.is_encoded() && *self != VideoFormat::Jpeg
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            VideoFormat::None => 0,
            VideoFormat::H264 => 1,
            VideoFormat::H265 => 2,
            VideoFormat::Jpeg => 3,
            VideoFormat::Yuv => 4,
            VideoFormat::Bayer => 5,
            VideoFormat::Ivs => 6,
            VideoFormat::Raw => 7,
            VideoFormat::Rgba => 8,
            VideoFormat::Rgb => 9,
            VideoFormat::PlanarRgb => 10,
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoFormat::None => "none",
            VideoFormat::H264 => "h264",
            VideoFormat::H265 => "h265",
            VideoFormat::Jpeg => "jpeg",
            VideoFormat::Yuv => "yuv",
            VideoFormat::Bayer => "bayer",
            VideoFormat::Ivs => "ivs",
            VideoFormat::Raw => "raw",
            VideoFormat::Rgba => "rgba",
            VideoFormat::Rgb => "rgb",
            VideoFormat::PlanarRgb => "planar_rgb",
        };
        f.write_str(name)
    }
}

/// Type of a single frame delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    None,
    H264Sps,
    H264Pps,
    H264Sei,
    H264Idr,
    H264I,
    H264P,
    H264B,
    H265Sps,
    H265Pps,
    H265Vps,
    H265Sei,
    H265Idr,
    H265I,
    H265P,
    H265B,
    Jpeg,
    Yuv,
    Raw,
    Rgba,
    Rgb,
    PlanarRgb,
}

impl FrameType {
    /// Frames that can seed decoding on their own.
    pub fn is_key_frame(&self) -> bool {
        matches!(
            self,
            FrameType::H264Idr
                | FrameType::H264I
                | FrameType::H265Idr
                | FrameType::H265I
                | FrameType::Jpeg
        )
    }

    pub fn format(&self) -> VideoFormat {
        match self {
            FrameType::H264Sps
            | FrameType::H264Pps
            | FrameType::H264Sei
            | FrameType::H264Idr
            | FrameType::H264I
            | FrameType::H264P
            | FrameType::H264B => VideoFormat::H264,
            FrameType::H265Sps
            | FrameType::H265Pps
            | FrameType::H265Vps
            | FrameType::H265Sei
            | FrameType::H265Idr
            | FrameType::H265I
            | FrameType::H265P
            | FrameType::H265B => VideoFormat::H265,
            FrameType::Jpeg => VideoFormat::Jpeg,
            FrameType::Yuv => VideoFormat::Yuv,
            FrameType::Raw => VideoFormat::Raw,
            FrameType::Rgba => VideoFormat::Rgba,
            FrameType::Rgb => VideoFormat::Rgb,
            FrameType::PlanarRgb => VideoFormat::PlanarRgb,
            FrameType::None => VideoFormat::None,
        }
    }

    pub fn is_encoded(&self) -> bool {
        self.format().is_encoded()
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::None => "None",
            FrameType::H264Sps => "H264SPS",
            FrameType::H264Pps => "H264PPS",
            FrameType::H264Sei => "H264SEI",
            FrameType::H264Idr => "H264IDR",
            FrameType::H264I => "H264I",
            FrameType::H264P => "H264P",
            FrameType::H264B => "H264B",
            FrameType::H265Sps => "H265SPS",
            FrameType::H265Pps => "H265PPS",
            FrameType::H265Vps => "H265VPS",
            FrameType::H265Sei => "H265SEI",
            FrameType::H265Idr => "H265IDR",
            FrameType::H265I => "H265I",
            FrameType::H265P => "H265P",
            FrameType::H265B => "H265B",
            FrameType::Jpeg => "JPEG",
            FrameType::Yuv => "YUV",
            FrameType::Raw => "RAW",
            FrameType::Rgba => "RGBA",
            FrameType::Rgb => "RGB",
            FrameType::PlanarRgb => "PlanarRGB",
        };
        f.write_str(name)
    }
}

/// Stream rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::None => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(format!("unsupported rotation: {other} (expected 0, 90, 180 or 270)")),
        }
    }
}

/// Buffer allocation strategy. Discriminants are the device codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    None = 0,
    Input = 1,
    External = 2,
    Explicit = 3,
    Infinite = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    None = 0,
    Cbr = 1,
    Vbr = 2,
    Mbr = 3,
    Abr = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlPriority {
    None = 0,
    Framerate = 1,
    Quality = 2,
    FullFramerate = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H264Profile {
    None = 0,
    Baseline = 1,
    Main = 2,
    High = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H265Profile {
    None = 0,
    Main = 1,
    Main10 = 2,
}

/// Zipstream GOP mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipGopMode {
    Fixed = 0,
    Dynamic = 1,
}

/// Zipstream framerate control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipFpsMode {
    Fixed = 0,
    Dynamic = 1,
}

/// Zipstream frame skip mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipSkipMode {
    Drop = 0,
    Empty = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipProfile {
    None = 0,
    Classic = 1,
    Storage = 2,
    Live = 3,
}

/// A single device setting produced from a [`StreamConfiguration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    U32(u32),
    Bool(bool),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::U32(v) => write!(f, "{v}"),
            SettingValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Sparse stream configuration.
///
/// Every field is optional. Only fields that are set are applied when a
/// device session is opened; the device keeps its own defaults for the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<VideoFormat>,
    /// How many in-flight buffers are desired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_strategy: Option<BufferStrategy>,
    /// Video input, 1-based.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<u32>,
    /// Video channel, 0 is the overview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
    /// Compression in the range 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal_flip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_flip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monochrome: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_gop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_bitrate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_framerate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_compression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qp_i: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qp_p: Option<u32>,
    /// Bitrate in bits per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control_mode: Option<RateControlMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control_priority: Option<RateControlPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gop_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h264_profile: Option<H264Profile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h265_profile: Option<H265Profile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_strength: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_max_gop_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_gop_mode: Option<ZipGopMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_fps_mode: Option<ZipFpsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_skip_mode: Option<ZipSkipMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_min_fps_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_min_fps_den: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_profile: Option<ZipProfile>,
    /// ABR target bitrate in bits per second. Used with `RateControlMode::Abr`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr_target_bitrate: Option<u32>,
    /// ABR retention time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr_retention_time: Option<u32>,
}

impl StreamConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: VideoFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = Some(fps);
        self
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn flip(mut self, horizontal: bool, vertical: bool) -> Self {
        self.horizontal_flip = Some(horizontal);
        self.vertical_flip = Some(vertical);
        self
    }

    pub fn gop_length(mut self, gop: u32) -> Self {
        self.gop_length = Some(gop);
        self
    }

    pub fn bitrate(mut self, bps: u32, mode: RateControlMode) -> Self {
        self.bitrate = Some(bps);
        self.rate_control_mode = Some(mode);
        self
    }

    pub fn h264_profile(mut self, profile: H264Profile) -> Self {
        self.h264_profile = Some(profile);
        self
    }

    pub fn h265_profile(mut self, profile: H265Profile) -> Self {
        self.h265_profile = Some(profile);
        self
    }

    /// Channel number used in log lines; 0 when unset.
    pub fn channel_or_default(&self) -> u32 {
        self.channel.unwrap_or(0)
    }

    /// Device settings for every field that is set, keyed the way video
    /// devices name them.
    pub fn settings(&self) -> Vec<(&'static str, SettingValue)> {
        let mut out = Vec::new();

        let mut u32_opt = |key: &'static str, value: Option<u32>| {
            if let Some(v) = value {
                out.push((key, SettingValue::U32(v)));
            }
        };
        u32_opt("format", self.format.map(|f| f.code()));
        u32_opt("buffer.count", self.buffer_count);
        u32_opt("buffer.strategy", self.buffer_strategy.map(|s| s as u32));
        u32_opt("input", self.input);
        u32_opt("channel", self.channel);
        u32_opt("width", self.width);
        u32_opt("height", self.height);
        u32_opt("framerate", self.framerate);
        u32_opt("compression", self.compression);
        u32_opt("rotation", self.rotation.map(u32::from));
        u32_opt("qp.i", self.qp_i);
        u32_opt("qp.p", self.qp_p);
        u32_opt("bitrate", self.bitrate);
        u32_opt("rc.mode", self.rate_control_mode.map(|m| m as u32));
        u32_opt("rc.prio", self.rate_control_priority.map(|p| p as u32));
        u32_opt("gop_length", self.gop_length);
        u32_opt("h264.profile", self.h264_profile.map(|p| p as u32));
        u32_opt("h265.profile", self.h265_profile.map(|p| p as u32));
        u32_opt("zip.strength", self.zip_strength);
        u32_opt("zip.max_gop_length", self.zip_max_gop_length);
        u32_opt("zip.gop_mode", self.zip_gop_mode.map(|m| m as u32));
        u32_opt("zip.fps_mode", self.zip_fps_mode.map(|m| m as u32));
        u32_opt("zip.skip_mode", self.zip_skip_mode.map(|m| m as u32));
        u32_opt("zip.min_fps_num", self.zip_min_fps_num);
        u32_opt("zip.min_fps_den", self.zip_min_fps_den);
        u32_opt("zip.profile", self.zip_profile.map(|p| p as u32));
        u32_opt("abr.target_bitrate", self.abr_target_bitrate);
        u32_opt("abr.retention_time", self.abr_retention_time);

        let mut bool_opt = |key: &'static str, value: Option<bool>| {
            if let Some(v) = value {
                out.push((key, SettingValue::Bool(v)));
            }
        };
        bool_opt("horizontal_flip", self.horizontal_flip);
        bool_opt("vertical_flip", self.vertical_flip);
        bool_opt("monochrome", self.monochrome);
        bool_opt("dynamic.gop", self.dynamic_gop);
        bool_opt("dynamic.bitrate", self.dynamic_bitrate);
        bool_opt("dynamic.framerate", self.dynamic_framerate);
        bool_opt("dynamic.compression", self.dynamic_compression);

        out
    }

    /// Validate value ranges that a device would otherwise reject at open.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == Some(0) || self.height == Some(0) {
            return Err("Resolution must be non-zero".to_string());
        }
        if self.width.is_some() != self.height.is_some() {
            return Err("Width and height must be set together".to_string());
        }
        if let Some(fps) = self.framerate {
            if fps == 0 || fps > 240 {
                return Err("Framerate must be between 1 and 240".to_string());
            }
        }
        if let Some(compression) = self.compression {
            if compression > 100 {
                return Err("Compression must be between 0 and 100".to_string());
            }
        }
        if self.input == Some(0) {
            return Err("Video input is 1-based, 0 is invalid".to_string());
        }
        if self.zip_min_fps_den == Some(0) {
            return Err("Zipstream minimum framerate denominator must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Failed acquisition attached to a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionError {
    pub cause: DeviceError,
    /// Whether the classifier considered the failure expected.
    pub expected: bool,
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (expected: {})", self.cause, self.expected)
    }
}

/// A compressed video frame, or a failed acquisition attempt.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Bytes,
    pub frame_type: FrameType,
    pub error: Option<AcquisitionError>,
}

impl Frame {
    pub fn new(sequence: u64, frame_type: FrameType, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            data: data.into(),
            frame_type,
            error: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A frame that carries an acquisition failure and no payload.
    pub fn failed(cause: DeviceError, expected: bool) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            data: Bytes::new(),
            frame_type: FrameType::None,
            error: Some(AcquisitionError { cause, expected }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type.is_key_frame()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(err) => write!(f, "Failed frame: {}", err),
            None => write!(
                f,
                "SequenceNbr: {}, Timestamp: {}, Size: {}, Type: {}",
                self.sequence,
                self.timestamp.format("%Y-%m-%d %H:%M:%S"),
                self.size(),
                self.frame_type
            ),
        }
    }
}
