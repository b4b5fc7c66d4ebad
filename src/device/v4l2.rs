//! V4L2 device backend.
//!
//! Opens a capture node (e.g. `/dev/video0`), applies the configured format,
//! frame rate and encoder controls, and streams buffers through an mmap
//! queue. Errno values reported by the driver are mapped onto
//! [`DeviceErrorCode`] so the provider's classifier sees the same codes as
//! with any other backend. A node that disappears (`ENODEV`) maps to
//! `InterfaceDown`, which is expected by default and triggers a restart.

use crate::device::{DeviceBackend, DeviceHandle, DeviceInfo};
use crate::errors::{DeviceError, DeviceErrorCode};
use crate::types::{
    Frame, FrameType, H264Profile, RateControlMode, SettingValue, StreamConfiguration, VideoFormat,
};
use ouroboros::self_referencing;
use std::io;
use std::path::{Path, PathBuf};
use v4l::buffer::{Flags, Type};
use v4l::control::{Control, Value};
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

const DEFAULT_BUFFER_COUNT: u32 = 4;

const CID_HFLIP: u32 = 0x0098_0914;
const CID_VFLIP: u32 = 0x0098_0915;
const CID_ROTATE: u32 = 0x0098_0922;
const CID_MPEG_VIDEO_GOP_SIZE: u32 = 0x0099_09CB;
const CID_MPEG_VIDEO_BITRATE_MODE: u32 = 0x0099_09CE;
const CID_MPEG_VIDEO_BITRATE: u32 = 0x0099_09CF;
const CID_MPEG_VIDEO_H264_PROFILE: u32 = 0x0099_0A6B;

/// Map a driver error onto a device error code.
pub fn error_code(err: &io::Error) -> DeviceErrorCode {
    match err.raw_os_error() {
        Some(libc::ENODEV) => DeviceErrorCode::InterfaceDown,
        Some(libc::EPIPE) => DeviceErrorCode::Closed,
        Some(libc::EBUSY) => DeviceErrorCode::Busy,
        Some(libc::EIO) => DeviceErrorCode::Io,
        Some(libc::EAGAIN) => DeviceErrorCode::NoData,
        Some(libc::ENOMEM) => DeviceErrorCode::Oom,
        Some(libc::ENOBUFS) => DeviceErrorCode::NoBufferSpace,
        Some(libc::EINVAL) => DeviceErrorCode::InvalidArgument,
        Some(libc::ENOENT) => DeviceErrorCode::NotFound,
        Some(libc::EACCES) | Some(libc::EPERM) => DeviceErrorCode::PermissionDenied,
        Some(libc::ENOTSUP) => DeviceErrorCode::NotSupported,
        _ => match err.kind() {
            io::ErrorKind::NotFound => DeviceErrorCode::NotFound,
            io::ErrorKind::PermissionDenied => DeviceErrorCode::PermissionDenied,
            _ => DeviceErrorCode::Failed,
        },
    }
}

fn device_error(context: &str, err: io::Error) -> DeviceError {
    DeviceError::new(error_code(&err), format!("{}: {}", context, err))
}

fn fourcc(format: VideoFormat) -> Option<FourCC> {
    match format {
        VideoFormat::H264 => Some(FourCC::new(b"H264")),
        VideoFormat::H265 => Some(FourCC::new(b"HEVC")),
        VideoFormat::Jpeg => Some(FourCC::new(b"MJPG")),
        VideoFormat::Yuv => Some(FourCC::new(b"YUYV")),
        _ => None,
    }
}

fn format_of(fourcc: FourCC) -> VideoFormat {
    match &fourcc.repr {
        b"H264" => VideoFormat::H264,
        b"HEVC" => VideoFormat::H265,
        b"MJPG" | b"JPEG" => VideoFormat::Jpeg,
        b"YUYV" | b"NV12" | b"YU12" => VideoFormat::Yuv,
        _ => VideoFormat::Raw,
    }
}

fn frame_type(format: VideoFormat, flags: Flags) -> FrameType {
    let key = flags.contains(Flags::KEYFRAME);
    let bidir = flags.contains(Flags::BFRAME);
    match format {
        VideoFormat::H264 if key => FrameType::H264Idr,
        VideoFormat::H264 if bidir => FrameType::H264B,
        VideoFormat::H264 => FrameType::H264P,
        VideoFormat::H265 if key => FrameType::H265Idr,
        VideoFormat::H265 if bidir => FrameType::H265B,
        VideoFormat::H265 => FrameType::H265P,
        VideoFormat::Jpeg => FrameType::Jpeg,
        VideoFormat::Yuv => FrameType::Yuv,
        _ => FrameType::Raw,
    }
}

/// `V4L2_MPEG_VIDEO_BITRATE_MODE_*` menu index. Modes without a V4L2
/// counterpart are not applied.
fn bitrate_mode_menu(mode: RateControlMode) -> Option<i64> {
    match mode {
        RateControlMode::Vbr => Some(0),
        RateControlMode::Cbr => Some(1),
        RateControlMode::None | RateControlMode::Mbr | RateControlMode::Abr => None,
    }
}

/// `V4L2_MPEG_VIDEO_H264_PROFILE_*` menu index.
fn h264_profile_menu(profile: H264Profile) -> Option<i64> {
    match profile {
        H264Profile::Baseline => Some(0),
        H264Profile::Main => Some(2),
        H264Profile::High => Some(4),
        H264Profile::None => None,
    }
}

/// Encoder and orientation controls for the set fields of `config`.
fn controls(config: &StreamConfiguration) -> Vec<Control> {
    let mut out = Vec::new();
    for (key, value) in config.settings() {
        let id = match key {
            "horizontal_flip" => CID_HFLIP,
            "vertical_flip" => CID_VFLIP,
            "gop_length" => CID_MPEG_VIDEO_GOP_SIZE,
            "bitrate" => CID_MPEG_VIDEO_BITRATE,
            _ => continue,
        };
        let value = match value {
            SettingValue::U32(v) => Value::Integer(i64::from(v)),
            SettingValue::Bool(v) => Value::Boolean(v),
        };
        out.push(Control { id, value });
    }
    if let Some(rotation) = config.rotation {
        out.push(Control {
            id: CID_ROTATE,
            value: Value::Integer(i64::from(u32::from(rotation))),
        });
    }
    if let Some(menu) = config.rate_control_mode.and_then(bitrate_mode_menu) {
        out.push(Control {
            id: CID_MPEG_VIDEO_BITRATE_MODE,
            value: Value::Integer(menu),
        });
    }
    if let Some(menu) = config.h264_profile.and_then(h264_profile_menu) {
        out.push(Control {
            id: CID_MPEG_VIDEO_H264_PROFILE,
            value: Value::Integer(menu),
        });
    }
    out
}

/// Opens sessions on one V4L2 capture node.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    path: PathBuf,
}

impl V4l2Backend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceBackend for V4l2Backend {
    type Handle = V4l2Handle;

    fn open(&self, config: &StreamConfiguration) -> Result<V4l2Handle, DeviceError> {
        let device = v4l::Device::with_path(&self.path).map_err(|e| {
            device_error(&format!("open v4l2 device {}", self.path.display()), e)
        })?;

        let mut format = device
            .format()
            .map_err(|e| device_error("read v4l2 format", e))?;
        if let (Some(width), Some(height)) = (config.width, config.height) {
            format.width = width;
            format.height = height;
        }
        if let Some(fourcc) = config.format.and_then(fourcc) {
            format.fourcc = fourcc;
        }
        let format = device
            .set_format(&format)
            .map_err(|e| device_error("set v4l2 format", e))?;

        if let Some(fps) = config.framerate {
            let params = v4l::video::capture::Parameters::with_fps(fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Backend: failed to set framerate on {}: {}",
                    self.path.display(),
                    err
                );
            }
        }

        for control in controls(config) {
            let id = control.id;
            if let Err(err) = device.set_control(control) {
                // Controls are optional per driver; the stream still works without them.
                log::debug!(
                    "V4l2Backend: control {:#010x} not applied on {}: {}",
                    id,
                    self.path.display(),
                    err
                );
            }
        }

        log::info!(
            "V4l2Backend: opened {} ({}x{} {})",
            self.path.display(),
            format.width,
            format.height,
            format.fourcc
        );

        Ok(V4l2Handle {
            path: self.path.clone(),
            format: format_of(format.fourcc),
            width: format.width,
            height: format.height,
            framerate: config.framerate,
            buffer_count: config.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT).max(1),
            frame_count: 0,
            key_frame_count: 0,
            accumulated_bytes: 0,
            session: Session::Opened(device),
        })
    }
}

#[self_referencing]
struct Streaming {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: MmapStream<'this>,
}

enum Session {
    Opened(v4l::Device),
    Streaming(Streaming),
    Closed,
}

/// One open V4L2 capture session.
pub struct V4l2Handle {
    path: PathBuf,
    format: VideoFormat,
    width: u32,
    height: u32,
    framerate: Option<u32>,
    buffer_count: u32,
    frame_count: u64,
    key_frame_count: u64,
    accumulated_bytes: u64,
    session: Session,
}

impl std::fmt::Debug for V4l2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = match self.session {
            Session::Opened(_) => "opened",
            Session::Streaming(_) => "streaming",
            Session::Closed => "closed",
        };
        f.debug_struct("V4l2Handle")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("session", &session)
            .finish()
    }
}

impl V4l2Handle {
    pub fn format(&self) -> VideoFormat {
        self.format
    }
}

impl DeviceHandle for V4l2Handle {
    fn start(&mut self) -> Result<(), DeviceError> {
        let device = match std::mem::replace(&mut self.session, Session::Closed) {
            Session::Opened(device) => device,
            other => {
                self.session = other;
                return Err(DeviceError::new(
                    DeviceErrorCode::InvalidArgument,
                    "session is already streaming or closed",
                ));
            }
        };

        let count = self.buffer_count;
        let mut streaming = StreamingTryBuilder {
            device,
            stream_builder: |device| MmapStream::with_buffers(device, Type::VideoCapture, count),
        }
        .try_build()
        .map_err(|e| device_error("create v4l2 buffer stream", e))?;

        streaming
            .with_stream_mut(|stream| stream.start())
            .map_err(|e| device_error("start v4l2 stream", e))?;

        self.session = Session::Streaming(streaming);
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Frame, DeviceError> {
        let Session::Streaming(streaming) = &mut self.session else {
            return Err(DeviceError::new(
                DeviceErrorCode::Closed,
                "session is not streaming",
            ));
        };

        let format = self.format;
        let frame = streaming.with_stream_mut(|stream| {
            let (buf, meta) = stream
                .next()
                .map_err(|e| device_error("capture v4l2 frame", e))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            Ok::<_, DeviceError>(Frame::new(
                u64::from(meta.sequence) + 1,
                frame_type(format, meta.flags),
                buf[..used].to_vec(),
            ))
        })?;

        self.frame_count += 1;
        self.accumulated_bytes += frame.size() as u64;
        if frame.is_key_frame() {
            self.key_frame_count += 1;
        }
        Ok(frame)
    }

    fn stop(&mut self) {
        if let Session::Streaming(streaming) = &mut self.session {
            if let Err(err) = streaming.with_stream_mut(|stream| stream.stop()) {
                log::debug!("V4l2Handle: stop on {}: {}", self.path.display(), err);
            }
        }
    }

    fn info(&self) -> DeviceInfo {
        let mut info = DeviceInfo::new();
        info.insert("format".to_string(), u64::from(self.format.code()));
        info.insert("width".to_string(), u64::from(self.width));
        info.insert("height".to_string(), u64::from(self.height));
        if let Some(fps) = self.framerate {
            info.insert("framerate".to_string(), u64::from(fps));
        }
        info.insert("buffer.count".to_string(), u64::from(self.buffer_count));
        info.insert(
            "running".to_string(),
            u64::from(matches!(self.session, Session::Streaming(_))),
        );
        info.insert("statistics.frame_count".to_string(), self.frame_count);
        info.insert("statistics.idrframe_count".to_string(), self.key_frame_count);
        info.insert("statistics.accumulated_bytes".to_string(), self.accumulated_bytes);
        info
    }

    fn release(mut self) {
        self.session = Session::Closed;
        log::debug!("V4l2Handle: released {}", self.path.display());
    }
}
