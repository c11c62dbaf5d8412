//! Launch/resume parameters and the ticket returned by a started session.
//!
//! `StreamConfig` only carries what the control protocol needs to start or
//! rejoin a session.  Codec, bitrate and packet-size settings belong to the
//! streaming transport and are negotiated later over RTSP.

use crate::crypto::random_bytes;

/// Length of the remote-input key handed to the host at launch.
pub const REMOTE_INPUT_KEY_LEN: usize = 16;

/// Launch starts an app cold; resume rejoins the session already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchVerb {
    Launch,
    Resume,
}

impl LaunchVerb {
    /// Request path for this verb.
    pub fn path(self) -> &'static str {
        match self {
            LaunchVerb::Launch => "/launch",
            LaunchVerb::Resume => "/resume",
        }
    }

    /// Name of the response tag carrying the session result.
    pub fn result_tag(self) -> &'static str {
        match self {
            LaunchVerb::Launch => "gamesession",
            LaunchVerb::Resume => "resume",
        }
    }
}

/// Speaker layout requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub channel_count: u16,
    pub channel_mask: u16,
}

impl AudioConfig {
    pub const STEREO: AudioConfig = AudioConfig {
        channel_count: 2,
        channel_mask: 0x3,
    };
    pub const SURROUND_51: AudioConfig = AudioConfig {
        channel_count: 6,
        channel_mask: 0x3F,
    };
    pub const SURROUND_71: AudioConfig = AudioConfig {
        channel_count: 8,
        channel_mask: 0x63F,
    };

    /// Packs the layout as the `surroundAudioInfo` query value:
    /// channel mask in the high 16 bits, channel count in the low 16.
    pub fn surround_audio_info(self) -> u32 {
        (u32::from(self.channel_mask) << 16) | u32::from(self.channel_count)
    }

    pub fn from_surround_audio_info(value: u32) -> Self {
        Self {
            channel_count: (value & 0xFFFF) as u16,
            channel_mask: (value >> 16) as u16,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::STEREO
    }
}

/// Session parameters sent with `/launch` (all of them) or `/resume`
/// (the remote-input key and audio layout only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Let the host adjust in-game settings to the stream resolution (`sops`).
    pub optimize_game_settings: bool,
    /// Keep playing audio on the host's own speakers (`localAudioPlayMode`).
    pub play_audio_on_host: bool,
    pub audio: AudioConfig,
    /// Bit per attached gamepad (`remoteControllersBitmap`, `gcmap`).
    pub controllers_bitmap: u16,
    pub enable_hdr: bool,
    /// AES key the transport uses for input packets (`rikey`).
    pub remote_input_key: [u8; REMOTE_INPUT_KEY_LEN],
    /// Key identifier / IV seed for input packets (`rikeyid`).
    pub remote_input_key_id: i32,
}

impl StreamConfig {
    /// Creates a config for the given mode with a freshly generated
    /// remote-input key.
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        let key_id_bytes: [u8; 4] = random_bytes();
        Self {
            width,
            height,
            fps,
            optimize_game_settings: true,
            play_audio_on_host: false,
            audio: AudioConfig::default(),
            controllers_bitmap: 0,
            enable_hdr: false,
            remote_input_key: random_bytes(),
            remote_input_key_id: i32::from_be_bytes(key_id_bytes),
        }
    }

    /// `WIDTHxHEIGHTxFPS`, as sent in the `mode` parameter.
    pub fn mode_string(&self) -> String {
        format!("{}x{}x{}", self.width, self.height, self.fps)
    }

    /// Parses a `mode` value back into `(width, height, fps)`.
    pub fn parse_mode(mode: &str) -> Option<(u32, u32, u32)> {
        let mut parts = mode.split('x');
        let width = parts.next()?.parse().ok()?;
        let height = parts.next()?.parse().ok()?;
        let fps = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((width, height, fps))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(1920, 1080, 60)
    }
}

/// What a successful launch or resume hands to the streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub verb: LaunchVerb,
    /// App started by a launch; `None` for a resume.
    pub app_id: Option<String>,
    /// Value of the result tag (`gamesession` / `resume`).
    pub session_id: String,
    /// RTSP URL advertised by newer hosts (`sessionUrl0`).
    pub session_url: Option<String>,
    pub remote_input_key: [u8; REMOTE_INPUT_KEY_LEN],
    pub remote_input_key_id: i32,
}
