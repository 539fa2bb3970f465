//! Device input contract.
//!
//! Capture devices (hand tracker, eye tracker, passthrough camera, speech
//! recognizer) are external. They hand us plain values which are folded into
//! a single user [`Message`] before entering the agent loop.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::BackendError;
use crate::message::{ContentPart, Message, MessageContent};

/// Recognized hand gestures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    Point,
    Grab,
    Pinch,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
    OpenPalm,
    Fist,
    ThumbsUp,
    ThumbsDown,
}

impl Gesture {
    pub const ALL: [Gesture; 11] = [
        Gesture::Point,
        Gesture::Grab,
        Gesture::Pinch,
        Gesture::SwipeLeft,
        Gesture::SwipeRight,
        Gesture::SwipeUp,
        Gesture::SwipeDown,
        Gesture::OpenPalm,
        Gesture::Fist,
        Gesture::ThumbsUp,
        Gesture::ThumbsDown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Gesture::Point => "point",
            Gesture::Grab => "grab",
            Gesture::Pinch => "pinch",
            Gesture::SwipeLeft => "swipe_left",
            Gesture::SwipeRight => "swipe_right",
            Gesture::SwipeUp => "swipe_up",
            Gesture::SwipeDown => "swipe_down",
            Gesture::OpenPalm => "open_palm",
            Gesture::Fist => "fist",
            Gesture::ThumbsUp => "thumbs_up",
            Gesture::ThumbsDown => "thumbs_down",
        }
    }
}

impl FromStr for Gesture {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Gesture::ALL
            .into_iter()
            .find(|g| g.label() == needle)
            .ok_or_else(|| BackendError::InvalidInput(format!("unknown gesture label: {s}")))
    }
}

impl std::fmt::Display for Gesture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A circular region of visual attention, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaze {
    pub x: f32,
    pub y: f32,
    pub r: f32,
}

impl Gaze {
    pub fn new(x: f32, y: f32, r: f32) -> Result<Self, BackendError> {
        if !(x.is_finite() && y.is_finite() && r.is_finite()) || r < 0.0 {
            return Err(BackendError::InvalidInput(format!("invalid gaze region ({x}, {y}, {r})")));
        }
        Ok(Self { x, y, r })
    }
}

impl FromStr for Gaze {
    type Err = BackendError;

    /// Parses `x,y,r`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, r] = parts.as_slice() else {
            return Err(BackendError::InvalidInput(format!("gaze must be 'x,y,r', got '{s}'")));
        };
        let num = |v: &str| {
            v.parse::<f32>()
                .map_err(|_| BackendError::InvalidInput(format!("gaze component '{v}' is not a number")))
        };
        Gaze::new(num(x)?, num(y)?, num(r)?)
    }
}

/// A raw camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFrame {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self { mime_type: "image/jpeg".into(), bytes }
    }

    /// Guess the mime type from a file extension, defaulting to JPEG.
    pub fn from_path_bytes(path: &std::path::Path, bytes: Vec<u8>) -> Self {
        let mime_type = match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "png" => "image/png",
            Some(ext) if ext == "webp" => "image/webp",
            Some(ext) if ext == "gif" => "image/gif",
            _ => "image/jpeg",
        };
        Self { mime_type: mime_type.into(), bytes }
    }

    fn into_part(self) -> ContentPart {
        ContentPart::Image {
            mime_type: self.mime_type,
            data: BASE64.encode(self.bytes),
        }
    }
}

/// One snapshot of everything the devices observed for a user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInput {
    pub text: Option<String>,
    pub voice: Option<String>,
    pub gesture: Option<Gesture>,
    pub gaze: Option<Gaze>,
    pub image: Option<ImageFrame>,
}

impl DeviceInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn with_voice(mut self, transcript: impl Into<String>) -> Self {
        self.voice = Some(transcript.into());
        self
    }

    pub fn with_gesture(mut self, gesture: Gesture) -> Self {
        self.gesture = Some(gesture);
        self
    }

    pub fn with_gaze(mut self, gaze: Gaze) -> Self {
        self.gaze = Some(gaze);
        self
    }

    pub fn with_image(mut self, image: ImageFrame) -> Self {
        self.image = Some(image);
        self
    }

    /// Fold all observations into one user message.
    ///
    /// Textual observations share a single text part; the image, if any,
    /// follows as its own part.
    pub fn into_message(self) -> Result<Message, BackendError> {
        let mut pieces = Vec::new();
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            pieces.push(format!("User text input: {text}"));
        }
        if let Some(voice) = self.voice.as_deref().filter(|t| !t.trim().is_empty()) {
            pieces.push(format!("Voice input: {voice}"));
        }
        if let Some(gesture) = self.gesture {
            pieces.push(format!("Gesture input: {gesture}"));
        }
        if let Some(Gaze { x, y, r }) = self.gaze {
            pieces.push(format!("Gaze input: focus position ({x}, {y}), region radius {r}"));
        }

        let mut parts = Vec::new();
        if !pieces.is_empty() {
            parts.push(ContentPart::text(pieces.join(" ")));
        }
        if let Some(image) = self.image {
            if image.bytes.is_empty() {
                return Err(BackendError::InvalidInput("image frame is empty".into()));
            }
            parts.push(image.into_part());
        }

        match parts.len() {
            0 => Err(BackendError::InvalidInput("device input carries no observations".into())),
            1 if matches!(parts[0], ContentPart::Text { .. }) => {
                let text = MessageContent::Parts(parts).text();
                Ok(Message::user(text))
            }
            _ => Ok(Message::user(parts)),
        }
    }
}
