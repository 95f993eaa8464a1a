//! Command model — the closed tagged union every fabric transport carries.
//!
//! Every command is a JSON object with a `command` string discriminator and
//! typed fields, e.g.
//!
//! ```json
//! {"command":"radio.send_bytes","address":1970168948,"channel":7,"group":0,"power":6,"message":"AAECAw=="}
//! ```
//!
//! Field ranges are validated on decode; unknown tags and out-of-range
//! payloads fail deserialization, and read loops log and skip them. Encoding
//! is lossless JSON. Byte-valued fields travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Radio field ranges
// ────────────────────────────────────────────────────────────────────────────

pub const MIN_LENGTH: usize = 1;
pub const MAX_LENGTH: usize = 254;

pub const MAX_CHANNEL: u8 = 83;
pub const MAX_GROUP: u8 = 255;
pub const MAX_POWER: u8 = 7;

/// Radio addresses are 32-bit values capped at `i32::MAX`.
pub const MAX_ADDRESS: u32 = 0x7fff_ffff;

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// One command per wire tag. The discriminator is the `command` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum MicrobitCommand {
    // ── Microbit control ─────────────────────────────────────────────────
    #[serde(rename = "microbit.reset")]
    Reset,
    #[serde(rename = "microbit.temperature")]
    Temperature { temperature: u8 },
    #[serde(rename = "microbit.running_time")]
    RunningTime { running_time: u64 },
    #[serde(rename = "microbit.panic")]
    Panic { n: i32 },
    #[serde(rename = "microbit.sleep")]
    Sleep { duration: u64 },
    #[serde(rename = "microbit.Button.is_pressed")]
    ButtonIsPressed { instance: Button, is_pressed: bool },

    // ── Display ──────────────────────────────────────────────────────────
    #[serde(rename = "microbit.display.set_pixel")]
    DisplaySetPixel {
        #[serde(deserialize_with = "de_coordinate")]
        x: u8,
        #[serde(deserialize_with = "de_coordinate")]
        y: u8,
        #[serde(deserialize_with = "de_led_value")]
        value: u8,
    },
    #[serde(rename = "microbit.display.clear")]
    DisplayClear,
    #[serde(rename = "microbit.display.show")]
    DisplayShow { image: Vec<Vec<u8>> },
    #[serde(rename = "microbit.display.on")]
    DisplayOn,
    #[serde(rename = "microbit.display.off")]
    DisplayOff,
    #[serde(rename = "microbit.display.read_light_level")]
    DisplayReadLightLevel { light_level: u8 },

    // ── Accelerometer ────────────────────────────────────────────────────
    #[serde(rename = "microbit.accelerometer.get_x")]
    AccelerometerGetX { x: i32 },
    #[serde(rename = "microbit.accelerometer.get_y")]
    AccelerometerGetY { y: i32 },
    #[serde(rename = "microbit.accelerometer.get_z")]
    AccelerometerGetZ { z: i32 },
    #[serde(rename = "microbit.accelerometer.current_gesture")]
    AccelerometerCurrentGesture { current_gesture: Gesture },
    #[serde(rename = "microbit.accelerometer.set_range")]
    AccelerometerSetRange {
        #[serde(deserialize_with = "de_accelerometer_range")]
        value: u8,
    },

    // ── Radio ────────────────────────────────────────────────────────────
    #[serde(rename = "radio.send_bytes")]
    RadioSendBytes(RadioSendBytes),
}

/// Physical button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    #[serde(rename = "button_a")]
    A,
    #[serde(rename = "button_b")]
    B,
}

/// Accelerometer gestures; `None` is the empty string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gesture {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "left")]
    Left,
    #[serde(rename = "right")]
    Right,
    #[serde(rename = "face up")]
    FaceUp,
    #[serde(rename = "face down")]
    FaceDown,
    #[serde(rename = "freefall")]
    Freefall,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "6g")]
    SixG,
    #[serde(rename = "8g")]
    EightG,
    #[serde(rename = "shake")]
    Shake,
    #[serde(rename = "")]
    None,
}

// ────────────────────────────────────────────────────────────────────────────
// radio.send_bytes payload
// ────────────────────────────────────────────────────────────────────────────

/// The broadcast payload. `message` is raw bytes in memory and base64 text
/// on the wire; every field range is enforced when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RadioSendBytesWire", into = "RadioSendBytesWire")]
pub struct RadioSendBytes {
    pub address: u32,
    pub channel: u8,
    pub group: u8,
    pub power: u8,
    pub message: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone)]
struct RadioSendBytesWire {
    address: u32,
    channel: u8,
    group: u8,
    power: u8,
    message: String,
}

impl TryFrom<RadioSendBytesWire> for RadioSendBytes {
    type Error = String;

    fn try_from(wire: RadioSendBytesWire) -> Result<Self, Self::Error> {
        if wire.address > MAX_ADDRESS {
            return Err(format!("address {} exceeds {MAX_ADDRESS}", wire.address));
        }
        if wire.channel > MAX_CHANNEL {
            return Err(format!("channel {} exceeds {MAX_CHANNEL}", wire.channel));
        }
        if wire.power > MAX_POWER {
            return Err(format!("power {} exceeds {MAX_POWER}", wire.power));
        }
        let message = BASE64
            .decode(wire.message.as_bytes())
            .map_err(|e| format!("message is not valid base64: {e}"))?;
        if message.len() > MAX_LENGTH {
            return Err(format!(
                "message is {} bytes, the wire maximum is {MAX_LENGTH}",
                message.len()
            ));
        }
        Ok(RadioSendBytes {
            address: wire.address,
            channel: wire.channel,
            group: wire.group,
            power: wire.power,
            message,
        })
    }
}

impl From<RadioSendBytes> for RadioSendBytesWire {
    fn from(cmd: RadioSendBytes) -> Self {
        RadioSendBytesWire {
            address: cmd.address,
            channel: cmd.channel,
            group: cmd.group,
            power: cmd.power,
            message: BASE64.encode(&cmd.message),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wire helpers
// ────────────────────────────────────────────────────────────────────────────

/// Encode a command as its JSON wire form.
pub fn encode_command(command: &MicrobitCommand) -> String {
    serde_json::to_string(command).expect("command serialisation is infallible")
}

/// Decode a command from its JSON wire form, validating every field range.
pub fn decode_command(text: &str) -> Result<MicrobitCommand, serde_json::Error> {
    serde_json::from_str(text)
}

fn de_coordinate<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    if value > 4 {
        return Err(serde::de::Error::custom(format!(
            "display coordinate {value} exceeds 4"
        )));
    }
    Ok(value)
}

fn de_led_value<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    if value > 9 {
        return Err(serde::de::Error::custom(format!(
            "led brightness {value} exceeds 9"
        )));
    }
    Ok(value)
}

fn de_accelerometer_range<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    if !matches!(value, 2 | 4 | 8) {
        return Err(serde::de::Error::custom(format!(
            "accelerometer range {value} is not one of 2, 4, 8"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_send_bytes_wire_form() {
        let text = r#"{"command":"radio.send_bytes","address":1970168948,"channel":7,"group":0,"power":6,"message":"AAECAw=="}"#;
        let command = decode_command(text).unwrap();
        let MicrobitCommand::RadioSendBytes(payload) = &command else {
            panic!("expected radio.send_bytes, got {command:?}");
        };
        assert_eq!(payload.address, 0x75626974);
        assert_eq!(payload.channel, 7);
        assert_eq!(payload.group, 0);
        assert_eq!(payload.power, 6);
        assert_eq!(payload.message, vec![0, 1, 2, 3]);

        let round = decode_command(&encode_command(&command)).unwrap();
        assert_eq!(round, command);
    }

    #[test]
    fn command_round_trips() {
        let commands = [
            MicrobitCommand::Reset,
            MicrobitCommand::Temperature { temperature: 21 },
            MicrobitCommand::RunningTime { running_time: 12_500 },
            MicrobitCommand::Panic { n: 42 },
            MicrobitCommand::Sleep { duration: 100 },
            MicrobitCommand::ButtonIsPressed {
                instance: Button::A,
                is_pressed: true,
            },
            MicrobitCommand::DisplaySetPixel { x: 2, y: 4, value: 9 },
            MicrobitCommand::DisplayShow {
                image: vec![vec![0; 5]; 5],
            },
            MicrobitCommand::AccelerometerCurrentGesture {
                current_gesture: Gesture::FaceUp,
            },
            MicrobitCommand::AccelerometerSetRange { value: 8 },
        ];
        for command in commands {
            let round = decode_command(&encode_command(&command)).unwrap();
            assert_eq!(round, command);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(decode_command(r#"{"command":"microbit.frobnicate"}"#).is_err());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let cases = [
            r#"{"command":"radio.send_bytes","address":1,"channel":84,"group":0,"power":6,"message":""}"#,
            r#"{"command":"radio.send_bytes","address":1,"channel":7,"group":0,"power":8,"message":""}"#,
            r#"{"command":"radio.send_bytes","address":2147483648,"channel":7,"group":0,"power":6,"message":""}"#,
            r#"{"command":"radio.send_bytes","address":1,"channel":7,"group":0,"power":6,"message":"not base64!"}"#,
            r#"{"command":"microbit.display.set_pixel","x":5,"y":0,"value":0}"#,
            r#"{"command":"microbit.display.set_pixel","x":0,"y":0,"value":10}"#,
            r#"{"command":"microbit.accelerometer.set_range","value":3}"#,
            r#"{"command":"microbit.Button.is_pressed","instance":"button_c","is_pressed":true}"#,
        ];
        for text in cases {
            assert!(decode_command(text).is_err(), "accepted: {text}");
        }
    }

    #[test]
    fn oversized_message_is_rejected() {
        let message = BASE64.encode(vec![0u8; MAX_LENGTH + 1]);
        let text = format!(
            r#"{{"command":"radio.send_bytes","address":1,"channel":7,"group":0,"power":6,"message":"{message}"}}"#
        );
        assert!(decode_command(&text).is_err());
    }

    #[test]
    fn empty_gesture_is_the_none_variant() {
        let command =
            decode_command(r#"{"command":"microbit.accelerometer.current_gesture","current_gesture":""}"#)
                .unwrap();
        assert_eq!(
            command,
            MicrobitCommand::AccelerometerCurrentGesture {
                current_gesture: Gesture::None
            }
        );
    }
}
