//! Dispatch of control messages onto the session

use rand::rngs::StdRng;
use rand::SeedableRng;
use rosc::{OscMessage, OscType};

use super::message::ControlMessage;
use crate::session::{Session, SessionResult};

/// Address every reply is sent to
pub const REPLY_ADDRESS: &str = "/reply";
/// Address of the status document sent for `/get_status`
pub const STATUS_ADDRESS: &str = "/status";

/// Outcome of one control message
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub address: String,
    pub ok: bool,
    pub detail: String,
}

impl Reply {
    pub fn ok(address: &str, detail: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn error(address: &str, detail: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }

    /// `/reply [address, "ok"|"error", detail]`
    pub fn to_osc(&self) -> OscMessage {
        OscMessage {
            addr: REPLY_ADDRESS.to_string(),
            args: vec![
                OscType::String(self.address.clone()),
                OscType::String(if self.ok { "ok" } else { "error" }.to_string()),
                OscType::String(self.detail.clone()),
            ],
        }
    }
}

/// Apply a message to the session
///
/// Returns the reply followed by any extra messages for the sender.
pub fn dispatch(session: &mut Session, message: ControlMessage) -> Vec<OscMessage> {
    let address = message.address();
    let mut extra = Vec::new();

    let result: SessionResult<String> = match message {
        ControlMessage::LoadBuffer {
            buffer_id,
            path,
            stem_name,
        } => session
            .load_buffer(buffer_id, &path, &stem_name)
            .map(|()| format!("buffer {} loaded", buffer_id)),
        ControlMessage::PlayStem {
            buffer_id,
            rate,
            volume,
            looping,
            start,
        } => session
            .play_buffer(buffer_id, rate, volume, looping, start, None)
            .map(|()| format!("buffer {} playing", buffer_id)),
        ControlMessage::PlayStemSection {
            buffer_id,
            rate,
            volume,
            looping,
            start,
            duration,
        } => session
            .play_buffer(buffer_id, rate, volume, looping, start, Some(duration))
            .map(|()| format!("buffer {} playing {:.2}s from {:.2}s", buffer_id, duration, start)),
        ControlMessage::StopStem { buffer_id } => session
            .stop_buffer(buffer_id)
            .map(|()| format!("buffer {} stopped", buffer_id)),
        ControlMessage::StemVolume { buffer_id, volume } => session
            .set_buffer_volume(buffer_id, volume)
            .map(|()| format!("buffer {} volume {:.2}", buffer_id, volume)),
        ControlMessage::CrossfadeLevels { deck_a, deck_b } => session
            .set_crossfade_levels(deck_a, deck_b)
            .map(|()| format!("A {:.2} B {:.2}", deck_a, deck_b)),
        ControlMessage::SetKey { key } => session.set_key(&key).map(|k| k.camelot_code()),
        ControlMessage::GetStatus => {
            extra.push(OscMessage {
                addr: STATUS_ADDRESS.to_string(),
                args: vec![OscType::String(session.status().to_json())],
            });
            Ok("status sent".to_string())
        }
        ControlMessage::MixerCleanup => session.cleanup().map(|n| format!("{} buffers released", n)),
        ControlMessage::TestTone { frequency } => session
            .test_tone(frequency)
            .map(|()| format!("{:.1} Hz", frequency)),
        ControlMessage::LoadStem {
            deck,
            stem,
            song_id,
            section,
        } => session
            .load_stem(deck, stem, &song_id, section.as_deref())
            .map(|rate| format!("rate {:.4}", rate)),
        ControlMessage::SwapStem { deck, stem, song_id } => session
            .swap_stem(deck, stem, &song_id)
            .map(|outcome| serde_json::to_string(&outcome).unwrap_or_else(|_| format!("ticket {}", outcome.ticket()))),
        ControlMessage::Stop { deck, stem } => session.stop(deck, stem).map(|()| match stem {
            Some(stem) => format!("{}/{} stopped", deck, stem),
            None => format!("deck {} stopped", deck),
        }),
        ControlMessage::Bpm { bpm } => session.set_global_bpm(bpm).map(|bpm| format!("{:.2}", bpm)),
        ControlMessage::Crossfade { position } => session
            .set_crossfade(position)
            .map(|()| format!("{:.2}", session.crossfade())),
        ControlMessage::Volume { level } => session
            .set_master_volume(level)
            .map(|()| format!("{:.2}", level)),
        ControlMessage::StemTypeVolume { stem, level } => session
            .set_stem_volume(stem, level)
            .map(|()| format!("{} {:.2}", stem, level)),
        ControlMessage::LoadSong { deck, song_id } => session
            .load_song(deck, &song_id)
            .map(|n| format!("{} stems on deck {}", n, deck)),
        ControlMessage::SetSection { deck, stem, section } => session
            .set_section(deck, stem, &section)
            .map(|rate| format!("{}/{} [{}] rate {:.4}", deck, stem, section, rate)),
        ControlMessage::RandomMix { seed } => {
            let mix = match seed {
                Some(seed) => session.random_mix(&mut StdRng::seed_from_u64(seed as u64)),
                None => session.random_mix(&mut rand::rng()),
            };
            mix.map(|mix| serde_json::to_string(&mix).unwrap_or_else(|_| format!("{:.0} BPM", mix.bpm)))
        }
    };

    let reply = match result {
        Ok(detail) => Reply::ok(address, detail),
        Err(e) => {
            log::warn!("{} failed: {}", address, e);
            Reply::error(address, e.to_string())
        }
    };

    let mut out = Vec::with_capacity(1 + extra.len());
    out.push(reply.to_osc());
    out.extend(extra);
    out
}
