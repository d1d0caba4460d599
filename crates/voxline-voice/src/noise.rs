//! **NoiseMixer** - deterministic ambient-audio blending.
//!
//! A fixed 10 s looping waveform is generated procedurally per profile (no
//! audio assets), then blended sample-by-sample into outgoing speech. The
//! read cursor persists across chunks so the ambience continues seamlessly
//! between them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Sample rate of the generated ambient loop (16 kHz mono 16-bit PCM).
pub const LOOP_SAMPLE_RATE: u32 = 16_000;
const LOOP_SECONDS: usize = 10;

/// Ambient texture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseKind {
    #[default]
    None,
    Office,
    #[serde(rename = "callcenter")]
    CallCenter,
    #[serde(rename = "coffeeshop")]
    CoffeeShop,
    Outdoor,
    Home,
    Car,
}

/// Noise configuration: texture kind and blend level in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseProfile {
    pub kind: NoiseKind,
    /// 0..=100; clamped on assignment. Ignored when `kind` is `None`.
    pub level: u8,
}

impl NoiseProfile {
    pub fn new(kind: NoiseKind, level: i32) -> Self {
        Self {
            kind,
            level: level.clamp(0, 100) as u8,
        }
    }
}

impl Default for NoiseProfile {
    fn default() -> Self {
        Self::new(NoiseKind::None, 10)
    }
}

fn loop_seed(kind: NoiseKind) -> u64 {
    // Fixed per kind so regeneration always yields the same waveform.
    0x766f_786c_0000 + kind as u64
}

fn generate_loop(kind: NoiseKind) -> Vec<i16> {
    if kind == NoiseKind::None {
        return Vec::new();
    }
    let num_samples = LOOP_SAMPLE_RATE as usize * LOOP_SECONDS;
    let mut rng = StdRng::seed_from_u64(loop_seed(kind));
    let mut samples = Vec::with_capacity(num_samples);
    for i in 0..num_samples {
        let sample: f32 = match kind {
            NoiseKind::None => 0.0,
            NoiseKind::Office => {
                // Low hum with rare clicks.
                let mut s = (rng.gen::<f32>() - 0.5) * 0.1;
                if rng.gen::<f32>() < 0.001 {
                    s += (rng.gen::<f32>() - 0.5) * 0.3;
                }
                s
            }
            NoiseKind::CallCenter => {
                // Denser chatter floor plus keyboard clicks.
                let mut s = (rng.gen::<f32>() - 0.5) * 0.15;
                if rng.gen::<f32>() < 0.002 {
                    s += (rng.gen::<f32>() - 0.5) * 0.4;
                }
                s
            }
            NoiseKind::CoffeeShop => {
                let mut s = (rng.gen::<f32>() - 0.5) * 0.12;
                if rng.gen::<f32>() < 0.0015 {
                    s += (rng.gen::<f32>() - 0.5) * 0.35;
                }
                s
            }
            NoiseKind::Outdoor => {
                // Noise floor with slow sinusoidal wind modulation.
                (rng.gen::<f32>() - 0.5) * 0.08 + (i as f32 / 100.0).sin() * 0.05
            }
            NoiseKind::Home => {
                let mut s = (rng.gen::<f32>() - 0.5) * 0.08;
                if rng.gen::<f32>() < 0.0005 {
                    s += (rng.gen::<f32>() - 0.5) * 0.2;
                }
                s
            }
            NoiseKind::Car => {
                // Low-frequency engine sinusoid plus road hiss.
                (i as f32 / 50.0).sin() * 0.1 + (rng.gen::<f32>() - 0.5) * 0.05
            }
        };
        samples.push((sample * 32767.0).clamp(-32768.0, 32767.0) as i16);
    }
    samples
}

/// Blends a looping ambient waveform into 16-bit little-endian PCM chunks.
pub struct NoiseMixer {
    kind: NoiseKind,
    level: u8,
    loop_samples: Vec<i16>,
    cursor: usize,
}

impl NoiseMixer {
    pub fn new(profile: NoiseProfile) -> Self {
        let loop_samples = generate_loop(profile.kind);
        if profile.kind != NoiseKind::None {
            info!(
                "noise mixer ready: {:?} at {}% ({} loop samples)",
                profile.kind,
                profile.level,
                loop_samples.len()
            );
        }
        Self {
            kind: profile.kind,
            level: profile.level,
            loop_samples,
            cursor: 0,
        }
    }

    /// Mix one chunk of outgoing speech with the ambient loop. Passthrough
    /// (byte-identical) when the kind is `None` or the level is 0. A trailing
    /// odd byte is carried through unmixed.
    pub fn mix_audio(&mut self, audio: &[u8]) -> Vec<u8> {
        if self.kind == NoiseKind::None || self.level == 0 || self.loop_samples.is_empty() {
            return audio.to_vec();
        }

        let level = self.level as f32 / 100.0;
        let num_samples = audio.len() / 2;
        let loop_len = self.loop_samples.len();
        let mut mixed = Vec::with_capacity(audio.len());
        for i in 0..num_samples {
            let speech = i16::from_le_bytes([audio[2 * i], audio[2 * i + 1]]) as f32;
            let ambient = self.loop_samples[(self.cursor + i) % loop_len] as f32;
            let sample = (speech * (1.0 - level) + ambient * level)
                .round()
                .clamp(-32768.0, 32767.0) as i16;
            mixed.extend_from_slice(&sample.to_le_bytes());
        }
        if audio.len() % 2 == 1 {
            mixed.push(audio[audio.len() - 1]);
        }
        self.cursor = (self.cursor + num_samples) % loop_len;
        mixed
    }

    /// Hot-swap configuration mid-call. A kind change regenerates the loop
    /// and resets the cursor; a level-only change keeps the cursor.
    pub fn update_config(&mut self, kind: Option<NoiseKind>, level: Option<i32>) {
        if let Some(kind) = kind {
            if kind != self.kind {
                self.kind = kind;
                self.cursor = 0;
                self.loop_samples = generate_loop(kind);
            }
        }
        if let Some(level) = level {
            self.level = level.clamp(0, 100) as u8;
        }
        info!("noise mixer updated: {:?} at {}%", self.kind, self.level);
    }

    pub fn get_config(&self) -> NoiseProfile {
        NoiseProfile {
            kind: self.kind,
            level: self.level,
        }
    }

    /// Rewind the ambient loop to its start.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}
