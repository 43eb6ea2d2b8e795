//! Sample banks: note id → mono PCM at the sink's rate.

use alloc::vec::Vec;
use core::f32::consts::TAU;

use crate::note::NoteId;

/// Source of the PCM data played for each [`NoteId`].
///
/// The engine fetches every sample once per sink session, at the session's
/// sample rate, so implementations may do expensive work here.
pub trait SampleBank: Send + Sync + 'static {
    /// Number of notes; ids `0..len()` are valid.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mono samples for `note` at `sample_rate`. Unknown notes yield an empty buffer.
    fn sample(&self, note: NoteId, sample_rate: u32) -> Vec<f32>;
}

/// In-memory bank of pre-decoded mono samples.
///
/// Samples are stored at their own rate and converted with linear
/// interpolation when the sink runs at a different rate.
///
/// ```
/// use metrum::{NoteId, SampleBank, StaticSampleBank};
///
/// let mut bank = StaticSampleBank::new();
/// let id = bank.push(vec![0.0, 1.0, 0.0, -1.0], 24000);
///
/// assert_eq!(id, NoteId(0));
/// assert_eq!(bank.sample(id, 24000), vec![0.0, 1.0, 0.0, -1.0]);
/// assert_eq!(bank.sample(id, 48000).len(), 8);
/// ```
#[derive(Clone, Debug, Default)]
pub struct StaticSampleBank {
    samples: Vec<(Vec<f32>, u32)>,
}

impl StaticSampleBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample recorded at `sample_rate` and return its id.
    pub fn push(&mut self, samples: Vec<f32>, sample_rate: u32) -> NoteId {
        let id = NoteId(self.samples.len() as u32);
        self.samples.push((samples, sample_rate.max(1)));
        id
    }

    pub fn with_sample(mut self, samples: Vec<f32>, sample_rate: u32) -> Self {
        self.push(samples, sample_rate);
        self
    }
}

impl SampleBank for StaticSampleBank {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, note: NoteId, sample_rate: u32) -> Vec<f32> {
        match self.samples.get(note.index()) {
            Some((samples, rate)) if *rate == sample_rate => samples.clone(),
            Some((samples, rate)) => resample_linear(samples, *rate, sample_rate),
            None => Vec::new(),
        }
    }
}

/// Linear-interpolation rate conversion of a mono buffer.
fn resample_linear(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input.is_empty() || output_rate == 0 {
        return Vec::new();
    }
    let ratio = f64::from(input_rate) / f64::from(output_rate);
    let out_len = ((input.len() as f64) / ratio).round() as usize;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position as usize;
            let t = (position - index as f64) as f32;
            let prev = input[index.min(input.len() - 1)];
            let curr = input[(index + 1).min(input.len() - 1)];
            prev + t * (curr - prev)
        })
        .collect()
}

/// Generate a percussive click: a sine at `frequency` Hz with an exponential
/// decay, `decay_secs` being the time to fall to about -60 dB.
///
/// ```
/// let click = metrum::synth_click(1000.0, 0.05, 48000);
/// assert_eq!(click.len(), 2400);
/// assert!(click.iter().all(|s| s.abs() <= 1.0));
/// ```
pub fn synth_click(frequency: f32, decay_secs: f32, sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate.max(1) as f32;
    let len = (decay_secs.max(0.0) * rate).round() as usize;
    let phase_inc = frequency.max(0.0) / rate;
    // ln(1000): amplitude reaches 1e-3 at the end of the buffer
    let decay = 6.907_755 / len.max(1) as f32;

    let mut phase = 0.0f32;
    (0..len)
        .map(|i| {
            let sample = (phase * TAU).sin() * (-decay * i as f32).exp();
            phase += phase_inc;
            phase -= (phase >= 1.0) as u32 as f32;
            sample
        })
        .collect()
}
