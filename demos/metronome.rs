//! Four-beat metronome on the default output
//!
//! Run with: cargo run --example metronome --features cpal_sink

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use metrum::{synth_click, CpalDevice, Metrum, NoteListItem, Pattern, StaticSampleBank};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let device = CpalDevice::default_output().ok_or("No audio device")?;
    println!(
        "Output: {} ({} Hz, {} channels)",
        device.name(),
        device.sample_rate(),
        device.channels()
    );

    let rate = device.sample_rate();
    let mut bank = StaticSampleBank::new();
    let accent = bank.push(synth_click(1760.0, 0.04, rate), rate);
    let tick = bank.push(synth_click(880.0, 0.03, rate), rate);

    // 120 bpm
    let beat = 0.5;
    let pattern = Pattern::new(
        [accent, tick, tick, tick]
            .into_iter()
            .enumerate()
            .map(|(i, note)| {
                let volume = if i == 0 { 1.0 } else { 0.6 };
                NoteListItem::new(note, volume, beat).with_tag(i as u64 + 1)
            })
            .collect(),
    );

    let metrum = Metrum::new(device, bank);
    metrum.set_pattern(pattern.clone());
    // printed 20ms ahead of the click to make up for terminal latency
    metrum.register_listener(Arc::new(|note: NoteListItem| println!("beat {}", note.tag)), -20.0);
    metrum.start()?;

    sleep(Duration::from_secs(4));

    println!("Switching to 150 bpm, locked to now");
    let beat = 0.4;
    pattern.edit(|notes| notes.iter_mut().for_each(|n| n.duration = beat));
    metrum.synchronize_time(Instant::now(), beat)?;

    sleep(Duration::from_secs(4));
    metrum.stop();
    Ok(())
}
