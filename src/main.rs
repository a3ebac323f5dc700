// Host frontend. Everything the engine deliberately does not do lives here:
// file I/O for ROM, battery saves and snapshots, the window, the audio
// device, key input and frame pacing.
use dmgboy::emulator::Emulator;
#[cfg(feature = "gui")]
use dmgboy::joypad::{JoypadKey, KeyState};
#[cfg(feature = "gui")]
use dmgboy::snapshot;
use dmgboy::status::Error;
use std::io::{Read, Write};
use std::path::PathBuf;

struct Args {
    rom: String,
    audio: bool,
    scale: usize,
}

fn parse_args() -> Args {
    let mut args = Args { rom: String::new(), audio: false, scale: 2 };
    {
        let mut ap = argparse::ArgumentParser::new();
        ap.set_description("DMG emulator");
        ap.refer(&mut args.audio)
            .add_option(&["-a", "--enable-audio"], argparse::StoreTrue, "Enable audio");
        ap.refer(&mut args.scale).add_option(
            &["-x", "--scale-factor"],
            argparse::Store,
            "Scale the video by a factor of 1, 2, 4, or 8",
        );
        ap.refer(&mut args.rom).add_argument("rom", argparse::Store, "Rom name");
        ap.parse_args_or_exit();
    }
    args
}

fn load_rom(path: &str) -> Result<Vec<u8>, Error> {
    let mut rom = Vec::new();
    let mut file = std::fs::File::open(path).map_err(|_| Error::FileNotFound)?;
    file.read_to_end(&mut rom).map_err(|_| Error::Generic)?;
    Ok(rom)
}

fn power_up_with_persistence(args: &Args) -> Result<Emulator, Error> {
    rog::debugln!("Loading cartridge from {:?}", args.rom);
    let mut emulator = Emulator::power_up(load_rom(&args.rom)?)?;

    let sav_path = PathBuf::from(&args.rom).with_extension("sav");
    if let Ok(sav) = std::fs::read(&sav_path) {
        emulator.load_sav(&sav)?;
    }
    emulator.set_save_handler(Box::new(move |bytes: &[u8]| {
        let r = std::fs::File::create(&sav_path).and_then(|mut f| f.write_all(bytes));
        if r.is_err() {
            rog::println!("Failed to persist battery ram to {:?}", sav_path);
        }
    }))?;
    Ok(emulator)
}

#[cfg(feature = "gui")]
fn snapshot_path(rom: &str, slot: u8) -> PathBuf {
    PathBuf::from(rom).with_extension(format!("ss{}", slot))
}

#[cfg(feature = "gui")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use dmgboy::fetcher::{SCREEN_HEIGHT, SCREEN_WIDTH};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    rog::reg("dmgboy");
    rog::reg("dmgboy::cartridge");
    rog::reg("dmgboy::snapshot");

    let args = parse_args();
    let mut emulator = power_up_with_persistence(&args)?;

    // The engine calls back on every V-blank; pace to ~59.7 frames/s here.
    let frame_duration = std::time::Duration::from_nanos(16_742_706);
    let mut next_frame = std::time::Instant::now() + frame_duration;
    emulator.set_frame_sync(Box::new(move || {
        let now = std::time::Instant::now();
        if now < next_frame {
            std::thread::sleep(next_frame - now);
        }
        next_frame = std::time::Instant::now() + frame_duration;
    }));

    // Audio: the engine fills sample pairs on demand; a lock-free-enough
    // queue carries them to the cpal thread.
    let audio_queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
    let mut sample_rate = 48000u32;
    if args.audio {
        let device = cpal::default_output_device().expect("No audio output device");
        rog::debugln!("Open the audio player: {}", device.name());
        let format = device.default_output_format().expect("No default audio output format");
        let format =
            cpal::Format { channels: 2, sample_rate: format.sample_rate, data_type: cpal::SampleFormat::I16 };
        sample_rate = format.sample_rate.0;

        let event_loop = cpal::EventLoop::new();
        let stream_id = event_loop.build_output_stream(&device, &format).expect("Failed to open audio stream");
        event_loop.play_stream(stream_id);

        let queue = audio_queue.clone();
        std::thread::spawn(move || {
            event_loop.run(move |_, stream_data| {
                if let cpal::StreamData::Output { buffer } = stream_data {
                    let mut queue = queue.lock().unwrap();
                    if let cpal::UnknownTypeOutputBuffer::I16(mut buffer) = buffer {
                        for slot in buffer.iter_mut() {
                            *slot = queue.pop_front().unwrap_or(0);
                        }
                    }
                }
            });
        });
    }

    let mut option = minifb::WindowOptions::default();
    option.resize = true;
    option.scale = match args.scale {
        1 => minifb::Scale::X1,
        2 => minifb::Scale::X2,
        4 => minifb::Scale::X4,
        8 => minifb::Scale::X8,
        _ => panic!("Supported scale: 1, 2, 4 or 8"),
    };
    let title = format!("DMG - {}", emulator.title());
    let mut window = minifb::Window::new(title.as_str(), SCREEN_WIDTH, SCREEN_HEIGHT, option).unwrap();
    let mut window_buffer = vec![0x00u32; SCREEN_WIDTH * SCREEN_HEIGHT];
    window.update_with_buffer(window_buffer.as_slice()).unwrap();

    let keys = [
        (minifb::Key::Right, JoypadKey::Right),
        (minifb::Key::Up, JoypadKey::Up),
        (minifb::Key::Left, JoypadKey::Left),
        (minifb::Key::Down, JoypadKey::Down),
        (minifb::Key::Z, JoypadKey::A),
        (minifb::Key::X, JoypadKey::B),
        (minifb::Key::Space, JoypadKey::Select),
        (minifb::Key::Enter, JoypadKey::Start),
    ];

    let result = loop {
        if !window.is_open() || window.is_key_down(minifb::Key::Escape) {
            // The user closed the window; unwind like any other status.
            break Err(Error::RequestExit);
        }

        match emulator.step() {
            Ok(_) => {}
            Err(e) => break Err(e),
        }

        if !emulator.check_and_reset_frame_updated() {
            continue;
        }

        window_buffer.copy_from_slice(&emulator.bus.ppu.buffer);
        window.update_with_buffer(window_buffer.as_slice()).unwrap();

        if args.audio {
            // Keep roughly a frame and a half of samples queued.
            let target = (sample_rate as usize / 60) * 3;
            let queued = audio_queue.lock().unwrap().len();
            if queued < target {
                let mut chunk = vec![0i16; target - queued];
                emulator.audio_playback(&mut chunk, sample_rate, 0.5);
                audio_queue.lock().unwrap().extend(chunk);
            }
        }

        for (host_key, joypad_key) in keys.iter() {
            let state = if window.is_key_down(*host_key) { KeyState::Pressed } else { KeyState::Released };
            emulator.key_update(*joypad_key, state);
        }

        if window.is_key_down(minifb::Key::F5) {
            let block = snapshot::save(&emulator, 0)?;
            std::fs::write(snapshot_path(&args.rom, 0), &block)?;
        }
        if window.is_key_down(minifb::Key::F7) {
            if let Ok(block) = std::fs::read(snapshot_path(&args.rom, 0)) {
                snapshot::load(&mut emulator, &block)?;
            }
        }
    };

    emulator.eject()?;
    match result {
        Ok(()) | Err(Error::RequestExit) => Ok(()),
        Err(e) => {
            rog::println!("Emulation stopped: {}", e);
            Err(Box::new(e))
        }
    }
}

// Headless runner: steps the machine and echoes captured serial output,
// which is how the well-known test cartridges report their results.
#[cfg(not(feature = "gui"))]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    rog::reg("dmgboy");
    rog::reg("dmgboy::cartridge");

    let args = parse_args();
    let mut emulator = power_up_with_persistence(&args)?;

    let result = loop {
        match emulator.step() {
            Ok(_) => {}
            Err(e) => break e,
        }
        let captured = emulator.bus.serial.take_captured();
        if !captured.is_empty() {
            std::io::stdout().write_all(&captured)?;
            std::io::stdout().flush()?;
        }
    };

    emulator.eject()?;
    rog::println!("Emulation stopped: {}", result);
    Err(Box::new(result))
}
