use anyhow::{Result, anyhow};
use autolooper::audio::looper::create_engine;
use autolooper::audio::{
    AudioEvent, AudioStream, ExternalMemory, MemoryBank, RamServer, SerialMemory,
    StreamingManager,
};
use autolooper::config::{DEFAULT_SETTINGS_FILE, FootswitchScript, LooperSettings};
use autolooper::ui::TerminalUI;
use crossbeam::channel;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Engine events are sent from the audio callback without blocking.
const EVENT_QUEUE: usize = 256;

fn print_help() {
    println!("Autolooper - single-footswitch looping pedal");
    println!();
    println!("USAGE:");
    println!("    autolooper [OPTIONS]");
    println!("    autolooper [OPTIONS] render <input.wav> <output.wav> <script.toml>");
    println!("    autolooper [OPTIONS] serve-ram <addr>");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print this help message");
    println!("    --debug             Enable debug logging");
    println!("    --config <path>     Settings file (default: {})", DEFAULT_SETTINGS_FILE);
    println!("    --ram <addr>        Page the loop into a serve-ram instance");
    println!("    --list-devices      List audio devices and exit");
    println!();
    println!("MODES:");
    println!("    (none)      Live looping on the audio devices with a terminal UI");
    println!("    render      Run a WAV file through the looper with a scripted footswitch");
    println!("    serve-ram   Serve loop memory over TCP");
    println!();
    println!("CONTROLS:");
    println!("    Space  Footswitch (tap or hold)");
    println!("    H      Latch the footswitch down (terminals without key releases)");
    println!("    Q      Quit");
    println!();
    println!("FOOTSWITCH:");
    println!("    Idle       tap: start the first take");
    println!("    Recording  tap: close the first take and play it back");
    println!("    Playing    tap: overdub; quick second tap: stop; hold: undo/redo");
    println!("    Stopped    tap: resume; hold: clear the loop");
}

struct Options {
    debug: bool,
    config_path: PathBuf,
    ram_server: Option<String>,
    list_devices: bool,
    positional: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        debug: false,
        config_path: PathBuf::from(DEFAULT_SETTINGS_FILE),
        ram_server: None,
        list_devices: false,
        positional: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--debug" => options.debug = true,
            "--list-devices" => options.list_devices = true,
            "--config" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                options.config_path = PathBuf::from(path);
            }
            "--ram" => {
                let addr = iter.next().ok_or_else(|| anyhow!("--ram needs an address"))?;
                options.ram_server = Some(addr.clone());
            }
            other if other.starts_with("--") => return Err(anyhow!("unknown option {}", other)),
            other => options.positional.push(other.to_string()),
        }
    }
    Ok(options)
}

fn setup_logging(path: &Path, debug: bool) -> Result<()> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(fern::log_file(path)?)
        .apply()?;
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_help();
        return Ok(());
    }

    let options = parse_args(&args)?;
    let mut settings = LooperSettings::load(&options.config_path)?;
    settings.debug |= options.debug;
    if options.ram_server.is_some() {
        settings.ram_server = options.ram_server.clone();
    }

    setup_logging(&settings.log_file, settings.debug)?;

    match options.positional.first().map(String::as_str) {
        None if options.list_devices => {
            AudioStream::new(None, None)?.list_devices()?;
            Ok(())
        }
        None => run_live(&settings),
        Some("render") => {
            let [_, input, output, script] = options.positional.as_slice() else {
                return Err(anyhow!(
                    "usage: autolooper render <input.wav> <output.wav> <script.toml>"
                ));
            };
            let script = FootswitchScript::load(script)?;
            let summary = autolooper::audio::io::render_file(
                Path::new(input),
                Path::new(output),
                &script,
                &settings,
            )?;
            println!(
                "Rendered {} samples (loop {:.2}s)",
                summary.samples,
                settings.engine_config().samples_to_secs(summary.loop_length)
            );
            Ok(())
        }
        Some("serve-ram") => {
            let addr = options
                .positional
                .get(1)
                .ok_or_else(|| anyhow!("usage: autolooper serve-ram <addr>"))?;
            serve_ram(addr, settings.memory_bytes)
        }
        Some(other) => Err(anyhow!("unknown mode '{}', see --help", other)),
    }
}

fn run_live(settings: &LooperSettings) -> Result<()> {
    println!("Starting Autolooper...");

    let config = settings.engine_config();
    let audio_stream = AudioStream::new(
        settings.input_device.as_deref(),
        settings.output_device.as_deref(),
    )?;
    let (event_sender, event_receiver) = channel::bounded::<AudioEvent>(EVENT_QUEUE);

    match &settings.ram_server {
        Some(addr) => {
            let link = TcpStream::connect(addr)?;
            link.set_nodelay(true)?;
            log::info!("paging loop memory to {}", addr);
            let memory = SerialMemory::new(link, config.memory_bytes as u64);
            let (engine, streaming) = create_engine(config.clone(), memory);
            run_session(audio_stream, engine, streaming, event_sender, event_receiver)
        }
        None => {
            let memory = MemoryBank::new(config.memory_bytes);
            let (engine, streaming) = create_engine(config.clone(), memory);
            run_session(audio_stream, engine, streaming, event_sender, event_receiver)
        }
    }?;

    println!("Autolooper stopped.");
    Ok(())
}

fn run_session<M: ExternalMemory + Send + 'static>(
    audio_stream: AudioStream,
    engine: autolooper::LooperEngine,
    streaming: StreamingManager<M>,
    event_sender: channel::Sender<AudioEvent>,
    event_receiver: channel::Receiver<AudioEvent>,
) -> Result<()> {
    let config = engine.config().clone();
    let status = engine.status();
    let engine = engine.with_events(event_sender.clone());
    let mut streaming = streaming.with_events(event_sender.clone());

    let running = Arc::new(AtomicBool::new(true));
    let streaming_running = Arc::clone(&running);
    let streaming_thread = thread::spawn(move || streaming.run(&streaming_running));

    let footswitch = Arc::new(AtomicBool::new(false));
    let (_input_stream, _output_stream) =
        audio_stream.start(engine, Arc::clone(&footswitch), event_sender)?;

    let ui_result = TerminalUI::new(
        status,
        footswitch,
        event_receiver,
        audio_stream.input_device_name(),
        audio_stream.output_device_name(),
        config,
    )
    .and_then(|mut ui| ui.run())
    .map_err(|e| anyhow!("UI failed: {}", e));

    running.store(false, Ordering::Relaxed);
    if streaming_thread.join().is_err() {
        log::error!("streaming thread panicked");
    }
    ui_result
}

fn serve_ram(addr: &str, memory_bytes: usize) -> Result<()> {
    let listener = TcpListener::bind(addr)?;
    println!("Serving {} bytes of loop memory on {}", memory_bytes, addr);
    log::info!("serve-ram listening on {}", addr);

    // One client at a time; the bank outlives each connection
    let mut server = RamServer::new(MemoryBank::new(memory_bytes));
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!("client connected: {}", peer);
        match server.serve(&mut stream) {
            Ok(()) => log::info!("client disconnected: {}", peer),
            Err(e) => log::error!("client {} dropped: {}", peer, e),
        }
    }
    Ok(())
}
