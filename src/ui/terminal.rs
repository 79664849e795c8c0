use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{
        EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
        supports_keyboard_enhancement,
    },
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
};
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::audio::{AudioEvent, EngineConfig, EngineStatus, TransportState};

const EVENT_LOG_LINES: usize = 8;
/// Switch-down time for a Space press on terminals that never report releases.
const MOMENTARY_TAP: Duration = Duration::from_millis(30);

/// How the keyboard drives the footswitch.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SwitchMode {
    /// The terminal reports key releases; Space is held like a pedal.
    PressRelease,
    /// Space is a short tap; `H` latches the switch down for holds.
    Momentary,
}

pub struct TerminalUI {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
    status: Arc<EngineStatus>,
    footswitch: Arc<AtomicBool>,
    event_receiver: crossbeam::channel::Receiver<AudioEvent>,
    config: EngineConfig,
    is_running: bool,
    last_update: Instant,
    switch_mode: SwitchMode,
    tap_until: Option<Instant>,
    hold_latched: bool,
    input_device_name: String,
    output_device_name: String,
    event_log: VecDeque<String>,
}

impl TerminalUI {
    pub fn new(
        status: Arc<EngineStatus>,
        footswitch: Arc<AtomicBool>,
        event_receiver: crossbeam::channel::Receiver<AudioEvent>,
        input_device_name: &str,
        output_device_name: &str,
        config: EngineConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;

        let switch_mode = if supports_keyboard_enhancement().unwrap_or(false) {
            execute!(
                stdout,
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
            SwitchMode::PressRelease
        } else {
            SwitchMode::Momentary
        };
        log::info!("footswitch keyboard mode: {:?}", switch_mode);

        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            status,
            footswitch,
            event_receiver,
            config,
            is_running: true,
            last_update: Instant::now(),
            switch_mode,
            tap_until: None,
            hold_latched: false,
            input_device_name: input_device_name.to_string(),
            output_device_name: output_device_name.to_string(),
            event_log: VecDeque::with_capacity(EVENT_LOG_LINES),
        })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        while self.is_running {
            self.process_events()?;
            self.release_momentary_tap();

            if self.last_update.elapsed() >= Duration::from_millis(50) {
                self.draw()?;
                self.last_update = Instant::now();
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        self.footswitch.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if event::poll(Duration::from_millis(0))?
            && let Event::Key(key) = event::read()?
        {
            self.handle_key_event(key);
        }

        while let Ok(event) = self.event_receiver.try_recv() {
            self.handle_audio_event(event);
        }

        Ok(())
    }

    fn handle_key_event(&mut self, key: KeyEvent) {
        match (key.code, key.kind) {
            (KeyCode::Char(' '), KeyEventKind::Press) => match self.switch_mode {
                SwitchMode::PressRelease => self.footswitch.store(true, Ordering::Relaxed),
                SwitchMode::Momentary => {
                    self.footswitch.store(true, Ordering::Relaxed);
                    self.tap_until = Some(Instant::now() + MOMENTARY_TAP);
                }
            },
            (KeyCode::Char(' '), KeyEventKind::Release) if !self.hold_latched => {
                self.footswitch.store(false, Ordering::Relaxed);
            }
            (KeyCode::Char('h') | KeyCode::Char('H'), KeyEventKind::Press) => {
                self.hold_latched = !self.hold_latched;
                self.tap_until = None;
                self.footswitch.store(self.hold_latched, Ordering::Relaxed);
            }
            (KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc, KeyEventKind::Press) => {
                self.is_running = false;
            }
            _ => {}
        }
    }

    fn release_momentary_tap(&mut self) {
        if let Some(until) = self.tap_until
            && Instant::now() >= until
        {
            self.tap_until = None;
            if !self.hold_latched {
                self.footswitch.store(false, Ordering::Relaxed);
            }
        }
    }

    fn handle_audio_event(&mut self, event: AudioEvent) {
        let line = describe_event(&event, &self.config);
        match event {
            AudioEvent::MemoryFault(_) | AudioEvent::Error(_) => log::error!("{}", line),
            AudioEvent::Overrun { .. } => log::warn!("{}", line),
            _ => log::debug!("{}", line),
        }
        if self.event_log.len() == EVENT_LOG_LINES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(line);
    }

    fn draw(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let status = Arc::clone(&self.status);
        let config = self.config.clone();
        let input_device_name = self.input_device_name.clone();
        let output_device_name = self.output_device_name.clone();
        let event_log: Vec<String> = self.event_log.iter().cloned().collect();
        let switch_down = self.footswitch.load(Ordering::Relaxed);
        let switch_mode = self.switch_mode;

        self.terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(3), // Header
                    Constraint::Length(7), // Transport
                    Constraint::Min(0),    // Events
                    Constraint::Length(4), // Footer
                ])
                .split(f.area());

            Self::draw_header_static(f, chunks[0], &input_device_name, &output_device_name);
            Self::draw_transport_static(f, chunks[1], &status, &config, switch_down);
            Self::draw_events_static(f, chunks[2], &event_log);
            Self::draw_footer_static(f, chunks[3], switch_mode);
        })?;
        Ok(())
    }

    fn draw_header_static(
        f: &mut Frame,
        area: Rect,
        input_device_name: &str,
        output_device_name: &str,
    ) {
        let header = Paragraph::new(format!(
            "Input: {} | Output: {}",
            input_device_name, output_device_name
        ))
        .style(
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .alignment(ratatui::layout::Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title("Autolooper"));
        f.render_widget(header, area);
    }

    fn draw_transport_static(
        f: &mut Frame,
        area: Rect,
        status: &EngineStatus,
        config: &EngineConfig,
        switch_down: bool,
    ) {
        let block = Block::default().borders(Borders::ALL).title("Transport");
        let inner = block.inner(area);
        f.render_widget(block, area);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Min(0),
            ])
            .split(inner);

        let state = status.state();
        let loop_length = status.loop_length();
        let loop_time = status.loop_time();

        let state_line = Line::from(vec![
            Span::styled(
                format!(" {} ", state),
                Style::default()
                    .fg(state_color(state))
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                if switch_down { " [switch down] " } else { "" },
                Style::default().fg(Color::Yellow),
            ),
        ]);
        f.render_widget(Paragraph::new(state_line), rows[0]);

        let loop_line = if loop_length == 0 {
            format!(" No loop ({:.1}s max)", config.samples_to_secs(config.max_loop_length()))
        } else {
            format!(
                " Loop: {:.2}s | Undo: {} | Old regions: {}",
                config.samples_to_secs(loop_length),
                if status.undo() { "on" } else { "off" },
                status.old_regions()
            )
        };
        f.render_widget(Paragraph::new(loop_line), rows[1]);

        let overruns = status.overruns();
        let transfer_line = Line::from(vec![
            Span::raw(" Transfer: "),
            Span::styled(
                if status.transfer_pending() { "busy" } else { "idle" },
                Style::default().fg(Color::Cyan),
            ),
            Span::raw(" | Overruns: "),
            Span::styled(
                overruns.to_string(),
                Style::default().fg(if overruns > 0 { Color::Red } else { Color::Green }),
            ),
        ]);
        f.render_widget(Paragraph::new(transfer_line), rows[2]);

        let ratio = if loop_length > 0 {
            (loop_time as f64 / loop_length as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(state_color(state)))
            .ratio(ratio)
            .label(format!(
                "{:.2}s / {:.2}s",
                config.samples_to_secs(loop_time),
                config.samples_to_secs(loop_length)
            ));
        f.render_widget(gauge, rows[3]);
    }

    fn draw_events_static(f: &mut Frame, area: Rect, event_log: &[String]) {
        let items: Vec<ListItem> = event_log
            .iter()
            .map(|line| ListItem::new(line.as_str()))
            .collect();
        let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Events"));
        f.render_widget(list, area);
    }

    fn draw_footer_static(f: &mut Frame, area: Rect, switch_mode: SwitchMode) {
        let key_color = Color::Yellow;
        let desc_color = Color::White;
        let sep_color = Color::DarkGray;

        let key_desc = |key: &str, desc: &str| -> Vec<Span> {
            vec![
                Span::styled(
                    key.to_string(),
                    Style::default().fg(key_color).add_modifier(Modifier::BOLD),
                ),
                Span::styled("=".to_string(), Style::default().fg(sep_color)),
                Span::styled(desc.to_string(), Style::default().fg(desc_color)),
            ]
        };
        let separator = || Span::styled(" | ".to_string(), Style::default().fg(sep_color));

        let mut spans = Vec::new();
        match switch_mode {
            SwitchMode::PressRelease => {
                spans.extend(key_desc("Space", "Footswitch (hold for long press)"));
            }
            SwitchMode::Momentary => {
                spans.extend(key_desc("Space", "Tap"));
                spans.push(separator());
                spans.extend(key_desc("H", "Hold on/off"));
            }
        }
        spans.push(separator());
        spans.extend(key_desc("Q", "Quit"));

        let footer = Paragraph::new(vec![Line::from(spans)])
            .block(Block::default().borders(Borders::ALL).title("Controls"));
        f.render_widget(footer, area);
    }
}

fn state_color(state: TransportState) -> Color {
    match state {
        TransportState::Idle | TransportState::Stopped | TransportState::FirstStop => {
            Color::DarkGray
        }
        TransportState::FirstRecord | TransportState::Record => Color::Red,
        TransportState::FirstTempRecord | TransportState::TempRecord => Color::Magenta,
        TransportState::FirstPlayback | TransportState::Play | TransportState::Playback1 => {
            Color::Green
        }
    }
}

fn describe_event(event: &AudioEvent, config: &EngineConfig) -> String {
    match event {
        AudioEvent::StateChanged { from, to } => format!("{} -> {}", from, to),
        AudioEvent::FirstTakeClosed { loop_length } => format!(
            "first take closed at {:.2}s",
            config.samples_to_secs(*loop_length)
        ),
        AudioEvent::UndoToggled(true) => "last overdub undone".to_string(),
        AudioEvent::UndoToggled(false) => "last overdub restored".to_string(),
        AudioEvent::ScratchCommitted { start, size } => format!(
            "temp record of {:.2}s at {:.2}s",
            config.samples_to_secs(*size),
            config.samples_to_secs(*start)
        ),
        AudioEvent::ScratchMerged => "temp record merged".to_string(),
        AudioEvent::Overrun { origin } => format!("transfer overrun at sample {}", origin),
        AudioEvent::RegionFolded { positions } => {
            format!("oldest overdub folded into the loop ({} positions)", positions)
        }
        AudioEvent::MemoryFault(msg) => format!("memory fault: {}", msg),
        AudioEvent::Error(msg) => format!("error: {}", msg),
    }
}

impl Drop for TerminalUI {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        if self.switch_mode == SwitchMode::PressRelease {
            let _ = execute!(self.terminal.backend_mut(), PopKeyboardEnhancementFlags);
        }
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        );
    }
}
