use std::collections::HashMap;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseEvent,
    MouseEventKind,
};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction as LayoutDirection, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use textwrap::{wrap, Options as WrapOptions};
use tracing::{debug, info, warn};

use crate::card::Card;
use crate::media::{
    blend, illustration_for, AssetAssignments, Background, BackgroundPalette, Illustration,
    ImageInfo, ImmediateSurface, LoadEvent, LoadOutcome, Loader, Rgb,
};
use crate::net::Connectivity;
use crate::queue::{FeedQueue, FeedSnapshot, SubscriptionId};
use crate::services::CardServices;
use crate::swapper::{BufferId, MediaSlotSwapper};
use crate::virtualizer::{
    Direction, Effect, FeedSource, Input, ScrollState, Virtualizer, VirtualizerConfig,
};

const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_IDLE: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TICK_RATE: Duration = Duration::from_millis(40);
/// Scroll units per mouse wheel notch. Three notches pass the snap threshold.
const WHEEL_STEP: f32 = 12.0;
/// Scroll units per terminal row dragged with the mouse.
const DRAG_UNITS_PER_ROW: f32 = 8.0;
const COLLAPSED_BODY_LINES: usize = 8;
const MAX_CARD_WIDTH: u16 = 88;

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum IllustrationState {
    Ready(ImageInfo),
    Failed(String),
}

pub struct Options {
    pub queue: FeedQueue,
    pub services: Arc<CardServices>,
    pub virtualizer: VirtualizerConfig,
    pub palette: BackgroundPalette,
    /// Illustration downloads; `None` leaves cards text-only.
    pub loader: Option<Loader>,
    /// Reachability seen by the transport; an offline feed retries once it
    /// reports online again.
    pub network: Option<Arc<dyn Connectivity>>,
    pub status_message: String,
}

pub struct Model {
    queue: FeedQueue,
    services: Arc<CardServices>,
    virtualizer: Virtualizer,
    feed: FeedSnapshot,
    feed_rx: Receiver<FeedSnapshot>,
    subscription: SubscriptionId,
    palette: BackgroundPalette,
    backgrounds: MediaSlotSwapper<Background>,
    background_surface: ImmediateSurface,
    background_assignments: AssetAssignments<Background>,
    illustrations: MediaSlotSwapper<Illustration>,
    illustration_assignments: AssetAssignments<Illustration>,
    illustration_state: HashMap<String, IllustrationState>,
    loader: Option<Loader>,
    network: Option<Arc<dyn Connectivity>>,
    spinner: Spinner,
    status_message: String,
    needs_redraw: bool,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let (feed_tx, feed_rx) = unbounded();
        let subscription = opts.queue.subscribe(move |snapshot| {
            let _ = feed_tx.send(snapshot.clone());
        });
        let virtualizer = Virtualizer::new(
            opts.virtualizer,
            Arc::new(opts.queue.clone()),
            opts.services.narrator.clone(),
        );

        let mut model = Self {
            feed: opts.queue.snapshot(),
            queue: opts.queue,
            services: opts.services,
            virtualizer,
            feed_rx,
            subscription,
            palette: opts.palette,
            backgrounds: MediaSlotSwapper::new(),
            background_surface: ImmediateSurface::default(),
            background_assignments: AssetAssignments::default(),
            illustrations: MediaSlotSwapper::new(),
            illustration_assignments: AssetAssignments::default(),
            illustration_state: HashMap::new(),
            loader: opts.loader,
            network: opts.network,
            spinner: Spinner::new(),
            status_message: opts.status_message,
            needs_redraw: true,
        };
        // a short restored feed has to start growing before the first move
        model.queue.maybe_prefetch(model.virtualizer.index());
        model.sync_media();
        model
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        stdout.execute(EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(DisableMouseCapture)?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = TICK_RATE
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(8));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                                self.mark_dirty();
                            }
                        }
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse),
                    Event::Resize(_, _) => self.mark_dirty(),
                    _ => {}
                }
            }

            if last_tick.elapsed() >= TICK_RATE {
                last_tick = Instant::now();
                if self.step(last_tick) {
                    self.mark_dirty();
                }
                if self.feed.is_loading {
                    if self.spinner.advance() {
                        self.mark_dirty();
                    }
                } else {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn current_card(&self) -> Option<Card> {
        self.queue.card(self.virtualizer.index())
    }

    /// Drains queue snapshots and illustration completions.
    fn poll_async(&mut self) -> bool {
        let mut changed = false;
        let known = self.feed.len();
        while let Ok(snapshot) = self.feed_rx.try_recv() {
            if snapshot.version >= self.feed.version {
                self.feed = snapshot;
            }
            changed = true;
        }
        if changed {
            if self.feed.len() > known {
                // a short batch can leave the current card near the end again
                self.queue.maybe_prefetch(self.virtualizer.index());
            }
            self.sync_media();
        }

        let events: Vec<LoadEvent> = self
            .loader
            .as_ref()
            .map(|loader| loader.events().try_iter().collect())
            .unwrap_or_default();
        for event in events {
            self.on_illustration_event(event);
            changed = true;
        }
        changed
    }

    fn on_illustration_event(&mut self, event: LoadEvent) {
        match event.outcome {
            LoadOutcome::Loaded(info) => {
                self.illustrations.on_loaded(event.buffer, &event.url);
                self.illustration_state
                    .insert(event.url, IllustrationState::Ready(info));
            }
            LoadOutcome::Failed(reason) => {
                self.illustrations.on_error(event.buffer, &event.url);
                self.illustration_state
                    .insert(event.url, IllustrationState::Failed(reason));
            }
        }
    }

    /// Advances timers: settle debounce and reset timeout.
    fn step(&mut self, now: Instant) -> bool {
        self.retry_when_reachable();
        let before = self.virtualizer.state();
        self.virtualizer.tick(now);
        let changed = self.apply_effects(now) || before != self.virtualizer.state();
        if changed {
            self.sync_media();
        }
        changed
    }

    fn retry_when_reachable(&mut self) {
        if !self.feed.is_offline() || self.feed.is_loading {
            return;
        }
        let Some(network) = &self.network else {
            return;
        };
        if !network.is_online() {
            return;
        }
        debug!("network may be back, retrying feed");
        if !self.queue.initialize() {
            self.queue.maybe_prefetch(self.virtualizer.index());
        }
    }

    fn input(&mut self, input: Input, now: Instant) {
        self.virtualizer.handle(input, now);
        self.apply_effects(now);
        self.sync_media();
        self.mark_dirty();
    }

    fn apply_effects(&mut self, now: Instant) -> bool {
        let effects = self.virtualizer.drain_effects();
        let changed = !effects.is_empty();
        for effect in effects {
            match effect {
                // The terminal has no native scroller: the written offset is
                // shown on the next frame, so acknowledge it right away.
                Effect::ScrollTo(offset) => {
                    if matches!(self.virtualizer.state(), ScrollState::Resetting { .. }) {
                        self.virtualizer.handle(Input::Scrolled(offset), now);
                    }
                }
                Effect::IndexChanged { from, to } => {
                    debug!(from, to, "card changed");
                    self.status_message.clear();
                }
            }
        }
        changed
    }

    /// Points both swappers at the current card and warms them with the
    /// card the gesture is heading toward.
    fn sync_media(&mut self) {
        if let Some(card) = self.current_card() {
            let palette = &self.palette;
            if let Some(background) = self
                .background_assignments
                .get_or_assign(&card, |_| Some(palette.pick()))
            {
                self.backgrounds
                    .set_target(&background, &mut self.background_surface);
            }
            if let (Some(illustration), Some(loader)) = (
                self.illustration_assignments
                    .get_or_assign(&card, illustration_for),
                self.loader.as_mut(),
            ) {
                self.illustrations.set_target(&illustration, loader);
            }
        }

        if let Some(predicted) = self
            .virtualizer
            .predicted_index()
            .and_then(|index| self.queue.card(index))
        {
            let palette = &self.palette;
            if let Some(background) = self
                .background_assignments
                .get_or_assign(&predicted, |_| Some(palette.pick()))
            {
                self.backgrounds
                    .preload(&background, &mut self.background_surface);
            }
            if let (Some(illustration), Some(loader)) = (
                self.illustration_assignments
                    .get_or_assign(&predicted, illustration_for),
                self.loader.as_mut(),
            ) {
                self.illustrations.preload(&illustration, loader);
            }
        }

        for (buffer, key) in self.background_surface.drain() {
            self.backgrounds.on_loaded(buffer, &key);
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        let now = Instant::now();
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down | KeyCode::Char(' ') | KeyCode::PageDown => {
                self.input(Input::Next, now);
            }
            KeyCode::Char('k') | KeyCode::Up | KeyCode::PageUp => {
                self.input(Input::Previous, now);
            }
            KeyCode::Char('t') => self.toggle_topic(),
            KeyCode::Char('r') => self.refresh(),
            KeyCode::Char('s') => {
                if let Some(card) = self.current_card() {
                    self.status_message = if self.services.saved.toggle(&card.id) {
                        format!("Saved \"{}\" for this session.", card.title)
                    } else {
                        format!("Removed \"{}\" from saved cards.", card.title)
                    };
                }
            }
            KeyCode::Char('e') => {
                if let Some(card) = self.current_card() {
                    self.services.expanded.toggle(&card.id);
                }
            }
            KeyCode::Char('o') => self.open_current_link(),
            _ => return Ok(false),
        }
        self.mark_dirty();
        Ok(false)
    }

    fn handle_mouse(&mut self, event: MouseEvent) {
        let now = Instant::now();
        let y = event.row as f32 * DRAG_UNITS_PER_ROW;
        let input = match event.kind {
            MouseEventKind::ScrollDown => Input::Wheel(WHEEL_STEP),
            MouseEventKind::ScrollUp => Input::Wheel(-WHEEL_STEP),
            MouseEventKind::Down(_) => Input::PointerDown(y),
            MouseEventKind::Drag(_) => Input::PointerMove(y),
            MouseEventKind::Up(_) => Input::PointerUp,
            _ => return,
        };
        self.input(input, now);
    }

    fn toggle_topic(&mut self) {
        if self.feed.topic.is_some() {
            self.queue.disable_topic();
            self.status_message = "Topic mode off. Back to random cards.".into();
            return;
        }
        match self.current_card() {
            Some(card) => {
                self.queue.enable_topic(&card.title);
                self.status_message = format!("More like \"{}\" coming up.", card.title);
            }
            None => self.status_message = "Nothing to anchor a topic on yet.".into(),
        }
    }

    fn refresh(&mut self) {
        self.queue.refresh();
        self.virtualizer.reset();
        self.virtualizer.drain_effects();
        self.services.expanded.clear();
        self.status_message = "Starting a fresh feed…".into();
        info!("feed refresh requested");
    }

    fn open_current_link(&mut self) {
        let Some(card) = self.current_card() else {
            return;
        };
        match webbrowser::open(&card.link) {
            Ok(_) => self.status_message = format!("Opened {}", card.link),
            Err(err) => {
                warn!(error = %err, link = %card.link, "open link failed");
                self.status_message = format!("Failed to open link: {}", err);
            }
        }
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let layout = Layout::default()
            .direction(LayoutDirection::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(frame.size());

        let status = status_line(
            &self.feed,
            self.virtualizer.index(),
            &self.status_message,
            self.spinner.frame(),
        );
        let status_color = if self.feed.error.is_some() {
            COLOR_ERROR
        } else {
            COLOR_TEXT_PRIMARY
        };
        frame.render_widget(
            Paragraph::new(status).style(
                Style::default()
                    .fg(status_color)
                    .bg(COLOR_PANEL_FOCUSED_BG)
                    .add_modifier(Modifier::BOLD),
            ),
            layout[0],
        );

        self.draw_background(frame, layout[1]);
        self.draw_feed(frame, layout[1]);

        let footer = Paragraph::new(
            "j/k next/prev · wheel scroll · t topic · r refresh · s save · e expand · o open · q quit",
        )
        .style(
            Style::default()
                .fg(COLOR_TEXT_SECONDARY)
                .bg(COLOR_PANEL_BG)
                .add_modifier(Modifier::ITALIC),
        )
        .alignment(Alignment::Center);
        frame.render_widget(footer, layout[2]);
    }

    fn draw_background(&self, frame: &mut Frame<'_>, area: Rect) {
        let fade = self.backgrounds.crossfade(self.virtualizer.progress());
        let layer = |id: BufferId, fraction: f32| -> Rgb {
            self.backgrounds
                .buffer(id)
                .asset
                .as_ref()
                .map(|bg| bg.at(fraction))
                .unwrap_or((0, 0, 0))
        };
        let span = area.height.saturating_sub(1).max(1) as f32;
        for row in 0..area.height {
            let fraction = row as f32 / span;
            let (r, g, b) = blend(
                layer(BufferId::A, fraction),
                fade.get(BufferId::A),
                layer(BufferId::B, fraction),
                fade.get(BufferId::B),
            );
            let line = Rect::new(area.x, area.y + row, area.width, 1);
            frame.render_widget(
                Block::default().style(Style::default().bg(Color::Rgb(r, g, b))),
                line,
            );
        }
    }

    fn draw_feed(&self, frame: &mut Frame<'_>, area: Rect) {
        let width = area.width.min(MAX_CARD_WIDTH);
        let column = Rect::new(
            area.x + (area.width - width) / 2,
            area.y,
            width,
            area.height,
        );
        let rows = Layout::default()
            .direction(LayoutDirection::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(column);

        let slots = self.virtualizer.slots();
        let progress = self.virtualizer.progress();
        let heading = self.virtualizer.direction();
        self.draw_peek(
            frame,
            rows[0],
            "▲",
            slots.prev.as_ref(),
            if heading == Direction::TowardPrevious { progress } else { 0.0 },
        );
        self.draw_peek(
            frame,
            rows[2],
            "▼",
            slots.next.as_ref(),
            if heading == Direction::TowardNext { progress } else { 0.0 },
        );

        match slots.current.as_ref() {
            Some(card) => self.draw_card(frame, rows[1], card),
            None => {
                let message = if self.feed.is_loading {
                    format!("{} Loading cards…", self.spinner.frame())
                } else if self.feed.is_offline() {
                    "You are offline and nothing is cached yet. Cards load once the connection is back."
                        .to_string()
                } else if let Some(err) = &self.feed.error {
                    format!("Could not load cards: {}. Press r to retry.", err)
                } else {
                    "No cards yet. Press r to load some.".to_string()
                };
                frame.render_widget(
                    Paragraph::new(message)
                        .alignment(Alignment::Center)
                        .style(Style::default().fg(COLOR_TEXT_SECONDARY))
                        .wrap(Wrap { trim: true }),
                    rows[1],
                );
            }
        }
    }

    fn draw_peek(
        &self,
        frame: &mut Frame<'_>,
        area: Rect,
        marker: &str,
        card: Option<&Card>,
        emphasis: f32,
    ) {
        let Some(card) = card else {
            return;
        };
        let color = if emphasis >= 0.3 {
            COLOR_ACCENT
        } else {
            COLOR_TEXT_SECONDARY
        };
        frame.render_widget(
            Paragraph::new(format!("{marker} {}", card.title))
                .alignment(Alignment::Center)
                .style(Style::default().fg(color)),
            area,
        );
    }

    fn draw_card(&self, frame: &mut Frame<'_>, area: Rect, card: &Card) {
        let view = self.services.view(&card.id);
        let dragging = matches!(self.virtualizer.state(), ScrollState::Dragging { .. });
        let title = format!(
            " {} / {}{} ",
            self.virtualizer.index() + 1,
            self.feed.len(),
            if view.saved { " ★" } else { "" }
        );
        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .padding(Padding::horizontal(1))
            .border_style(Style::default().fg(if dragging {
                COLOR_BORDER_FOCUSED
            } else {
                COLOR_BORDER_IDLE
            }))
            .style(Style::default().bg(COLOR_PANEL_BG));

        let inner_width = area.width.saturating_sub(4).max(10) as usize;
        let mut lines = vec![
            Line::from(Span::styled(
                card.title.clone(),
                Style::default()
                    .fg(COLOR_TEXT_PRIMARY)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::default(),
        ];
        for text in body_lines(&card.body, view.expanded, inner_width) {
            lines.push(Line::from(Span::styled(
                text,
                Style::default().fg(COLOR_TEXT_PRIMARY),
            )));
        }
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            card.link.clone(),
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::UNDERLINED),
        )));
        if let Some(status) = self.illustration_line(card) {
            lines.push(status);
        }
        if let Some(credit) = card.attribution.as_ref().and_then(|a| a.credit_line()) {
            lines.push(Line::from(Span::styled(
                credit,
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .add_modifier(Modifier::ITALIC),
            )));
        }

        frame.render_widget(
            Paragraph::new(Text::from(lines))
                .block(block)
                .wrap(Wrap { trim: false }),
            area,
        );
    }

    /// Image status for `card`, read from the illustration swapper: the image
    /// counts as shown only once its buffer is active, and it fades with the
    /// active buffer while the gesture moves away.
    fn illustration_line(&self, card: &Card) -> Option<Line<'static>> {
        self.loader.as_ref()?;
        let wanted = illustration_for(card)?;
        let active = self.illustrations.active();
        let (text, color) = if self.illustrations.active_asset() == Some(&wanted) {
            let text = match self.illustration_state.get(&wanted.url) {
                Some(IllustrationState::Ready(info)) => {
                    format!("▣ image {} ({})", info.mime, format_bytes(info.size_bytes))
                }
                _ => "▣ image".to_string(),
            };
            let opacity = self
                .illustrations
                .crossfade(self.virtualizer.progress())
                .get(active);
            (text, faded(COLOR_SUCCESS, opacity))
        } else {
            match self.illustration_state.get(&wanted.url) {
                Some(IllustrationState::Failed(reason)) => {
                    (format!("▢ image unavailable: {}", reason), COLOR_ERROR)
                }
                _ => ("▢ loading image…".to_string(), COLOR_TEXT_SECONDARY),
            }
        };
        Some(Line::from(Span::styled(text, Style::default().fg(color))))
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.queue.unsubscribe(self.subscription);
    }
}

/// `color` at `opacity` over the card panel.
fn faded(color: Color, opacity: f32) -> Color {
    match (color, COLOR_PANEL_BG) {
        (Color::Rgb(r, g, b), Color::Rgb(br, bg, bb)) => {
            let (r, g, b) = blend((r, g, b), opacity, (br, bg, bb), 1.0 - opacity);
            Color::Rgb(r, g, b)
        }
        _ => color,
    }
}

/// Wraps `body` to `width`, cutting it to a preview unless `expanded`.
fn body_lines(body: &str, expanded: bool, width: usize) -> Vec<String> {
    let options = WrapOptions::new(width.max(1));
    let mut lines: Vec<String> = wrap(body, options)
        .into_iter()
        .map(|line| line.into_owned())
        .collect();
    if !expanded && lines.len() > COLLAPSED_BODY_LINES {
        lines.truncate(COLLAPSED_BODY_LINES);
        if let Some(last) = lines.last_mut() {
            last.push_str(" … (e to expand)");
        }
    }
    lines
}

fn status_line(feed: &FeedSnapshot, index: usize, message: &str, spinner: &str) -> String {
    let mut parts = Vec::new();
    if feed.is_loading {
        parts.push(format!("{spinner} loading"));
    }
    if !feed.is_empty() {
        parts.push(format!("{}/{}", (index + 1).min(feed.len()), feed.len()));
    }
    if let Some(topic) = &feed.topic {
        parts.push(format!("topic: {topic}"));
    }
    if feed.is_offline() {
        parts.push(if feed.is_empty() {
            "offline".to_string()
        } else {
            "offline, showing cached cards".to_string()
        });
    } else if let Some(err) = &feed.error {
        parts.push(format!("could not load more: {err}"));
    }
    if !message.is_empty() {
        parts.push(message.to_string());
    }
    parts.join(" · ")
}

fn format_bytes(bytes: usize) -> String {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value >= KIB * KIB {
        format!("{:.1} MB", value / (KIB * KIB))
    } else if value >= KIB {
        format!("{:.0} KB", value / KIB)
    } else {
        format!("{bytes} B")
    }
}
