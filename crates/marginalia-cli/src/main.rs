mod document;
mod sidecar;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Stdout, stdout};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use std::{env, process};

use anyhow::{Context, Result};
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
        MouseButton, MouseEvent, MouseEventKind,
    },
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use marginalia_config::Config;
use marginalia_engine::interaction::{AnnotationEditor, DefinitionStatus};
use marginalia_engine::overlay::Decoration;
use marginalia_engine::session::execute as run_collaborator;
use marginalia_engine::{
    BlockId, CellMetrics, ContentTree, Effect, Event as ReaderEvent, HighlightKind, InteractionState,
    MonospaceSurface, NativeSelection, OverlayConfig, Point, ReaderSession, RecomputeTrigger, SelectionConfig,
    SelectionPoint, TextSurface, TooltipAction,
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    buffer::Buffer,
    layout::{Constraint, Layout, Position, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use tokio::runtime::Runtime;

use document::split_blocks;
use sidecar::SidecarStore;

/// Blank rows between blocks
const BLOCK_GAP_ROWS: usize = 1;
/// Lanes searched below a clicked line when looking for a hit-strip
const STRIP_LANES: i32 = 4;
const IDLE_TICK: Duration = Duration::from_millis(250);
const POPUP_WIDTH: u16 = 48;

struct ViewBlock {
    id: BlockId,
    index: usize,
    surface: MonospaceSurface,
    /// First document row
    top_row: usize,
    rows: usize,
}

struct App {
    path: PathBuf,
    store: Rc<SidecarStore>,
    session: ReaderSession<SidecarStore>,
    blocks: Vec<ViewBlock>,
    metrics: CellMetrics,
    overlay: OverlayConfig,
    columns: usize,
    scroll: usize,
    /// Where the current mouse drag started
    drag: Option<SelectionPoint>,
    /// Collaborator calls waiting for the next frame
    queued: VecDeque<Effect>,
    status: String,
    saved_version: u64,
}

impl App {
    fn new(path: PathBuf, config: &Config, columns: usize) -> Result<Self> {
        let source = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let store = Rc::new(SidecarStore::open(&path)?);

        let overlay = OverlayConfig {
            nudge_px: config.overlay.nudge_px,
            hit_strip_px: config.overlay.hit_strip_px,
        };
        let selection = SelectionConfig {
            debounce: Duration::from_millis(config.selection.debounce_ms),
        };
        let metrics = CellMetrics {
            cell_width: config.layout.cell_width,
            line_height: config.layout.line_height,
        };
        let mut session = ReaderSession::new(Rc::clone(&store), overlay, selection);

        let mut persisted = store.entities_by_block();
        let mut blocks = Vec::new();
        for (index, source_block) in split_blocks(&source).into_iter().enumerate() {
            let content = ContentTree::from_markdown(&source_block.markdown);
            let surface = MonospaceSurface::new(content, metrics, columns as f32 * metrics.cell_width);
            let entities = persisted.remove(&source_block.id).unwrap_or_default();
            session.load_entities(source_block.id.clone(), entities);
            session.mount_block(source_block.id.clone(), index);
            blocks.push(ViewBlock {
                id: source_block.id,
                index,
                surface,
                top_row: 0,
                rows: 0,
            });
        }
        // Keep metadata for blocks that vanished from the file so the next
        // save does not drop it
        for (block_id, entities) in persisted {
            log::warn!("block {block_id} has metadata but is not in {}", path.display());
            session.load_entities(block_id, entities);
        }

        log::info!("opened {} with {} blocks", path.display(), blocks.len());
        let saved_version = session.entities().version();
        let mut app = Self {
            path,
            store,
            session,
            blocks,
            metrics,
            overlay,
            columns,
            scroll: 0,
            drag: None,
            queued: VecDeque::new(),
            status: String::new(),
            saved_version,
        };
        app.stack_blocks();
        Ok(app)
    }

    /// Lay blocks out top to bottom in document rows.
    fn stack_blocks(&mut self) {
        let lh = self.metrics.line_height;
        let mut row = 0;
        for block in &mut self.blocks {
            block.top_row = row;
            block.surface.set_origin(Point::new(0.0, row as f32 * lh));
            let text_rows = (block.surface.size().height / lh).ceil() as usize;
            block.rows = text_rows + self.session.generated_notes(&block.id).len();
            row += block.rows + BLOCK_GAP_ROWS;
        }
    }

    fn total_rows(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.top_row + b.rows)
    }

    fn set_columns(&mut self, columns: usize) {
        if columns == self.columns {
            return;
        }
        self.columns = columns;
        let width = columns as f32 * self.metrics.cell_width;
        for block in &mut self.blocks {
            block.surface.set_width(width);
        }
        self.stack_blocks();
        self.session.invalidate_all(RecomputeTrigger::Resize);
        self.scroll = self.scroll.min(self.total_rows());
    }

    fn scroll_by(&mut self, delta: isize) {
        let max = self.total_rows().saturating_sub(1);
        self.scroll = self.scroll.saturating_add_signed(delta).min(max);
    }

    /// Document pixel point at the centre of a terminal cell.
    fn doc_point(&self, area: Rect, column: u16, row: u16) -> Option<Point> {
        if !area.contains(Position::new(column, row)) {
            return None;
        }
        let cw = self.metrics.cell_width;
        let lh = self.metrics.line_height;
        let doc_row = (row - area.y) as usize + self.scroll;
        Some(Point::new(
            (column - area.x) as f32 * cw + cw / 2.0,
            doc_row as f32 * lh + lh / 2.0,
        ))
    }

    /// The block under a document point, with the point made block-relative.
    fn locate(&self, doc: Point) -> Option<(usize, Point)> {
        let row = (doc.y / self.metrics.line_height) as usize;
        let index = self
            .blocks
            .iter()
            .position(|b| row >= b.top_row && row < b.top_row + b.rows)?;
        let origin = self.blocks[index].surface.origin();
        Some((index, doc - origin))
    }

    fn block_index(&self, block_id: &BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| &b.id == block_id)
    }

    fn on_mouse(&mut self, area: Rect, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => self.mouse_down(area, mouse.column, mouse.row),
            MouseEventKind::Drag(MouseButton::Left) => self.mouse_drag(area, mouse.column, mouse.row),
            MouseEventKind::ScrollDown => self.scroll_by(3),
            MouseEventKind::ScrollUp => self.scroll_by(-3),
            _ => {}
        }
    }

    fn mouse_down(&mut self, area: Rect, column: u16, row: u16) {
        let now = Instant::now();
        if let Some(anchor) = self.drag.take()
            && let Some(i) = self.block_index(&anchor.block_id)
        {
            let effects = self
                .session
                .observe_selection(&anchor.block_id, now, None, &self.blocks[i].surface);
            self.handle(effects);
        }

        let Some(doc) = self.doc_point(area, column, row) else {
            return;
        };
        let Some((i, local)) = self.locate(doc) else {
            let effects = self.session.dispatch(ReaderEvent::ClickOutside);
            self.handle(effects);
            return;
        };
        let effects = self.click_block(i, local);
        self.handle(effects);

        if self.session.state().surface().is_none() {
            let block = &self.blocks[i];
            self.drag = block.surface.caret_at(doc).map(|p| SelectionPoint {
                block_id: block.id.clone(),
                block_index: block.index,
                node: p.node,
                offset: p.offset,
            });
        }
    }

    /// A terminal cell is far taller than a hit-strip, so try the strip
    /// band of each lane under the clicked line before treating the click as
    /// outside.
    fn click_block(&mut self, i: usize, local: Point) -> Vec<Effect> {
        let block = &self.blocks[i];
        let lh = self.metrics.line_height;
        let line_top = (local.y / lh).floor() * lh;
        let strip = self.overlay.hit_strip_px;
        for lane in 0..STRIP_LANES {
            let y = line_top + lh - strip / 2.0 + (lane * self.overlay.nudge_px) as f32;
            let target = Point::new(local.x, y);
            if self.session.highlight_at(&block.id, &block.surface, target).is_some() {
                return self.session.click(&block.id, &block.surface, target);
            }
        }
        self.session.click(&block.id, &block.surface, local)
    }

    fn mouse_drag(&mut self, area: Rect, column: u16, row: u16) {
        let Some(anchor) = self.drag.clone() else {
            return;
        };
        let Some(doc) = self.doc_point(area, column, row) else {
            return;
        };
        let (Some((i, _)), Some(a)) = (self.locate(doc), self.block_index(&anchor.block_id)) else {
            return;
        };
        let focus_block = &self.blocks[i];
        let Some(caret) = focus_block.surface.caret_at(doc) else {
            return;
        };
        let native = NativeSelection {
            focus: SelectionPoint {
                block_id: focus_block.id.clone(),
                block_index: focus_block.index,
                node: caret.node,
                offset: caret.offset,
            },
            anchor,
        };
        let effects = self.session.observe_selection(
            &native.anchor.block_id,
            Instant::now(),
            Some(&native),
            &self.blocks[a].surface,
        );
        self.handle(effects);
    }

    /// Let debounced selections settle.
    fn tick(&mut self) {
        let now = Instant::now();
        let mut effects = Vec::new();
        for block in &self.blocks {
            effects.extend(self.session.poll_selection(&block.id, now, &block.surface));
        }
        self.handle(effects);
    }

    /// Returns true when the app should quit.
    fn on_key(&mut self, key: KeyEvent) -> bool {
        let state = self.session.state().clone();
        let event = match (&state, key.code) {
            (_, KeyCode::Esc) => Some(ReaderEvent::Escape),
            (InteractionState::Annotation(editor), _) => editor_key(editor, key),
            (InteractionState::Tooltip(_), KeyCode::Char('d')) => Some(ReaderEvent::Action(TooltipAction::Define)),
            (InteractionState::Tooltip(_), KeyCode::Char('a')) => {
                Some(ReaderEvent::Action(TooltipAction::Annotate))
            }
            (InteractionState::Tooltip(t), KeyCode::Char('r')) if t.error.is_some() => Some(ReaderEvent::Retry),
            (InteractionState::Tooltip(_), KeyCode::Char('r')) => {
                Some(ReaderEvent::Action(TooltipAction::Rabbithole))
            }
            (InteractionState::Definition(d), KeyCode::Char('r'))
                if matches!(d.status, DefinitionStatus::Failed(_)) =>
            {
                Some(ReaderEvent::Retry)
            }
            (_, KeyCode::Char('q')) => return true,
            (_, KeyCode::Down | KeyCode::Char('j')) => {
                self.scroll_by(1);
                None
            }
            (_, KeyCode::Up | KeyCode::Char('k')) => {
                self.scroll_by(-1);
                None
            }
            (_, KeyCode::PageDown) => {
                self.scroll_by(10);
                None
            }
            (_, KeyCode::PageUp) => {
                self.scroll_by(-10);
                None
            }
            _ => None,
        };
        if let Some(event) = event {
            let effects = self.session.dispatch(event);
            self.handle(effects);
        }
        false
    }

    /// Carry out what the session left to the host. Collaborator calls are
    /// queued so the loading state gets painted before they run.
    fn handle(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                effect if effect.is_async() => self.queued.push_back(effect),
                Effect::OpenConversation { conversation_id } => {
                    log::info!("opening conversation {conversation_id}");
                    self.status = format!("Conversation {conversation_id}");
                }
                Effect::ClearNativeSelection => self.drag = None,
                other => log::debug!("ignoring effect {other:?}"),
            }
        }
        self.persist();
    }

    /// Run one queued collaborator call. Returns false when none was queued.
    fn run_next(&mut self, runtime: &Runtime) -> bool {
        let Some(effect) = self.queued.pop_front() else {
            return false;
        };
        if let Some(completion) = runtime.block_on(run_collaborator(&*self.store, &effect)) {
            let effects = self.session.dispatch(completion);
            self.handle(effects);
        }
        true
    }

    fn persist(&mut self) {
        let version = self.session.entities().version();
        if version == self.saved_version {
            return;
        }
        match self.store.sync(self.session.entities()) {
            Ok(()) => {
                self.saved_version = version;
                self.stack_blocks();
            }
            Err(e) => {
                log::error!("saving {} failed: {e:#}", self.store.path().display());
                self.status = format!("Save failed: {e}");
            }
        }
    }

    /// Paint every visible block with its highlight decorations.
    fn paint_text(&mut self, buf: &mut Buffer, area: Rect) {
        let cw = self.metrics.cell_width;
        let lh = self.metrics.line_height;
        let visible = self.scroll..self.scroll + area.height as usize;

        for block in &self.blocks {
            if block.top_row + block.rows <= visible.start || block.top_row >= visible.end {
                continue;
            }
            let decorations: Vec<Decoration> = self
                .session
                .render_block(&block.id, &block.surface)
                .map(|frame| frame.decorations().copied().collect())
                .unwrap_or_default();

            for glyph in block.surface.glyphs() {
                let row = block.top_row + (glyph.rect.y / lh) as usize;
                let col = (glyph.rect.x / cw) as usize;
                if !visible.contains(&row) || col >= area.width as usize || glyph.rect.width <= 0.0 {
                    continue;
                }
                let centre = Point::new(
                    glyph.rect.x + glyph.rect.width / 2.0,
                    glyph.rect.y + glyph.rect.height / 2.0,
                );
                let style = decorations
                    .iter()
                    .filter(|d| d.rect.contains(centre))
                    .max_by_key(|d| d.z_index)
                    .map_or_else(Style::default, |d| decoration_style(d.kind));
                let x = area.x + col as u16;
                let y = area.y + (row - visible.start) as u16;
                if let Some(cell) = buf.cell_mut((x, y)) {
                    let ch = if glyph.ch.is_whitespace() { ' ' } else { glyph.ch };
                    cell.set_char(ch).set_style(style);
                }
            }

            let first_note_row = block.top_row + (block.surface.size().height / lh).ceil() as usize;
            for (n, note) in self.session.generated_notes(&block.id).iter().enumerate() {
                let row = first_note_row + n;
                if !visible.contains(&row) {
                    continue;
                }
                if let marginalia_engine::Payload::GeneratedNote { title, body } = &note.payload {
                    buf.set_stringn(
                        area.x,
                        area.y + (row - visible.start) as u16,
                        format!("▸ {title}: {body}"),
                        area.width as usize,
                        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
                    );
                }
            }
        }
    }

    /// Title, body and anchor of the open surface, if any.
    fn popup(&self) -> Option<(BlockId, marginalia_engine::Rect, String, Vec<Line<'static>>)> {
        let error_style = Style::default().fg(Color::Red);
        let hint_style = Style::default().fg(Color::DarkGray);
        match self.session.state() {
            InteractionState::Idle | InteractionState::Selecting(_) => None,
            InteractionState::Tooltip(t) => {
                let s = &t.selection;
                let mut lines = vec![Line::from(format!("“{}”", s.text))];
                if t.is_creating() {
                    lines.push(Line::styled("Opening rabbithole…", hint_style));
                } else if let Some(e) = &t.error {
                    lines.push(Line::styled(e.to_string(), error_style));
                    lines.push(Line::styled("r: retry  Esc: close", hint_style));
                } else {
                    lines.push(Line::styled("d: define  a: annotate  r: rabbithole", hint_style));
                }
                Some((s.block_id.clone(), s.anchor_rect, "Selection".to_string(), lines))
            }
            InteractionState::Definition(d) => {
                let lines = match &d.status {
                    DefinitionStatus::Loading => vec![Line::styled("Loading…", hint_style)],
                    DefinitionStatus::Ready { definition_text, .. } => vec![Line::from(definition_text.clone())],
                    DefinitionStatus::Failed(e) => vec![
                        Line::styled(e.to_string(), error_style),
                        Line::styled("r: retry  Esc: close", hint_style),
                    ],
                };
                Some((d.block_id.clone(), d.anchor_rect, d.term.clone(), lines))
            }
            InteractionState::Annotation(a) => {
                let mut lines = vec![
                    Line::styled(format!("“{}”", a.text), hint_style),
                    Line::from(vec![Span::raw(a.draft.clone()), Span::raw("▏")]),
                ];
                if a.is_saving() {
                    lines.push(Line::styled("Saving…", hint_style));
                } else if a.is_deleting() {
                    lines.push(Line::styled("Deleting…", hint_style));
                } else if let Some(e) = &a.error {
                    lines.push(Line::styled(e.to_string(), error_style));
                    lines.push(Line::styled("Ctrl-r: retry", hint_style));
                }
                lines.push(Line::styled("Enter: save  Ctrl-d: delete  Esc: close", hint_style));
                Some((a.block_id.clone(), a.anchor_rect, "Annotation".to_string(), lines))
            }
        }
    }

    /// Where the popup goes: under its anchor, or above it when there is no
    /// room below.
    fn popup_area(&self, area: Rect, block_id: &BlockId, anchor: marginalia_engine::Rect, lines: usize) -> Option<Rect> {
        let block = &self.blocks[self.block_index(block_id)?];
        let lh = self.metrics.line_height;
        let width = POPUP_WIDTH.min(area.width);
        let height = (lines as u16 + 2).min(area.height);

        let top_row = block.top_row + (anchor.y / lh).floor() as usize;
        let bottom_row = block.top_row + (anchor.bottom() / lh).ceil() as usize;
        let below = bottom_row as isize - self.scroll as isize;
        let above = top_row as isize - self.scroll as isize - height as isize;
        let y = if below + height as isize <= area.height as isize {
            below
        } else {
            above
        }
        .clamp(0, (area.height - height) as isize) as u16;

        let col = (anchor.x / self.metrics.cell_width) as u16;
        let x = col.min(area.width - width);
        Some(Rect::new(area.x + x, area.y + y, width, height))
    }
}

fn editor_key(editor: &AnnotationEditor, key: KeyEvent) -> Option<ReaderEvent> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Enter => Some(ReaderEvent::SaveAnnotation),
        KeyCode::Char('d') if ctrl => Some(ReaderEvent::DeleteAnnotation),
        KeyCode::Char('r') if ctrl => Some(ReaderEvent::Retry),
        KeyCode::Char(c) if !ctrl => {
            let mut draft = editor.draft.clone();
            draft.push(c);
            Some(ReaderEvent::EditDraft(draft))
        }
        KeyCode::Backspace => {
            let mut draft = editor.draft.clone();
            draft.pop();
            Some(ReaderEvent::EditDraft(draft))
        }
        _ => None,
    }
}

fn decoration_style(kind: HighlightKind) -> Style {
    match kind {
        HighlightKind::Annotation => Style::default().fg(Color::Yellow).add_modifier(Modifier::UNDERLINED),
        HighlightKind::Definition => Style::default().fg(Color::Cyan).add_modifier(Modifier::UNDERLINED),
        HighlightKind::RabbitholeLink => Style::default().fg(Color::Magenta).add_modifier(Modifier::UNDERLINED),
        HighlightKind::LiveSelection => Style::default().bg(Color::Blue),
        HighlightKind::GeneratedNote => Style::default(),
    }
}

fn screen_layout(area: Rect) -> [Rect; 3] {
    Layout::vertical([Constraint::Min(3), Constraint::Length(1), Constraint::Length(1)])
        .margin(1)
        .areas(area)
}

fn text_area(area: Rect) -> Rect {
    Block::default().borders(Borders::ALL).inner(screen_layout(area)[0])
}

fn init_logging(config: &Config) -> Result<()> {
    let log_path = config.log_path();
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = File::options()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <file.md>", args[0]);
        process::exit(1);
    }
    let path = PathBuf::from(&args[1]);
    if !path.is_file() {
        eprintln!("Error: '{}' is not a readable file", path.display());
        process::exit(1);
    }

    let config = match Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: Failed to load config file: {e}");
            eprintln!("Fix or remove {}", Config::config_path().display());
            process::exit(1);
        }
    };
    init_logging(&config)?;

    let runtime = tokio::runtime::Builder::new_current_thread().build()?;

    let (width, height) = crossterm::terminal::size()?;
    let columns = text_area(Rect::new(0, 0, width, height)).width.max(1) as usize;
    let mut app = App::new(path, &config, columns)?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Main loop
    let res = run_app(&mut terminal, &mut app, &runtime);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

fn run_app(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App, runtime: &Runtime) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if app.run_next(runtime) {
            continue;
        }

        let timeout = app
            .session
            .next_deadline()
            .map_or(IDLE_TICK, |deadline| deadline.saturating_duration_since(Instant::now()));
        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if app.on_key(key) {
                        return Ok(());
                    }
                }
                Event::Mouse(mouse) => {
                    let size = terminal.size()?;
                    app.on_mouse(text_area(Rect::new(0, 0, size.width, size.height)), mouse);
                }
                Event::Resize(width, height) => {
                    let columns = text_area(Rect::new(0, 0, width, height)).width.max(1);
                    app.set_columns(columns as usize);
                }
                _ => {}
            }
        }
        app.tick();
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let [body, status, help] = screen_layout(f.area());

    let frame_block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" {} ", app.path.display()));
    let area = frame_block.inner(body);
    f.render_widget(frame_block, body);
    app.paint_text(f.buffer_mut(), area);

    if let Some((block_id, anchor, title, lines)) = app.popup()
        && let Some(popup) = app.popup_area(area, &block_id, anchor, lines.len())
    {
        f.render_widget(Clear, popup);
        let paragraph = Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: true });
        f.render_widget(paragraph, popup);
    }

    let status_text = if app.status.is_empty() {
        format!("{} blocks", app.blocks.len())
    } else {
        app.status.clone()
    };
    f.render_widget(Paragraph::new(Line::styled(status_text, Style::default().fg(Color::Gray))), status);

    let help_text = Line::from(vec![
        Span::raw("q: Quit | "),
        Span::raw("↑/k ↓/j: Scroll | "),
        Span::raw("Drag: Select | "),
        Span::raw("Click underline: Open | Esc: Close"),
    ]);
    f.render_widget(Paragraph::new(help_text), help);
}
