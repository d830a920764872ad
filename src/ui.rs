//! Optional `ratatui` progress dashboard for long-running `build`
//! invocations, fed by a `tracing_subscriber::Layer` instead of the
//! hand-rolled `println!`/channel plumbing this is adapted from (see
//! SPEC_FULL.md §3).

use crossterm::cursor::Show;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table, Wrap};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event as TraceEvent, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context as LayerContext;

enum UiEvent {
    Log(String),
    Finish(String),
}

#[derive(Clone)]
struct PackageState {
    status: String,
    detail: String,
    seq: u64,
}

struct UiState {
    title: String,
    started: Instant,
    last_phase: String,
    last_status_line: String,
    logs: VecDeque<String>,
    packages: BTreeMap<String, PackageState>,
    seq: u64,
    summary: Option<String>,
}

impl UiState {
    fn new(title: String) -> Self {
        Self {
            title,
            started: Instant::now(),
            last_phase: "starting".to_string(),
            last_status_line: "status=starting".to_string(),
            logs: VecDeque::new(),
            packages: BTreeMap::new(),
            seq: 0,
            summary: None,
        }
    }

    /// Ingests one formatted `key=value ...` progress line, as
    /// produced by `ProgressLayer`. Unknown keys are tolerated; the
    /// parser never rejects a line, it just surfaces less structure.
    fn ingest_log(&mut self, line: String) {
        self.logs.push_back(line.clone());
        while self.logs.len() > 16 {
            let _ = self.logs.pop_front();
        }
        if !line.is_empty() {
            self.last_status_line = line.clone();
        }

        let kv = parse_kv(&line);
        if let Some(phase) = kv.get("phase") {
            self.last_phase = phase.clone();
        }
        if let Some(package) = kv.get("package").or_else(|| kv.get("package_name")) {
            let status = kv
                .get("status")
                .cloned()
                .unwrap_or_else(|| infer_status(&kv));
            let detail = kv
                .get("message")
                .or_else(|| kv.get("task_id"))
                .or_else(|| kv.get("canonical"))
                .cloned()
                .unwrap_or_else(|| kv.get("phase").cloned().unwrap_or_default());
            self.seq = self.seq.saturating_add(1);
            self.packages.insert(
                package.clone(),
                PackageState {
                    status,
                    detail,
                    seq: self.seq,
                },
            );
        }
    }

    fn scheduler_counters(&self) -> (usize, usize, usize, usize) {
        let mut ready = 0usize;
        let mut running = 0usize;
        let mut completed = 0usize;
        let mut blocked = 0usize;
        for ps in self.packages.values() {
            match ps.status.as_str() {
                "BUILDING" | "building" => running += 1,
                "PENDING" | "pending" | "satisfied" => ready += 1,
                "COMPLETE" | "complete" => completed += 1,
                "FAILED" | "failed" | "CANCELED" | "canceled" => blocked += 1,
                _ => {}
            }
        }
        (ready, running, completed, blocked)
    }

    fn recent_pass_fail(&self) -> (Vec<(String, PackageState)>, Vec<(String, PackageState)>) {
        let mut passing: Vec<_> = self
            .packages
            .iter()
            .filter(|(_, ps)| is_passing_status(&ps.status))
            .map(|(pkg, ps)| (pkg.clone(), ps.clone()))
            .collect();
        let mut failing: Vec<_> = self
            .packages
            .iter()
            .filter(|(_, ps)| is_failing_status(&ps.status))
            .map(|(pkg, ps)| (pkg.clone(), ps.clone()))
            .collect();
        passing.sort_by(|a, b| b.1.seq.cmp(&a.1.seq).then_with(|| a.0.cmp(&b.0)));
        failing.sort_by(|a, b| b.1.seq.cmp(&a.1.seq).then_with(|| a.0.cmp(&b.0)));
        (passing, failing)
    }
}

fn infer_status(kv: &BTreeMap<String, String>) -> String {
    kv.get("phase").cloned().unwrap_or_else(|| "info".to_string())
}

pub struct ProgressUi {
    tx: Sender<UiEvent>,
    join: Option<JoinHandle<()>>,
    cancel_requested: Arc<AtomicBool>,
}

impl ProgressUi {
    pub fn start(title: String) -> Self {
        let (tx, rx) = mpsc::channel::<UiEvent>();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let cancel_for_loop = cancel_requested.clone();
        let join = thread::spawn(move || run_ui_loop(title, rx, cancel_for_loop));
        Self {
            tx,
            join: Some(join),
            cancel_requested,
        }
    }

    /// A sink suitable for `ProgressLayer`, or for manual progress
    /// lines from any non-`tracing` call site.
    pub fn sink(&self) -> Arc<dyn Fn(String) + Send + Sync + 'static> {
        let tx = self.tx.clone();
        Arc::new(move |line: String| {
            let _ = tx.send(UiEvent::Log(line));
        })
    }

    /// Flipped when the user presses Ctrl-C inside the dashboard; a
    /// `BuildOrchestrator`'s own cancellation flag should be tied to
    /// this so a SIGINT inside the TUI cancels in-flight builds.
    pub fn cancel_requested(&self) -> Arc<AtomicBool> {
        self.cancel_requested.clone()
    }

    pub fn finish(mut self, summary: String) {
        let _ = self.tx.send(UiEvent::Finish(summary));
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressUi {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.tx.send(UiEvent::Finish(String::new()));
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn run_ui_loop(title: String, rx: Receiver<UiEvent>, cancel_requested: Arc<AtomicBool>) {
    let mut state = UiState::new(title);
    let mut terminal = init_terminal().ok();
    let mut done = false;

    while !done {
        match rx.recv_timeout(Duration::from_millis(120)) {
            Ok(UiEvent::Log(line)) => state.ingest_log(line),
            Ok(UiEvent::Finish(summary)) => {
                if !summary.is_empty() {
                    state.summary = Some(summary);
                }
                done = true;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => done = true,
        }

        while let Ok(evt) = rx.try_recv() {
            match evt {
                UiEvent::Log(line) => state.ingest_log(line),
                UiEvent::Finish(summary) => {
                    if !summary.is_empty() {
                        state.summary = Some(summary);
                    }
                    done = true;
                }
            }
        }

        if terminal.is_some() {
            while event::poll(Duration::from_millis(0)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press
                        && key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL)
                    {
                        cancel_requested.store(true, Ordering::SeqCst);
                        state.summary = Some("cancelling build and in-flight tasks...".to_string());
                        done = true;
                        break;
                    }
                }
            }
        }

        if let Some(term) = terminal.as_mut() {
            let _ = term.draw(|f| draw_ui(f, &state));
        }
    }

    if let Some(mut term) = terminal {
        let _ = term.draw(|f| draw_ui(f, &state));
        restore_terminal(&mut term);
    }
}

fn init_terminal() -> Result<Terminal<CrosstermBackend<std::io::Stdout>>, ()> {
    let mut stdout = std::io::stdout();
    enable_raw_mode().map_err(|_| ())?;
    if execute!(stdout, EnterAlternateScreen).is_err() {
        let _ = disable_raw_mode();
        return Err(());
    }
    Terminal::new(CrosstermBackend::new(stdout)).map_err(|_| {
        let _ = disable_raw_mode();
    })
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>) {
    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen, Show);
    let _ = terminal.show_cursor();
}

fn draw_ui(frame: &mut ratatui::Frame<'_>, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3), Constraint::Min(12)])
        .split(frame.area());

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(67), Constraint::Percentage(33)])
        .split(chunks[2]);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(13), Constraint::Length(6), Constraint::Length(3)])
        .split(body[0]);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(body[1]);

    let elapsed = state.started.elapsed().as_secs();
    let header = Paragraph::new(format!(
        "{} | elapsed={}m{:02}s | Ctrl-C cancels",
        state.title,
        elapsed / 60,
        elapsed % 60
    ))
    .block(Block::default().borders(Borders::ALL).title("Build"));
    frame.render_widget(header, chunks[0]);

    let (ready, running, completed, blocked) = state.scheduler_counters();
    let status_body = format!(
        "phase={} | counters pending={} building={} complete={} failed={} | {}",
        state.last_phase, ready, running, completed, blocked, state.last_status_line
    );
    let status = Paragraph::new(status_body)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(Wrap { trim: true });
    frame.render_widget(status, chunks[1]);

    let mut rows: Vec<_> = state.packages.iter().map(|(pkg, ps)| (pkg.clone(), ps.clone())).collect();
    let rank = |status: &str| -> usize {
        match status {
            "BUILDING" | "building" => 0,
            "FAILED" | "failed" | "CANCELED" | "canceled" => 1,
            "COMPLETE" | "complete" => 2,
            "PENDING" | "pending" | "satisfied" => 3,
            _ => 4,
        }
    };
    rows.sort_by(|a, b| rank(&a.1.status).cmp(&rank(&b.1.status)).then_with(|| b.1.seq.cmp(&a.1.seq)));
    let visible_capacity = left[0].height.saturating_sub(3).max(1) as usize;
    let mut rows: Vec<_> = rows
        .into_iter()
        .filter(|(_, ps)| !is_passing_status(&ps.status) && !is_failing_status(&ps.status))
        .collect();
    rows.truncate(visible_capacity);
    let table_rows = rows.into_iter().map(|(pkg, ps)| {
        let style = match ps.status.as_str() {
            "COMPLETE" | "complete" => Style::default().fg(Color::Green),
            "FAILED" | "failed" => Style::default().fg(Color::Red),
            "CANCELED" | "canceled" => Style::default().fg(Color::LightRed),
            "BUILDING" | "building" => Style::default().fg(Color::Cyan),
            "PENDING" | "pending" | "satisfied" => Style::default().fg(Color::Blue),
            _ => Style::default(),
        };
        Row::new(vec![Cell::from(pkg), Cell::from(ps.status), Cell::from(ps.detail)]).style(style)
    });
    let table = Table::new(table_rows, [Constraint::Length(28), Constraint::Length(14), Constraint::Min(20)])
        .header(Row::new(vec!["Package", "State", "Detail"]).style(Style::default().fg(Color::White)))
        .block(Block::default().borders(Borders::ALL).title("Build Tasks"));
    frame.render_widget(table, left[0]);

    let log_text = state
        .logs
        .iter()
        .rev()
        .take(7)
        .cloned()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    let logs = Paragraph::new(log_text)
        .block(Block::default().borders(Borders::ALL).title("Recent Logs"))
        .wrap(Wrap { trim: true });
    frame.render_widget(logs, left[1]);

    let summary = Paragraph::new(state.summary.clone().unwrap_or_else(|| "running...".to_string()))
        .block(Block::default().borders(Borders::ALL).title("Summary"))
        .wrap(Wrap { trim: true });
    frame.render_widget(summary, left[2]);

    let (passing, failing) = state.recent_pass_fail();
    let passing_items = render_recent_outcome_items(&passing, right[0].height, "No completed builds yet");
    frame.render_widget(
        List::new(passing_items).block(Block::default().borders(Borders::ALL).title("Completed (Recent)")),
        right[0],
    );

    let failing_items = render_recent_outcome_items(&failing, right[1].height, "No failed builds yet");
    frame.render_widget(
        List::new(failing_items).block(Block::default().borders(Borders::ALL).title("Failed (Recent)")),
        right[1],
    );
}

fn parse_kv(line: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for token in line.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

fn is_passing_status(status: &str) -> bool {
    matches!(status, "COMPLETE" | "complete")
}

fn is_failing_status(status: &str) -> bool {
    matches!(status, "FAILED" | "failed" | "CANCELED" | "canceled")
}

fn render_recent_outcome_items(entries: &[(String, PackageState)], panel_height: u16, empty_message: &str) -> Vec<ListItem<'static>> {
    let capacity = panel_height.saturating_sub(2).max(1) as usize;
    if entries.is_empty() {
        return vec![ListItem::new(empty_message.to_string()).style(Style::default().fg(Color::DarkGray))];
    }
    entries
        .iter()
        .take(capacity)
        .map(|(pkg, ps)| {
            let line = if ps.detail.is_empty() { pkg.clone() } else { format!("{pkg} ({})", ps.detail) };
            let style = if is_passing_status(&ps.status) {
                Style::default().fg(Color::Green)
            } else if is_failing_status(&ps.status) {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            ListItem::new(line).style(style)
        })
        .collect()
}

/// `tracing_subscriber::Layer` that formats every event's fields as
/// `key=value` tokens and forwards the resulting line to a
/// `ProgressUi` sink, so the live dashboard and the structured log
/// record share one source of truth (SPEC_FULL.md §3).
pub struct ProgressLayer {
    sink: Arc<dyn Fn(String) + Send + Sync>,
}

impl ProgressLayer {
    pub fn new(sink: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }
}

impl<S: Subscriber> Layer<S> for ProgressLayer {
    fn on_event(&self, event: &TraceEvent<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let mut line = format!("level={} target={}", event.metadata().level(), event.metadata().target());
        for (key, value) in &visitor.fields {
            line.push(' ');
            line.push_str(&format!("{key}={value}"));
        }
        (self.sink)(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_extracts_known_keys() {
        let kv = parse_kv("level=INFO package=foo status=COMPLETE task_id=42");
        assert_eq!(kv.get("package").map(String::as_str), Some("foo"));
        assert_eq!(kv.get("status").map(String::as_str), Some("COMPLETE"));
    }

    #[test]
    fn ingest_log_tracks_package_status() {
        let mut state = UiState::new("test".to_string());
        state.ingest_log("phase=submit package=foo status=BUILDING task_id=7".to_string());
        assert_eq!(state.packages.get("foo").map(|p| p.status.as_str()), Some("BUILDING"));
        state.ingest_log("phase=submit package=foo status=COMPLETE".to_string());
        assert_eq!(state.packages.get("foo").map(|p| p.status.as_str()), Some("COMPLETE"));
    }

    #[test]
    fn scheduler_counters_bucket_by_status() {
        let mut state = UiState::new("test".to_string());
        state.ingest_log("package=a status=BUILDING".to_string());
        state.ingest_log("package=b status=COMPLETE".to_string());
        state.ingest_log("package=c status=FAILED".to_string());
        let (ready, running, completed, blocked) = state.scheduler_counters();
        assert_eq!((ready, running, completed, blocked), (0, 1, 1, 1));
    }
}
