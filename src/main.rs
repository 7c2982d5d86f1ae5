use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use clap::{ArgAction, Parser};
use fantoccini::actions::{InputSource, KeyAction, KeyActions};
use fantoccini::elements::Element;
use fantoccini::key::Key;
use fantoccini::{Client, ClientBuilder, Locator};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The (r, g) pair reserved for monitored output borders. Chosen to be
/// unlikely to occur by chance on the rest of the page; the b channel
/// carries the monitored output index (0-255).
const SENTINEL_RG: (u8, u8) = (143, 56);

const INPUT_CELL_SELECTOR: &str = ".jp-InputArea-editor";
const OUTPUT_CELL_SELECTOR: &str = ".jp-OutputArea-output";

const EVENT_LOG_HEADER: &str = "time,event,index,screenshot";
const EVENT_LOG_NAME: &str = "event_log.csv";
const SESSION_SIDECAR_NAME: &str = "session.json";

const VIEWPORT_WIDTH: u32 = 2000;
const VIEWPORT_HEIGHT: u32 = 10000;

#[derive(Parser, Debug)]
#[command(
    name = "jupyter-output-monitor",
    version,
    about = "Execute cells in a live Jupyter session and record screenshots and timings of sentinel-marked output regions"
)]
struct Cli {
    /// URL of the running Jupyter Lab instance
    url: String,
    /// Output directory (default: output-<timestamp>)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Time in seconds to watch output cells after executing each input cell
    #[arg(long, default_value_t = 10)]
    wait_after_execute: u64,
    /// Run the browser in headless mode
    #[arg(long, action = ArgAction::SetTrue)]
    headless: bool,
    /// Path to the source notebook; writes a copy with screenshots and
    /// profiling results interleaved after each executed code cell
    #[arg(long)]
    notebook_copy: Option<PathBuf>,
    /// Browser to drive (firefox or chrome)
    #[arg(long, default_value = "firefox")]
    browser: BrowserKind,
    /// WebDriver endpoint (default: the standard port for the chosen browser)
    #[arg(long)]
    webdriver_url: Option<String>,
    /// Delay between output scans during the watch window, in milliseconds
    #[arg(long, default_value_t = 250)]
    poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrowserKind {
    Firefox,
    Chrome,
}

impl FromStr for BrowserKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "firefox" => Ok(BrowserKind::Firefox),
            "chrome" | "chromium" => Ok(BrowserKind::Chrome),
            other => bail!("unsupported browser: {other}"),
        }
    }
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserKind::Firefox => f.write_str("firefox"),
            BrowserKind::Chrome => f.write_str("chrome"),
        }
    }
}

impl BrowserKind {
    fn default_webdriver_url(self) -> &'static str {
        match self {
            // geckodriver / chromedriver defaults
            BrowserKind::Firefox => "http://localhost:4444",
            BrowserKind::Chrome => "http://localhost:9515",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    ExecuteInput,
    OutputChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ExecuteInput => f.write_str("execute-input"),
            EventKind::OutputChanged => f.write_str("output-changed"),
        }
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute-input" => Ok(EventKind::ExecuteInput),
            "output-changed" => Ok(EventKind::OutputChanged),
            other => bail!("unknown event kind: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
struct EventRecord {
    time: String,
    kind: EventKind,
    index: u32,
    screenshot: PathBuf,
}

/// Append-only CSV writer for the event log. Every row is flushed as soon
/// as it is written, so the log reflects forward progress even when the
/// process is terminated externally mid-run.
struct EventLog {
    file: File,
}

impl EventLog {
    fn create(path: &Path) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("failed to create event log: {}", path.display()))?;
        writeln!(file, "{EVENT_LOG_HEADER}")?;
        file.flush()?;
        Ok(Self { file })
    }

    fn append(&mut self, record: &EventRecord) -> Result<()> {
        writeln!(
            self.file,
            "{},{},{},{}",
            record.time,
            record.kind,
            record.index,
            record.screenshot.display()
        )
        .context("failed to append to event log")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Last-seen raw screenshot bytes per monitored output index, scoped to one
/// monitoring run.
#[derive(Default)]
struct ScreenshotLedger {
    last: HashMap<u8, Vec<u8>>,
}

impl ScreenshotLedger {
    /// Stores `bytes` for `index` and reports whether they differ from the
    /// previously stored bytes. A first sighting always counts as a change.
    fn update(&mut self, index: u8, bytes: &[u8]) -> bool {
        match self.last.get(&index) {
            Some(previous) if previous.as_slice() == bytes => false,
            _ => {
                self.last.insert(index, bytes.to_vec());
                true
            }
        }
    }
}

/// One parsed event log row, with the timestamp converted to seconds elapsed
/// since the first record.
#[derive(Debug, Clone)]
struct LogRecord {
    elapsed: f64,
    kind: EventKind,
    index: u32,
    screenshot: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize)]
struct OutputUpdate {
    /// Seconds between the triggering execution and this change.
    elapsed: f64,
    screenshot: PathBuf,
}

#[derive(Debug, Clone)]
struct CellProfile {
    index: u32,
    executed_at: f64,
    updates: Vec<OutputUpdate>,
}

impl CellProfile {
    fn total(&self) -> Option<f64> {
        self.updates.last().map(|update| update.elapsed)
    }

    fn n_updates(&self) -> usize {
        self.updates.len()
    }
}

#[derive(Debug, Default)]
struct MonitorSummary {
    input_cells: usize,
    executed: usize,
    output_changes: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let output_dir = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("output-{}", iso_to_path(&isotime()))));
    prepare_output_dir(&output_dir)?;

    let started_at = isotime();
    let event_log_path = output_dir.join(EVENT_LOG_NAME);
    let mut log = EventLog::create(&event_log_path)?;

    let client = connect(
        &cli.url,
        cli.browser,
        cli.headless,
        &resolve_webdriver_url(&cli),
    )
    .await?;

    let outcome = monitor_session(&client, &cli, &output_dir, &mut log).await;
    let close_outcome = client.close().await;
    let summary = outcome?;
    close_outcome.context("failed to close WebDriver session")?;

    let mut profiles = None;
    if let Some(notebook_path) = &cli.notebook_copy {
        let records = parse_event_log(&event_log_path)?;
        let cell_profiles = profile_events(&records)?;
        let annotations = markdown_annotations(&cell_profiles);
        let copy_path = write_profiled_copy(&output_dir, notebook_path, &annotations)?;
        info!(
            "Wrote notebook with profiling results to {}",
            copy_path.display()
        );
        profiles = Some(cell_profiles);
    }

    write_session_sidecar(&output_dir, &cli, &started_at, &summary, profiles.as_deref())?;
    Ok(())
}

fn resolve_webdriver_url(cli: &Cli) -> String {
    cli.webdriver_url
        .clone()
        .unwrap_or_else(|| cli.browser.default_webdriver_url().to_string())
}

fn prepare_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("output directory {} already exists", path.display());
    }
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create output directory: {}", path.display()))
}

async fn connect(
    url: &str,
    browser: BrowserKind,
    headless: bool,
    webdriver_url: &str,
) -> Result<Client> {
    let mut caps = serde_json::Map::new();
    match browser {
        BrowserKind::Firefox => {
            let mut args = vec![
                format!("--width={VIEWPORT_WIDTH}"),
                format!("--height={VIEWPORT_HEIGHT}"),
            ];
            if headless {
                args.push("--headless".to_string());
            }
            caps.insert("moz:firefoxOptions".to_string(), json!({ "args": args }));
        }
        BrowserKind::Chrome => {
            let mut args = vec![
                "--no-sandbox".to_string(),
                format!("--window-size={VIEWPORT_WIDTH},{VIEWPORT_HEIGHT}"),
            ];
            if headless {
                args.push("--headless=new".to_string());
                args.push("--disable-gpu".to_string());
                args.push("--disable-dev-shm-usage".to_string());
            }
            caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
        }
    }

    debug!("Connecting to WebDriver at {webdriver_url}");
    let client = ClientBuilder::native()
        .capabilities(caps)
        .connect(webdriver_url)
        .await
        .with_context(|| format!("failed to connect to WebDriver at {webdriver_url}"))?;

    // Window size is best-effort; the browser args above already request a
    // tall viewport so long notebooks stay fully rendered.
    if let Err(err) = client.set_window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).await {
        debug!("could not set window size: {err}");
    }

    client
        .goto(url)
        .await
        .with_context(|| format!("failed to open {url}"))?;
    Ok(client)
}

async fn monitor_session(
    client: &Client,
    cli: &Cli,
    output_dir: &Path,
    log: &mut EventLog,
) -> Result<MonitorSummary> {
    let input_cells = wait_for_input_cells(client).await?;
    info!("{} input cells found", input_cells.len());

    let mut summary = MonitorSummary {
        input_cells: input_cells.len(),
        ..MonitorSummary::default()
    };
    let mut ledger = ScreenshotLedger::default();
    let watch_window = Duration::from_secs(cli.wait_after_execute);
    let poll_interval = Duration::from_millis(cli.poll_interval_ms);

    for (input_index, input_cell) in input_cells.iter().enumerate() {
        let text = input_cell
            .text()
            .await
            .with_context(|| format!("failed to read input cell {input_index}"))?;
        if text.trim().is_empty() {
            info!("Skipping empty input cell {input_index}");
            continue;
        }

        info!("Executing input cell {input_index}");

        // Screenshot is taken before execution so the saved image shows the
        // cell as it was when it was triggered.
        let screenshot_bytes = input_cell
            .screenshot()
            .await
            .with_context(|| format!("failed to screenshot input cell {input_index}"))?;
        input_cell
            .click()
            .await
            .with_context(|| format!("failed to select input cell {input_index}"))?;
        press_shift_enter(client).await?;

        let timestamp = isotime();
        let screenshot_path =
            output_dir.join(screenshot_name(EventKind::ExecuteInput, input_index as u32, &timestamp));
        save_screenshot(&screenshot_bytes, &screenshot_path)?;
        log.append(&EventRecord {
            time: timestamp,
            kind: EventKind::ExecuteInput,
            index: input_index as u32,
            screenshot: screenshot_path,
        })?;
        summary.executed += 1;

        info!("Watching for changes in output cells");
        let deadline = Instant::now() + watch_window;
        while Instant::now() < deadline {
            summary.output_changes +=
                scan_output_cells(client, &mut ledger, log, output_dir).await?;
            tokio::time::sleep(poll_interval).await;
        }
        info!("Stopping monitoring output and moving on to next input cell");
    }

    Ok(summary)
}

/// Polls until at least one visible input cell exists on the page.
async fn wait_for_input_cells(client: &Client) -> Result<Vec<Element>> {
    loop {
        info!("Checking for input cells");
        let mut visible = Vec::new();
        for cell in client.find_all(Locator::Css(INPUT_CELL_SELECTOR)).await? {
            if cell.is_displayed().await? {
                visible.push(cell);
            }
        }
        if !visible.is_empty() {
            return Ok(visible);
        }
        info!("No input cells found, waiting before checking again");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Scans all visible output cells once, recording and logging a screenshot
/// for every monitored region whose rendered bytes differ from the last
/// stored ones. Returns the number of changes recorded in this pass.
async fn scan_output_cells(
    client: &Client,
    ledger: &mut ScreenshotLedger,
    log: &mut EventLog,
    output_dir: &Path,
) -> Result<usize> {
    let mut changes = 0;
    for output_cell in client.find_all(Locator::Css(OUTPUT_CELL_SELECTOR)).await? {
        if !output_cell.is_displayed().await? {
            continue;
        }

        // The sentinel border lives on a nested div, not on the output
        // cell itself.
        let div = match output_cell.find(Locator::Css("div")).await {
            Ok(div) => div,
            Err(err) if err.is_no_such_element() => continue,
            Err(err) => return Err(err.into()),
        };

        let Some(style) = div.attr("style").await? else {
            continue;
        };
        let Some(output_index) = monitored_index(&style) else {
            continue;
        };

        debug!("taking screenshot of output cell {output_index}");
        let bytes = div
            .screenshot()
            .await
            .with_context(|| format!("failed to screenshot output cell {output_index}"))?;

        if ledger.update(output_index, &bytes) {
            let timestamp = isotime();
            info!("Change detected in output cell {output_index} at {timestamp}");
            let screenshot_path = output_dir.join(screenshot_name(
                EventKind::OutputChanged,
                u32::from(output_index),
                &timestamp,
            ));
            save_screenshot(&bytes, &screenshot_path)?;
            log.append(&EventRecord {
                time: timestamp,
                kind: EventKind::OutputChanged,
                index: u32::from(output_index),
                screenshot: screenshot_path,
            })?;
            changes += 1;
        }
    }
    Ok(changes)
}

async fn press_shift_enter(client: &Client) -> Result<()> {
    let keys = KeyActions::new("keyboard".to_owned())
        .then(KeyAction::Down {
            value: Key::Shift.into(),
        })
        .then(KeyAction::Down {
            value: Key::Enter.into(),
        })
        .then(KeyAction::Up {
            value: Key::Enter.into(),
        })
        .then(KeyAction::Up {
            value: Key::Shift.into(),
        });
    client
        .perform_actions(keys)
        .await
        .context("failed to send Shift+Enter")?;
    client.release_actions().await?;
    Ok(())
}

/// Extracts the monitored output index from an inline style attribute.
///
/// Only elements whose border color carries the reserved (r, g) sentinel pair
/// are monitored; anything else on the page that happens to have a border is
/// ignored. The b channel is the 0-255 output index.
fn monitored_index(style: &str) -> Option<u8> {
    if !style.contains("border-color: rgb(") {
        return None;
    }
    let anchor = style.find("border-color:")?;
    let open = anchor + style[anchor..].find('(')? + 1;
    let close = open + style[open..].find(')')?;
    let mut channels = style[open..close].split(',').map(str::trim);
    let r: i64 = channels.next()?.parse().ok()?;
    let g: i64 = channels.next()?.parse().ok()?;
    let b: i64 = channels.next()?.parse().ok()?;
    if channels.next().is_some() {
        return None;
    }
    if (r, g) != (i64::from(SENTINEL_RG.0), i64::from(SENTINEL_RG.1)) {
        return None;
    }
    u8::try_from(b).ok()
}

fn screenshot_name(kind: EventKind, index: u32, timestamp: &str) -> String {
    let role = match kind {
        EventKind::ExecuteInput => "input",
        EventKind::OutputChanged => "output",
    };
    format!("{role}-{index:03}-{}.png", iso_to_path(timestamp))
}

fn save_screenshot(bytes: &[u8], path: &Path) -> Result<()> {
    let image = image::load_from_memory(bytes)
        .with_context(|| format!("invalid screenshot data for {}", path.display()))?;
    image
        .save(path)
        .with_context(|| format!("failed to save screenshot: {}", path.display()))?;
    Ok(())
}

fn parse_event_log(path: &Path) -> Result<Vec<LogRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read event log: {}", path.display()))?;
    let mut lines = raw.lines();
    let header = lines.next().context("event log is empty")?;
    if header != EVENT_LOG_HEADER {
        bail!("unexpected event log header: {header:?}");
    }

    let mut first: Option<DateTime<FixedOffset>> = None;
    let mut records = Vec::new();
    for (offset, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = offset + 2;
        let mut fields = line.splitn(4, ',');
        let (Some(time), Some(kind), Some(index), Some(screenshot)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            bail!("malformed event log row {row}: {line:?}");
        };
        let time = DateTime::parse_from_rfc3339(time)
            .with_context(|| format!("invalid timestamp in event log row {row}"))?;
        let start = *first.get_or_insert(time);
        records.push(LogRecord {
            elapsed: elapsed_seconds(start, time),
            kind: kind
                .parse()
                .with_context(|| format!("invalid event kind in event log row {row}"))?,
            index: index
                .parse()
                .with_context(|| format!("invalid cell index in event log row {row}"))?,
            screenshot: PathBuf::from(screenshot),
        });
    }
    Ok(records)
}

fn elapsed_seconds(from: DateTime<FixedOffset>, to: DateTime<FixedOffset>) -> f64 {
    let delta = to - from;
    delta
        .num_microseconds()
        .map_or_else(|| delta.num_milliseconds() as f64 / 1e3, |us| us as f64 / 1e6)
}

/// Groups log records into per-cell profiles. Output changes are attributed
/// to the most recent preceding execution; only the first execution of a
/// given input index registers a profile.
fn profile_events(records: &[LogRecord]) -> Result<Vec<CellProfile>> {
    let mut profiles: Vec<CellProfile> = Vec::new();
    let mut seen: HashMap<u32, usize> = HashMap::new();
    let mut current: Option<usize> = None;

    for record in records {
        match record.kind {
            EventKind::ExecuteInput => {
                if !seen.contains_key(&record.index) {
                    seen.insert(record.index, profiles.len());
                    current = Some(profiles.len());
                    profiles.push(CellProfile {
                        index: record.index,
                        executed_at: record.elapsed,
                        updates: Vec::new(),
                    });
                }
            }
            EventKind::OutputChanged => {
                let slot = current
                    .context("output-changed event recorded before any execute-input event")?;
                let executed_at = profiles[slot].executed_at;
                profiles[slot].updates.push(OutputUpdate {
                    elapsed: record.elapsed - executed_at,
                    screenshot: record.screenshot.clone(),
                });
            }
        }
    }
    Ok(profiles)
}

fn markdown_annotations(profiles: &[CellProfile]) -> Vec<String> {
    profiles
        .iter()
        .map(|profile| match (profile.total(), profile.updates.last()) {
            (Some(total), Some(last)) => {
                let screenshot = last
                    .screenshot
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!(
                    "![output screenshot]({screenshot})\n\n#### Profiling result for cell {}: \n * {total:.2} seconds elapsed\n * {} output updates\n",
                    profile.index,
                    profile.n_updates()
                )
            }
            _ => format!(
                "#### Profiling result for cell {}: \nNo output.\n",
                profile.index
            ),
        })
        .collect()
}

/// Writes a copy of the source notebook with one markdown annotation cell
/// inserted after every non-empty code cell, preserving all other cells in
/// their original order.
fn write_profiled_copy(
    output_dir: &Path,
    notebook_path: &Path,
    annotations: &[String],
) -> Result<PathBuf> {
    let raw = fs::read_to_string(notebook_path)
        .with_context(|| format!("failed to read notebook: {}", notebook_path.display()))?;
    let mut notebook: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid notebook JSON: {}", notebook_path.display()))?;
    let cells = notebook
        .get("cells")
        .and_then(Value::as_array)
        .cloned()
        .with_context(|| format!("notebook has no cells array: {}", notebook_path.display()))?;

    let code_cells = cells.iter().filter(|cell| is_nonempty_code_cell(cell)).count();
    if code_cells != annotations.len() {
        bail!(
            "profiling results cover {} cells but the notebook has {} non-empty code cells",
            annotations.len(),
            code_cells
        );
    }

    let mut woven = Vec::with_capacity(cells.len() + annotations.len());
    let mut pending = annotations.iter();
    for cell in cells {
        let annotate = is_nonempty_code_cell(&cell);
        woven.push(cell);
        if annotate {
            // Counts were validated above, so the iterator cannot run dry.
            if let Some(text) = pending.next() {
                woven.push(markdown_cell(text));
            }
        }
    }
    notebook["cells"] = Value::Array(woven);

    let base = notebook_path
        .file_name()
        .context("notebook path has no file name")?
        .to_string_lossy()
        .into_owned();
    let copy_name = match base.strip_suffix(".ipynb") {
        Some(stem) => format!("{stem}-profiling.ipynb"),
        None => format!("{base}-profiling.ipynb"),
    };
    let copy_path = output_dir.join(copy_name);
    write_json_pretty(&copy_path, &notebook)?;
    Ok(copy_path)
}

fn is_nonempty_code_cell(cell: &Value) -> bool {
    cell.get("cell_type").and_then(Value::as_str) == Some("code")
        && cell.get("source").is_some_and(source_is_nonempty)
}

fn source_is_nonempty(source: &Value) -> bool {
    match source {
        Value::String(text) => !text.is_empty(),
        Value::Array(lines) => !lines.is_empty(),
        _ => false,
    }
}

fn markdown_cell(text: &str) -> Value {
    json!({
        "cell_type": "markdown",
        "id": format!("{:08x}", rand::thread_rng().gen::<u32>()),
        "metadata": {},
        "source": text,
    })
}

fn write_session_sidecar(
    output_dir: &Path,
    cli: &Cli,
    started_at: &str,
    summary: &MonitorSummary,
    profiles: Option<&[CellProfile]>,
) -> Result<()> {
    let mut payload = json!({
        "url": cli.url,
        "browser": cli.browser.to_string(),
        "headless": cli.headless,
        "wait_after_execute": cli.wait_after_execute,
        "poll_interval_ms": cli.poll_interval_ms,
        "started_at": started_at,
        "finished_at": isotime(),
        "event_log": EVENT_LOG_NAME,
        "input_cells": summary.input_cells,
        "executed": summary.executed,
        "output_changes": summary.output_changes,
    });
    if let Some(profiles) = profiles {
        let rows: Vec<Value> = profiles
            .iter()
            .map(|profile| {
                json!({
                    "index": profile.index,
                    "executed_at": profile.executed_at,
                    "total": profile.total(),
                    "n_updates": profile.n_updates(),
                    "updates": profile.updates,
                })
            })
            .collect();
        payload["profiling"] = Value::Array(rows);
    }
    write_json_pretty(&output_dir.join(SESSION_SIDECAR_NAME), &payload)
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn isotime() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Colons are not filesystem-safe everywhere; screenshot filenames carry the
/// timestamp with colons replaced by hyphens.
fn iso_to_path(time: &str) -> String {
    time.replace(':', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(elapsed: f64, kind: EventKind, index: u32, screenshot: &str) -> LogRecord {
        LogRecord {
            elapsed,
            kind,
            index,
            screenshot: PathBuf::from(screenshot),
        }
    }

    #[test]
    fn monitored_index_parses_sentinel_style() {
        let style = "width: 100px; border-color: rgb(143, 56, 7); padding: 2px";
        assert_eq!(monitored_index(style), Some(7));
        assert_eq!(monitored_index("border-color: rgb(143,56,255)"), Some(255));
        assert_eq!(monitored_index("border-color: rgb(143, 56, 0)"), Some(0));
    }

    #[test]
    fn monitored_index_requires_exact_sentinel_pair() {
        assert_eq!(monitored_index("border-color: rgb(143, 57, 7)"), None);
        assert_eq!(monitored_index("border-color: rgb(142, 56, 7)"), None);
        assert_eq!(monitored_index("border-color: rgb(56, 143, 7)"), None);
        // Index channel out of range
        assert_eq!(monitored_index("border-color: rgb(143, 56, 300)"), None);
    }

    #[test]
    fn monitored_index_ignores_unrelated_styles() {
        assert_eq!(monitored_index(""), None);
        assert_eq!(monitored_index("border-color: red"), None);
        assert_eq!(monitored_index("color: rgb(143, 56, 7)"), None);
        assert_eq!(monitored_index("border-color: rgb(143, 56, 7, 0.5)"), None);
        assert_eq!(monitored_index("border-color: rgb(143, 56)"), None);
    }

    #[test]
    fn ledger_records_first_and_changed_screenshots() {
        let mut ledger = ScreenshotLedger::default();
        assert!(ledger.update(3, b"first"));
        assert!(!ledger.update(3, b"first"));
        assert!(ledger.update(3, b"second"));
        assert!(!ledger.update(3, b"second"));
        // Indices are tracked independently
        assert!(ledger.update(4, b"second"));
    }

    #[test]
    fn event_log_round_trips_through_parser() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(EVENT_LOG_NAME);
        let mut log = EventLog::create(&path).unwrap();
        log.append(&EventRecord {
            time: "2024-05-01T10:00:00.000000Z".to_string(),
            kind: EventKind::ExecuteInput,
            index: 0,
            screenshot: PathBuf::from("out/input-000-a.png"),
        })
        .unwrap();
        log.append(&EventRecord {
            time: "2024-05-01T10:00:01.500000Z".to_string(),
            kind: EventKind::OutputChanged,
            index: 2,
            screenshot: PathBuf::from("out/output-002-b.png"),
        })
        .unwrap();

        let records = parse_event_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, EventKind::ExecuteInput);
        assert_eq!(records[0].elapsed, 0.0);
        assert_eq!(records[1].kind, EventKind::OutputChanged);
        assert_eq!(records[1].index, 2);
        assert!((records[1].elapsed - 1.5).abs() < 1e-9);
    }

    #[test]
    fn parse_event_log_rejects_unknown_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,b,c,d\n").unwrap();
        let err = parse_event_log(&path).unwrap_err();
        assert!(err.to_string().contains("unexpected event log header"));
    }

    #[test]
    fn profile_total_follows_last_change() {
        let records = vec![
            record(0.5, EventKind::ExecuteInput, 0, "input-000.png"),
            record(1.5, EventKind::OutputChanged, 4, "output-004-a.png"),
            record(3.0, EventKind::OutputChanged, 4, "output-004-b.png"),
        ];
        let profiles = profile_events(&records).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].index, 0);
        assert!((profiles[0].total().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(profiles[0].n_updates(), 2);
    }

    #[test]
    fn profile_changes_attach_to_most_recent_execution() {
        let records = vec![
            record(0.0, EventKind::ExecuteInput, 0, "input-000.png"),
            record(1.0, EventKind::OutputChanged, 9, "output-009-a.png"),
            record(2.0, EventKind::ExecuteInput, 1, "input-001.png"),
            record(2.5, EventKind::OutputChanged, 9, "output-009-b.png"),
        ];
        let profiles = profile_events(&records).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].n_updates(), 1);
        assert_eq!(profiles[1].n_updates(), 1);
        assert!((profiles[1].total().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn profile_without_updates_reports_no_output() {
        let records = vec![record(0.0, EventKind::ExecuteInput, 0, "input-000.png")];
        let profiles = profile_events(&records).unwrap();
        assert_eq!(profiles[0].total(), None);

        let annotations = markdown_annotations(&profiles);
        assert_eq!(
            annotations[0],
            "#### Profiling result for cell 0: \nNo output.\n"
        );
    }

    #[test]
    fn profile_rejects_change_before_any_execution() {
        let records = vec![record(0.0, EventKind::OutputChanged, 3, "output-003.png")];
        let err = profile_events(&records).unwrap_err();
        assert!(err.to_string().contains("before any execute-input"));
    }

    #[test]
    fn annotation_formats_timing_and_screenshot_reference() {
        let profiles = vec![CellProfile {
            index: 2,
            executed_at: 1.0,
            updates: vec![
                OutputUpdate {
                    elapsed: 0.75,
                    screenshot: PathBuf::from("run/output-005-a.png"),
                },
                OutputUpdate {
                    elapsed: 2.5,
                    screenshot: PathBuf::from("run/output-005-b.png"),
                },
            ],
        }];
        let annotations = markdown_annotations(&profiles);
        assert_eq!(
            annotations[0],
            "![output screenshot](output-005-b.png)\n\n#### Profiling result for cell 2: \n * 2.50 seconds elapsed\n * 2 output updates\n"
        );
    }

    fn sample_notebook() -> Value {
        json!({
            "nbformat": 4,
            "nbformat_minor": 5,
            "metadata": {},
            "cells": [
                { "cell_type": "markdown", "metadata": {}, "source": "# Title" },
                { "cell_type": "code", "metadata": {}, "outputs": [], "source": "" },
                { "cell_type": "code", "metadata": {}, "outputs": [], "source": "print(1)" },
                { "cell_type": "code", "metadata": {}, "outputs": [], "source": ["x = 2\n", "x"] },
            ]
        })
    }

    #[test]
    fn profiled_copy_weaves_one_annotation_per_code_cell() {
        let dir = tempdir().unwrap();
        let notebook_path = dir.path().join("demo.ipynb");
        fs::write(
            &notebook_path,
            serde_json::to_string(&sample_notebook()).unwrap(),
        )
        .unwrap();

        let annotations = vec!["first".to_string(), "second".to_string()];
        let copy_path = write_profiled_copy(dir.path(), &notebook_path, &annotations).unwrap();
        assert_eq!(
            copy_path.file_name().unwrap().to_str().unwrap(),
            "demo-profiling.ipynb"
        );

        let woven: Value = serde_json::from_str(&fs::read_to_string(&copy_path).unwrap()).unwrap();
        let cells = woven["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 6);
        // The empty code cell gets no annotation; the two non-empty ones do,
        // immediately after each.
        assert_eq!(cells[3]["cell_type"], "markdown");
        assert_eq!(cells[3]["source"], "first");
        assert_eq!(cells[5]["cell_type"], "markdown");
        assert_eq!(cells[5]["source"], "second");
        let markdown_inserts = cells
            .iter()
            .filter(|cell| cell["source"] == "first" || cell["source"] == "second")
            .count();
        assert_eq!(markdown_inserts, 2);
    }

    #[test]
    fn profiled_copy_rejects_annotation_count_mismatch() {
        let dir = tempdir().unwrap();
        let notebook_path = dir.path().join("demo.ipynb");
        fs::write(
            &notebook_path,
            serde_json::to_string(&sample_notebook()).unwrap(),
        )
        .unwrap();

        let annotations = vec!["only one".to_string()];
        let err = write_profiled_copy(dir.path(), &notebook_path, &annotations).unwrap_err();
        assert!(err.to_string().contains("non-empty code cells"));
    }

    #[test]
    fn output_directory_collision_is_fatal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("run");
        prepare_output_dir(&target).unwrap();
        fs::write(target.join("marker"), b"keep").unwrap();

        let err = prepare_output_dir(&target).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        // Existing contents are untouched
        assert_eq!(fs::read(target.join("marker")).unwrap(), b"keep");
    }

    #[test]
    fn screenshot_names_sanitize_timestamps() {
        let name = screenshot_name(EventKind::ExecuteInput, 3, "2024-05-01T10:00:00.000000Z");
        assert_eq!(name, "input-003-2024-05-01T10-00-00.000000Z.png");
        assert!(!name.contains(':'));

        let name = screenshot_name(EventKind::OutputChanged, 255, "2024-05-01T10:00:01Z");
        assert!(name.starts_with("output-255-"));
    }

    #[test]
    fn event_kind_round_trips_through_strings() {
        assert_eq!(
            EventKind::ExecuteInput.to_string().parse::<EventKind>().unwrap(),
            EventKind::ExecuteInput
        );
        assert_eq!(
            EventKind::OutputChanged.to_string().parse::<EventKind>().unwrap(),
            EventKind::OutputChanged
        );
        assert!("resize".parse::<EventKind>().is_err());
    }

    #[test]
    fn nonempty_code_cell_detection_handles_both_source_shapes() {
        assert!(is_nonempty_code_cell(&json!({
            "cell_type": "code", "source": "print(1)"
        })));
        assert!(is_nonempty_code_cell(&json!({
            "cell_type": "code", "source": ["a\n", "b"]
        })));
        assert!(!is_nonempty_code_cell(&json!({
            "cell_type": "code", "source": ""
        })));
        assert!(!is_nonempty_code_cell(&json!({
            "cell_type": "code", "source": []
        })));
        assert!(!is_nonempty_code_cell(&json!({
            "cell_type": "markdown", "source": "text"
        })));
    }
}
