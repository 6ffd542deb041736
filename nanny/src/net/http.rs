//! Forking HTTP status server.
//!
//! One connection, one forked child, one request: the child renders its
//! response from the (copy-on-write) supervisor state it inherited and
//! exits. Deliberately simple and robust — no connection state survives a
//! request.

// Layer 1: Standard library imports
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

// Layer 2: Third-party crate imports
use nix::unistd::{fork, ForkResult};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

// Layer 3: Internal module imports
use crate::child::record::{ChildId, ChildRecord};
use crate::error::{NannyError, NannyResult};
use crate::logbuf::LogBuffer;
use crate::supervisor::Supervisor;
use crate::util::{hostname, isotime};
use crate::variables::{VariableSource, DEFAULT_KEYS};

/// The listening socket, bound to an anonymous port.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    port: u16,
}

impl HttpServer {
    /// Binds an ephemeral port on all interfaces.
    pub fn bind_anonymous() -> NannyResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| NannyError::net("http bind", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| NannyError::net("http getsockname", e))?
            .port();
        Ok(Self { listener, port })
    }

    /// Descriptor for reactor registration.
    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// The bound port, announced at startup.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Accepts one pending connection and forks a child to answer it.
pub(crate) fn accept_and_serve(sup: &Supervisor) {
    let Some(server) = &sup.http else {
        return;
    };
    let (stream, peer) = match server.listener.accept() {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = %err, "http accept failed");
            return;
        }
    };
    debug!(peer = %peer, "http connection");

    // SAFETY: single-threaded; the child renders and exits.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            unsafe {
                nix::libc::close(server.listener.as_raw_fd());
            }
            let _ = serve_connection(sup, stream);
            unsafe { nix::libc::_exit(0) }
        }
        Ok(ForkResult::Parent { .. }) => drop(stream),
        Err(err) => warn!(error = %err, "http fork failed"),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: &'static str,
    uri: String,
}

/// Parses the request line, `GET|PUT|POST <uri> [HTTP/M.N]`.
fn parse_request_line(line: &str) -> Option<Request> {
    let (method, rest) = if let Some(rest) = line.strip_prefix("GET ") {
        ("GET", rest)
    } else if let Some(rest) = line.strip_prefix("PUT ") {
        ("PUT", rest)
    } else if let Some(rest) = line.strip_prefix("POST ") {
        ("POST", rest)
    } else {
        return None;
    };

    let mut tokens = rest.split(' ').filter(|t| !t.is_empty());
    let uri = tokens.next()?;
    if uri.is_empty() || uri.contains(|c: char| c.is_control()) {
        return None;
    }
    // The version is technically optional; validate it when present.
    if let Some(version) = tokens.next() {
        let digits = version.strip_prefix("HTTP/")?;
        let (major, minor) = digits.split_once('.')?;
        if major.parse::<u8>().is_err() || minor.parse::<u8>().is_err() {
            return None;
        }
    }
    Some(Request {
        method,
        uri: uri.to_string(),
    })
}

/// Reads the request line and discards headers through the blank line.
fn read_request(reader: &mut impl BufRead) -> Option<Request> {
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let request = parse_request_line(line.trim_end_matches(['\r', '\n']))?;

    loop {
        let mut header = String::new();
        let n = reader.read_line(&mut header).ok()?;
        if n == 0 || header.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }
    Some(request)
}

fn serve_connection(sup: &Supervisor, stream: TcpStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let Some(request) = read_request(&mut reader) else {
        // Parse error: close without a response.
        return Ok(());
    };
    debug!(method = request.method, uri = request.uri.as_str(), "http request");

    route(sup, &request.uri, &mut writer)?;
    writer.flush()
}

fn route(sup: &Supervisor, uri: &str, w: &mut impl Write) -> std::io::Result<()> {
    if uri == "/environment" {
        return environment_page(sup, w);
    }
    if let Some(rest) = uri.strip_prefix("/status") {
        return status_route(sup, rest, w);
    }
    if uri == "/" {
        return index_page(w);
    }
    not_found(uri, w)
}

fn respond_ok(w: &mut impl Write, content_type: &str) -> std::io::Result<()> {
    write!(w, "HTTP/1.0 200 OK\r\nContent-Type: {content_type}\r\n\r\n")
}

fn not_found(uri: &str, w: &mut impl Write) -> std::io::Result<()> {
    write!(w, "HTTP/1.0 404 NOT FOUND\r\nContent-Type: text/plain\r\n\r\n")?;
    writeln!(w, "URI not found: {uri}")
}

/// Root page: a small index linking the other surfaces.
fn index_page(w: &mut impl Write) -> std::io::Result<()> {
    respond_ok(w, "text/html")?;
    let host = hostname();
    writeln!(w, "<HTML>")?;
    writeln!(w, "<head><title>Nanny: {host}</title></head>")?;
    writeln!(w, "<body>")?;
    writeln!(w, "<ul>")?;
    writeln!(w, "<li>Host: {host}")?;
    writeln!(w, "<li><a href=\"/status/\">Children</a><br/>")?;
    writeln!(w, "<li><a href=\"/environment\">Environment</a><br/>")?;
    writeln!(w, "</ul>")?;
    writeln!(w, "</body>")?;
    writeln!(w, "</HTML>")
}

/// `/environment`: well-known variables plus the inherited environment,
/// keys sorted.
fn environment_page(sup: &Supervisor, w: &mut impl Write) -> std::io::Result<()> {
    respond_ok(w, "text/plain")?;
    let mut map = Map::new();
    for key in DEFAULT_KEYS {
        let value = sup.globals.lookup(key).unwrap_or_default();
        map.insert((*key).to_string(), Value::String(value));
    }
    for (key, value) in std::env::vars() {
        map.entry(key).or_insert(Value::String(value));
    }
    let body = serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_default();
    writeln!(w, "{body}")
}

/// Routing under `/status`.
fn status_route(sup: &Supervisor, rest: &str, w: &mut impl Write) -> std::io::Result<()> {
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        return summary_page(sup, "/status", w);
    }
    let (id_part, detail) = match rest.split_once('/') {
        Some((id_part, detail)) => (id_part, Some(detail)),
        None => (rest, None),
    };
    let Ok(id) = id_part.parse::<ChildId>() else {
        return summary_page(sup, "/status", w);
    };
    let Some(child) = sup.child(id) else {
        return summary_page(sup, "/status", w);
    };
    let child = child.borrow();
    match detail {
        Some("stdout") => stream_page(sup, &child, "STDOUT", &child.stdout.borrow(), w),
        Some("stderr") => stream_page(sup, &child, "STDERR", &child.stderr.borrow(), w),
        Some("events") => stream_page(sup, &child, "EVENTS", &child.events.borrow(), w),
        // An unrecognized detail still gets the child summary.
        Some(_) | None => child_page(sup, &child, w),
    }
}

/// HTML summary of every child, oldest first.
fn summary_page(sup: &Supervisor, prefix: &str, w: &mut impl Write) -> std::io::Result<()> {
    respond_ok(w, "text/html")?;
    writeln!(w, "<HTML><HEAD><TITLE>All Children</TITLE></HEAD>")?;
    writeln!(w, "<BODY>")?;
    writeln!(w, "<PRE>")?;
    writeln!(w, "Current time: {}", isotime(sup.globals.now))?;
    writeln!(w)?;
    for child in sup.children.iter() {
        let child = child.borrow();
        writeln!(w, "<A HREF=\"{prefix}/{0}\">Child {0}</A>", child.id)?;
        if let Some(main) = child.main {
            writeln!(w, "  subsidiary to: child {main}")?;
        }
        if let Some(pid) = child.pid {
            writeln!(w, "  pid: {pid}")?;
        }
        if let Some(instance) = &child.instance {
            writeln!(w, "  instance: {instance}")?;
        }
        writeln!(w, "  start cmd: {}", child.start_cmd)?;
        if let Some(stop) = &child.stop_cmd {
            writeln!(w, "  stop cmd: {stop}")?;
        }
        if let Some(health) = &child.health_cmd {
            writeln!(w, "  health cmd: {health}")?;
        }
        writeln!(
            w,
            "  consecutive health failures: {}",
            child.health.failures_consecutive
        )?;
        writeln!(
            w,
            "  restartable: {}",
            if child.restartable { "YES" } else { "NO" }
        )?;
        writeln!(w, "  state: {}", child.state)?;
        writeln!(w, "  start count: {}", child.start_count)?;
        if let Some(t) = child.last_start {
            writeln!(w, "  last start: {}", isotime(t))?;
        }
        if let Some(t) = child.last_stop {
            writeln!(w, "  last stop: {}", isotime(t))?;
        }
        writeln!(w, "  <a href=\"{prefix}/{}/stdout\">stdout</a>", child.id)?;
        writeln!(w, "  <a href=\"{prefix}/{}/stderr\">stderr</a>", child.id)?;
        writeln!(w, "  <a href=\"{prefix}/{}/events\">events</a>", child.id)?;
    }
    writeln!(w, "</PRE>")?;
    write!(w, "</BODY></HTML>")
}

/// JSON detail for one child, ring dumps included.
fn child_page(sup: &Supervisor, child: &ChildRecord, w: &mut impl Write) -> std::io::Result<()> {
    respond_ok(w, "text/plain")?;

    let mut detail = Map::new();
    detail.insert("id".into(), json!(child.id));
    detail.insert("start_cmd".into(), json!(child.start_cmd));
    if let Some(pid) = child.pid {
        detail.insert("pid".into(), json!(pid.as_raw()));
    }
    if let Some(instance) = &child.instance {
        detail.insert("instance".into(), json!(instance));
    }
    if let Some(stop) = &child.stop_cmd {
        detail.insert("stop_cmd".into(), json!(stop));
    }
    if let Some(health) = &child.health_cmd {
        detail.insert("health_cmd".into(), json!(health));
    }
    detail.insert(
        "health_failures_consecutive".into(),
        json!(child.health.failures_consecutive),
    );
    detail.insert(
        "health_failures_total".into(),
        json!(child.health.failures_total),
    );
    detail.insert(
        "health_successes_consecutive".into(),
        json!(child.health.successes_consecutive),
    );
    detail.insert(
        "health_successes_total".into(),
        json!(child.health.successes_total),
    );
    detail.insert("restartable".into(), json!(child.restartable));
    detail.insert("state".into(), json!(child.state.as_str()));
    detail.insert("start_count".into(), json!(child.start_count));
    if let Some(t) = child.last_start {
        detail.insert("last_start".into(), json!(isotime(t)));
    }
    if let Some(t) = child.last_stop {
        detail.insert("last_stop".into(), json!(isotime(t)));
    }
    if let Some(when) = child.state_timer.and_then(|t| sup.timers.expiration(t)) {
        detail.insert("next_state_check".into(), json!(isotime(when)));
    }
    if let Some(when) = child.health_timer.and_then(|t| sup.timers.expiration(t)) {
        detail.insert("next_health_check".into(), json!(isotime(when)));
    }
    detail.insert("stdout".into(), log_json(&child.stdout.borrow()));
    detail.insert("stderr".into(), log_json(&child.stderr.borrow()));
    detail.insert("events".into(), log_json(&child.events.borrow()));

    if !child.timed.is_empty() {
        let tasks: Vec<Value> = child
            .timed
            .iter()
            .map(|task| {
                let mut t = Map::new();
                t.insert("cmd".into(), json!(task.cmd));
                t.insert("interval".into(), json!(task.interval));
                if let Some(last) = task.last {
                    t.insert("last".into(), json!(isotime(last)));
                }
                if let Some(when) = task.timer.and_then(|t| sup.timers.expiration(t)) {
                    t.insert("next".into(), json!(isotime(when)));
                }
                Value::Object(t)
            })
            .collect();
        detail.insert("timed".into(), Value::Array(tasks));
    }

    let body = json!({
        "time": isotime(sup.globals.now),
        "child": Value::Object(detail),
    });
    writeln!(
        w,
        "{}",
        serde_json::to_string_pretty(&body).unwrap_or_default()
    )
}

/// Raw ring dump for one stream, with a comment header.
fn stream_page(
    sup: &Supervisor,
    child: &ChildRecord,
    name: &str,
    log: &LogBuffer,
    w: &mut impl Write,
) -> std::io::Result<()> {
    respond_ok(w, "text/plain")?;
    writeln!(
        w,
        "# {name}, child #{}, pid {}, time {}",
        child.id,
        child.pid.map(|p| p.as_raw()).unwrap_or(0),
        isotime(sup.globals.now)
    )?;
    w.write_all(&log.dump_raw())
}

/// One stream's stats and re-synthesized lines.
fn log_json(log: &LogBuffer) -> Value {
    let mut map = Map::new();
    if let Some(file) = log.file() {
        map.insert("filename_base".into(), json!(file.base().display().to_string()));
        if let Some(path) = file.current_path() {
            map.insert("filename".into(), json!(path.display().to_string()));
        }
    }
    map.insert("total_bytes".into(), json!(log.stats.total_bytes));
    map.insert("read_count".into(), json!(log.stats.read_count));
    map.insert("error_count".into(), json!(log.stats.error_count));
    map.insert("bytes_per_second".into(), json!(log.stats.bytes_per_second));
    map.insert("lines".into(), json!(log.dump_lines()));
    Value::Object(map)
}
