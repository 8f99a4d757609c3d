//! Test support: a hand-driven clock and a tiny HTTP fixture server.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use url::Url;

use crate::waiter::Clock;

pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
    }
}

#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub location: Option<String>,
    /// Real time spent before answering, for concurrency tests.
    pub delay: Duration,
    /// Content-Length to announce instead of the body's real length.
    pub declared_length: Option<usize>,
}

impl Reply {
    pub fn html(body: impl Into<String>) -> Self {
        Self::ok("text/html; charset=utf-8", body.into().into_bytes())
    }

    pub fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: content_type.into(),
            body,
            location: None,
            delay: Duration::ZERO,
            declared_length: None,
        }
    }

    pub fn png() -> Self {
        Self::ok("image/png", png_bytes())
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok("text/plain", b"nope".to_vec())
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::status(302)
        }
    }

    /// Announces `declared` bytes, sends fewer and hangs up.
    pub fn truncated(mut self, declared: usize) -> Self {
        self.declared_length = Some(declared);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct State {
    routes: Mutex<HashMap<String, Vec<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Serves canned replies keyed by path-and-query. A path given several
/// replies plays them in order and then repeats the last one.
#[derive(Clone)]
pub struct Fixture {
    base: Url,
    state: Arc<State>,
}

impl Fixture {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let state = Arc::new(State::default());

        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = shared.clone();
                thread::spawn(move || serve(stream, &state));
            }
        });

        Self { base, state }
    }

    pub fn route(&self, path: &str, reply: Reply) -> &Self {
        self.routes(path, vec![reply])
    }

    pub fn routes(&self, path: &str, replies: Vec<Reply>) -> &Self {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), replies);
        self
    }

    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }

    /// Highest number of requests handled at once.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, state: &State) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header == "\r\n" || header == "\n" => break,
            Ok(_) => {}
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(current, Ordering::SeqCst);

    let reply = {
        let mut hits = state.hits.lock().unwrap();
        let count = hits.entry(path.clone()).or_default();
        let nth = *count;
        *count += 1;

        let routes = state.routes.lock().unwrap();
        routes
            .get(&path)
            .and_then(|replies| replies.get(nth).or_else(|| replies.last()).cloned())
            .unwrap_or_else(|| Reply::status(404))
    };

    if !reply.delay.is_zero() {
        thread::sleep(reply.delay);
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let mut head = format!(
        "HTTP/1.1 {} Fixture\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.content_type,
        reply.declared_length.unwrap_or(reply.body.len())
    );
    if let Some(location) = &reply.location {
        head += &format!("Location: {}\r\n", location);
    }
    head += "\r\n";

    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&reply.body);
    let _ = stream.flush();
}

/// A small but fully decodable PNG.
pub fn png_bytes() -> Vec<u8> {
    use std::io::Cursor;

    let image = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 30, 30]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}
