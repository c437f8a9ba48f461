/// Test doubles: scripted HTTP server and in-memory bar source
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use async_trait::async_trait;

use crate::data::pipeline::BarSource;
use crate::error::Result;
use crate::types::{BatchSpec, RawBar};

/// Maps (request target, hit index) to (status, body)
pub type Handler = Arc<dyn Fn(&str, usize) -> (u16, String) + Send + Sync>;

pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let server_hits = Arc::clone(&hits);
        let server_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                let hits = Arc::clone(&server_hits);
                let requests = Arc::clone(&server_requests);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let target = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();

                    let index = hits.fetch_add(1, Ordering::SeqCst);
                    requests.lock().unwrap().push(target.clone());
                    let (status, body) = handler(&target, index);

                    let response = format!(
                        "HTTP/1.1 {} MOCK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        MockServer { addr, hits, requests }
    }

    /// Serve the given responses in order, repeating the last one
    pub async fn scripted(responses: Vec<(u16, &str)>) -> Self {
        let responses: Vec<(u16, String)> =
            responses.into_iter().map(|(s, b)| (s, b.to_string())).collect();
        Self::start(Arc::new(move |_, index| {
            let i = index.min(responses.len() - 1);
            responses[i].clone()
        }))
        .await
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Accepts connections but never answers, so every request times out
pub async fn silent_server_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// An address nothing listens on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

type SourceFn = Box<dyn Fn(&str, &BatchSpec, usize) -> Result<Option<Vec<RawBar>>> + Send + Sync>;

/// In-memory bar source driven by closures
pub struct FakeSource {
    intraday: SourceFn,
    daily: SourceFn,
    intraday_calls: AtomicUsize,
    daily_calls: AtomicUsize,
}

impl FakeSource {
    /// Closures receive the batch and the zero-based call index
    pub fn new<I, D>(intraday: I, daily: D) -> Self
    where
        I: Fn(&BatchSpec, usize) -> Result<Option<Vec<RawBar>>> + Send + Sync + 'static,
        D: Fn(&BatchSpec, usize) -> Result<Option<Vec<RawBar>>> + Send + Sync + 'static,
    {
        Self::per_ticker(
            move |_, batch, call| intraday(batch, call),
            move |_, batch, call| daily(batch, call),
        )
    }

    pub fn per_ticker<I, D>(intraday: I, daily: D) -> Self
    where
        I: Fn(&str, &BatchSpec, usize) -> Result<Option<Vec<RawBar>>> + Send + Sync + 'static,
        D: Fn(&str, &BatchSpec, usize) -> Result<Option<Vec<RawBar>>> + Send + Sync + 'static,
    {
        FakeSource {
            intraday: Box::new(intraday),
            daily: Box::new(daily),
            intraday_calls: AtomicUsize::new(0),
            daily_calls: AtomicUsize::new(0),
        }
    }

    pub fn intraday_calls(&self) -> usize {
        self.intraday_calls.load(Ordering::SeqCst)
    }

    pub fn daily_calls(&self) -> usize {
        self.daily_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarSource for FakeSource {
    async fn intraday(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>> {
        let call = self.intraday_calls.fetch_add(1, Ordering::SeqCst);
        (self.intraday)(ticker, batch, call)
    }

    async fn daily(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>> {
        let call = self.daily_calls.fetch_add(1, Ordering::SeqCst);
        (self.daily)(ticker, batch, call)
    }
}

pub fn raw_bar(date: &str, close: f64) -> RawBar {
    RawBar {
        date: date.to_string(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 100.0,
        ticker: None,
    }
}
