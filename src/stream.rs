//! SSE 转发：自适应批量刷新、心跳与整体超时，以及非流式回复的伪流式输出。

use std::{convert::Infallible, time::Duration};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    classify::estimate_tokens,
    config::ProxySettings,
    transform::{delta_content, transform_stream_event, usage_total_tokens},
};

/// 前几个事件立即下发，缩短首包时间。
pub const IMMEDIATE_EVENTS: usize = 2;
/// 内容长度达到该字符数视为大块，刷新间隔随之缩短。
pub const LARGE_CHUNK_CHARS: usize = 32;
/// 伪流式每个分片的字符数。
pub const FAKE_CHUNK_CHARS: usize = 3;
/// 伪流式分片之间的间隔。
pub const FAKE_CHUNK_DELAY: Duration = Duration::from_millis(10);

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const CHANNEL_CAPACITY: usize = 64;

/// 下发给客户端的字节流。
pub type SseStream = ReceiverStream<Result<Bytes, Infallible>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub heartbeat: Duration,
    pub timeout: Duration,
    pub buffer_threshold: usize,
    pub min_flush_delay: Duration,
    pub max_flush_delay: Duration,
    /// 请求已判定为推理模型，事件按推理模型修正。
    pub reasoning: bool,
}

impl From<&ProxySettings> for StreamConfig {
    fn from(settings: &ProxySettings) -> Self {
        let min_flush_delay = Duration::from_millis(settings.min_flush_delay);
        Self {
            heartbeat: Duration::from_secs(settings.heartbeat_interval.max(1)),
            timeout: Duration::from_secs(settings.stream_timeout.max(1)),
            buffer_threshold: settings.buffer_threshold.max(1),
            min_flush_delay,
            max_flush_delay: Duration::from_millis(settings.max_flush_delay).max(min_flush_delay),
            reasoning: false,
        }
    }
}

/// 按事件数、缓冲大小与自适应间隔决定何时把缓冲写出。
#[derive(Debug)]
pub struct AdaptiveFlusher {
    buffer: BytesMut,
    events: usize,
    delay: Duration,
    last_flush: Instant,
    threshold: usize,
    min_delay: Duration,
    max_delay: Duration,
}

impl AdaptiveFlusher {
    pub fn new(config: &StreamConfig, now: Instant) -> Self {
        Self {
            buffer: BytesMut::new(),
            events: 0,
            delay: (config.min_flush_delay + config.max_flush_delay) / 2,
            last_flush: now,
            threshold: config.buffer_threshold,
            min_delay: config.min_flush_delay,
            max_delay: config.max_flush_delay,
        }
    }

    /// 追加一个事件帧，需要刷新时返回待写出的字节。
    pub fn push(&mut self, frame: &[u8], content_chars: usize, now: Instant) -> Option<Bytes> {
        self.events += 1;
        self.adapt(content_chars);
        self.buffer.extend_from_slice(frame);

        if self.events <= IMMEDIATE_EVENTS
            || self.buffer.len() >= self.threshold
            || now >= self.last_flush + self.delay
        {
            return self.take(now);
        }
        None
    }

    /// 缓冲非空时的下一次定时刷新点。
    pub fn deadline(&self) -> Option<Instant> {
        (!self.buffer.is_empty()).then(|| self.last_flush + self.delay)
    }

    pub fn take(&mut self, now: Instant) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        self.last_flush = now;
        Some(self.buffer.split().freeze())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn events(&self) -> usize {
        self.events
    }

    // 大块内容缩短间隔，小块内容拉长间隔。
    fn adapt(&mut self, content_chars: usize) {
        let step = (self.max_delay.saturating_sub(self.min_delay) / 4)
            .max(Duration::from_millis(1));
        self.delay = if content_chars >= LARGE_CHUNK_CHARS {
            self.delay.saturating_sub(step).max(self.min_delay)
        } else {
            (self.delay + step).min(self.max_delay)
        };
    }
}

/// 一次转发结束时的统计，用于回灌用量。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub events: usize,
    pub estimated_tokens: u64,
    pub reported_tokens: Option<u64>,
    pub saw_done: bool,
    pub timed_out: bool,
    pub client_closed: bool,
    pub upstream_failed: bool,
}

impl StreamOutcome {
    /// upstream 报告的用量优先，否则使用逐条估算的累计值。
    pub fn total_tokens(&self) -> u64 {
        self.reported_tokens.unwrap_or(self.estimated_tokens)
    }

    /// 按 1/3 输入、2/3 输出拆分。
    pub fn split_tokens(&self) -> (u64, u64) {
        let total = self.total_tokens();
        let prompt = total / 3;
        (prompt, total - prompt)
    }

    pub fn is_success(&self) -> bool {
        !self.upstream_failed && !self.timed_out
    }
}

struct Sender {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl Sender {
    /// 客户端已断开时返回 false。
    async fn send(&self, bytes: Bytes) -> bool {
        self.tx.send(Ok(bytes)).await.is_ok()
    }
}

fn data_frame(data: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(data.as_bytes());
    frame.extend_from_slice(b"\n\n");
    frame
}

fn timeout_frame() -> Bytes {
    let payload = serde_json::json!({
        "error": {
            "message": "stream exceeded the maximum response time",
            "type": "timeout_error",
            "code": "context_deadline_exceeded",
        }
    });
    Bytes::from(data_frame(&payload.to_string()))
}

/// 在后台任务中转发 upstream SSE，返回客户端字节流与结束统计。
pub fn relay<S, B, E>(upstream: S, config: StreamConfig) -> (SseStream, JoinHandle<StreamOutcome>)
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(run_relay(upstream, config, Sender { tx }));
    (ReceiverStream::new(rx), handle)
}

async fn run_relay<S, B, E>(upstream: S, config: StreamConfig, sender: Sender) -> StreamOutcome
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut outcome = StreamOutcome::default();
    let mut flusher = AdaptiveFlusher::new(&config, started);
    let mut events = Box::pin(upstream.eventsource());
    let mut heartbeats = 0u64;
    let heartbeat = sleep(config.heartbeat);
    tokio::pin!(heartbeat);

    loop {
        let flush_at = flusher.deadline();
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => {
                warn!(elapsed = ?started.elapsed(), "stream timed out");
                outcome.timed_out = true;
                if let Some(pending) = flusher.take(Instant::now())
                    && !sender.send(pending).await
                {
                    outcome.client_closed = true;
                    break;
                }
                if !sender.send(timeout_frame()).await {
                    outcome.client_closed = true;
                }
                break;
            }
            _ = sleep_until(flush_at.unwrap_or(deadline)), if flush_at.is_some() => {
                if let Some(pending) = flusher.take(Instant::now())
                    && !sender.send(pending).await
                {
                    outcome.client_closed = true;
                    break;
                }
            }
            _ = &mut heartbeat => {
                heartbeats += 1;
                let mut frame = BytesMut::new();
                if let Some(pending) = flusher.take(Instant::now()) {
                    frame.extend_from_slice(&pending);
                }
                frame.extend_from_slice(format!(": heartbeat-{heartbeats}\n\n").as_bytes());
                if !sender.send(frame.freeze()).await {
                    outcome.client_closed = true;
                    break;
                }
                heartbeat.as_mut().reset(Instant::now() + config.heartbeat);
            }
            next = events.next() => {
                let now = Instant::now();
                heartbeat.as_mut().reset(now + config.heartbeat);
                match next {
                    None => break,
                    Some(Err(err)) => {
                        warn!(error = %err, "upstream stream failed");
                        outcome.upstream_failed = true;
                        break;
                    }
                    Some(Ok(event)) => {
                        if event.data.trim() == "[DONE]" {
                            outcome.saw_done = true;
                            break;
                        }
                        let data = transform_stream_event(&event.data, config.reasoning);
                        let content_chars = account(&mut outcome, &data);
                        if let Some(ready) = flusher.push(&data_frame(&data), content_chars, now)
                            && !sender.send(ready).await
                        {
                            outcome.client_closed = true;
                            break;
                        }
                    }
                }
            }
        }
    }

    outcome.events = flusher.events();
    if !outcome.client_closed {
        let mut tail = BytesMut::new();
        if let Some(pending) = flusher.take(Instant::now()) {
            tail.extend_from_slice(&pending);
        }
        tail.extend_from_slice(DONE_FRAME);
        if !sender.send(tail.freeze()).await {
            outcome.client_closed = true;
        }
    }

    debug!(
        events = outcome.events,
        tokens = outcome.total_tokens(),
        saw_done = outcome.saw_done,
        client_closed = outcome.client_closed,
        "stream relay finished"
    );
    outcome
}

// 累计 token 并返回本事件的内容字符数。
fn account(outcome: &mut StreamOutcome, data: &str) -> usize {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return 0;
    };
    if let Some(total) = usage_total_tokens(&value).filter(|total| *total > 0) {
        outcome.reported_tokens = Some(total);
    }
    match delta_content(&value) {
        Some(content) => {
            outcome.estimated_tokens += estimate_tokens(content) as u64;
            content.chars().count()
        }
        None => 0,
    }
}

#[derive(Debug, Serialize)]
struct ChunkEnvelope<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: [ChunkChoice<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice<'a> {
    index: u32,
    delta: ChunkDelta<'a>,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
struct ChunkDelta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

/// 从非流式回复生成的伪流式内容。
#[derive(Debug, Clone, PartialEq)]
pub struct FakeStream {
    id: String,
    created: i64,
    model: String,
    content: String,
    usage: Option<Value>,
}

impl FakeStream {
    /// 回复里没有 `choices[0].message` 时返回 None。
    pub fn from_completion(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let message = value.get("choices")?.as_array()?.first()?.get("message")?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
            .unwrap_or(" ");

        Some(Self {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("chatcmpl-{}", nanoid::nanoid!(12))),
            created: value
                .get("created")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| Utc::now().timestamp()),
            model: value
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            content: content.to_owned(),
            usage: value.get("usage").filter(|usage| usage.is_object()).cloned(),
        })
    }

    fn chunk(&self, delta: ChunkDelta<'_>, finish_reason: Option<&'static str>) -> Bytes {
        let envelope = ChunkEnvelope {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: finish_reason.and(self.usage.as_ref()),
        };
        let json = serde_json::to_string(&envelope).unwrap_or_default();
        Bytes::from(data_frame(&json))
    }

    /// 角色帧、三字符内容分片、结束帧，最后是 `[DONE]`。
    pub fn frames(&self) -> Vec<Bytes> {
        let chars: Vec<char> = self.content.chars().collect();
        let mut frames = Vec::with_capacity(chars.len() / FAKE_CHUNK_CHARS + 3);
        frames.push(self.chunk(
            ChunkDelta {
                role: Some("assistant"),
                content: None,
            },
            None,
        ));
        for piece in chars.chunks(FAKE_CHUNK_CHARS) {
            let text: String = piece.iter().collect();
            frames.push(self.chunk(
                ChunkDelta {
                    role: None,
                    content: Some(&text),
                },
                None,
            ));
        }
        frames.push(self.chunk(ChunkDelta::default(), Some("stop")));
        frames.push(Bytes::from_static(DONE_FRAME));
        frames
    }

    /// 逐帧发送，内容分片之间间隔固定时长。
    pub fn spawn(self) -> SseStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let frames = self.frames();
            let last = frames.len().saturating_sub(1);
            for (index, frame) in frames.into_iter().enumerate() {
                if tx.send(Ok(frame)).await.is_err() {
                    debug!("client closed fake stream");
                    return;
                }
                if index > 0 && index < last.saturating_sub(1) {
                    sleep(FAKE_CHUNK_DELAY).await;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
