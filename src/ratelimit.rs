//! 按用户限速：共享漏桶、限速写入器与响应体泵。

use axum::body::Body as AxumBody;
use axum::body::Bytes;
use dashmap::DashMap;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::leaky_bucket::LeakyBucket;

/// 响应体管道的缓冲大小。
const PIPE_CAPACITY: usize = 64 * 1024;
const MIN_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum GateError {
    #[error("rate limit exceeded for a write of {requested} bytes")]
    RateLimitExceeded {
        requested: usize,
        retry_after: Option<Duration>,
    },
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 写入被漏桶拒绝时，响应体泵的处理方式。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    /// 等待漏桶腾出空间后重试同一段数据。
    #[default]
    Backoff,
    /// 第一次被拒绝即结束响应体。
    Truncate,
}

/// 单个用户的限速器，该用户的所有连接共享同一个漏桶。
#[derive(Debug)]
pub struct SpeedLimiter {
    bucket: Option<Mutex<LeakyBucket>>,
    interval: Duration,
}

impl SpeedLimiter {
    /// 速率绝对值小于 1 字节/秒视为不限速。
    pub fn new(rate: f64, capacity: f64, interval: Duration) -> Self {
        let bucket = (rate.abs() >= 1.0).then(|| Mutex::new(LeakyBucket::new(rate, capacity)));
        Self { bucket, interval }
    }

    #[cfg(test)]
    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            interval: Duration::ZERO,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// 单次写入允许的最大字节数（即桶容量）。
    pub fn max_write(&self) -> Option<usize> {
        self.bucket
            .as_ref()
            .map(|bucket| (bucket.lock().capacity().floor() as usize).max(1))
    }

    fn admit(&self, len: usize) -> Result<(), GateError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        let mut bucket = bucket.lock();
        if bucket.allow(len as f64) {
            return Ok(());
        }
        Err(GateError::RateLimitExceeded {
            requested: len,
            retry_after: bucket.retry_after_at(len as f64, Instant::now()),
        })
    }
}

/// 包装输出端：每次写入先询问漏桶，通过后按固定间隔节流再整体转发。
pub struct RateGatedWriter<W> {
    inner: W,
    limiter: Arc<SpeedLimiter>,
}

impl<W> RateGatedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, limiter: Arc<SpeedLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &SpeedLimiter {
        &self.limiter
    }

    /// 写入整段数据；被漏桶拒绝时不写任何字节并返回 `RateLimitExceeded`。
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, GateError> {
        if !self.limiter.is_unlimited() {
            self.limiter.admit(buf.len())?;
            if !self.limiter.interval.is_zero() {
                tokio::time::sleep(self.limiter.interval).await;
            }
        }
        self.inner.write_all(buf).await?;
        Ok(buf.len())
    }

    pub async fn shutdown(&mut self) -> Result<(), GateError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Finished { written: u64 },
    Truncated { written: u64 },
    Aborted { written: u64 },
}

/// 把数据块逐段送入限速写入器，按 `policy` 处理被拒绝的写入。
///
/// `closed` 在客户端断开时完成；退避等待期间一旦完成立即放弃。
pub async fn pump<S, E, W, C>(
    chunks: S,
    mut writer: RateGatedWriter<W>,
    policy: LimitPolicy,
    closed: C,
) -> PumpOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
    W: AsyncWrite + Unpin,
    C: Future<Output = ()>,
{
    let max_piece = writer.limiter().max_write().unwrap_or(usize::MAX);
    let mut chunks = std::pin::pin!(chunks);
    let mut closed = std::pin::pin!(closed);
    let mut written = 0u64;

    while let Some(chunk) = chunks.next().await {
        let mut chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(error = %err, written, "response body source failed");
                return PumpOutcome::Aborted { written };
            }
        };
        while !chunk.is_empty() {
            let piece = chunk.split_to(max_piece.min(chunk.len()));
            loop {
                match writer.write(&piece).await {
                    Ok(n) => {
                        written += n as u64;
                        break;
                    }
                    Err(GateError::RateLimitExceeded {
                        requested,
                        retry_after,
                    }) => match (policy, retry_after) {
                        (LimitPolicy::Backoff, Some(wait)) => {
                            tokio::select! {
                                _ = tokio::time::sleep(wait.max(MIN_BACKOFF)) => {}
                                _ = &mut closed => {
                                    debug!(written, "client went away during rate limit backoff");
                                    return PumpOutcome::Aborted { written };
                                }
                            }
                        }
                        _ => {
                            warn!(requested, written, "response truncated by rate limit");
                            return PumpOutcome::Truncated { written };
                        }
                    },
                    Err(GateError::Io(err)) => {
                        debug!(error = %err, written, "client went away during throttled write");
                        return PumpOutcome::Aborted { written };
                    }
                }
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "failed to close throttled writer");
    }
    PumpOutcome::Finished { written }
}

/// 让响应体经过限速写入器；不限速时原样返回。
pub fn throttle_body(
    body: AxumBody,
    limiter: Arc<SpeedLimiter>,
    policy: LimitPolicy,
) -> AxumBody {
    if limiter.is_unlimited() {
        return body;
    }
    let (stream, _pump) = spawn_pump(BodyExt::into_data_stream(body), limiter, policy);
    AxumBody::from_stream(stream)
}

/// 启动响应体泵，返回客户端一侧的读取流；丢弃该流即通知泵停止。
fn spawn_pump<S, E>(
    chunks: S,
    limiter: Arc<SpeedLimiter>,
    policy: LimitPolicy,
) -> (ThrottledStream, JoinHandle<PumpOutcome>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (reader, writer): (DuplexStream, DuplexStream) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut closed_tx, closed_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let writer = RateGatedWriter::new(writer, limiter);
        let outcome = pump(chunks, writer, policy, closed_tx.closed()).await;
        debug!(?outcome, "throttled response finished");
        outcome
    });
    let stream = ThrottledStream {
        inner: ReaderStream::new(reader),
        _closed: closed_rx,
    };
    (stream, handle)
}

/// 响应体读取端，持有断开通知的接收端。
struct ThrottledStream {
    inner: ReaderStream<DuplexStream>,
    _closed: oneshot::Receiver<()>,
}

impl Stream for ThrottledStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// 按用户名缓存限速器，首次请求时创建，之后一直复用。
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<SpeedLimiter>>,
    capacity: Option<f64>,
    interval: Duration,
}

impl LimiterRegistry {
    /// `capacity` 为 None 时桶容量等于一秒的速率。
    pub fn new(capacity: Option<u64>, interval: Duration) -> Self {
        Self {
            limiters: DashMap::new(),
            capacity: capacity.map(|value| value as f64),
            interval,
        }
    }

    pub fn get_or_create(&self, username: &str, speed_limit: u64) -> Arc<SpeedLimiter> {
        if let Some(limiter) = self.limiters.get(username) {
            return limiter.value().clone();
        }
        self.limiters
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(self.build(speed_limit)))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    fn build(&self, speed_limit: u64) -> SpeedLimiter {
        let rate = speed_limit as f64;
        let capacity = self.capacity.unwrap_or(rate).max(1.0);
        SpeedLimiter::new(rate, capacity, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::future::pending;
    use tokio::io::AsyncReadExt;

    fn limiter(rate: f64, capacity: f64) -> Arc<SpeedLimiter> {
        Arc::new(SpeedLimiter::new(rate, capacity, Duration::ZERO))
    }

    #[test]
    fn sub_byte_rate_disables_limiting() {
        assert!(SpeedLimiter::new(0.0, 100.0, Duration::ZERO).is_unlimited());
        assert!(SpeedLimiter::new(0.5, 100.0, Duration::ZERO).is_unlimited());
        assert!(SpeedLimiter::new(-0.9, 100.0, Duration::ZERO).is_unlimited());
        assert!(!SpeedLimiter::new(1.0, 100.0, Duration::ZERO).is_unlimited());
    }

    #[tokio::test]
    async fn unlimited_writer_passes_everything_through() {
        let mut writer = RateGatedWriter::new(Vec::new(), Arc::new(SpeedLimiter::unlimited()));
        let payload = vec![7u8; 10_000];
        assert_eq!(writer.write(&payload).await.expect("write"), 10_000);
        assert_eq!(writer.into_inner().len(), 10_000);
    }

    #[tokio::test]
    async fn refused_write_reports_error_and_writes_nothing() {
        let mut writer = RateGatedWriter::new(Vec::new(), limiter(10.0, 100.0));
        assert_eq!(writer.write(&[1u8; 80]).await.expect("first write"), 80);

        let result = writer.write(&[2u8; 50]).await;
        assert!(matches!(
            result,
            Err(GateError::RateLimitExceeded { requested: 50, retry_after: Some(_) })
        ));
        let sink = writer.into_inner();
        assert_eq!(sink.len(), 80);
        assert!(sink.iter().all(|byte| *byte == 1));
    }

    #[tokio::test]
    async fn pacing_interval_delays_each_write() {
        let paced = Arc::new(SpeedLimiter::new(1_000_000.0, 1_000_000.0, Duration::from_millis(20)));
        let mut writer = RateGatedWriter::new(Vec::new(), paced);
        let start = Instant::now();
        writer.write(b"a").await.expect("write");
        writer.write(b"b").await.expect("write");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn backoff_policy_delivers_full_body() {
        let chunks = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from(vec![1u8; 300])),
            Ok(Bytes::from(vec![2u8; 300])),
        ]);
        let mut sink = Vec::new();
        let writer = RateGatedWriter::new(&mut sink, limiter(2_000.0, 200.0));
        let outcome = pump(chunks, writer, LimitPolicy::Backoff, pending()).await;
        assert_eq!(outcome, PumpOutcome::Finished { written: 600 });
        assert_eq!(sink.len(), 600);
        assert_eq!(&sink[..300], &[1u8; 300][..]);
    }

    #[tokio::test]
    async fn truncate_policy_stops_at_first_refusal() {
        let chunks = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from(vec![1u8; 100])),
            Ok(Bytes::from(vec![2u8; 100])),
        ]);
        let mut sink = Vec::new();
        let writer = RateGatedWriter::new(&mut sink, limiter(1.0, 100.0));
        let outcome = pump(chunks, writer, LimitPolicy::Truncate, pending()).await;
        assert_eq!(outcome, PumpOutcome::Truncated { written: 100 });
        assert_eq!(sink, vec![1u8; 100]);
    }

    #[tokio::test]
    async fn pump_stops_when_reader_is_gone() {
        let (reader, writer) = tokio::io::duplex(16);
        drop(reader);
        let chunks = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"hello world"))]);
        let writer = RateGatedWriter::new(writer, limiter(1_000.0, 1_000.0));
        let outcome = pump(chunks, writer, LimitPolicy::Backoff, pending()).await;
        assert_eq!(outcome, PumpOutcome::Aborted { written: 0 });
    }

    #[tokio::test]
    async fn throttled_body_streams_all_bytes() {
        let body = AxumBody::from(vec![9u8; 5_000]);
        let throttled = throttle_body(body, limiter(100_000.0, 1_024.0), LimitPolicy::Backoff);
        let collected = throttled.collect().await.expect("collect").to_bytes();
        assert_eq!(collected.len(), 5_000);

        let (mut reader, writer) = tokio::io::duplex(64);
        let chunks = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"abc"))]);
        let task = tokio::spawn(pump(
            chunks,
            RateGatedWriter::new(writer, limiter(1_000.0, 1_000.0)),
            LimitPolicy::Backoff,
            pending(),
        ));
        let mut out = String::new();
        reader.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "abc");
        assert_eq!(task.await.expect("join"), PumpOutcome::Finished { written: 3 });
    }

    #[tokio::test]
    async fn disconnect_during_backoff_aborts_pump() {
        let chunks = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from(vec![1u8; 1_000])),
            Ok(Bytes::from(vec![2u8; 1_000])),
        ]);
        let (mut stream, handle) = spawn_pump(chunks, limiter(1.0, 1_000.0), LimitPolicy::Backoff);

        let mut received = 0;
        while received < 1_000 {
            let piece = stream.next().await.expect("piece").expect("read");
            received += piece.len();
        }
        drop(stream);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump stopped after disconnect")
            .expect("join");
        assert_eq!(outcome, PumpOutcome::Aborted { written: 1_000 });
    }

    #[test]
    fn registry_reuses_limiter_per_user() {
        let registry = LimiterRegistry::new(None, Duration::ZERO);
        let first = registry.get_or_create("alice", 1024);
        let second = registry.get_or_create("alice", 1024);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.max_write(), Some(1024));

        let other = registry.get_or_create("bob", 0);
        assert!(other.is_unlimited());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_uses_configured_capacity() {
        let registry = LimiterRegistry::new(Some(100), Duration::ZERO);
        assert_eq!(registry.get_or_create("alice", 4096).max_write(), Some(100));
    }

    #[test]
    fn concurrent_first_requests_share_one_limiter() {
        let registry = Arc::new(LimiterRegistry::new(None, Duration::ZERO));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create("alice", 512))
            })
            .collect();
        let limiters: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect();
        assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_admissions_do_not_overfill_bucket() {
        let shared = limiter(1.0, 1_000.0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || (0..250).filter(|_| shared.admit(1).is_ok()).count())
            })
            .collect();
        let admitted: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .sum();
        assert!((1_000..=1_005).contains(&admitted), "admitted {admitted}");
    }
}
