//! Transfer rate limiting using a token bucket.
//!
//! One token is one byte. The bucket starts full; capacity and refill rate
//! are both the configured megabytes per second. A limit of zero selects a
//! very large bucket so unbounded transfers take the same code path.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Bytes in one megabyte of the `--limit` flag.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Rate used when the limit is zero, in MB/s.
pub const UNBOUNDED_MB_PER_SEC: u64 = 10_000;

/// Size of each read from the source.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Pause between the last write and closing the destination.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Token bucket state for one transfer.
#[derive(Debug)]
pub struct TokenBucket {
    /// Current tokens available.
    tokens: f64,
    /// Maximum tokens (burst size).
    capacity: f64,
    /// Tokens added per second.
    rate: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u64, capacity: u64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            rate: rate_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Bucket for a `--limit` value in MB/s (0 = unbounded).
    pub fn for_limit_mb(limit_mb: u64) -> Self {
        let mb = if limit_mb == 0 {
            UNBOUNDED_MB_PER_SEC
        } else {
            limit_mb
        };
        let bytes = mb.saturating_mul(BYTES_PER_MB);
        Self::new(bytes, bytes)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Spend `amount` tokens, sleeping until enough have accumulated.
    pub async fn take(&mut self, amount: u64) {
        let mut remaining = amount as f64;
        while remaining > 0.0 {
            let want = remaining.min(self.capacity);
            self.refill();
            if self.tokens >= want {
                self.tokens -= want;
                remaining -= want;
                continue;
            }
            let deficit = want - self.tokens;
            tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }
}

/// Copies a source stream into a sink at a bounded rate.
#[derive(Debug)]
pub struct RateLimitedCopier {
    bucket: TokenBucket,
    settle: Duration,
}

impl RateLimitedCopier {
    pub fn new(limit_mb: u64) -> Self {
        Self {
            bucket: TokenBucket::for_limit_mb(limit_mb),
            settle: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Copy until end of stream, then settle and shut the writer down.
    ///
    /// Returns the number of bytes written. The writer is shut down only on
    /// success; on error the caller drops it.
    pub async fn copy<R, W>(&mut self, reader: &mut R, writer: &mut W) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        let start = Instant::now();

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.bucket.take(n as u64).await;
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }

        writer.flush().await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        writer.shutdown().await?;

        tracing::debug!(
            bytes = total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "copy finished"
        );
        Ok(total)
    }
}
